//! Background removal of aged or already-sent records.
//!
//! The sweeper loops: one pass, a short pause, repeat. Stopping it is
//! cooperative: the current pass completes, then one final pass runs before
//! the task exits. The task only holds a weak reference to the store and
//! exits once every store handle is gone.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{DeleteMethod, DeletionSettings};
use crate::db::{RecordStore, StoreInner};
use crate::models::{Field, RecordStatus};

/// Pause between two retention passes.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// One retention pass. Faults are logged by the store and never propagate.
pub(crate) async fn run_pass(store: &RecordStore, settings: &DeletionSettings) -> usize {
    let removed = match settings.method {
        DeleteMethod::AfterDays => store.remove_older_than(settings.after_days).await,
        DeleteMethod::AfterSent => {
            store
                .remove(Field::Status, RecordStatus::Sent.as_str())
                .await
        }
    };

    if !removed.is_empty() {
        debug!("{} item(s) removed from database", removed.len());
    }
    removed.len()
}

pub struct RetentionSweeper {
    store: Weak<StoreInner>,
    interval: Duration,
    stop_rx: watch::Receiver<bool>,
}

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RetentionSweeper {
    /// Spawn a sweeper over `store` on the current tokio runtime.
    pub fn spawn(store: &RecordStore) -> SweeperHandle {
        Self::spawn_with_interval(store, SWEEP_INTERVAL)
    }

    pub fn spawn_with_interval(store: &RecordStore, interval: Duration) -> SweeperHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let sweeper = RetentionSweeper {
            store: store.downgrade(),
            interval,
            stop_rx,
        };
        let task = tokio::spawn(sweeper.run());
        SweeperHandle { stop_tx, task }
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Run one pass. Returns false once the store has been dropped.
    async fn pass(&self) -> bool {
        match RecordStore::upgrade(&self.store) {
            Some(store) => {
                store.retention_pass().await;
                true
            }
            None => false,
        }
    }

    async fn run(mut self) {
        debug!("Retention sweeper started");
        loop {
            if !self.pass().await {
                debug!("Store dropped, retention sweeper exiting");
                return;
            }
            if self.stop_requested() {
                break;
            }

            tokio::select! {
                _ = sleep(self.interval) => {}
                changed = self.stop_rx.changed() => {
                    // A dropped handle counts as a stop request.
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if self.stop_requested() {
                break;
            }
        }

        self.pass().await;
        debug!("Retention sweeper stopped");
    }
}

impl SweeperHandle {
    /// Ask the sweeper to stop and wait for its final pass.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Retention sweeper task failed: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{now_utc, Payload, Publication};
    use tempfile::TempDir;

    async fn setup_store(method: DeleteMethod, after_days: u32) -> (RecordStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("retention.db").display());
        let mut config = Config::with_database(url);
        config.deletion = DeletionSettings { method, after_days };
        (RecordStore::connect(&config).await.unwrap(), dir)
    }

    fn log_at(message: &str, days_ago: i64) -> Publication {
        Publication::at(
            Payload::Log {
                message: message.to_string(),
            },
            now_utc() - chrono::Duration::days(days_ago),
        )
    }

    async fn deliver(store: &RecordStore) {
        store.update("0000", Field::Status, "pending", None).await;
        store.update("0000", Field::Status, "sent", None).await;
    }

    #[tokio::test]
    async fn test_after_days_pass_removes_only_aged_records() {
        let (store, _dir) = setup_store(DeleteMethod::AfterDays, 3).await;
        store.add(&log_at("stale", 4)).await;
        store.add(&log_at("fresh", 2)).await;

        let removed = store.retention_pass().await;
        assert_eq!(removed, 1);

        let left = store.list_all().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].msg.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_after_sent_pass_removes_sent_records() {
        let (store, _dir) = setup_store(DeleteMethod::AfterSent, 0).await;
        store.add(&log_at("delivered", 0)).await;
        deliver(&store).await;
        store.add(&log_at("waiting", 0)).await;

        assert_eq!(store.retention_pass().await, 1);
        let left = store.list_all().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].status, RecordStatus::Unsent);
    }

    #[tokio::test]
    async fn test_sweeper_runs_in_background() {
        let (store, _dir) = setup_store(DeleteMethod::AfterSent, 0).await;
        store.add(&log_at("delivered", 0)).await;
        deliver(&store).await;

        let handle = RetentionSweeper::spawn_with_interval(&store, Duration::from_millis(20));
        sleep(Duration::from_millis(300)).await;

        assert!(store.list_all().await.is_empty());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_runs_final_pass() {
        let (store, _dir) = setup_store(DeleteMethod::AfterSent, 0).await;

        let handle = RetentionSweeper::spawn_with_interval(&store, Duration::from_secs(60));
        // Let the first pass run, then leave work for the final one.
        sleep(Duration::from_millis(100)).await;
        let before = store.retention_passes();
        store.add(&log_at("delivered", 0)).await;
        deliver(&store).await;

        handle.stop().await;

        assert_eq!(store.retention_passes(), before + 1);
        assert!(store.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_sweeper() {
        let (store, _dir) = setup_store(DeleteMethod::AfterSent, 0).await;
        let handle = RetentionSweeper::spawn_with_interval(&store, Duration::from_secs(60));
        sleep(Duration::from_millis(100)).await;
        let SweeperHandle { stop_tx, task } = handle;
        drop(stop_tx);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("sweeper should exit once its handle is gone")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_store_stops_sweeper() {
        let (store, _dir) = setup_store(DeleteMethod::AfterSent, 0).await;
        let handle = RetentionSweeper::spawn_with_interval(&store, Duration::from_millis(20));
        sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        drop(store);

        let mut waited = Duration::ZERO;
        while !handle.is_finished() && waited < Duration::from_secs(5) {
            sleep(Duration::from_millis(20)).await;
            waited += Duration::from_millis(20);
        }
        assert!(handle.is_finished());
    }
}
