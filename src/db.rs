use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::capacity::CapacityGuard;
use crate::config::{Config, DeletionSettings};
use crate::error::StoreError;
use crate::models::{
    format_timestamp, now_utc, parse_timestamp, Command, Field, Publication, Record, RecordRow,
    RecordStatus, Status, DEFAULT_TOPIC_NUM,
};
use crate::retention::{self, RetentionSweeper, SweeperHandle};

/// Pause before the single retry of a failed mutation.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

const RECORD_COLUMNS: &str = "id, topic_num, command, name, value, msg, ts, status";

/// Initialize database connection pool with recommended pragmas.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    // Every connection to an in-memory database gets its own empty database.
    let pool_options = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(10)
    };

    pool_options.connect_with(options).await
}

/// Run database migrations.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(include_str!("../migrations/001_create_publish.sql"))
        .execute(pool)
        .await?;
    Ok(())
}

/// Run `attempt` under `lock`, retrying exactly once after [`RETRY_BACKOFF`]
/// if it fails with a transient error. The lock is released while waiting.
pub async fn retry_once<T, F, Fut>(
    lock: &Mutex<()>,
    operation: &'static str,
    mut attempt: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut retried = false;
    loop {
        let result = {
            let _guard = lock.lock().await;
            attempt().await
        };

        match result {
            Err(e) if !retried && e.is_transient() => {
                warn!("{} failed ({}), retrying in {:?}", operation, e, RETRY_BACKOFF);
                retried = true;
                sleep(RETRY_BACKOFF).await;
            }
            other => return other,
        }
    }
}

fn decode_rows(rows: Vec<RecordRow>) -> Vec<Record> {
    rows.into_iter()
        .filter_map(|row| match Record::try_from(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping undecodable record: {}", e);
                None
            }
        })
        .collect()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub(crate) struct StoreInner {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    capacity: CapacityGuard,
    deletion: DeletionSettings,
    sweeper: Mutex<Option<SweeperHandle>>,
    retention_passes: AtomicUsize,
}

/// Durable table of pending and sent publications.
///
/// Cloning is cheap; all clones share one pool and one mutation lock, so at
/// most one mutation is in flight at a time. Reads never take the lock.
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<StoreInner>,
}

impl RecordStore {
    /// Open the store and start its retention sweeper.
    pub async fn open(config: &Config) -> Result<Self, StoreError> {
        let store = Self::connect(config).await?;
        store.start_sweeper().await;
        Ok(store)
    }

    /// Open the store without a background sweeper.
    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let pool = init_pool(&config.database_url).await?;
        run_migrations(&pool).await?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                pool,
                write_lock: Mutex::new(()),
                capacity: CapacityGuard::new(config.capacity.clone()),
                deletion: config.deletion.clone(),
                sweeper: Mutex::new(None),
                retention_passes: AtomicUsize::new(0),
            }),
        })
    }

    /// Spawn the retention sweeper unless one is already running.
    pub async fn start_sweeper(&self) {
        let mut slot = self.inner.sweeper.lock().await;
        if slot.is_none() {
            *slot = Some(RetentionSweeper::spawn(self));
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    /// Reference that does not keep the store open.
    pub(crate) fn downgrade(&self) -> Weak<StoreInner> {
        Arc::downgrade(&self.inner)
    }

    /// The store behind `weak`, if any handle to it is still alive.
    pub(crate) fn upgrade(weak: &Weak<StoreInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, attempt: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        retry_once(&self.inner.write_lock, operation, attempt).await
    }

    /// Persist a new publication as an unsent record.
    ///
    /// At the capacity limit, records are evicted and this publication is
    /// rejected with [`Status::Full`].
    pub async fn add(&self, publication: &Publication) -> Status {
        if let Err(e) = publication.payload.validate() {
            warn!("Rejected {}: {}", publication.command(), e);
            return Status::Failure;
        }

        match self.with_retry("add", || self.try_add(publication)).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to add {} to database: {}", publication.command(), e);
                Status::Failure
            }
        }
    }

    async fn try_add(&self, publication: &Publication) -> Result<Status, StoreError> {
        let check = self.inner.capacity.enforce(self).await?;
        if !check.evicted.is_empty() {
            debug!(
                "{} item(s) removed from database due to limit",
                check.evicted.len()
            );
        }
        if check.at_limit {
            return Ok(Status::Full);
        }

        let (name, value, msg) = publication.payload.columns();
        sqlx::query(
            r#"
            INSERT INTO publish (topic_num, command, name, value, msg, ts, status)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(DEFAULT_TOPIC_NUM)
        .bind(publication.command().as_str())
        .bind(name)
        .bind(value)
        .bind(msg)
        .bind(format_timestamp(&publication.timestamp))
        .bind(RecordStatus::Unsent.as_str())
        .execute(&self.inner.pool)
        .await?;

        Ok(Status::Success)
    }

    /// Set `field` to `new_value` on every record of `topic_num`, optionally
    /// narrowed to one command. Status updates only move records forward.
    pub async fn update(
        &self,
        topic_num: &str,
        field: Field,
        new_value: &str,
        command: Option<Command>,
    ) -> Status {
        let new_value = match field.canonicalize(new_value) {
            Ok(v) => v,
            Err(e) => {
                warn!("Rejected update of {}: {}", field.column(), e);
                return Status::Failure;
            }
        };

        let predecessors: &[RecordStatus] = match field {
            Field::Status => match new_value.parse::<RecordStatus>() {
                Ok(status) => status.predecessors(),
                Err(_) => return Status::Failure,
            },
            _ => &[],
        };
        if field == Field::Status && predecessors.is_empty() {
            debug!("Ignoring backward status update for topic {}", topic_num);
            return Status::Success;
        }

        let mut sql = format!(
            "UPDATE publish SET {} = ? WHERE topic_num = ?",
            field.column()
        );
        if command.is_some() {
            sql.push_str(" AND command = ?");
        }
        if !predecessors.is_empty() {
            sql.push_str(&format!(
                " AND status IN ({})",
                placeholders(predecessors.len())
            ));
        }

        let attempt = || async {
            let mut query = sqlx::query(&sql).bind(&new_value).bind(topic_num);
            if let Some(command) = command {
                query = query.bind(command.as_str());
            }
            for status in predecessors {
                query = query.bind(status.as_str());
            }
            query.execute(&self.inner.pool).await?;
            Ok::<_, StoreError>(())
        };

        match self.with_retry("update", attempt).await {
            Ok(()) => Status::Success,
            Err(e) => {
                warn!("Failed to update {} for topic {}: {}", field.column(), topic_num, e);
                Status::Failure
            }
        }
    }

    /// Stamp every unsent record of `command` with a timestamp in
    /// `[from_timestamp, to_timestamp]` with a new topic number.
    pub async fn reassign_topic(
        &self,
        new_topic_num: &str,
        command: Command,
        from_timestamp: &str,
        to_timestamp: &str,
    ) -> Status {
        let (first, last) = match (parse_timestamp(from_timestamp), parse_timestamp(to_timestamp)) {
            (Ok(first), Ok(last)) => (format_timestamp(&first), format_timestamp(&last)),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Rejected topic reassignment: {}", e);
                return Status::Failure;
            }
        };

        let attempt = || async {
            let result = sqlx::query(
                r#"
                UPDATE publish SET topic_num = ?
                WHERE command = ? AND status = ? AND ts >= ? AND ts <= ?
                "#,
            )
            .bind(new_topic_num)
            .bind(command.as_str())
            .bind(RecordStatus::Unsent.as_str())
            .bind(&first)
            .bind(&last)
            .execute(&self.inner.pool)
            .await?;
            Ok::<_, StoreError>(result.rows_affected())
        };

        match self.with_retry("reassign_topic", attempt).await {
            Ok(n) => {
                debug!("Assigned {} {} record(s) to topic {}", n, command, new_topic_num);
                Status::Success
            }
            Err(e) => {
                warn!("Failed to assign topic {}: {}", new_topic_num, e);
                Status::Failure
            }
        }
    }

    /// Delete and return every record whose `field` equals `value`.
    pub async fn remove(&self, field: Field, value: &str) -> Vec<Record> {
        let value = match field.canonicalize(value) {
            Ok(v) => v,
            Err(e) => {
                warn!("Rejected removal by {}: {}", field.column(), e);
                return Vec::new();
            }
        };

        match self
            .with_retry("remove", || self.delete_matching(field, &value))
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Failed to remove records by {}: {}", field.column(), e);
                Vec::new()
            }
        }
    }

    /// Delete and return every record older than `days` days.
    pub async fn remove_older_than(&self, days: u32) -> Vec<Record> {
        let cutoff = format_timestamp(&(now_utc() - chrono::Duration::days(i64::from(days))));

        match self
            .with_retry("remove_older_than", || self.delete_before(&cutoff))
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Failed to remove records older than {} days: {}", days, e);
                Vec::new()
            }
        }
    }

    /// Delete records by id. Used by the forwarding gate for suppressed duplicates.
    pub(crate) async fn remove_ids(&self, ids: &[i64]) -> Result<Vec<Record>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = format!("id IN ({})", placeholders(ids.len()));

        self.with_retry("remove_ids", || async {
            let mut tx = self.inner.pool.begin().await?;

            let select = format!("SELECT {} FROM publish WHERE {}", RECORD_COLUMNS, filter);
            let mut query = sqlx::query_as::<_, RecordRow>(&select);
            for id in ids {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&mut *tx).await?;

            let delete = format!("DELETE FROM publish WHERE {}", filter);
            let mut query = sqlx::query(&delete);
            for id in ids {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;

            tx.commit().await?;
            Ok::<_, StoreError>(decode_rows(rows))
        })
        .await
    }

    /// Unlocked removal primitive. Callers must hold the mutation lock.
    pub(crate) async fn delete_matching(
        &self,
        field: Field,
        value: &str,
    ) -> Result<Vec<Record>, StoreError> {
        let mut tx = self.inner.pool.begin().await?;

        let select = format!(
            "SELECT {} FROM publish WHERE {} = ?",
            RECORD_COLUMNS,
            field.column()
        );
        let rows = sqlx::query_as::<_, RecordRow>(&select)
            .bind(value)
            .fetch_all(&mut *tx)
            .await?;

        let delete = format!("DELETE FROM publish WHERE {} = ?", field.column());
        sqlx::query(&delete).bind(value).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(decode_rows(rows))
    }

    async fn delete_before(&self, cutoff: &str) -> Result<Vec<Record>, StoreError> {
        let mut tx = self.inner.pool.begin().await?;

        let select = format!("SELECT {} FROM publish WHERE ts < ?", RECORD_COLUMNS);
        let rows = sqlx::query_as::<_, RecordRow>(&select)
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM publish WHERE ts < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(decode_rows(rows))
    }

    /// Total number of stored records.
    pub(crate) async fn count_all(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM publish")
            .fetch_one(&self.inner.pool)
            .await?;
        Ok(count as usize)
    }

    /// Minimum (or maximum) timestamp currently stored.
    pub(crate) async fn boundary_timestamp(&self, oldest: bool) -> Result<Option<String>, StoreError> {
        let sql = if oldest {
            "SELECT MIN(ts) FROM publish"
        } else {
            "SELECT MAX(ts) FROM publish"
        };
        let ts: Option<String> = sqlx::query_scalar(sql).fetch_one(&self.inner.pool).await?;
        Ok(ts)
    }

    /// Most recent record of `command` in the highest topic other than `topic_num`.
    pub(crate) async fn latest_in_other_topic(
        &self,
        topic_num: &str,
        command: Command,
    ) -> Result<Option<Record>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM publish
            WHERE command = ?
              AND topic_num = (
                  SELECT MAX(topic_num) FROM publish
                  WHERE topic_num != ? AND command = ?
              )
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
            RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(command.as_str())
            .bind(topic_num)
            .bind(command.as_str())
            .fetch_optional(&self.inner.pool)
            .await?;

        row.map(Record::try_from).transpose()
    }

    /// Records of `command` stamped with `topic_num`.
    pub(crate) async fn list_in_topic(
        &self,
        topic_num: &str,
        command: Command,
    ) -> Result<Vec<Record>, StoreError> {
        let sql = format!(
            "SELECT {} FROM publish WHERE topic_num = ? AND command = ? ORDER BY ts ASC, id ASC",
            RECORD_COLUMNS
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(topic_num)
            .bind(command.as_str())
            .fetch_all(&self.inner.pool)
            .await?;
        Ok(decode_rows(rows))
    }

    /// All records, oldest first.
    pub async fn list_all(&self) -> Vec<Record> {
        let sql = format!("SELECT {} FROM publish ORDER BY ts ASC, id ASC", RECORD_COLUMNS);
        match sqlx::query_as::<_, RecordRow>(&sql)
            .fetch_all(&self.inner.pool)
            .await
        {
            Ok(rows) => decode_rows(rows),
            Err(e) => {
                warn!("Issue retrieving all publications in database: {}", e);
                Vec::new()
            }
        }
    }

    /// Records in the given status, oldest first.
    pub async fn list_by_status(&self, status: RecordStatus) -> Vec<Record> {
        let sql = format!(
            "SELECT {} FROM publish WHERE status = ? ORDER BY ts ASC, id ASC",
            RECORD_COLUMNS
        );
        match sqlx::query_as::<_, RecordRow>(&sql)
            .bind(status.as_str())
            .fetch_all(&self.inner.pool)
            .await
        {
            Ok(rows) => decode_rows(rows),
            Err(e) => {
                warn!("Issue retrieving {} publications: {}", status, e);
                Vec::new()
            }
        }
    }

    pub async fn count_by_status(&self, status: RecordStatus) -> usize {
        let count: Result<i64, sqlx::Error> =
            sqlx::query_scalar("SELECT COUNT(*) FROM publish WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(&self.inner.pool)
                .await;

        match count {
            Ok(n) => n as usize,
            Err(e) => {
                warn!("Issue counting {} publications: {}", status, e);
                0
            }
        }
    }

    /// Unsent records rebuilt as publications, ready for replay.
    pub async fn unsent_publications(&self) -> Vec<Publication> {
        self.list_by_status(RecordStatus::Unsent)
            .await
            .iter()
            .filter_map(|record| match record.to_publication() {
                Ok(publication) => Some(publication),
                Err(e) => {
                    warn!("Cannot replay record {}: {}", record.id, e);
                    None
                }
            })
            .collect()
    }

    /// Run one retention pass with the configured deletion policy.
    pub async fn retention_pass(&self) -> usize {
        self.inner.retention_passes.fetch_add(1, Ordering::Relaxed);
        retention::run_pass(self, &self.inner.deletion).await
    }

    /// Number of retention passes run so far.
    pub fn retention_passes(&self) -> usize {
        self.inner.retention_passes.load(Ordering::Relaxed)
    }

    /// Destroy the publish table.
    pub async fn drop_table(&self) -> Status {
        let attempt = || async {
            sqlx::query("DROP TABLE IF EXISTS publish")
                .execute(&self.inner.pool)
                .await?;
            Ok::<_, StoreError>(())
        };
        match self.with_retry("drop_table", attempt).await {
            Ok(()) => Status::Success,
            Err(e) => {
                warn!("Unable to delete table: {}", e);
                Status::Failure
            }
        }
    }

    /// Stop the sweeper (which runs one final pass), log what is still
    /// unsent and release the pool. Returns the unsent count.
    pub async fn close(&self) -> usize {
        let sweeper = self.inner.sweeper.lock().await.take();
        match sweeper {
            Some(handle) => handle.stop().await,
            None => {
                self.retention_pass().await;
            }
        }

        let unsent = self.count_by_status(RecordStatus::Unsent).await;
        info!("{} unsent items remaining in database", unsent);

        self.inner.pool.close().await;
        unsent
    }
}
