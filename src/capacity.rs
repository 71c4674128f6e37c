//! Bounded record count with policy-driven eviction.
//!
//! The guard runs inside `RecordStore::add` while the mutation lock is held,
//! before the new record is inserted. When the table is at or above
//! `max_samples` it evicts by timestamp, oldest or newest first, until the
//! count is strictly below the limit. The insert that hit the limit is
//! rejected; the next one fits.

use tracing::warn;

use crate::config::CapacitySettings;
use crate::db::RecordStore;
use crate::error::StoreError;
use crate::models::{Field, Record};

/// Result of a capacity check.
#[derive(Debug, Default)]
pub struct CapacityCheck {
    /// The table was at or above the limit when checked.
    pub at_limit: bool,
    /// An insert may proceed without exceeding the limit.
    pub has_room: bool,
    /// Records removed to make room.
    pub evicted: Vec<Record>,
}

#[derive(Debug, Clone)]
pub struct CapacityGuard {
    settings: CapacitySettings,
}

impl CapacityGuard {
    pub fn new(settings: CapacitySettings) -> Self {
        Self { settings }
    }

    /// Make room for one insert. Caller must hold the store's mutation lock.
    ///
    /// Failing to count records is an error; failing to evict is logged and
    /// reported as `has_room: false`, leaving cleanup to the next insert or
    /// retention pass.
    pub async fn enforce(&self, store: &RecordStore) -> Result<CapacityCheck, StoreError> {
        let mut check = CapacityCheck::default();
        if self.settings.unlimited {
            check.has_room = true;
            return Ok(check);
        }

        let max = self.settings.max_samples;
        loop {
            let count = store.count_all().await?;
            if count < max {
                check.has_room = true;
                return Ok(check);
            }
            check.at_limit = true;

            let victim = match store.boundary_timestamp(self.settings.oldest_first).await? {
                Some(ts) => ts,
                None => return Ok(check),
            };

            match store.delete_matching(Field::Timestamp, &victim).await {
                Ok(removed) if !removed.is_empty() => check.evicted.extend(removed),
                Ok(_) => return Ok(check),
                Err(e) => {
                    warn!("Failed to evict record at {}: {}", victim, e);
                    return Ok(check);
                }
            }
        }
    }
}
