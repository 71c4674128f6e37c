//! Store-and-forward buffer for publications of an intermittently connected
//! device.
//!
//! Producers [`RecordStore::add`] publications; the transport replays unsent
//! records, stamps them into batches with [`RecordStore::reassign_topic`],
//! filters each batch through a [`ForwardingGate`] and records outcomes with
//! [`RecordStore::update`]. A [`RetentionSweeper`] removes aged or sent
//! records in the background.

pub mod capacity;
pub mod config;
pub mod db;
pub mod error;
pub mod forwarding;
pub mod models;
pub mod retention;

pub use capacity::{CapacityCheck, CapacityGuard};
pub use config::{
    CapacitySettings, Config, ConfigError, DeleteMethod, DeletionSettings, ForwardMethod,
    ForwardingSettings,
};
pub use db::{init_pool, run_migrations, RecordStore};
pub use error::StoreError;
pub use forwarding::{ForwardingGate, GateDecision};
pub use models::{
    Command, Field, LocationFix, Payload, Publication, Record, RecordStatus, Status,
    DEFAULT_TOPIC_NUM,
};
pub use retention::{RetentionSweeper, SweeperHandle};
