//! Persisted keyed store: generic CRUD over named collections.
//!
//! Every component of the worker subsystem persists through this boundary.
//! Collections are identified by a `kind` string (see [`kinds`]); records are
//! JSON documents keyed by a string id. No transactions across kinds.

pub mod file;
pub mod in_memory;
pub mod keyed_store;

pub use file::FileKeyedStore;
pub use in_memory::InMemoryKeyedStore;
pub use keyed_store::{KeyedStore, Record, RecordStore, SharedStore, StoreError};

/// Collection names.
pub mod kinds {
    pub const JOB_EXECUTIONS: &str = "job-executions";
    pub const QUEUED_JOBS: &str = "queued-jobs";
    pub const DEAD_LETTER_JOBS: &str = "dead-letter-jobs";
    pub const ALERT_THROTTLES: &str = "alert-throttles";
    pub const ALERT_EVENTS: &str = "alert-events";
    pub const QUEUE_CONTROL: &str = "queue-control";
    pub const ALERT_CURSORS: &str = "alert-cursors";
}
