//! `jobwarden-core`: shared building blocks for the worker subsystem.
//!
//! This crate contains **pure** primitives (identifiers, errors, time) with no
//! storage or runtime concerns.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::DomainError;
pub use id::{AlertEventId, DeadLetterId, ExecutionId, QueuedJobId};
