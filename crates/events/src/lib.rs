//! Worker signals and the pub/sub plumbing that carries them.
//!
//! - `bus`: transport-agnostic publish/subscribe contract
//! - `in_memory_bus`: channel-backed bus for a single process
//! - `signal`: the [`WorkerEvent`] vocabulary emitted by the queue, the retry
//!   sweep and job handlers
//! - `sink`: narrow emit-only interface handed to producers

pub mod bus;
pub mod in_memory_bus;
pub mod signal;
pub mod sink;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use signal::WorkerEvent;
pub use sink::{BusSink, EventPublisher, EventSink, NoopSink, RecordingSink};
