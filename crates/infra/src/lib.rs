//! Worker subsystem runtime: persistence, job queue, execution tracking,
//! background workers and alerting.

pub mod alerts;
pub mod jobs;
pub mod store;
pub mod workers;

#[cfg(test)]
mod integration_tests;
