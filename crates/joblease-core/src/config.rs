//! Typed runtime configuration (spec §6.1/§7's "connection/runtime
//! configuration ... surfaced as a typed `ControllerConfig`").
//!
//! Bundles the knobs that used to be scattered `with_*` builder calls
//! (`Controller::with_heartbeat_timeout`, `Worker::with_timings`) plus the
//! ones only a concrete store adapter needs (the table/collection name), so
//! an application can validate and load them from one place at startup,
//! the way `Controller.__init__(db_uri, col_name='jobs')` takes its whole
//! configuration up front in the original implementation.

use std::time::Duration;

use crate::controller::HEARTBEAT_TIMEOUT;
use crate::worker::WorkerTimings;

/// Runtime configuration shared by the Controller, the Worker, and a store
/// adapter's connection setup.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long a lease may go without a heartbeat before it is reclaimable.
    pub heartbeat_timeout: Duration,
    /// Upper bound of the randomized sleep between acquire polls.
    pub poll_interval: Duration,
    /// Upper bound of the randomized sleep between heartbeats.
    pub heartbeat_interval: Duration,
    /// Name of the table/collection a store adapter should use, default `jobs`
    /// (mirrors `col_name='jobs'` on the original implementation's Controller).
    pub table_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            poll_interval: Duration::from_millis(2700),
            heartbeat_interval: Duration::from_millis(3000),
            table_name: "jobs".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Project the polling knobs onto a [`WorkerTimings`].
    pub fn worker_timings(&self) -> WorkerTimings {
        WorkerTimings {
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}
