//! # joblease
//!
//! A distributed task queue coordination layer: producers enqueue durable
//! jobs into a shared store, and a fleet of workers leases, executes,
//! heartbeats, and finalizes them. The store is the only thing workers
//! coordinate through; workers never talk to each other directly.
//!
//! ## Core Concepts
//!
//! - [`Job`] = the durable unit of work, with a monotonically increasing
//!   `version` that is the basis of optimistic concurrency.
//! - [`Store`] = the minimal contract a durable backend must expose —
//!   unique insert, conditional find-and-update, the two leasing queries,
//!   conditional delete, and point read. Policy-light, like a persistence
//!   driver should be.
//! - [`Controller`] = all the policy: job CRUD plus the two-step leasing
//!   algorithm (acquire an idle job, or reclaim an abandoned lease).
//! - [`JobChannel`] = the narrow handle worker-supplied job code sees:
//!   cancellation/revocation observation and a requeue request.
//! - [`Worker`] = the per-process state machine tying the above together:
//!   acquire → heartbeat → finalize/requeue, with cooperative shutdown.
//!
//! ## What This Is Not
//!
//! joblease is **not**:
//! - An exactly-once execution engine (jobs are at-least-once under crashes)
//! - A priority queue or scheduler with cross-job ordering guarantees
//! - A push-delivery system (workers poll)
//!
//! ## Example
//!
//! ```ignore
//! use joblease_core::{Controller, Worker, Tag, WorkerId, JobChannel, JobError};
//! use std::sync::Arc;
//!
//! let controller = Controller::new(Arc::new(my_store));
//!
//! let job_id = controller.create_job_id();
//! controller.create_job(&job_id, &Tag::new("emails"), None, None).await?;
//!
//! fn send_email(channel: &JobChannel) -> Result<(), JobError> {
//!     channel.interrupt_if_requested()?;
//!     // ... do the work ...
//!     Ok(())
//! }
//!
//! let mut worker = Worker::new(
//!     WorkerId::new("worker-1"),
//!     vec![Tag::new("emails")],
//!     send_email,
//!     controller,
//! );
//! worker.start();
//! ```

mod channel;
mod config;
mod context;
mod controller;
mod error;
mod job;
mod store;
mod worker;

pub use channel::{JobChannel, JobError, JobOutcome};
pub use config::ControllerConfig;
pub use controller::{Controller, HEARTBEAT_TIMEOUT};
pub use error::{ConfigError, ControllerError, StoreError};
pub use job::{Job, JobId, JobStatus, Tag, WorkerException, WorkerId};
pub use store::{FieldUpdate, JobUpdate, Store};
pub use worker::{InterruptMode, JobFn, Worker, WorkerTimings};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn job_id_is_32_lowercase_hex_chars() {
        let id = JobId::generate();
        let s = id.as_str();
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn job_acquirable_idle_respects_run_at() {
        let now = Utc::now();
        let mut job = sample_job();
        job.run_at = None;
        assert!(job.is_acquirable_idle(now));

        job.run_at = Some(now + Duration::seconds(10));
        assert!(!job.is_acquirable_idle(now));

        job.run_at = Some(now - Duration::seconds(10));
        assert!(job.is_acquirable_idle(now));

        // Boundary: run_at exactly equal to "now" does not count as elapsed.
        job.run_at = Some(now);
        assert!(!job.is_acquirable_idle(now));
    }

    #[test]
    fn job_acquirable_idle_requires_idle_status() {
        let now = Utc::now();
        let mut job = sample_job();
        job.status = JobStatus::Locked;
        assert!(!job.is_acquirable_idle(now));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Idle.is_terminal());
        assert!(!JobStatus::Locked.is_terminal());
    }

    fn sample_job() -> Job {
        Job {
            id: JobId::generate(),
            tag: Tag::new("test"),
            args: serde_json::json!({}),
            status: JobStatus::Idle,
            version: 0,
            run_at: None,
            created_at: Utc::now(),
            locked_at: None,
            completed_at: None,
            worker_id: None,
            worker_heartbeat: None,
            worker_exception: None,
        }
    }
}
