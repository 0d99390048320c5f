//! [`JobChannel`]: the narrow surface user job code sees (spec §4.2).
//!
//! Rust has no implicit exception unwinding, so the original design's
//! "raise `InterruptJob`" / "raise `_RequeueRequested`" becomes an explicit
//! return value the user function must propagate with `?` — exactly the
//! "explicit cancellation token polled by the user function" that spec §9's
//! Design Notes recommend in place of coroutine/exception injection.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::context::JobContext;
use crate::job::Job;

/// The terminal, non-failure control-flow outcomes a user function may
/// propagate instead of returning `Ok(())` or a plain error (spec §6.2).
#[derive(Debug, Clone, Copy)]
pub enum JobOutcome {
    /// Produced by [`JobChannel::interrupt_if_requested`] once the job has
    /// been observed cancelled or revoked.
    Interrupted,
    /// Produced by [`JobChannel::requeue_job`]; carries the requested
    /// earliest-run time.
    Requeued {
        run_at: Option<DateTime<Utc>>,
    },
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutcome::Interrupted => write!(f, "job interrupted (cancelled or revoked)"),
            JobOutcome::Requeued { run_at } => write!(f, "requeue requested for {:?}", run_at),
        }
    }
}

impl std::error::Error for JobOutcome {}

/// The full error type a worker-supplied job function returns (spec §6.2).
///
/// `Interrupted`/`Requeued` are produced only by the channel; `Failed` is
/// "any other raised error" — a real job failure, captured verbatim as
/// `worker_exception = {reason, traceback}` on the job record.
#[derive(Debug)]
pub enum JobError {
    /// Propagated from [`JobChannel::interrupt_if_requested`].
    Interrupted,
    /// Propagated from [`JobChannel::requeue_job`].
    Requeued { run_at: Option<DateTime<Utc>> },
    /// Any other failure raised by the job body.
    Failed(anyhow::Error),
}

impl From<JobOutcome> for JobError {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Interrupted => JobError::Interrupted,
            JobOutcome::Requeued { run_at } => JobError::Requeued { run_at },
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Failed(err)
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Interrupted => write!(f, "job interrupted (cancelled or revoked)"),
            JobError::Requeued { run_at } => write!(f, "requeue requested for {:?}", run_at),
            JobError::Failed(e) => write!(f, "job failed: {e}"),
        }
    }
}

impl std::error::Error for JobError {}

/// The handle passed to user job code (spec §4.2).
///
/// Cloning is cheap (an `Arc` clone) — user code may hand the channel to
/// helper functions or another thread if it wants to poll cancellation from
/// more than one place.
#[derive(Clone)]
pub struct JobChannel {
    ctx: Arc<JobContext>,
}

impl JobChannel {
    pub(crate) fn new(ctx: Arc<JobContext>) -> Self {
        JobChannel { ctx }
    }

    /// Read-only snapshot of the current job, as last refreshed by the worker loop.
    pub fn job(&self) -> Job {
        self.ctx.job()
    }

    /// True if the latest observed status is `Cancelled`.
    pub fn cancelled(&self) -> bool {
        self.ctx.cancelled()
    }

    /// True if the latest observed `worker_id` no longer matches this worker
    /// (the lease was stolen by a reclaimer).
    pub fn revoked(&self) -> bool {
        self.ctx.revoked()
    }

    /// Checkpoint user code is expected to call periodically. Returns
    /// `Err(JobOutcome::Interrupted)` if `cancelled() || revoked()`, which
    /// the caller should propagate with `?` to unwind immediately.
    pub fn interrupt_if_requested(&self) -> Result<(), JobOutcome> {
        if self.cancelled() || self.revoked() {
            Err(JobOutcome::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Record a requeue intent with the given earliest-run time and produce
    /// the control-flow value the caller must return immediately:
    ///
    /// ```ignore
    /// fn job_body(channel: &JobChannel) -> Result<(), JobError> {
    ///     return Err(channel.requeue_job(None).into());
    /// }
    /// ```
    pub fn requeue_job(&self, run_at: Option<DateTime<Utc>>) -> JobOutcome {
        self.ctx.request_requeue(run_at);
        JobOutcome::Requeued { run_at }
    }
}
