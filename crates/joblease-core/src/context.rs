//! `JobContext`: the private state a [`crate::worker::Worker`] keeps for its
//! current job, and the only thing the [`crate::channel::JobChannel`] reads
//! (spec §4.2).
//!
//! Only the main loop writes to this; the channel — running inside the
//! `spawn_blocking` task executing user code — only reads it. That split is
//! why the shared fields live behind a `std::sync::RwLock` rather than a
//! `tokio::sync::RwLock`: the reader side runs on a blocking thread, not
//! inside an async task, so a std lock is both correct and cheaper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::job::{Job, JobStatus, WorkerId};

/// The part of the context that changes as the job is observed/refreshed.
#[derive(Debug, Clone)]
struct Snapshot {
    job: Job,
}

/// Requeue intent recorded by the channel, consumed by the worker loop once
/// the task thread has exited (spec §4.2 `requeue_job`).
#[derive(Debug, Clone, Copy)]
pub struct RequeueIntent {
    pub run_at: Option<DateTime<Utc>>,
}

/// Shared state between a [`crate::worker::Worker`]'s main loop and the
/// [`crate::channel::JobChannel`] handed to user code.
pub struct JobContext {
    worker_id: WorkerId,
    snapshot: RwLock<Snapshot>,
    /// Set once the loop has learned the snapshot may be stale (e.g. after a
    /// heartbeat concurrency error) and needs a fresh `get_job` before
    /// deciding anything else (spec §4.3 loop step "Context marked outdated").
    outdated: AtomicBool,
    requeue: RwLock<Option<RequeueIntent>>,
    /// Best-effort flag for the asynchronous-interrupt mode (spec §4.3):
    /// set once the worker has injected an interrupt signal so it is not
    /// injected a second time.
    interrupt_injected: AtomicBool,
}

impl JobContext {
    pub fn new(worker_id: WorkerId, job: Job) -> Arc<Self> {
        Arc::new(JobContext {
            worker_id,
            snapshot: RwLock::new(Snapshot { job }),
            outdated: AtomicBool::new(false),
            requeue: RwLock::new(None),
            interrupt_injected: AtomicBool::new(false),
        })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn job(&self) -> Job {
        self.snapshot.read().expect("snapshot lock poisoned").job.clone()
    }

    pub fn job_id(&self) -> crate::job::JobId {
        self.job().id
    }

    pub fn version(&self) -> u64 {
        self.snapshot.read().expect("snapshot lock poisoned").job.version
    }

    /// Replace the snapshot with a freshly-read job and clear `outdated`
    /// (spec §4.3 `_try_update_current_job`).
    pub fn refresh(&self, job: Job) {
        let mut snap = self.snapshot.write().expect("snapshot lock poisoned");
        snap.job = job;
        drop(snap);
        self.outdated.store(false, Ordering::SeqCst);
    }

    pub fn mark_outdated(&self) {
        self.outdated.store(true, Ordering::SeqCst);
    }

    pub fn is_outdated(&self) -> bool {
        self.outdated.load(Ordering::SeqCst)
    }

    /// True once the latest observed status is `Cancelled` (spec §4.2 `cancelled`).
    pub fn cancelled(&self) -> bool {
        self.snapshot.read().expect("snapshot lock poisoned").job.status == JobStatus::Cancelled
    }

    /// True once the latest observed `worker_id` no longer matches this
    /// worker — the lease was stolen by a reclaimer (spec §4.2 `revoked`).
    pub fn revoked(&self) -> bool {
        self.snapshot
            .read()
            .expect("snapshot lock poisoned")
            .job
            .worker_id
            .as_ref()
            != Some(&self.worker_id)
    }

    pub fn request_requeue(&self, run_at: Option<DateTime<Utc>>) {
        *self.requeue.write().expect("requeue lock poisoned") = Some(RequeueIntent { run_at });
    }

    pub fn requeue_requested(&self) -> bool {
        self.requeue.read().expect("requeue lock poisoned").is_some()
    }

    pub fn take_requeue(&self) -> Option<RequeueIntent> {
        *self.requeue.read().expect("requeue lock poisoned")
    }

    pub fn mark_interrupt_injected(&self) -> bool {
        !self.interrupt_injected.swap(true, Ordering::SeqCst)
    }
}
