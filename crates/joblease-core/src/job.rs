//! The Job record and its legal states (spec §3).
//!
//! A [`Job`] is the only durable entity in the system. Every mutation goes
//! through the [`crate::controller::Controller`], which is the sole writer of
//! `version`; nothing in this module enforces the invariants listed below by
//! construction — they are properties of the Controller's update paths, not
//! of this struct.
//!
//! Invariants (spec §3):
//! 1. `id` is globally unique; a duplicate `create_job` is a silent no-op.
//! 2. `version` strictly increases on every accepted mutation.
//! 3. `status == Locked` ⇒ `worker_id` and `worker_heartbeat` are set.
//! 4. `status ∈ {Idle, Cancelled, Completed}` ⇒ `worker_id`/`worker_heartbeat` are cleared.
//! 5. `Completed`/`Cancelled` are terminal for the auto-pipeline; delete is always legal.
//! 6. A mutation is accepted only if the caller's `version` matches the stored one.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, producer-chosen job identifier.
///
/// Rendered as 32 lowercase hex digits (a UUIDv4 with hyphens stripped), per
/// spec §3's recommendation. Wrapping it in a newtype (rather than passing
/// bare `String`s around, as the original Python `job_id` does) keeps job ids
/// from being accidentally interchanged with worker ids or tags at the type
/// level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random job id (the `create_job_id()` operation of spec §4.1).
    pub fn generate() -> Self {
        JobId(Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing id string without validating its shape.
    ///
    /// Used by store adapters reconstructing a `Job` from a row; producers
    /// should prefer [`JobId::generate`].
    pub fn from_raw(raw: impl Into<String>) -> Self {
        JobId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing label. Workers declare the tags they serve; `acquire_job` only
/// returns jobs whose tag is in the caller's declared set.
///
/// spec §9 describes a capability-vector alternative (`{cpu:2, ram:4}`
/// matched against worker-advertised resources); this implementation adopts
/// the tag model as canonical (see DESIGN.md) and does not implement both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(String);

impl Tag {
    pub fn new(tag: impl Into<String>) -> Self {
        Tag(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Tag::new(s)
    }
}

/// Identity of a lease holder. Opaque from the Controller's point of view;
/// the Worker chooses its own id (e.g. hostname + pid).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        WorkerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The legal statuses of a job (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Locked,
    Cancelled,
    Completed,
}

impl JobStatus {
    /// `Cancelled`/`Completed` jobs are terminal for the auto-pipeline:
    /// `acquire_job` will never return them (spec §3 invariant 5).
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Cancelled | JobStatus::Completed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Idle => "idle",
            JobStatus::Locked => "locked",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// The captured failure of a user job body, stored verbatim on the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerException {
    pub reason: String,
    pub traceback: String,
}

/// A durable unit of work (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tag: Tag,
    pub args: serde_json::Value,
    pub status: JobStatus,
    pub version: u64,
    pub run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<WorkerId>,
    pub worker_heartbeat: Option<DateTime<Utc>>,
    pub worker_exception: Option<WorkerException>,
}

impl Job {
    /// True once the job has recorded a user-code failure (spec §3 `worker_exception`).
    pub fn failed(&self) -> bool {
        self.worker_exception.is_some()
    }

    /// A job is acquirable now if it is idle and either has no `run_at`, or
    /// `run_at` is strictly in the past (spec §4.1 step 1, §8 boundary case:
    /// `run_at` exactly equal to "now" still suppresses acquisition on a
    /// naive clock read, so adapters compare with `<`, not `<=`).
    pub fn is_acquirable_idle(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Idle && self.run_at.map(|r| r < now).unwrap_or(true)
    }
}
