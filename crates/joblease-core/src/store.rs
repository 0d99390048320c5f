//! The minimal contract a durable store must offer the Controller (spec §6.1).
//!
//! `Store` owns no policy: it is "policy-light" in the same sense as
//! `seesaw::job::JobStore` in the teacher crate — it does not decide what
//! "ready" means beyond the exact predicates the Controller hands it, and it
//! does not calculate backoff or retry counts. All leasing, backoff, and
//! retry policy lives in [`crate::controller::Controller`] and
//! [`crate::worker::Worker`].
//!
//! Implementations must provide:
//! - Unique insert keyed by `id` (duplicate reports [`StoreError::AlreadyExists`]).
//! - Atomic conditional find-and-update, keyed by `id` + `version`.
//! - The two atomic "find an acquirable job" queries used by the leasing
//!   algorithm (idle-match and reclaim-match).
//! - Atomic conditional delete keyed by `id` + `version`.
//! - Point read by `id`.
//!
//! Implementations must also declare the indexes described in spec §4.1 at
//! startup: `{id}` unique, `{id, version}`, `{tag, status, run_at, worker_heartbeat}`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::job::{Job, JobId, Tag, WorkerException, WorkerId};

/// The fields a `find_one_and_update`-style mutation may set, besides the
/// version bump every accepted mutation performs unconditionally.
///
/// Mirrors the `**kwargs` passed to `_update_job` in the original
/// implementation: each Controller operation sets a different subset of
/// these fields, and a `None` means "leave the store's current value" except
/// for fields whose `Some(None)` distinguishes "clear" from "don't touch"
/// (see [`FieldUpdate`]).
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub worker_id: FieldUpdate<WorkerId>,
    pub worker_heartbeat: FieldUpdate<DateTime<Utc>>,
    pub worker_exception: FieldUpdate<WorkerException>,
    pub locked_at: FieldUpdate<DateTime<Utc>>,
    pub completed_at: FieldUpdate<DateTime<Utc>>,
    pub run_at: FieldUpdate<DateTime<Utc>>,
}

pub use crate::job::JobStatus;

/// A tri-state field update: leave untouched, set to a value, or clear to null.
///
/// Plain `Option<T>` cannot distinguish "don't touch" from "set to None",
/// which `requeue_job` needs (it clears `worker_id`/`worker_heartbeat` while
/// `heartbeat_job` leaves them alone except to set a new heartbeat).
#[derive(Debug, Clone)]
pub enum FieldUpdate<T> {
    Leave,
    Set(T),
    Clear,
}

// Hand-rolled rather than `#[derive(Default)]`: the derive macro would add an
// unconditional `T: Default` bound even though the `Leave` variant carries no
// `T`, which would wrongly require e.g. `WorkerId: Default`.
impl<T> Default for FieldUpdate<T> {
    fn default() -> Self {
        FieldUpdate::Leave
    }
}

impl<T> FieldUpdate<T> {
    pub fn set(value: T) -> Self {
        FieldUpdate::Set(value)
    }

    /// Transform the carried value, if any, leaving `Leave`/`Clear` as-is.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FieldUpdate<U> {
        match self {
            FieldUpdate::Leave => FieldUpdate::Leave,
            FieldUpdate::Set(v) => FieldUpdate::Set(f(v)),
            FieldUpdate::Clear => FieldUpdate::Clear,
        }
    }
}

/// The durable store a [`crate::controller::Controller`] requires (spec §6.1).
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a brand-new idle job at version 0.
    ///
    /// Returns [`StoreError::AlreadyExists`] if `id` is already present;
    /// the Controller treats that as a successful no-op (spec §3 invariant 1).
    async fn insert_unique(
        &self,
        id: &JobId,
        tag: &Tag,
        args: serde_json::Value,
        run_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Point read by id.
    async fn get_by_id(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Atomic conditional update keyed by `(id, version)`.
    ///
    /// Implementations must increment `version` and apply `update`
    /// atomically, returning the post-image, or [`StoreError::Concurrency`]
    /// if no row matches `(id, version)`.
    async fn find_one_and_update(
        &self,
        id: &JobId,
        version: u64,
        update: JobUpdate,
    ) -> Result<Job, StoreError>;

    /// Atomic conditional delete keyed by `(id, version)`.
    async fn delete_by_version(&self, id: &JobId, version: u64) -> Result<(), StoreError>;

    /// Acquire-step 1 (spec §4.1): find an `Idle` job matching `tags` whose
    /// `run_at` has elapsed (or is unset), lock it for `worker_id`, and
    /// return the post-image. `None` if nothing matches.
    async fn try_acquire_idle(
        &self,
        tags: &[Tag],
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Acquire-step 2 (spec §4.1): find a `Locked` job matching `tags` whose
    /// `worker_heartbeat` is strictly older than `heartbeat_deadline`,
    /// reassign it to `worker_id`, and return the post-image.
    async fn try_reacquire_locked(
        &self,
        tags: &[Tag],
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        heartbeat_deadline: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;
}
