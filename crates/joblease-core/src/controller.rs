//! The Controller: optimistically-concurrent job CRUD plus the leasing
//! protocol (spec §4.1).
//!
//! The Controller owns all policy; the [`Store`] it is generic over owns no
//! policy at all (see `store.rs`). This mirrors the split `seesaw-job-postgres`
//! draws between `JobStore` (interface) and `PgJobStore` (adapter), except
//! here the leasing algorithm itself lives on this side of the boundary
//! rather than inside the adapter, because spec §4.1 specifies the algorithm
//! as two named, reusable store primitives (`try_acquire_idle`,
//! `try_reacquire_locked`) rather than as a single opaque `claim_ready` call.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::error::{ControllerError, StoreError};
use crate::job::{Job, JobId, Tag, WorkerException, WorkerId};
use crate::store::{FieldUpdate, JobStatus, JobUpdate, Store};

/// How long a lease may go without a successful heartbeat before another
/// worker may reclaim it (spec §3/§4.1/glossary).
pub const HEARTBEAT_TIMEOUT: StdDuration = StdDuration::from_secs(10 * 60);

/// Optimistically-concurrent job CRUD plus the leasing protocol.
///
/// Cheap to clone: holds only an `Arc<S>` internally would be redundant
/// cloning of the store, so `Controller` itself is designed to be wrapped in
/// an `Arc` by callers that need to share it across worker tasks (the same
/// way `PgJobStore` is `Clone` over a pooled `PgPool`).
pub struct Controller<S: Store> {
    store: Arc<S>,
    heartbeat_timeout: Duration,
}

impl<S: Store> Controller<S> {
    /// Build a Controller over an already-constructed store adapter.
    ///
    /// Index creation and URI validation are the adapter's responsibility at
    /// construction time (spec §6.1); by the time a `Store` reaches here it
    /// is assumed connected and ready.
    pub fn new(store: Arc<S>) -> Self {
        Controller {
            store,
            heartbeat_timeout: Duration::from_std(HEARTBEAT_TIMEOUT)
                .expect("HEARTBEAT_TIMEOUT fits in chrono::Duration"),
        }
    }

    /// Override the lease timeout (primarily for tests exercising reclamation
    /// without sleeping ten minutes).
    pub fn with_heartbeat_timeout(mut self, timeout: StdDuration) -> Self {
        self.heartbeat_timeout =
            Duration::from_std(timeout).expect("timeout fits in chrono::Duration");
        self
    }

    /// Generate a fresh opaque job id (spec §4.1 `create_job_id`).
    pub fn create_job_id(&self) -> JobId {
        JobId::generate()
    }

    /// Insert a new idle job at version 0. Idempotent: a duplicate `id` is a
    /// silent no-op, not an error (spec §3 invariant 1).
    pub async fn create_job(
        &self,
        id: &JobId,
        tag: &Tag,
        args: Option<serde_json::Value>,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<(), ControllerError> {
        let args = args.unwrap_or_else(|| serde_json::json!({}));
        match self
            .store
            .insert_unique(id, tag, args, run_at, Utc::now())
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::AlreadyExists) => {
                debug!(job_id = %id, "create_job: job already exists, treating as no-op");
                Ok(())
            }
            Err(StoreError::Retriable(e)) => Err(ControllerError::Retriable(e)),
            Err(StoreError::Concurrency) => unreachable!("insert_unique never reports Concurrency"),
        }
    }

    /// Point read by id.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>, ControllerError> {
        self.store
            .get_by_id(id)
            .await
            .map_err(|e| match e {
                StoreError::Retriable(e) => ControllerError::Retriable(e),
                StoreError::Concurrency | StoreError::AlreadyExists => {
                    unreachable!("get_by_id never reports Concurrency/AlreadyExists")
                }
            })
    }

    /// Set status to `Cancelled`. Fails with a concurrency error on version mismatch.
    pub async fn cancel_job(&self, id: &JobId, version: u64) -> Result<Job, ControllerError> {
        let update = JobUpdate {
            status: Some(JobStatus::Cancelled),
            ..Default::default()
        };
        self.apply(id, version, update).await
    }

    /// Remove the record. Fails with a concurrency error if no record exists
    /// at that version (legal from any status, per spec §3).
    pub async fn delete_job(&self, id: &JobId, version: u64) -> Result<(), ControllerError> {
        self.store
            .delete_by_version(id, version)
            .await
            .map_err(|e| ControllerError::from_store(e, id.as_str(), version))
    }

    /// The leasing algorithm (spec §4.1): try an idle job first, then an
    /// abandoned lease. `None` if nothing is available for `tags`.
    pub async fn acquire_job(
        &self,
        tags: &[Tag],
        worker_id: &WorkerId,
    ) -> Result<Option<Job>, ControllerError> {
        let now = Utc::now();

        if let Some(job) = self
            .store
            .try_acquire_idle(tags, worker_id, now)
            .await
            .map_err(Self::store_err_no_version)?
        {
            info!(job_id = %job.id, %worker_id, "acquired idle job");
            return Ok(Some(job));
        }

        let deadline = now - self.heartbeat_timeout;
        if let Some(job) = self
            .store
            .try_reacquire_locked(tags, worker_id, now, deadline)
            .await
            .map_err(Self::store_err_no_version)?
        {
            warn!(job_id = %job.id, %worker_id, "reclaimed abandoned lease");
            return Ok(Some(job));
        }

        Ok(None)
    }

    /// Renew the lease: bump `worker_heartbeat`, increment version.
    pub async fn heartbeat_job(&self, id: &JobId, version: u64) -> Result<Job, ControllerError> {
        let update = JobUpdate {
            worker_heartbeat: FieldUpdate::set(Utc::now()),
            ..Default::default()
        };
        self.apply(id, version, update).await
    }

    /// Mark the job `Completed`, recording an optional captured exception.
    pub async fn finalize_job(
        &self,
        id: &JobId,
        version: u64,
        worker_exception: Option<WorkerException>,
    ) -> Result<Job, ControllerError> {
        let update = JobUpdate {
            status: Some(JobStatus::Completed),
            completed_at: FieldUpdate::set(Utc::now()),
            worker_exception: worker_exception
                .map(FieldUpdate::Set)
                .unwrap_or(FieldUpdate::Leave),
            ..Default::default()
        };
        self.apply(id, version, update).await
    }

    /// Reset to `Idle`, clearing lease fields, and set a new `run_at`.
    pub async fn requeue_job(
        &self,
        id: &JobId,
        version: u64,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<Job, ControllerError> {
        let update = JobUpdate {
            status: Some(JobStatus::Idle),
            run_at: run_at.map(FieldUpdate::Set).unwrap_or(FieldUpdate::Clear),
            locked_at: FieldUpdate::Clear,
            completed_at: FieldUpdate::Clear,
            worker_id: FieldUpdate::Clear,
            worker_heartbeat: FieldUpdate::Clear,
            ..Default::default()
        };
        self.apply(id, version, update).await
    }

    async fn apply(
        &self,
        id: &JobId,
        version: u64,
        update: JobUpdate,
    ) -> Result<Job, ControllerError> {
        self.store
            .find_one_and_update(id, version, update)
            .await
            .map_err(|e| ControllerError::from_store(e, id.as_str(), version))
    }

    fn store_err_no_version(e: StoreError) -> ControllerError {
        match e {
            StoreError::Retriable(e) => ControllerError::Retriable(e),
            StoreError::Concurrency | StoreError::AlreadyExists => {
                unreachable!("acquire queries never report Concurrency/AlreadyExists")
            }
        }
    }
}

impl<S: Store> Clone for Controller<S> {
    fn clone(&self) -> Self {
        Controller {
            store: self.store.clone(),
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }
}
