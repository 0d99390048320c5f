//! An in-memory [`Store`] and fixtures for testing joblease consumers without
//! a real database.
//!
//! Mirrors the role `seesaw-testing` plays for the teacher crate, though the
//! teacher's testing crate ships no test-double `JobStore` of its own; this
//! one is grounded directly on [`joblease_core::Store`]'s own contract
//! instead, plus the fixture shape `conftest.py` uses in the original
//! implementation (a freshly-dropped store handed to each test).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use joblease_core::{
    Controller, FieldUpdate, Job, JobId, JobStatus, JobUpdate, Store, StoreError, Tag, WorkerId,
};

/// A [`Store`] backed by an in-process `HashMap`. Not durable, not
/// cross-process — useful only for tests and local experimentation.
#[derive(Default)]
pub struct InMemoryStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore::default()
    }

    /// Directly overwrite a job's `worker_heartbeat`, bypassing the version
    /// check. Test-only: lets a test simulate an abandoned lease without
    /// actually sleeping past `HEARTBEAT_TIMEOUT`, the same shortcut
    /// `Controller._update_job(..., worker_heartbeat=fake_heartbeat)` takes
    /// in the original implementation's `test_reacquire_job`.
    pub async fn backdate_heartbeat(&self, id: &JobId, heartbeat: DateTime<Utc>) {
        if let Some(job) = self.jobs.lock().await.get_mut(id.as_str()) {
            job.worker_heartbeat = Some(heartbeat);
        }
    }
}

fn apply_update(job: &mut Job, update: JobUpdate) {
    if let Some(status) = update.status {
        job.status = status;
    }
    apply_field(&mut job.worker_id, update.worker_id);
    apply_field(&mut job.worker_heartbeat, update.worker_heartbeat);
    apply_field(&mut job.worker_exception, update.worker_exception);
    apply_field(&mut job.locked_at, update.locked_at);
    apply_field(&mut job.completed_at, update.completed_at);
    apply_field(&mut job.run_at, update.run_at);
    job.version += 1;
}

fn apply_field<T>(slot: &mut Option<T>, update: FieldUpdate<T>) {
    match update {
        FieldUpdate::Leave => {}
        FieldUpdate::Set(v) => *slot = Some(v),
        FieldUpdate::Clear => *slot = None,
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_unique(
        &self,
        id: &JobId,
        tag: &Tag,
        args: serde_json::Value,
        run_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(id.as_str()) {
            return Err(StoreError::AlreadyExists);
        }
        jobs.insert(
            id.as_str().to_string(),
            Job {
                id: id.clone(),
                tag: tag.clone(),
                args,
                status: JobStatus::Idle,
                version: 0,
                run_at,
                created_at,
                locked_at: None,
                completed_at: None,
                worker_id: None,
                worker_heartbeat: None,
                worker_exception: None,
            },
        );
        Ok(())
    }

    async fn get_by_id(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.get(id.as_str()).cloned())
    }

    async fn find_one_and_update(
        &self,
        id: &JobId,
        version: u64,
        update: JobUpdate,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(id.as_str()).filter(|j| j.version == version);
        match job {
            Some(job) => {
                apply_update(job, update);
                Ok(job.clone())
            }
            None => Err(StoreError::Concurrency),
        }
    }

    async fn delete_by_version(&self, id: &JobId, version: u64) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get(id.as_str()) {
            Some(job) if job.version == version => {
                jobs.remove(id.as_str());
                Ok(())
            }
            _ => Err(StoreError::Concurrency),
        }
    }

    async fn try_acquire_idle(
        &self,
        tags: &[Tag],
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let candidate = jobs
            .values_mut()
            .filter(|j| tags.contains(&j.tag) && j.is_acquirable_idle(now))
            .min_by_key(|j| j.created_at);

        match candidate {
            Some(job) => {
                job.status = JobStatus::Locked;
                job.version += 1;
                job.worker_id = Some(worker_id.clone());
                job.worker_heartbeat = Some(now);
                job.locked_at = Some(now);
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn try_reacquire_locked(
        &self,
        tags: &[Tag],
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        heartbeat_deadline: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let candidate = jobs
            .values_mut()
            .filter(|j| {
                tags.contains(&j.tag)
                    && j.status == JobStatus::Locked
                    && j.worker_heartbeat.map(|h| h < heartbeat_deadline).unwrap_or(false)
            })
            .min_by_key(|j| j.worker_heartbeat);

        match candidate {
            Some(job) => {
                job.version += 1;
                job.worker_id = Some(worker_id.clone());
                job.worker_heartbeat = Some(now);
                job.locked_at = Some(now);
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }
}

/// A fresh `Controller` over an empty [`InMemoryStore`] (the in-memory analogue
/// of `conftest.py`'s `controller` fixture, which drops the test database
/// before yielding a new `Controller`).
pub fn fresh_controller() -> Controller<InMemoryStore> {
    Controller::new(Arc::new(InMemoryStore::new()))
}

#[cfg(test)]
mod worker_tests;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn create_job_is_idempotent() {
        let controller = fresh_controller();
        let id = controller.create_job_id();
        let tag = Tag::new("test-tag");

        controller.create_job(&id, &tag, Some(serde_json::json!({"payload": 42})), None).await.unwrap();
        controller.create_job(&id, &tag, Some(serde_json::json!({"payload": 99})), None).await.unwrap();

        let job = controller.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.args, serde_json::json!({"payload": 42}));
        assert_eq!(job.status, JobStatus::Idle);
        assert!(job.worker_id.is_none());
    }

    #[tokio::test]
    async fn acquire_job_does_not_double_acquire() {
        let controller = fresh_controller();
        let id = controller.create_job_id();
        let tag = Tag::new("test-tag");
        controller.create_job(&id, &tag, None, None).await.unwrap();

        let worker = WorkerId::new("test-worker");
        let job_1 = controller.acquire_job(&[tag.clone()], &worker).await.unwrap();
        assert_eq!(job_1.unwrap().id, id);

        let job_2 = controller.acquire_job(&[tag], &worker).await.unwrap();
        assert!(job_2.is_none());
    }

    #[tokio::test]
    async fn abandoned_lease_is_reclaimed() {
        let store = Arc::new(InMemoryStore::new());
        let controller = Controller::new(store.clone());
        let id = controller.create_job_id();
        let tag = Tag::new("test-tag");
        controller.create_job(&id, &tag, None, None).await.unwrap();

        let first = WorkerId::new("worker-1");
        controller.acquire_job(&[tag.clone()], &first).await.unwrap().unwrap();

        let stale_heartbeat = Utc::now() - Duration::minutes(11);
        store.backdate_heartbeat(&id, stale_heartbeat).await;

        let second = WorkerId::new("worker-2");
        let reclaimed = controller.acquire_job(&[tag], &second).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.worker_id, Some(second));
    }

    #[tokio::test]
    async fn cancel_then_acquire_skips_job() {
        let controller = fresh_controller();
        let id = controller.create_job_id();
        let tag = Tag::new("test-tag");
        controller.create_job(&id, &tag, None, None).await.unwrap();

        let job = controller.get_job(&id).await.unwrap().unwrap();
        controller.cancel_job(&id, job.version).await.unwrap();

        let worker = WorkerId::new("test-worker");
        let acquired = controller.acquire_job(&[tag], &worker).await.unwrap();
        assert!(acquired.is_none());
    }

    #[tokio::test]
    async fn requeue_clears_lease_fields() {
        let controller = fresh_controller();
        let id = controller.create_job_id();
        let tag = Tag::new("test-tag");
        controller.create_job(&id, &tag, None, None).await.unwrap();

        let worker = WorkerId::new("test-worker");
        let job = controller.acquire_job(&[tag], &worker).await.unwrap().unwrap();

        let run_at = Utc::now() + Duration::seconds(30);
        let requeued = controller
            .requeue_job(&id, job.version, Some(run_at))
            .await
            .unwrap();

        assert_eq!(requeued.status, JobStatus::Idle);
        assert!(requeued.worker_id.is_none());
        assert!(requeued.worker_heartbeat.is_none());
        assert_eq!(requeued.run_at, Some(run_at));
    }

    #[tokio::test]
    async fn finalize_records_worker_exception() {
        let controller = fresh_controller();
        let id = controller.create_job_id();
        let tag = Tag::new("test-tag");
        controller.create_job(&id, &tag, None, None).await.unwrap();

        let worker = WorkerId::new("test-worker");
        let job = controller.acquire_job(&[tag], &worker).await.unwrap().unwrap();

        let exception = joblease_core::WorkerException {
            reason: "exception from job".to_string(),
            traceback: "stub".to_string(),
        };
        let finalized = controller
            .finalize_job(&id, job.version, Some(exception))
            .await
            .unwrap();

        assert_eq!(finalized.status, JobStatus::Completed);
        assert_eq!(finalized.worker_exception.unwrap().reason, "exception from job");
    }

    #[tokio::test]
    async fn stale_version_is_a_concurrency_error() {
        let controller = fresh_controller();
        let id = controller.create_job_id();
        let tag = Tag::new("test-tag");
        controller.create_job(&id, &tag, None, None).await.unwrap();

        let job = controller.get_job(&id).await.unwrap().unwrap();
        controller.cancel_job(&id, job.version).await.unwrap();

        let err = controller.cancel_job(&id, job.version).await.unwrap_err();
        assert!(err.is_concurrency());
    }
}
