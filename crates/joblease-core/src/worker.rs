//! The Worker state machine (spec §4.3): acquire → heartbeat →
//! finalize/requeue, with cancellation/revocation handling, retry/backoff,
//! and cooperative shutdown.
//!
//! The main loop runs as an async `tokio` task; the task thread executing
//! user code runs on `tokio::task::spawn_blocking`, since the job body is a
//! synchronous, cooperative function analogous to the OS thread the original
//! implementation spawns per job. The two communicate only through the
//! shared [`JobContext`] and the [`JobChannel`] — never directly.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::channel::{JobChannel, JobError};
use crate::context::JobContext;
use crate::controller::Controller;
use crate::error::ControllerError;
use crate::job::{Tag, WorkerException, WorkerId};
use crate::store::Store;

/// A worker-supplied job body (spec §6.2).
pub type JobFn = dyn Fn(&JobChannel) -> Result<(), JobError> + Send + Sync + 'static;

/// How the Worker reacts to a job it has observed as cancelled or revoked
/// (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptMode {
    /// The task is expected to call `interrupt_if_requested()` at
    /// checkpoints; the Worker never forcibly terminates it. This is the
    /// default, and the only mode with a termination guarantee.
    #[default]
    Cooperative,
    /// Best-effort: the Worker also sets a shared flag the next time it
    /// observes `cancelled || revoked`, then repeatedly short-polls the task
    /// handle. Rust cannot preempt a running OS thread the way the original
    /// implementation's `PyThreadState_SetAsyncExc` does, so this differs
    /// only in that [`JobChannel::interrupt_if_requested`] is the sole
    /// enforcement point either way — this mode exists for symmetry with the
    /// spec and to log the injection attempt, not to add real preemption.
    Async,
}

/// Tunable timings, all jittered the way the original implementation
/// jitters its poll/heartbeat sleeps to avoid thundering-herd polling
/// (spec §9: "any equivalent ~1-3s randomized interval is acceptable").
#[derive(Debug, Clone, Copy)]
pub struct WorkerTimings {
    /// Upper bound of the randomized sleep between `acquire_job` polls when
    /// nothing was available.
    pub poll_interval: StdDuration,
    /// Upper bound of the randomized sleep between heartbeats / task-thread
    /// liveness polls.
    pub heartbeat_interval: StdDuration,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        WorkerTimings {
            poll_interval: StdDuration::from_millis(2700),
            heartbeat_interval: StdDuration::from_millis(3000),
        }
    }
}

fn jittered(upper: StdDuration) -> StdDuration {
    let floor_ms = (upper.as_millis() / 3).max(1) as u64;
    let span_ms = upper.as_millis() as u64;
    let ms = floor_ms + fastrand::u64(0..=span_ms.saturating_sub(floor_ms));
    StdDuration::from_millis(ms.max(1))
}

/// A per-process worker: one current job at a time, polling and leasing
/// against a [`Controller`] (spec §4.3).
pub struct Worker<S: Store> {
    id: WorkerId,
    tags: Vec<Tag>,
    controller: Controller<S>,
    job_fn: Arc<JobFn>,
    interrupt_mode: InterruptMode,
    timings: WorkerTimings,
    stop: Arc<AtomicBool>,
    force_stop: Arc<AtomicBool>,
    loop_handle: Option<JoinHandle<()>>,
}

impl<S: Store + 'static> Worker<S> {
    /// Build a worker listening on `tags`, executing `job_fn` for each
    /// acquired job, using `interrupt_via_exception: false` semantics
    /// (cooperative interruption) by default.
    pub fn new(
        id: WorkerId,
        tags: Vec<Tag>,
        job_fn: impl Fn(&JobChannel) -> Result<(), JobError> + Send + Sync + 'static,
        controller: Controller<S>,
    ) -> Self {
        Worker {
            id,
            tags,
            controller,
            job_fn: Arc::new(job_fn),
            interrupt_mode: InterruptMode::default(),
            timings: WorkerTimings::default(),
            stop: Arc::new(AtomicBool::new(false)),
            force_stop: Arc::new(AtomicBool::new(false)),
            loop_handle: None,
        }
    }

    pub fn with_interrupt_mode(mut self, mode: InterruptMode) -> Self {
        self.interrupt_mode = mode;
        self
    }

    pub fn with_timings(mut self, timings: WorkerTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.loop_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Start the main loop in a background `tokio` task.
    pub fn start(&mut self) {
        info!(worker_id = %self.id, tags = ?self.tags.iter().map(Tag::as_str).collect::<Vec<_>>(), "starting worker");
        let state = RunState {
            id: self.id.clone(),
            tags: self.tags.clone(),
            controller: self.controller.clone(),
            job_fn: self.job_fn.clone(),
            interrupt_mode: self.interrupt_mode,
            timings: self.timings,
            stop: self.stop.clone(),
            force_stop: self.force_stop.clone(),
        };
        self.loop_handle = Some(tokio::spawn(state.run()));
    }

    /// Request a graceful stop: the loop exits only once the active job (if
    /// any) has been finalized or requeued.
    pub fn request_stop(&self) {
        info!(worker_id = %self.id, "stop requested");
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Request an immediate stop, abandoning any active job (its lease will
    /// eventually be reclaimed by another worker).
    pub fn force_stop(&self) {
        warn!(worker_id = %self.id, "force stop requested");
        self.force_stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the main loop to exit.
    pub async fn join(&mut self) {
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }
    }

    /// `request_stop` followed by `join`.
    pub async fn stop(&mut self) {
        self.request_stop();
        self.join().await;
    }
}

/// The data the spawned main-loop task owns; split out of `Worker` so
/// `Worker` itself doesn't need to be `'static` to call `start`.
struct RunState<S: Store> {
    id: WorkerId,
    tags: Vec<Tag>,
    controller: Controller<S>,
    job_fn: Arc<JobFn>,
    interrupt_mode: InterruptMode,
    timings: WorkerTimings,
    stop: Arc<AtomicBool>,
    force_stop: Arc<AtomicBool>,
}

type TaskHandle = JoinHandle<Result<(), JobError>>;

impl<S: Store + 'static> RunState<S> {
    async fn run(self) {
        let mut job_ctx: Option<Arc<JobContext>> = None;
        let mut task_handle: Option<TaskHandle> = None;
        let mut retry_delay_secs: u64 = 0;

        loop {
            if self.stop.load(Ordering::SeqCst) && job_ctx.is_none() {
                break;
            }
            if self.force_stop.load(Ordering::SeqCst) {
                break;
            }

            if retry_delay_secs > 0 {
                sleep(StdDuration::from_secs(retry_delay_secs)).await;
            }

            let result = self.step(&mut job_ctx, &mut task_handle).await;
            match result {
                Err(ControllerError::Retriable(e)) => {
                    warn!(worker_id = %self.id, error = %e, delay = retry_delay_secs, "retriable store error, backing off");
                    retry_delay_secs = if retry_delay_secs == 0 {
                        1
                    } else {
                        (retry_delay_secs * 2).min(10)
                    };
                }
                _ => retry_delay_secs = 0,
            }
        }

        info!(worker_id = %self.id, "worker loop exited");
    }

    async fn step(
        &self,
        job_ctx: &mut Option<Arc<JobContext>>,
        task_handle: &mut Option<TaskHandle>,
    ) -> Result<(), ControllerError> {
        // Snapshot which branch applies via a cheap Arc clone, so the match
        // doesn't hold a borrow of `job_ctx` while the chosen branch also
        // needs to mutate it (e.g. to clear it once a job is done).
        let current = job_ctx.clone();

        match current {
            None => self.try_acquire(job_ctx, task_handle).await,

            Some(ctx) if ctx.is_outdated() => self.try_update_current_job(&ctx).await,

            Some(ctx) if ctx.cancelled() || ctx.revoked() => {
                self.wait_for_task_and_cleanup(job_ctx, task_handle).await
            }

            Some(ctx) if task_handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false) => {
                self.try_heartbeat(&ctx).await
            }

            Some(ctx) if ctx.requeue_requested() => {
                self.try_requeue(job_ctx, task_handle, ctx).await
            }

            Some(_) => self.try_finalize(job_ctx, task_handle).await,
        }
    }

    async fn try_acquire(
        &self,
        job_ctx: &mut Option<Arc<JobContext>>,
        task_handle: &mut Option<TaskHandle>,
    ) -> Result<(), ControllerError> {
        let acquired = self.controller.acquire_job(&self.tags, &self.id).await?;

        match acquired {
            Some(job) => {
                info!(worker_id = %self.id, job_id = %job.id, "acquired job");
                let ctx = JobContext::new(self.id.clone(), job);
                let channel = JobChannel::new(ctx.clone());
                let job_fn = self.job_fn.clone();
                *task_handle = Some(tokio::task::spawn_blocking(move || {
                    run_job_fn(job_fn, channel)
                }));
                *job_ctx = Some(ctx);
                Ok(())
            }
            None => {
                sleep(jittered(self.timings.poll_interval)).await;
                Ok(())
            }
        }
    }

    async fn try_update_current_job(&self, ctx: &Arc<JobContext>) -> Result<(), ControllerError> {
        let job = self.controller.get_job(&ctx.job_id()).await?;
        if let Some(job) = job {
            ctx.refresh(job);
        }
        if ctx.cancelled() {
            info!(worker_id = %self.id, job_id = %ctx.job_id(), "job was cancelled");
        }
        if ctx.revoked() {
            info!(worker_id = %self.id, job_id = %ctx.job_id(), "job was taken from us");
        }
        Ok(())
    }

    async fn wait_for_task_and_cleanup(
        &self,
        job_ctx: &mut Option<Arc<JobContext>>,
        task_handle: &mut Option<TaskHandle>,
    ) -> Result<(), ControllerError> {
        let ctx = job_ctx.as_ref().expect("job_ctx present in this branch").clone();
        let still_running = task_handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false);

        if still_running {
            if self.interrupt_mode == InterruptMode::Async && ctx.mark_interrupt_injected() {
                info!(worker_id = %self.id, job_id = %ctx.job_id(), "injecting best-effort interrupt");
            }
            sleep(jittered(self.timings.heartbeat_interval)).await;
        } else {
            info!(worker_id = %self.id, job_id = %ctx.job_id(), "processing was terminated");
            if let Some(handle) = task_handle.take() {
                let _ = handle.await;
            }
            *job_ctx = None;
        }
        Ok(())
    }

    async fn try_heartbeat(&self, ctx: &Arc<JobContext>) -> Result<(), ControllerError> {
        match self
            .controller
            .heartbeat_job(&ctx.job_id(), ctx.version())
            .await
        {
            Ok(job) => {
                ctx.refresh(job);
                sleep(jittered(self.timings.heartbeat_interval)).await;
                Ok(())
            }
            Err(ControllerError::Concurrency { .. }) => {
                ctx.mark_outdated();
                info!(worker_id = %self.id, job_id = %ctx.job_id(), "heartbeat lost (version mismatch)");
                Ok(())
            }
            Err(e @ ControllerError::Retriable(_)) => Err(e),
        }
    }

    async fn try_requeue(
        &self,
        job_ctx: &mut Option<Arc<JobContext>>,
        task_handle: &mut Option<TaskHandle>,
        ctx: Arc<JobContext>,
    ) -> Result<(), ControllerError> {
        debug_assert!(task_handle.as_ref().map(|h| h.is_finished()).unwrap_or(true));
        let run_at = ctx.take_requeue().and_then(|r| r.run_at);

        match self
            .controller
            .requeue_job(&ctx.job_id(), ctx.version(), run_at)
            .await
        {
            Ok(_) => {
                info!(worker_id = %self.id, job_id = %ctx.job_id(), "job requeued");
                if let Some(handle) = task_handle.take() {
                    let _ = handle.await;
                }
                *job_ctx = None;
                Ok(())
            }
            Err(ControllerError::Concurrency { .. }) => {
                ctx.mark_outdated();
                info!(worker_id = %self.id, job_id = %ctx.job_id(), "failed to requeue job (version mismatch)");
                Ok(())
            }
            Err(e @ ControllerError::Retriable(_)) => Err(e),
        }
    }

    async fn try_finalize(
        &self,
        job_ctx: &mut Option<Arc<JobContext>>,
        task_handle: &mut Option<TaskHandle>,
    ) -> Result<(), ControllerError> {
        let ctx = job_ctx.as_ref().expect("job_ctx present in this branch").clone();
        debug_assert!(task_handle.as_ref().map(|h| h.is_finished()).unwrap_or(true));

        let outcome = match task_handle.take() {
            Some(handle) => handle.await,
            None => return Ok(()),
        };

        let worker_exception = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(JobError::Failed(err))) => Some(WorkerException {
                reason: err.to_string(),
                traceback: format!("{err:?}"),
            }),
            Ok(Err(JobError::Interrupted)) | Ok(Err(JobError::Requeued { .. })) => None,
            Err(join_err) => Some(WorkerException {
                reason: "worker task panicked".to_string(),
                traceback: join_err.to_string(),
            }),
        };

        match self
            .controller
            .finalize_job(&ctx.job_id(), ctx.version(), worker_exception)
            .await
        {
            Ok(_) => {
                info!(worker_id = %self.id, job_id = %ctx.job_id(), "job finalized");
                *job_ctx = None;
                Ok(())
            }
            Err(ControllerError::Concurrency { .. }) => {
                ctx.mark_outdated();
                info!(worker_id = %self.id, job_id = %ctx.job_id(), "failed to finalize job (version mismatch)");
                Ok(())
            }
            Err(e @ ControllerError::Retriable(_)) => Err(e),
        }
    }
}

/// Runs the user's job body, converting a panic into `JobError::Failed` the
/// same way the original implementation's `WorkerThread.run` captures
/// `sys.exc_info()` for any exception other than the two control-flow ones.
fn run_job_fn(job_fn: Arc<JobFn>, channel: JobChannel) -> Result<(), JobError> {
    match catch_unwind(AssertUnwindSafe(|| job_fn(&channel))) {
        Ok(result) => result,
        Err(panic) => {
            let reason = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "job body panicked with a non-string payload".to_string()
            };
            Err(JobError::Failed(anyhow::anyhow!(reason)))
        }
    }
}
