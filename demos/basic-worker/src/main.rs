//! Minimal producer + worker example, the Rust analogue of the original
//! implementation's `example-worker.py`: start a worker listening on one
//! tag, enqueue a single job, and let the job body requeue itself a few
//! times before the process is asked to stop.

use std::time::Duration;

use chrono::Utc;
use joblease_core::{JobChannel, JobError, Tag, Worker, WorkerId};
use joblease_testing::fresh_controller;
use tracing::info;

fn work_func(channel: &JobChannel) -> Result<(), JobError> {
    let job = channel.job();
    info!(job_id = %job.id, locked_at = ?job.locked_at, args = %job.args, "got job");

    if channel.cancelled() {
        return Err(channel.requeue_job(None).into());
    }

    Err(channel
        .requeue_job(Some(Utc::now() + chrono::Duration::seconds(3)))
        .into())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let controller = fresh_controller();

    let mut worker = Worker::new(
        WorkerId::new("example-worker"),
        vec![Tag::new("example-tag")],
        work_func,
        controller.clone(),
    );
    worker.start();

    let job_id = controller.create_job_id();
    controller
        .create_job(&job_id, &Tag::new("example-tag"), Some(serde_json::json!({"payload": 42})), None)
        .await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = tokio::time::sleep(Duration::from_secs(15)) => {
            info!("demo window elapsed");
        }
    }

    worker.stop().await;
    Ok(())
}
