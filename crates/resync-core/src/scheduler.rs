//! Cron-driven orchestration of pipeline runs.
//!
//! Each enabled `(source, operation)` pair gets one [`RunSlot`]; a tick that
//! finds the slot busy is dropped, never queued.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::models::Operation;
use crate::pipeline::SourcePipeline;
use crate::sync::RunStats;

/// Turns a five-field cron expression into the six-field form (leading
/// seconds) the scheduler expects.
pub fn normalize_cron(expr: &str) -> Result<String, AppError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 => Ok(fields.join(" ")),
        n => Err(AppError::Config(format!(
            "cron expression '{}' has {} fields, expected 5 or 6",
            expr, n
        ))),
    }
}

/// At most one in-flight run per slot.
#[derive(Debug, Clone, Default)]
pub struct RunSlot(Arc<Mutex<()>>);

impl RunSlot {
    /// Runs `work` unless a previous run still holds the slot, in which case
    /// `work` is dropped unpolled and `None` returned.
    pub async fn try_run<F, T>(&self, work: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let _guard = self.0.clone().try_lock_owned().ok()?;
        Some(work.await)
    }
}

/// Fires one scheduled run. Failures are logged here and go no further, so
/// one source can never take down another's schedule.
pub async fn fire(pipeline: &SourcePipeline, op: Operation, slot: &RunSlot) -> Option<RunStats> {
    match slot.try_run(pipeline.run(op)).await {
        None => {
            warn!(source = pipeline.name(), operation = %op, "Previous run still in flight, tick skipped");
            None
        }
        Some(Ok(stats)) => Some(stats),
        Some(Err(e)) => {
            error!(source = pipeline.name(), operation = %op, error = %e, "Scheduled run failed");
            None
        }
    }
}

pub struct Scheduler {
    inner: JobScheduler,
    jobs: usize,
}

impl Scheduler {
    pub async fn new() -> Result<Self, AppError> {
        let inner = JobScheduler::new()
            .await
            .map_err(|e| AppError::Scheduler(e.to_string()))?;
        Ok(Self { inner, jobs: 0 })
    }

    /// Registers every enabled operation of the pipeline's source. Any bad
    /// cron expression rejects the whole source before it is scheduled.
    pub async fn schedule(&mut self, pipeline: Arc<SourcePipeline>) -> Result<usize, AppError> {
        let mut jobs = Vec::new();
        for op in Operation::ALL {
            let slot = RunSlot::default();
            for expr in pipeline.source().cron.cron_strings(op) {
                let cron = normalize_cron(expr)?;
                let job_pipeline = pipeline.clone();
                let slot = slot.clone();
                let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                    let pipeline = job_pipeline.clone();
                    let slot = slot.clone();
                    Box::pin(async move {
                        fire(&pipeline, op, &slot).await;
                    })
                })
                .map_err(|e| {
                    AppError::Config(format!(
                        "source {}: invalid cron '{}' for {}: {}",
                        pipeline.name(),
                        expr,
                        op,
                        e
                    ))
                })?;
                jobs.push((op, expr.clone(), job));
            }
        }

        let added = jobs.len();
        for (op, expr, job) in jobs {
            self.inner
                .add(job)
                .await
                .map_err(|e| AppError::Scheduler(e.to_string()))?;
            info!(source = pipeline.name(), operation = %op, cron = %expr, "Scheduled");
        }
        self.jobs += added;
        Ok(added)
    }

    pub fn job_count(&self) -> usize {
        self.jobs
    }

    pub async fn start(&self) -> Result<(), AppError> {
        self.inner
            .start()
            .await
            .map_err(|e| AppError::Scheduler(e.to_string()))
    }

    pub async fn shutdown(&mut self) -> Result<(), AppError> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| AppError::Scheduler(e.to_string()))
    }
}
