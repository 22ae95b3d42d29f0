//! Job worker: polls the queue for due jobs and hands them to handlers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::JobWorkerConfig;
use crate::error::DatabaseError;
use crate::queue::{Job, JobHandler};
use crate::store::JobQueue;

/// Outcome of one polling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkReport {
    pub completed: usize,
    pub retried: usize,
    pub dead: usize,
}

/// Dispatches due jobs to the handler registered for their name.
pub struct JobWorker {
    queue: Arc<dyn JobQueue>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    config: JobWorkerConfig,
}

impl JobWorker {
    pub fn new(queue: Arc<dyn JobQueue>, config: JobWorkerConfig) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            config,
        }
    }

    /// Register the handler for `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Claim and process every job due at `now`, up to one batch.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<WorkReport, DatabaseError> {
        let jobs = self
            .queue
            .claim_due(now, self.config.batch_size, self.config.lease)
            .await?;

        let mut report = WorkReport::default();
        for job in jobs {
            self.process(&job, now, &mut report).await;
        }
        Ok(report)
    }

    async fn process(&self, job: &Job, now: DateTime<Utc>, report: &mut WorkReport) {
        let Some(handler) = self.handlers.get(&job.name) else {
            warn!(job_id = %job.id, name = %job.name, "No handler for job, dead-lettering");
            if let Err(e) = self.queue.fail(job.id, "no handler registered", None).await {
                error!(job_id = %job.id, error = %e, "Failed to dead-letter job");
            }
            report.dead += 1;
            return;
        };

        match handler.handle(job).await {
            Ok(()) => {
                debug!(job_id = %job.id, name = %job.name, "Job completed");
                if let Err(e) = self.queue.complete(job.id).await {
                    // The lease will run out and the job will be delivered again.
                    error!(job_id = %job.id, error = %e, "Failed to acknowledge job");
                }
                report.completed += 1;
            }
            Err(e) => {
                let message = e.to_string();
                if job.attempts >= self.config.max_attempts {
                    warn!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = %message,
                        "Job exhausted its attempts"
                    );
                    if let Err(e) = self.queue.fail(job.id, &message, None).await {
                        error!(job_id = %job.id, error = %e, "Failed to dead-letter job");
                    }
                    report.dead += 1;
                } else {
                    let retry_at = now + self.config.backoff_for(job.attempts);
                    warn!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        retry_at = %retry_at,
                        error = %message,
                        "Job failed, will retry"
                    );
                    if let Err(e) = self.queue.fail(job.id, &message, Some(retry_at)).await {
                        error!(job_id = %job.id, error = %e, "Failed to reschedule job");
                    }
                    report.retried += 1;
                }
            }
        }
    }

    /// Poll until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            handlers = self.handlers.len(),
            "Job worker started"
        );
        let mut tick = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!(error = %e, "Failed to poll job queue");
                    }
                }
            }
        }
        info!("Job worker stopped");
    }
}

/// Spawn the worker loop on the runtime.
pub fn spawn_job_worker(worker: Arc<JobWorker>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move { worker.run(cancel).await })
}
