//! Deadline scanner: pushes overdue deadlines forward and keeps reminder
//! jobs queued for upcoming ones.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channels::Channel;
use crate::config::ScannerConfig;
use crate::error::DatabaseError;
use crate::reminders::ReminderScheduler;
use crate::store::{KeyValueStore, TaskStore};
use crate::tasks::model::{Task, TaskFilter, TaskOrder, TaskPatch, format_deadline};

/// Counts from one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Tasks with a deadline that were examined.
    pub scanned: usize,
    /// Overdue deadlines moved forward.
    pub rescheduled: usize,
    /// "Upcoming deadline" messages sent.
    pub notified: usize,
    /// Reminder jobs queued or refreshed.
    pub enqueued: usize,
    /// Sends or enqueues that failed and were skipped.
    pub failures: usize,
}

pub struct DeadlineScanner {
    tasks: Arc<dyn TaskStore>,
    kv: Arc<dyn KeyValueStore>,
    reminders: ReminderScheduler,
    channel: Arc<dyn Channel>,
    config: ScannerConfig,
}

impl DeadlineScanner {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        kv: Arc<dyn KeyValueStore>,
        reminders: ReminderScheduler,
        channel: Arc<dyn Channel>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            tasks,
            kv,
            reminders,
            channel,
            config,
        }
    }

    /// Run one pass over every task in every chat.
    ///
    /// Overdue deadlines roll forward whether or not the task is done;
    /// reminders are only queued for open tasks. A failed read or deadline
    /// rewrite aborts the pass; a failed send or enqueue only skips that task.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<ScanReport, DatabaseError> {
        let tasks = self
            .tasks
            .find_tasks(&TaskFilter::all(), TaskOrder::Natural)
            .await?;

        let mut report = ScanReport::default();
        for task in tasks {
            if task.deadline.is_none() {
                continue;
            }
            report.scanned += 1;

            if task.is_overdue_at(now) {
                self.reschedule(&task, now, &mut report).await?;
            } else if !task.completed {
                self.refresh(&task, now, &mut report).await;
            }
        }

        if let Err(e) = self.kv.purge_expired().await {
            warn!(error = %e, "Failed to purge expired keys");
        }

        Ok(report)
    }

    async fn reschedule(
        &self,
        task: &Task,
        now: DateTime<Utc>,
        report: &mut ScanReport,
    ) -> Result<(), DatabaseError> {
        let new_deadline = (now + self.config.reschedule_by).trunc_subsecs(0);
        let modified = self
            .tasks
            .update_task(&task.identity(), &TaskPatch::default().deadline(new_deadline))
            .await?;
        if modified == 0 {
            warn!(
                chat_id = task.chat_id,
                description = %task.description,
                "Overdue task changed during scan, not rescheduled"
            );
            return Ok(());
        }
        report.rescheduled += 1;
        info!(
            chat_id = task.chat_id,
            description = %task.description,
            deadline = %new_deadline,
            "Overdue deadline pushed forward"
        );

        let text = format!(
            "The deadline for \"{}\" has passed. It was moved to {}.",
            task.description,
            format_deadline(new_deadline)
        );
        if let Err(e) = self.channel.send(task.chat_id, &text).await {
            error!(chat_id = task.chat_id, error = %e, "Failed to send reschedule notice");
            report.failures += 1;
        }

        // Replaces a reminder that fell due but was not delivered yet; the
        // notice above takes its place.
        let moved = task.clone().with_deadline(new_deadline);
        self.enqueue(&moved, now, report).await;
        Ok(())
    }

    async fn refresh(&self, task: &Task, now: DateTime<Utc>, report: &mut ScanReport) {
        if self.config.repeat_upcoming_notice && task.reminder_enabled {
            if let Some(left) = task.time_left(now) {
                let text = format!(
                    "Reminder: the deadline for \"{}\" is coming up ({left} left).",
                    task.description
                );
                match self.channel.send(task.chat_id, &text).await {
                    Ok(()) => report.notified += 1,
                    Err(e) => {
                        error!(chat_id = task.chat_id, error = %e, "Failed to send upcoming notice");
                        report.failures += 1;
                    }
                }
            }
        }
        self.enqueue(task, now, report).await;
    }

    async fn enqueue(&self, task: &Task, now: DateTime<Utc>, report: &mut ScanReport) {
        match self.reminders.schedule(task, now).await {
            Ok(Some(_)) => report.enqueued += 1,
            Ok(None) => {}
            Err(e) => {
                error!(
                    chat_id = task.chat_id,
                    description = %task.description,
                    error = %e,
                    "Failed to queue reminder"
                );
                report.failures += 1;
            }
        }
    }

    /// Scan on every tick until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Deadline scanner started"
        );
        let mut tick = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    match self.scan_once(Utc::now()).await {
                        Ok(report) => debug!(?report, "Deadline scan finished"),
                        Err(e) => error!(error = %e, "Deadline scan aborted"),
                    }
                }
            }
        }
        info!("Deadline scanner stopped");
    }
}

/// Spawn the scanner loop on the runtime.
pub fn spawn_scanner(scanner: Arc<DeadlineScanner>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move { scanner.run(cancel).await })
}
