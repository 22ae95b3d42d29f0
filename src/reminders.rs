//! Deadline reminders: one queued job per task deadline.
//!
//! Every path that moves a deadline (scanner, set-deadline, enabling a
//! reminder, overdue reschedule) upserts the same keyed job; delete,
//! mark-done and rename cancel it. The handler re-reads the task when the
//! job fires and only sends if the snapshot still describes it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::channels::Channel;
use crate::error::{DatabaseError, Error};
use crate::queue::{Job, JobHandler, NewJob};
use crate::store::{JobQueue, KeyValueStore, TaskStore};
use crate::tasks::model::{Task, TaskOrder, format_deadline};

/// Job name for deadline reminders.
pub const REMINDER_JOB: &str = "reminder:send";

/// Queue key and bookkeeping key for one task's reminder.
pub fn reminder_key(chat_id: i64, description: &str) -> String {
    format!("reminder:{chat_id}:{description}")
}

/// Job payload: the task as it was when the job was scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub task: Task,
}

/// Keeps the reminder job queue in step with task deadlines.
#[derive(Clone)]
pub struct ReminderScheduler {
    queue: Arc<dyn JobQueue>,
    kv: Arc<dyn KeyValueStore>,
}

impl ReminderScheduler {
    pub fn new(queue: Arc<dyn JobQueue>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self { queue, kv }
    }

    /// Queue (or replace) the reminder for `task`'s deadline.
    ///
    /// Returns the fire time, or `None` when the task has no future deadline
    /// or is completed, in which case any queued reminder is cancelled.
    pub async fn schedule(
        &self,
        task: &Task,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let key = reminder_key(task.chat_id, &task.description);
        let deadline = match task.deadline {
            Some(deadline) if deadline > now && !task.completed => deadline,
            _ => {
                self.queue.cancel(&key).await?;
                return Ok(None);
            }
        };

        let job = NewJob::new(REMINDER_JOB, &ReminderPayload { task: task.clone() }, deadline)?
            .with_unique_key(key);
        self.queue.enqueue(&job).await?;
        Ok(Some(deadline))
    }

    /// Record that the user asked for a reminder at `fire_at`.
    pub async fn record(&self, task: &Task, fire_at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.kv
            .set(
                &reminder_key(task.chat_id, &task.description),
                &fire_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                None,
            )
            .await
    }

    /// Remove the bookkeeping entry written by `record`.
    pub async fn forget(&self, chat_id: i64, description: &str) -> Result<(), DatabaseError> {
        self.kv.delete(&reminder_key(chat_id, description)).await?;
        Ok(())
    }

    /// Drop the queued job and the bookkeeping entry for one task.
    pub async fn cancel(&self, chat_id: i64, description: &str) -> Result<bool, DatabaseError> {
        let removed = self
            .queue
            .cancel(&reminder_key(chat_id, description))
            .await?;
        self.forget(chat_id, description).await?;
        Ok(removed)
    }
}

/// Sends the reminder when a deadline job fires.
pub struct ReminderJobHandler {
    tasks: Arc<dyn TaskStore>,
    channel: Arc<dyn Channel>,
}

impl ReminderJobHandler {
    pub fn new(tasks: Arc<dyn TaskStore>, channel: Arc<dyn Channel>) -> Self {
        Self { tasks, channel }
    }
}

pub fn reminder_text(task: &Task) -> String {
    match task.deadline {
        Some(deadline) => format!(
            "⏰ Reminder: the deadline for \"{}\" is now ({}).",
            task.description,
            format_deadline(deadline)
        ),
        None => format!("⏰ Reminder: \"{}\"", task.description),
    }
}

#[async_trait]
impl JobHandler for ReminderJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), Error> {
        let payload: ReminderPayload = job.decode()?;
        let snapshot = payload.task;

        let current = self
            .tasks
            .find_tasks(&snapshot.identity(), TaskOrder::Natural)
            .await?
            .into_iter()
            .next();

        let Some(task) = current else {
            debug!(job_id = %job.id, chat_id = snapshot.chat_id, "Reminder for deleted task, skipping");
            return Ok(());
        };
        if task.completed || !task.reminder_enabled || task.deadline != snapshot.deadline {
            debug!(
                job_id = %job.id,
                chat_id = task.chat_id,
                description = %task.description,
                "Reminder no longer applies, skipping"
            );
            return Ok(());
        }

        self.channel
            .send(task.chat_id, &reminder_text(&task))
            .await?;
        info!(chat_id = task.chat_id, description = %task.description, "Reminder sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::channels::MessageStream;
    use crate::error::ChannelError;
    use crate::queue::JobStatus;
    use crate::store::LibSqlBackend;

    /// Records every send.
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn start(&self) -> Result<MessageStream, ChannelError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn send(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn health_check(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    async fn setup() -> (Arc<LibSqlBackend>, ReminderScheduler) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let scheduler = ReminderScheduler::new(db.clone(), db.clone());
        (db, scheduler)
    }

    fn job_for(task: &Task) -> Job {
        Job {
            id: uuid::Uuid::new_v4(),
            name: REMINDER_JOB.into(),
            unique_key: Some(reminder_key(task.chat_id, &task.description)),
            payload: serde_json::to_value(ReminderPayload { task: task.clone() }).unwrap(),
            fire_at: task.deadline.unwrap(),
            status: JobStatus::Running,
            attempts: 1,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn schedule_queues_one_job_per_deadline() {
        let (db, scheduler) = setup().await;
        let now = at(2030, 1, 1, 0, 0);
        let task = Task::new(1, "A").with_deadline(at(2030, 1, 2, 9, 0));

        assert_eq!(scheduler.schedule(&task, now).await.unwrap(), task.deadline);
        let moved = task.clone().with_deadline(at(2030, 1, 3, 9, 0));
        scheduler.schedule(&moved, now).await.unwrap();

        let job = db.find_by_key("reminder:1:A").await.unwrap().unwrap();
        assert_eq!(job.name, REMINDER_JOB);
        assert_eq!(job.fire_at, at(2030, 1, 3, 9, 0));
        assert_eq!(job.decode::<ReminderPayload>().unwrap().task, moved);
    }

    #[tokio::test]
    async fn past_or_missing_deadline_cancels() {
        let (db, scheduler) = setup().await;
        let now = at(2030, 1, 1, 0, 0);
        let task = Task::new(1, "A").with_deadline(at(2030, 1, 2, 9, 0));
        scheduler.schedule(&task, now).await.unwrap();

        let past = task.clone().with_deadline(at(2029, 1, 1, 0, 0));
        assert_eq!(scheduler.schedule(&past, now).await.unwrap(), None);
        assert!(db.find_by_key("reminder:1:A").await.unwrap().is_none());

        assert_eq!(scheduler.schedule(&Task::new(1, "B"), now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn record_and_cancel_bookkeeping() {
        let (db, scheduler) = setup().await;
        let now = at(2030, 1, 1, 0, 0);
        let task = Task::new(1, "A").with_deadline(at(2030, 1, 2, 9, 0));
        scheduler.schedule(&task, now).await.unwrap();
        scheduler.record(&task, at(2030, 1, 2, 9, 0)).await.unwrap();
        assert_eq!(
            db.get("reminder:1:A").await.unwrap().as_deref(),
            Some("2030-01-02T09:00:00Z")
        );

        assert!(scheduler.cancel(1, "A").await.unwrap());
        assert!(db.get("reminder:1:A").await.unwrap().is_none());
        assert!(db.find_by_key("reminder:1:A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn handler_sends_when_snapshot_still_matches() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let channel = Arc::new(RecordingChannel::default());
        let handler = ReminderJobHandler::new(db.clone(), channel.clone());

        let mut task = Task::new(9, "Pay rent").with_deadline(at(2030, 1, 1, 9, 0));
        task.reminder_enabled = true;
        db.insert_task(&task).await.unwrap();

        handler.handle(&job_for(&task)).await.unwrap();
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 9);
        assert!(sent[0].1.contains("Pay rent"));
    }

    #[tokio::test]
    async fn handler_skips_stale_reminders() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let channel = Arc::new(RecordingChannel::default());
        let handler = ReminderJobHandler::new(db.clone(), channel.clone());

        let mut task = Task::new(9, "Pay rent").with_deadline(at(2030, 1, 1, 9, 0));
        task.reminder_enabled = true;

        // Deleted task.
        handler.handle(&job_for(&task)).await.unwrap();

        // Reminder switched off.
        let mut quiet = task.clone();
        quiet.reminder_enabled = false;
        db.insert_task(&quiet).await.unwrap();
        handler.handle(&job_for(&task)).await.unwrap();

        // Deadline moved since the job was queued.
        let stale = task.clone().with_deadline(task.deadline.unwrap() - Duration::days(1));
        handler.handle(&job_for(&stale)).await.unwrap();

        assert!(channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_rejects_bad_payload() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let handler = ReminderJobHandler::new(db.clone(), Arc::new(RecordingChannel::default()));
        let mut job = job_for(&Task::new(1, "A").with_deadline(at(2030, 1, 1, 0, 0)));
        job.payload = serde_json::json!({ "nope": true });
        assert!(handler.handle(&job).await.is_err());
    }
}
