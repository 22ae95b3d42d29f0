//! Task operations behind each chat command.
//!
//! Every operation parses its argument text before touching the store and
//! returns the reply to send. Parse failures come back as `ValidationError`
//! with nothing written.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, Error, TaskError, ValidationError};
use crate::reminders::ReminderScheduler;
use crate::store::TaskStore;
use crate::tasks::format;
use crate::tasks::model::{
    MAX_DIFFICULTY, MIN_DIFFICULTY, Task, TaskFilter, TaskOrder, TaskPatch, TaskStatistics,
    format_deadline, parse_deadline,
};

const ADD_USAGE: &str = "/add <description> | <difficulty 1-5>";
const EDIT_USAGE: &str = "/edit <old description> | <new description>";
const SET_DEADLINE_USAGE: &str = "/set_deadline <description> | <YYYY-MM-DD HH:MM>";

/// Command handlers over the task store.
#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    reminders: ReminderScheduler,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>, reminders: ReminderScheduler) -> Self {
        Self { store, reminders }
    }

    /// `description` or `description | difficulty`.
    pub async fn add(&self, chat_id: i64, text: &str) -> Result<String, Error> {
        let (description, difficulty) = parse_add(text)?;

        if self.exists(chat_id, &description).await? {
            return Err(TaskError::Duplicate { description }.into());
        }

        let mut task = Task::new(chat_id, &description);
        task.difficulty = difficulty;
        self.store
            .insert_task(&task)
            .await
            .map_err(|e| duplicate_or(e, &description))?;

        info!(chat_id, description = %description, ?difficulty, "Task added");
        Ok("Task added!".to_string())
    }

    /// `old | new`.
    pub async fn edit(&self, chat_id: i64, text: &str, now: DateTime<Utc>) -> Result<String, Error> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::MissingArgument {
                prompt: "Send the old and the new description as: old | new",
            }
            .into());
        }
        let (old, new) = split_pair(text, EDIT_USAGE)?;
        if old.is_empty() || new.is_empty() {
            return Err(
                ValidationError::EmptyField("Both the old and the new description are required.")
                    .into(),
            );
        }

        if old != new && self.exists(chat_id, new).await? {
            return Err(TaskError::Duplicate {
                description: new.to_string(),
            }
            .into());
        }

        let modified = self
            .store
            .update_task(
                &TaskFilter::chat(chat_id).description(old),
                &TaskPatch::default().description(new),
            )
            .await
            .map_err(|e| duplicate_or(e, new))?;
        if modified == 0 {
            return Err(TaskError::NotFoundOrUnchanged.into());
        }

        info!(chat_id, old = %old, new = %new, "Task renamed");

        // The rename is committed; a reminder that fails to follow it is
        // picked up again by the next scan.
        if let Err(e) = self.rekey_reminder(chat_id, old, new, now).await {
            error!(chat_id, old = %old, new = %new, error = %e, "Failed to move reminder after rename");
        }
        Ok("Task updated!".to_string())
    }

    /// The reminder is keyed by description, so it moves with a rename.
    async fn rekey_reminder(
        &self,
        chat_id: i64,
        old: &str,
        new: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.reminders.cancel(chat_id, old).await?;
        if let Some(task) = self.find_one(chat_id, new).await? {
            let fire_at = self.reminders.schedule(&task, now).await?;
            if let (true, Some(at)) = (task.reminder_enabled, fire_at) {
                self.reminders.record(&task, at).await?;
            }
        }
        Ok(())
    }

    /// `description | YYYY-MM-DD HH:MM`.
    pub async fn set_deadline(
        &self,
        chat_id: i64,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<String, Error> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::MissingArgument {
                prompt: "Send the task description and the deadline as: description | YYYY-MM-DD HH:MM",
            }
            .into());
        }
        let (description, date) = split_pair(text, SET_DEADLINE_USAGE)?;
        if description.is_empty() {
            return Err(ValidationError::EmptyField("Please give the task description.").into());
        }
        let deadline = parse_deadline(date)?;

        let modified = self
            .store
            .update_task(
                &TaskFilter::chat(chat_id).description(description),
                &TaskPatch::default().deadline(deadline),
            )
            .await?;
        if modified == 0 {
            return Err(TaskError::NotFoundOrUnchanged.into());
        }

        if let Some(task) = self.find_one(chat_id, description).await? {
            self.reminders.schedule(&task, now).await?;
        }

        info!(chat_id, description = %description, deadline = %deadline, "Deadline set");
        Ok(format!("Deadline set to {}!", format_deadline(deadline)))
    }

    /// Deletes the first task whose deadline is exactly `YYYY-MM-DD HH:MM`.
    pub async fn delete(&self, chat_id: i64, text: &str) -> Result<String, Error> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::MissingArgument {
                prompt: "Send the deadline of the task to delete as YYYY-MM-DD HH:MM.",
            }
            .into());
        }
        let deadline = parse_deadline(text)?;
        let filter = TaskFilter::chat(chat_id).deadline(deadline);

        let target = self
            .store
            .find_tasks(&filter, TaskOrder::Natural)
            .await?
            .into_iter()
            .next();

        let deleted = self.store.delete_task(&filter).await?;
        if deleted == 0 {
            return Err(TaskError::NotFoundOrUnchanged.into());
        }

        if let Some(task) = target {
            self.reminders.cancel(chat_id, &task.description).await?;
            info!(chat_id, description = %task.description, "Task deleted");
        }
        Ok("Task deleted!".to_string())
    }

    /// Marks a task completed and switches its reminder off.
    pub async fn mark_done(&self, chat_id: i64, text: &str) -> Result<String, Error> {
        let description = text.trim();
        if description.is_empty() {
            return Err(ValidationError::MissingArgument {
                prompt: "Send the description of the task to mark as done.",
            }
            .into());
        }

        let modified = self
            .store
            .update_task(
                &TaskFilter::chat(chat_id).description(description),
                &TaskPatch::default().completed(true).reminder_enabled(false),
            )
            .await?;
        if modified == 0 {
            return Err(TaskError::NotFoundOrUnchanged.into());
        }

        self.reminders.cancel(chat_id, description).await?;
        info!(chat_id, description = %description, "Task completed");
        Ok("Task done!".to_string())
    }

    /// Turns the deadline reminder on or off.
    pub async fn toggle_reminder(
        &self,
        chat_id: i64,
        text: &str,
        enable: bool,
        now: DateTime<Utc>,
    ) -> Result<String, Error> {
        let description = text.trim();
        if description.is_empty() {
            return Err(ValidationError::MissingArgument {
                prompt: "Send the task description.",
            }
            .into());
        }

        let modified = self
            .store
            .update_task(
                &TaskFilter::chat(chat_id).description(description),
                &TaskPatch::default().reminder_enabled(enable),
            )
            .await?;
        if modified == 0 {
            return Err(TaskError::NotFoundOrUnchanged.into());
        }

        if !enable {
            self.reminders.forget(chat_id, description).await?;
            info!(chat_id, description = %description, "Reminder disabled");
            return Ok("Reminder cancelled!".to_string());
        }

        let Some(task) = self.find_one(chat_id, description).await? else {
            warn!(chat_id, description = %description, "Task vanished after enabling reminder");
            return Err(TaskError::NotFoundOrUnchanged.into());
        };

        info!(chat_id, description = %description, "Reminder enabled");
        match self.reminders.schedule(&task, now).await? {
            Some(fire_at) => {
                self.reminders.record(&task, fire_at).await?;
                Ok(format!(
                    "Reminder set! You'll be reminded at {}.",
                    format_deadline(fire_at)
                ))
            }
            None => Ok(
                "Reminder set! It will fire once the task has a future deadline.".to_string(),
            ),
        }
    }

    /// Every task of the chat, in insertion or deadline order.
    pub async fn list(
        &self,
        chat_id: i64,
        order: TaskOrder,
        now: DateTime<Utc>,
    ) -> Result<String, Error> {
        let tasks = self
            .store
            .find_tasks(&TaskFilter::chat(chat_id), order)
            .await?;
        debug!(chat_id, count = tasks.len(), ?order, "Listing tasks");
        Ok(format::render_list(&tasks, now))
    }

    pub async fn stats(&self, chat_id: i64, now: DateTime<Utc>) -> Result<String, Error> {
        let tasks = self
            .store
            .find_tasks(&TaskFilter::chat(chat_id), TaskOrder::Natural)
            .await?;
        Ok(format::render_stats(&TaskStatistics::from_tasks(&tasks, now)))
    }

    pub async fn analyze(&self, chat_id: i64) -> Result<String, Error> {
        let buckets = self.store.difficulty_breakdown(chat_id).await?;
        Ok(format::render_analysis(&buckets))
    }

    async fn find_one(&self, chat_id: i64, description: &str) -> Result<Option<Task>, Error> {
        Ok(self
            .store
            .find_tasks(
                &TaskFilter::chat(chat_id).description(description),
                TaskOrder::Natural,
            )
            .await?
            .into_iter()
            .next())
    }

    async fn exists(&self, chat_id: i64, description: &str) -> Result<bool, Error> {
        Ok(self.find_one(chat_id, description).await?.is_some())
    }
}

/// Parse `/add` arguments: a description with an optional `| difficulty`.
pub fn parse_add(text: &str) -> Result<(String, Option<u8>), ValidationError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ValidationError::MissingArgument {
            prompt: "Please send the task description.",
        });
    }

    let (description, difficulty) = match text.split_once('|') {
        None => (text, None),
        Some((description, raw)) => {
            let difficulty = raw
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|d| (MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(d))
                .ok_or(ValidationError::InvalidDifficulty)?;
            (description.trim(), Some(difficulty))
        }
    };

    if description.is_empty() {
        return Err(ValidationError::MissingSeparator { usage: ADD_USAGE });
    }
    Ok((description.to_string(), difficulty))
}

/// Split `left | right` and trim both halves.
fn split_pair<'a>(
    text: &'a str,
    usage: &'static str,
) -> Result<(&'a str, &'a str), ValidationError> {
    text.split_once('|')
        .map(|(left, right)| (left.trim(), right.trim()))
        .ok_or(ValidationError::MissingSeparator { usage })
}

fn duplicate_or(e: DatabaseError, description: &str) -> Error {
    match e {
        DatabaseError::Constraint(_) => TaskError::Duplicate {
            description: description.to_string(),
        }
        .into(),
        other => other.into(),
    }
}
