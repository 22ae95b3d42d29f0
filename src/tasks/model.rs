//! Task data model: the record, store filters/patches, and derived statistics.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Input/output format for deadlines typed by users.
pub const DEADLINE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Format used when rendering deadlines inside task lists.
pub const DEADLINE_DISPLAY_FORMAT: &str = "%d %b %Y %H:%M";

/// Lowest accepted difficulty.
pub const MIN_DIFFICULTY: u8 = 1;

/// Highest accepted difficulty.
pub const MAX_DIFFICULTY: u8 = 5;

/// One task belonging to one chat.
///
/// `(chat_id, description)` is the logical identity of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Owning conversation.
    pub chat_id: i64,
    /// Free-text label, unique per chat.
    pub description: String,
    /// When the task was created. Never changes.
    pub created_at: DateTime<Utc>,
    /// Optional deadline. `None` is the "unset" state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Whether the task has been marked done.
    pub completed: bool,
    /// Whether deadline reminders are enabled.
    pub reminder_enabled: bool,
    /// Optional difficulty in `1..=5`, used only for analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<u8>,
}

impl Task {
    /// Create a new task with no deadline, not completed, reminders off.
    pub fn new(chat_id: i64, description: impl Into<String>) -> Self {
        Self {
            chat_id,
            description: description.into(),
            created_at: Utc::now().trunc_subsecs(0),
            deadline: None,
            completed: false,
            reminder_enabled: false,
            difficulty: None,
        }
    }

    /// Builder: set difficulty.
    pub fn with_difficulty(mut self, difficulty: u8) -> Self {
        self.difficulty = Some(difficulty);
        self
    }

    /// Builder: set deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Builder: set creation time.
    #[cfg(test)]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Whether the deadline is set and already reached at `now`.
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Remaining time until the deadline, if one is set and still in the future.
    pub fn time_left(&self, now: DateTime<Utc>) -> Option<TimeLeft> {
        let deadline = self.deadline?;
        if deadline <= now {
            return None;
        }
        Some(TimeLeft::from_duration(deadline - now))
    }

    /// Filter matching exactly this task.
    pub fn identity(&self) -> TaskFilter {
        TaskFilter::chat(self.chat_id).description(&self.description)
    }
}

/// Days/hours/minutes breakdown of a positive duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLeft {
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
}

impl TimeLeft {
    pub fn from_duration(d: Duration) -> Self {
        let total_hours = d.num_hours();
        Self {
            days: total_hours / 24,
            hours: total_hours % 24,
            minutes: d.num_minutes() % 60,
        }
    }
}

impl fmt::Display for TimeLeft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d {}h {}m", self.days, self.hours, self.minutes)
    }
}

/// Parse a user-supplied `YYYY-MM-DD HH:MM` deadline as UTC.
pub fn parse_deadline(text: &str) -> Result<DateTime<Utc>, ValidationError> {
    NaiveDateTime::parse_from_str(text.trim(), DEADLINE_FORMAT)
        .map(|ndt| ndt.and_utc())
        .map_err(|_| ValidationError::InvalidDate)
}

/// Format a deadline back into the `YYYY-MM-DD HH:MM` input form.
pub fn format_deadline(deadline: DateTime<Utc>) -> String {
    deadline.format(DEADLINE_FORMAT).to_string()
}

/// Selects tasks. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub chat_id: Option<i64>,
    pub description: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskFilter {
    /// Match every task in every chat.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match every task of one chat.
    pub fn chat(chat_id: i64) -> Self {
        Self {
            chat_id: Some(chat_id),
            ..Self::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Field updates applied by `update_task`. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub description: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub completed: Option<bool>,
    pub reminder_enabled: Option<bool>,
}

impl TaskPatch {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn reminder_enabled(mut self, enabled: bool) -> Self {
        self.reminder_enabled = Some(enabled);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.deadline.is_none()
            && self.completed.is_none()
            && self.reminder_enabled.is_none()
    }
}

/// Ordering for `find_tasks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskOrder {
    /// Insertion order.
    #[default]
    Natural,
    /// Ascending deadline; unset deadlines first.
    DeadlineAsc,
}

/// Per-chat statistics, computed on demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskStatistics {
    pub completed_on_time: usize,
    pub overdue: usize,
    pub average_deadline_days: f64,
}

impl TaskStatistics {
    /// Aggregate a chat's tasks.
    ///
    /// Only completed tasks with a deadline land in a bucket: past deadline
    /// counts as overdue, future deadline as on time. The average covers
    /// every task with a deadline, completed or not.
    pub fn from_tasks(tasks: &[Task], now: DateTime<Utc>) -> Self {
        let mut stats = Self::default();
        let mut total_days = 0.0;
        let mut with_deadline = 0usize;

        for task in tasks {
            let Some(deadline) = task.deadline else {
                continue;
            };
            with_deadline += 1;
            total_days += (deadline - task.created_at).num_seconds() as f64 / 86_400.0;

            if task.completed {
                if deadline < now {
                    stats.overdue += 1;
                } else {
                    stats.completed_on_time += 1;
                }
            }
        }

        if with_deadline > 0 {
            stats.average_deadline_days = total_days / with_deadline as f64;
        }
        stats
    }
}

/// One row of the per-difficulty breakdown.
#[derive(Debug, Clone, PartialEq)]
pub struct DifficultyBucket {
    pub difficulty: u8,
    pub count: u64,
    /// Mean whole-day span between creation and deadline. `None` when no task
    /// in the bucket has a deadline.
    pub average_deadline_days: Option<f64>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn new_task_defaults() {
        let task = Task::new(42, "Buy milk");
        assert_eq!(task.chat_id, 42);
        assert!(task.deadline.is_none());
        assert!(!task.completed);
        assert!(!task.reminder_enabled);
        assert!(task.difficulty.is_none());
    }

    #[test]
    fn deadline_format_roundtrip() {
        let parsed = parse_deadline("2024-01-02 15:04").unwrap();
        assert_eq!(parsed, at(2024, 1, 2, 15, 4));
        assert_eq!(format_deadline(parsed), "2024-01-02 15:04");
        assert_eq!(parse_deadline(&format_deadline(parsed)).unwrap(), parsed);
    }

    #[test]
    fn deadline_parse_rejects_garbage() {
        assert_eq!(parse_deadline("tomorrow"), Err(ValidationError::InvalidDate));
        assert_eq!(parse_deadline("2024-13-02 15:04"), Err(ValidationError::InvalidDate));
        assert_eq!(parse_deadline("2024-01-02"), Err(ValidationError::InvalidDate));
    }

    #[test]
    fn deadline_parse_trims() {
        assert_eq!(parse_deadline("  2030-01-01 09:00 ").unwrap(), at(2030, 1, 1, 9, 0));
    }

    #[test]
    fn time_left_breakdown() {
        let now = at(2030, 1, 1, 0, 0);
        let task = Task::new(1, "t").with_deadline(at(2030, 1, 3, 5, 30));
        let left = task.time_left(now).unwrap();
        assert_eq!(left, TimeLeft { days: 2, hours: 5, minutes: 30 });
        assert_eq!(left.to_string(), "2d 5h 30m");
    }

    #[test]
    fn time_left_none_when_overdue_or_unset() {
        let now = at(2030, 1, 1, 0, 0);
        assert!(Task::new(1, "t").time_left(now).is_none());
        let past = Task::new(1, "t").with_deadline(at(2029, 12, 31, 0, 0));
        assert!(past.time_left(now).is_none());
        assert!(past.is_overdue_at(now));
    }

    #[test]
    fn deadline_equal_to_now_is_overdue() {
        let now = at(2030, 1, 1, 0, 0);
        assert!(Task::new(1, "t").with_deadline(now).is_overdue_at(now));
    }

    #[test]
    fn stats_buckets() {
        let now = at(2030, 6, 1, 0, 0);
        let created = at(2030, 5, 1, 0, 0);
        let mut late = Task::new(1, "late")
            .with_created_at(created)
            .with_deadline(at(2030, 5, 11, 0, 0));
        late.completed = true;
        let mut on_time = Task::new(1, "on time")
            .with_created_at(created)
            .with_deadline(at(2030, 7, 1, 0, 0));
        on_time.completed = true;
        let open = Task::new(1, "open")
            .with_created_at(created)
            .with_deadline(at(2030, 5, 21, 0, 0));

        let stats = TaskStatistics::from_tasks(&[late, on_time, open], now);
        assert_eq!(stats.overdue, 1);
        assert_eq!(stats.completed_on_time, 1);
        // 10 + 61 + 20 days
        assert!((stats.average_deadline_days - 91.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn stats_ignore_tasks_without_deadline() {
        let mut done = Task::new(1, "done");
        done.completed = true;
        let stats = TaskStatistics::from_tasks(&[done], at(2030, 1, 1, 0, 0));
        assert_eq!(stats, TaskStatistics::default());
    }

    #[test]
    fn patch_builder() {
        let patch = TaskPatch::default().completed(true).reminder_enabled(false);
        assert_eq!(patch.completed, Some(true));
        assert_eq!(patch.reminder_enabled, Some(false));
        assert!(!patch.is_empty());
        assert!(TaskPatch::default().is_empty());
    }

    #[test]
    fn task_serde_omits_unset_optionals() {
        let json = serde_json::to_string(&Task::new(1, "t")).unwrap();
        assert!(!json.contains("\"deadline\""));
        assert!(!json.contains("\"difficulty\""));
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.description, "t");
    }
}
