//! Reply text rendering for task lists, statistics and help.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::tasks::model::{DEADLINE_DISPLAY_FORMAT, DifficultyBucket, Task, TaskStatistics};

pub const START_TEXT: &str =
    "Hi! I'm a bot that helps you keep track of your tasks. Use /help to see the available commands.";

pub const HELP_TEXT: &str = "Available commands:
/add <description> | <difficulty 1-5> - add a task
/list - list tasks
/list_by_deadline - list tasks sorted by deadline
/delete <YYYY-MM-DD HH:MM> - delete the task with that deadline
/is_done <description> - mark a task as done
/edit <old description> | <new description> - rename a task
/set_deadline <description> | <YYYY-MM-DD HH:MM> - set a deadline
/set_reminder <description> - enable the deadline reminder
/unset_reminder <description> - disable the deadline reminder
/stats - overall statistics
/analyze - statistics by difficulty
/help - this message";

pub const UNKNOWN_COMMAND_TEXT: &str = "Unknown command. Use /help to see the available commands.";

pub const EMPTY_LIST_TEXT: &str = "Your task list is empty.";

pub const EMPTY_ANALYSIS_TEXT: &str = "No tasks with a difficulty to analyze yet.";

const PENDING_GLYPH: &str = "🔥";
const DONE_GLYPH: &str = "✅";

/// One numbered line per task: description, deadline or dash, time left or
/// "overdue", and a completion glyph.
pub fn render_list(tasks: &[Task], now: DateTime<Utc>) -> String {
    if tasks.is_empty() {
        return EMPTY_LIST_TEXT.to_string();
    }

    let mut out = String::from("Tasks:\n");
    for (i, task) in tasks.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, render_line(task, now));
    }
    out.truncate(out.trim_end().len());
    out
}

fn render_line(task: &Task, now: DateTime<Utc>) -> String {
    let (deadline, remaining) = match task.deadline {
        None => ("-".to_string(), String::new()),
        Some(deadline) => {
            let remaining = match task.time_left(now) {
                Some(left) => format!(" ({left} left)"),
                None => " (overdue)".to_string(),
            };
            (deadline.format(DEADLINE_DISPLAY_FORMAT).to_string(), remaining)
        }
    };
    let glyph = if task.completed {
        DONE_GLYPH
    } else {
        PENDING_GLYPH
    };
    format!(
        "{} (deadline: {deadline}) {glyph}{remaining}",
        task.description
    )
}

pub fn render_stats(stats: &TaskStatistics) -> String {
    format!(
        "Your task statistics:\nCompleted on time: {}\nOverdue: {}\nAverage deadline: {:.2} days",
        stats.completed_on_time, stats.overdue, stats.average_deadline_days
    )
}

pub fn render_analysis(buckets: &[DifficultyBucket]) -> String {
    if buckets.is_empty() {
        return EMPTY_ANALYSIS_TEXT.to_string();
    }

    let mut out = String::from("Tasks by difficulty:\n");
    for bucket in buckets {
        let average = match bucket.average_deadline_days {
            Some(days) => format!("{days:.2} days"),
            None => "-".to_string(),
        };
        let _ = writeln!(
            out,
            "Difficulty: {}, count: {}, average deadline: {average}",
            bucket.difficulty, bucket.count
        );
    }
    out.truncate(out.trim_end().len());
    out
}
