//! Command dispatcher: routes chat messages to task operations.
//!
//! A command token records itself as the chat's pending command and runs
//! with its inline arguments. Plain text runs the pending command, if any,
//! with the whole message as its argument; otherwise it is dropped.

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::channels::IncomingMessage;
use crate::error::{Error, GENERIC_FAILURE_REPLY};
use crate::session::{SessionManager, SessionState};
use crate::tasks::TaskService;
use crate::tasks::format::{HELP_TEXT, START_TEXT, UNKNOWN_COMMAND_TEXT};
use crate::tasks::model::TaskOrder;

/// Every command the bot understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Start,
    Help,
    Add,
    List,
    ListByDeadline,
    Delete,
    IsDone,
    Edit,
    SetDeadline,
    SetReminder,
    UnsetReminder,
    Stats,
    Analyze,
}

impl Command {
    pub const ALL: [Command; 13] = [
        Command::Start,
        Command::Help,
        Command::Add,
        Command::List,
        Command::ListByDeadline,
        Command::Delete,
        Command::IsDone,
        Command::Edit,
        Command::SetDeadline,
        Command::SetReminder,
        Command::UnsetReminder,
        Command::Stats,
        Command::Analyze,
    ];

    /// The command token, without the leading slash.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Help => "help",
            Command::Add => "add",
            Command::List => "list",
            Command::ListByDeadline => "list_by_deadline",
            Command::Delete => "delete",
            Command::IsDone => "is_done",
            Command::Edit => "edit",
            Command::SetDeadline => "set_deadline",
            Command::SetReminder => "set_reminder",
            Command::UnsetReminder => "unset_reminder",
            Command::Stats => "stats",
            Command::Analyze => "analyze",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == token)
    }

    /// Whether a plain-text follow-up is routed to this command.
    pub fn accepts_follow_up(&self) -> bool {
        matches!(
            self,
            Command::Add
                | Command::List
                | Command::Delete
                | Command::IsDone
                | Command::Edit
                | Command::SetDeadline
                | Command::SetReminder
                | Command::UnsetReminder
        )
    }
}

/// Routes messages through the session state to the task operations.
#[derive(Clone)]
pub struct Dispatcher {
    sessions: SessionManager,
    tasks: TaskService,
}

impl Dispatcher {
    pub fn new(sessions: SessionManager, tasks: TaskService) -> Self {
        Self { sessions, tasks }
    }

    /// Handle one message and return the replies to send, in order.
    ///
    /// An empty result means the message was dropped.
    pub async fn dispatch(&self, msg: &IncomingMessage, now: DateTime<Utc>) -> Vec<String> {
        let chat_id = msg.chat_id;

        let Some(token) = msg.command.as_deref() else {
            return self.follow_up(chat_id, &msg.text, now).await;
        };

        let Some(command) = Command::parse(token) else {
            debug!(chat_id, token, "Unknown command");
            return vec![UNKNOWN_COMMAND_TEXT.to_string()];
        };

        let mut replies = Vec::with_capacity(2);
        if let Err(e) = self.sessions.set_pending(chat_id, command).await {
            // The command still runs; only the follow-up routing is lost.
            error!(chat_id, command = command.as_str(), error = %e, "Failed to store pending command");
            replies.push(GENERIC_FAILURE_REPLY.to_string());
        }
        replies.push(self.execute(command, chat_id, &msg.args, now).await);
        replies
    }

    async fn follow_up(&self, chat_id: i64, text: &str, now: DateTime<Utc>) -> Vec<String> {
        match self.sessions.state(chat_id).await {
            Ok(SessionState::AwaitingArgument(command)) if command.accepts_follow_up() => {
                debug!(chat_id, command = command.as_str(), "Routing follow-up");
                vec![self.execute(command, chat_id, text, now).await]
            }
            Ok(_) => {
                debug!(chat_id, "No pending command, dropping message");
                Vec::new()
            }
            Err(e) => {
                error!(chat_id, error = %e, "Failed to read pending command");
                vec![GENERIC_FAILURE_REPLY.to_string()]
            }
        }
    }

    /// Run `command` and turn its outcome into a reply.
    pub async fn execute(
        &self,
        command: Command,
        chat_id: i64,
        args: &str,
        now: DateTime<Utc>,
    ) -> String {
        let result = match command {
            Command::Start => Ok(START_TEXT.to_string()),
            Command::Help => Ok(HELP_TEXT.to_string()),
            Command::Add => self.tasks.add(chat_id, args).await,
            Command::List => self.tasks.list(chat_id, TaskOrder::Natural, now).await,
            Command::ListByDeadline => self.tasks.list(chat_id, TaskOrder::DeadlineAsc, now).await,
            Command::Delete => self.tasks.delete(chat_id, args).await,
            Command::IsDone => self.tasks.mark_done(chat_id, args).await,
            Command::Edit => self.tasks.edit(chat_id, args, now).await,
            Command::SetDeadline => self.tasks.set_deadline(chat_id, args, now).await,
            Command::SetReminder => self.tasks.toggle_reminder(chat_id, args, true, now).await,
            Command::UnsetReminder => self.tasks.toggle_reminder(chat_id, args, false, now).await,
            Command::Stats => self.tasks.stats(chat_id, now).await,
            Command::Analyze => self.tasks.analyze(chat_id).await,
        };

        result.unwrap_or_else(|e| reply_for_error(command, chat_id, &e))
    }
}

fn reply_for_error(command: Command, chat_id: i64, e: &Error) -> String {
    if e.is_collaborator_failure() {
        error!(chat_id, command = command.as_str(), error = %e, "Command failed");
    } else {
        debug!(chat_id, command = command.as_str(), error = %e, "Command rejected");
    }
    e.user_message()
}
