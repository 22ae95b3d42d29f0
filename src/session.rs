//! Per-chat pending-command state with a TTL.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::commands::Command;
use crate::error::DatabaseError;
use crate::store::KeyValueStore;

/// What the next plain-text message from a chat means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No command issued recently; plain text is dropped.
    Idle,
    /// The last command issued in this chat, still within its TTL.
    AwaitingArgument(Command),
}

/// Stores each chat's pending command in a key-value space.
///
/// "Never set" and "expired" both read as `Idle`.
#[derive(Clone)]
pub struct SessionManager {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn key(chat_id: i64) -> String {
        format!("session:{chat_id}:command")
    }

    /// Record `command` as pending for `chat_id`, replacing any previous one.
    pub async fn set_pending(&self, chat_id: i64, command: Command) -> Result<(), DatabaseError> {
        self.kv
            .set(&Self::key(chat_id), command.as_str(), Some(self.ttl))
            .await
    }

    /// Current state for `chat_id`.
    pub async fn state(&self, chat_id: i64) -> Result<SessionState, DatabaseError> {
        let Some(raw) = self.kv.get(&Self::key(chat_id)).await? else {
            return Ok(SessionState::Idle);
        };
        match Command::parse(&raw) {
            Some(command) => Ok(SessionState::AwaitingArgument(command)),
            None => {
                debug!(chat_id, value = %raw, "Ignoring unrecognized pending command");
                Ok(SessionState::Idle)
            }
        }
    }

}
