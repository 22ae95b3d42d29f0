//! Channel trait and the inbound message type shared by all gateways.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use uuid::Uuid;

use crate::error::ChannelError;

/// Stream of inbound messages produced by `Channel::start`.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A text message received from a chat.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Uuid,
    /// Gateway that produced the message.
    pub channel: String,
    /// Conversation to reply to.
    pub chat_id: i64,
    /// Sender identity (numeric id or username).
    pub user_id: String,
    /// Display name, if the gateway provides one.
    pub user_name: Option<String>,
    /// Full message text as received.
    pub text: String,
    /// Command name without the leading slash or `@botname` suffix.
    pub command: Option<String>,
    /// Text after the command token, trimmed. The whole text for plain messages.
    pub args: String,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: i64,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        let (command, args) = match parse_command(&text) {
            Some((command, args)) => (Some(command.to_string()), args.to_string()),
            None => (None, text.clone()),
        };
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            chat_id,
            user_id: user_id.into(),
            user_name: None,
            text,
            command,
            args,
            received_at: Utc::now(),
        }
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }
}

/// Split `/cmd@bot rest` into `("cmd", "rest")`.
///
/// Returns `None` for text that does not start with a command token.
pub fn parse_command(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    let body = text.strip_prefix('/')?;
    let (token, rest) = match body.find(char::is_whitespace) {
        Some(idx) => (&body[..idx], &body[idx..]),
        None => (body, ""),
    };
    let name = token.split('@').next().unwrap_or(token);
    if name.is_empty() {
        return None;
    }
    Some((name, rest.trim()))
}

/// A messaging gateway: inbound message stream plus best-effort sends.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Begin receiving messages.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Deliver `text` to `chat_id`.
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), ChannelError>;

    /// Verify the gateway is reachable and authenticated.
    async fn health_check(&self) -> Result<(), ChannelError>;

    /// Stop receiving messages.
    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_with_args() {
        assert_eq!(parse_command("/add Buy milk | 2"), Some(("add", "Buy milk | 2")));
    }

    #[test]
    fn parses_bare_command() {
        assert_eq!(parse_command("/list"), Some(("list", "")));
    }

    #[test]
    fn strips_bot_suffix() {
        assert_eq!(
            parse_command("/is_done@task_bot  Buy milk "),
            Some(("is_done", "Buy milk"))
        );
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse_command("Buy milk"), None);
        assert_eq!(parse_command("/"), None);
        assert_eq!(parse_command("/ add"), None);
    }

    #[test]
    fn incoming_message_splits_command() {
        let msg = IncomingMessage::new("test", 5, "u", "/set_deadline A | 2030-01-01 09:00");
        assert_eq!(msg.command.as_deref(), Some("set_deadline"));
        assert_eq!(msg.args, "A | 2030-01-01 09:00");
    }

    #[test]
    fn plain_message_keeps_full_text_as_args() {
        let msg = IncomingMessage::new("test", 5, "u", "  Buy milk | 2");
        assert!(msg.command.is_none());
        assert_eq!(msg.args, "  Buy milk | 2");
    }
}
