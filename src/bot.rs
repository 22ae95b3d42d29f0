//! Message loop: channel stream in, dispatcher, replies out.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::channels::{Channel, IncomingMessage};
use crate::commands::Dispatcher;
use crate::error::ChannelError;

/// Consumes one channel's messages strictly one at a time.
pub struct Bot {
    channel: Arc<dyn Channel>,
    dispatcher: Dispatcher,
}

impl Bot {
    pub fn new(channel: Arc<dyn Channel>, dispatcher: Dispatcher) -> Self {
        Self {
            channel,
            dispatcher,
        }
    }

    /// Dispatch one message and send its replies. Returns how many were sent.
    pub async fn handle_message(&self, message: &IncomingMessage) -> usize {
        debug!(
            chat_id = message.chat_id,
            user = %message.user_id,
            command = message.command.as_deref().unwrap_or("-"),
            "Handling message"
        );

        let replies = self.dispatcher.dispatch(message, Utc::now()).await;

        let mut sent = 0;
        for reply in replies {
            match self.channel.send(message.chat_id, &reply).await {
                Ok(()) => sent += 1,
                Err(e) => error!(
                    chat_id = message.chat_id,
                    channel = self.channel.name(),
                    error = %e,
                    "Failed to send reply"
                ),
            }
        }
        sent
    }

    /// Run until `cancel` fires or the channel's stream ends.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ChannelError> {
        let mut message_stream = self.channel.start().await?;
        info!(channel = self.channel.name(), "Bot ready and listening");

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutdown requested, leaving message loop");
                    break;
                }
                msg = message_stream.next() => {
                    match msg {
                        Some(m) => m,
                        None => {
                            info!("Channel stream ended, leaving message loop");
                            break;
                        }
                    }
                }
            };

            self.handle_message(&message).await;
        }

        self.channel.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::MessageStream;
    use crate::reminders::ReminderScheduler;
    use crate::session::SessionManager;
    use crate::store::LibSqlBackend;
    use crate::tasks::TaskService;

    /// Replays a fixed script of messages and records every send.
    struct ScriptedChannel {
        script: Vec<String>,
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl Channel for ScriptedChannel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn start(&self) -> Result<MessageStream, ChannelError> {
            let messages: Vec<IncomingMessage> = self
                .script
                .iter()
                .map(|text| IncomingMessage::new("scripted", 3, "u", text))
                .collect();
            Ok(Box::pin(futures::stream::iter(messages)))
        }

        async fn send(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn health_check(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    async fn bot_with(script: &[&str]) -> (Arc<ScriptedChannel>, Bot) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let channel = Arc::new(ScriptedChannel {
            script: script.iter().map(|s| s.to_string()).collect(),
            sent: Mutex::new(Vec::new()),
        });
        let dispatcher = Dispatcher::new(
            SessionManager::new(db.clone(), Duration::from_secs(60)),
            TaskService::new(db.clone(), ReminderScheduler::new(db.clone(), db.clone())),
        );
        (channel.clone(), Bot::new(channel, dispatcher))
    }

    #[tokio::test]
    async fn processes_messages_in_order_until_stream_ends() {
        let (channel, bot) = bot_with(&["/add Buy milk", "hello there", "/list"]).await;
        bot.run(CancellationToken::new()).await.unwrap();

        let sent = channel.sent.lock().unwrap();
        // The plain message is a follow-up to /add and adds a second task.
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(chat, _)| *chat == 3));
        assert_eq!(sent[0].1, "Task added!");
        assert!(sent[2].1.contains("Buy milk"));
        assert!(sent[2].1.contains("hello there"));
    }

    #[tokio::test]
    async fn stops_when_cancelled() {
        let (channel, bot) = bot_with(&["/help"]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        bot.run(cancel).await.unwrap();
        assert!(channel.sent.lock().unwrap().is_empty());
    }
}
