use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ChannelId, ChatId, MessageId, UserId};

/// Errors the chat platform can answer an outbound command with.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The platform refused the action, e.g. the moderation account lacks
    /// the right to delete messages or ban users. Retrying won't help.
    #[error("rejected by the platform: {0}")]
    Rejected(String),

    /// Transient failure, e.g. the platform is unreachable or rate limiting.
    /// Worth retrying with backoff.
    #[error("platform temporarily unavailable: {0}")]
    Unavailable(String),

    /// The target no longer exists; someone else was faster. Callers treat
    /// this as success.
    #[error("target is already gone")]
    Gone,
}

/// The command surface of the chat platform, implemented by the transport
/// layer. Everything here may block on network I/O; none of it is allowed
/// to be called for a message the engine did not decide to act on.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<(), ActionError>;

    async fn ban_user(&self, chat: ChatId, user: UserId) -> Result<(), ActionError>;

    async fn unban_user(&self, chat: ChatId, user: UserId) -> Result<(), ActionError>;

    /// Deliver one rendered log record to a log channel.
    async fn send_log(&self, channel: ChannelId, text: &str) -> Result<(), ActionError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };

    use super::*;

    /// Platform double that records every call it receives.
    #[derive(Default)]
    pub(crate) struct RecordingPlatform {
        calls: Mutex<Vec<String>>,
        /// When set, `send_log` fails as if the platform were unreachable.
        pub(crate) fail_log: AtomicBool,
    }

    impl RecordingPlatform {
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn count_calls(&self, prefix: &str) -> usize {
            self.calls()
                .into_iter()
                .filter(|call| call.starts_with(prefix))
                .count()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ChatPlatform for RecordingPlatform {
        async fn delete_message(
            &self,
            chat: ChatId,
            message: MessageId,
        ) -> Result<(), ActionError> {
            self.record(format!("delete {chat} {message}"));
            Ok(())
        }

        async fn ban_user(&self, chat: ChatId, user: UserId) -> Result<(), ActionError> {
            self.record(format!("ban {chat} {user}"));
            Ok(())
        }

        async fn unban_user(&self, chat: ChatId, user: UserId) -> Result<(), ActionError> {
            self.record(format!("unban {chat} {user}"));
            Ok(())
        }

        async fn send_log(&self, channel: ChannelId, text: &str) -> Result<(), ActionError> {
            if self.fail_log.load(Ordering::SeqCst) {
                return Err(ActionError::Unavailable("log channel is down".to_string()));
            }
            self.record(format!("log {channel} {text}"));
            Ok(())
        }
    }
}
