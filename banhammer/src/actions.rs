use std::time::Duration;

use chrono::Utc;
use html_escape::encode_text;

use crate::{
    database::Database,
    platform::{ActionError, ChatPlatform},
    types::{ChannelId, ChatId, MessageId, Reason, UserId},
};

/// Most attempts for one outbound platform call, first try included.
pub(crate) const MAX_ATTEMPTS: u32 = 3;
pub(crate) const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Retry a platform call a bounded number of times with exponential
/// backoff. Only transient failures are retried; rejections and successes
/// pass through immediately.
macro_rules! platform_retry {
    ($call:expr) => {{
        let mut attempt: u32 = 0;
        loop {
            match $call {
                Err($crate::platform::ActionError::Unavailable(e))
                    if attempt + 1 < $crate::actions::MAX_ATTEMPTS =>
                {
                    attempt += 1;
                    log::warn!("Platform call failed (attempt {attempt}): {e}; retrying");
                    tokio::time::sleep($crate::actions::BACKOFF_BASE * 2u32.pow(attempt - 1))
                        .await;
                }
                other => break other,
            }
        }
    }};
}
pub(crate) use platform_retry;

/// One audit log line, rendered for the group's log channel.
pub struct LogRecord<'a> {
    pub chat: ChatId,
    pub sender: UserId,
    /// Short action name, like "delete+ban" or "unban".
    pub action: &'a str,
    pub reasons: &'a [Reason],
    /// Snapshot of the offending content, if there is one.
    pub snapshot: Option<&'a str>,
}

impl LogRecord<'_> {
    /// Render to the HTML the log channel displays. User content is
    /// escaped.
    #[must_use]
    pub fn render(&self) -> String {
        let mut text = format!(
            "🔨 <b>Moderation record</b>\n<b>Source group:</b> {}\n<b>User:</b> {}\n<b>Action:</b> {}\n",
            self.chat, self.sender, self.action
        );
        for reason in self.reasons {
            text.push_str(&format!(
                "<b>Reason:</b> {}\n",
                encode_text(&reason.to_string())
            ));
        }
        if let Some(snapshot) = self.snapshot {
            text.push_str(&format!(
                "<b>Content:</b> <code>{}</code>\n",
                encode_text(snapshot)
            ));
        }
        text.push_str(&format!(
            "<b>Time:</b> {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        ));
        text
    }
}

/// Delete one message, retrying transient failures. A message someone else
/// already deleted counts as deleted.
pub async fn delete_message<P: ChatPlatform>(
    platform: &P,
    chat: ChatId,
    message: MessageId,
) -> Result<(), ActionError> {
    match platform_retry!(platform.delete_message(chat, message).await) {
        // Someone else probably has already deleted it. That's fine.
        Ok(()) | Err(ActionError::Gone) => Ok(()),
        Err(e) => {
            log::error!("Failed to delete message {message} in chat {chat}: {e}");
            Err(e)
        }
    }
}

/// Delete the offending message and ban its sender. A platform refusal to
/// delete is logged but does not stop the ban. The ban is recorded in the
/// database once the platform accepts it.
pub async fn delete_and_ban<P: ChatPlatform>(
    platform: &P,
    database: &Database,
    chat: ChatId,
    message: MessageId,
    sender: UserId,
    reason: &str,
) -> Result<(), ActionError> {
    // No rights? Message too old? The ban still matters more, so don't
    // bail on a failed delete; delete_message already logged it.
    let _ = delete_message(platform, chat, message).await;

    match platform_retry!(platform.ban_user(chat, sender).await) {
        Ok(()) => {
            database.record_ban(chat, sender, reason).await.map_err(|e| {
                ActionError::Unavailable(format!("ban succeeded but recording it failed: {e}"))
            })?;
            Ok(())
        }
        Err(ActionError::Gone) => Ok(()),
        Err(e) => {
            log::error!("Failed to ban user {sender} in chat {chat}: {e}");
            Err(e)
        }
    }
}

/// Lift the platform-level ban for a user and close the ban record. Returns
/// whether an active record existed. Blacklist entries are untouched;
/// removing those takes a separate explicit command.
pub async fn lift_ban<P: ChatPlatform>(
    platform: &P,
    database: &Database,
    chat: ChatId,
    user: UserId,
) -> Result<bool, ActionError> {
    match platform_retry!(platform.unban_user(chat, user).await) {
        Ok(()) | Err(ActionError::Gone) => {}
        Err(e) => return Err(e),
    }

    database
        .close_ban(chat, user)
        .await
        .map_err(|e| ActionError::Unavailable(format!("closing the ban record failed: {e}")))
}

/// Send one log record to the group's log channel, if one is configured.
/// Failures are reported to the caller but must never undo the action that
/// is being logged; by the time this runs, that action is committed.
pub async fn send_log_record<P: ChatPlatform>(
    platform: &P,
    channel: Option<ChannelId>,
    record: &LogRecord<'_>,
) -> Result<(), ActionError> {
    let Some(channel) = channel else {
        return Ok(());
    };

    let text = record.render();
    match platform_retry!(platform.send_log(channel, &text).await) {
        Ok(()) => Ok(()),
        Err(e) => {
            log::error!("Failed to deliver log record to channel {channel}: {e}");
            Err(e)
        }
    }
}
