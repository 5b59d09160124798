use std::{sync::Arc, time::Duration};

use moka::sync::Cache;
use thiserror::Error;

use crate::{
    actions::{self, LogRecord},
    database::{Database, GroupConfig},
    detector,
    fingerprint::fingerprint,
    platform::{ActionError, ChatPlatform},
    sharing,
    types::{
        MessageEvent, ModerationAction, ModerationDecision, Reason,
    },
};

/// How many event ids the duplicate-delivery cache remembers, and for how
/// long. Transport retries arrive within seconds; the window is generous.
const IDEMPOTENCY_CAPACITY: u64 = 10_000;
const IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Errors of the moderation engine that callers may need to act on.
#[derive(Debug, Error)]
pub enum ModerationError {
    /// The content cannot be identified or fingerprinted.
    #[error("content cannot be identified: {0}")]
    Validation(String),

    /// The store is unreachable. Transient; retry with backoff.
    #[error("storage unavailable: {0}")]
    Storage(#[from] crate::database::Error),

    /// The platform denied or failed an action.
    #[error("platform action failed: {0}")]
    Action(#[from] ActionError),
}

/// Terminal outcome of handling one message event.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Nothing to do; no side effects happened.
    Clean,
    /// The sender is an admin or owner; the message was never evaluated.
    SkippedAdmin,
    /// This event id was already handled. Duplicate deliveries are not an
    /// error; they are silently dropped.
    Duplicate,
    /// The message was flagged and the decision was executed.
    Actioned(ModerationDecision),
}

/// The per-event moderation orchestrator.
///
/// One instance serves all groups; it holds no per-group state outside the
/// database, so events for different groups can be handled from concurrent
/// tasks freely.
pub struct Moderator<P> {
    database: Arc<Database>,
    platform: Arc<P>,
    seen_events: Cache<i64, ()>,
}

impl<P: ChatPlatform> Moderator<P> {
    pub fn new(database: Arc<Database>, platform: Arc<P>) -> Self {
        Moderator {
            database,
            platform,
            seen_events: Cache::builder()
                .max_capacity(IDEMPOTENCY_CAPACITY)
                .time_to_live(IDEMPOTENCY_WINDOW)
                .build(),
        }
    }

    /// Run one incoming message through detection and blacklist matching,
    /// and execute the resulting decision at most once per event id.
    pub async fn handle_event(&self, event: &MessageEvent) -> Result<Outcome, ModerationError> {
        // Claim the event id before doing anything. The transport may
        // deliver the same event twice; the entry API makes this claim
        // atomic, so exactly one of the racing deliveries proceeds.
        let claim = self.seen_events.entry(event.event_id.0).or_insert(());
        if !claim.is_fresh() {
            log::debug!("Duplicate delivery of event {}; ignoring", event.event_id.0);
            return Ok(Outcome::Duplicate);
        }

        // Admins and owners are never evaluated.
        if event.sender_is_admin {
            log::debug!("Skipping admin message in chat {}", event.chat_id);
            return Ok(Outcome::SkippedAdmin);
        }

        let config = match self.database.get_group_config(event.chat_id).await {
            Ok(config) => config,
            Err(e) => {
                log::error!(
                    "Failed reading config for chat {}: {e}; falling back to defaults",
                    event.chat_id
                );
                GroupConfig {
                    chat_id: event.chat_id,
                    contribute_global: false,
                    use_global: false,
                    log_channel: None,
                    thresholds: detector::DetectionThresholds::default(),
                }
            }
        };

        let candidate = fingerprint(&event.content);
        let scopes = sharing::query_scopes(&config);

        // The blacklist lookup and the rule detector are independent of
        // each other; run them concurrently.
        let lookup = async {
            match &candidate {
                Some(fp) => {
                    self.database
                        .find_match(&scopes, std::slice::from_ref(fp))
                        .await
                }
                None => Ok(None),
            }
        };
        let detect = async {
            event
                .content
                .text()
                .map(|text| detector::evaluate(text, &config.thresholds))
        };
        let (matched, detection) = tokio::join!(lookup, detect);

        let matched = match matched {
            Ok(matched) => matched,
            Err(e) => {
                // Storage trouble must neither skip moderation entirely nor
                // ban without basis. Degrade to detector-only evaluation.
                log::error!("Blacklist lookup failed: {e}; continuing with detector only");
                None
            }
        };

        // A blacklist match leads the reasons; detector reasons follow.
        let mut reasons = Vec::new();
        if let Some(entry) = matched {
            reasons.push(Reason::Blacklisted(entry));
        }
        if let Some(detection) = detection {
            reasons.extend(detection.reasons.into_iter().map(Reason::Detector));
        }

        if reasons.is_empty() {
            return Ok(Outcome::Clean);
        }

        let decision = ModerationDecision {
            action: ModerationAction::DeleteAndBan,
            reasons,
        };
        self.execute(event, &config, decision).await
    }

    /// Carry out a flagged decision: the platform actions first, then
    /// exactly one log record. By the time the record is sent the actions
    /// are committed; a logging failure is reported and never undoes them.
    async fn execute(
        &self,
        event: &MessageEvent,
        config: &GroupConfig,
        decision: ModerationDecision,
    ) -> Result<Outcome, ModerationError> {
        let reason_text = decision
            .reasons
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");

        if decision.action == ModerationAction::DeleteAndBan {
            if let Err(e) = actions::delete_and_ban(
                &*self.platform,
                &self.database,
                event.chat_id,
                event.message_id,
                event.sender_id,
                &reason_text,
            )
            .await
            {
                // Surface the failure to the group's log channel too, so
                // admins learn the account lacks rights.
                let record = LogRecord {
                    chat: event.chat_id,
                    sender: event.sender_id,
                    action: "delete+ban (failed)",
                    reasons: &decision.reasons,
                    snapshot: event.content.text(),
                };
                let _ = actions::send_log_record(&*self.platform, config.log_channel, &record)
                    .await;
                return Err(e.into());
            }
        }

        let action_name = match decision.action {
            ModerationAction::DeleteAndBan => "delete+ban",
            ModerationAction::Warn => "warn",
            ModerationAction::None => "none",
        };
        let record = LogRecord {
            chat: event.chat_id,
            sender: event.sender_id,
            action: action_name,
            reasons: &decision.reasons,
            snapshot: event.content.text(),
        };
        if let Err(e) =
            actions::send_log_record(&*self.platform, config.log_channel, &record).await
        {
            log::error!(
                "Moderated a message in chat {} but could not log it: {e}",
                event.chat_id
            );
        }

        log::info!(
            "Actioned message {} in chat {}: {reason_text}",
            event.message_id,
            event.chat_id
        );

        Ok(Outcome::Actioned(decision))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        platform::testing::RecordingPlatform,
        types::{ChannelId, ChatId, Content, ContentKind, EventId, MessageId, Scope, UserId},
    };

    async fn moderator() -> (Moderator<RecordingPlatform>, Arc<Database>, Arc<RecordingPlatform>)
    {
        let database = Database::open_in_memory().await.unwrap();
        let platform = Arc::new(RecordingPlatform::default());
        (
            Moderator::new(database.clone(), platform.clone()),
            database,
            platform,
        )
    }

    fn event(event_id: i64, content: Content) -> MessageEvent {
        MessageEvent {
            event_id: EventId(event_id),
            chat_id: ChatId(42),
            sender_id: UserId(1337),
            sender_is_admin: false,
            message_id: MessageId(7),
            content,
        }
    }

    #[tokio::test]
    async fn blacklisted_content_is_deleted_and_banned() {
        let (moderator, database, platform) = moderator().await;
        database
            .insert_entry(
                Scope::Group(ChatId(42)),
                ContentKind::StickerSet,
                "bad-sticker",
                None,
            )
            .await
            .unwrap();

        let outcome = moderator
            .handle_event(&event(
                1,
                Content::StickerSet {
                    file_unique_id: "bad-sticker".to_string(),
                },
            ))
            .await
            .unwrap();

        let Outcome::Actioned(decision) = outcome else {
            panic!("expected an actioned outcome");
        };
        assert_eq!(decision.action, ModerationAction::DeleteAndBan);
        assert!(decision.matched_entry().is_some());

        let calls = platform.calls();
        assert!(calls.contains(&"delete 42 7".to_string()));
        assert!(calls.contains(&"ban 42 1337".to_string()));

        // The ban got recorded.
        assert!(database.close_ban(ChatId(42), UserId(1337)).await.unwrap());
    }

    #[tokio::test]
    async fn clean_messages_cause_no_side_effects() {
        let (moderator, _database, platform) = moderator().await;

        let outcome = moderator
            .handle_event(&event(
                2,
                Content::Text {
                    text: "good morning everyone".to_string(),
                },
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Clean));
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn admin_messages_are_never_evaluated() {
        let (moderator, database, platform) = moderator().await;
        database
            .insert_entry(Scope::Group(ChatId(42)), ContentKind::Text, "whatever", None)
            .await
            .unwrap();

        let mut admin_event = event(
            3,
            Content::Text {
                text: "SPAM SPAM SPAM free money".to_string(),
            },
        );
        admin_event.sender_is_admin = true;

        let outcome = moderator.handle_event(&admin_event).await.unwrap();
        assert!(matches!(outcome, Outcome::SkippedAdmin));
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn duplicate_deliveries_are_actioned_once() {
        let (moderator, database, platform) = moderator().await;
        database
            .insert_entry(
                Scope::Group(ChatId(42)),
                ContentKind::Animation,
                "bad-gif",
                None,
            )
            .await
            .unwrap();

        let event = event(
            4,
            Content::Animation {
                file_id: "bad-gif".to_string(),
            },
        );

        let first = moderator.handle_event(&event).await.unwrap();
        assert!(matches!(first, Outcome::Actioned(_)));

        let second = moderator.handle_event(&event).await.unwrap();
        assert!(matches!(second, Outcome::Duplicate));

        let bans = platform
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("ban"))
            .count();
        assert_eq!(bans, 1);
    }

    #[tokio::test]
    async fn detector_reasons_flag_without_any_blacklist() {
        let (moderator, database, platform) = moderator().await;

        let mut thresholds = detector::DetectionThresholds::default();
        thresholds.max_links = 1;
        database.set_thresholds(ChatId(42), &thresholds).await.unwrap();

        let outcome = moderator
            .handle_event(&event(
                5,
                Content::Text {
                    text: "check http://a.com and http://b.com".to_string(),
                },
            ))
            .await
            .unwrap();

        let Outcome::Actioned(decision) = outcome else {
            panic!("expected an actioned outcome");
        };
        assert!(decision.matched_entry().is_none());
        assert!(decision
            .reasons
            .iter()
            .any(|reason| reason.to_string().contains("too many links")));
        assert!(platform.calls().contains(&"ban 42 1337".to_string()));
    }

    #[tokio::test]
    async fn global_entries_need_the_use_flag() {
        let (moderator, database, platform) = moderator().await;
        database
            .insert_entry(
                Scope::Global,
                ContentKind::InlineBot,
                "spamrelaybot",
                Some(ChatId(7)),
            )
            .await
            .unwrap();

        // With the flag off, the identical content passes.
        database
            .set_global(ChatId(42), None, Some(false))
            .await
            .unwrap();
        let outcome = moderator
            .handle_event(&event(
                6,
                Content::InlineBot {
                    username: "SpamRelayBot".to_string(),
                },
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Clean));
        assert!(platform.calls().is_empty());

        // With the flag on, it matches.
        database
            .set_global(ChatId(42), None, Some(true))
            .await
            .unwrap();
        let outcome = moderator
            .handle_event(&event(
                7,
                Content::InlineBot {
                    username: "SpamRelayBot".to_string(),
                },
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Actioned(_)));
    }

    #[tokio::test]
    async fn log_failure_never_rolls_back_the_action() {
        let (moderator, database, platform) = moderator().await;
        database
            .set_log_channel(ChatId(42), Some(ChannelId(-100)))
            .await
            .unwrap();
        database
            .insert_entry(Scope::Group(ChatId(42)), ContentKind::Link, "https://spam.example/", None)
            .await
            .unwrap();
        platform.fail_log.store(true, Ordering::SeqCst);

        let outcome = moderator
            .handle_event(&event(
                8,
                Content::Link {
                    text: "https://spam.example/".to_string(),
                },
            ))
            .await
            .unwrap();

        // The action stands even though logging failed.
        assert!(matches!(outcome, Outcome::Actioned(_)));
        assert!(platform.calls().contains(&"ban 42 1337".to_string()));
        assert!(database.close_ban(ChatId(42), UserId(1337)).await.unwrap());
    }

    #[tokio::test]
    async fn flagged_events_emit_exactly_one_log_record() {
        let (moderator, database, platform) = moderator().await;
        database
            .set_log_channel(ChatId(42), Some(ChannelId(-100)))
            .await
            .unwrap();
        database
            .insert_entry(Scope::Group(ChatId(42)), ContentKind::Text, "noise", None)
            .await
            .unwrap();

        moderator
            .handle_event(&event(
                9,
                Content::Text {
                    text: "FREE MONEY free money".to_string(),
                },
            ))
            .await
            .unwrap();

        let logs: Vec<String> = platform
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("log"))
            .collect();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].contains("banned word"));
    }
}
