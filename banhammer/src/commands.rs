//! The admin-facing operations. Command parsing lives in the transport
//! layer; what arrives here is already typed.

use futures_util::TryStreamExt;

use crate::{
    actions::{self, LogRecord},
    database::{Database, GlobalStats, ReportOutcome},
    fingerprint::fingerprint,
    moderator::ModerationError,
    platform::ChatPlatform,
    sharing,
    types::{
        BlacklistEntry, ChannelId, ChatId, Content, ContentKind, MessageId, Reason, Scope, UserId,
    },
    REPORT_PROMOTION_THRESHOLD,
};

/// The message an admin is reporting: the reply target of their `/spam`
/// command, as relayed by the transport.
#[derive(Debug, Clone)]
pub struct ReportedMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub content: Content,
}

/// A group's global-sharing settings, for status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalStatus {
    pub contribute: bool,
    pub use_global: bool,
    /// Entries this group currently has in the global pool.
    pub contribution_count: u64,
}

/// Handle an admin's `/spam` report of a message.
///
/// Content with a canonical platform id (links, stickers, animations,
/// inline bots) is blacklisted right away: one admin vouching for it is an
/// explicit admin action. Text is cheap to vary and easy to misjudge, so
/// text fingerprints go through report aggregation instead and only get
/// blacklisted once three distinct admins have reported them.
///
/// The reported message itself is deleted in every case; its sender is
/// banned once the content is (or already was) blacklisted.
pub async fn report_spam<P: ChatPlatform>(
    platform: &P,
    database: &Database,
    chat: ChatId,
    reporter: UserId,
    reported: &ReportedMessage,
) -> Result<ReportOutcome, ModerationError> {
    let Some(fp) = fingerprint(&reported.content) else {
        return Err(ModerationError::Validation(
            "cannot identify the content of the reported message".to_string(),
        ));
    };

    let config = database.get_group_config(chat).await?;
    let query = sharing::query_scopes(&config);
    let contribution = sharing::contribution_scopes(&config);

    let outcome = if fp.kind == ContentKind::Text {
        database
            .record_report(
                chat,
                &fp,
                reporter,
                reported.content.text(),
                &query,
                &contribution,
                REPORT_PROMOTION_THRESHOLD,
            )
            .await?
    } else {
        // Canonical ids get blacklisted by this one explicit admin action.
        let mut newly_created = false;
        for &scope in &contribution {
            let contributor = match scope {
                Scope::Global => Some(chat),
                Scope::Group(_) => None,
            };
            let inserted = database
                .insert_entry(scope, fp.kind, &fp.key, contributor)
                .await?;
            if scope == Scope::Group(chat) {
                newly_created = inserted.newly_created();
            }
        }

        if newly_created {
            log::info!("Admin {reporter} blacklisted {fp} in chat {chat}");
            let entry = database
                .get_entry(Scope::Group(chat), fp.kind, &fp.key)
                .await?
                .expect("Entry was just inserted");
            ReportOutcome::Promoted { entry }
        } else {
            ReportOutcome::AlreadyBlacklisted
        }
    };

    match &outcome {
        ReportOutcome::Promoted { entry } => {
            let reasons = [Reason::Blacklisted(entry.clone())];
            actions::delete_and_ban(
                platform,
                database,
                chat,
                reported.message_id,
                reported.sender_id,
                &format!("reported spam: {entry}"),
            )
            .await?;

            let record = LogRecord {
                chat,
                sender: reported.sender_id,
                action: "spam report: blacklisted, sender banned",
                reasons: &reasons,
                snapshot: reported.content.text(),
            };
            let _ = actions::send_log_record(platform, config.log_channel, &record).await;
        }
        ReportOutcome::AlreadyBlacklisted => {
            // Nothing new to record, but the reported copy still goes away.
            // The regular moderation path handles any further sightings.
            let _ = actions::delete_message(platform, chat, reported.message_id).await;
        }
        ReportOutcome::Counted { distinct_reporters } => {
            // The reported copy goes away on every report; the sender is
            // only banned once the fingerprint is promoted.
            let _ = actions::delete_message(platform, chat, reported.message_id).await;
            let action = format!(
                "spam report ({distinct_reporters}/{REPORT_PROMOTION_THRESHOLD} distinct admins)"
            );
            let record = LogRecord {
                chat,
                sender: reported.sender_id,
                action: &action,
                reasons: &[],
                snapshot: reported.content.text(),
            };
            let _ = actions::send_log_record(platform, config.log_channel, &record).await;
        }
    }

    Ok(outcome)
}

/// All blacklist entries of this group, in insertion order.
pub async fn list_blacklist(
    database: &Database,
    chat: ChatId,
) -> Result<Vec<BlacklistEntry>, ModerationError> {
    Ok(database
        .list_entries(Scope::Group(chat))
        .try_collect()
        .await?)
}

/// Explicitly remove one entry from the group's blacklist. Returns whether
/// it existed.
pub async fn remove_blacklist_entry(
    database: &Database,
    chat: ChatId,
    kind: ContentKind,
    fingerprint: &str,
) -> Result<bool, ModerationError> {
    Ok(database
        .remove_entry(Scope::Group(chat), kind, fingerprint)
        .await?)
}

/// Lift a user's platform-level ban. Blacklist entries created from their
/// messages stay; removing those takes [`remove_blacklist_entry`]. Returns
/// whether an active ban record existed.
pub async fn unban<P: ChatPlatform>(
    platform: &P,
    database: &Database,
    chat: ChatId,
    user: UserId,
) -> Result<bool, ModerationError> {
    let had_record = actions::lift_ban(platform, database, chat, user).await?;

    let config = database.get_group_config(chat).await?;
    let record = LogRecord {
        chat,
        sender: user,
        action: "unban",
        reasons: &[],
        snapshot: None,
    };
    let _ = actions::send_log_record(platform, config.log_channel, &record).await;

    Ok(had_record)
}

/// Set or clear the channel this group's moderation actions are logged to.
pub async fn set_log_channel(
    database: &Database,
    chat: ChatId,
    channel: Option<ChannelId>,
) -> Result<(), ModerationError> {
    database.set_log_channel(chat, channel).await?;
    log::info!("Log channel for chat {chat} set to {channel:?}");
    Ok(())
}

/// Update the group's global-sharing flags; either flag may be left alone.
/// Returns how many previously contributed entries were withdrawn from the
/// global pool (non-zero only when contribution was switched off).
pub async fn set_global(
    database: &Database,
    chat: ChatId,
    contribute: Option<bool>,
    use_global: Option<bool>,
) -> Result<u64, ModerationError> {
    let withdrawn = database.set_global(chat, contribute, use_global).await?;
    log::info!(
        "Chat {chat} set global sharing to contribute={contribute:?} use={use_global:?} \
        (withdrew {withdrawn} entries)"
    );
    Ok(withdrawn)
}

/// This group's sharing flags and live contribution count.
pub async fn global_status(
    database: &Database,
    chat: ChatId,
) -> Result<GlobalStatus, ModerationError> {
    let config = database.get_group_config(chat).await?;
    let contribution_count = database.contribution_count(chat).await?;
    Ok(GlobalStatus {
        contribute: config.contribute_global,
        use_global: config.use_global,
        contribution_count,
    })
}

/// Statistics over the whole global pool.
pub async fn global_stats(database: &Database) -> Result<GlobalStats, ModerationError> {
    Ok(database.global_stats().await?)
}

/// Sweep out blacklist entries with blank fingerprints. Returns the amount
/// removed.
pub async fn cleanup(database: &Database) -> Result<u64, ModerationError> {
    let removed = database.cleanup_invalid().await?;
    if removed > 0 {
        log::info!("Cleanup removed {removed} invalid blacklist entries");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;

    use super::*;
    use crate::platform::testing::RecordingPlatform;

    async fn setup() -> (Arc<Database>, Arc<RecordingPlatform>) {
        let database = Database::open_in_memory().await.unwrap();
        let platform = Arc::new(RecordingPlatform::default());
        (database, platform)
    }

    fn reported(content: Content) -> ReportedMessage {
        ReportedMessage {
            message_id: MessageId(7),
            sender_id: UserId(1337),
            content,
        }
    }

    #[tokio::test]
    async fn reported_links_are_blacklisted_immediately() {
        let (database, platform) = setup().await;
        let chat = ChatId(42);

        let outcome = report_spam(
            &*platform,
            &database,
            chat,
            UserId(1),
            &reported(Content::Link {
                text: "https://spam.example/offer?utm_source=tg".to_string(),
            }),
        )
        .await
        .unwrap();

        let ReportOutcome::Promoted { entry } = outcome else {
            panic!("one report of a link should blacklist it");
        };
        assert_eq!(entry.kind, ContentKind::Link);
        assert_eq!(entry.fingerprint, "https://spam.example/offer");

        // Sender got deleted and banned right away.
        assert_eq!(platform.count_calls("ban"), 1);
        assert!(platform.count_calls("delete") >= 1);

        // Reporting the same link again is a no-op.
        let outcome = report_spam(
            &*platform,
            &database,
            chat,
            UserId(2),
            &reported(Content::Link {
                text: "https://SPAM.example/offer".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(outcome, ReportOutcome::AlreadyBlacklisted);
        assert_eq!(database.count_entries(Scope::Group(chat)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn text_reports_need_three_distinct_admins() {
        let (database, platform) = setup().await;
        let chat = ChatId(42);
        let spam = || {
            reported(Content::Text {
                text: "hello spam".to_string(),
            })
        };

        let outcome = report_spam(&*platform, &database, chat, UserId(1), &spam())
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Counted { distinct_reporters: 1 });

        // The same admin nagging again does not advance the count.
        let outcome = report_spam(&*platform, &database, chat, UserId(1), &spam())
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Counted { distinct_reporters: 1 });

        let outcome = report_spam(&*platform, &database, chat, UserId(2), &spam())
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Counted { distinct_reporters: 2 });

        // No ban so far, but the reported copies were deleted.
        assert_eq!(platform.count_calls("ban"), 0);
        assert!(platform.count_calls("delete") >= 3);

        let outcome = report_spam(&*platform, &database, chat, UserId(3), &spam())
            .await
            .unwrap();
        let ReportOutcome::Promoted { entry } = outcome else {
            panic!("the third distinct admin should promote");
        };
        assert_eq!(entry.scope, Scope::Group(chat));
        assert_eq!(entry.kind, ContentKind::Text);
        assert_eq!(entry.fingerprint, crate::fingerprint::text_key("hello spam"));
        assert_eq!(platform.count_calls("ban"), 1);
    }

    #[tokio::test]
    async fn contributing_groups_share_their_reports() {
        let (database, platform) = setup().await;
        let chat = ChatId(42);
        set_global(&database, chat, Some(true), Some(true))
            .await
            .unwrap();

        report_spam(
            &*platform,
            &database,
            chat,
            UserId(1),
            &reported(Content::StickerSet {
                file_unique_id: "scam-sticker".to_string(),
            }),
        )
        .await
        .unwrap();

        // The entry exists both locally and globally, with attribution.
        assert_eq!(database.count_entries(Scope::Group(chat)).await.unwrap(), 1);
        let status = global_status(&database, chat).await.unwrap();
        assert_eq!(status.contribution_count, 1);

        let stats = global_stats(&database).await.unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.contributing_groups, 1);
    }

    #[tokio::test]
    async fn unsupported_content_cannot_be_reported() {
        let (database, platform) = setup().await;

        let result = report_spam(
            &*platform,
            &database,
            ChatId(42),
            UserId(1),
            &reported(Content::Unsupported),
        )
        .await;
        assert!(matches!(result, Err(ModerationError::Validation(_))));
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn listing_follows_insertion_order() {
        let (database, platform) = setup().await;
        let chat = ChatId(42);

        for id in ["first-gif", "second-gif"] {
            report_spam(
                &*platform,
                &database,
                chat,
                UserId(1),
                &reported(Content::Animation {
                    file_id: id.to_string(),
                }),
            )
            .await
            .unwrap();
        }

        let listed = list_blacklist(&database, chat).await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|e| e.fingerprint.as_str()).collect();
        assert_eq!(keys, ["first-gif", "second-gif"]);
    }

    #[tokio::test]
    async fn unban_spares_the_blacklist() {
        let (database, platform) = setup().await;
        let chat = ChatId(42);

        report_spam(
            &*platform,
            &database,
            chat,
            UserId(1),
            &reported(Content::InlineBot {
                username: "SpamRelayBot".to_string(),
            }),
        )
        .await
        .unwrap();

        let had_record = unban(&*platform, &database, chat, UserId(1337)).await.unwrap();
        assert!(had_record);
        assert_eq!(platform.count_calls("unban"), 1);

        // The blacklist entry survives the unban.
        assert_eq!(database.count_entries(Scope::Group(chat)).await.unwrap(), 1);

        // A second unban finds nothing active.
        let had_record = unban(&*platform, &database, chat, UserId(1337)).await.unwrap();
        assert!(!had_record);
    }

    #[tokio::test]
    async fn removing_an_entry_is_explicit() {
        let (database, platform) = setup().await;
        let chat = ChatId(42);

        report_spam(
            &*platform,
            &database,
            chat,
            UserId(1),
            &reported(Content::Animation {
                file_id: "bad-gif".to_string(),
            }),
        )
        .await
        .unwrap();

        assert!(
            remove_blacklist_entry(&database, chat, ContentKind::Animation, "bad-gif")
                .await
                .unwrap()
        );
        assert!(list_blacklist(&database, chat).await.unwrap().is_empty());
    }
}
