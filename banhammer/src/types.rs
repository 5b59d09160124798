use std::fmt::Display;

use chrono::{DateTime, Utc};

use crate::GLOBAL_SCOPE_ID;

/// Identifier of a group chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(pub i64);

/// Identifier of a user, whether a sender, an admin, or an inline bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

/// Identifier of a message within its chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// Identifier of a log channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub i64);

/// Transport-assigned identifier of a delivery. The same event may arrive
/// more than once under the same id; it must never be actioned twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub i64);

impl Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Visibility boundary of a blacklist entry: one group, or the pool shared
/// between all groups that opted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Group(ChatId),
    Global,
}

impl Scope {
    /// Database encoding. The global pool is stored under chat id 0.
    pub(crate) fn encode(self) -> i64 {
        match self {
            Scope::Group(chat) => chat.0,
            Scope::Global => GLOBAL_SCOPE_ID,
        }
    }

    pub(crate) fn decode(value: i64) -> Self {
        if value == GLOBAL_SCOPE_ID {
            Scope::Global
        } else {
            Scope::Group(ChatId(value))
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Group(chat) => write!(f, "group {chat}"),
            Scope::Global => write!(f, "global pool"),
        }
    }
}

/// Kind of content a blacklist entry or fingerprint refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Link,
    StickerSet,
    Animation,
    InlineBot,
    Text,
}

impl ContentKind {
    /// Stable database code for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Link => "link",
            ContentKind::StickerSet => "sticker",
            ContentKind::Animation => "gif",
            ContentKind::InlineBot => "bot",
            ContentKind::Text => "text",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Some(match value {
            "link" => ContentKind::Link,
            "sticker" => ContentKind::StickerSet,
            "gif" => ContentKind::Animation,
            "bot" => ContentKind::InlineBot,
            "text" => ContentKind::Text,
            _ => return None,
        })
    }
}

impl Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw content of an incoming message, already reduced by the transport to
/// the facet that matters for moderation.
///
/// A message relayed through an inline bot should arrive as [`InlineBot`]
/// even when it also carries text: the relaying bot identifies the spam wave
/// more reliably than the (cheaply varied) text does.
///
/// [`InlineBot`]: Content::InlineBot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// A message that consists of a single link.
    Link { text: String },
    /// A sticker, identified by the platform's stable unique file id.
    StickerSet { file_unique_id: String },
    /// An animation ("GIF"), identified by the platform's file id.
    Animation { file_id: String },
    /// A message sent via an inline bot, identified by the bot's username.
    InlineBot { username: String },
    /// A plain text message.
    Text { text: String },
    /// Media this engine has no rules for (voice notes, polls, ...).
    Unsupported,
}

impl Content {
    /// The message text, if this content carries any. This is what the spam
    /// detector evaluates.
    pub fn text(&self) -> Option<&str> {
        match self {
            Content::Link { text } | Content::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Canonical, comparable key derived from message content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub kind: ContentKind,
    pub key: String,
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

/// A single blacklist entry. Immutable once created, except for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub scope: Scope,
    pub kind: ContentKind,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    /// For global entries, the group that contributed it.
    pub contributor: Option<ChatId>,
}

impl Display for BlacklistEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.fingerprint, self.scope)
    }
}

/// One incoming message event as delivered by the transport.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub event_id: EventId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    /// Whether the sender holds admin or owner privilege in the chat.
    /// Admin messages are never evaluated.
    pub sender_is_admin: bool,
    pub message_id: MessageId,
    pub content: Content,
}

/// What the orchestrator decided to do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationAction {
    None,
    /// Send a log record without deleting anything. Not produced by the
    /// current decision rule; kept so a softer policy can be slotted in.
    Warn,
    DeleteAndBan,
}

/// Why a message was flagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// Content matched a blacklist entry.
    Blacklisted(BlacklistEntry),
    /// A detector rule triggered; the string is the rule's own description.
    Detector(String),
}

impl Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::Blacklisted(entry) => write!(f, "blacklisted {entry}"),
            Reason::Detector(text) => f.write_str(text),
        }
    }
}

/// Transient decision value. Never persisted.
#[derive(Debug, Clone)]
pub struct ModerationDecision {
    pub action: ModerationAction,
    /// Ordered: a blacklist match always comes before detector reasons.
    pub reasons: Vec<Reason>,
}

impl ModerationDecision {
    pub fn clean() -> Self {
        ModerationDecision {
            action: ModerationAction::None,
            reasons: Vec::new(),
        }
    }

    /// The matched blacklist entry, if any reason carries one.
    pub fn matched_entry(&self) -> Option<&BlacklistEntry> {
        self.reasons.iter().find_map(|reason| match reason {
            Reason::Blacklisted(entry) => Some(entry),
            Reason::Detector(_) => None,
        })
    }
}
