//! Moderation engine for group chats: blacklist matching, admin report
//! aggregation, and delete/ban decisions with audit logging.
//!
//! The chat platform transport is not part of this crate; it feeds
//! [`MessageEvent`]s into [`Moderator::handle_event`] and implements the
//! [`ChatPlatform`] command surface.

/// Sanitized link type. Probably should go into types lol
mod sanitized_link;

/// Various types used throughout.
mod types;

/// Deriving canonical fingerprints from message content.
mod fingerprint;

/// Rule-based spam detector.
mod detector;

/// The database.
mod database;

/// Scope resolution for the shared global blacklist.
mod sharing;

/// The command surface the chat platform must provide.
mod platform;

/// Functions that perform stuff via the platform.
mod actions;

/// The per-event moderation orchestrator.
mod moderator;

/// Admin-invoked commands.
mod commands;

pub use commands::*;
pub use database::{Database, Error as StorageError, GlobalStats, GroupConfig, InsertOutcome, ReportOutcome};
pub use detector::{evaluate, DetectionResult, DetectionThresholds};
pub use fingerprint::{fingerprint, normalize_text, text_key};
pub use moderator::{ModerationError, Moderator, Outcome};
pub use platform::{ActionError, ChatPlatform};
pub use sanitized_link::{parse_link_like_telegram, SanitizedLink};
pub use sharing::{contribution_scopes, query_scopes};
pub use types::*;

/// Distinct admin reports of the same text fingerprint required before it is
/// promoted into the group's blacklist.
pub const REPORT_PROMOTION_THRESHOLD: u32 = 3;

/// Scope id reserved for the shared global pool. No real chat has id 0.
pub(crate) const GLOBAL_SCOPE_ID: i64 = 0;
