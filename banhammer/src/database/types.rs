use std::fmt::Display;

use crate::{
    detector::DetectionThresholds,
    types::{BlacklistEntry, ChannelId, ChatId},
};

/// Result of [`Database::insert_entry`].
///
/// [`Database::insert_entry`]: super::Database::insert_entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new entry was inserted.
    Inserted,
    /// The entry already existed; nothing changed.
    AlreadyPresent,
}

impl InsertOutcome {
    /// Returns whether the insert actually created the entry.
    #[must_use]
    pub fn newly_created(self) -> bool {
        matches!(self, InsertOutcome::Inserted)
    }
}

/// Result of [`Database::record_report`].
///
/// [`Database::record_report`]: super::Database::record_report
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The reported fingerprint is already blacklisted in a scope this
    /// group consults. The report did not count towards anything.
    AlreadyBlacklisted,
    /// The report was recorded (or repeated); promotion not reached yet.
    Counted {
        /// Distinct admins that have reported this fingerprint so far.
        distinct_reporters: u32,
    },
    /// This report was the one that reached the threshold. The returned
    /// entry is the group-scoped one that was created.
    Promoted { entry: BlacklistEntry },
}

impl Display for ReportOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportOutcome::AlreadyBlacklisted => write!(f, "already blacklisted"),
            ReportOutcome::Counted { distinct_reporters } => {
                write!(f, "reported by {distinct_reporters} admin(s)")
            }
            ReportOutcome::Promoted { entry } => write!(f, "promoted to blacklist: {entry}"),
        }
    }
}

/// Per-group configuration. One row per group, created with defaults on
/// first interaction and never auto-deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupConfig {
    pub chat_id: ChatId,
    /// Whether this group's entries are contributed to the global pool.
    pub contribute_global: bool,
    /// Whether the global pool is consulted when matching this group's
    /// messages.
    pub use_global: bool,
    /// Channel moderation actions are logged to, if configured.
    pub log_channel: Option<ChannelId>,
    pub thresholds: DetectionThresholds,
}

/// Aggregate statistics over the global pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalStats {
    pub total_entries: u64,
    pub contributing_groups: u64,
    /// Entry counts per kind code, e.g. `("link", 12)`.
    pub per_kind: Vec<(String, u64)>,
}
