mod types;

use std::{str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use futures_util::Stream;
pub use sqlx::Error;
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, Sqlite,
};
pub use types::{GlobalStats, GroupConfig, InsertOutcome, ReportOutcome};

use crate::{
    detector::DetectionThresholds,
    types::{BlacklistEntry, ChannelId, ChatId, ContentKind, Fingerprint, Scope, UserId},
};

type Pool = sqlx::Pool<Sqlite>;

pub struct Database {
    pool: Pool,
}

impl Database {
    /// Open (creating if needed) the database at the given sqlx URL, like
    /// `sqlite:banhammer.sqlite`.
    pub async fn open(db_url: &str) -> Result<Arc<Database>, Error> {
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            Sqlite::create_database(db_url).await?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(32)
            .connect_with(
                SqliteConnectOptions::from_str(db_url)?
                    .pragma("cache_size", "-32768")
                    .busy_timeout(std::time::Duration::from_secs(600)),
            )
            .await?;

        Self::from_pool(pool).await
    }

    /// In-memory database for tests. A single connection, since every
    /// in-memory connection is its own separate database.
    pub async fn open_in_memory() -> Result<Arc<Database>, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: Pool) -> Result<Arc<Database>, Error> {
        // Do some init. Create the tables...

        // BLACKLIST:
        // scope (chat id the entry is visible in; 0 for the global pool)
        // kind ('link', 'sticker', 'gif', 'bot', 'text')
        // fingerprint (canonical key for the content; case-sensitive, since
        //              platform file ids are)
        // created_at (date+time in UTC)
        // contributor (for global entries, the chat that contributed it)
        sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS blacklist (
                    scope INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    fingerprint TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    contributor INTEGER NULL,
                    PRIMARY KEY (scope, kind, fingerprint)
                ) STRICT;",
        )
        .execute(&pool)
        .await?;

        // REPORTS:
        // One row per distinct admin that reported a fingerprint in a chat.
        // Rows are deleted wholesale when the fingerprint gets promoted.
        sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS reports (
                    chat_id INTEGER NOT NULL,
                    fingerprint TEXT NOT NULL,
                    reporter INTEGER NOT NULL,
                    snapshot TEXT NULL,
                    reported_at TEXT NOT NULL,
                    PRIMARY KEY (chat_id, fingerprint, reporter)
                ) STRICT;",
        )
        .execute(&pool)
        .await?;

        // GROUP_SETTINGS:
        // Sharing flags, log channel and detection thresholds, one row per
        // group. NULL threshold columns mean "use the system default".
        sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS group_settings (
                    chat_id INTEGER PRIMARY KEY,
                    contribute_global INTEGER NOT NULL DEFAULT 0,
                    use_global INTEGER NOT NULL DEFAULT 1,
                    log_channel INTEGER NULL,
                    banned_words TEXT NULL,
                    max_links INTEGER NULL,
                    max_caps_percent INTEGER NULL,
                    max_repeat_run INTEGER NULL,
                    max_length INTEGER NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                ) STRICT;",
        )
        .execute(&pool)
        .await?;

        // BAN_RECORDS:
        // Audit trail of bans this engine issued, and their closure.
        sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS ban_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    chat_id INTEGER NOT NULL,
                    user_id INTEGER NOT NULL,
                    reason TEXT NOT NULL,
                    banned_at TEXT NOT NULL,
                    unbanned_at TEXT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1
                ) STRICT;",
        )
        .execute(&pool)
        .await?;

        Ok(Arc::new(Database { pool }))
    }

    /// Insert a blacklist entry. Idempotent: inserting an entry that already
    /// exists is a no-op, not an error, and the outcome says which happened.
    pub async fn insert_entry(
        &self,
        scope: Scope,
        kind: ContentKind,
        fingerprint: &str,
        contributor: Option<ChatId>,
    ) -> Result<InsertOutcome, Error> {
        let result = sqlx::query(
            "INSERT INTO blacklist(scope, kind, fingerprint, created_at, contributor)
            VALUES (?, ?, ?, ?, ?)
        ON CONFLICT DO NOTHING;",
        )
        .bind(scope.encode())
        .bind(kind.as_str())
        .bind(fingerprint)
        .bind(Utc::now())
        .bind(contributor.map(|chat| chat.0))
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyPresent
        })
    }

    /// Remove a blacklist entry. Returns whether it existed.
    pub async fn remove_entry(
        &self,
        scope: Scope,
        kind: ContentKind,
        fingerprint: &str,
    ) -> Result<bool, Error> {
        let result = sqlx::query("DELETE FROM blacklist WHERE scope=? AND kind=? AND fingerprint=?;")
            .bind(scope.encode())
            .bind(kind.as_str())
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch one blacklist entry, if present.
    pub async fn get_entry(
        &self,
        scope: Scope,
        kind: ContentKind,
        fingerprint: &str,
    ) -> Result<Option<BlacklistEntry>, Error> {
        sqlx::query(
            "SELECT scope, kind, fingerprint, created_at, contributor FROM blacklist
            WHERE scope=? AND kind=? AND fingerprint=?;",
        )
        .bind(scope.encode())
        .bind(kind.as_str())
        .bind(fingerprint)
        .map(entry_from_row)
        .fetch_optional(&self.pool)
        .await
    }

    /// Look for a blacklist entry matching any of the candidate fingerprints
    /// in any of the given scopes. Scopes are consulted in the order given,
    /// so putting the group's own scope first makes a local match win over a
    /// global one.
    pub async fn find_match(
        &self,
        scopes: &[Scope],
        candidates: &[Fingerprint],
    ) -> Result<Option<BlacklistEntry>, Error> {
        for &scope in scopes {
            for candidate in candidates {
                if let Some(entry) = self.get_entry(scope, candidate.kind, &candidate.key).await? {
                    return Ok(Some(entry));
                }
            }
        }

        Ok(None)
    }

    /// All entries in one scope, ordered by insertion time so command output
    /// is deterministic. The stream borrows the database; collect or drop it
    /// before the next write, and call again to restart.
    pub fn list_entries(
        &self,
        scope: Scope,
    ) -> impl Stream<Item = Result<BlacklistEntry, Error>> + '_ {
        sqlx::query(
            "SELECT scope, kind, fingerprint, created_at, contributor FROM blacklist
            WHERE scope=? ORDER BY created_at ASC, rowid ASC;",
        )
        .bind(scope.encode())
        .map(entry_from_row)
        .fetch(&self.pool)
    }

    /// Amount of entries in one scope.
    pub async fn count_entries(&self, scope: Scope) -> Result<u64, Error> {
        sqlx::query("SELECT COUNT(*) FROM blacklist WHERE scope=?;")
            .bind(scope.encode())
            .map(|row: SqliteRow| row.get::<i64, _>(0) as u64)
            .fetch_one(&self.pool)
            .await
    }

    /// Remove entries whose fingerprint is empty or blank. Those can only
    /// appear through upstream normalization bugs, but once present they
    /// would match nothing and clutter listings forever. Returns the amount
    /// removed.
    pub async fn cleanup_invalid(&self) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM blacklist WHERE trim(fingerprint) = '';")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Record one admin's report of a fingerprint and, if this report is the
    /// one that reaches `threshold` distinct reporters, promote the
    /// fingerprint into every scope in `contribution`.
    ///
    /// The whole add-then-check-then-promote sequence runs in one database
    /// transaction, so two reports racing at the threshold boundary cannot
    /// double-promote or miss the promotion, and a storage failure cannot
    /// leave a half-promoted record behind.
    ///
    /// A repeated report from the same admin changes nothing and returns the
    /// current distinct count. A report of content already blacklisted in
    /// any of `query_scopes` returns [`ReportOutcome::AlreadyBlacklisted`]
    /// without counting.
    pub async fn record_report(
        &self,
        chat: ChatId,
        fingerprint: &Fingerprint,
        reporter: UserId,
        snapshot: Option<&str>,
        query_scopes: &[Scope],
        contribution: &[Scope],
        threshold: u32,
    ) -> Result<ReportOutcome, Error> {
        let mut tx = self.pool.begin().await?;

        for &scope in query_scopes {
            let hit = sqlx::query("SELECT 1 FROM blacklist WHERE scope=? AND kind=? AND fingerprint=?;")
                .bind(scope.encode())
                .bind(fingerprint.kind.as_str())
                .bind(fingerprint.key.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            if hit.is_some() {
                tx.commit().await?;
                return Ok(ReportOutcome::AlreadyBlacklisted);
            }
        }

        let newly_counted = sqlx::query(
            "INSERT INTO reports(chat_id, fingerprint, reporter, snapshot, reported_at)
            VALUES (?, ?, ?, ?, ?)
        ON CONFLICT DO NOTHING;",
        )
        .bind(chat.0)
        .bind(fingerprint.key.as_str())
        .bind(reporter.0)
        .bind(snapshot)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let distinct_reporters = sqlx::query("SELECT COUNT(*) FROM reports WHERE chat_id=? AND fingerprint=?;")
            .bind(chat.0)
            .bind(fingerprint.key.as_str())
            .map(|row: SqliteRow| row.get::<i64, _>(0) as u32)
            .fetch_one(&mut *tx)
            .await?;

        if !(newly_counted && distinct_reporters >= threshold) {
            tx.commit().await?;
            return Ok(ReportOutcome::Counted { distinct_reporters });
        }

        // Threshold reached for the first time. Promote.
        let created_at = Utc::now();
        for &scope in contribution {
            let contributor = match scope {
                Scope::Global => Some(chat.0),
                Scope::Group(_) => None,
            };
            sqlx::query(
                "INSERT INTO blacklist(scope, kind, fingerprint, created_at, contributor)
                VALUES (?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING;",
            )
            .bind(scope.encode())
            .bind(fingerprint.kind.as_str())
            .bind(fingerprint.key.as_str())
            .bind(created_at)
            .bind(contributor)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM reports WHERE chat_id=? AND fingerprint=?;")
            .bind(chat.0)
            .bind(fingerprint.key.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        log::info!(
            "Promoted {} in chat {chat} after {distinct_reporters} distinct reports",
            fingerprint.key
        );

        Ok(ReportOutcome::Promoted {
            entry: BlacklistEntry {
                scope: Scope::Group(chat),
                kind: fingerprint.kind,
                fingerprint: fingerprint.key.clone(),
                created_at,
                contributor: None,
            },
        })
    }

    /// Get a group's configuration, creating the default row if this is the
    /// group's first interaction.
    pub async fn get_group_config(&self, chat: ChatId) -> Result<GroupConfig, Error> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO group_settings(chat_id, created_at, updated_at)
            VALUES (?, ?, ?)
        ON CONFLICT DO NOTHING;",
        )
        .bind(chat.0)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "SELECT contribute_global, use_global, log_channel,
                banned_words, max_links, max_caps_percent, max_repeat_run, max_length
            FROM group_settings WHERE chat_id=?;",
        )
        .bind(chat.0)
        .map(|row: SqliteRow| config_from_row(chat, &row))
        .fetch_one(&self.pool)
        .await
    }

    /// Update the global sharing flags. Passing [`None`] leaves a flag
    /// unchanged. Turning contribution off also withdraws everything the
    /// group contributed to the global pool; the amount removed is returned.
    pub async fn set_global(
        &self,
        chat: ChatId,
        contribute: Option<bool>,
        use_global: Option<bool>,
    ) -> Result<u64, Error> {
        // Make sure the row exists first.
        self.get_group_config(chat).await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE group_settings
            SET contribute_global=COALESCE(?, contribute_global),
                use_global=COALESCE(?, use_global),
                updated_at=?
            WHERE chat_id=?;",
        )
        .bind(contribute)
        .bind(use_global)
        .bind(Utc::now())
        .bind(chat.0)
        .execute(&mut *tx)
        .await?;

        let mut withdrawn = 0;
        if contribute == Some(false) {
            withdrawn = sqlx::query("DELETE FROM blacklist WHERE scope=? AND contributor=?;")
                .bind(Scope::Global.encode())
                .bind(chat.0)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(withdrawn)
    }

    /// Set or clear the channel this group's moderation actions are logged
    /// to.
    pub async fn set_log_channel(
        &self,
        chat: ChatId,
        channel: Option<ChannelId>,
    ) -> Result<(), Error> {
        self.get_group_config(chat).await?;

        sqlx::query("UPDATE group_settings SET log_channel=?, updated_at=? WHERE chat_id=?;")
            .bind(channel.map(|c| c.0))
            .bind(Utc::now())
            .bind(chat.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Overwrite the group's detection thresholds.
    pub async fn set_thresholds(
        &self,
        chat: ChatId,
        thresholds: &DetectionThresholds,
    ) -> Result<(), Error> {
        self.get_group_config(chat).await?;

        sqlx::query(
            "UPDATE group_settings
            SET banned_words=?, max_links=?, max_caps_percent=?,
                max_repeat_run=?, max_length=?, updated_at=?
            WHERE chat_id=?;",
        )
        .bind(thresholds.banned_words.join("\n"))
        .bind(i64::from(thresholds.max_links))
        .bind(i64::from(thresholds.max_caps_percent))
        .bind(i64::from(thresholds.max_repeat_run))
        .bind(i64::from(thresholds.max_length))
        .bind(Utc::now())
        .bind(chat.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Amount of global entries this group has contributed.
    pub async fn contribution_count(&self, chat: ChatId) -> Result<u64, Error> {
        sqlx::query("SELECT COUNT(*) FROM blacklist WHERE scope=? AND contributor=?;")
            .bind(Scope::Global.encode())
            .bind(chat.0)
            .map(|row: SqliteRow| row.get::<i64, _>(0) as u64)
            .fetch_one(&self.pool)
            .await
    }

    /// Aggregate statistics over the global pool.
    pub async fn global_stats(&self) -> Result<GlobalStats, Error> {
        let total_entries = self.count_entries(Scope::Global).await?;

        let contributing_groups =
            sqlx::query("SELECT COUNT(*) FROM group_settings WHERE contribute_global=1;")
                .map(|row: SqliteRow| row.get::<i64, _>(0) as u64)
                .fetch_one(&self.pool)
                .await?;

        let per_kind = sqlx::query(
            "SELECT kind, COUNT(*) FROM blacklist WHERE scope=? GROUP BY kind ORDER BY kind;",
        )
        .bind(Scope::Global.encode())
        .map(|row: SqliteRow| (row.get::<String, _>(0), row.get::<i64, _>(1) as u64))
        .fetch_all(&self.pool)
        .await?;

        Ok(GlobalStats {
            total_entries,
            contributing_groups,
            per_kind,
        })
    }

    /// Record that a user was banned and why.
    pub async fn record_ban(&self, chat: ChatId, user: UserId, reason: &str) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO ban_records(chat_id, user_id, reason, banned_at) VALUES (?, ?, ?, ?);",
        )
        .bind(chat.0)
        .bind(user.0)
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close any active ban records for this user in this chat. Returns
    /// whether there was one.
    pub async fn close_ban(&self, chat: ChatId, user: UserId) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE ban_records SET unbanned_at=?, is_active=0
            WHERE chat_id=? AND user_id=? AND is_active=1;",
        )
        .bind(Utc::now())
        .bind(chat.0)
        .bind(user.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn entry_from_row(row: SqliteRow) -> BlacklistEntry {
    let kind_code: String = row.get("kind");
    let kind = ContentKind::from_str(&kind_code)
        .unwrap_or_else(|| panic!("Unknown blacklist kind: {kind_code}"));

    BlacklistEntry {
        scope: Scope::decode(row.get("scope")),
        kind,
        fingerprint: row.get("fingerprint"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        contributor: row.get::<Option<i64>, _>("contributor").map(ChatId),
    }
}

fn config_from_row(chat: ChatId, row: &SqliteRow) -> GroupConfig {
    let defaults = DetectionThresholds::default();

    let banned_words = row
        .get::<Option<String>, _>("banned_words")
        .map(|words| {
            words
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or(defaults.banned_words);

    GroupConfig {
        chat_id: chat,
        contribute_global: row.get("contribute_global"),
        use_global: row.get("use_global"),
        log_channel: row.get::<Option<i64>, _>("log_channel").map(ChannelId),
        thresholds: DetectionThresholds {
            banned_words,
            max_links: row
                .get::<Option<i64>, _>("max_links")
                .map_or(defaults.max_links, |v| v as u32),
            max_caps_percent: row
                .get::<Option<i64>, _>("max_caps_percent")
                .map_or(defaults.max_caps_percent, |v| v as u8),
            max_repeat_run: row
                .get::<Option<i64>, _>("max_repeat_run")
                .map_or(defaults.max_repeat_run, |v| v as u32),
            max_length: row
                .get::<Option<i64>, _>("max_length")
                .map_or(defaults.max_length, |v| v as u32),
        },
    }
}
