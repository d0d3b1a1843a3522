//! SQLite adapter for every `fsb-core` storage port.
//!
//! One `tokio-rusqlite` connection per store: all statements run on its single
//! background thread. Conditional updates (`insert_premium_if_inactive`,
//! `debit_token`, `redeem_token`) are single SQL statements, so they stay
//! atomic even when several bot processes share the database file.

use std::{path::Path, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{error, info, warn};

use fsb_core::{
    domain::{BatchId, ChatId, CommandUsage, MessageId, PendingDeletion, UserId},
    premium::{PlanType, PremiumRecord},
    store::{DeletionStore, PremiumStore, TokenDebit, TokenStore, UsageStore, UserStore},
    verification::VerificationToken,
    Error, Result,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS command_usage (
    user_id INTEGER PRIMARY KEY NOT NULL,
    count INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0),
    last_reset_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS premium_users (
    user_id INTEGER PRIMARY KEY NOT NULL,
    plan_type TEXT NOT NULL,
    tokens_remaining INTEGER NOT NULL CHECK (tokens_remaining >= -1),
    granted_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS verification_tokens (
    token TEXT PRIMARY KEY NOT NULL,
    user_id INTEGER NOT NULL,
    issued_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    consumed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_verification_tokens_expires ON verification_tokens(expires_at);
CREATE TABLE IF NOT EXISTS pending_deletions (
    batch_id TEXT PRIMARY KEY NOT NULL,
    chat_id INTEGER NOT NULL,
    message_ids TEXT NOT NULL,
    delete_at INTEGER NOT NULL,
    source_link TEXT
);
CREATE INDEX IF NOT EXISTS idx_pending_deletions_due ON pending_deletions(delete_at);
CREATE TABLE IF NOT EXISTS bot_users (
    user_id INTEGER PRIMARY KEY NOT NULL,
    joined_at INTEGER NOT NULL
);
";

/// Convert a tokio-rusqlite error into `Error::Storage`.
fn map_tr_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> Error {
    Error::Storage(format!("sqlite: {e}"))
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Storage(format!("timestamp out of range: {ms}")))
}

/// Persistent store backed by one SQLite database file.
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = tokio_rusqlite::Connection::open(&path)
            .await
            .map_err(|e| Error::Storage(format!("failed to open {}: {e}", path.display())))?;
        let store = Self::init(conn).await?;
        info!(path = %path.display(), "sqlite store opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|e| Error::Storage(format!("failed to open in-memory db: {e}")))?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            // FULL: a scheduled deletion must survive a crash right after commit.
            conn.pragma_update(None, "synchronous", "FULL")?;
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute_batch(SCHEMA)?;
            // Databases created before batches carried their deep link.
            let has_link: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('pending_deletions')
                 WHERE name = 'source_link'",
                [],
                |row| row.get(0),
            )?;
            if !has_link {
                conn.execute("ALTER TABLE pending_deletions ADD COLUMN source_link TEXT", [])?;
            }
            Ok(())
        })
        .await
        .map_err(map_tr_err)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn get_usage(&self, user_id: UserId) -> Result<Option<CommandUsage>> {
        let row = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT count, last_reset_at FROM command_usage WHERE user_id = ?1",
                    params![user_id.0],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()
            })
            .await
            .map_err(map_tr_err)?;

        row.map(|(count, reset_ms)| {
            Ok(CommandUsage {
                user_id,
                count: u32::try_from(count)
                    .map_err(|_| Error::Storage(format!("corrupt usage count: {count}")))?,
                last_reset_at: from_millis(reset_ms)?,
            })
        })
        .transpose()
    }

    async fn put_usage(&self, usage: &CommandUsage) -> Result<()> {
        let user_id = usage.user_id.0;
        let count = i64::from(usage.count);
        let reset_ms = to_millis(usage.last_reset_at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO command_usage (user_id, count, last_reset_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(user_id) DO UPDATE SET
                       count = excluded.count,
                       last_reset_at = excluded.last_reset_at",
                    params![user_id, count, reset_ms],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }
}

type RawPremium = (i64, String, i64, i64);

fn premium_from_raw((user_id, plan, tokens, granted_ms): RawPremium) -> Result<PremiumRecord> {
    Ok(PremiumRecord {
        user_id: UserId(user_id),
        plan: PlanType::from_str(&plan)
            .map_err(|_| Error::Storage(format!("corrupt plan type: {plan}")))?,
        tokens_remaining: tokens,
        granted_at: from_millis(granted_ms)?,
    })
}

#[async_trait]
impl PremiumStore for SqliteStore {
    async fn get_premium(&self, user_id: UserId) -> Result<Option<PremiumRecord>> {
        let raw = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT user_id, plan_type, tokens_remaining, granted_at
                     FROM premium_users WHERE user_id = ?1",
                    params![user_id.0],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
            })
            .await
            .map_err(map_tr_err)?;
        raw.map(premium_from_raw).transpose()
    }

    async fn insert_premium_if_inactive(&self, record: &PremiumRecord) -> Result<bool> {
        let user_id = record.user_id.0;
        let plan = record.plan.as_str().to_string();
        let tokens = record.tokens_remaining;
        let granted_ms = to_millis(record.granted_at);
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO premium_users (user_id, plan_type, tokens_remaining, granted_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(user_id) DO UPDATE SET
                       plan_type = excluded.plan_type,
                       tokens_remaining = excluded.tokens_remaining,
                       granted_at = excluded.granted_at
                     WHERE premium_users.tokens_remaining = 0",
                    params![user_id, plan, tokens, granted_ms],
                )
            })
            .await
            .map_err(map_tr_err)?;
        Ok(changed == 1)
    }

    async fn delete_premium(&self, user_id: UserId) -> Result<bool> {
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM premium_users WHERE user_id = ?1",
                    params![user_id.0],
                )
            })
            .await
            .map_err(map_tr_err)?;
        Ok(changed > 0)
    }

    async fn debit_token(&self, user_id: UserId) -> Result<TokenDebit> {
        self.conn
            .call(move |conn| {
                let debited: Option<i64> = conn
                    .query_row(
                        "UPDATE premium_users SET tokens_remaining = tokens_remaining - 1
                         WHERE user_id = ?1 AND tokens_remaining > 0
                         RETURNING tokens_remaining",
                        params![user_id.0],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(remaining) = debited {
                    return Ok(TokenDebit::Debited { remaining });
                }

                let balance: Option<i64> = conn
                    .query_row(
                        "SELECT tokens_remaining FROM premium_users WHERE user_id = ?1",
                        params![user_id.0],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(match balance {
                    None => TokenDebit::Missing,
                    Some(-1) => TokenDebit::Unlimited,
                    Some(_) => TokenDebit::Exhausted,
                })
            })
            .await
            .map_err(map_tr_err)
    }

    async fn list_premium(&self) -> Result<Vec<PremiumRecord>> {
        let raws: Vec<RawPremium> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id, plan_type, tokens_remaining, granted_at
                     FROM premium_users ORDER BY user_id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)?;
        raws.into_iter().map(premium_from_raw).collect()
    }
}

#[async_trait]
impl TokenStore for SqliteStore {
    async fn insert_token(&self, token: &VerificationToken) -> Result<bool> {
        let t = token.clone();
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO verification_tokens
                       (token, user_id, issued_at, expires_at, consumed)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        t.token,
                        t.user_id.0,
                        to_millis(t.issued_at),
                        to_millis(t.expires_at),
                        t.consumed,
                    ],
                )
            })
            .await
            .map_err(map_tr_err)?;
        Ok(changed == 1)
    }

    async fn get_token(&self, token: &str) -> Result<Option<VerificationToken>> {
        let key = token.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT token, user_id, issued_at, expires_at, consumed
                     FROM verification_tokens WHERE token = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, bool>(4)?,
                        ))
                    },
                )
                .optional()
            })
            .await
            .map_err(map_tr_err)?;

        raw.map(|(token, user_id, issued_ms, expires_ms, consumed)| {
            Ok(VerificationToken {
                user_id: UserId(user_id),
                token,
                issued_at: from_millis(issued_ms)?,
                expires_at: from_millis(expires_ms)?,
                consumed,
            })
        })
        .transpose()
    }

    async fn redeem_token(
        &self,
        user_id: UserId,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = token.to_string();
        let now_ms = to_millis(now);
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE verification_tokens SET consumed = 1
                     WHERE token = ?1 AND user_id = ?2 AND consumed = 0 AND expires_at > ?3",
                    params![key, user_id.0, now_ms],
                )
            })
            .await
            .map_err(map_tr_err)?;
        Ok(changed == 1)
    }

    async fn release_token(&self, token: &str) -> Result<bool> {
        let key = token.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE verification_tokens SET consumed = 0 WHERE token = ?1 AND consumed = 1",
                    params![key],
                )
            })
            .await
            .map_err(map_tr_err)?;
        Ok(changed == 1)
    }

    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let now_ms = to_millis(now);
        let removed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM verification_tokens WHERE expires_at <= ?1",
                    params![now_ms],
                )
            })
            .await
            .map_err(map_tr_err)?;
        Ok(removed as u64)
    }
}

type RawDeletion = (String, i64, String, i64, Option<String>);

fn deletion_from_raw(
    (batch_id, chat_id, ids_json, delete_ms, source_link): RawDeletion,
) -> Result<PendingDeletion> {
    let ids: Vec<i32> = serde_json::from_str(&ids_json)?;
    Ok(PendingDeletion {
        batch_id: BatchId(batch_id),
        chat_id: ChatId(chat_id),
        message_ids: ids.into_iter().map(MessageId).collect(),
        delete_at: from_millis(delete_ms)?,
        source_link,
    })
}

impl SqliteStore {
    /// Load batches, optionally only those due by `due_before_ms`.
    ///
    /// A row that cannot be decoded is logged and removed so that it does not
    /// hold back every other batch on each sweep.
    async fn query_deletions(&self, due_before_ms: Option<i64>) -> Result<Vec<PendingDeletion>> {
        let rows: Vec<(i64, std::result::Result<RawDeletion, String>)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT rowid, batch_id, chat_id, message_ids, delete_at, source_link
                     FROM pending_deletions
                     WHERE ?1 IS NULL OR delete_at <= ?1
                     ORDER BY delete_at, batch_id",
                )?;
                let mut rows = stmt.query(params![due_before_ms])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let rowid: i64 = row.get(0)?;
                    let raw: std::result::Result<RawDeletion, String> = (|| {
                        Ok::<_, rusqlite::Error>((
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    })()
                    .map_err(|e| e.to_string());
                    out.push((rowid, raw));
                }
                Ok(out)
            })
            .await
            .map_err(map_tr_err)?;

        let mut batches = Vec::with_capacity(rows.len());
        let mut unreadable = Vec::new();
        for (rowid, raw) in rows {
            match raw.map_err(Error::Storage).and_then(deletion_from_raw) {
                Ok(batch) => batches.push(batch),
                Err(e) => {
                    error!(rowid, error = %e, "dropping unreadable pending deletion");
                    unreadable.push(rowid);
                }
            }
        }
        if !unreadable.is_empty() {
            if let Err(e) = self.retire_rows(unreadable).await {
                warn!(error = %e, "failed to remove unreadable pending deletions");
            }
        }
        Ok(batches)
    }

    async fn retire_rows(&self, rowids: Vec<i64>) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare("DELETE FROM pending_deletions WHERE rowid = ?1")?;
                    for rowid in &rowids {
                        stmt.execute(params![rowid])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }
}

#[async_trait]
impl DeletionStore for SqliteStore {
    async fn insert_deletion(&self, record: &PendingDeletion) -> Result<()> {
        let ids: Vec<i32> = record.message_ids.iter().map(|m| m.0).collect();
        let ids_json = serde_json::to_string(&ids)?;
        let batch_id = record.batch_id.0.clone();
        let chat_id = record.chat_id.0;
        let delete_ms = to_millis(record.delete_at);
        let source_link = record.source_link.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO pending_deletions
                       (batch_id, chat_id, message_ids, delete_at, source_link)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![batch_id, chat_id, ids_json, delete_ms, source_link],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    async fn due_deletions(&self, now: DateTime<Utc>) -> Result<Vec<PendingDeletion>> {
        self.query_deletions(Some(to_millis(now))).await
    }

    async fn all_deletions(&self) -> Result<Vec<PendingDeletion>> {
        self.query_deletions(None).await
    }

    async fn remove_deletion(&self, batch_id: &BatchId) -> Result<bool> {
        let key = batch_id.0.clone();
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM pending_deletions WHERE batch_id = ?1",
                    params![key],
                )
            })
            .await
            .map_err(map_tr_err)?;
        Ok(changed > 0)
    }
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn register_user(&self, user_id: UserId, now: DateTime<Utc>) -> Result<bool> {
        let joined_ms = to_millis(now);
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO bot_users (user_id, joined_at) VALUES (?1, ?2)",
                    params![user_id.0, joined_ms],
                )
            })
            .await
            .map_err(map_tr_err)?;
        Ok(changed == 1)
    }

    async fn count_users(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM bot_users", [], |row| row.get(0)))
            .await
            .map_err(map_tr_err)?;
        Ok(count.max(0) as u64)
    }
}
