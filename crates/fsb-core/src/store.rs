//! Storage ports.
//!
//! Every engine talks to persistence through these traits. The SQLite adapter
//! (`fsb-sqlite`) is the production implementation; [`crate::memory::MemoryStore`]
//! backs tests. Conditional operations (`insert_premium_if_inactive`,
//! `debit_token`, `redeem_token`) must be atomic at the store layer: the engines
//! never emulate them with a read followed by a write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{BatchId, CommandUsage, PendingDeletion, UserId},
    premium::PremiumRecord,
    verification::VerificationToken,
    Result,
};

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn get_usage(&self, user_id: UserId) -> Result<Option<CommandUsage>>;
    async fn put_usage(&self, usage: &CommandUsage) -> Result<()>;
}

/// Result of an atomic premium token debit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenDebit {
    /// Balance was positive and has been decremented.
    Debited { remaining: i64 },
    /// Unlimited balance; nothing changed.
    Unlimited,
    /// Balance is zero.
    Exhausted,
    /// No premium record.
    Missing,
}

#[async_trait]
pub trait PremiumStore: Send + Sync {
    async fn get_premium(&self, user_id: UserId) -> Result<Option<PremiumRecord>>;

    /// Insert `record` unless an active record (balance != 0) already exists.
    ///
    /// Returns `false` when an active record blocked the insert. An inert record
    /// (balance 0) is overwritten.
    async fn insert_premium_if_inactive(&self, record: &PremiumRecord) -> Result<bool>;

    /// Returns `true` if a record was deleted.
    async fn delete_premium(&self, user_id: UserId) -> Result<bool>;

    async fn debit_token(&self, user_id: UserId) -> Result<TokenDebit>;

    async fn list_premium(&self) -> Result<Vec<PremiumRecord>>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Returns `false` if the token string already exists.
    async fn insert_token(&self, token: &VerificationToken) -> Result<bool>;

    async fn get_token(&self, token: &str) -> Result<Option<VerificationToken>>;

    /// Flip `consumed` to true iff the token exists, belongs to `user_id`, is not
    /// consumed and has not expired at `now`. Returns whether this call flipped it.
    async fn redeem_token(&self, user_id: UserId, token: &str, now: DateTime<Utc>)
        -> Result<bool>;

    /// Undo a redemption whose follow-up failed. Returns `true` if the token
    /// was consumed and is now redeemable again.
    async fn release_token(&self, token: &str) -> Result<bool>;

    /// Delete tokens that expired before `now`. Returns how many were removed.
    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait DeletionStore: Send + Sync {
    /// Durable once this returns `Ok`.
    async fn insert_deletion(&self, record: &PendingDeletion) -> Result<()>;

    /// Records with `delete_at <= now`, oldest first.
    async fn due_deletions(&self, now: DateTime<Utc>) -> Result<Vec<PendingDeletion>>;

    async fn all_deletions(&self) -> Result<Vec<PendingDeletion>>;

    /// Returns `true` if a record was removed.
    async fn remove_deletion(&self, batch_id: &BatchId) -> Result<bool>;
}

/// Everyone who has ever started the bot.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Returns `true` the first time a user is seen.
    async fn register_user(&self, user_id: UserId, now: DateTime<Utc>) -> Result<bool>;

    async fn count_users(&self) -> Result<u64>;
}

/// Convenience bound for a single backend serving every port.
pub trait Store: UsageStore + PremiumStore + TokenStore + DeletionStore + UserStore {}

impl<T> Store for T where T: UsageStore + PremiumStore + TokenStore + DeletionStore + UserStore {}
