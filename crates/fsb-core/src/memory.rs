//! In-process implementation of every storage port.
//!
//! Conditional operations run under a single mutex, which gives them the same
//! atomicity the SQLite adapter gets from conditional `UPDATE` statements.
//! Nothing survives the process; tests and local experiments only.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{BatchId, CommandUsage, PendingDeletion, UserId},
    errors::Error,
    premium::PremiumRecord,
    store::{DeletionStore, PremiumStore, TokenDebit, TokenStore, UsageStore, UserStore},
    verification::VerificationToken,
    Result,
};

#[derive(Default)]
struct State {
    usage: HashMap<UserId, CommandUsage>,
    premium: HashMap<UserId, PremiumRecord>,
    tokens: HashMap<String, VerificationToken>,
    deletions: Vec<PendingDeletion>,
    users: HashMap<UserId, DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_premium_reads: AtomicBool,
    fail_deletion_writes: AtomicBool,
    fail_usage_writes: AtomicBool,
    yield_on_premium: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make premium lookups return `Error::Storage` (fail-closed tests).
    pub fn fail_premium_reads(&self, fail: bool) {
        self.fail_premium_reads.store(fail, Ordering::SeqCst);
    }

    /// Make deletion inserts and removals return `Error::Storage`.
    pub fn fail_deletion_writes(&self, fail: bool) {
        self.fail_deletion_writes.store(fail, Ordering::SeqCst);
    }

    /// Make usage writes return `Error::Storage`.
    pub fn fail_usage_writes(&self, fail: bool) {
        self.fail_usage_writes.store(fail, Ordering::SeqCst);
    }

    /// Yield to the runtime inside premium reads and debits, so concurrent
    /// callers interleave the way they would against a real database.
    pub fn yield_on_premium(&self, on: bool) {
        self.yield_on_premium.store(on, Ordering::SeqCst);
    }

    async fn maybe_yield(&self) {
        if self.yield_on_premium.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_premium_reads(&self) -> Result<()> {
        if self.fail_premium_reads.load(Ordering::SeqCst) {
            return Err(Error::Storage("premium store unavailable".to_string()));
        }
        Ok(())
    }

    fn check_deletion_writes(&self) -> Result<()> {
        if self.fail_deletion_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("deletion store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn get_usage(&self, user_id: UserId) -> Result<Option<CommandUsage>> {
        Ok(self.state().usage.get(&user_id).cloned())
    }

    async fn put_usage(&self, usage: &CommandUsage) -> Result<()> {
        if self.fail_usage_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("usage store unavailable".to_string()));
        }
        self.state().usage.insert(usage.user_id, usage.clone());
        Ok(())
    }
}

#[async_trait]
impl PremiumStore for MemoryStore {
    async fn get_premium(&self, user_id: UserId) -> Result<Option<PremiumRecord>> {
        self.check_premium_reads()?;
        self.maybe_yield().await;
        Ok(self.state().premium.get(&user_id).cloned())
    }

    async fn insert_premium_if_inactive(&self, record: &PremiumRecord) -> Result<bool> {
        let mut st = self.state();
        if st.premium.get(&record.user_id).is_some_and(|r| r.is_active()) {
            return Ok(false);
        }
        st.premium.insert(record.user_id, record.clone());
        Ok(true)
    }

    async fn delete_premium(&self, user_id: UserId) -> Result<bool> {
        Ok(self.state().premium.remove(&user_id).is_some())
    }

    async fn debit_token(&self, user_id: UserId) -> Result<TokenDebit> {
        self.maybe_yield().await;
        let mut st = self.state();
        let Some(rec) = st.premium.get_mut(&user_id) else {
            return Ok(TokenDebit::Missing);
        };
        Ok(match rec.tokens_remaining {
            n if n > 0 => {
                rec.tokens_remaining -= 1;
                TokenDebit::Debited {
                    remaining: rec.tokens_remaining,
                }
            }
            0 => TokenDebit::Exhausted,
            _ => TokenDebit::Unlimited,
        })
    }

    async fn list_premium(&self) -> Result<Vec<PremiumRecord>> {
        self.check_premium_reads()?;
        let mut out: Vec<_> = self.state().premium.values().cloned().collect();
        out.sort_by_key(|r| r.user_id);
        Ok(out)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, token: &VerificationToken) -> Result<bool> {
        let mut st = self.state();
        if st.tokens.contains_key(&token.token) {
            return Ok(false);
        }
        st.tokens.insert(token.token.clone(), token.clone());
        Ok(true)
    }

    async fn get_token(&self, token: &str) -> Result<Option<VerificationToken>> {
        Ok(self.state().tokens.get(token).cloned())
    }

    async fn redeem_token(
        &self,
        user_id: UserId,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut st = self.state();
        match st.tokens.get_mut(token) {
            Some(t) if t.user_id == user_id && !t.consumed && !t.is_expired(now) => {
                t.consumed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_token(&self, token: &str) -> Result<bool> {
        let mut st = self.state();
        match st.tokens.get_mut(token) {
            Some(t) if t.consumed => {
                t.consumed = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut st = self.state();
        let before = st.tokens.len();
        st.tokens.retain(|_, t| !t.is_expired(now));
        Ok((before - st.tokens.len()) as u64)
    }
}

#[async_trait]
impl DeletionStore for MemoryStore {
    async fn insert_deletion(&self, record: &PendingDeletion) -> Result<()> {
        self.check_deletion_writes()?;
        let mut st = self.state();
        if st.deletions.iter().any(|d| d.batch_id == record.batch_id) {
            return Err(Error::Conflict(format!(
                "deletion batch {} already exists",
                record.batch_id
            )));
        }
        st.deletions.push(record.clone());
        Ok(())
    }

    async fn due_deletions(&self, now: DateTime<Utc>) -> Result<Vec<PendingDeletion>> {
        let mut due: Vec<_> = self
            .state()
            .deletions
            .iter()
            .filter(|d| d.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|d| d.delete_at);
        Ok(due)
    }

    async fn all_deletions(&self) -> Result<Vec<PendingDeletion>> {
        Ok(self.state().deletions.clone())
    }

    async fn remove_deletion(&self, batch_id: &BatchId) -> Result<bool> {
        self.check_deletion_writes()?;
        let mut st = self.state();
        let before = st.deletions.len();
        st.deletions.retain(|d| &d.batch_id != batch_id);
        Ok(st.deletions.len() != before)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn register_user(&self, user_id: UserId, now: DateTime<Utc>) -> Result<bool> {
        let mut st = self.state();
        if st.users.contains_key(&user_id) {
            return Ok(false);
        }
        st.users.insert(user_id, now);
        Ok(true)
    }

    async fn count_users(&self) -> Result<u64> {
        Ok(self.state().users.len() as u64)
    }
}
