//! Single-use verification tokens.
//!
//! A redeemed token resets the user's free command quota. Single use is
//! enforced by the store's conditional update, so two bot processes sharing
//! one database still cannot both redeem the same token.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use tracing::{error, info, warn};

use crate::{domain::UserId, errors::Error, quota::QuotaLedger, store::TokenStore, Result};

pub const TOKEN_LEN: usize = 32;
const MIN_TOKEN_LEN: usize = 10;
const MAX_ISSUE_ATTEMPTS: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationToken {
    pub user_id: UserId,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

impl VerificationToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Why a redemption did or did not go through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Redemption {
    Accepted,
    Unknown,
    AlreadyUsed,
    Expired,
    WrongUser,
}

pub struct VerificationTokenStore {
    store: Arc<dyn TokenStore>,
    quota: Arc<QuotaLedger>,
    ttl: chrono::Duration,
}

impl VerificationTokenStore {
    pub fn new(store: Arc<dyn TokenStore>, quota: Arc<QuotaLedger>, ttl: Duration) -> Result<Self> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Config(format!("verification ttl out of range: {e}")))?;
        Ok(Self { store, quota, ttl })
    }

    /// Issue a fresh token bound to `user_id`.
    pub async fn issue(&self, user_id: UserId) -> Result<String> {
        let now = Utc::now();
        match self.store.purge_expired_tokens(now).await {
            Ok(0) => {}
            Ok(n) => info!(purged = n, "expired verification tokens removed"),
            Err(e) => warn!(error = %e, "failed to purge expired verification tokens"),
        }

        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let token = VerificationToken {
                user_id,
                token: generate_token(),
                issued_at: now,
                expires_at: now + self.ttl,
                consumed: false,
            };
            if self.store.insert_token(&token).await? {
                info!(user_id = user_id.0, "verification token issued");
                return Ok(token.token);
            }
        }

        Err(Error::Conflict(
            "could not generate a unique verification token".to_string(),
        ))
    }

    /// Redeem `token` for `user_id`; on success the user's quota is reset.
    ///
    /// If the reset fails the token is released again, so the same link can
    /// be retried once storage recovers.
    pub async fn redeem(&self, user_id: UserId, token: &str) -> Result<Redemption> {
        validate_token(token)?;

        let now = Utc::now();
        if self.store.redeem_token(user_id, token, now).await? {
            if let Err(e) = self.quota.reset(user_id).await {
                match self.store.release_token(token).await {
                    Ok(_) => warn!(user_id = user_id.0, error = %e, "quota reset failed; token released"),
                    Err(release_err) => error!(
                        user_id = user_id.0,
                        error = %e,
                        release_error = %release_err,
                        "quota reset failed and token stays consumed"
                    ),
                }
                return Err(e);
            }
            info!(user_id = user_id.0, "verification token redeemed");
            return Ok(Redemption::Accepted);
        }

        let outcome = match self.store.get_token(token).await? {
            None => Redemption::Unknown,
            Some(t) if t.user_id != user_id => Redemption::WrongUser,
            Some(t) if t.consumed => Redemption::AlreadyUsed,
            Some(t) if t.is_expired(now) => Redemption::Expired,
            // Lost a race with a concurrent redemption that has since committed.
            Some(_) => Redemption::AlreadyUsed,
        };
        info!(user_id = user_id.0, outcome = ?outcome, "verification token rejected");
        Ok(outcome)
    }

    /// Boolean form of [`redeem`](Self::redeem); malformed tokens are rejected.
    pub async fn consume(&self, user_id: UserId, token: &str) -> Result<bool> {
        match self.redeem(user_id, token).await {
            Ok(r) => Ok(r == Redemption::Accepted),
            Err(Error::Validation(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn generate_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn validate_token(token: &str) -> Result<()> {
    if token.len() < MIN_TOKEN_LEN || token.len() > 128 {
        return Err(Error::Validation("malformed verification token".to_string()));
    }
    if !token.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::Validation("malformed verification token".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{
        config::{RuntimeSettings, SettingsStore},
        memory::MemoryStore,
        premium::PremiumLedger,
        security::StaticRoles,
    };

    fn setup(ttl: Duration) -> (Arc<MemoryStore>, Arc<QuotaLedger>, VerificationTokenStore) {
        let store = Arc::new(MemoryStore::new());
        let settings = Arc::new(SettingsStore::new(RuntimeSettings {
            verify_mode: true,
            auto_delete_time: Duration::from_secs(600),
        }));
        let quota = Arc::new(QuotaLedger::new(
            store.clone(),
            PremiumLedger::new(store.clone()),
            Arc::new(StaticRoles::default()),
            settings,
        ));
        let tokens = VerificationTokenStore::new(store.clone(), quota.clone(), ttl).unwrap();
        (store, quota, tokens)
    }

    #[tokio::test]
    async fn tokens_are_distinct_and_long_enough() {
        let (_, _, tokens) = setup(Duration::from_secs(3600));
        let mut seen = HashSet::new();
        for user in 0..50 {
            let t = tokens.issue(UserId(user)).await.unwrap();
            assert!(t.len() >= 10);
            assert!(seen.insert(t));
        }
    }

    #[tokio::test]
    async fn token_is_single_use_for_any_user() {
        let (_, _, tokens) = setup(Duration::from_secs(3600));
        let user = UserId(1);
        let t = tokens.issue(user).await.unwrap();

        assert_eq!(tokens.redeem(UserId(2), &t).await.unwrap(), Redemption::WrongUser);
        assert!(tokens.consume(user, &t).await.unwrap());
        assert!(!tokens.consume(user, &t).await.unwrap());
        assert_eq!(tokens.redeem(user, &t).await.unwrap(), Redemption::AlreadyUsed);
        assert_eq!(tokens.redeem(UserId(2), &t).await.unwrap(), Redemption::WrongUser);
    }

    #[tokio::test]
    async fn unknown_and_malformed_tokens_fail() {
        let (_, _, tokens) = setup(Duration::from_secs(3600));
        assert_eq!(
            tokens.redeem(UserId(1), "doesnotexist123").await.unwrap(),
            Redemption::Unknown
        );
        assert!(!tokens.consume(UserId(1), "short").await.unwrap());
        assert!(matches!(
            tokens.redeem(UserId(1), "bad token with spaces").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let (store, _, tokens) = setup(Duration::from_secs(3600));
        let now = Utc::now();
        let stale = VerificationToken {
            user_id: UserId(1),
            token: "staletoken0000000000".to_string(),
            issued_at: now - chrono::Duration::hours(2),
            expires_at: now - chrono::Duration::hours(1),
            consumed: false,
        };
        assert!(store.insert_token(&stale).await.unwrap());

        assert_eq!(
            tokens.redeem(UserId(1), &stale.token).await.unwrap(),
            Redemption::Expired
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redemptions_succeed_at_most_once() {
        let (_, _, tokens) = setup(Duration::from_secs(3600));
        let tokens = Arc::new(tokens);
        let user = UserId(9);
        let t = tokens.issue(user).await.unwrap();

        let a = {
            let (tokens, t) = (tokens.clone(), t.clone());
            tokio::spawn(async move { tokens.consume(user, &t).await.unwrap() })
        };
        let b = {
            let (tokens, t) = (tokens.clone(), t.clone());
            tokio::spawn(async move { tokens.consume(user, &t).await.unwrap() })
        };

        let wins = [a.await.unwrap(), b.await.unwrap()]
            .iter()
            .filter(|w| **w)
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn redemption_resets_the_quota() {
        let (_, quota, tokens) = setup(Duration::from_secs(3600));
        let user = UserId(11);

        for _ in 0..3 {
            assert!(quota.consume(user).await.unwrap());
        }
        let status = quota.check_limit(user).await.unwrap();
        assert!(status.needs_verification);
        assert_eq!(status.remaining, 0);
        assert!(!quota.consume(user).await.unwrap());

        let t = tokens.issue(user).await.unwrap();
        assert!(tokens.consume(user, &t).await.unwrap());

        let status = quota.check_limit(user).await.unwrap();
        assert!(!status.needs_verification);
        assert_eq!(status.remaining, 3);
    }

    #[tokio::test]
    async fn failed_quota_reset_leaves_the_token_redeemable() {
        let (store, quota, tokens) = setup(Duration::from_secs(60));
        let user = UserId(9);
        for _ in 0..3 {
            assert!(quota.consume(user).await.unwrap());
        }
        let t = tokens.issue(user).await.unwrap();

        store.fail_usage_writes(true);
        let err = tokens.redeem(user, &t).await.unwrap_err();
        assert!(err.is_storage());
        assert!(!store.get_token(&t).await.unwrap().unwrap().consumed);
        assert!(quota.check_limit(user).await.unwrap().needs_verification);

        store.fail_usage_writes(false);
        assert_eq!(tokens.redeem(user, &t).await.unwrap(), Redemption::Accepted);
        assert_eq!(quota.check_limit(user).await.unwrap().remaining, 3);
    }
}
