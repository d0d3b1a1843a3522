//! Free command quota.
//!
//! Every non-exempt user gets [`FREE_COMMANDS`] commands per verification
//! cycle. Check-and-consume runs under a per-user lock so concurrent requests
//! from one user can never push the counter past the limit.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::{
    config::{SettingsStore, FREE_COMMANDS},
    domain::{CommandUsage, UserId},
    locks::UserLocks,
    premium::PremiumLedger,
    security::RoleProvider,
    store::UsageStore,
    Result,
};

/// Outcome of [`QuotaLedger::check_limit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LimitStatus {
    pub needs_verification: bool,
    /// Free commands left, or [`LimitStatus::UNLIMITED`] for exempt users.
    pub remaining: i64,
}

impl LimitStatus {
    pub const UNLIMITED: i64 = -1;

    fn unlimited() -> Self {
        Self {
            needs_verification: false,
            remaining: Self::UNLIMITED,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.remaining == Self::UNLIMITED
    }
}

pub struct QuotaLedger {
    usage: Arc<dyn UsageStore>,
    premium: PremiumLedger,
    roles: Arc<dyn RoleProvider>,
    settings: Arc<SettingsStore>,
    locks: UserLocks,
}

impl QuotaLedger {
    pub fn new(
        usage: Arc<dyn UsageStore>,
        premium: PremiumLedger,
        roles: Arc<dyn RoleProvider>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            usage,
            premium,
            roles,
            settings,
            locks: UserLocks::new(),
        }
    }

    /// Admins, owner and active premium users skip the quota. Premium lookups
    /// that fail count as "not exempt".
    pub async fn is_exempt(&self, user_id: UserId) -> bool {
        self.roles.is_admin(user_id) || self.premium.is_premium_or_deny(user_id).await
    }

    fn gate_open(&self) -> bool {
        !self.settings.verify_mode()
    }

    pub async fn check_limit(&self, user_id: UserId) -> Result<LimitStatus> {
        if self.gate_open() || self.is_exempt(user_id).await {
            return Ok(LimitStatus::unlimited());
        }

        let count = {
            let _guard = self.locks.lock_user(user_id).await;
            match self.usage.get_usage(user_id).await? {
                Some(u) => u.count,
                None => {
                    self.usage.put_usage(&fresh_usage(user_id)).await?;
                    0
                }
            }
        };

        if count >= FREE_COMMANDS {
            return Ok(LimitStatus {
                needs_verification: true,
                remaining: 0,
            });
        }
        Ok(LimitStatus {
            needs_verification: false,
            remaining: i64::from(FREE_COMMANDS - count),
        })
    }

    /// Spend one free command. `Ok(false)` means the user is at the limit.
    pub async fn consume(&self, user_id: UserId) -> Result<bool> {
        if self.gate_open() || self.is_exempt(user_id).await {
            return Ok(true);
        }

        let _guard = self.locks.lock_user(user_id).await;
        let mut usage = self
            .usage
            .get_usage(user_id)
            .await?
            .unwrap_or_else(|| fresh_usage(user_id));

        if usage.count >= FREE_COMMANDS {
            debug!(user_id = user_id.0, "free command quota exhausted");
            return Ok(false);
        }

        usage.count += 1;
        self.usage.put_usage(&usage).await?;
        debug!(user_id = user_id.0, count = usage.count, "free command used");
        Ok(true)
    }

    /// Zero the counter. Resetting a zero counter changes nothing.
    pub async fn reset(&self, user_id: UserId) -> Result<()> {
        let _guard = self.locks.lock_user(user_id).await;
        let Some(mut usage) = self.usage.get_usage(user_id).await? else {
            return Ok(());
        };
        if usage.count == 0 {
            return Ok(());
        }

        usage.count = 0;
        usage.last_reset_at = Utc::now();
        self.usage.put_usage(&usage).await?;
        info!(user_id = user_id.0, "free command quota reset");
        Ok(())
    }
}

fn fresh_usage(user_id: UserId) -> CommandUsage {
    CommandUsage {
        user_id,
        count: 0,
        last_reset_at: Utc::now(),
    }
}
