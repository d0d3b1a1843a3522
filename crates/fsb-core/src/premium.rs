//! Premium plans and their token balances.

use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::{
    domain::UserId,
    errors::Error,
    store::{PremiumStore, TokenDebit},
    Result,
};

/// Balance sentinel for plans without a token cap.
pub const UNLIMITED_TOKENS: i64 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlanType {
    Basic,
    Standard,
    Premium,
    Unlimited,
}

impl PlanType {
    pub const ALL: [PlanType; 4] = [
        PlanType::Basic,
        PlanType::Standard,
        PlanType::Premium,
        PlanType::Unlimited,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PlanType::Basic => "basic",
            PlanType::Standard => "standard",
            PlanType::Premium => "premium",
            PlanType::Unlimited => "unlimited",
        }
    }

    pub fn default_tokens(self) -> i64 {
        match self {
            PlanType::Basic => 50,
            PlanType::Standard => 150,
            PlanType::Premium => 500,
            PlanType::Unlimited => UNLIMITED_TOKENS,
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "basic" => Ok(PlanType::Basic),
            "standard" => Ok(PlanType::Standard),
            "premium" => Ok(PlanType::Premium),
            "unlimited" => Ok(PlanType::Unlimited),
            other => Err(Error::Validation(format!(
                "unknown plan: {other} (expected basic, standard, premium or unlimited)"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PremiumRecord {
    pub user_id: UserId,
    pub plan: PlanType,
    /// `UNLIMITED_TOKENS` (-1) or a non-negative balance.
    pub tokens_remaining: i64,
    pub granted_at: DateTime<Utc>,
}

impl PremiumRecord {
    pub fn is_unlimited(&self) -> bool {
        self.tokens_remaining == UNLIMITED_TOKENS
    }

    pub fn is_active(&self) -> bool {
        self.is_unlimited() || self.tokens_remaining > 0
    }
}

/// Plan and token balance per user.
#[derive(Clone)]
pub struct PremiumLedger {
    store: Arc<dyn PremiumStore>,
}

impl PremiumLedger {
    pub fn new(store: Arc<dyn PremiumStore>) -> Self {
        Self { store }
    }

    /// Grant `plan` with an explicit balance.
    ///
    /// Fails with `Conflict` when the user already holds an active record.
    pub async fn grant(&self, user_id: UserId, plan: PlanType, tokens: i64) -> Result<PremiumRecord> {
        validate_grant(plan, tokens)?;

        let record = PremiumRecord {
            user_id,
            plan,
            tokens_remaining: tokens,
            granted_at: Utc::now(),
        };

        if !self.store.insert_premium_if_inactive(&record).await? {
            return Err(Error::Conflict(format!("user {user_id} is already premium")));
        }

        info!(user_id = user_id.0, plan = %plan, tokens, "premium granted");
        Ok(record)
    }

    /// Grant `plan` with its default balance.
    pub async fn grant_plan(&self, user_id: UserId, plan: PlanType) -> Result<PremiumRecord> {
        self.grant(user_id, plan, plan.default_tokens()).await
    }

    pub async fn revoke(&self, user_id: UserId) -> Result<()> {
        if !self.store.delete_premium(user_id).await? {
            return Err(Error::NotFound(format!("user {user_id} has no premium plan")));
        }
        info!(user_id = user_id.0, "premium revoked");
        Ok(())
    }

    pub async fn is_premium(&self, user_id: UserId) -> Result<bool> {
        Ok(self
            .store
            .get_premium(user_id)
            .await?
            .map(|r| r.is_active())
            .unwrap_or(false))
    }

    /// Fail-closed variant of [`is_premium`](Self::is_premium): storage errors
    /// mean "not premium".
    pub async fn is_premium_or_deny(&self, user_id: UserId) -> bool {
        match self.is_premium(user_id).await {
            Ok(v) => v,
            Err(e) => {
                warn!(user_id = user_id.0, error = %e, "premium lookup failed; treating as not premium");
                false
            }
        }
    }

    /// Spend one token. Unlimited balances always succeed without changing.
    pub async fn consume_token(&self, user_id: UserId) -> Result<bool> {
        let debit = self.store.debit_token(user_id).await?;
        if let TokenDebit::Debited { remaining: 0 } = debit {
            info!(user_id = user_id.0, "premium balance exhausted");
        }
        Ok(matches!(
            debit,
            TokenDebit::Debited { .. } | TokenDebit::Unlimited
        ))
    }

    pub async fn info(&self, user_id: UserId) -> Result<Option<PremiumRecord>> {
        self.store.get_premium(user_id).await
    }

    pub async fn list(&self) -> Result<Vec<PremiumRecord>> {
        self.store.list_premium().await
    }
}

fn validate_grant(plan: PlanType, tokens: i64) -> Result<()> {
    match plan {
        PlanType::Unlimited if tokens != UNLIMITED_TOKENS => Err(Error::Validation(
            "the unlimited plan cannot carry a token cap".to_string(),
        )),
        PlanType::Unlimited => Ok(()),
        _ if tokens < 1 => Err(Error::Validation(format!(
            "{plan} plan needs at least 1 token, got {tokens}"
        ))),
        _ => Ok(()),
    }
}
