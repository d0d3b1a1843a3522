use chrono::Utc;
use tracing::{info, warn};

use fsb_core::{
    config::FREE_COMMANDS,
    delivery::DeliveryOutcome,
    formatting::{escape_html, quota_status_line},
    links::{parse_start_payload, StartPayload},
    verification::Redemption,
    Result,
};

use super::Ctx;
use crate::router::AppState;

/// `/start [payload]`.
pub(crate) async fn handle_start(state: &AppState, ctx: &Ctx, payload: &str) -> Result<String> {
    match state.services.users.register_user(ctx.user_id, Utc::now()).await {
        Ok(true) => info!(user_id = ctx.user_id.0, "new user registered"),
        Ok(false) => {}
        // The registry only feeds admin stats.
        Err(e) => warn!(user_id = ctx.user_id.0, error = %e, "failed to register user"),
    }

    if payload.is_empty() {
        return welcome(state, ctx).await;
    }

    match parse_start_payload(payload, state.services.cfg.channel_id)? {
        StartPayload::Verify { user_id, token } => {
            if user_id != ctx.user_id {
                info!(user_id = ctx.user_id.0, owner = user_id.0, "verify link opened by another user");
                return Ok(redemption_text(Redemption::WrongUser));
            }
            let outcome = state.services.verification.redeem(ctx.user_id, &token).await?;
            Ok(redemption_text(outcome))
        }
        StartPayload::Files(ids) => {
            let link = state.start_link(payload);
            let out = state
                .services
                .delivery
                .deliver(ctx.user_id, ctx.chat_id, &ids, Some(&link))
                .await?;
            Ok(match out {
                DeliveryOutcome::Denied { .. } => format!(
                    "⚠️ <b>Command limit reached.</b>\n\nUse /token to verify and get {FREE_COMMANDS} more free commands."
                ),
                DeliveryOutcome::Delivered { sent: 0, failed, .. } => {
                    warn!(user_id = ctx.user_id.0, failed, "nothing could be delivered");
                    "❌ These files are no longer available.".to_string()
                }
                // The files and the auto-delete notice are the reply.
                DeliveryOutcome::Delivered { .. } => String::new(),
            })
        }
    }
}

async fn welcome(state: &AppState, ctx: &Ctx) -> Result<String> {
    let mut text = format!(
        "👋 Hello <b>{}</b>!\n\nI deliver files shared through my links.",
        escape_html(&ctx.first_name)
    );
    if state.services.settings.verify_mode() {
        let status = state.services.quota.check_limit(ctx.user_id).await?;
        text.push_str("\n\n");
        text.push_str(&quota_status_line(&status, FREE_COMMANDS));
    }
    Ok(text)
}

fn redemption_text(outcome: Redemption) -> String {
    match outcome {
        Redemption::Accepted => format!(
            "✅ <b>Verified!</b> You have {FREE_COMMANDS} more free commands."
        ),
        Redemption::Unknown => "❌ Invalid verification link.".to_string(),
        Redemption::AlreadyUsed => "❌ This verification link was already used.".to_string(),
        Redemption::Expired => "❌ This verification link has expired. Use /token for a new one.".to_string(),
        Redemption::WrongUser => "❌ This verification link belongs to another user.".to_string(),
    }
}
