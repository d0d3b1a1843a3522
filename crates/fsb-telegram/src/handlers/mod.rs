//! Telegram update handlers.
//!
//! Only commands are served; any other message is ignored. Handlers reply
//! through the shared messenger so replies share the throttle with deliveries.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};
use tracing::warn;

use fsb_core::domain::{ChatId, UserId};

use crate::router::AppState;

mod commands;
mod start;

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if !text.starts_with('/') {
        return Ok(());
    }

    let ctx = Ctx {
        user_id: UserId(user.id.0 as i64),
        chat_id: ChatId(msg.chat.id.0),
        first_name: user.first_name.clone(),
    };
    commands::handle_command(&state, &ctx, text).await;
    Ok(())
}

/// Sender and chat of the command being handled.
#[derive(Clone, Debug)]
pub(crate) struct Ctx {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub first_name: String,
}

pub(crate) async fn reply(state: &AppState, chat_id: ChatId, html: &str) {
    if let Err(e) = state.messenger.send_html(chat_id, html).await {
        warn!(chat_id = chat_id.0, error = %e, "reply failed");
    }
}
