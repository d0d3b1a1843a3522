use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tracing::{error, info, warn};

use fsb_core::{messaging::port::MessagingPort, services::Services};

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub messenger: Arc<dyn MessagingPort>,
    /// Used to build `t.me/<bot>?start=...` links.
    pub bot_username: String,
}

impl AppState {
    pub fn start_link(&self, payload: &str) -> String {
        format!("https://t.me/{}?start={payload}", self.bot_username)
    }
}

/// Restore pending deletions, start the sweeper and serve updates until Ctrl-C.
///
/// The sweeper keeps running after this returns; the caller stops it.
pub async fn run_polling(
    bot: Bot,
    services: Services,
    messenger: Arc<dyn MessagingPort>,
) -> anyhow::Result<()> {
    let me = bot.get_me().await?;
    let bot_username = me.username().to_string();
    info!(bot = %bot_username, admins = services.cfg.admins.len(), "bot started");

    // The sweeper retries every tick; starting up matters more.
    if let Err(e) = services.scheduler.restore_pending().await {
        error!(error = %e, "failed to restore pending deletions");
    }
    services.scheduler.start(services.cfg.sweep_interval).await;

    let state = Arc::new(AppState {
        services,
        messenger,
        bot_username,
    });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|_| async {})
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    warn!("dispatcher stopped");
    Ok(())
}
