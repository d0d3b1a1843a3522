use std::sync::Arc;

use teloxide::Bot;
use tracing::info;

use fsb_core::{
    config::Config,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    services::Services,
};
use fsb_sqlite::SqliteStore;
use fsb_telegram::TelegramMessenger;

#[tokio::main]
async fn main() -> Result<(), fsb_core::Error> {
    fsb_core::logging::init("fsb")?;

    let cfg = Arc::new(Config::load()?);
    let store = Arc::new(SqliteStore::open(&cfg.database_path).await?);

    let bot = Bot::new(cfg.bot_token.clone());
    // Sweeps can delete many messages at once; keep a RetryAfter retry in the adapter too.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let services = Services::build(cfg, store, messenger.clone())?;
    let scheduler = services.scheduler.clone();

    let result = fsb_telegram::router::run_polling(bot, services, messenger)
        .await
        .map_err(|e| fsb_core::Error::External(format!("telegram bot failed: {e}")));

    scheduler.stop().await;
    info!("shutdown complete");
    result
}
