use std::sync::Arc;

use crate::{
    config::{Config, SettingsStore},
    deletion::DeletionScheduler,
    delivery::{DeliveryOptions, DeliveryService},
    domain::ChatId,
    messaging::port::MessagingPort,
    premium::PremiumLedger,
    quota::QuotaLedger,
    security::RoleProvider,
    store::{Store, UserStore},
    verification::VerificationTokenStore,
    Result,
};

/// Every engine, wired to one store backend and one messenger.
#[derive(Clone)]
pub struct Services {
    pub cfg: Arc<Config>,
    pub settings: Arc<SettingsStore>,
    pub premium: PremiumLedger,
    pub quota: Arc<QuotaLedger>,
    pub verification: Arc<VerificationTokenStore>,
    pub scheduler: DeletionScheduler,
    pub delivery: Arc<DeliveryService>,
    pub users: Arc<dyn UserStore>,
}

impl Services {
    pub fn build<S>(cfg: Arc<Config>, store: Arc<S>, messenger: Arc<dyn MessagingPort>) -> Result<Self>
    where
        S: Store + 'static,
    {
        let settings = Arc::new(SettingsStore::new(cfg.initial_settings()));
        let roles: Arc<dyn RoleProvider> = cfg.clone();

        let premium = PremiumLedger::new(store.clone());
        let quota = Arc::new(QuotaLedger::new(
            store.clone(),
            premium.clone(),
            roles.clone(),
            settings.clone(),
        ));
        let verification = Arc::new(VerificationTokenStore::new(
            store.clone(),
            quota.clone(),
            cfg.verify_token_ttl,
        )?);
        let users: Arc<dyn UserStore> = store.clone();
        let scheduler = DeletionScheduler::with_success_message(
            store,
            messenger.clone(),
            cfg.auto_del_success_msg.clone(),
        );
        let delivery = Arc::new(DeliveryService::new(
            quota.clone(),
            premium.clone(),
            roles,
            scheduler.clone(),
            messenger,
            settings.clone(),
            DeliveryOptions {
                source_chat: ChatId(cfg.channel_id),
                protect_content: cfg.protect_content,
                custom_caption: cfg.custom_caption.clone(),
                copy_interval: cfg.copy_interval,
                notice_template: cfg.auto_delete_msg.clone(),
            },
        ));

        Ok(Self {
            cfg,
            settings,
            premium,
            quota,
            verification,
            scheduler,
            delivery,
            users,
        })
    }
}
