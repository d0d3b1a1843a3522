//! File delivery: access gate, copies from the store channel, deletion batch.
//!
//! Non-admin users pay with a premium token when they hold one; the atomic
//! debit is the gate. Everyone else spends a free command.

use std::{sync::Arc, time::Duration};

use tracing::{error, info, warn};

use crate::{
    config::SettingsStore,
    deletion::DeletionScheduler,
    domain::{BatchId, ChatId, MessageId, UserId},
    errors::Error,
    formatting::auto_delete_notice,
    messaging::port::{CopyOptions, MessagingPort},
    premium::PremiumLedger,
    quota::QuotaLedger,
    security::RoleProvider,
    Result,
};

#[derive(Clone, Debug)]
pub struct DeliveryOptions {
    /// Private channel holding the files.
    pub source_chat: ChatId,
    pub protect_content: bool,
    /// Caption replacing the source caption on every copy.
    pub custom_caption: Option<String>,
    /// Pause between consecutive copies.
    pub copy_interval: Duration,
    /// Auto-delete notice; `{time}` is replaced with the TTL.
    pub notice_template: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Quota exhausted; nothing was sent.
    Denied { remaining: i64 },
    Delivered {
        sent: usize,
        failed: usize,
        /// `None` when auto-delete is off or nothing was sent.
        batch: Option<BatchId>,
    },
}

pub struct DeliveryService {
    quota: Arc<QuotaLedger>,
    premium: PremiumLedger,
    roles: Arc<dyn RoleProvider>,
    scheduler: DeletionScheduler,
    messenger: Arc<dyn MessagingPort>,
    settings: Arc<SettingsStore>,
    opts: DeliveryOptions,
}

impl DeliveryService {
    pub fn new(
        quota: Arc<QuotaLedger>,
        premium: PremiumLedger,
        roles: Arc<dyn RoleProvider>,
        scheduler: DeletionScheduler,
        messenger: Arc<dyn MessagingPort>,
        settings: Arc<SettingsStore>,
        opts: DeliveryOptions,
    ) -> Self {
        Self {
            quota,
            premium,
            roles,
            scheduler,
            messenger,
            settings,
            opts,
        }
    }

    /// Deliver `message_ids` to `chat_id`.
    ///
    /// `source_link` is the deep link the request came from; it is kept on the
    /// deletion batch and offered again once the files are gone.
    pub async fn deliver(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        message_ids: &[MessageId],
        source_link: Option<&str>,
    ) -> Result<DeliveryOutcome> {
        if message_ids.is_empty() {
            return Err(Error::Validation("link contains no files".to_string()));
        }

        let paid = !self.roles.is_admin(user_id) && self.pay_with_premium(user_id).await;
        if !paid && !self.quota.consume(user_id).await? {
            info!(user_id = user_id.0, "delivery denied: quota exhausted");
            return Ok(DeliveryOutcome::Denied { remaining: 0 });
        }

        let copy_opts = CopyOptions {
            protect_content: self.opts.protect_content,
            caption: self.opts.custom_caption.clone(),
        };
        let mut delivered = Vec::with_capacity(message_ids.len() + 1);
        let mut failed = 0usize;
        for (i, &id) in message_ids.iter().enumerate() {
            if i > 0 && !self.opts.copy_interval.is_zero() {
                tokio::time::sleep(self.opts.copy_interval).await;
            }
            match self
                .messenger
                .copy_message(chat_id, self.opts.source_chat, id, &copy_opts)
                .await
            {
                Ok(sent) => delivered.push(sent.message_id),
                Err(e) => {
                    failed += 1;
                    warn!(user_id = user_id.0, message_id = id.0, error = %e, "copy failed");
                }
            }
        }

        let sent = delivered.len();
        let ttl = self.settings.auto_delete_time();
        if sent == 0 || ttl.is_zero() {
            return Ok(DeliveryOutcome::Delivered {
                sent,
                failed,
                batch: None,
            });
        }

        let notice = auto_delete_notice(&self.opts.notice_template, ttl);
        match self.messenger.send_html(chat_id, &notice).await {
            Ok(m) => delivered.push(m.message_id),
            Err(e) => warn!(chat_id = chat_id.0, error = %e, "auto-delete notice failed"),
        }

        let link = source_link.map(str::to_string);
        let batch = self.schedule_with_retry(chat_id, delivered, ttl, link).await?;
        Ok(DeliveryOutcome::Delivered {
            sent,
            failed,
            batch: Some(batch),
        })
    }

    /// Spend one premium token. `false` means the user must use the free quota:
    /// no record, an exhausted balance, or a failed lookup.
    async fn pay_with_premium(&self, user_id: UserId) -> bool {
        match self.premium.consume_token(user_id).await {
            Ok(paid) => paid,
            Err(e) => {
                warn!(user_id = user_id.0, error = %e, "premium token debit failed; using free quota");
                false
            }
        }
    }

    async fn schedule_with_retry(
        &self,
        chat_id: ChatId,
        ids: Vec<MessageId>,
        ttl: Duration,
        link: Option<String>,
    ) -> Result<BatchId> {
        match self
            .scheduler
            .schedule_with_link(chat_id, ids.clone(), ttl, link.clone())
            .await
        {
            Ok(b) => Ok(b),
            Err(e) if e.is_storage() => {
                warn!(chat_id = chat_id.0, error = %e, "scheduling deletion failed; retrying once");
                self.scheduler.schedule_with_link(chat_id, ids, ttl, link).await.inspect_err(|e| {
                    error!(chat_id = chat_id.0, error = %e, "delivered files will not auto-delete");
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RuntimeSettings,
        deletion::tests::FakeMessenger,
        memory::MemoryStore,
        premium::PlanType,
        security::StaticRoles,
        store::DeletionStore,
        verification::VerificationTokenStore,
    };

    const ADMIN: UserId = UserId(1);
    const SOURCE: ChatId = ChatId(-100500);

    struct Harness {
        store: Arc<MemoryStore>,
        messenger: Arc<FakeMessenger>,
        settings: Arc<SettingsStore>,
        quota: Arc<QuotaLedger>,
        premium: PremiumLedger,
        scheduler: DeletionScheduler,
        delivery: DeliveryService,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let messenger = Arc::new(FakeMessenger::default());
        let settings = Arc::new(SettingsStore::new(RuntimeSettings {
            verify_mode: true,
            auto_delete_time: Duration::from_secs(600),
        }));
        let roles: Arc<dyn RoleProvider> = Arc::new(StaticRoles::new([ADMIN]));
        let premium = PremiumLedger::new(store.clone());
        let quota = Arc::new(QuotaLedger::new(
            store.clone(),
            premium.clone(),
            roles.clone(),
            settings.clone(),
        ));
        let scheduler = DeletionScheduler::new(store.clone(), messenger.clone());
        let delivery = DeliveryService::new(
            quota.clone(),
            premium.clone(),
            roles,
            scheduler.clone(),
            messenger.clone(),
            settings.clone(),
            DeliveryOptions {
                source_chat: SOURCE,
                protect_content: false,
                custom_caption: None,
                copy_interval: Duration::ZERO,
                notice_template: "deleted in {time}".to_string(),
            },
        );
        Harness {
            store,
            messenger,
            settings,
            quota,
            premium,
            scheduler,
            delivery,
        }
    }

    fn ids(raw: &[i32]) -> Vec<MessageId> {
        raw.iter().copied().map(MessageId).collect()
    }

    #[tokio::test]
    async fn delivery_copies_files_and_schedules_one_batch() {
        let h = harness();
        let out = h
            .delivery
            .deliver(UserId(50), ChatId(50), &ids(&[1, 2]), None)
            .await
            .unwrap();

        let DeliveryOutcome::Delivered { sent, failed, batch } = out else {
            panic!("expected delivery, got {out:?}");
        };
        assert_eq!((sent, failed), (2, 0));
        assert!(batch.is_some());

        let pending = h.store.all_deletions().await.unwrap();
        assert_eq!(pending.len(), 1);
        // Two copies plus the notice.
        assert_eq!(pending[0].message_ids.len(), 3);
        assert_eq!(h.messenger.sent.lock().unwrap()[0].1, "deleted in 10 minutes");
    }

    #[tokio::test]
    async fn fourth_delivery_is_denied_until_verified() {
        let h = harness();
        let user = UserId(60);
        for _ in 0..3 {
            let out = h.delivery.deliver(user, ChatId(60), &ids(&[9]), None).await.unwrap();
            assert!(matches!(out, DeliveryOutcome::Delivered { .. }));
        }

        let out = h.delivery.deliver(user, ChatId(60), &ids(&[9]), None).await.unwrap();
        assert_eq!(out, DeliveryOutcome::Denied { remaining: 0 });
        let status = h.quota.check_limit(user).await.unwrap();
        assert!(status.needs_verification);

        let tokens =
            VerificationTokenStore::new(h.store.clone(), h.quota.clone(), Duration::from_secs(60))
                .unwrap();
        let t = tokens.issue(user).await.unwrap();
        assert!(tokens.consume(user, &t).await.unwrap());

        let status = h.quota.check_limit(user).await.unwrap();
        assert!(!status.needs_verification);
        assert_eq!(status.remaining, 3);
    }

    #[tokio::test]
    async fn finite_premium_pays_a_token_per_delivery() {
        let h = harness();
        let user = UserId(70);
        h.premium.grant(user, PlanType::Basic, 2).await.unwrap();

        h.delivery.deliver(user, ChatId(70), &ids(&[1]), None).await.unwrap();
        assert_eq!(h.premium.info(user).await.unwrap().unwrap().tokens_remaining, 1);
        h.delivery.deliver(user, ChatId(70), &ids(&[1]), None).await.unwrap();
        assert!(!h.premium.is_premium(user).await.unwrap());

        // Back on the free quota now.
        assert_eq!(h.quota.check_limit(user).await.unwrap().remaining, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn last_premium_token_is_spent_once_under_concurrency() {
        let h = Arc::new(harness());
        h.store.yield_on_premium(true);
        let user = UserId(80);
        h.premium.grant(user, PlanType::Basic, 1).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.delivery.deliver(user, ChatId(80), &ids(&[1]), None).await.unwrap()
            }));
        }
        let mut delivered = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), DeliveryOutcome::Delivered { .. }) {
                delivered += 1;
            }
        }

        // One paid delivery plus the three free ones.
        assert_eq!(delivered, 4);
        assert_eq!(h.premium.info(user).await.unwrap().unwrap().tokens_remaining, 0);
        let status = h.quota.check_limit(user).await.unwrap();
        assert_eq!(status.remaining, 0);
        assert!(status.needs_verification);
    }

    #[tokio::test]
    async fn custom_caption_and_source_link_reach_the_copy_and_batch() {
        let mut h = harness();
        h.delivery.opts.custom_caption = Some("<b>mirror</b>".to_string());
        h.delivery
            .deliver(ADMIN, ChatId(1), &ids(&[4]), Some("https://t.me/bot?start=get-x"))
            .await
            .unwrap();

        let opts = h.messenger.copy_opts.lock().unwrap().clone();
        assert_eq!(opts[0].caption.as_deref(), Some("<b>mirror</b>"));
        let pending = h.store.all_deletions().await.unwrap();
        assert_eq!(
            pending[0].source_link.as_deref(),
            Some("https://t.me/bot?start=get-x")
        );
    }

    #[tokio::test]
    async fn failed_copies_are_skipped() {
        let h = harness();
        h.messenger.fail_copies.lock().unwrap().insert(2);
        let out = h
            .delivery
            .deliver(ADMIN, ChatId(1), &ids(&[1, 2, 3]), None)
            .await
            .unwrap();
        assert!(matches!(
            out,
            DeliveryOutcome::Delivered { sent: 2, failed: 1, batch: Some(_) }
        ));
    }

    #[tokio::test]
    async fn zero_ttl_disables_auto_delete() {
        let h = harness();
        h.settings.set_auto_delete_time(Duration::ZERO).unwrap();
        let out = h.delivery.deliver(ADMIN, ChatId(1), &ids(&[1]), None).await.unwrap();
        assert_eq!(
            out,
            DeliveryOutcome::Delivered { sent: 1, failed: 0, batch: None }
        );
        assert_eq!(h.scheduler.pending_count().await.unwrap(), 0);
        assert!(h.messenger.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduling_failure_is_reported_to_the_caller() {
        let h = harness();
        h.store.fail_deletion_writes(true);
        let err = h
            .delivery
            .deliver(ADMIN, ChatId(1), &ids(&[1]), None)
            .await
            .unwrap_err();
        assert!(err.is_storage());
    }
}
