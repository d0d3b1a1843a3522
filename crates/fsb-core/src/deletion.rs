//! Durable auto-deletion of delivered messages.
//!
//! Each delivery is persisted as one [`PendingDeletion`] batch before
//! `schedule` returns. A single sweep task polls the store for due batches,
//! deletes every message in them and then retires the record. Restart recovery
//! is a re-read of the store: overdue batches are processed immediately,
//! future ones are left to the sweep.
//!
//! Per-message delete failures (already gone, permissions revoked) are logged
//! and skipped. A batch is retired once every id has been attempted, so a
//! bad message can never pin its batch in the store.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    domain::{BatchId, ChatId, MessageId, MessageRef, PendingDeletion},
    errors::Error,
    formatting::escape_html,
    messaging::port::MessagingPort,
    store::DeletionStore,
    Result,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub batches: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl SweepReport {
    fn absorb(&mut self, other: SweepReport) {
        self.batches += other.batches;
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Overdue batches handled during restore.
    pub processed: SweepReport,
    /// Batches still in the future, left to the sweep loop.
    pub waiting: usize,
}

#[derive(Clone)]
pub struct DeletionScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: Arc<dyn DeletionStore>,
    messenger: Arc<dyn MessagingPort>,
    /// Sent to the chat after a batch is deleted.
    success_msg: Option<String>,
    /// Serializes sweeps so restore and the loop never process one batch twice at once.
    sweep_lock: tokio::sync::Mutex<()>,
    state: tokio::sync::Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    sweeper: Option<JoinHandle<()>>,
    sweeper_cancel: Option<CancellationToken>,
}

impl DeletionScheduler {
    pub fn new(store: Arc<dyn DeletionStore>, messenger: Arc<dyn MessagingPort>) -> Self {
        Self::with_success_message(store, messenger, None)
    }

    pub fn with_success_message(
        store: Arc<dyn DeletionStore>,
        messenger: Arc<dyn MessagingPort>,
        success_msg: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                messenger,
                success_msg,
                sweep_lock: tokio::sync::Mutex::new(()),
                state: tokio::sync::Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Persist a deletion batch due `delay` from now.
    ///
    /// The record is durable once this returns `Ok`; on `Err` nothing was
    /// scheduled and the caller must retry.
    pub async fn schedule(
        &self,
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
        delay: Duration,
    ) -> Result<BatchId> {
        self.schedule_with_link(chat_id, message_ids, delay, None)
            .await
    }

    /// [`schedule`](Self::schedule), remembering the link the files came from.
    pub async fn schedule_with_link(
        &self,
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
        delay: Duration,
        source_link: Option<String>,
    ) -> Result<BatchId> {
        let message_ids = dedup_preserving_order(message_ids);
        if message_ids.is_empty() {
            return Err(Error::Validation(
                "deletion batch needs at least one message id".to_string(),
            ));
        }
        let delete_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or_else(|| {
                Error::Validation(format!("deletion delay of {}s is out of range", delay.as_secs()))
            })?;

        let record = PendingDeletion {
            batch_id: BatchId::generate(),
            chat_id,
            message_ids,
            delete_at,
            source_link,
        };
        self.inner.store.insert_deletion(&record).await?;

        info!(
            batch_id = %record.batch_id,
            chat_id = chat_id.0,
            messages = record.message_ids.len(),
            delete_at = %record.delete_at,
            "deletion scheduled"
        );
        Ok(record.batch_id)
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Process every batch due at `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let _sweep = self.inner.sweep_lock.lock().await;
        let due = self.inner.store.due_deletions(now).await?;

        let mut report = SweepReport::default();
        for batch in due {
            report.absorb(self.process_batch(&batch).await);
        }

        if report.batches > 0 {
            debug!(
                batches = report.batches,
                deleted = report.deleted,
                failed = report.failed,
                "deletion sweep finished"
            );
        }
        Ok(report)
    }

    /// Startup recovery: handle overdue batches now, count the rest.
    pub async fn restore_pending(&self) -> Result<RestoreReport> {
        let now = Utc::now();
        let all = self.inner.store.all_deletions().await?;
        let waiting = all.iter().filter(|b| !b.is_due(now)).count();

        let processed = self.sweep_at(now).await?;
        info!(
            restored = processed.batches,
            deleted = processed.deleted,
            failed = processed.failed,
            waiting,
            "pending deletions restored"
        );
        Ok(RestoreReport { processed, waiting })
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.inner.store.all_deletions().await?.len())
    }

    /// Start the sweep loop, if not already running.
    pub async fn start(&self, interval: Duration) {
        let mut st = self.inner.state.lock().await;
        if st.sweeper.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let tok = CancellationToken::new();
        st.sweeper_cancel = Some(tok.clone());
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                  _ = tok.cancelled() => break,
                  _ = tick.tick() => {
                    if let Err(e) = scheduler.sweep_once().await {
                      error!(error = %e, "deletion sweep failed");
                    }
                  }
                }
            }
            info!("deletion sweeper stopped");
        });

        st.sweeper = Some(handle);
        info!(interval_ms = interval.as_millis() as u64, "deletion sweeper started");
    }

    pub async fn stop(&self) {
        let (tok, handle) = {
            let mut st = self.inner.state.lock().await;
            (st.sweeper_cancel.take(), st.sweeper.take())
        };
        if let Some(tok) = tok {
            tok.cancel();
        }
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn is_running(&self) -> bool {
        let st = self.inner.state.lock().await;
        st.sweeper.as_ref().is_some_and(|h| !h.is_finished())
    }

    async fn process_batch(&self, batch: &PendingDeletion) -> SweepReport {
        let mut report = SweepReport {
            batches: 1,
            ..SweepReport::default()
        };

        for &message_id in &batch.message_ids {
            let msg = MessageRef {
                chat_id: batch.chat_id,
                message_id,
            };
            match self.inner.messenger.delete_message(msg).await {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        batch_id = %batch.batch_id,
                        chat_id = batch.chat_id.0,
                        message_id = message_id.0,
                        error = %e,
                        "failed to delete message; skipping"
                    );
                }
            }
        }

        // A failed removal leaves the record for the next sweep: deletion attempts
        // are at-least-once, and deleting an already-deleted message is harmless.
        match self.inner.store.remove_deletion(&batch.batch_id).await {
            Ok(_) => {}
            Err(e) => {
                error!(batch_id = %batch.batch_id, error = %e, "failed to retire deletion batch");
                return report;
            }
        }

        if report.deleted > 0 {
            self.notify_deleted(batch).await;
        }
        report
    }

    async fn notify_deleted(&self, batch: &PendingDeletion) {
        let Some(msg) = self.inner.success_msg.as_deref() else {
            return;
        };
        let html = match batch.source_link.as_deref() {
            Some(link) => format!(
                "{msg}\n\n<a href=\"{}\">Get the files again</a>",
                escape_html(link)
            ),
            None => msg.to_string(),
        };
        if let Err(e) = self.inner.messenger.send_html(batch.chat_id, &html).await {
            warn!(batch_id = %batch.batch_id, chat_id = batch.chat_id.0, error = %e, "deletion notice failed");
        }
    }
}

fn dedup_preserving_order(ids: Vec<MessageId>) -> Vec<MessageId> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
