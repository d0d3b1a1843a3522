use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageId, MessageRef},
    messaging::port::{CopyOptions, MessagingPort},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* Telegram API calls (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between calls per chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(350),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.next <= now
    }
}

/// Idle per-chat limiters are dropped every this many reservations.
const PRUNE_EVERY: u64 = 256;

/// MessagingPort decorator that rate-limits outbound calls.
///
/// A sweep can delete dozens of messages in one pass and a delivery copies a
/// whole range; spacing the calls keeps us clear of most 429 responses.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: DashMap<i64, IntervalLimiter>,
    reservations: AtomicU64,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: DashMap::new(),
            reservations: AtomicU64::new(0),
        }
    }

    /// Drop limiters whose next slot is already free; they would grant an
    /// immediate slot anyway.
    fn prune_idle(&self) {
        let now = Instant::now();
        self.per_chat.retain(|_, lim| !lim.is_idle(now));
    }

    async fn throttle_chat(&self, chat_id: i64) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = self
            .per_chat
            .entry(chat_id)
            .or_insert_with(|| IntervalLimiter::new(self.cfg.per_chat_min_interval))
            .reserve();

        if (self.reservations.fetch_add(1, Ordering::Relaxed) + 1) % PRUNE_EVERY == 0 {
            self.prune_idle();
        }

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl MessagingPort for ThrottledMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_html(chat_id, html).await
    }

    async fn copy_message(
        &self,
        to_chat: ChatId,
        from_chat: ChatId,
        message_id: MessageId,
        opts: &CopyOptions,
    ) -> Result<MessageRef> {
        self.throttle_chat(to_chat.0).await;
        self.inner
            .copy_message(to_chat, from_chat, message_id, opts)
            .await
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.throttle_chat(msg.chat_id.0).await;
        self.inner.delete_message(msg).await
    }
}
