use std::fmt;

use chrono::{DateTime, Utc};

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Identifier of a scheduled deletion batch.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BatchId(pub String);

impl BatchId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-user free command counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandUsage {
    pub user_id: UserId,
    pub count: u32,
    pub last_reset_at: DateTime<Utc>,
}

/// Messages delivered together and due for deletion together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingDeletion {
    pub batch_id: BatchId,
    pub chat_id: ChatId,
    /// Never empty; order is the delivery order.
    pub message_ids: Vec<MessageId>,
    pub delete_at: DateTime<Utc>,
    /// Deep link the files came from, offered again once they are gone.
    pub source_link: Option<String>,
}

impl PendingDeletion {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.delete_at <= now
    }
}
