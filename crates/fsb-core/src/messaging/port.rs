use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageId, MessageRef},
    Result,
};

/// Per-copy settings for [`MessagingPort::copy_message`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CopyOptions {
    /// Forbid forwarding and saving of the copy.
    pub protect_content: bool,
    /// HTML caption replacing the source caption.
    pub caption: Option<String>,
}

/// Messenger port used by delivery and the deletion scheduler.
///
/// Implementations map platform failures to `Error::External`.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;

    /// Copy `message_id` from `from_chat` into `to_chat` without a forward header.
    async fn copy_message(
        &self,
        to_chat: ChatId,
        from_chat: ChatId,
        message_id: MessageId,
        opts: &CopyOptions,
    ) -> Result<MessageRef>;

    async fn delete_message(&self, msg: MessageRef) -> Result<()>;
}
