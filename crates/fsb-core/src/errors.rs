/// Core error type for the file-store bot.
///
/// Adapter crates map their specific errors into this type so the engines and
/// handlers can apply one policy: storage failures on read paths fail closed,
/// messaging failures during deletion are logged and skipped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("external error: {0}")]
    External(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Error::External(_))
    }

    /// Short text shown to the user when a request is denied because of this error.
    ///
    /// Internal failures are never echoed verbatim.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation(m) => format!("❌ {m}"),
            Error::NotFound(m) => format!("❌ Not found: {m}"),
            Error::Conflict(m) => format!("❌ {m}"),
            Error::Storage(_) | Error::Io(_) | Error::Json(_) => {
                "⚠️ Temporary storage problem, please try again shortly.".to_string()
            }
            Error::External(_) => "⚠️ Telegram request failed, please try again.".to_string(),
            Error::Config(_) => "⚠️ Bot is misconfigured. Contact an admin.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_not_leaked_to_users() {
        let e = Error::Storage("disk I/O error at /var/lib/fsb.db".to_string());
        assert!(e.is_storage());
        assert!(!e.user_message().contains("/var/lib"));
    }

    #[test]
    fn validation_message_is_user_facing() {
        let e = Error::Validation("unknown plan: gold".to_string());
        assert_eq!(e.user_message(), "❌ unknown plan: gold");
    }
}
