use shared::protocol::{ChangeDecodeError, RawChange};
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Failures surfaced by the chat core. Cloneable so one outcome can be
/// shared between every caller awaiting the same subscription attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("authentication required")]
    AuthRequired,
    #[error("malformed message {message_id}: {reason}")]
    MalformedMessage { message_id: String, reason: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("transient transport failure on {channel}: {cause}")]
    TransportTransient { channel: String, cause: String },
    #[error("transport failed on {channel}: {cause}")]
    TransportTerminal { channel: String, cause: String },
    #[error("backend request failed: {0}")]
    Backend(String),
    #[error("{0} is not initialized")]
    NotInitialized(&'static str),
}

impl ChatError {
    pub fn malformed(message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message_id: message_id.into(),
            reason: reason.into(),
        }
    }

    pub fn backend(err: anyhow::Error) -> Self {
        Self::Backend(format!("{err:#}"))
    }

    pub fn from_change(raw: &RawChange, err: ChangeDecodeError) -> Self {
        Self::malformed(
            raw.row_id().unwrap_or_else(|| "<unknown>".to_string()),
            err.to_string(),
        )
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::TransportTransient { .. } | Self::TransportTerminal { .. }
        )
    }
}
