use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    JobId, MessageId, MessageKind, ProposalId, ProposalKind, ProposalStatus, RoomId, UserId,
};

pub const MESSAGES_TABLE: &str = "messages";
pub const IMAGE_PREVIEW: &str = "📷 Image";
pub const BUDGET_PREVIEW: &str = "💰 Budget Proposal";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetPayload {
    pub proposal_id: ProposalId,
    pub amount_min: f64,
    pub amount_max: f64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_context: Option<String>,
}

impl ChatMessage {
    pub fn is_unread_for(&self, user_id: &UserId) -> bool {
        &self.sender_id != user_id && self.read_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: MessageId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl MessageSummary {
    pub fn from_message(message: &ChatMessage) -> Self {
        let preview = match message.kind {
            MessageKind::Image => IMAGE_PREVIEW.to_string(),
            MessageKind::BudgetProposal => BUDGET_PREVIEW.to_string(),
            MessageKind::Text => message.content.clone(),
        };
        let content = match message.job_context.as_deref() {
            Some(context) if !context.is_empty() => format!("[{context}] {preview}"),
            _ => preview,
        };
        Self {
            id: message.id.clone(),
            content,
            created_at: message.created_at,
            sender_id: message.sender_id.clone(),
            read_at: message.read_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub participant_a: UserId,
    pub participant_b: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<MessageSummary>,
}

impl Room {
    pub fn has_participant(&self, user_id: &UserId) -> bool {
        &self.participant_a == user_id || &self.participant_b == user_id
    }

    pub fn other_participant(&self, user_id: &UserId) -> &UserId {
        if &self.participant_a == user_id {
            &self.participant_b
        } else {
            &self.participant_a
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub proposer_id: UserId,
    pub recipient_id: UserId,
    #[serde(default)]
    pub kind: ProposalKind,
    pub amount_min: f64,
    pub amount_max: f64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    pub user_id: UserId,
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralRoomRequest {
    pub other_user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProposal {
    pub recipient_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub kind: ProposalKind,
    pub amount_min: f64,
    pub amount_max: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

fn default_currency() -> String {
    "PEN".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalWithMessage {
    pub proposal: Proposal,
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalResponseRequest {
    pub status: ProposalStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub updated: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub public_url: String,
}

/// Equality filter a channel join asks the backend to apply to row changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub table: String,
    pub room_id: RoomId,
}

impl ChangeFilter {
    pub fn messages_in(room_id: RoomId) -> Self {
        Self {
            table: MESSAGES_TABLE.to_string(),
            room_id,
        }
    }
}

/// Row change as delivered by the realtime backend, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub event_type: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl RawChange {
    pub fn insert(message: &ChatMessage) -> Self {
        Self::with_new("INSERT", message)
    }

    pub fn update(message: &ChatMessage) -> Self {
        Self::with_new("UPDATE", message)
    }

    fn with_new(event_type: &str, message: &ChatMessage) -> Self {
        Self {
            event_type: event_type.to_string(),
            table: MESSAGES_TABLE.to_string(),
            new: serde_json::to_value(message).ok(),
            old: None,
            commit_timestamp: Some(Utc::now()),
        }
    }

    /// Best-effort id of the affected row, for logging.
    pub fn row_id(&self) -> Option<String> {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .and_then(|row| row.get("id"))
            .and_then(|id| id.as_str())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedRow {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "row", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert(ChatMessage),
    Update(ChatMessage),
    Delete(DeletedRow),
}

impl ChangeEvent {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Insert(row) | Self::Update(row) => &row.id,
            Self::Delete(row) => &row.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangeDecodeError {
    #[error("unknown change event type {0:?}")]
    UnknownEventType(String),
    #[error("{event_type} change carries no row")]
    MissingRow { event_type: String },
    #[error("{event_type} change row is invalid: {reason}")]
    InvalidRow { event_type: String, reason: String },
}

impl TryFrom<RawChange> for ChangeEvent {
    type Error = ChangeDecodeError;

    fn try_from(raw: RawChange) -> Result<Self, Self::Error> {
        let event_type = raw.event_type.to_ascii_uppercase();
        let row = match event_type.as_str() {
            "INSERT" | "UPDATE" => raw.new,
            "DELETE" => raw.old,
            _ => return Err(ChangeDecodeError::UnknownEventType(raw.event_type)),
        };
        let row = row.ok_or_else(|| ChangeDecodeError::MissingRow {
            event_type: event_type.clone(),
        })?;
        let invalid = |err: serde_json::Error| ChangeDecodeError::InvalidRow {
            event_type: event_type.clone(),
            reason: err.to_string(),
        };

        match event_type.as_str() {
            "INSERT" => serde_json::from_value(row).map(Self::Insert).map_err(invalid),
            "UPDATE" => serde_json::from_value(row).map(Self::Update).map_err(invalid),
            _ => serde_json::from_value(row).map(Self::Delete).map_err(invalid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeClientFrame {
    Join {
        topic: String,
        join_ref: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<ChangeFilter>,
        #[serde(default)]
        private: bool,
    },
    Leave {
        topic: String,
    },
    AccessToken {
        access_token: String,
    },
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeServerFrame {
    JoinReply {
        topic: String,
        join_ref: u64,
        status: JoinStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Change {
        topic: String,
        change: RawChange,
    },
    Closed {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    HeartbeatAck,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
