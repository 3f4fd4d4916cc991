use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ProposalId, ProposalStatus, RoomId, SubscriptionStatus, UserId},
    protocol::{
        ChangeFilter, ChatMessage, NewMessage, NewProposal, Proposal, ProposalWithMessage,
        RawChange, Room,
    },
};
use tokio::sync::mpsc;

use crate::auth::AuthSession;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    pub private: bool,
    pub broadcast_self: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub name: String,
    pub options: ChannelOptions,
    pub filter: Option<ChangeFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: SubscriptionStatus,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: SubscriptionStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    pub fn failed(status: SubscriptionStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
        }
    }
}

/// What a subscribed channel yields, in the order the transport received it.
#[derive(Debug, Clone)]
pub enum ChannelSignal {
    Status(StatusUpdate),
    Change(RawChange),
}

#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ChannelSignal>>;
    async fn unsubscribe(&self) -> Result<()>;
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn set_auth(&self, access_token: Option<String>) -> Result<()>;
    async fn open_channel(&self, request: ChannelRequest) -> Result<Arc<dyn RealtimeChannel>>;
}

/// Row access on behalf of the signed-in user.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn list_rooms(&self, user_id: &UserId) -> Result<Vec<Room>>;
    async fn list_messages(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>>;
    async fn insert_message(&self, room_id: &RoomId, message: NewMessage) -> Result<ChatMessage>;
    async fn mark_read(&self, room_id: &RoomId, reader: &UserId) -> Result<Vec<ChatMessage>>;
    async fn get_or_create_general_room(&self, other_user_id: &UserId) -> Result<Room>;
    async fn fetch_proposal(&self, proposal_id: &ProposalId) -> Result<Option<Proposal>>;
    async fn list_proposals(&self, room_id: &RoomId) -> Result<Vec<Proposal>>;
    async fn create_proposal(
        &self,
        room_id: &RoomId,
        proposal: NewProposal,
    ) -> Result<ProposalWithMessage>;
    async fn respond_to_proposal(
        &self,
        proposal_id: &ProposalId,
        status: ProposalStatus,
    ) -> Result<Proposal>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores the object and returns its public URL.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String>;
    async fn remove(&self, bucket: &str, path: &str) -> Result<()>;
}

/// Everything the chat core consumes from the managed backend.
#[derive(Clone)]
pub struct BackendClient {
    pub realtime: Arc<dyn RealtimeTransport>,
    pub rows: Arc<dyn RowStore>,
    pub auth: Arc<dyn AuthSession>,
    pub objects: Arc<dyn ObjectStorage>,
}

impl BackendClient {
    pub fn new(
        realtime: Arc<dyn RealtimeTransport>,
        rows: Arc<dyn RowStore>,
        auth: Arc<dyn AuthSession>,
        objects: Arc<dyn ObjectStorage>,
    ) -> Self {
        Self {
            realtime,
            rows,
            auth,
            objects,
        }
    }
}
