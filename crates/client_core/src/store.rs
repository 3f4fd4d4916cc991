use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use shared::{
    domain::{MessageKind, ProposalId, ProposalStatus, RoomId, UserId},
    protocol::{
        ChangeEvent, ChangeFilter, ChatMessage, NewMessage, NewProposal, Proposal,
        ProposalWithMessage, RawChange, Room,
    },
};
use tokio::{sync::broadcast, time::Instant};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::{
    backend::{BackendClient, ChannelOptions},
    config::RealtimeSettings,
    connection::{ChangeHandler, ChannelHandle, ConnectionManager, SubscriptionConfig},
    diagnostics::{Diagnostics, DiagnosticsReport, MessageEventKind},
    error::{ChatError, ChatResult},
    ingest::{ChatEvent, IngestOutcome, MessagePipeline},
    registry::{RegistrySnapshot, SubscriptionRegistry},
};

pub const IMAGE_BUCKET: &str = "chat-images";
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

const IMAGE_TYPES: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/jpg", "jpg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
];

/// Optional decorations carried by an outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub sender_name: Option<String>,
    pub job_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl ImageUpload {
    fn extension(&self) -> ChatResult<&'static str> {
        let content_type = self.content_type.trim().to_ascii_lowercase();
        IMAGE_TYPES
            .iter()
            .find(|(mime, _)| *mime == content_type)
            .map(|(_, ext)| *ext)
            .ok_or_else(|| {
                ChatError::InvalidInput(format!(
                    "unsupported image type {}; use jpeg, png, gif or webp",
                    self.content_type
                ))
            })
    }
}

#[derive(Default)]
struct StoreState {
    current_room: Option<RoomId>,
    rooms_fetched_at: Option<Instant>,
    messages_fetched_at: HashMap<RoomId, Instant>,
}

/// Feeds one room's channel into the pipeline.
struct RoomChangeHandler {
    room_id: RoomId,
    pipeline: Arc<MessagePipeline>,
    registry: Weak<SubscriptionRegistry>,
    diagnostics: Arc<Diagnostics>,
}

#[async_trait]
impl ChangeHandler for RoomChangeHandler {
    async fn on_change(&self, change: RawChange) {
        if let Some(registry) = self.registry.upgrade() {
            registry.touch(&self.room_id).await;
        }
        match MessagePipeline::decode(change) {
            Ok(event) => {
                // the pipeline logs its own rejections
                let _ = self.pipeline.ingest(&self.room_id, event);
            }
            Err(err) => {
                self.diagnostics
                    .track_message(&self.room_id, None, MessageEventKind::Rejected);
                warn!(room_id = %self.room_id, "ingest: undecodable change: {err}");
            }
        }
    }
}

/// What UI views talk to: room and message snapshots, sends, read state and
/// per-room subscriptions.
pub struct ChatStore {
    settings: RealtimeSettings,
    connections: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    pipeline: Arc<MessagePipeline>,
    diagnostics: Arc<Diagnostics>,
    inner: Mutex<StoreState>,
}

impl ChatStore {
    pub fn new(
        connections: Arc<ConnectionManager>,
        registry: Arc<SubscriptionRegistry>,
        pipeline: Arc<MessagePipeline>,
        diagnostics: Arc<Diagnostics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings: connections.settings().clone(),
            connections,
            registry,
            pipeline,
            diagnostics,
            inner: Mutex::new(StoreState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn client(&self) -> ChatResult<BackendClient> {
        self.connections.client().await
    }

    async fn signed_in(&self) -> ChatResult<(BackendClient, UserId)> {
        let client = self.client().await?;
        let session = client
            .auth
            .current_session()
            .await
            .ok_or(ChatError::AuthRequired)?;
        Ok((client, session.user_id))
    }

    fn is_fresh(&self, fetched_at: Option<Instant>) -> bool {
        fetched_at.is_some_and(|at| at.elapsed() < self.settings.cache_ttl)
    }

    /// Loads the room list, then every room's messages so unread counters
    /// are known up front. Cached for the configured TTL unless `force`.
    pub async fn fetch_rooms(&self, force: bool) -> ChatResult<Arc<Vec<Room>>> {
        if !force && self.is_fresh(self.state().rooms_fetched_at) {
            debug!("ingest: room list served from cache");
            return Ok(self.pipeline.rooms());
        }

        let (client, user) = self.signed_in().await?;
        let rooms = client
            .rows
            .list_rooms(&user)
            .await
            .map_err(ChatError::backend)?;
        let ids: Vec<RoomId> = rooms.iter().map(|room| room.id.clone()).collect();
        self.pipeline.set_current_user(Some(user));
        self.pipeline.set_rooms(rooms);
        self.state().rooms_fetched_at = Some(Instant::now());
        info!(count = ids.len(), "ingest: room list loaded");

        let loads = ids.iter().map(|room_id| self.fetch_messages(room_id, force));
        for (room_id, result) in ids.iter().zip(join_all(loads).await) {
            if let Err(err) = result {
                warn!(room_id = %room_id, "ingest: could not load messages: {err}");
            }
        }
        Ok(self.pipeline.rooms())
    }

    pub async fn fetch_messages(&self, room_id: &RoomId, force: bool) -> ChatResult<Arc<Vec<ChatMessage>>> {
        let fetched_at = self.state().messages_fetched_at.get(room_id).copied();
        if !force && self.pipeline.has_messages(room_id) && self.is_fresh(fetched_at) {
            return Ok(self.pipeline.messages(room_id));
        }

        let client = self.client().await?;
        let messages = client
            .rows
            .list_messages(room_id)
            .await
            .map_err(ChatError::backend)?;
        self.pipeline.replace_messages(room_id, messages);
        self.state()
            .messages_fetched_at
            .insert(room_id.clone(), Instant::now());
        Ok(self.pipeline.messages(room_id))
    }

    pub fn list_rooms(&self) -> Arc<Vec<Room>> {
        self.pipeline.rooms()
    }

    pub fn messages(&self, room_id: &RoomId) -> Arc<Vec<ChatMessage>> {
        self.pipeline.messages(room_id)
    }

    pub async fn set_current_room(&self, room_id: Option<RoomId>) -> ChatResult<()> {
        self.state().current_room = room_id.clone();
        if let Some(room_id) = room_id {
            if !self.pipeline.has_messages(&room_id) {
                self.fetch_messages(&room_id, false).await?;
            }
        }
        Ok(())
    }

    pub fn current_room(&self) -> Option<RoomId> {
        self.state().current_room.clone()
    }

    pub fn current_room_messages(&self) -> Arc<Vec<ChatMessage>> {
        match self.current_room() {
            Some(room_id) => self.pipeline.messages(&room_id),
            None => Arc::default(),
        }
    }

    /// Ensures a live channel for the room's message changes.
    pub async fn subscribe_room(&self, room_id: &RoomId) -> ChatResult<ChannelHandle> {
        let connections = Arc::clone(&self.connections);
        let config = SubscriptionConfig {
            channel_name: format!("room:{room_id}:messages"),
            options: ChannelOptions {
                private: true,
                broadcast_self: false,
            },
            filter: Some(ChangeFilter::messages_in(room_id.clone())),
            handler: Arc::new(RoomChangeHandler {
                room_id: room_id.clone(),
                pipeline: Arc::clone(&self.pipeline),
                registry: Arc::downgrade(&self.registry),
                diagnostics: Arc::clone(&self.diagnostics),
            }),
        };
        let id = SubscriptionRegistry::subscription_id(room_id);
        self.registry
            .get_or_create(room_id, move || async move {
                connections.create_subscription(&id, config).await
            })
            .await
    }

    fn accept_own(&self, room_id: &RoomId, message: ChatMessage) {
        let message_id = message.id.clone();
        match self.pipeline.ingest(room_id, ChangeEvent::Insert(message)) {
            Ok(IngestOutcome::Duplicate) => {
                debug!(room_id = %room_id, message_id = %message_id, "ingest: echo arrived first");
            }
            Ok(_) => {}
            Err(err) => warn!(room_id = %room_id, "ingest: sent row failed validation: {err}"),
        }
        self.diagnostics
            .track_message(room_id, Some(&message_id), MessageEventKind::Sent);
    }

    pub async fn send_text(
        &self,
        room_id: &RoomId,
        content: &str,
        options: SendOptions,
    ) -> ChatResult<ChatMessage> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::InvalidInput("message text is empty".to_string()));
        }
        let (client, _) = self.signed_in().await?;
        let row = client
            .rows
            .insert_message(
                room_id,
                NewMessage {
                    content: content.to_string(),
                    kind: MessageKind::Text,
                    attachment_url: None,
                    sender_name: options.sender_name,
                    job_context: options.job_context,
                },
            )
            .await
            .map_err(ChatError::backend)?;
        self.accept_own(room_id, row.clone());
        Ok(row)
    }

    pub async fn send_image(
        &self,
        room_id: &RoomId,
        image: ImageUpload,
        options: SendOptions,
    ) -> ChatResult<ChatMessage> {
        let ext = image.extension()?;
        if image.bytes.is_empty() {
            return Err(ChatError::InvalidInput("image is empty".to_string()));
        }
        if image.bytes.len() > MAX_IMAGE_BYTES {
            return Err(ChatError::InvalidInput(format!(
                "image is {} bytes; the limit is {MAX_IMAGE_BYTES}",
                image.bytes.len()
            )));
        }

        let (client, user) = self.signed_in().await?;
        let path = format!("{room_id}/{user}/{}.{ext}", Utc::now().timestamp_millis());
        let url = client
            .objects
            .upload(IMAGE_BUCKET, &path, &image.content_type, image.bytes)
            .await
            .map_err(ChatError::backend)?;

        let inserted = client
            .rows
            .insert_message(
                room_id,
                NewMessage {
                    content: String::new(),
                    kind: MessageKind::Image,
                    attachment_url: Some(url),
                    sender_name: options.sender_name,
                    job_context: options.job_context,
                },
            )
            .await;
        let row = match inserted {
            Ok(row) => row,
            Err(err) => {
                if let Err(cleanup) = client.objects.remove(IMAGE_BUCKET, &path).await {
                    warn!(path = %path, "ingest: orphaned upload not removed: {cleanup:#}");
                }
                return Err(ChatError::backend(err));
            }
        };
        self.accept_own(room_id, row.clone());
        Ok(row)
    }

    /// Marks everything the signed-in user received in the room as read.
    pub async fn mark_read(&self, room_id: &RoomId) -> ChatResult<usize> {
        let (client, user) = self.signed_in().await?;
        let updated = client
            .rows
            .mark_read(room_id, &user)
            .await
            .map_err(ChatError::backend)?;
        let read_at = updated
            .iter()
            .filter_map(|message| message.read_at)
            .max()
            .unwrap_or_else(Utc::now);
        self.pipeline.mark_read_local(room_id, read_at);
        Ok(updated.len())
    }

    pub fn unread_count(&self, room_id: &RoomId) -> usize {
        self.pipeline.unread_count(room_id)
    }

    pub fn total_unread_count(&self) -> usize {
        self.pipeline.total_unread()
    }

    pub fn has_unread(&self, room_id: &RoomId) -> bool {
        self.unread_count(room_id) > 0
    }

    pub async fn cleanup_room(&self, room_id: &RoomId) {
        self.registry.cleanup(room_id).await;
    }

    pub async fn cleanup_all_subscriptions(&self) {
        self.registry.cleanup_all().await;
    }

    pub async fn get_or_create_general_room(&self, other_user_id: &UserId) -> ChatResult<Room> {
        let (client, user) = self.signed_in().await?;
        if other_user_id.is_blank() || other_user_id == &user {
            return Err(ChatError::InvalidInput(
                "a general room needs another participant".to_string(),
            ));
        }
        let room = client
            .rows
            .get_or_create_general_room(other_user_id)
            .await
            .map_err(ChatError::backend)?;
        self.pipeline.upsert_room(room.clone());
        if let Err(err) = self.fetch_rooms(true).await {
            warn!(room_id = %room.id, "ingest: room list refresh failed: {err}");
        }
        Ok(room)
    }

    pub async fn send_budget_proposal(
        &self,
        room_id: &RoomId,
        proposal: NewProposal,
    ) -> ChatResult<ProposalWithMessage> {
        if !(proposal.amount_min.is_finite() && proposal.amount_max.is_finite())
            || proposal.amount_min < 0.0
        {
            return Err(ChatError::InvalidInput("budget amounts must be positive".to_string()));
        }
        if proposal.amount_min > proposal.amount_max {
            return Err(ChatError::InvalidInput(
                "minimum budget exceeds the maximum".to_string(),
            ));
        }
        if proposal.currency.trim().is_empty() {
            return Err(ChatError::InvalidInput("currency is required".to_string()));
        }

        let (client, _) = self.signed_in().await?;
        let created = client
            .rows
            .create_proposal(room_id, proposal)
            .await
            .map_err(ChatError::backend)?;
        self.pipeline.upsert_proposal(created.proposal.clone());
        self.accept_own(room_id, created.message.clone());
        Ok(created)
    }

    pub async fn respond_to_proposal(
        &self,
        proposal_id: &ProposalId,
        status: ProposalStatus,
    ) -> ChatResult<Proposal> {
        if !matches!(status, ProposalStatus::Accepted | ProposalStatus::Declined) {
            return Err(ChatError::InvalidInput(format!(
                "a proposal can only be accepted or declined, not {}",
                status.as_str()
            )));
        }
        let client = self.client().await?;
        let proposal = client
            .rows
            .respond_to_proposal(proposal_id, status)
            .await
            .map_err(ChatError::backend)?;
        self.pipeline.upsert_proposal(proposal.clone());
        Ok(proposal)
    }

    pub async fn fetch_proposals(&self, room_id: &RoomId) -> ChatResult<Arc<Vec<Proposal>>> {
        let client = self.client().await?;
        let proposals = client
            .rows
            .list_proposals(room_id)
            .await
            .map_err(ChatError::backend)?;
        self.pipeline.set_proposals(room_id, proposals);
        Ok(self.pipeline.proposals(room_id))
    }

    pub fn proposals(&self, room_id: &RoomId) -> Arc<Vec<Proposal>> {
        self.pipeline.proposals(room_id)
    }

    /// Forgets the model and every cache timestamp.
    pub fn reset(&self) {
        *self.state() = StoreState::default();
        self.pipeline.reset();
    }

    pub fn events(&self) -> broadcast::Receiver<ChatEvent> {
        self.pipeline.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<ChatEvent> {
        BroadcastStream::new(self.pipeline.subscribe())
    }

    pub fn diagnostics_report(&self) -> DiagnosticsReport {
        self.diagnostics.report()
    }

    pub async fn subscription_snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot().await
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
