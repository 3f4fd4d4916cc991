use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageKind, ProposalId, RoomId, UserId},
    protocol::{ChangeEvent, ChatMessage, MessageSummary, Proposal, RawChange, Room},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    backend::RowStore,
    diagnostics::{Diagnostics, MessageEventKind},
    error::{ChatError, ChatResult},
};

/// Model change notifications. Views re-read the affected snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    RoomsChanged,
    MessagesChanged { room_id: RoomId },
    UnreadChanged { room_id: RoomId, count: usize },
    ProposalsChanged { room_id: RoomId },
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Appended,
    Duplicate,
    Replaced,
    Ignored,
}

#[derive(Default)]
struct PipelineState {
    current_user: Option<UserId>,
    rooms: Arc<Vec<Room>>,
    messages: HashMap<RoomId, Arc<Vec<ChatMessage>>>,
    unread: HashMap<RoomId, usize>,
    proposals: HashMap<RoomId, Arc<Vec<Proposal>>>,
    rows: Option<Arc<dyn RowStore>>,
}

impl PipelineState {
    /// Recomputes the room's counter, returning the new value when it moved.
    fn recount(&mut self, room_id: &RoomId) -> Option<usize> {
        let count = match (&self.current_user, self.messages.get(room_id)) {
            (Some(user), Some(list)) => list.iter().filter(|m| m.is_unread_for(user)).count(),
            _ => 0,
        };
        let previous = self.unread.insert(room_id.clone(), count).unwrap_or(0);
        (previous != count).then_some(count)
    }

    fn sort_rooms(rooms: &mut [Room]) {
        rooms.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    /// Points the room summary at `message` if the room is known.
    fn summarize(&mut self, message: &ChatMessage) -> bool {
        let Some(index) = self.rooms.iter().position(|room| room.id == message.room_id) else {
            return false;
        };
        let mut rooms = self.rooms.to_vec();
        let room = &mut rooms[index];
        room.latest_message = Some(MessageSummary::from_message(message));
        room.updated_at = room.updated_at.max(message.created_at);
        Self::sort_rooms(&mut rooms);
        self.rooms = Arc::new(rooms);
        true
    }
}

/// Single writer of the room and message model. Each mutation swaps in a new
/// `Arc` for the collection it touches, so a snapshot a view holds never
/// changes underneath it.
pub struct MessagePipeline {
    diagnostics: Arc<Diagnostics>,
    inner: Mutex<PipelineState>,
    events: broadcast::Sender<ChatEvent>,
}

impl MessagePipeline {
    pub fn new(diagnostics: Arc<Diagnostics>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            diagnostics,
            inner: Mutex::new(PipelineState::default()),
            events,
        })
    }

    fn state(&self) -> MutexGuard<'_, PipelineState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, events: Vec<ChatEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Row store used for out-of-band proposal refreshes.
    pub fn bind_rows(&self, rows: Arc<dyn RowStore>) {
        self.state().rows = Some(rows);
    }

    pub fn validate(message: &ChatMessage) -> ChatResult<()> {
        let id = message.id.as_str();
        if message.id.is_blank() {
            return Err(ChatError::malformed("<blank>", "message id is empty"));
        }
        if message.room_id.is_blank() {
            return Err(ChatError::malformed(id, "room id is empty"));
        }
        if message.sender_id.is_blank() {
            return Err(ChatError::malformed(id, "sender id is empty"));
        }
        match message.kind {
            MessageKind::Text if message.content.trim().is_empty() => {
                Err(ChatError::malformed(id, "text message has no content"))
            }
            MessageKind::Image
                if message
                    .attachment_url
                    .as_deref()
                    .map_or(true, |url| url.trim().is_empty()) =>
            {
                Err(ChatError::malformed(id, "image message has no attachment url"))
            }
            MessageKind::BudgetProposal if message.budget.is_none() => {
                Err(ChatError::malformed(id, "budget proposal message has no budget"))
            }
            _ => Ok(()),
        }
    }

    pub fn decode(raw: RawChange) -> ChatResult<ChangeEvent> {
        let fallback = raw.clone();
        ChangeEvent::try_from(raw).map_err(|err| ChatError::from_change(&fallback, err))
    }

    /// Applies one change to `room_id`. Never awaits: the whole mutation
    /// happens under the state lock.
    pub fn ingest(self: &Arc<Self>, room_id: &RoomId, event: ChangeEvent) -> ChatResult<IngestOutcome> {
        let result = self.apply(room_id, event);
        if let Err(err) = &result {
            self.diagnostics
                .track_message(room_id, None, MessageEventKind::Rejected);
            warn!(room_id = %room_id, "ingest: rejected change: {err}");
        }
        result
    }

    fn apply(self: &Arc<Self>, room_id: &RoomId, event: ChangeEvent) -> ChatResult<IngestOutcome> {
        match event {
            ChangeEvent::Insert(message) => {
                self.check_row(room_id, &message)?;
                self.insert(room_id, message)
            }
            ChangeEvent::Update(message) => {
                self.check_row(room_id, &message)?;
                Ok(self.update(room_id, message))
            }
            ChangeEvent::Delete(row) => {
                info!(room_id = %room_id, message_id = %row.id, "ingest: delete ignored");
                Ok(IngestOutcome::Ignored)
            }
        }
    }

    fn check_row(&self, room_id: &RoomId, message: &ChatMessage) -> ChatResult<()> {
        if &message.room_id != room_id {
            return Err(ChatError::malformed(
                message.id.as_str(),
                format!("row belongs to room {}, not {room_id}", message.room_id),
            ));
        }
        Self::validate(message)
    }

    fn insert(self: &Arc<Self>, room_id: &RoomId, message: ChatMessage) -> ChatResult<IngestOutcome> {
        let mut events = Vec::new();
        let refresh = {
            let mut state = self.state();
            let current = state.messages.get(room_id).cloned().unwrap_or_default();
            if current.iter().any(|existing| existing.id == message.id) {
                drop(state);
                debug!(room_id = %room_id, message_id = %message.id, "ingest: duplicate dropped");
                self.diagnostics
                    .track_message(room_id, Some(&message.id), MessageEventKind::Duplicate);
                return Ok(IngestOutcome::Duplicate);
            }

            let mut list = current.to_vec();
            list.push(message.clone());
            state.messages.insert(room_id.clone(), Arc::new(list));
            events.push(ChatEvent::MessagesChanged {
                room_id: room_id.clone(),
            });
            if state.summarize(&message) {
                events.push(ChatEvent::RoomsChanged);
            }
            if let Some(count) = state.recount(room_id) {
                events.push(ChatEvent::UnreadChanged {
                    room_id: room_id.clone(),
                    count,
                });
            }

            message
                .budget
                .as_ref()
                .map(|budget| budget.proposal_id.clone())
                .zip(state.rows.clone())
        };

        self.diagnostics
            .track_message(room_id, Some(&message.id), MessageEventKind::Received);
        debug!(room_id = %room_id, message_id = %message.id, kind = message.kind.as_str(), "ingest: appended");
        self.publish(events);

        if let Some((proposal_id, rows)) = refresh {
            self.spawn_proposal_refresh(rows, proposal_id);
        }
        Ok(IngestOutcome::Appended)
    }

    fn update(&self, room_id: &RoomId, message: ChatMessage) -> IngestOutcome {
        let mut events = Vec::new();
        {
            let mut state = self.state();
            let Some(current) = state.messages.get(room_id).cloned() else {
                return IngestOutcome::Ignored;
            };
            let Some(index) = current.iter().position(|existing| existing.id == message.id) else {
                debug!(room_id = %room_id, message_id = %message.id, "ingest: update for unknown message");
                return IngestOutcome::Ignored;
            };

            let mut list = current.to_vec();
            list[index] = message.clone();
            let is_latest = index + 1 == list.len();
            state.messages.insert(room_id.clone(), Arc::new(list));
            events.push(ChatEvent::MessagesChanged {
                room_id: room_id.clone(),
            });
            if is_latest && state.summarize(&message) {
                events.push(ChatEvent::RoomsChanged);
            }
            if let Some(count) = state.recount(room_id) {
                events.push(ChatEvent::UnreadChanged {
                    room_id: room_id.clone(),
                    count,
                });
            }
        }

        self.diagnostics
            .track_message(room_id, Some(&message.id), MessageEventKind::Updated);
        self.publish(events);
        IngestOutcome::Replaced
    }

    fn spawn_proposal_refresh(self: &Arc<Self>, rows: Arc<dyn RowStore>, proposal_id: ProposalId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(proposal_id = %proposal_id, "ingest: no runtime for proposal refresh");
            return;
        };
        let pipeline = Arc::downgrade(self);
        runtime.spawn(async move {
            match rows.fetch_proposal(&proposal_id).await {
                Ok(Some(proposal)) => {
                    if let Some(pipeline) = pipeline.upgrade() {
                        pipeline.upsert_proposal(proposal);
                    }
                }
                Ok(None) => warn!(proposal_id = %proposal_id, "ingest: referenced proposal not found"),
                Err(err) => warn!(proposal_id = %proposal_id, "ingest: proposal refresh failed: {err:#}"),
            }
        });
    }

    /// Reconciles the room with a full fetch. Invalid rows are skipped.
    pub fn replace_messages(&self, room_id: &RoomId, messages: Vec<ChatMessage>) {
        let list: Vec<ChatMessage> = messages
            .into_iter()
            .filter(|message| match Self::validate(message) {
                Ok(()) => true,
                Err(err) => {
                    warn!(room_id = %room_id, "ingest: skipping fetched row: {err}");
                    false
                }
            })
            .collect();

        let mut events = vec![ChatEvent::MessagesChanged {
            room_id: room_id.clone(),
        }];
        {
            let mut state = self.state();
            state.messages.insert(room_id.clone(), Arc::new(list));
            if let Some(count) = state.recount(room_id) {
                events.push(ChatEvent::UnreadChanged {
                    room_id: room_id.clone(),
                    count,
                });
            }
        }
        self.publish(events);
    }

    pub fn set_rooms(&self, mut rooms: Vec<Room>) {
        PipelineState::sort_rooms(&mut rooms);
        self.state().rooms = Arc::new(rooms);
        self.publish(vec![ChatEvent::RoomsChanged]);
    }

    pub fn upsert_room(&self, room: Room) {
        {
            let mut state = self.state();
            let mut rooms = state.rooms.to_vec();
            match rooms.iter_mut().find(|existing| existing.id == room.id) {
                Some(existing) => *existing = room,
                None => rooms.push(room),
            }
            PipelineState::sort_rooms(&mut rooms);
            state.rooms = Arc::new(rooms);
        }
        self.publish(vec![ChatEvent::RoomsChanged]);
    }

    /// Stamps every message the current user has not read. Returns how many
    /// messages changed.
    pub fn mark_read_local(&self, room_id: &RoomId, read_at: DateTime<Utc>) -> usize {
        let mut events = Vec::new();
        let changed = {
            let mut state = self.state();
            let Some(user) = state.current_user.clone() else {
                return 0;
            };
            let Some(current) = state.messages.get(room_id).cloned() else {
                return 0;
            };

            let mut changed = 0;
            let list: Vec<ChatMessage> = current
                .iter()
                .map(|message| {
                    let mut message = message.clone();
                    if message.is_unread_for(&user) {
                        message.read_at = Some(read_at);
                        changed += 1;
                    }
                    message
                })
                .collect();
            if changed == 0 {
                return 0;
            }

            let latest = list.last().cloned();
            state.messages.insert(room_id.clone(), Arc::new(list));
            events.push(ChatEvent::MessagesChanged {
                room_id: room_id.clone(),
            });
            if let Some(latest) = latest {
                if state.summarize(&latest) {
                    events.push(ChatEvent::RoomsChanged);
                }
            }
            if let Some(count) = state.recount(room_id) {
                events.push(ChatEvent::UnreadChanged {
                    room_id: room_id.clone(),
                    count,
                });
            }
            changed
        };
        self.publish(events);
        changed
    }

    pub fn messages(&self, room_id: &RoomId) -> Arc<Vec<ChatMessage>> {
        self.state()
            .messages
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_messages(&self, room_id: &RoomId) -> bool {
        self.state().messages.contains_key(room_id)
    }

    pub fn rooms(&self) -> Arc<Vec<Room>> {
        self.state().rooms.clone()
    }

    pub fn unread_count(&self, room_id: &RoomId) -> usize {
        self.state().unread.get(room_id).copied().unwrap_or(0)
    }

    pub fn total_unread(&self) -> usize {
        self.state().unread.values().sum()
    }

    pub fn proposals(&self, room_id: &RoomId) -> Arc<Vec<Proposal>> {
        self.state()
            .proposals
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_proposals(&self, room_id: &RoomId, mut proposals: Vec<Proposal>) {
        proposals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.state()
            .proposals
            .insert(room_id.clone(), Arc::new(proposals));
        self.publish(vec![ChatEvent::ProposalsChanged {
            room_id: room_id.clone(),
        }]);
    }

    pub fn upsert_proposal(&self, proposal: Proposal) {
        let room_id = proposal.room_id.clone();
        {
            let mut state = self.state();
            let mut list = state
                .proposals
                .get(&room_id)
                .map(|list| list.to_vec())
                .unwrap_or_default();
            match list.iter_mut().find(|existing| existing.id == proposal.id) {
                Some(existing) => *existing = proposal,
                None => list.push(proposal),
            }
            list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            state.proposals.insert(room_id.clone(), Arc::new(list));
        }
        self.publish(vec![ChatEvent::ProposalsChanged { room_id }]);
    }

    /// Changes whose perspective unread counters are computed from.
    pub fn set_current_user(&self, user: Option<UserId>) {
        let mut events = Vec::new();
        {
            let mut state = self.state();
            if state.current_user == user {
                return;
            }
            state.current_user = user;
            let rooms: Vec<RoomId> = state.messages.keys().cloned().collect();
            for room_id in rooms {
                if let Some(count) = state.recount(&room_id) {
                    events.push(ChatEvent::UnreadChanged { room_id, count });
                }
            }
        }
        self.publish(events);
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.state().current_user.clone()
    }

    /// Drops every room, message, counter and proposal. The signed-in user
    /// and the bound row store are kept.
    pub fn reset(&self) {
        {
            let mut state = self.state();
            state.rooms = Arc::default();
            state.messages.clear();
            state.unread.clear();
            state.proposals.clear();
        }
        info!("ingest: model reset");
        self.publish(vec![ChatEvent::Reset]);
    }
}

#[cfg(test)]
#[path = "tests/ingest_tests.rs"]
mod tests;
