use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use shared::{
    domain::{
        JobId, MessageId, MessageKind, ProposalId, ProposalStatus, RoomId, SubscriptionStatus,
        UserId,
    },
    protocol::{
        BudgetPayload, ChatMessage, MessageSummary, NewMessage, NewProposal, Proposal,
        ProposalWithMessage, RawChange, Room,
    },
};
use tokio::sync::mpsc;

use crate::{
    auth::{Session, SessionHandle},
    backend::{
        BackendClient, ChannelRequest, ChannelSignal, ObjectStorage, RealtimeChannel,
        RealtimeTransport, RowStore, StatusUpdate,
    },
};

/// How a mock channel answers `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Script {
    Subscribe,
    Fail(SubscriptionStatus),
    Close,
    Silent,
}

pub(crate) struct MockChannel {
    name: String,
    script: Script,
    sender: StdMutex<Option<mpsc::UnboundedSender<ChannelSignal>>>,
    unsubscribed: AtomicBool,
}

impl MockChannel {
    pub(crate) fn emit(&self, signal: ChannelSignal) {
        if let Some(sender) = self.sender.lock().expect("sender").as_ref() {
            let _ = sender.send(signal);
        }
    }

    pub(crate) fn push_change(&self, change: RawChange) {
        self.emit(ChannelSignal::Change(change));
    }

    pub(crate) fn push_status(&self, status: SubscriptionStatus) {
        self.emit(ChannelSignal::Status(StatusUpdate::new(status)));
    }

    pub(crate) fn was_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeChannel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ChannelSignal>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ChannelSignal::Status(StatusUpdate::new(
            SubscriptionStatus::Connecting,
        )));
        match self.script {
            Script::Subscribe => {
                let _ = tx.send(ChannelSignal::Status(StatusUpdate::new(
                    SubscriptionStatus::Subscribed,
                )));
            }
            Script::Fail(status) => {
                let _ = tx.send(ChannelSignal::Status(StatusUpdate::failed(
                    status,
                    "scripted failure",
                )));
            }
            Script::Close => {
                let _ = tx.send(ChannelSignal::Status(StatusUpdate::new(
                    SubscriptionStatus::Closed,
                )));
            }
            Script::Silent => {}
        }
        *self.sender.lock().expect("sender") = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.unsubscribed.store(true, Ordering::SeqCst);
        self.sender.lock().expect("sender").take();
        Ok(())
    }
}

pub(crate) struct MockTransport {
    scripts: StdMutex<VecDeque<Script>>,
    fallback: Script,
    pub(crate) channels: StdMutex<Vec<Arc<MockChannel>>>,
    pub(crate) tokens: StdMutex<Vec<Option<String>>>,
}

impl MockTransport {
    pub(crate) fn new(fallback: Script) -> Arc<Self> {
        Self::scripted(Vec::new(), fallback)
    }

    /// Channels answer with `scripts` in order, then with `fallback`.
    pub(crate) fn scripted(scripts: Vec<Script>, fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            scripts: StdMutex::new(scripts.into()),
            fallback,
            channels: StdMutex::new(Vec::new()),
            tokens: StdMutex::new(Vec::new()),
        })
    }

    pub(crate) fn opened(&self) -> usize {
        self.channels.lock().expect("channels").len()
    }

    pub(crate) fn opened_named(&self, name: &str) -> usize {
        self.channels
            .lock()
            .expect("channels")
            .iter()
            .filter(|channel| channel.name == name)
            .count()
    }

    pub(crate) fn last_channel(&self) -> Arc<MockChannel> {
        Arc::clone(
            self.channels
                .lock()
                .expect("channels")
                .last()
                .expect("a channel was opened"),
        )
    }
}

#[async_trait]
impl RealtimeTransport for MockTransport {
    async fn set_auth(&self, access_token: Option<String>) -> Result<()> {
        self.tokens.lock().expect("tokens").push(access_token);
        Ok(())
    }

    async fn open_channel(&self, request: ChannelRequest) -> Result<Arc<dyn RealtimeChannel>> {
        let script = self
            .scripts
            .lock()
            .expect("scripts")
            .pop_front()
            .unwrap_or(self.fallback);
        let channel = Arc::new(MockChannel {
            name: request.name,
            script,
            sender: StdMutex::new(None),
            unsubscribed: AtomicBool::new(false),
        });
        self.channels
            .lock()
            .expect("channels")
            .push(Arc::clone(&channel));
        Ok(channel)
    }
}

#[derive(Default)]
pub(crate) struct MockRowStore {
    pub(crate) rooms: StdMutex<Vec<Room>>,
    pub(crate) messages: StdMutex<HashMap<RoomId, Vec<ChatMessage>>>,
    pub(crate) proposals: StdMutex<HashMap<ProposalId, Proposal>>,
    pub(crate) fail_inserts: AtomicBool,
    pub(crate) fail_ping: AtomicBool,
    pub(crate) list_room_calls: AtomicUsize,
    pub(crate) list_message_calls: AtomicUsize,
    pub(crate) proposal_fetches: AtomicUsize,
    next_id: AtomicUsize,
    pub(crate) current_user: StdMutex<Option<UserId>>,
}

impl MockRowStore {
    pub(crate) fn new(user: &str) -> Arc<Self> {
        let store = Self::default();
        *store.current_user.lock().expect("user") = Some(UserId::new(user));
        Arc::new(store)
    }

    pub(crate) fn with_room(self: &Arc<Self>, room: Room) -> Arc<Self> {
        self.rooms.lock().expect("rooms").push(room);
        Arc::clone(self)
    }

    pub(crate) fn seed_messages(&self, room_id: &RoomId, messages: Vec<ChatMessage>) {
        self.messages
            .lock()
            .expect("messages")
            .insert(room_id.clone(), messages);
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn user(&self) -> Result<UserId> {
        self.current_user
            .lock()
            .expect("user")
            .clone()
            .ok_or_else(|| anyhow!("not signed in"))
    }
}

#[async_trait]
impl RowStore for MockRowStore {
    async fn ping(&self) -> Result<()> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(anyhow!("ping refused"));
        }
        Ok(())
    }

    async fn list_rooms(&self, user_id: &UserId) -> Result<Vec<Room>> {
        self.list_room_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rooms
            .lock()
            .expect("rooms")
            .iter()
            .filter(|room| room.has_participant(user_id))
            .cloned()
            .collect())
    }

    async fn list_messages(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>> {
        self.list_message_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .messages
            .lock()
            .expect("messages")
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_message(&self, room_id: &RoomId, message: NewMessage) -> Result<ChatMessage> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(anyhow!("insert rejected"));
        }
        let row = ChatMessage {
            id: MessageId::new(self.next("msg")),
            room_id: room_id.clone(),
            sender_id: self.user()?,
            content: message.content,
            kind: message.kind,
            created_at: Utc::now(),
            read_at: None,
            attachment_url: message.attachment_url,
            budget: None,
            sender_name: message.sender_name,
            job_context: message.job_context,
        };
        self.messages
            .lock()
            .expect("messages")
            .entry(room_id.clone())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn mark_read(&self, room_id: &RoomId, reader: &UserId) -> Result<Vec<ChatMessage>> {
        let now = Utc::now();
        let mut updated = Vec::new();
        if let Some(list) = self.messages.lock().expect("messages").get_mut(room_id) {
            for message in list.iter_mut() {
                if &message.sender_id != reader && message.read_at.is_none() {
                    message.read_at = Some(now);
                    updated.push(message.clone());
                }
            }
        }
        Ok(updated)
    }

    async fn get_or_create_general_room(&self, other_user_id: &UserId) -> Result<Room> {
        let me = self.user()?;
        let mut rooms = self.rooms.lock().expect("rooms");
        if let Some(room) = rooms.iter().find(|room| {
            room.job_id.is_none() && room.has_participant(&me) && room.has_participant(other_user_id)
        }) {
            return Ok(room.clone());
        }
        let room = room(&self.next("room"), me.as_str(), other_user_id.as_str(), 0);
        rooms.push(room.clone());
        Ok(room)
    }

    async fn fetch_proposal(&self, proposal_id: &ProposalId) -> Result<Option<Proposal>> {
        self.proposal_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .proposals
            .lock()
            .expect("proposals")
            .get(proposal_id)
            .cloned())
    }

    async fn list_proposals(&self, room_id: &RoomId) -> Result<Vec<Proposal>> {
        Ok(self
            .proposals
            .lock()
            .expect("proposals")
            .values()
            .filter(|proposal| &proposal.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn create_proposal(
        &self,
        room_id: &RoomId,
        new_proposal: NewProposal,
    ) -> Result<ProposalWithMessage> {
        let me = self.user()?;
        let proposal = Proposal {
            id: ProposalId::new(self.next("proposal")),
            room_id: room_id.clone(),
            job_id: new_proposal.job_id,
            proposer_id: me.clone(),
            recipient_id: new_proposal.recipient_id,
            kind: new_proposal.kind,
            amount_min: new_proposal.amount_min,
            amount_max: new_proposal.amount_max,
            currency: new_proposal.currency,
            notes: new_proposal.notes.clone(),
            status: ProposalStatus::Pending,
            created_at: Utc::now(),
        };
        let message = ChatMessage {
            id: MessageId::new(self.next("msg")),
            room_id: room_id.clone(),
            sender_id: me,
            content: new_proposal.notes.unwrap_or_default(),
            kind: MessageKind::BudgetProposal,
            created_at: Utc::now(),
            read_at: None,
            attachment_url: None,
            budget: Some(BudgetPayload {
                proposal_id: proposal.id.clone(),
                amount_min: proposal.amount_min,
                amount_max: proposal.amount_max,
                currency: proposal.currency.clone(),
            }),
            sender_name: new_proposal.sender_name,
            job_context: None,
        };
        self.proposals
            .lock()
            .expect("proposals")
            .insert(proposal.id.clone(), proposal.clone());
        Ok(ProposalWithMessage { proposal, message })
    }

    async fn respond_to_proposal(
        &self,
        proposal_id: &ProposalId,
        status: ProposalStatus,
    ) -> Result<Proposal> {
        let mut proposals = self.proposals.lock().expect("proposals");
        let proposal = proposals
            .get_mut(proposal_id)
            .ok_or_else(|| anyhow!("proposal {proposal_id} not found"))?;
        proposal.status = status;
        Ok(proposal.clone())
    }
}

#[derive(Default)]
pub(crate) struct MockObjectStorage {
    pub(crate) uploads: StdMutex<Vec<(String, String, String, usize)>>,
    pub(crate) removed: StdMutex<Vec<(String, String)>>,
}

#[async_trait]
impl ObjectStorage for MockObjectStorage {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        self.uploads.lock().expect("uploads").push((
            bucket.to_string(),
            path.to_string(),
            content_type.to_string(),
            bytes.len(),
        ));
        Ok(format!("https://cdn.test/{bucket}/{path}"))
    }

    async fn remove(&self, bucket: &str, path: &str) -> Result<()> {
        self.removed
            .lock()
            .expect("removed")
            .push((bucket.to_string(), path.to_string()));
        Ok(())
    }
}

pub(crate) struct Harness {
    pub(crate) transport: Arc<MockTransport>,
    pub(crate) rows: Arc<MockRowStore>,
    pub(crate) auth: Arc<SessionHandle>,
    pub(crate) objects: Arc<MockObjectStorage>,
}

impl Harness {
    pub(crate) fn new(user: &str, transport: Arc<MockTransport>) -> Self {
        Self {
            transport,
            rows: MockRowStore::new(user),
            auth: Arc::new(SessionHandle::with_session(session(user, "token-1"))),
            objects: Arc::new(MockObjectStorage::default()),
        }
    }

    pub(crate) fn client(&self) -> BackendClient {
        BackendClient::new(
            self.transport.clone(),
            self.rows.clone(),
            self.auth.clone(),
            self.objects.clone(),
        )
    }
}

pub(crate) fn session(user: &str, token: &str) -> Session {
    Session {
        user_id: UserId::new(user),
        access_token: token.to_string(),
    }
}

pub(crate) fn room(id: &str, a: &str, b: &str, minutes_ago: i64) -> Room {
    let at = Utc::now() - ChronoDuration::minutes(minutes_ago);
    Room {
        id: RoomId::new(id),
        participant_a: UserId::new(a),
        participant_b: UserId::new(b),
        job_id: None::<JobId>,
        created_at: at,
        updated_at: at,
        latest_message: None::<MessageSummary>,
    }
}

pub(crate) fn text_message(id: &str, room: &str, sender: &str, content: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId::new(id),
        room_id: RoomId::new(room),
        sender_id: UserId::new(sender),
        content: content.to_string(),
        kind: MessageKind::Text,
        created_at: Utc
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .expect("timestamp"),
        read_at: None,
        attachment_url: None,
        budget: None,
        sender_name: None,
        job_context: None,
    }
}
