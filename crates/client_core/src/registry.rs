use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use futures::{
    future::{join_all, BoxFuture, Shared},
    FutureExt,
};
use serde::Serialize;
use shared::domain::{RoomId, SubscriptionStatus};
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    backend::StatusUpdate,
    config::RealtimeSettings,
    connection::{ChannelHandle, ConnectionManager},
    diagnostics::Diagnostics,
    error::{ChatError, ChatResult},
};

const ROOM_SUBSCRIPTION_PREFIX: &str = "room-messages:";

type PendingCreate = Shared<BoxFuture<'static, ChatResult<ChannelHandle>>>;
type PendingCleanup = Shared<BoxFuture<'static, ()>>;

struct ActiveSubscription {
    handle: ChannelHandle,
    status: SubscriptionStatus,
    status_since: Instant,
    last_activity: Instant,
    error: Option<String>,
    watcher: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<RoomId, ActiveSubscription>,
    pending: HashMap<RoomId, PendingCreate>,
    cleaning: HashMap<RoomId, PendingCleanup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionHealth {
    pub room_id: RoomId,
    pub channel_name: String,
    pub status: SubscriptionStatus,
    pub healthy: bool,
    pub idle: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub active: Vec<SubscriptionHealth>,
    pub pending: Vec<RoomId>,
    pub cleaning: Vec<RoomId>,
}

/// One subscription per room. Concurrent requests for the same room share a
/// single creation; cleanup and creation never overlap for a room.
pub struct SubscriptionRegistry {
    settings: RealtimeSettings,
    connections: Arc<ConnectionManager>,
    diagnostics: Arc<Diagnostics>,
    inner: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new(connections: Arc<ConnectionManager>, diagnostics: Arc<Diagnostics>) -> Arc<Self> {
        Arc::new(Self {
            settings: connections.settings().clone(),
            connections,
            diagnostics,
            inner: Mutex::new(RegistryState::default()),
        })
    }

    /// Connection-manager id used for the room's channel.
    pub fn subscription_id(room_id: &RoomId) -> String {
        format!("{ROOM_SUBSCRIPTION_PREFIX}{room_id}")
    }

    fn room_for(subscription_id: &str) -> Option<RoomId> {
        subscription_id
            .strip_prefix(ROOM_SUBSCRIPTION_PREFIX)
            .map(RoomId::new)
    }

    pub async fn get_or_create<F, Fut>(
        self: &Arc<Self>,
        room_id: &RoomId,
        factory: F,
    ) -> ChatResult<ChannelHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ChatResult<Option<ChannelHandle>>> + Send + 'static,
    {
        let mut state = loop {
            let mut state = self.inner.lock().await;

            if let Some(cleanup) = state.cleaning.get(room_id).cloned() {
                drop(state);
                debug!(room_id = %room_id, "registry: waiting for cleanup before subscribing");
                cleanup.await;
                continue;
            }

            if let Some(active) = state.active.get(room_id) {
                if self.is_healthy(active, Instant::now()) {
                    debug!(room_id = %room_id, "registry: reusing healthy subscription");
                    return Ok(active.handle.clone());
                }
                info!(
                    room_id = %room_id,
                    status = %active.status,
                    "registry: replacing unhealthy subscription"
                );
                let cleanup = self.begin_cleanup(&mut state, room_id);
                drop(state);
                cleanup.await;
                continue;
            }

            if let Some(pending) = state.pending.get(room_id).cloned() {
                drop(state);
                debug!(room_id = %room_id, "registry: joining in-flight subscription");
                return pending.await;
            }

            break state;
        };

        let registry = Arc::clone(self);
        let room = room_id.clone();
        let creation = async move {
            let result = factory().await;
            let mut state = registry.inner.lock().await;
            state.pending.remove(&room);
            match result {
                Ok(Some(handle)) => {
                    registry.activate(&mut state, &room, handle.clone());
                    Ok(handle)
                }
                Ok(None) => {
                    warn!(room_id = %room, "registry: channel not live yet, retry pending");
                    Err(ChatError::TransportTransient {
                        channel: Self::subscription_id(&room),
                        cause: "subscription not established; retry scheduled".to_string(),
                    })
                }
                Err(err) => {
                    warn!(room_id = %room, "registry: subscription failed: {err}");
                    Err(err)
                }
            }
        }
        .boxed()
        .shared();

        state.pending.insert(room_id.clone(), creation.clone());
        drop(state);
        info!(room_id = %room_id, "registry: creating subscription");
        creation.await
    }

    fn activate(self: &Arc<Self>, state: &mut RegistryState, room_id: &RoomId, handle: ChannelHandle) {
        let mut status_rx = handle.watch_status();
        let initial = status_rx.borrow_and_update().clone();
        let registry = Arc::downgrade(self);
        let room = room_id.clone();
        let watcher = tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let update = status_rx.borrow_and_update().clone();
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.record_status(&room, update).await;
            }
        });

        let now = Instant::now();
        self.diagnostics
            .track_subscription(room_id, handle.channel_name(), initial.status);
        if let Some(previous) = state.active.insert(
            room_id.clone(),
            ActiveSubscription {
                handle,
                status: initial.status,
                status_since: now,
                last_activity: now,
                error: initial.error,
                watcher,
            },
        ) {
            previous.watcher.abort();
        }
    }

    async fn record_status(&self, room_id: &RoomId, update: StatusUpdate) {
        let mut state = self.inner.lock().await;
        let Some(active) = state.active.get_mut(room_id) else {
            return;
        };
        let now = Instant::now();
        if active.status != update.status {
            active.status_since = now;
        }
        active.status = update.status;
        active.last_activity = now;
        active.error = update.error;
        debug!(room_id = %room_id, status = %active.status, "registry: status changed");
        self.diagnostics
            .subscription_status_changed(room_id, active.status, active.error.clone());
    }

    /// Marks inbound activity for the room's subscription.
    pub async fn touch(&self, room_id: &RoomId) {
        if let Some(active) = self.inner.lock().await.active.get_mut(room_id) {
            active.last_activity = Instant::now();
        }
    }

    fn is_healthy(&self, active: &ActiveSubscription, now: Instant) -> bool {
        let fresh = now.saturating_duration_since(active.last_activity) < self.settings.stale_after;
        let live = match active.status {
            SubscriptionStatus::Subscribed => true,
            SubscriptionStatus::Connecting => {
                now.saturating_duration_since(active.status_since) < self.settings.subscribe_timeout
            }
            _ => false,
        };
        fresh && live
    }

    fn begin_cleanup(self: &Arc<Self>, state: &mut RegistryState, room_id: &RoomId) -> PendingCleanup {
        if let Some(existing) = state.cleaning.get(room_id) {
            return existing.clone();
        }

        let registry = Arc::clone(self);
        let room = room_id.clone();
        let pending = state.pending.get(room_id).cloned();
        let cleanup = async move {
            if let Some(pending) = pending {
                let _ = pending.await;
            }

            let removed = registry.inner.lock().await.active.remove(&room);
            let mut ids = vec![Self::subscription_id(&room)];
            if let Some(active) = removed {
                active.watcher.abort();
                let id = active.handle.subscription_id().to_string();
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            for id in ids {
                registry.connections.remove_subscription(&id).await;
            }
            registry.diagnostics.untrack_subscription(&room);

            registry.inner.lock().await.cleaning.remove(&room);
            info!(room_id = %room, "registry: subscription cleaned up");
        }
        .boxed()
        .shared();

        state.cleaning.insert(room_id.clone(), cleanup.clone());
        cleanup
    }

    /// Best-effort teardown of the room's subscription. Concurrent
    /// `get_or_create` calls for the room wait for it to finish.
    pub async fn cleanup(self: &Arc<Self>, room_id: &RoomId) {
        let cleanup = {
            let mut state = self.inner.lock().await;
            self.begin_cleanup(&mut state, room_id)
        };
        cleanup.await;
    }

    pub async fn refresh<F, Fut>(self: &Arc<Self>, room_id: &RoomId, factory: F) -> ChatResult<ChannelHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ChatResult<Option<ChannelHandle>>> + Send + 'static,
    {
        self.cleanup(room_id).await;
        self.get_or_create(room_id, factory).await
    }

    /// Tears down every room, including rooms whose channel only lives on
    /// as a scheduled retry in the connection manager.
    pub async fn cleanup_all(self: &Arc<Self>) {
        let retrying: Vec<RoomId> = self
            .connections
            .subscription_ids()
            .await
            .iter()
            .filter_map(|id| Self::room_for(id))
            .collect();
        let rooms: Vec<RoomId> = {
            let state = self.inner.lock().await;
            let mut rooms: Vec<RoomId> = state
                .active
                .keys()
                .chain(state.pending.keys())
                .cloned()
                .chain(retrying)
                .collect();
            rooms.sort();
            rooms.dedup();
            rooms
        };
        if rooms.is_empty() {
            return;
        }
        info!(count = rooms.len(), "registry: cleaning up all subscriptions");
        join_all(rooms.iter().map(|room_id| self.cleanup(room_id))).await;
    }

    pub async fn health(&self, room_id: &RoomId) -> Option<SubscriptionHealth> {
        let state = self.inner.lock().await;
        let active = state.active.get(room_id)?;
        Some(self.describe(room_id, active, Instant::now()))
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let state = self.inner.lock().await;
        let now = Instant::now();
        let mut active: Vec<_> = state
            .active
            .iter()
            .map(|(room_id, entry)| self.describe(room_id, entry, now))
            .collect();
        active.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        let mut pending: Vec<_> = state.pending.keys().cloned().collect();
        pending.sort();
        let mut cleaning: Vec<_> = state.cleaning.keys().cloned().collect();
        cleaning.sort();
        RegistrySnapshot {
            active,
            pending,
            cleaning,
        }
    }

    fn describe(&self, room_id: &RoomId, active: &ActiveSubscription, now: Instant) -> SubscriptionHealth {
        SubscriptionHealth {
            room_id: room_id.clone(),
            channel_name: active.handle.channel_name().to_string(),
            status: active.status,
            healthy: self.is_healthy(active, now),
            idle: now.saturating_duration_since(active.last_activity),
            error: active.error.clone(),
        }
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
