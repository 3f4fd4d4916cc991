use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{
    future::{join_all, BoxFuture},
    FutureExt,
};
use serde::Serialize;
use shared::{
    domain::SubscriptionStatus,
    protocol::{ChangeFilter, RawChange},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    auth::AuthChange,
    backend::{
        BackendClient, ChannelOptions, ChannelRequest, ChannelSignal, RealtimeChannel,
        StatusUpdate,
    },
    config::RealtimeSettings,
    error::{ChatError, ChatResult},
};

pub const HEALTH_CHECK_CHANNEL: &str = "health-check";

/// Receives the raw changes of one channel. Calls are awaited one at a time,
/// so a handler observes changes in arrival order.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn on_change(&self, change: RawChange);
}

#[derive(Clone)]
pub struct SubscriptionConfig {
    pub channel_name: String,
    pub options: ChannelOptions,
    pub filter: Option<ChangeFilter>,
    pub handler: Arc<dyn ChangeHandler>,
}

#[derive(Clone)]
pub struct ChannelHandle {
    subscription_id: String,
    channel_name: String,
    channel: Arc<dyn RealtimeChannel>,
    status: watch::Receiver<StatusUpdate>,
}

impl ChannelHandle {
    pub(crate) fn new(
        subscription_id: impl Into<String>,
        channel: Arc<dyn RealtimeChannel>,
        status: watch::Receiver<StatusUpdate>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            channel_name: channel.name().to_string(),
            channel,
            status,
        }
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status.borrow().status
    }

    pub fn watch_status(&self) -> watch::Receiver<StatusUpdate> {
        self.status.clone()
    }

    pub fn same_channel(&self, other: &ChannelHandle) -> bool {
        Arc::ptr_eq(&self.channel, &other.channel)
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("subscription_id", &self.subscription_id)
            .field("channel_name", &self.channel_name)
            .field("status", &self.status())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StatusChanged {
        subscription_id: String,
        status: SubscriptionStatus,
    },
    RetryScheduled {
        subscription_id: String,
        attempt: u32,
        delay: Duration,
    },
    Failed {
        subscription_id: String,
        error: ChatError,
    },
    Reauthenticated,
    SignedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSnapshot {
    pub subscription_id: String,
    pub channel_name: String,
    pub status: SubscriptionStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: OverallState,
    pub authenticated: bool,
    pub last_error: Option<String>,
    pub subscriptions: Vec<SubscriptionSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionTest {
    pub api: bool,
    pub realtime: bool,
}

struct Tracked {
    config: SubscriptionConfig,
    generation: u64,
    retry_count: u32,
    status: SubscriptionStatus,
    last_error: Option<String>,
    channel: Option<Arc<dyn RealtimeChannel>>,
    status_tx: watch::Sender<StatusUpdate>,
    pump: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl Tracked {
    fn set_status(&mut self, update: StatusUpdate) {
        self.status = update.status;
        self.status_tx.send_replace(update);
    }

    fn stop_tasks(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    client: Option<BackendClient>,
    authenticated: bool,
    last_error: Option<String>,
    subscriptions: HashMap<String, Tracked>,
    next_generation: u64,
    auth_listener: Option<JoinHandle<()>>,
}

enum FailureOutcome {
    Retry { attempt: u32, delay: Duration },
    Terminal(ChatError),
}

/// Owns the authenticated realtime transport and the retry state machine of
/// every channel subscription.
pub struct ConnectionManager {
    settings: RealtimeSettings,
    inner: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(settings: RealtimeSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            settings,
            inner: Mutex::new(ConnectionState::default()),
            events,
        })
    }

    pub fn settings(&self) -> &RealtimeSettings {
        &self.settings
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub async fn client(&self) -> ChatResult<BackendClient> {
        self.inner
            .lock()
            .await
            .client
            .clone()
            .ok_or(ChatError::NotInitialized("connection manager"))
    }

    pub async fn initialize(self: &Arc<Self>, client: BackendClient) -> ChatResult<()> {
        let session = client.auth.current_session().await;
        if let Some(session) = &session {
            client
                .realtime
                .set_auth(Some(session.access_token.clone()))
                .await
                .map_err(ChatError::backend)?;
        }
        let mut changes = client.auth.subscribe();

        let mut state = self.inner.lock().await;
        state.client = Some(client);
        state.authenticated = session.is_some();

        let manager = Arc::downgrade(self);
        let listener = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.handle_auth_change(change).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "realtime: auth listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = state.auth_listener.replace(listener) {
            previous.abort();
        }
        info!(
            authenticated = state.authenticated,
            "realtime: connection manager initialized"
        );
        Ok(())
    }

    async fn handle_auth_change(self: &Arc<Self>, change: AuthChange) {
        let Ok(client) = self.client().await else {
            return;
        };

        match change.session() {
            Some(session) => {
                if let Err(err) = client
                    .realtime
                    .set_auth(Some(session.access_token.clone()))
                    .await
                {
                    warn!(user_id = %session.user_id, "realtime: failed to re-authenticate transport: {err:#}");
                    self.inner.lock().await.last_error = Some(format!("{err:#}"));
                    return;
                }
                self.inner.lock().await.authenticated = true;
                info!(user_id = %session.user_id, "realtime: transport re-authenticated");
                self.publish(ConnectionEvent::Reauthenticated);
                self.reconnect_all().await;
            }
            None => {
                if let Err(err) = client.realtime.set_auth(None).await {
                    warn!("realtime: failed to clear transport token: {err:#}");
                }
                self.inner.lock().await.authenticated = false;
                warn!("realtime: signed out; live subscriptions are left to their owners");
                self.publish(ConnectionEvent::SignedOut);
            }
        }
    }

    /// Opens a channel for `id`, replacing any subscription already tracked
    /// under that id. `Ok(None)` means the channel is not live yet: either a
    /// retry was scheduled or the transport closed it during the handshake.
    pub async fn create_subscription(
        self: &Arc<Self>,
        id: &str,
        config: SubscriptionConfig,
    ) -> ChatResult<Option<ChannelHandle>> {
        self.remove_subscription(id).await;

        let generation = {
            let mut state = self.inner.lock().await;
            if state.client.is_none() {
                return Err(ChatError::NotInitialized("connection manager"));
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            let (status_tx, _) =
                watch::channel(StatusUpdate::new(SubscriptionStatus::Connecting));
            state.subscriptions.insert(
                id.to_string(),
                Tracked {
                    config,
                    generation,
                    retry_count: 0,
                    status: SubscriptionStatus::Connecting,
                    last_error: None,
                    channel: None,
                    status_tx,
                    pump: None,
                    retry: None,
                },
            );
            generation
        };

        Arc::clone(self).attempt(id.to_string(), generation).await
    }

    fn attempt(
        self: Arc<Self>,
        id: String,
        generation: u64,
    ) -> BoxFuture<'static, ChatResult<Option<ChannelHandle>>> {
        async move {
            let (client, config) = {
                let mut state = self.inner.lock().await;
                let client = state.client.clone();
                let Some(entry) = state.subscriptions.get_mut(&id) else {
                    return Ok(None);
                };
                if entry.generation != generation {
                    return Ok(None);
                }
                // the handle may belong to the task running this attempt
                entry.retry = None;
                entry.set_status(StatusUpdate::new(SubscriptionStatus::Connecting));
                (client, entry.config.clone())
            };
            self.publish(ConnectionEvent::StatusChanged {
                subscription_id: id.clone(),
                status: SubscriptionStatus::Connecting,
            });
            let client = client.ok_or(ChatError::NotInitialized("connection manager"))?;

            debug!(subscription_id = %id, channel = %config.channel_name, "realtime: opening channel");
            let request = ChannelRequest {
                name: config.channel_name.clone(),
                options: config.options,
                filter: config.filter.clone(),
            };
            let channel = match client.realtime.open_channel(request).await {
                Ok(channel) => channel,
                Err(err) => {
                    let update = StatusUpdate::failed(
                        SubscriptionStatus::ChannelError,
                        format!("failed to open channel: {err:#}"),
                    );
                    return self.handle_failure(&id, generation, update).await;
                }
            };
            let mut signals = match channel.subscribe().await {
                Ok(signals) => signals,
                Err(err) => {
                    let update = StatusUpdate::failed(
                        SubscriptionStatus::ChannelError,
                        format!("failed to subscribe: {err:#}"),
                    );
                    return self.handle_failure(&id, generation, update).await;
                }
            };

            let handshake = timeout(
                self.settings.subscribe_timeout,
                await_handshake(&mut signals, config.handler.as_ref()),
            )
            .await;
            let update = match handshake {
                Ok(Some(update)) => update,
                Ok(None) => StatusUpdate::failed(
                    SubscriptionStatus::ChannelError,
                    "channel stream ended during subscribe",
                ),
                Err(_) => StatusUpdate::failed(
                    SubscriptionStatus::TimedOut,
                    format!(
                        "no subscribe status within {}ms",
                        self.settings.subscribe_timeout.as_millis()
                    ),
                ),
            };

            match update.status {
                SubscriptionStatus::Subscribed => {
                    self.activate(&id, generation, channel, signals, &config)
                        .await
                }
                SubscriptionStatus::Closed => {
                    info!(subscription_id = %id, "realtime: channel closed during subscribe");
                    self.record_status(&id, generation, update).await;
                    Ok(None)
                }
                _ => {
                    if let Err(err) = channel.unsubscribe().await {
                        debug!(subscription_id = %id, "realtime: unsubscribe after failed handshake: {err:#}");
                    }
                    self.handle_failure(&id, generation, update).await
                }
            }
        }
        .boxed()
    }

    async fn activate(
        self: &Arc<Self>,
        id: &str,
        generation: u64,
        channel: Arc<dyn RealtimeChannel>,
        signals: mpsc::UnboundedReceiver<ChannelSignal>,
        config: &SubscriptionConfig,
    ) -> ChatResult<Option<ChannelHandle>> {
        let handle = {
            let mut state = self.inner.lock().await;
            match state.subscriptions.get_mut(id) {
                Some(entry) if entry.generation == generation => {
                    entry.retry_count = 0;
                    entry.last_error = None;
                    entry.channel = Some(Arc::clone(&channel));
                    entry.set_status(StatusUpdate::new(SubscriptionStatus::Subscribed));
                    entry.pump = Some(self.spawn_pump(
                        id.to_string(),
                        generation,
                        signals,
                        Arc::clone(&config.handler),
                    ));
                    Some(ChannelHandle::new(
                        id,
                        Arc::clone(&channel),
                        entry.status_tx.subscribe(),
                    ))
                }
                _ => None,
            }
        };

        let Some(handle) = handle else {
            debug!(subscription_id = %id, "realtime: subscription superseded during handshake");
            if let Err(err) = channel.unsubscribe().await {
                warn!(subscription_id = %id, "realtime: failed to close superseded channel: {err:#}");
            }
            return Ok(None);
        };

        info!(subscription_id = %id, channel = %config.channel_name, "realtime: subscribed");
        self.publish(ConnectionEvent::StatusChanged {
            subscription_id: id.to_string(),
            status: SubscriptionStatus::Subscribed,
        });
        Ok(Some(handle))
    }

    fn spawn_pump(
        self: &Arc<Self>,
        id: String,
        generation: u64,
        mut signals: mpsc::UnboundedReceiver<ChannelSignal>,
        handler: Arc<dyn ChangeHandler>,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let update = match signal {
                    ChannelSignal::Change(change) => {
                        handler.on_change(change).await;
                        continue;
                    }
                    ChannelSignal::Status(update) => update,
                };
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                match update.status {
                    SubscriptionStatus::Subscribed | SubscriptionStatus::Connecting => {
                        manager.record_status(&id, generation, update).await;
                    }
                    SubscriptionStatus::Closed => {
                        info!(subscription_id = %id, "realtime: channel closed by transport");
                        manager.record_status(&id, generation, update).await;
                        return;
                    }
                    SubscriptionStatus::ChannelError | SubscriptionStatus::TimedOut => {
                        let _ = manager.handle_failure(&id, generation, update).await;
                        return;
                    }
                }
            }

            if let Some(manager) = manager.upgrade() {
                let update = StatusUpdate::failed(
                    SubscriptionStatus::ChannelError,
                    "realtime stream ended",
                );
                let _ = manager.handle_failure(&id, generation, update).await;
            }
        })
    }

    async fn record_status(&self, id: &str, generation: u64, update: StatusUpdate) {
        let status = update.status;
        {
            let mut state = self.inner.lock().await;
            let Some(entry) = state.subscriptions.get_mut(id) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            entry.set_status(update);
        }
        self.publish(ConnectionEvent::StatusChanged {
            subscription_id: id.to_string(),
            status,
        });
    }

    async fn handle_failure(
        self: &Arc<Self>,
        id: &str,
        generation: u64,
        update: StatusUpdate,
    ) -> ChatResult<Option<ChannelHandle>> {
        let status = update.status;
        let cause = update.error.clone().unwrap_or_else(|| status.to_string());

        let (outcome, channel_name, stale_channel) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let Some(entry) = state.subscriptions.get_mut(id) else {
                return Ok(None);
            };
            if entry.generation != generation {
                return Ok(None);
            }

            entry.last_error = Some(cause.clone());
            // the pump may be the task reporting this failure
            entry.pump = None;
            let stale_channel = entry.channel.take();
            entry.set_status(update);
            let channel_name = entry.config.channel_name.clone();

            let outcome = if entry.retry_count < self.settings.max_retries {
                let delay = self.settings.backoff_delay(entry.retry_count);
                entry.retry_count += 1;
                let manager = Arc::clone(self);
                let retry_id = id.to_string();
                entry.retry = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(err) = manager.attempt(retry_id.clone(), generation).await {
                        debug!(subscription_id = %retry_id, "realtime: retry attempt ended with {err}");
                    }
                }));
                FailureOutcome::Retry {
                    attempt: entry.retry_count,
                    delay,
                }
            } else {
                let err = ChatError::TransportTerminal {
                    channel: channel_name.clone(),
                    cause: cause.clone(),
                };
                state.last_error = Some(err.to_string());
                FailureOutcome::Terminal(err)
            };
            (outcome, channel_name, stale_channel)
        };

        if let Some(channel) = stale_channel {
            if let Err(err) = channel.unsubscribe().await {
                debug!(subscription_id = %id, "realtime: unsubscribe of failed channel: {err:#}");
            }
        }
        self.publish(ConnectionEvent::StatusChanged {
            subscription_id: id.to_string(),
            status,
        });

        match outcome {
            FailureOutcome::Retry { attempt, delay } => {
                warn!(
                    subscription_id = %id,
                    channel = %channel_name,
                    %status,
                    attempt,
                    ?delay,
                    "realtime: channel failed, retry scheduled: {cause}"
                );
                self.publish(ConnectionEvent::RetryScheduled {
                    subscription_id: id.to_string(),
                    attempt,
                    delay,
                });
                Ok(None)
            }
            FailureOutcome::Terminal(err) => {
                error!(
                    subscription_id = %id,
                    channel = %channel_name,
                    max_retries = self.settings.max_retries,
                    "realtime: giving up on channel: {cause}"
                );
                self.publish(ConnectionEvent::Failed {
                    subscription_id: id.to_string(),
                    error: err.clone(),
                });
                Err(err)
            }
        }
    }

    /// Best-effort unsubscribe. Bookkeeping and pending tasks are always dropped.
    pub async fn remove_subscription(&self, id: &str) {
        let removed = self.inner.lock().await.subscriptions.remove(id);
        let Some(mut entry) = removed else {
            return;
        };
        entry.stop_tasks();
        entry.set_status(StatusUpdate::new(SubscriptionStatus::Closed));
        if let Some(channel) = entry.channel.take() {
            if let Err(err) = channel.unsubscribe().await {
                warn!(subscription_id = %id, "realtime: unsubscribe failed: {err:#}");
            }
        }
        info!(subscription_id = %id, "realtime: subscription removed");
        self.publish(ConnectionEvent::StatusChanged {
            subscription_id: id.to_string(),
            status: SubscriptionStatus::Closed,
        });
    }

    /// Re-attempts every tracked subscription that is not currently subscribed.
    pub async fn reconnect_all(self: &Arc<Self>) {
        let restarted = self
            .restart_where(|entry| entry.status != SubscriptionStatus::Subscribed)
            .await;
        if restarted > 0 {
            info!(restarted, "realtime: reconnect pass finished");
        }
    }

    /// Drops every live channel and subscribes everything again from scratch.
    pub async fn force_reconnect(self: &Arc<Self>) {
        let restarted = self.restart_where(|_| true).await;
        info!(restarted, "realtime: forced reconnect finished");
    }

    async fn restart_where(self: &Arc<Self>, predicate: impl Fn(&Tracked) -> bool) -> usize {
        let (targets, stale_channels) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let mut targets = Vec::new();
            let mut stale_channels = Vec::new();
            for (id, entry) in state.subscriptions.iter_mut() {
                if !predicate(entry) {
                    continue;
                }
                entry.stop_tasks();
                stale_channels.extend(entry.channel.take());
                state.next_generation += 1;
                entry.generation = state.next_generation;
                entry.retry_count = 0;
                targets.push((id.clone(), entry.generation));
            }
            (targets, stale_channels)
        };

        for channel in stale_channels {
            if let Err(err) = channel.unsubscribe().await {
                debug!(channel = channel.name(), "realtime: unsubscribe before reconnect: {err:#}");
            }
        }

        let restarted = targets.len();
        let attempts = targets
            .into_iter()
            .map(|(id, generation)| Arc::clone(self).attempt(id, generation));
        for result in join_all(attempts).await {
            if let Err(err) = result {
                warn!("realtime: reconnect attempt failed: {err}");
            }
        }
        restarted
    }

    /// One authenticated read plus a throwaway channel handshake.
    pub async fn test_connection(&self) -> ChatResult<ConnectionTest> {
        let client = self.client().await?;
        let limit = self.settings.health_check_timeout;

        let api = match timeout(limit, client.rows.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!("realtime: api health check failed: {err:#}");
                false
            }
            Err(_) => {
                warn!("realtime: api health check timed out");
                false
            }
        };
        let realtime = self.probe_realtime(&client, limit).await;

        info!(api, realtime, "realtime: connection test finished");
        Ok(ConnectionTest { api, realtime })
    }

    async fn probe_realtime(&self, client: &BackendClient, limit: Duration) -> bool {
        let request = ChannelRequest {
            name: HEALTH_CHECK_CHANNEL.to_string(),
            options: ChannelOptions::default(),
            filter: None,
        };
        let channel = match client.realtime.open_channel(request).await {
            Ok(channel) => channel,
            Err(err) => {
                warn!("realtime: health channel could not be opened: {err:#}");
                return false;
            }
        };
        let subscribed = match channel.subscribe().await {
            Ok(mut signals) => {
                let wait = async {
                    while let Some(signal) = signals.recv().await {
                        if let ChannelSignal::Status(update) = signal {
                            match update.status {
                                SubscriptionStatus::Connecting => continue,
                                status => return status == SubscriptionStatus::Subscribed,
                            }
                        }
                    }
                    false
                };
                timeout(limit, wait).await.unwrap_or(false)
            }
            Err(err) => {
                warn!("realtime: health channel subscribe failed: {err:#}");
                false
            }
        };
        if let Err(err) = channel.unsubscribe().await {
            debug!("realtime: health channel unsubscribe failed: {err:#}");
        }
        subscribed
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        let state = self.inner.lock().await;
        let mut subscriptions: Vec<_> = state
            .subscriptions
            .iter()
            .map(|(id, entry)| SubscriptionSnapshot {
                subscription_id: id.clone(),
                channel_name: entry.config.channel_name.clone(),
                status: entry.status,
                retry_count: entry.retry_count,
                last_error: entry.last_error.clone(),
            })
            .collect();
        subscriptions.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));

        let any = |wanted: fn(SubscriptionStatus) -> bool| {
            subscriptions.iter().any(|snapshot| wanted(snapshot.status))
        };
        let overall = if state.client.is_none() {
            OverallState::Disconnected
        } else if any(SubscriptionStatus::is_failure) {
            OverallState::Error
        } else if any(|status| status == SubscriptionStatus::Connecting) {
            OverallState::Connecting
        } else if any(|status| status == SubscriptionStatus::Subscribed) {
            OverallState::Connected
        } else {
            OverallState::Disconnected
        };

        ConnectionStatus {
            state: overall,
            authenticated: state.authenticated,
            last_error: state.last_error.clone(),
            subscriptions,
        }
    }

    /// Ids of every tracked subscription, including ones waiting on a retry.
    pub async fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().await.subscriptions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn subscription_status(&self, id: &str) -> Option<SubscriptionStatus> {
        self.inner
            .lock()
            .await
            .subscriptions
            .get(id)
            .map(|entry| entry.status)
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = {
            let mut state = self.inner.lock().await;
            if let Some(listener) = state.auth_listener.take() {
                listener.abort();
            }
            state.subscriptions.keys().cloned().collect()
        };
        for id in ids {
            self.remove_subscription(&id).await;
        }
        info!("realtime: connection manager shut down");
    }
}

async fn await_handshake(
    signals: &mut mpsc::UnboundedReceiver<ChannelSignal>,
    handler: &dyn ChangeHandler,
) -> Option<StatusUpdate> {
    while let Some(signal) = signals.recv().await {
        match signal {
            ChannelSignal::Status(update) if update.status == SubscriptionStatus::Connecting => {}
            ChannelSignal::Status(update) => return Some(update),
            ChannelSignal::Change(change) => handler.on_change(change).await,
        }
    }
    None
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
