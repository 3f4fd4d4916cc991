use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::SubscriptionStatus,
    protocol::{JoinStatus, RealtimeClientFrame, RealtimeServerFrame},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::{
    ChannelRequest, ChannelSignal, RealtimeChannel, RealtimeTransport, StatusUpdate,
};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

struct Topic {
    join_ref: u64,
    signals: mpsc::UnboundedSender<ChannelSignal>,
}

#[derive(Default)]
struct SocketState {
    access_token: Option<String>,
    outbound: Option<mpsc::UnboundedSender<RealtimeClientFrame>>,
    topics: HashMap<String, Topic>,
    next_join_ref: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketState {
    fn send(&self, frame: RealtimeClientFrame) -> bool {
        self.outbound
            .as_ref()
            .is_some_and(|outbound| outbound.send(frame).is_ok())
    }

    fn is_connected(&self) -> bool {
        self.outbound
            .as_ref()
            .is_some_and(|outbound| !outbound.is_closed())
    }
}

struct Socket {
    url: Url,
    heartbeat: Duration,
    state: Mutex<SocketState>,
}

/// Realtime transport over one multiplexed websocket. Each channel is a
/// topic joined on the shared socket; the socket is dialled lazily on the
/// first subscribe and again after it drops.
pub struct WsRealtimeTransport {
    socket: Arc<Socket>,
}

impl WsRealtimeTransport {
    pub fn new(url: Url) -> Self {
        Self::with_heartbeat(url, HEARTBEAT_INTERVAL)
    }

    pub fn with_heartbeat(url: Url, heartbeat: Duration) -> Self {
        Self {
            socket: Arc::new(Socket {
                url,
                heartbeat,
                state: Mutex::new(SocketState::default()),
            }),
        }
    }

    pub async fn disconnect(&self) {
        let mut state = self.socket.state.lock().await;
        state.outbound = None;
        for task in state.tasks.drain(..) {
            task.abort();
        }
        state.topics.clear();
        info!(url = %self.socket.url, "realtime: socket closed");
    }
}

impl Socket {
    async fn ensure_connected(self: &Arc<Self>, state: &mut SocketState) -> Result<()> {
        if state.is_connected() {
            return Ok(());
        }
        for task in state.tasks.drain(..) {
            task.abort();
        }

        let (stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.url))?;
        let (mut writer, mut reader) = stream.split();
        let (outbound, mut frames) = mpsc::unbounded_channel::<RealtimeClientFrame>();

        let period = self.heartbeat;
        let writer_task = tokio::spawn(async move {
            let mut heartbeat = interval_at(Instant::now() + period, period);
            loop {
                let frame = tokio::select! {
                    frame = frames.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = heartbeat.tick() => RealtimeClientFrame::Heartbeat,
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("realtime: dropping unencodable frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = writer.send(Message::Text(text)).await {
                    warn!("realtime: websocket send failed: {err}");
                    break;
                }
            }
            let _ = writer.close().await;
        });

        let socket = Arc::downgrade(self);
        let reader_task = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!("realtime: websocket receive failed: {err}");
                        break;
                    }
                };
                let frame = match serde_json::from_str::<RealtimeServerFrame>(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("realtime: invalid server frame: {err}");
                        continue;
                    }
                };
                let Some(socket) = socket.upgrade() else {
                    return;
                };
                socket.dispatch(frame).await;
            }
            if let Some(socket) = socket.upgrade() {
                socket.connection_lost().await;
            }
        });

        if let Some(token) = state.access_token.clone() {
            let _ = outbound.send(RealtimeClientFrame::AccessToken {
                access_token: token,
            });
        }
        state.outbound = Some(outbound);
        state.tasks = vec![writer_task, reader_task];
        info!(url = %self.url, "realtime: socket connected");
        Ok(())
    }

    async fn dispatch(&self, frame: RealtimeServerFrame) {
        let mut state = self.state.lock().await;
        match frame {
            RealtimeServerFrame::JoinReply {
                topic,
                join_ref,
                status,
                reason,
            } => {
                let Some(entry) = state.topics.get(&topic) else {
                    return;
                };
                if entry.join_ref != join_ref {
                    debug!(topic = %topic, join_ref, "realtime: reply for an older join");
                    return;
                }
                let update = match status {
                    JoinStatus::Ok => StatusUpdate::new(SubscriptionStatus::Subscribed),
                    JoinStatus::Error => StatusUpdate::failed(
                        SubscriptionStatus::ChannelError,
                        reason.unwrap_or_else(|| "join refused".to_string()),
                    ),
                };
                let _ = entry.signals.send(ChannelSignal::Status(update));
            }
            RealtimeServerFrame::Change { topic, change } => {
                if let Some(entry) = state.topics.get(&topic) {
                    let _ = entry.signals.send(ChannelSignal::Change(change));
                }
            }
            RealtimeServerFrame::Closed { topic, reason } => {
                if let Some(entry) = state.topics.remove(&topic) {
                    info!(topic = %topic, reason = reason.as_deref().unwrap_or(""), "realtime: topic closed by server");
                    let _ = entry
                        .signals
                        .send(ChannelSignal::Status(StatusUpdate::new(SubscriptionStatus::Closed)));
                }
            }
            RealtimeServerFrame::HeartbeatAck => debug!("realtime: heartbeat acknowledged"),
        }
    }

    async fn connection_lost(&self) {
        let mut state = self.state.lock().await;
        state.outbound = None;
        let topics: Vec<(String, Topic)> = state.topics.drain().collect();
        warn!(topics = topics.len(), "realtime: socket dropped");
        for (_, entry) in topics {
            let _ = entry.signals.send(ChannelSignal::Status(StatusUpdate::failed(
                SubscriptionStatus::ChannelError,
                "realtime socket closed",
            )));
        }
    }
}

#[async_trait]
impl RealtimeTransport for WsRealtimeTransport {
    async fn set_auth(&self, access_token: Option<String>) -> Result<()> {
        let mut state = self.socket.state.lock().await;
        state.access_token = access_token.clone();
        if let Some(token) = access_token {
            state.send(RealtimeClientFrame::AccessToken {
                access_token: token,
            });
        }
        Ok(())
    }

    async fn open_channel(&self, request: ChannelRequest) -> Result<Arc<dyn RealtimeChannel>> {
        if request.name.trim().is_empty() {
            return Err(anyhow!("channel name is empty"));
        }
        Ok(Arc::new(WsChannel {
            request,
            socket: Arc::clone(&self.socket),
            join_ref: StdMutex::new(None),
        }))
    }
}

pub struct WsChannel {
    request: ChannelRequest,
    socket: Arc<Socket>,
    join_ref: StdMutex<Option<u64>>,
}

#[async_trait]
impl RealtimeChannel for WsChannel {
    fn name(&self) -> &str {
        &self.request.name
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ChannelSignal>> {
        let mut state = self.socket.state.lock().await;
        self.socket.ensure_connected(&mut state).await?;

        state.next_join_ref += 1;
        let join_ref = state.next_join_ref;
        let (signals, receiver) = mpsc::unbounded_channel();
        let _ = signals.send(ChannelSignal::Status(StatusUpdate::new(
            SubscriptionStatus::Connecting,
        )));
        let topic = self.request.name.clone();
        state.topics.insert(topic.clone(), Topic { join_ref, signals });

        let frame = RealtimeClientFrame::Join {
            topic: topic.clone(),
            join_ref,
            access_token: state.access_token.clone(),
            filter: self.request.filter.clone(),
            private: self.request.options.private,
        };
        if !state.send(frame) {
            state.topics.remove(&topic);
            return Err(anyhow!("realtime socket closed before joining {topic}"));
        }
        *self
            .join_ref
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(join_ref);
        debug!(topic = %topic, join_ref, "realtime: join sent");
        Ok(receiver)
    }

    async fn unsubscribe(&self) -> Result<()> {
        let join_ref = self
            .join_ref
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(join_ref) = join_ref else {
            return Ok(());
        };
        let mut state = self.socket.state.lock().await;
        let topic = &self.request.name;
        let owned = state
            .topics
            .get(topic)
            .is_some_and(|entry| entry.join_ref == join_ref);
        if owned {
            state.topics.remove(topic);
            state.send(RealtimeClientFrame::Leave {
                topic: topic.clone(),
            });
            debug!(topic = %topic, "realtime: left topic");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
