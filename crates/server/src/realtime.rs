use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{
    domain::RoomId,
    protocol::{
        ChangeFilter, JoinStatus, RawChange, RealtimeClientFrame, RealtimeServerFrame,
        MESSAGES_TABLE,
    },
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{
    api::{ensure_participant, ApiContext},
    app_state::AppState,
};

/// Topic that always joins; clients use it to probe the socket.
pub const HEALTH_CHECK_TOPIC: &str = "health-check";

/// A row change on `messages`, fanned out to every socket joined to the room.
#[derive(Debug, Clone)]
pub struct RoomChange {
    pub room_id: RoomId,
    pub change: RawChange,
}

impl RoomChange {
    pub fn new(room_id: RoomId, change: RawChange) -> Self {
        Self { room_id, change }
    }
}

/// Per-socket join state.
#[derive(Default)]
pub(crate) struct Connection {
    access_token: Option<String>,
    topics: HashMap<String, RoomId>,
}

impl Connection {
    pub(crate) async fn handle(
        &mut self,
        ctx: &ApiContext,
        frame: RealtimeClientFrame,
    ) -> Option<RealtimeServerFrame> {
        match frame {
            RealtimeClientFrame::Join {
                topic,
                join_ref,
                access_token,
                filter,
                ..
            } => {
                if let Some(token) = access_token {
                    self.access_token = Some(token);
                }
                let outcome = if topic == HEALTH_CHECK_TOPIC {
                    Ok(None)
                } else {
                    self.authorize(ctx, filter).await.map(Some)
                };
                let reply = match outcome {
                    Ok(room_id) => {
                        if let Some(room_id) = room_id {
                            debug!(topic = %topic, room_id = %room_id, "hub: topic joined");
                            self.topics.insert(topic.clone(), room_id);
                        }
                        RealtimeServerFrame::JoinReply {
                            topic,
                            join_ref,
                            status: JoinStatus::Ok,
                            reason: None,
                        }
                    }
                    Err(reason) => {
                        info!(topic = %topic, %reason, "hub: join refused");
                        RealtimeServerFrame::JoinReply {
                            topic,
                            join_ref,
                            status: JoinStatus::Error,
                            reason: Some(reason),
                        }
                    }
                };
                Some(reply)
            }
            RealtimeClientFrame::Leave { topic } => {
                self.topics.remove(&topic);
                None
            }
            RealtimeClientFrame::AccessToken { access_token } => {
                self.access_token = Some(access_token);
                None
            }
            RealtimeClientFrame::Heartbeat => Some(RealtimeServerFrame::HeartbeatAck),
        }
    }

    async fn authorize(
        &self,
        ctx: &ApiContext,
        filter: Option<ChangeFilter>,
    ) -> Result<RoomId, String> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| "missing access token".to_string())?;
        let user_id = ctx.tokens.verify(token).map_err(|e| e.message)?;
        let filter = filter
            .filter(|filter| filter.table == MESSAGES_TABLE)
            .ok_or_else(|| format!("join needs a {MESSAGES_TABLE} filter"))?;
        ensure_participant(ctx, &filter.room_id, &user_id)
            .await
            .map_err(|e| e.message)?;
        Ok(filter.room_id)
    }

    pub(crate) fn topics_for<'a>(&'a self, room_id: &'a RoomId) -> impl Iterator<Item = &'a str> {
        self.topics
            .iter()
            .filter(move |(_, joined)| *joined == room_id)
            .map(|(topic, _)| topic.as_str())
    }
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &RealtimeServerFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    sender.send(Message::Text(text)).await
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut changes = state.events.subscribe();
    let mut connection = Connection::default();

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!("hub: socket receive failed: {err}");
                        break;
                    }
                };
                let frame = match serde_json::from_str::<RealtimeClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("hub: ignoring invalid client frame: {err}");
                        continue;
                    }
                };
                if let Some(reply) = connection.handle(&state.api, frame).await {
                    if send(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
            }
            change = changes.recv() => {
                let change = match change {
                    Ok(change) => change,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "hub: socket fell behind the change feed");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let frames: Vec<RealtimeServerFrame> = connection
                    .topics_for(&change.room_id)
                    .map(|topic| RealtimeServerFrame::Change {
                        topic: topic.to_string(),
                        change: change.change.clone(),
                    })
                    .collect();
                for frame in &frames {
                    if send(&mut sender, frame).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    debug!(topics = connection.topics.len(), "hub: socket closed");
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
