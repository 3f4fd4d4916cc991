use super::*;
use crate::{backend::ChannelOptions, test_support::text_message};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    routing::get,
    Router,
};
use shared::protocol::{ChangeFilter, RawChange};
use shared::domain::RoomId;
use tokio::{net::TcpListener, time::timeout};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    AcceptAndPush,
    Refuse,
    DropAfterJoin,
}

#[derive(Clone)]
struct ServerState {
    behaviour: Behaviour,
    frames: Arc<StdMutex<Vec<RealtimeClientFrame>>>,
}

async fn reply(socket: &mut WebSocket, frame: &RealtimeServerFrame) -> bool {
    let text = serde_json::to_string(frame).expect("encode");
    socket.send(WsMessage::Text(text)).await.is_ok()
}

async fn serve(mut socket: WebSocket, state: ServerState) {
    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let frame: RealtimeClientFrame = serde_json::from_str(&text).expect("client frame");
        state.frames.lock().expect("frames").push(frame.clone());
        let RealtimeClientFrame::Join { topic, join_ref, .. } = frame else {
            continue;
        };
        match state.behaviour {
            Behaviour::Refuse => {
                reply(
                    &mut socket,
                    &RealtimeServerFrame::JoinReply {
                        topic,
                        join_ref,
                        status: JoinStatus::Error,
                        reason: Some("not a participant".to_string()),
                    },
                )
                .await;
            }
            Behaviour::AcceptAndPush => {
                reply(
                    &mut socket,
                    &RealtimeServerFrame::JoinReply {
                        topic: topic.clone(),
                        join_ref,
                        status: JoinStatus::Ok,
                        reason: None,
                    },
                )
                .await;
                reply(
                    &mut socket,
                    &RealtimeServerFrame::Change {
                        topic,
                        change: RawChange::insert(&text_message("m1", "r1", "bob", "hello")),
                    },
                )
                .await;
            }
            Behaviour::DropAfterJoin => {
                reply(
                    &mut socket,
                    &RealtimeServerFrame::JoinReply {
                        topic,
                        join_ref,
                        status: JoinStatus::Ok,
                        reason: None,
                    },
                )
                .await;
                return;
            }
        }
    }
}

async fn spawn_realtime(behaviour: Behaviour) -> (Url, Arc<StdMutex<Vec<RealtimeClientFrame>>>) {
    let state = ServerState {
        behaviour,
        frames: Arc::new(StdMutex::new(Vec::new())),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route(
            "/realtime",
            get(
                |ws: WebSocketUpgrade, State(state): State<ServerState>| async move {
                    ws.on_upgrade(move |socket| serve(socket, state))
                },
            ),
        )
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let url = Url::parse(&format!("ws://{addr}/realtime")).expect("url");
    (url, state.frames)
}

fn request(name: &str) -> ChannelRequest {
    ChannelRequest {
        name: name.to_string(),
        options: ChannelOptions {
            private: true,
            broadcast_self: false,
        },
        filter: Some(ChangeFilter::messages_in(RoomId::new("r1"))),
    }
}

async fn next(signals: &mut mpsc::UnboundedReceiver<ChannelSignal>) -> ChannelSignal {
    timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("signal in time")
        .expect("stream open")
}

fn status(signal: ChannelSignal) -> StatusUpdate {
    match signal {
        ChannelSignal::Status(update) => update,
        other => panic!("expected a status, got {other:?}"),
    }
}

#[tokio::test]
async fn join_is_acknowledged_and_changes_flow() {
    let (url, frames) = spawn_realtime(Behaviour::AcceptAndPush).await;
    let transport = WsRealtimeTransport::new(url);
    transport
        .set_auth(Some("token-1".to_string()))
        .await
        .expect("auth");

    let channel = transport
        .open_channel(request("room:r1:messages"))
        .await
        .expect("open");
    let mut signals = channel.subscribe().await.expect("subscribe");

    assert_eq!(status(next(&mut signals).await).status, SubscriptionStatus::Connecting);
    assert_eq!(status(next(&mut signals).await).status, SubscriptionStatus::Subscribed);
    match next(&mut signals).await {
        ChannelSignal::Change(change) => assert_eq!(change.row_id().as_deref(), Some("m1")),
        other => panic!("expected a change, got {other:?}"),
    }

    let frames = frames.lock().expect("frames").clone();
    assert!(matches!(
        &frames[0],
        RealtimeClientFrame::AccessToken { access_token } if access_token == "token-1"
    ));
    assert!(matches!(
        &frames[1],
        RealtimeClientFrame::Join { topic, access_token: Some(token), private: true, filter: Some(_), .. }
            if topic == "room:r1:messages" && token == "token-1"
    ));
}

#[tokio::test]
async fn refused_join_reports_channel_error() {
    let (url, _) = spawn_realtime(Behaviour::Refuse).await;
    let transport = WsRealtimeTransport::new(url);
    let channel = transport
        .open_channel(request("room:r1:messages"))
        .await
        .expect("open");
    let mut signals = channel.subscribe().await.expect("subscribe");

    next(&mut signals).await;
    let update = status(next(&mut signals).await);
    assert_eq!(update.status, SubscriptionStatus::ChannelError);
    assert_eq!(update.error.as_deref(), Some("not a participant"));
}

#[tokio::test]
async fn dropped_socket_fails_every_topic() {
    let (url, _) = spawn_realtime(Behaviour::DropAfterJoin).await;
    let transport = WsRealtimeTransport::new(url);
    let channel = transport
        .open_channel(request("room:r1:messages"))
        .await
        .expect("open");
    let mut signals = channel.subscribe().await.expect("subscribe");

    next(&mut signals).await;
    assert_eq!(status(next(&mut signals).await).status, SubscriptionStatus::Subscribed);
    let update = status(next(&mut signals).await);
    assert_eq!(update.status, SubscriptionStatus::ChannelError);
    assert_eq!(update.error.as_deref(), Some("realtime socket closed"));
}

#[tokio::test]
async fn unsubscribe_leaves_the_topic_once() {
    let (url, frames) = spawn_realtime(Behaviour::AcceptAndPush).await;
    let transport = WsRealtimeTransport::new(url);
    let channel = transport
        .open_channel(request("room:r1:messages"))
        .await
        .expect("open");
    let mut signals = channel.subscribe().await.expect("subscribe");
    next(&mut signals).await;
    next(&mut signals).await;

    channel.unsubscribe().await.expect("leave");
    channel.unsubscribe().await.expect("second leave is a no-op");
    // the topic's sender is dropped, so the stream ends after anything buffered
    while let Some(signal) = timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("stream ends")
    {
        assert!(matches!(signal, ChannelSignal::Change(_)));
    }

    let mut leaves = 0;
    for _ in 0..50 {
        leaves = frames
            .lock()
            .expect("frames")
            .iter()
            .filter(|frame| matches!(frame, RealtimeClientFrame::Leave { .. }))
            .count();
        if leaves > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(leaves, 1);
}

#[tokio::test]
async fn unreachable_hub_fails_subscribe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let transport = WsRealtimeTransport::new(
        Url::parse(&format!("ws://{addr}/realtime")).expect("url"),
    );
    let channel = transport
        .open_channel(request("room:r1:messages"))
        .await
        .expect("open");
    assert!(channel.subscribe().await.is_err());
}

#[tokio::test]
async fn blank_channel_name_is_rejected() {
    let transport = WsRealtimeTransport::new(Url::parse("ws://127.0.0.1:9/realtime").expect("url"));
    assert!(transport.open_channel(request("  ")).await.is_err());
}
