use super::*;
use axum::{body, body::Body, http::Request};
use client_core::{
    backend::RowStore, http::HubClient, store::SendOptions, ws::WsRealtimeTransport, BackendClient, ChatContext,
    RealtimeSettings, Session, SessionHandle,
};
use shared::domain::MessageKind;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;

async fn test_state() -> Arc<AppState> {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let api = ApiContext {
        storage,
        tokens: TokenIssuer::new("test-secret", 300),
    };
    Arc::new(AppState::new(api, "http://hub.test".to_string(), 1024 * 1024))
}

fn bearer(state: &AppState, user: &str) -> String {
    let token = state.api.tokens.mint(&UserId::new(user)).expect("token");
    format!("Bearer {token}")
}

async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

async fn general_room(app: &Router, state: &AppState, user: &str, other: &str) -> Room {
    let request = Request::post("/rooms/general")
        .header("authorization", bearer(state, user))
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "other_user_id": other }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

#[tokio::test]
async fn healthz_requires_a_valid_token() {
    let state = test_state().await;
    let app = build_router(state.clone());

    let anonymous = Request::get("/healthz").body(Body::empty()).expect("request");
    let response = app.clone().oneshot(anonymous).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error: ApiError = json_body(response).await;
    assert_eq!(error.code, ErrorCode::Unauthorized);

    let forged = TokenIssuer::new("other", 60)
        .mint(&UserId::new("alice"))
        .expect("token");
    let request = Request::get("/healthz")
        .header("authorization", format!("Bearer {forged}"))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::get("/healthz")
        .header("authorization", bearer(&state, "alice"))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn token_route_mints_verifiable_tokens() {
    let state = test_state().await;
    let app = build_router(state.clone());
    let request = Request::post("/auth/token")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::json!({ "user_id": "alice" }).to_string()))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let minted: AccessTokenResponse = json_body(response).await;
    assert_eq!(minted.user_id, UserId::new("alice"));
    assert_eq!(
        state.api.tokens.verify(&minted.access_token).expect("verify"),
        UserId::new("alice")
    );

    let request = Request::post("/auth/token")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::json!({ "user_id": " " }).to_string()))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn messages_are_visible_to_participants_only() {
    let state = test_state().await;
    let app = build_router(state.clone());
    let room = general_room(&app, &state, "alice", "bob").await;
    let mut changes = state.events.subscribe();

    let request = Request::post(format!("/rooms/{}/messages", room.id))
        .header("authorization", bearer(&state, "alice"))
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "content": "hello bob", "kind": "text" }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let sent: ChatMessage = json_body(response).await;
    assert_eq!(sent.sender_id, UserId::new("alice"));
    assert_eq!(sent.kind, MessageKind::Text);

    let published = changes.try_recv().expect("published change");
    assert_eq!(published.room_id, room.id);
    assert_eq!(published.change.event_type, "INSERT");
    assert_eq!(published.change.row_id(), Some(sent.id.0.clone()));

    let request = Request::get(format!("/rooms/{}/messages", room.id))
        .header("authorization", bearer(&state, "bob"))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let listed: Vec<ChatMessage> = json_body(response).await;
    assert_eq!(listed.len(), 1);

    let request = Request::get(format!("/rooms/{}/messages", room.id))
        .header("authorization", bearer(&state, "mallory"))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn mark_read_publishes_updates() {
    let state = test_state().await;
    let app = build_router(state.clone());
    let room = general_room(&app, &state, "alice", "bob").await;
    state
        .api
        .storage
        .insert_message(
            &room.id,
            &UserId::new("bob"),
            &NewMessage {
                content: "ping".to_string(),
                kind: MessageKind::Text,
                attachment_url: None,
                sender_name: None,
                job_context: None,
            },
        )
        .await
        .expect("insert");
    let mut changes = state.events.subscribe();

    let request = Request::post(format!("/rooms/{}/read", room.id))
        .header("authorization", bearer(&state, "alice"))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let read: MarkReadResponse = json_body(response).await;
    assert_eq!(read.updated.len(), 1);
    assert_eq!(changes.try_recv().expect("update").change.event_type, "UPDATE");
}

#[tokio::test]
async fn objects_round_trip_through_storage_routes() {
    let state = test_state().await;
    let app = build_router(state.clone());

    let upload = Request::put("/storage/chat-images/r1/alice/1700.png")
        .header("authorization", bearer(&state, "alice"))
        .header("content-type", "image/png")
        .body(Body::from(vec![137u8, 80, 78, 71]))
        .expect("request");
    let response = app.clone().oneshot(upload).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let uploaded: UploadResponse = json_body(response).await;
    assert_eq!(
        uploaded.public_url,
        "http://hub.test/storage/chat-images/r1/alice/1700.png"
    );

    let download = Request::get("/storage/chat-images/r1/alice/1700.png")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(download).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).expect("type"),
        "image/png"
    );

    let escape = Request::put("/storage/chat-images/../secrets")
        .header("authorization", bearer(&state, "alice"))
        .body(Body::from("x"))
        .expect("request");
    let response = app.clone().oneshot(escape).await.expect("response");
    assert_ne!(response.status(), StatusCode::OK);

    let remove = Request::delete("/storage/chat-images/r1/alice/1700.png")
        .header("authorization", bearer(&state, "alice"))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(remove).await.expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let again = Request::get("/storage/chat-images/r1/alice/1700.png")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(again).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn oversized_upload_is_refused() {
    let state = test_state().await;
    let app = build_router(state.clone());
    let upload = Request::put("/storage/chat-images/big.bin")
        .header("authorization", bearer(&state, "alice"))
        .body(Body::from(vec![0u8; 2 * 1024 * 1024]))
        .expect("request");
    let response = app.oneshot(upload).await.expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

async fn spawn_hub() -> (String, Arc<AppState>) {
    let state = test_state().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = build_router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

async fn signed_in(base: &str, user: &str) -> (HubClient, Arc<SessionHandle>) {
    let anonymous = HubClient::new(base, Arc::new(SessionHandle::new())).expect("client");
    let session: Session = anonymous
        .issue_token(&UserId::new(user))
        .await
        .expect("token");
    let auth = Arc::new(SessionHandle::with_session(session));
    let hub = HubClient::new(base, auth.clone()).expect("client");
    (hub, auth)
}

#[tokio::test]
async fn live_messages_reach_a_subscribed_client() {
    let (base, _state) = spawn_hub().await;
    let (alice_hub, alice_auth) = signed_in(&base, "alice").await;
    let (bob_hub, _) = signed_in(&base, "bob").await;

    let realtime = Arc::new(WsRealtimeTransport::new(
        alice_hub.realtime_url().expect("realtime url"),
    ));
    let rows = Arc::new(alice_hub);
    let context = ChatContext::new(RealtimeSettings::default());
    context
        .init(BackendClient::new(realtime, rows.clone(), alice_auth, rows))
        .await
        .expect("init");
    let probe = context
        .connections()
        .test_connection()
        .await
        .expect("connection test");
    assert!(probe.api && probe.realtime);

    let store = context.store();
    let room = store
        .get_or_create_general_room(&UserId::new("bob"))
        .await
        .expect("room");
    store.subscribe_room(&room.id).await.expect("subscribe");

    let sent = bob_hub
        .insert_message(
            &room.id,
            NewMessage {
                content: "are you there?".to_string(),
                kind: MessageKind::Text,
                attachment_url: None,
                sender_name: Some("Bob".to_string()),
                job_context: None,
            },
        )
        .await
        .expect("bob sends");

    let mut delivered = false;
    for _ in 0..100 {
        if store.messages(&room.id).iter().any(|message| message.id == sent.id) {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(delivered, "bob's message never arrived");
    assert_eq!(store.unread_count(&room.id), 1);

    let own = store
        .send_text(&room.id, "yes", SendOptions::default())
        .await
        .expect("alice replies");
    assert_eq!(own.sender_id, UserId::new("alice"));
    assert_eq!(store.mark_read(&room.id).await.expect("read"), 1);
    assert_eq!(store.unread_count(&room.id), 0);

    context.dispose().await;
}
