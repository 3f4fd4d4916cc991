use super::*;
use crate::{auth::SessionHandle, test_support::text_message};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode as HttpStatus},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use std::sync::Mutex as StdMutex;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct HubState {
    tokens: Arc<StdMutex<Vec<String>>>,
    uploads: Arc<StdMutex<Vec<(String, String, usize)>>>,
    posted: Arc<StdMutex<Vec<NewMessage>>>,
}

impl HubState {
    fn record(&self, headers: &HeaderMap) -> Result<(), (HttpStatus, Json<ApiError>)> {
        let token = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| {
                (
                    HttpStatus::UNAUTHORIZED,
                    Json(ApiError::new(ErrorCode::Unauthorized, "missing bearer token")),
                )
            })?;
        self.tokens.lock().expect("tokens").push(token.to_string());
        Ok(())
    }
}

async fn spawn_hub() -> anyhow::Result<(String, HubState)> {
    let state = HubState::default();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let app = Router::new()
        .route(
            "/auth/token",
            post(|Json(request): Json<AccessTokenRequest>| async move {
                Json(AccessTokenResponse {
                    access_token: format!("minted-{}", request.user_id),
                    user_id: request.user_id,
                })
            }),
        )
        .route(
            "/healthz",
            get(|State(state): State<HubState>, headers: HeaderMap| async move {
                state.record(&headers).map(|_| "ok")
            }),
        )
        .route(
            "/rooms/:room_id/messages",
            post(
                |State(state): State<HubState>,
                 Path(room_id): Path<String>,
                 headers: HeaderMap,
                 Json(message): Json<NewMessage>| async move {
                    state.record(&headers)?;
                    state.posted.lock().expect("posted").push(message.clone());
                    let mut row = text_message("m-new", &room_id, "alice", &message.content);
                    row.created_at = Utc::now();
                    Ok::<_, (HttpStatus, Json<ApiError>)>(Json(row))
                },
            )
            .get(|Path(room_id): Path<String>| async move {
                Json(vec![
                    text_message("m1", &room_id, "bob", "first"),
                    text_message("m2", &room_id, "alice", "second"),
                ])
            }),
        )
        .route(
            "/proposals/:proposal_id",
            get(|Path(_proposal_id): Path<String>| async move {
                (
                    HttpStatus::NOT_FOUND,
                    Json(ApiError::new(ErrorCode::NotFound, "no such proposal")),
                )
            }),
        )
        .route(
            "/rooms/general",
            post(|| async {
                (
                    HttpStatus::FORBIDDEN,
                    Json(ApiError::new(ErrorCode::Forbidden, "not a participant")),
                )
            }),
        )
        .route(
            "/storage/:bucket/*path",
            put(
                |State(state): State<HubState>,
                 Path((bucket, path)): Path<(String, String)>,
                 headers: HeaderMap,
                 body: Bytes| async move {
                    let content_type = headers
                        .get("content-type")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    state
                        .uploads
                        .lock()
                        .expect("uploads")
                        .push((format!("{bucket}/{path}"), content_type, body.len()));
                    Json(UploadResponse {
                        public_url: format!("http://cdn.local/{bucket}/{path}"),
                    })
                },
            ),
        )
        .with_state(state.clone());

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

fn client(base: &str) -> HubClient {
    let auth = Arc::new(SessionHandle::with_session(Session {
        user_id: UserId::new("alice"),
        access_token: "token-a".to_string(),
    }));
    HubClient::new(base, auth).expect("client")
}

#[test]
fn realtime_url_switches_scheme() {
    let auth: Arc<dyn AuthSession> = Arc::new(SessionHandle::new());
    let hub = HubClient::new("http://localhost:8443", auth.clone()).expect("client");
    assert_eq!(hub.realtime_url().expect("url").as_str(), "ws://localhost:8443/realtime");

    let hub = HubClient::new("https://chat.example.com/api", auth.clone()).expect("client");
    assert_eq!(
        hub.realtime_url().expect("url").as_str(),
        "wss://chat.example.com/api/realtime"
    );

    assert!(HubClient::new("ftp://chat.example.com", auth).is_err());
}

#[tokio::test]
async fn issue_token_returns_a_session() {
    let (base, _) = spawn_hub().await.expect("spawn hub");
    let hub = HubClient::new(&base, Arc::new(SessionHandle::new())).expect("client");
    let session = hub.issue_token(&UserId::new("bob")).await.expect("token");
    assert_eq!(session.user_id, UserId::new("bob"));
    assert_eq!(session.access_token, "minted-bob");
}

#[tokio::test]
async fn requests_carry_the_bearer_token() {
    let (base, state) = spawn_hub().await.expect("spawn hub");
    let hub = client(&base);

    hub.ping().await.expect("ping");
    let sent = hub
        .insert_message(
            &RoomId::new("r1"),
            NewMessage {
                content: "hello".to_string(),
                kind: Default::default(),
                attachment_url: None,
                sender_name: Some("Alice".to_string()),
                job_context: None,
            },
        )
        .await
        .expect("insert");

    assert_eq!(sent.room_id, RoomId::new("r1"));
    assert_eq!(sent.content, "hello");
    assert_eq!(
        state.tokens.lock().expect("tokens").as_slice(),
        ["token-a", "token-a"]
    );
    assert_eq!(
        state.posted.lock().expect("posted")[0].sender_name.as_deref(),
        Some("Alice")
    );
}

#[tokio::test]
async fn signed_out_client_refuses_to_call() {
    let (base, state) = spawn_hub().await.expect("spawn hub");
    let hub = HubClient::new(&base, Arc::new(SessionHandle::new())).expect("client");
    let err = hub.ping().await.expect_err("no session");
    assert!(err.to_string().contains("not signed in"));
    assert!(state.tokens.lock().expect("tokens").is_empty());
}

#[tokio::test]
async fn list_messages_decodes_rows() {
    let (base, _) = spawn_hub().await.expect("spawn hub");
    let messages = client(&base)
        .list_messages(&RoomId::new("r7"))
        .await
        .expect("messages");
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|message| message.room_id == RoomId::new("r7")));
}

#[tokio::test]
async fn missing_proposal_is_none() {
    let (base, _) = spawn_hub().await.expect("spawn hub");
    let proposal = client(&base)
        .fetch_proposal(&ProposalId::new("p404"))
        .await
        .expect("fetch");
    assert!(proposal.is_none());
}

#[tokio::test]
async fn error_bodies_become_api_exceptions() {
    let (base, _) = spawn_hub().await.expect("spawn hub");
    let err = client(&base)
        .get_or_create_general_room(&UserId::new("bob"))
        .await
        .expect_err("forbidden");
    let api = err.downcast_ref::<ApiException>().expect("api exception");
    assert_eq!(api.code, ErrorCode::Forbidden);
    assert_eq!(api.message, "not a participant");
}

#[tokio::test]
async fn upload_sends_bytes_with_content_type() {
    let (base, state) = spawn_hub().await.expect("spawn hub");
    let url = client(&base)
        .upload("chat-images", "r1/alice/1700.png", "image/png", vec![1, 2, 3])
        .await
        .expect("upload");

    assert_eq!(url, "http://cdn.local/chat-images/r1/alice/1700.png");
    assert_eq!(
        state.uploads.lock().expect("uploads").as_slice(),
        [(
            "chat-images/r1/alice/1700.png".to_string(),
            "image/png".to_string(),
            3
        )]
    );
}
