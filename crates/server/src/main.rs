use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    async_trait,
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use shared::{
    domain::{ProposalId, RoomId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AccessTokenRequest, AccessTokenResponse, ChatMessage, GeneralRoomRequest,
        MarkReadResponse, NewMessage, NewProposal, Proposal, ProposalResponseRequest,
        ProposalWithMessage, RawChange, Room, UploadResponse,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod auth;
mod config;
mod realtime;

use api::ApiContext;
use app_state::AppState;
use auth::{bearer_token, TokenIssuer};
use crate::config::{load_settings, normalize_database_url};
use realtime::{ws_handler, RoomChange};

type HttpError = (StatusCode, Json<ApiError>);

const MAX_OBJECT_PATH_BYTES: usize = 512;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings()?;
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "hub: failed to open SQLite database; verify the path and permissions"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        tokens: TokenIssuer::new(settings.jwt_secret.clone(), settings.token_ttl_seconds),
    };
    let state = AppState::new(api, settings.public_base(), settings.max_upload_bytes);
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", settings.bind_addr))?;
    info!(%addr, "hub: listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/token", post(issue_token))
        .route("/rooms", get(http_list_rooms))
        .route("/rooms/general", post(http_general_room))
        .route(
            "/rooms/:room_id/messages",
            get(http_list_messages).post(http_send_message),
        )
        .route("/rooms/:room_id/read", post(http_mark_read))
        .route(
            "/rooms/:room_id/proposals",
            get(http_list_proposals).post(http_create_proposal),
        )
        .route("/proposals/:proposal_id", get(http_get_proposal))
        .route("/proposals/:proposal_id/respond", post(http_respond_proposal))
        .route(
            "/storage/:bucket/*path",
            put(put_object).delete(delete_object).get(get_object),
        )
        .route("/realtime", get(ws_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

fn internal(err: anyhow::Error) -> HttpError {
    reject(ApiError::new(ErrorCode::Internal, format!("{err:#}")))
}

/// Caller identity taken from the bearer token.
struct AuthUser(UserId);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = HttpError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
            .ok_or_else(|| {
                reject(ApiError::new(ErrorCode::Unauthorized, "missing bearer token"))
            })?;
        state.api.tokens.verify(token).map(AuthUser).map_err(reject)
    }
}

async fn healthz(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(internal)?;
    Ok("ok")
}

/// Dev sign-in: any non-blank user id gets a token.
async fn issue_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AccessTokenRequest>,
) -> Result<Json<AccessTokenResponse>, HttpError> {
    if req.user_id.is_blank() {
        return Err(reject(ApiError::new(
            ErrorCode::Validation,
            "user_id is required",
        )));
    }
    let access_token = state.api.tokens.mint(&req.user_id).map_err(|e| {
        reject(ApiError::new(
            ErrorCode::Internal,
            format!("token mint failed: {e}"),
        ))
    })?;
    info!(user_id = %req.user_id, "auth: token issued");
    Ok(Json(AccessTokenResponse {
        user_id: req.user_id,
        access_token,
    }))
}

async fn http_list_rooms(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<Room>>, HttpError> {
    let rooms = api::list_rooms(&state.api, &user_id).await.map_err(reject)?;
    Ok(Json(rooms))
}

async fn http_general_room(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<GeneralRoomRequest>,
) -> Result<Json<Room>, HttpError> {
    let room = api::general_room(&state.api, &user_id, &req.other_user_id)
        .await
        .map_err(reject)?;
    Ok(Json(room))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, HttpError> {
    let messages = api::list_messages(&state.api, &user_id, &RoomId::new(room_id))
        .await
        .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(room_id): Path<String>,
    Json(req): Json<NewMessage>,
) -> Result<Json<ChatMessage>, HttpError> {
    let room_id = RoomId::new(room_id);
    let message = api::send_message(&state.api, &user_id, &room_id, &req)
        .await
        .map_err(reject)?;
    state.publish(RoomChange::new(room_id, RawChange::insert(&message)));
    Ok(Json(message))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(room_id): Path<String>,
) -> Result<Json<MarkReadResponse>, HttpError> {
    let room_id = RoomId::new(room_id);
    let updated = api::mark_read(&state.api, &user_id, &room_id)
        .await
        .map_err(reject)?;
    for message in &updated {
        state.publish(RoomChange::new(room_id.clone(), RawChange::update(message)));
    }
    Ok(Json(MarkReadResponse { updated }))
}

async fn http_list_proposals(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<Proposal>>, HttpError> {
    let proposals = api::list_proposals(&state.api, &user_id, &RoomId::new(room_id))
        .await
        .map_err(reject)?;
    Ok(Json(proposals))
}

async fn http_create_proposal(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(room_id): Path<String>,
    Json(req): Json<NewProposal>,
) -> Result<Json<ProposalWithMessage>, HttpError> {
    let room_id = RoomId::new(room_id);
    let created = api::create_proposal(&state.api, &user_id, &room_id, &req)
        .await
        .map_err(reject)?;
    state.publish(RoomChange::new(room_id, RawChange::insert(&created.message)));
    Ok(Json(created))
}

async fn http_get_proposal(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(proposal_id): Path<String>,
) -> Result<Json<Proposal>, HttpError> {
    let proposal = api::proposal(&state.api, &user_id, &ProposalId::new(proposal_id))
        .await
        .map_err(reject)?;
    Ok(Json(proposal))
}

async fn http_respond_proposal(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(proposal_id): Path<String>,
    Json(req): Json<ProposalResponseRequest>,
) -> Result<Json<Proposal>, HttpError> {
    let proposal = api::respond_to_proposal(
        &state.api,
        &user_id,
        &ProposalId::new(proposal_id),
        req.status,
    )
    .await
    .map_err(reject)?;
    Ok(Json(proposal))
}

fn validate_object_path(bucket: &str, path: &str) -> Result<(), HttpError> {
    let bad = bucket.trim().is_empty()
        || bucket.contains('/')
        || path.trim().is_empty()
        || path.len() > MAX_OBJECT_PATH_BYTES
        || path.contains('\\')
        || path.split('/').any(|segment| segment.is_empty() || segment == "..");
    if bad {
        return Err(reject(ApiError::new(
            ErrorCode::Validation,
            "invalid object path",
        )));
    }
    Ok(())
}

async fn put_object(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path((bucket, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadResponse>, HttpError> {
    validate_object_path(&bucket, &path)?;
    if body.is_empty() {
        return Err(reject(ApiError::new(
            ErrorCode::Validation,
            "object body cannot be empty",
        )));
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .unwrap_or("application/octet-stream");

    state
        .api
        .storage
        .put_object(&bucket, &path, content_type, &body)
        .await
        .map_err(internal)?;
    info!(user_id = %user_id, bucket = %bucket, path = %path, size = body.len(), "hub: object stored");
    Ok(Json(UploadResponse {
        public_url: format!("{}/storage/{bucket}/{path}", state.public_base),
    }))
}

async fn delete_object(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
    Path((bucket, path)): Path<(String, String)>,
) -> Result<StatusCode, HttpError> {
    validate_object_path(&bucket, &path)?;
    let removed = state
        .api
        .storage
        .delete_object(&bucket, &path)
        .await
        .map_err(internal)?;
    if !removed {
        return Err(reject(ApiError::new(ErrorCode::NotFound, "object not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Public read, like a storage bucket's public URL.
async fn get_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, path)): Path<(String, String)>,
) -> Result<impl IntoResponse, HttpError> {
    validate_object_path(&bucket, &path)?;
    let object = state
        .api
        .storage
        .get_object(&bucket, &path)
        .await
        .map_err(internal)?
        .ok_or_else(|| reject(ApiError::new(ErrorCode::NotFound, "object not found")))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&object.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    Ok((StatusCode::OK, headers, object.bytes))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
