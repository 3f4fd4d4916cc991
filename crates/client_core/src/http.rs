use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ProposalId, ProposalStatus, RoomId, UserId},
    error::{ApiError, ApiException, ErrorCode},
    protocol::{
        AccessTokenRequest, AccessTokenResponse, ChatMessage, GeneralRoomRequest,
        MarkReadResponse, NewMessage, NewProposal, Proposal, ProposalResponseRequest,
        ProposalWithMessage, Room, UploadResponse,
    },
};
use tracing::debug;
use url::Url;

use crate::{
    auth::{AuthSession, Session},
    backend::{ObjectStorage, RowStore},
};

/// REST client for the dev hub. Every call carries the current session's
/// bearer token.
#[derive(Clone)]
pub struct HubClient {
    http: Client,
    base: Url,
    auth: Arc<dyn AuthSession>,
}

impl HubClient {
    pub fn new(base_url: &str, auth: Arc<dyn AuthSession>) -> Result<Self> {
        let mut base =
            Url::parse(base_url).with_context(|| format!("invalid hub url: {base_url}"))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(anyhow!("hub url must start with http:// or https://"));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base,
            auth,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Websocket endpoint of the hub's realtime service.
    pub fn realtime_url(&self) -> Result<Url> {
        let mut url = self.endpoint("realtime")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket url from {}", self.base))?;
        Ok(url)
    }

    /// Dev sign-in: asks the hub to mint an access token for `user_id`.
    pub async fn issue_token(&self, user_id: &UserId) -> Result<Session> {
        let response = self
            .http
            .post(self.endpoint("auth/token")?)
            .json(&AccessTokenRequest {
                user_id: user_id.clone(),
            })
            .send()
            .await
            .context("token request failed")?;
        let body: AccessTokenResponse = checked(response).await?.json().await?;
        Ok(Session {
            user_id: body.user_id,
            access_token: body.access_token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("invalid hub path: {path}"))
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let session = self
            .auth
            .current_session()
            .await
            .ok_or_else(|| anyhow!("not signed in"))?;
        debug!(%method, path, "http: hub request");
        Ok(self
            .http
            .request(method, self.endpoint(path)?)
            .bearer_auth(session.access_token))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.request(Method::GET, path).await?.send().await?;
        Ok(checked(response).await?.json().await?)
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .request(Method::POST, path)
            .await?
            .json(body)
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }
}

/// Turns an error status into an `ApiException`, using the hub's error body
/// when it has one.
async fn checked(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let error = response.json::<ApiError>().await.unwrap_or_else(|_| {
        ApiError::new(code_for(status), format!("request failed with {status}"))
    });
    Err(anyhow::Error::new(ApiException::from(error)).context(format!("{status} from {url}")))
}

fn code_for(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
        StatusCode::FORBIDDEN => ErrorCode::Forbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::CONFLICT => ErrorCode::Conflict,
        status if status.is_client_error() => ErrorCode::Validation,
        _ => ErrorCode::Internal,
    }
}

#[async_trait]
impl RowStore for HubClient {
    async fn ping(&self) -> Result<()> {
        let response = self.request(Method::GET, "healthz").await?.send().await?;
        checked(response).await?;
        Ok(())
    }

    async fn list_rooms(&self, user_id: &UserId) -> Result<Vec<Room>> {
        let rooms: Vec<Room> = self.get_json("rooms").await?;
        Ok(rooms
            .into_iter()
            .filter(|room| room.has_participant(user_id))
            .collect())
    }

    async fn list_messages(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>> {
        self.get_json(&format!("rooms/{room_id}/messages")).await
    }

    async fn insert_message(&self, room_id: &RoomId, message: NewMessage) -> Result<ChatMessage> {
        self.post_json(&format!("rooms/{room_id}/messages"), &message)
            .await
    }

    async fn mark_read(&self, room_id: &RoomId, _reader: &UserId) -> Result<Vec<ChatMessage>> {
        let response: MarkReadResponse = self
            .post_json(&format!("rooms/{room_id}/read"), &serde_json::json!({}))
            .await?;
        Ok(response.updated)
    }

    async fn get_or_create_general_room(&self, other_user_id: &UserId) -> Result<Room> {
        self.post_json(
            "rooms/general",
            &GeneralRoomRequest {
                other_user_id: other_user_id.clone(),
            },
        )
        .await
    }

    async fn fetch_proposal(&self, proposal_id: &ProposalId) -> Result<Option<Proposal>> {
        let response = self
            .request(Method::GET, &format!("proposals/{proposal_id}"))
            .await?
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(checked(response).await?.json().await?))
    }

    async fn list_proposals(&self, room_id: &RoomId) -> Result<Vec<Proposal>> {
        self.get_json(&format!("rooms/{room_id}/proposals")).await
    }

    async fn create_proposal(
        &self,
        room_id: &RoomId,
        proposal: NewProposal,
    ) -> Result<ProposalWithMessage> {
        self.post_json(&format!("rooms/{room_id}/proposals"), &proposal)
            .await
    }

    async fn respond_to_proposal(
        &self,
        proposal_id: &ProposalId,
        status: ProposalStatus,
    ) -> Result<Proposal> {
        self.post_json(
            &format!("proposals/{proposal_id}/respond"),
            &ProposalResponseRequest { status },
        )
        .await
    }
}

#[async_trait]
impl ObjectStorage for HubClient {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let response = self
            .request(Method::PUT, &format!("storage/{bucket}/{path}"))
            .await?
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;
        let body: UploadResponse = checked(response).await?.json().await?;
        Ok(body.public_url)
    }

    async fn remove(&self, bucket: &str, path: &str) -> Result<()> {
        let response = self
            .request(Method::DELETE, &format!("storage/{bucket}/{path}"))
            .await?
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
