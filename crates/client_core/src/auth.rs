use async_trait::async_trait;
use shared::domain::UserId;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::error::{ChatError, ChatResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChange {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
}

impl AuthChange {
    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::SignedIn(session) | Self::TokenRefreshed(session) => Some(session),
            Self::SignedOut => None,
        }
    }
}

#[async_trait]
pub trait AuthSession: Send + Sync {
    async fn current_session(&self) -> Option<Session>;
    fn subscribe(&self) -> broadcast::Receiver<AuthChange>;
}

/// In-process session holder. Sign-in flows live outside the chat core; they
/// only push the resulting tokens in here.
pub struct SessionHandle {
    session: RwLock<Option<Session>>,
    changes: broadcast::Sender<AuthChange>,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::from_parts(None)
    }

    pub fn with_session(session: Session) -> Self {
        Self::from_parts(Some(session))
    }

    fn from_parts(session: Option<Session>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            session: RwLock::new(session),
            changes,
        }
    }

    pub async fn sign_in(&self, session: Session) {
        info!(user_id = %session.user_id, "auth: signed in");
        *self.session.write().await = Some(session.clone());
        let _ = self.changes.send(AuthChange::SignedIn(session));
    }

    pub async fn refresh(&self, access_token: impl Into<String>) -> ChatResult<Session> {
        let session = {
            let mut guard = self.session.write().await;
            let current = guard.as_mut().ok_or(ChatError::AuthRequired)?;
            current.access_token = access_token.into();
            current.clone()
        };
        info!(user_id = %session.user_id, "auth: access token refreshed");
        let _ = self.changes.send(AuthChange::TokenRefreshed(session.clone()));
        Ok(session)
    }

    pub async fn sign_out(&self) {
        if self.session.write().await.take().is_some() {
            info!("auth: signed out");
            let _ = self.changes.send(AuthChange::SignedOut);
        }
    }
}

#[async_trait]
impl AuthSession for SessionHandle {
    async fn current_session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.changes.subscribe()
    }
}
