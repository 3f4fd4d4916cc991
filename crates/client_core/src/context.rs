use std::sync::Arc;

use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    auth::AuthChange,
    backend::BackendClient,
    config::RealtimeSettings,
    connection::ConnectionManager,
    diagnostics::Diagnostics,
    error::ChatResult,
    ingest::MessagePipeline,
    registry::SubscriptionRegistry,
    store::ChatStore,
};

/// Owns one instance of every chat component. Built once per signed-in
/// application, initialized with a backend bundle and disposed on teardown.
pub struct ChatContext {
    settings: RealtimeSettings,
    connections: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    pipeline: Arc<MessagePipeline>,
    diagnostics: Arc<Diagnostics>,
    store: Arc<ChatStore>,
    session_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ChatContext {
    pub fn new(settings: RealtimeSettings) -> Arc<Self> {
        let diagnostics = Arc::new(Diagnostics::new(&settings));
        let connections = ConnectionManager::new(settings.clone());
        let registry = SubscriptionRegistry::new(connections.clone(), diagnostics.clone());
        let pipeline = MessagePipeline::new(diagnostics.clone());
        let store = ChatStore::new(
            connections.clone(),
            registry.clone(),
            pipeline.clone(),
            diagnostics.clone(),
        );
        Arc::new(Self {
            settings,
            connections,
            registry,
            pipeline,
            diagnostics,
            store,
            session_watcher: Mutex::new(None),
        })
    }

    pub async fn init(self: &Arc<Self>, client: BackendClient) -> ChatResult<()> {
        self.connections.initialize(client.clone()).await?;
        self.pipeline.bind_rows(client.rows.clone());
        let user = client
            .auth
            .current_session()
            .await
            .map(|session| session.user_id);
        self.pipeline.set_current_user(user);

        let mut changes = client.auth.subscribe();
        let context = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let Some(context) = context.upgrade() else {
                            break;
                        };
                        context.on_auth_change(change).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "auth: session watcher lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.session_watcher.lock().await.replace(watcher) {
            previous.abort();
        }
        info!("auth: chat context initialized");
        Ok(())
    }

    async fn on_auth_change(&self, change: AuthChange) {
        let previous = self.pipeline.current_user();
        match change.session() {
            None => {
                info!("auth: signed out, dropping chat state");
                self.store.cleanup_all_subscriptions().await;
                self.store.reset();
                self.pipeline.set_current_user(None);
            }
            Some(session) => match previous {
                Some(previous) if previous != session.user_id => {
                    info!(
                        previous = %previous,
                        user_id = %session.user_id,
                        "auth: user switched, dropping chat state"
                    );
                    self.store.cleanup_all_subscriptions().await;
                    self.store.reset();
                    self.pipeline.set_current_user(Some(session.user_id.clone()));
                }
                Some(_) => {}
                None => self.pipeline.set_current_user(Some(session.user_id.clone())),
            },
        }
    }

    /// Stops the session watcher, closes every channel and drops all state.
    pub async fn dispose(&self) {
        if let Some(watcher) = self.session_watcher.lock().await.take() {
            watcher.abort();
        }
        self.store.cleanup_all_subscriptions().await;
        self.connections.shutdown().await;
        self.store.reset();
        self.diagnostics.reset();
        info!("auth: chat context disposed");
    }

    pub fn settings(&self) -> &RealtimeSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<ChatStore> {
        &self.store
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<MessagePipeline> {
        &self.pipeline
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }
}

#[cfg(test)]
#[path = "tests/context_tests.rs"]
mod tests;
