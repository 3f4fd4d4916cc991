use crate::{api::ApiContext, realtime::RoomChange};
use tokio::sync::broadcast;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) events: broadcast::Sender<RoomChange>,
    pub(crate) public_base: String,
    pub(crate) max_upload_bytes: usize,
}

impl AppState {
    pub(crate) fn new(api: ApiContext, public_base: String, max_upload_bytes: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            api,
            events,
            public_base,
            max_upload_bytes,
        }
    }

    /// Fans a change out to joined sockets; no listeners is fine.
    pub(crate) fn publish(&self, change: RoomChange) {
        let _ = self.events.send(change);
    }
}
