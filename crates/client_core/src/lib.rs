//! Realtime chat client core: channel lifecycle, subscription bookkeeping and
//! the message model UI views observe.

pub mod auth;
pub mod backend;
pub mod config;
pub mod connection;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod http;
pub mod ingest;
pub mod registry;
pub mod store;
pub mod ws;

pub use auth::{AuthChange, AuthSession, Session, SessionHandle};
pub use backend::BackendClient;
pub use config::RealtimeSettings;
pub use connection::{ChannelHandle, ConnectionEvent, ConnectionManager};
pub use context::ChatContext;
pub use diagnostics::Diagnostics;
pub use error::{ChatError, ChatResult};
pub use ingest::{ChatEvent, IngestOutcome, MessagePipeline};
pub use registry::SubscriptionRegistry;
pub use store::ChatStore;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
