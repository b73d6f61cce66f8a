//! Push Channel Module
//!
//! The seam to the server-push transport. The backend speaks a
//! socket.io-style protocol of named events with JSON payloads; the
//! embedding application supplies the actual transport binding, while
//! the synchronizer owns connection supervision and reconnect policy.

use async_trait::async_trait;

/// Event name for bin change notifications.
pub const EVENT_BIN_UPDATE: &str = "bin:update";
/// Event name for route change notifications.
pub const EVENT_ROUTE_UPDATE: &str = "route:update";

/// A named change event delivered over the push channel.
#[derive(Debug, Clone)]
pub struct PushMessage {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Connection status, exposed for a best-effort reconnect indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
}

/// Factory for push connections. One `connect` call per (re)connect
/// attempt; the synchronizer calls it again after a drop.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushConnection>, TransportError>;
}

/// A live push connection.
#[async_trait]
pub trait PushConnection: Send {
    /// Await the next event. `None` signals the connection closed.
    async fn next_event(&mut self) -> Option<PushMessage>;
}
