//! Call boundary towards the native metadata receiver.
//!
//! The native side is addressed by a service name and two actions, `start`
//! and `stop`. A successful `start` hands back a [`StatusFeed`] on which the
//! receiver pushes status objects until it is stopped. On `stop` the native
//! receiver sends a last `{}` to release the callback and then closes the feed.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::errors::NowPlayingError;

/// Stream of status pushes for one started session.
pub type StatusFeed = UnboundedReceiver<Option<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeAction {
    Start,
    Stop,
}

impl BridgeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeAction::Start => "start",
            BridgeAction::Stop => "stop",
        }
    }
}

impl fmt::Display for BridgeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport to the native metadata receiver.
///
/// Implementations are fire-and-forget from the gate's point of view: the
/// gate awaits the acknowledgement of `start` and `stop` but never retries.
#[async_trait]
pub trait NativeBridge: Send + Sync {
    /// Starts the native listener for `service`.
    ///
    /// Returns the feed of status pushes, or the native error (for instance
    /// "already running" when a listener is registered).
    async fn start(&self, service: &str) -> Result<StatusFeed, NowPlayingError>;

    /// Stops the native listener. Must tolerate being called while stopped.
    async fn stop(&self, service: &str) -> Result<(), NowPlayingError>;
}
