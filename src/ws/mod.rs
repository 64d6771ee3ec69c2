pub mod actor;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod router;

use tokio::sync::mpsc;

/// Type alias for the sender half of a WebSocket connection's channel.
/// The actor's writer task owns the matching receiver; anything holding a
/// clone can push frames to that client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;
