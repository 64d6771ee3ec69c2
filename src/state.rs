use std::sync::Arc;

use crate::db::DbPool;
use crate::gateway::PersistenceGateway;
use crate::ws::registry::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
/// The registry and gateway are constructed once at startup and injected
/// explicitly — no module-level singletons, so tests can run isolated
/// instances side by side.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// Active WebSocket connection per user
    pub connections: Arc<ConnectionRegistry>,
    /// Durable message store + user directory adapter
    pub gateway: Arc<dyn PersistenceGateway>,
}
