use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;

use crate::config::CollabConfig;
use crate::manager::{spawn_manager, SessionManagerHandle};
use crate::storage::DocumentStorage;
use crate::QuireResult;

pub mod admission;
pub mod handler;

pub use admission::{Admission, ConnectionAdmission, TrustedHeaderAdmission};
pub use handler::WebSocketHandler;

/// Axum state shared by every document connection
#[derive(Clone)]
pub struct CollabState {
    manager: SessionManagerHandle,
    storage: Arc<dyn DocumentStorage>,
    admission: Arc<dyn ConnectionAdmission>,
    config: Arc<CollabConfig>,
}

impl CollabState {
    /// Create the state and start the session manager
    pub fn new(
        storage: Arc<dyn DocumentStorage>,
        admission: Arc<dyn ConnectionAdmission>,
        config: CollabConfig,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            manager: spawn_manager(storage.clone(), config.clone()),
            storage,
            admission,
            config,
        }
    }

    /// Get the session manager
    pub fn manager(&self) -> &SessionManagerHandle {
        &self.manager
    }

    /// Get the storage backend
    pub fn storage(&self) -> &Arc<dyn DocumentStorage> {
        &self.storage
    }

    pub fn config(&self) -> &Arc<CollabConfig> {
        &self.config
    }

    /// Stop every session, saving their documents
    ///
    /// Call this during graceful shutdown, after the server stopped accepting
    /// connections.
    pub async fn shutdown(&self) -> QuireResult<()> {
        self.manager.stop_all().await
    }
}

/// Create a router serving document connections at `/docs/{doc_id}/ws`
pub fn router_with_collab(state: CollabState) -> Router {
    Router::new()
        .route("/docs/{doc_id}/ws", get(websocket_handler))
        .with_state(state)
}

/// WebSocket handler endpoint
async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(doc_id): Path<String>,
    headers: HeaderMap,
    State(state): State<CollabState>,
) -> Response {
    let admission = match state.admission.admit(&doc_id, &headers).await {
        Ok(admission) => admission,
        Err(e) => {
            tracing::warn!("Refused connection to document '{}': {}", doc_id, e);
            return (StatusCode::FORBIDDEN, e.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| WebSocketHandler::new(socket, state, doc_id, admission).handle())
}
