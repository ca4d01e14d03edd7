use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use quire::axum::admission::USER_ID_HEADER;
use quire::{CollabConfig, CollabState, FileStorage, Permission, TrustedHeaderAdmission};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};

#[derive(Clone)]
struct AppState {
    files: Arc<FileStorage>,
    collab: CollabState,
}

#[derive(Debug, Deserialize)]
struct CreateDocumentRequest {
    #[serde(default)]
    text: String,
    #[serde(default)]
    permission: Permission,
}

// REST API handlers
async fn create_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateDocumentRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let owner = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let id = state
        .files
        .create_document(owner, request.permission, &request.text)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!("Created document: {}", id);
    Ok(Json(json!({ "id": id })))
}

async fn document_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let status = state
        .collab
        .manager()
        .status(id.as_str())
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(Json(json!({
        "id": id,
        "session": status.map(|status| format!("{:?}", status)),
    })))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let sessions = state
        .collab
        .manager()
        .session_count()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(Json(json!({ "sessions": sessions })))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting collaborative editing server...");

    let config = match std::env::var("QUIRE_CONFIG") {
        Ok(path) => CollabConfig::load(path).await?,
        Err(_) => CollabConfig::default(),
    };
    let root = std::env::var("QUIRE_DATA").unwrap_or_else(|_| "./quire-data".to_string());

    let files = Arc::new(FileStorage::open(root).await?);
    let collab = CollabState::new(files.clone(), Arc::new(TrustedHeaderAdmission), config);
    let state = AppState {
        files,
        collab: collab.clone(),
    };

    let app = Router::new()
        .route("/docs", post(create_document))
        .route("/docs/{id}/status", get(document_status))
        .route("/stats", get(get_stats))
        .with_state(state)
        .merge(quire::router_with_collab(collab.clone()));

    // Start server
    let listener = TcpListener::bind("127.0.0.1:3001").await?;
    info!("Server running on http://127.0.0.1:3001");
    info!("WebSocket endpoint available at ws://127.0.0.1:3001/docs/{{id}}/ws");
    info!("API endpoints:");
    info!("  POST   /docs              - Create a document (x-user-id becomes owner)");
    info!("  GET    /docs/{{id}}/status  - Session status of a document");
    info!("  GET    /stats             - Number of open sessions");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Saving open documents...");
    collab.shutdown().await?;

    Ok(())
}
