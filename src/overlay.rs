use crate::broadcast::{snapshot_envelope, BroadcastPublisher};
use crate::match_commands::api_router;
use crate::types::*;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State as AxumState,
    },
    response::{IntoResponse, Response},
    routing::{get, get_service},
    Router,
};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct OverlayServerState {
    pub orchestrator: SharedOrchestrator,
    pub publisher: BroadcastPublisher,
}

pub fn overlay_router(state: OverlayServerState, static_dir: PathBuf) -> Router {
    let static_files = get_service(ServeDir::new(static_dir));

    Router::new()
        .route("/state", get(get_state))
        .route("/friendly/:referee/state", get(get_friendly_state))
        .route("/ws", get(ws_upgrade))
        .nest("/api", api_router())
        .fallback_service(static_files)
        .with_state(state)
}

pub async fn start_overlay_server(state: OverlayServerState, static_dir: PathBuf, addr: String) {
    let app = overlay_router(state, static_dir);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("overlay server failed to bind {addr}: {e}");
            return;
        }
    };
    info!("overlay server listening at http://{addr}/");
    if let Err(e) = axum::serve(listener, app).await {
        error!("overlay server error: {e}");
    }
}

/// Uncached JSON, so overlays polling `/state` never see a stale match.
pub fn no_store_json<T: Serialize>(payload: &T) -> impl IntoResponse {
    let body = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    (
        [
            ("Content-Type", "application/json"),
            ("Cache-Control", "no-store"),
            ("Pragma", "no-cache"),
            ("Expires", "0"),
        ],
        body,
    )
}

fn ranked_snapshot(state: &OverlayServerState) -> Value {
    let guard = state.orchestrator.lock().unwrap_or_else(|e| e.into_inner());
    snapshot_envelope(MatchKind::Ranked, guard.snapshot().as_ref())
}

async fn get_state(AxumState(state): AxumState<OverlayServerState>) -> impl IntoResponse {
    no_store_json(&ranked_snapshot(&state))
}

async fn get_friendly_state(
    Path(referee): Path<String>,
    AxumState(state): AxumState<OverlayServerState>,
) -> impl IntoResponse {
    let doc = {
        let guard = state.orchestrator.lock().unwrap_or_else(|e| e.into_inner());
        guard.friendly_snapshot(&referee)
    };
    no_store_json(&snapshot_envelope(MatchKind::Friendly, doc.as_ref()))
}

async fn ws_upgrade(ws: WebSocketUpgrade, AxumState(state): AxumState<OverlayServerState>) -> Response {
    ws.on_upgrade(move |socket| forward_broadcasts(socket, state))
}

/// Send the current snapshot, then every broadcast until the client leaves.
/// A lagging client gets a fresh snapshot in place of what it missed.
async fn forward_broadcasts(mut socket: WebSocket, state: OverlayServerState) {
    let mut rx = state.publisher.subscribe();
    if socket
        .send(Message::Text(ranked_snapshot(&state).to_string()))
        .await
        .is_err()
    {
        return;
    }
    debug!("overlay client connected ({} subscribers)", state.publisher.subscriber_count());

    loop {
        tokio::select! {
            received = rx.recv() => {
                let text = match received {
                    Ok(message) => match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to encode {}: {e}", message.event);
                            continue;
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("overlay client lagged by {skipped} events; resending snapshot");
                        ranked_snapshot(&state).to_string()
                    }
                    Err(RecvError::Closed) => break,
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("overlay client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::{approved_match, make_orchestrator};
    use crate::store::MemoryStore;
    use std::sync::{Arc, Mutex};

    fn overlay_state(store: &MemoryStore) -> OverlayServerState {
        let orchestrator = make_orchestrator(store);
        let publisher = orchestrator.publisher().clone();
        OverlayServerState {
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            publisher,
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_state_is_uncached_and_null_without_match() {
        let store = MemoryStore::new();
        let state = overlay_state(&store);
        let response = get_state(AxumState(state)).await.into_response();
        assert_eq!(response.headers()["cache-control"], "no-store");
        assert_eq!(response.headers()["pragma"], "no-cache");
        assert_eq!(response.headers()["content-type"], "application/json");
        let body = body_json(response).await;
        assert_eq!(body["event"], "match.snapshot");
        assert!(body["data"]["match"].is_null());
    }

    #[tokio::test]
    async fn test_state_shows_live_match() {
        let store = MemoryStore::new();
        let state = overlay_state(&store);
        {
            let mut guard = state.orchestrator.lock().unwrap();
            approved_match(&mut guard, "Test – Bo3");
        }
        let body = body_json(get_state(AxumState(state)).await.into_response()).await;
        assert_eq!(body["data"]["match"]["progressLevel"], "check-in");
        assert_eq!(body["data"]["match"]["players"][0]["displayName"], "Alice");
    }

    #[tokio::test]
    async fn test_friendly_state_is_scoped_to_referee() {
        let store = MemoryStore::new();
        let state = overlay_state(&store);
        let response = get_friendly_state(Path("ref-a".to_string()), AxumState(state))
            .await
            .into_response();
        let body = body_json(response).await;
        assert_eq!(body["event"], "friendly.snapshot");
        assert!(body["data"]["match"].is_null());
    }
}
