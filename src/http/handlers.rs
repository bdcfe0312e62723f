//! HTTP API handlers

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::http::server::AppState;
use crate::protocol::{SessionPhase, SessionStatus, TargetDescriptor};

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Bridge status
#[derive(serde::Serialize)]
pub struct BridgeStatus {
    pub running: bool,
    pub device_count: usize,
    pub session_count: usize,
    pub streaming_count: usize,
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<BridgeStatus>> {
    let orchestrator = &state.orchestrator;
    let sessions = orchestrator.sessions();
    let status = BridgeStatus {
        running: orchestrator.is_running(),
        device_count: orchestrator.device_list().len(),
        session_count: sessions.len(),
        streaming_count: sessions
            .iter()
            .filter(|s| s.phase == SessionPhase::Streaming)
            .count(),
    };

    Json(ApiResponse::ok(status))
}

/// Known cast targets
pub async fn get_devices(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<TargetDescriptor>>> {
    Json(ApiResponse::ok(state.orchestrator.device_list()))
}

pub async fn get_sessions(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<SessionStatus>>> {
    Json(ApiResponse::ok(state.orchestrator.sessions()))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<ApiResponse<SessionStatus>>) {
    match state.orchestrator.session_status(&name) {
        Some(status) => (StatusCode::OK, Json(ApiResponse::ok(status))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("No session for {}", name))),
        ),
    }
}

/// Live MP3 for one session. Late joiners start at the current chunk;
/// a listener that falls behind skips ahead instead of stalling the relay.
pub async fn stream_audio(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Some(rx) = state.orchestrator.hub().subscribe(&id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::error(format!("No stream {}", id))),
        )
            .into_response();
    };
    tracing::info!("Listener attached to {}", id);

    let stream = BroadcastStream::new(rx).filter_map(|chunk| match chunk {
        Ok(bytes) => Some(Ok::<_, std::io::Error>(bytes)),
        Err(e) => {
            tracing::debug!("Listener lagged: {}", e);
            None
        }
    });

    (
        [
            (header::CONTENT_TYPE, "audio/mpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::WebServer;
    use crate::orchestrator::{BridgeOrchestrator, Collaborators};
    use crate::testing::{bridge_config, FakeCast, FakeDiscovery, FakeLauncher};
    use axum::http::Request;
    use bytes::Bytes;
    use tower::ServiceExt;

    fn server() -> (WebServer, Arc<BridgeOrchestrator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = bridge_config(dir.path(), 47500);
        let (discovery, _feed) = FakeDiscovery::new();
        let orchestrator = Arc::new(BridgeOrchestrator::new(
            config.clone(),
            Collaborators {
                launcher: Arc::new(FakeLauncher::new()),
                connector: Arc::new(FakeCast::new()),
                discovery: Box::new(discovery),
            },
        ));
        (WebServer::new(config.http, orchestrator.clone()), orchestrator, dir)
    }

    async fn get_json(server: &WebServer, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = server
            .router()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_status_of_idle_bridge() {
        let (server, _orchestrator, _dir) = server();
        let (status, json) = get_json(&server, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["running"], false);
        assert_eq!(json["data"]["session_count"], 0);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let (server, _orchestrator, _dir) = server();
        let (status, json) = get_json(&server, "/api/sessions/Nowhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["success"], false);
        assert!(json.get("data").is_none());
    }

    #[tokio::test]
    async fn test_unknown_stream_is_not_found() {
        let (server, _orchestrator, _dir) = server();
        let (status, _) = get_json(&server, "/stream/bridge-stream-Nowhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_delivers_published_chunks() {
        let (server, orchestrator, _dir) = server();
        let publisher = orchestrator.hub().register("bridge-stream-Kitchen Speaker");

        let response = server
            .router()
            .oneshot(
                Request::get("/stream/bridge-stream-Kitchen%20Speaker")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(publisher.listener_count(), 1);

        publisher.publish(Bytes::from_static(b"\xff\xfbmp3"));
        let mut body = response.into_body().into_data_stream();
        let chunk = body.next().await.unwrap().unwrap();
        assert_eq!(chunk, Bytes::from_static(b"\xff\xfbmp3"));
    }
}
