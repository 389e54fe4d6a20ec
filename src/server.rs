// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Control HTTP surface
//!
//! Status and restart endpoints over the supervisor, plus health and
//! Prometheus metrics.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::registry::ChannelRegistry;
use crate::supervisor::{StreamStatus, StreamSupervisor};

/// Application state shared across handlers
pub struct AppState {
    pub supervisor: Arc<StreamSupervisor>,
    pub registry: Arc<ChannelRegistry>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub streams: usize,
    pub active: usize,
    pub viewers: usize,
}

/// Acknowledgement response
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Build the control router
pub fn control_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stream-status", get(status_handler))
        .route("/restart-stream/{stream_id}", post(restart_handler))
        .with_state(state)
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::default())
                .on_response(tower_http::trace::DefaultOnResponse::default()),
        )
        .layer(tower_http::cors::CorsLayer::permissive())
}

/// Liveness text
pub async fn root_handler() -> &'static str {
    "cctv-relay is running"
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = state.supervisor.status().await;
    let viewers = state.registry.channels().await.iter().map(|(_, n)| n).sum();

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        streams: status.len(),
        active: status.iter().filter(|s| s.is_active).count(),
        viewers,
    })
}

/// Prometheus metrics handler
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let metrics = state.metrics_handle.render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics,
    )
        .into_response()
}

/// One entry per configured stream
pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<Vec<StreamStatus>> {
    Json(state.supervisor.status().await)
}

/// Kick off a restart and acknowledge without waiting for it
pub async fn restart_handler(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Response {
    if !state.supervisor.contains(&stream_id) {
        warn!(stream = %stream_id, "Restart requested for unknown stream");
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Stream not found".to_string(),
            }),
        )
            .into_response();
    }

    info!(stream = %stream_id, "Restart requested");
    let supervisor = Arc::clone(&state.supervisor);
    let id = stream_id.clone();
    tokio::spawn(async move {
        if let Err(e) = supervisor.restart(&id).await {
            error!(stream = %id, "Restart failed: {}", e);
        }
    });

    Json(MessageResponse {
        message: format!("Restarting stream {}", stream_id),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_streams;
    use crate::router::BroadcastRouter;
    use crate::supervisor::SupervisorOptions;
    use crate::transcoder::testing::ShellCommand;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<StreamSupervisor>) {
        let registry = Arc::new(ChannelRegistry::new(16));
        let streams = default_streams();
        let router = BroadcastRouter::new(Arc::clone(&registry), &streams);
        let supervisor = StreamSupervisor::new(
            streams,
            Arc::new(ShellCommand("exec sleep 30".to_string())),
            router,
            SupervisorOptions {
                retry_delay: Duration::from_millis(100),
                ..SupervisorOptions::default()
            },
        );
        let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();

        let state = Arc::new(AppState {
            supervisor: Arc::clone(&supervisor),
            registry,
            metrics_handle,
        });
        (control_router(state), supervisor)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_root_liveness() {
        let (app, _supervisor) = app();
        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"cctv-relay is running");
    }

    #[tokio::test]
    async fn test_stream_status_lists_every_definition() {
        let (app, supervisor) = app();
        supervisor.start_all().await;

        let response = app
            .oneshot(Request::get("/stream-status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let entries = json.as_array().unwrap();
        assert_eq!(entries.len(), 9);
        assert_eq!(entries[0]["id"], "stream1");
        assert_eq!(entries[0]["isActive"], true);
        assert_eq!(entries[0]["channel"], "channel1");

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_unknown_stream_is_404() {
        let (app, supervisor) = app();
        supervisor.start_all().await;
        let before = supervisor.status().await;

        let response = app
            .oneshot(
                Request::post("/restart-stream/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "Stream not found");

        let after = supervisor.status().await;
        assert!(before
            .iter()
            .zip(&after)
            .all(|(b, a)| b.generation == a.generation && a.is_active));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_known_stream_acknowledges_and_restarts() {
        let (app, supervisor) = app();
        supervisor.start_all().await;

        let response = app
            .oneshot(
                Request::post("/restart-stream/stream2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await["message"],
            "Restarting stream stream2"
        );

        let mut restarted = false;
        for _ in 0..100 {
            let status = supervisor.status().await;
            if status[1].generation == 2 && status[1].is_active {
                restarted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(restarted);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_counts_streams() {
        let (app, _supervisor) = app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["streams"], 9);
        assert_eq!(json["active"], 0);
        assert_eq!(json["viewers"], 0);
    }
}
