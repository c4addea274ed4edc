use anyhow::{Context, Result};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::{error, info};

use axum::{extract::State, middleware, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use super::ingestion_routes::ingestion_routes;
use super::metrics::metrics_handler;
use super::{log_requests, state::*, ServerConfig};

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub hash: String,
    pub stored_assets: usize,
    pub tracked_sessions: usize,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        hash: state.hash.clone(),
        stored_assets: state.coordinator.store().len(),
        tracked_sessions: state.coordinator.tracker().len(),
    };
    Json(stats)
}

pub fn make_app(config: ServerConfig, coordinator: GuardedCoordinator) -> Router {
    let state = ServerState::new(config.clone(), coordinator);

    let mut app: Router = Router::new()
        .route("/", get(home))
        .merge(ingestion_routes())
        .with_state(state.clone());

    if let Some(frontend_path) = config.frontend_dir_path {
        let static_files_service =
            ServeDir::new(frontend_path).append_index_html_on_directories(true);
        app = app.fallback_service(static_files_service);
    }

    app.layer(middleware::from_fn_with_state(state, log_requests))
}

/// Serve the receiver and the metrics endpoint until `shutdown` is cancelled.
pub async fn run_server(
    config: ServerConfig,
    coordinator: GuardedCoordinator,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = make_app(config.clone(), coordinator);

    let listener = tokio::net::TcpListener::bind((config.bind_address.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.bind_address, config.port))?;
    let metrics_listener =
        tokio::net::TcpListener::bind((config.bind_address.as_str(), config.metrics_port))
            .await
            .with_context(|| {
                format!(
                    "Failed to bind metrics port {}:{}",
                    config.bind_address, config.metrics_port
                )
            })?;

    let metrics_app = Router::new().route("/metrics", get(metrics_handler));
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, metrics_app)
            .with_graceful_shutdown(metrics_shutdown.cancelled_owned())
            .await
        {
            error!("Metrics server failed: {}", e);
        }
    });

    info!(
        "Receiving uploads on {}:{}, metrics on port {}",
        config.bind_address, config.port, config.metrics_port
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::{
        AssetStore, IngestionCoordinator, IngestionSettings, ProgressTracker, ScratchArea,
        DEFAULT_CHUNK_SIZE,
    };
    use crate::server::RequestsLoggingLevel;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt; // for `oneshot`

    async fn test_app(dir: &TempDir, max_upload_bytes: u64) -> Router {
        let root = dir.path().join("media");
        let store = Arc::new(
            AssetStore::open(
                &root,
                ScratchArea::new(root.join(".incoming")),
                DEFAULT_CHUNK_SIZE,
            )
            .await
            .unwrap(),
        );
        let tracker = Arc::new(ProgressTracker::new(Duration::from_secs(60)));
        let coordinator = IngestionCoordinator::new(
            store,
            tracker,
            None,
            IngestionSettings {
                max_upload_bytes,
                ..Default::default()
            },
        );
        let config = ServerConfig {
            requests_logging_level: RequestsLoggingLevel::None,
            ..Default::default()
        };
        make_app(config, Arc::new(coordinator))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0d 00:00:00");
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 01:01:01");
    }

    #[tokio::test]
    async fn home_reports_counts() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir, 1024).await;

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["stored_assets"], 0);
        assert_eq!(json["tracked_sessions"], 0);
    }

    #[tokio::test]
    async fn raw_upload_then_poll() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir, 1024 * 1024).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/upload")
                    .header("content-type", "image/jpeg")
                    .header("content-disposition", "attachment; filename=\"IMG_1.jpg\"")
                    .header("x-upload-id", "abc")
                    .body(Body::from(vec![1u8; 2048]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["session_id"], "abc");
        assert_eq!(json["status"], "DONE");
        assert_eq!(json["asset"]["filename"], "IMG_1.jpg");

        let response = app
            .oneshot(Request::builder().uri("/upload/abc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "DONE");
        assert_eq!(json["bytes_received"], 2048);
    }

    #[tokio::test]
    async fn rejects_oversized_and_unsupported() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir, 1024).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/upload?filename=big.jpg")
                    .header("content-type", "image/jpeg")
                    .header("x-upload-size", "4096")
                    .body(Body::from(vec![1u8; 16]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(response).await["code"], "PAYLOAD_TOO_LARGE");

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/upload")
                    .header("content-type", "text/plain")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir, 1024).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/upload/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn setup_is_plain_text() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir, 1024).await;

        let response = app
            .oneshot(Request::builder().uri("/setup").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }
}
