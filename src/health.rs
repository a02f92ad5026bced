//! Liveness and readiness endpoints
//!
//! Plain-HTTP probe server run alongside both roles. Kept separate from the
//! TLS webhook listener so kubelet probes need no certificates.

use std::net::SocketAddr;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Build the probe router for the named service
pub fn health_router(service: &'static str) -> Router {
    Router::new()
        .route(
            "/health",
            get(move || async move { Json(status("healthy", service)) }),
        )
        .route(
            "/ready",
            get(move || async move { Json(status("ready", service)) }),
        )
}

fn status(state: &str, service: &str) -> Value {
    json!({ "status": state, "service": service })
}

/// Serve the probe endpoints until the token is cancelled.
///
/// Bind or serve failures are logged, not propagated - a broken probe
/// server must never take the main loop down with it.
pub async fn serve(port: u16, service: &'static str, cancel: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(addr = %addr, service = %service, "Health server started");
            listener
        }
        Err(e) => {
            error!(error = %e, port = port, "Failed to bind health server port");
            return;
        }
    };

    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, health_router(service))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "Health server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get_json(router: Router, path: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_service_name() {
        let (status, body) = get_json(health_router("gpu-scheduler"), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "gpu-scheduler");
    }

    #[tokio::test]
    async fn ready_reports_service_name() {
        let (status, body) = get_json(health_router("gpu-webhook"), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["service"], "gpu-webhook");
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let router = health_router("gpu-scheduler");
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
