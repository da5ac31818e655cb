use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::Lifecycle;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn api_status(State(state): State<SharedState>) -> impl IntoResponse {
    let st = state.read().await;
    Json(st.to_status())
}

/// 200 while the cycles are running, 503 otherwise.
async fn healthz(State(state): State<SharedState>) -> impl IntoResponse {
    let lifecycle = state.read().await.lifecycle;
    let code = if lifecycle == Lifecycle::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({ "lifecycle": lifecycle })))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(port: u16, state: SharedState, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status port {port}"))?;

    tracing::info!("status api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("status server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SystemState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get_json(state: SharedState, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router(state)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let code = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (code, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn status_reports_rig_state() {
        let state = SystemState::shared("rig-1");
        {
            let mut st = state.write().await;
            st.set_lifecycle(Lifecycle::Running);
            st.record_light(true);
        }
        let (code, json) = get_json(state, "/api/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(json["device_id"], "rig-1");
        assert_eq!(json["lifecycle"], "running");
        assert_eq!(json["light_on"], true);
        assert_eq!(json["pump_on"], false);
        assert!(json["last_telemetry"].is_null());
        assert_eq!(json["events"][0]["kind"], "light");
    }

    #[tokio::test]
    async fn healthz_follows_lifecycle() {
        let state = SystemState::shared("rig-1");
        let (code, json) = get_json(state.clone(), "/healthz").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["lifecycle"], "starting");

        state.write().await.set_lifecycle(Lifecycle::Running);
        let (code, _) = get_json(state, "/healthz").await;
        assert_eq!(code, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let resp = router(SystemState::shared("rig-1"))
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(0, SystemState::shared("rig-1"), shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
