use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use matsearch_core::{Error, ExperimentRecord};
use matsearch_local::{telemetry, Orchestrator};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::envelope::{error_response, rejection_response};

/// Request bodies above this are refused with a JSON 413. Callers may send long
/// histories even though only the newest turns are kept.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: &'static str,
    pub version: &'static str,
    pub search_enabled: bool,
}

pub async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        name: "matsearch",
        version: env!("CARGO_PKG_VERSION"),
        search_enabled: state.orchestrator.search_enabled(),
    })
}

pub async fn handle_chat(
    State(state): State<Arc<AppState>>,
    method: Method,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(b) => b,
        Err(rej) => return rejection_response(&rej),
    };
    match state.orchestrator.handle_http(method.as_str(), &body).await {
        Ok(r) => (StatusCode::OK, Json(r)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Relays a client-side experiment record to the telemetry sink without waiting on it.
pub async fn handle_log(
    State(state): State<Arc<AppState>>,
    method: Method,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    if method != Method::POST {
        return error_response(&Error::MethodNotAllowed);
    }
    let body = match body {
        Ok(b) => b,
        Err(rej) => return rejection_response(&rej),
    };
    let rec: ExperimentRecord = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return error_response(&Error::InvalidRequest(format!("Invalid log record: {e}"))),
    };
    let Some(sink) = state.orchestrator.telemetry() else {
        tracing::warn!("telemetry URL not configured; dropping experiment record");
        return (StatusCode::ACCEPTED, Json(serde_json::json!({ "ok": false }))).into_response();
    };
    telemetry::dispatch(sink, rec);
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "ok": true }))).into_response()
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/api/chat", any(handle_chat))
        .route("/api/log", any(handle_log))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

pub async fn run_server(orchestrator: Orchestrator, addr: SocketAddr) -> Result<()> {
    let search_enabled = orchestrator.search_enabled();
    let state = Arc::new(AppState { orchestrator });
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, search_enabled, "listening (chat: /api/chat, log: /api/log, health: /healthz)");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
