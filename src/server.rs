use crate::error::ChatError;
use crate::rag::RagEngine;
use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use log::{info, warn};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_STATIC_DIR: &str = "frontend_quasar_vue/dist/spa";
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:9000";

/// Body of a chat request
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// A missing field is treated like an empty message
    #[serde(default)]
    pub msg: String,
}

/// HTTP server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Prebuilt single-page app served for every other path
    pub static_dir: Option<PathBuf>,
    pub cors_origins: Vec<String>,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<RagEngine>,
}

/// Build the application router
pub fn build_router(engine: Arc<RagEngine>, config: &ServerConfig) -> Result<Router> {
    let mut router = Router::new()
        .route("/api/chat", post(chat))
        .with_state(AppState { engine });

    if let Some(static_dir) = &config.static_dir {
        if !static_dir.is_dir() {
            warn!("Static directory {} does not exist", static_dir.display());
        }
        let index = ServeFile::new(static_dir.join("index.html"));
        router = router.fallback_service(ServeDir::new(static_dir).fallback(index));
    }

    if !config.cors_origins.is_empty() {
        router = router.layer(cors_layer(&config.cors_origins)?);
    }

    Ok(router)
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("Invalid CORS origin {}", origin))
        })
        .collect::<Result<Vec<HeaderValue>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]))
}

/// Generate text for a message, streamed back as chunked plain text
async fn chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ChatError> {
    let Json(request) = body.map_err(|rejection| ChatError::InvalidBody(rejection.body_text()))?;

    let stream = state.engine.chat(&request.msg).await?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Serve the router until Ctrl-C
pub async fn serve(engine: Arc<RagEngine>, config: ServerConfig) -> Result<()> {
    let router = build_router(engine, &config)?;

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!("Listening on {}", config.bind);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
