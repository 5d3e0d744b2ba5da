//! Example HTTP API using the connector for sessions, cache-aside reads and
//! per-route rate limits.
//!
//! Run with a local Redis:
//!
//! ```text
//! REDIS_HOST=localhost RUST_LOG=kv_connector=debug,info cargo run --example rate_limited_api
//! ```
//!
//! Without Redis the server still answers: reads go to the "database" every
//! time and the rate limiter lets everything through.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use kv_connector::{Connector, ConnectorBuilder, ConnectorConfig, RateLimitConfig, RateLimitLayer};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Assessment {
    id: u64,
    instrument: String,
    total: u32,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SessionData {
    username: String,
    role: String,
}

async fn load_assessment(id: u64) -> Result<Assessment, StatusCode> {
    // Stand-in for a slow database query
    tokio::time::sleep(Duration::from_millis(200)).await;
    if id > 1000 {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Assessment {
        id,
        instrument: "phq9".to_string(),
        total: (id % 27) as u32,
    })
}

async fn get_assessment(
    State(connector): State<Connector>,
    Path(id): Path<u64>,
) -> Result<Json<Assessment>, StatusCode> {
    let key = format!("assessment:{}", id);
    let assessment = connector
        .json()
        .get_or_set(&key, Some(300), || load_assessment(id))
        .await?;
    Ok(Json(assessment))
}

async fn login(
    State(connector): State<Connector>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let session_id = format!("{:016x}", rand::random::<u64>());
    let data = SessionData {
        username: request.username,
        role: "patient".to_string(),
    };

    connector
        .sessions()
        .set_session(&session_id, &data, None)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to store session");
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    Ok(Json(serde_json::json!({ "sessionId": session_id })))
}

async fn whoami(
    State(connector): State<Connector>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionData>, StatusCode> {
    match connector.sessions().get_session(&session_id).await {
        Ok(Some(data)) => Ok(Json(data)),
        Ok(None) => Err(StatusCode::UNAUTHORIZED),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let connector = ConnectorBuilder::redis(ConnectorConfig::from_env()).build();
    if let Err(e) = connector.connect().await {
        tracing::warn!(error = %e, "starting without the store");
    }

    // Login: 5 failed attempts per 15 minutes
    let login_routes = Router::new()
        .route("/api/login", post(login))
        .layer(RateLimitLayer::new(
            connector.rate_limiter(),
            RateLimitConfig::new(15 * 60 * 1000, 5)
                .message("Too many login attempts, please try again later.")
                .skip_successful_requests(true),
        ));

    // Everything else: 100 requests per minute
    let api_routes = Router::new()
        .route("/api/assessments/{id}", get(get_assessment))
        .route("/api/sessions/{id}", get(whoami))
        .layer(RateLimitLayer::new(
            connector.rate_limiter(),
            RateLimitConfig::new(60_000, 100),
        ));

    let app = login_routes
        .merge(api_routes)
        .with_state(connector.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    connector.shutdown().await;
    Ok(())
}
