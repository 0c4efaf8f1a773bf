//! HTTP admin API: a thin CRUD wrapper over the token registry.
//!
//! Runs on its own listener, gated by the `X-API-Key` header. Endpoints:
//! `POST /api/token/`, `DELETE /api/token/{token}`, `GET /api/status`.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use wssocks_core::error::{Result, WssocksError};

use crate::server::WsSocksServer;
use crate::tokens::ReverseTokenOptions;

#[derive(Clone)]
struct ApiState {
    server: Arc<WsSocksServer>,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TokenResponse {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            token: None,
            port: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct TokenStatusEntry {
    token: String,
    #[serde(rename = "type")]
    kind: &'static str,
    clients_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: &'static str,
    tokens: Vec<TokenStatusEntry>,
}

/// Build the admin router.
pub fn router(server: Arc<WsSocksServer>, api_key: String) -> Router {
    let state = ApiState { server, api_key };
    Router::new()
        .route("/api/token/", post(create_token))
        .route("/api/token/:token", delete(delete_token))
        .route("/api/status", get(status))
        .with_state(state)
}

/// Bind and serve the admin API.
pub async fn serve_api(
    server: Arc<WsSocksServer>,
    host: &str,
    port: u16,
    api_key: String,
) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| WssocksError::Alloc(format!("api bind {addr}: {e}")))?;
    info!(addr = %addr, "admin api started");
    axum::serve(listener, router(server, api_key))
        .await
        .map_err(|e| WssocksError::Transport(format!("api serve: {e}")))
}

fn check_key(state: &ApiState, headers: &HeaderMap) -> std::result::Result<(), Response> {
    let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if provided != Some(state.api_key.as_str()) {
        warn!("admin api request with invalid key");
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(TokenResponse::failure("invalid API key")),
        )
            .into_response());
    }
    Ok(())
}

async fn create_token(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: std::result::Result<Json<TokenRequest>, JsonRejection>,
) -> Response {
    if let Err(resp) = check_key(&state, &headers) {
        return resp;
    }
    let Json(req) = match body {
        Ok(body) => body,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(TokenResponse::failure("invalid request body")),
            )
                .into_response();
        }
    };

    match req.kind.as_str() {
        "forward" => {
            let token = state.server.add_forward_token(req.token);
            Json(TokenResponse {
                success: true,
                token: Some(token),
                port: None,
                error: None,
            })
            .into_response()
        }
        "reverse" => {
            let opts = ReverseTokenOptions {
                token: req.token,
                port: req.port.unwrap_or(0),
                username: req.username,
                password: req.password,
            };
            match state.server.add_reverse_token(opts).await {
                Ok((token, port)) => Json(TokenResponse {
                    success: true,
                    token: Some(token),
                    port: Some(port),
                    error: None,
                })
                .into_response(),
                Err(e) => {
                    warn!(error = %e, "reverse token allocation failed");
                    Json(TokenResponse::failure("failed to allocate port")).into_response()
                }
            }
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(TokenResponse::failure("invalid token type")),
        )
            .into_response(),
    }
}

async fn delete_token(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Response {
    if let Err(resp) = check_key(&state, &headers) {
        return resp;
    }
    let success = state.server.remove_token(&token).await;
    Json(TokenResponse {
        success,
        token: Some(token),
        port: None,
        error: None,
    })
    .into_response()
}

async fn status(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_key(&state, &headers) {
        return resp;
    }
    let tokens = state
        .server
        .status()
        .into_iter()
        .map(|s| TokenStatusEntry {
            token: s.token,
            kind: s.kind.as_str(),
            clients_count: s.clients_count,
            port: s.port,
        })
        .collect();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        tokens,
    })
    .into_response()
}
