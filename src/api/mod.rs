//! HTTP surface: REST routers under `/apis/v1`, the OAuth2-shaped token
//! endpoint and the bearer-token middleware in front of everything else.

pub mod bangumis;
pub mod config;
pub mod logs;
pub mod magnets;
pub mod meta;
pub mod subtitle;
pub mod torrents;
pub mod utils;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{post, put};
use axum::{Form, Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::AuthService;
use crate::config::{ConfigRepo, EnvConfig};
use crate::db::TorrentRepository;
use crate::downloader::DownloadManager;
use crate::error::{Error, Result};
use crate::magnet::MagnetManager;
use crate::meta::TmdbClient;
use crate::subscriber::Subscriber;
use crate::subtitle::AssSubsetter;
use crate::transfer::TransferEngine;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub env: EnvConfig,
    pub config_repo: Arc<ConfigRepo>,
    pub auth: Arc<AuthService>,
    pub subscriber: Arc<Subscriber>,
    pub manager: Arc<DownloadManager>,
    pub torrents: TorrentRepository,
    pub magnet: Arc<MagnetManager>,
    pub transfer: Arc<TransferEngine>,
    pub meta: Arc<TmdbClient>,
    pub subsetter: Arc<AssSubsetter>,
}

/// Assembles the full application router.
pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/user", put(update_user))
        .merge(config::router())
        .merge(bangumis::router())
        .merge(torrents::router())
        .merge(magnets::router())
        .merge(meta::router())
        .merge(logs::router())
        .merge(subtitle::router())
        .merge(utils::router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            check_token,
        ));

    Router::new()
        .nest(
            "/apis/v1",
            Router::new().route("/token", post(token)).merge(authed),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn bearer_token(request: &Request) -> String {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string()
}

async fn check_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(err) = state.auth.check_access_token(&bearer_token(&request)) {
        return err.into_response();
    }
    next.run(request).await
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    #[serde(default)]
    grant_type: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    refresh_token: String,
}

#[derive(serde::Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    refresh_token: String,
}

#[derive(serde::Serialize)]
struct TokenError {
    error: &'static str,
    error_description: String,
}

fn oauth2_error(err: Error) -> Response {
    let status = err.status_code();
    let error = match status {
        StatusCode::BAD_REQUEST => "invalid_request",
        StatusCode::UNAUTHORIZED => "invalid_grant",
        _ => "server_error",
    };
    (
        status,
        Json(TokenError {
            error,
            error_description: err.to_string(),
        }),
    )
        .into_response()
}

/// POST /apis/v1/token — the only endpoint outside the bearer check.
async fn token(State(state): State<AppState>, Form(req): Form<TokenRequest>) -> Response {
    let credentials = match req.grant_type.as_str() {
        "password" => state.auth.authorize(&req.username, &req.password),
        "refresh_token" => state.auth.refresh_credentials(&req.refresh_token),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(TokenError {
                    error: "unsupported_response_type",
                    error_description: "unsupported grant type".to_string(),
                }),
            )
                .into_response()
        }
    };
    match credentials {
        Ok(credentials) => Json(TokenResponse {
            access_token: credentials.access_token,
            token_type: "Bearer",
            refresh_token: credentials.refresh_token,
        })
        .into_response(),
        Err(err) => oauth2_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateUserRequest {
    username: String,
    password: String,
}

async fn update_user(
    State(state): State<AppState>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<StatusCode> {
    state.auth.update_user(&req.username, &req.password)?;
    Ok(StatusCode::OK)
}
