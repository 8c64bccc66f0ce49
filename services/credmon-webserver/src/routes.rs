//! HTTP routes for the credential issuance flow
//!
//! - `GET /key/{key}` starts a session for a key file and sets the cookie
//! - `GET /login/{provider}` redirects to the provider's authorization page
//! - `GET /return/{provider}` completes the flow and redirects to `/`
//! - `GET /` reports the session's per-provider status
//! - `GET /health`, `GET /metrics`

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use credmon_session::{OAuthFlow, SessionRecord};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;

use crate::error::ApiError;

/// Cookie carrying the opaque session id.
pub const SESSION_COOKIE: &str = "credmon_session";

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub flow: Arc<OAuthFlow>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(flow: Arc<OAuthFlow>, prometheus: PrometheusHandle) -> Self {
        Self {
            flow,
            prometheus,
            started_at: Instant::now(),
        }
    }
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` bounds concurrent in-flight requests.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/key/{key}", get(key_handler))
        .route("/login/{provider}", get(login_handler))
        .route("/return/{provider}", get(return_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Session id from the request cookies, if present.
fn session_id(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE)
        .map(|c| c.value_trimmed())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn require_session(jar: &CookieJar) -> Result<String, ApiError> {
    session_id(jar).ok_or(ApiError::NoSession)
}

/// `HttpOnly`, `Secure`, `SameSite=Lax` cookie scoped to the whole site.
fn session_cookie(id: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, id))
        .path("/")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .build()
}

/// Reconstruct the absolute URL the provider redirected the browser to.
fn callback_url(headers: &HeaderMap, uri: &Uri) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .unwrap_or("localhost");
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("{scheme}://{host}{path}")
}

fn status_body(id: &str, record: &SessionRecord) -> serde_json::Value {
    serde_json::json!({
        "session": id,
        "local_username": record.local_username,
        "logged_in": record.logged_in,
        "providers": record.providers,
    })
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Start a session for the key file named by `key`.
async fn key_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    jar: CookieJar,
) -> Result<(CookieJar, Response), ApiError> {
    let key_path =
        credmon_auth::resolve_key_path(&state.flow.settings().credential_dir, &key).await?;
    let (id, record) = state.flow.store().create_session(&key_path).await?;

    let body = json_response(StatusCode::OK, status_body(&id, &record));
    Ok((jar.add(session_cookie(id)), body))
}

/// Redirect the browser to the provider's authorization page.
async fn login_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    jar: CookieJar,
) -> Result<Redirect, ApiError> {
    let id = require_session(&jar)?;
    let url = state.flow.begin_authorization(&id, &provider).await?;
    Ok(Redirect::to(&url))
}

/// Provider callback: verify, exchange, persist, then back to the index.
async fn return_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    jar: CookieJar,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Redirect, ApiError> {
    let id = require_session(&jar)?;
    let url = callback_url(&headers, &uri);
    let completion = state
        .flow
        .complete_authorization(&id, &provider, &url)
        .await?;
    info!(
        provider = %completion.provider,
        access = %completion.paths.access.display(),
        "credentials stored"
    );
    Ok(Redirect::to("/"))
}

/// Per-provider login status for the caller's session.
async fn status_handler(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Response, ApiError> {
    let id = require_session(&jar)?;
    let record = state.flow.store().get_session(&id).await?;
    Ok(json_response(StatusCode::OK, status_body(&id, &record)))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.flow.store().len().await;
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "sessions": sessions,
        }),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
