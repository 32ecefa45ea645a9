// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API server
//!
//! HTTP boundary for the download manager. Every `/v1` route resolves the
//! caller from `Authorization: Bearer <token>` and only ever sees that
//! caller's jobs.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /v1/downloads` - Create a download job
//! - `GET /v1/downloads` - List the caller's jobs
//! - `GET /v1/downloads/:id` - Full job record (`?statusOnly=true` for status only)
//! - `DELETE /v1/downloads/:id` - Cancel and remove a job
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tapedeck::download::{DownloadManager, ManagerConfig, MemoryJobStore, StoreLimits};
//! use tapedeck::security::TokenResolver;
//! use tapedeck::server::Server;
//! use tapedeck::transfer::{HttpTransferWorker, TransferSettings};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(MemoryJobStore::new(StoreLimits::default()));
//! let worker = Arc::new(HttpTransferWorker::new(TransferSettings::default())?);
//! let manager = Arc::new(DownloadManager::new(store, worker, ManagerConfig::default()));
//!
//! let server = Server::new(8787, manager, Arc::new(TokenResolver::default()));
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, FromRequestParts, Path, Query, State,
    },
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer};
use tower_http::timeout::TimeoutLayer;

use crate::download::{DownloadManager, JobDetails, JobError, JobId, OwnerId};
use crate::errors::{ApiResult, UserError};
use crate::security::{bearer_token, IdentityResolver};

/// Maximum request body size (16KB). Create requests are tiny.
pub const MAX_BODY_SIZE: usize = 16 * 1024;

/// Longest id string echoed into logs.
const MAX_LOGGED_ID_LEN: usize = 32;

/// Server state shared across handlers.
pub struct AppState {
    /// Download façade
    pub manager: Arc<DownloadManager>,
    /// Credential to identity mapping
    pub resolver: Arc<dyn IdentityResolver>,
}

/// Request limits applied as middleware.
#[derive(Debug, Clone, Copy)]
pub struct ServerLimits {
    /// Sustained requests per second per client IP
    pub rate_limit_per_second: u64,
    /// Burst allowance per client IP
    pub rate_limit_burst: u32,
    /// Requests taking longer are answered with 408
    pub request_timeout: Duration,
    /// Largest accepted request body
    pub max_body_size: usize,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            rate_limit_per_second: 1,
            rate_limit_burst: 60,
            request_timeout: Duration::from_secs(30),
            max_body_size: MAX_BODY_SIZE,
        }
    }
}

/// API server configuration.
pub struct Server {
    /// Port to listen on.
    port: u16,
    /// Address to bind to (defaults to 127.0.0.1 for security).
    bind_address: String,
    limits: ServerLimits,
    manager: Arc<DownloadManager>,
    resolver: Arc<dyn IdentityResolver>,
}

impl Server {
    /// Create a new server with the specified port.
    /// By default, binds to 127.0.0.1 (localhost only) for security.
    pub fn new(port: u16, manager: Arc<DownloadManager>, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            port,
            bind_address: "127.0.0.1".to_string(),
            limits: ServerLimits::default(),
            manager,
            resolver,
        }
    }

    /// Set the bind address.
    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Set request limits.
    pub fn with_limits(mut self, limits: ServerLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Build the router with all routes.
    pub fn build_router(&self) -> Result<Router> {
        let state = Arc::new(AppState {
            manager: Arc::clone(&self.manager),
            resolver: Arc::clone(&self.resolver),
        });

        let governor_conf = GovernorConfigBuilder::default()
            .per_second(self.limits.rate_limit_per_second.max(1))
            .burst_size(self.limits.rate_limit_burst.max(1))
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limit configuration"))?;

        Ok(Router::new()
            .route("/health", get(health_handler))
            .route("/v1/downloads", get(list_handler).post(create_handler))
            .route("/v1/downloads/:id", get(get_handler).delete(delete_handler))
            .layer(DefaultBodyLimit::max(self.limits.max_body_size))
            .layer(TimeoutLayer::new(self.limits.request_timeout))
            .layer(GovernorLayer {
                config: Arc::new(governor_conf),
            })
            .with_state(state))
    }

    /// Start the server with graceful shutdown on SIGINT/SIGTERM.
    pub async fn start(&self) -> Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.port);

        tracing::info!("Starting server on {}", addr);

        // Security warning if binding to all interfaces
        if self.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. \
                    This usually means another tapedeck server is running. \
                    Try stopping other instances or use a different port with: tapedeck serve --port <PORT>",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// Every running transfer is signaled to stop once shutdown begins.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router()?;
        let manager = Arc::clone(&self.manager);

        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                shutdown.await;
                manager.shutdown();
            })
            .await?;

        tracing::info!("Server stopped");
        Ok(())
    }

    /// Get the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

// =============================================================================
// Identity and parameters
// =============================================================================

/// The resolved identity of the caller.
#[derive(Debug, Clone)]
pub struct CallerIdentity(pub OwnerId);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for CallerIdentity {
    type Rejection = UserError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let credential = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
            .ok_or_else(|| UserError::authentication_required(Some("missing bearer credential")))?;

        state
            .resolver
            .resolve(credential)
            .map(CallerIdentity)
            .ok_or_else(|| UserError::authentication_required(Some("unrecognized credential")))
    }
}

/// Parse a job id from a path segment.
///
/// Only plain ASCII decimal digits that fit a [`JobId`] are accepted; signs,
/// whitespace and exponents are rejected.
pub fn parse_job_id(raw: &str) -> Result<JobId, JobError> {
    let invalid = || JobError::InvalidId(raw.chars().take(MAX_LOGGED_ID_LEN).collect());
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    raw.parse::<JobId>().map_err(|_| invalid())
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    active_transfers: usize,
}

/// Create request body.
#[derive(Deserialize)]
struct CreateDownloadRequest {
    media_ref: String,
}

/// Query parameters for a single-job read.
#[derive(Deserialize, Default)]
struct GetDownloadParams {
    #[serde(rename = "statusOnly", default)]
    status_only: bool,
}

/// Jobs list response.
#[derive(Serialize)]
struct ListResponse {
    downloads: Vec<JobDetails>,
}

/// Cancel response.
#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
    message: String,
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_transfers: state.manager.active_transfers(),
    })
}

/// Create a download job for the caller.
async fn create_handler(
    State(state): State<Arc<AppState>>,
    CallerIdentity(owner): CallerIdentity,
    body: Result<Json<CreateDownloadRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<JobDetails>)> {
    let Json(request) = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            UserError::payload_too_large(MAX_BODY_SIZE as u64)
        } else {
            UserError::invalid_request(
                "Request body must be a JSON object with a media_ref string.",
                Some("media_ref"),
                Some(&rejection.body_text()),
            )
        }
    })?;

    let manager = Arc::clone(&state.manager);
    let job = run_blocking(move || manager.create(&owner, &request.media_ref)).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// List every job of the caller.
async fn list_handler(
    State(state): State<Arc<AppState>>,
    CallerIdentity(owner): CallerIdentity,
) -> ApiResult<Json<ListResponse>> {
    let downloads = state.manager.list_all(&owner)?;
    Ok(Json(ListResponse { downloads }))
}

/// Read one job, either in full or as a status projection.
async fn get_handler(
    State(state): State<Arc<AppState>>,
    CallerIdentity(owner): CallerIdentity,
    Path(raw_id): Path<String>,
    params: Result<Query<GetDownloadParams>, QueryRejection>,
) -> ApiResult<Response> {
    let id = parse_job_id(&raw_id)?;
    let Query(params) = params.map_err(|rejection| {
        UserError::invalid_request(
            "statusOnly must be true or false.",
            Some("statusOnly"),
            Some(&rejection.body_text()),
        )
    })?;

    if params.status_only {
        Ok(Json(state.manager.get_status(&owner, id)?).into_response())
    } else {
        Ok(Json(state.manager.get_full(&owner, id)?).into_response())
    }
}

/// Cancel and remove one job.
async fn delete_handler(
    State(state): State<Arc<AppState>>,
    CallerIdentity(owner): CallerIdentity,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    let id = parse_job_id(&raw_id)?;
    let manager = Arc::clone(&state.manager);
    run_blocking(move || manager.cancel(&owner, id)).await?;
    Ok(Json(DeleteResponse {
        success: true,
        message: format!("Download {} canceled", id),
    }))
}

/// Run a manager call that may write job state to disk on the blocking pool.
async fn run_blocking<T, F>(call: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T, JobError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => Ok(result?),
        Err(e) => Err(UserError::internal_error(&format!("Blocking task failed: {}", e))),
    }
}

/// Graceful shutdown signal handler.
///
/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    // On Unix, listen for SIGINT and SIGTERM
    // On Windows, fall back to Ctrl+C only
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                    }
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Failed to install signal handlers: {}, falling back to Ctrl+C", e);
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{ManagerConfig, MemoryJobStore, StoreLimits, TransferJob, TransferWorker};
    use crate::security::{TokenGrant, TokenResolver};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    struct IdleWorker;

    impl TransferWorker for IdleWorker {
        fn start(&self, _job: TransferJob) {}
    }

    fn test_server() -> Server {
        let store = Arc::new(MemoryJobStore::new(StoreLimits::default()));
        let manager = Arc::new(DownloadManager::new(store, Arc::new(IdleWorker), ManagerConfig::default()));
        let resolver = Arc::new(TokenResolver::new(vec![
            TokenGrant { token: "token-a".into(), owner_id: "42".into() },
            TokenGrant { token: "token-b".into(), owner_id: "7".into() },
        ]));
        Server::new(0, manager, resolver).with_limits(ServerLimits {
            rate_limit_burst: 1000,
            ..ServerLimits::default()
        })
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-forwarded-for", "127.0.0.1");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id("1"), Ok(1));
        assert_eq!(parse_job_id("0042"), Ok(42));
        for bad in ["", "abc", "-1", "+1", " 1", "1.0", "1e3", "99999999999999999999999"] {
            assert!(matches!(parse_job_id(bad), Err(JobError::InvalidId(_))), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(3000, test_server().manager, Arc::new(TokenResolver::default()));
        assert_eq!(server.port(), 3000);
        assert_eq!(server.bind_address, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_health_needs_no_identity() {
        let router = test_server().build_router().unwrap();
        let (status, body) = send(&router, request("GET", "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_or_unknown_credential_is_401() {
        let router = test_server().build_router().unwrap();
        let (status, body) = send(&router, request("GET", "/v1/downloads", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["error_type"], "authentication_required");

        let (status, _) = send(&router, request("GET", "/v1/downloads/1", Some("nope"), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let router = test_server().build_router().unwrap();
        let (status, body) = send(
            &router,
            request("POST", "/v1/downloads", Some("token-a"), Some(r#"{"media_ref":"song-7"}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], 1);
        assert_eq!(body["status"], "queued");
        assert_eq!(body["status_display"], "Waiting in queue");

        let (status, body) = send(&router, request("GET", "/v1/downloads/1?statusOnly=true", Some("token-a"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "queued");
        assert_eq!(body["progress"], 0);
        assert!(body.get("media_ref").is_none());

        let (status, body) = send(&router, request("GET", "/v1/downloads/1", Some("token-a"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["media_ref"], "song-7");
        assert_eq!(body["owner_id"], "42");
    }

    #[tokio::test]
    async fn test_bad_inputs_are_400() {
        let router = test_server().build_router().unwrap();
        let (status, body) = send(&router, request("GET", "/v1/downloads/abc", Some("token-a"), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["field"], "id");

        let (status, _) = send(&router, request("DELETE", "/v1/downloads/-3", Some("token-a"), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &router,
            request("POST", "/v1/downloads", Some("token-a"), Some(r#"{"media_ref":"../etc"}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&router, request("POST", "/v1/downloads", Some("token-a"), Some("not json"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_other_identity_gets_404() {
        let router = test_server().build_router().unwrap();
        send(
            &router,
            request("POST", "/v1/downloads", Some("token-a"), Some(r#"{"media_ref":"song-7"}"#)),
        )
        .await;

        let (status, _) = send(&router, request("GET", "/v1/downloads/1", Some("token-b"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&router, request("DELETE", "/v1/downloads/1", Some("token-b"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, body) = send(&router, request("GET", "/v1/downloads", Some("token-b"), None)).await;
        assert_eq!(body["downloads"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let router = test_server().build_router().unwrap();
        send(
            &router,
            request("POST", "/v1/downloads", Some("token-a"), Some(r#"{"media_ref":"song-7"}"#)),
        )
        .await;

        for _ in 0..2 {
            let (status, body) = send(&router, request("DELETE", "/v1/downloads/1", Some("token-a"), None)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["success"], true);
        }
        let (status, _) = send(&router, request("GET", "/v1/downloads/1", Some("token-a"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&router, request("DELETE", "/v1/downloads/9", Some("token-a"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
