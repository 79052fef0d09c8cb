//! Gateway server: axum routes over the debug service

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};

use mender_core::config::GatewayConfig;
use mender_core::{Attempt, DebugService, Language, SessionSummary};

use crate::protocol::{
    ApiError, CodeRequest, DebugResponse, ExecuteResponse, HealthResponse, RetryRequest,
};

#[derive(Clone)]
struct AppState {
    service: Arc<DebugService>,
}

/// HTTP server for the debug service
pub struct GatewayServer {
    service: Arc<DebugService>,
    config: GatewayConfig,
}

impl GatewayServer {
    pub fn new(service: Arc<DebugService>) -> Self {
        let config = service.config().gateway.clone();
        Self { service, config }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            service: self.service.clone(),
        };

        let router = Router::new()
            .route("/", get(root))
            .route("/health", get(health))
            .route("/api/execute", post(execute))
            .route("/api/debug", post(debug_code))
            .route("/api/auto-retry", post(auto_retry))
            .route("/api/sessions", get(list_sessions).post(create_session))
            .route("/api/sessions/{id}", get(get_session).delete(delete_session))
            .route("/api/sessions/{id}/attempts", post(step_session))
            .with_state(state);

        match self.cors_layer() {
            Some(cors) => router.layer(cors),
            None => router,
        }
    }

    fn cors_layer(&self) -> Option<CorsLayer> {
        if self.config.cors_origins.is_empty() {
            return None;
        }
        let origin = if self.config.cors_origins.iter().any(|o| o == "*") {
            AllowOrigin::any()
        } else {
            let origins: Vec<HeaderValue> = self
                .config
                .cors_origins
                .iter()
                .filter_map(|o| match HeaderValue::from_str(o) {
                    Ok(v) => Some(v),
                    Err(_) => {
                        warn!("Ignoring invalid CORS origin '{}'", o);
                        None
                    }
                })
                .collect();
            AllowOrigin::list(origins)
        };
        Some(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already-bound listener
    pub async fn serve_on(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr().context("Listener has no local address")?;
        info!("Gateway listening on http://{}", local);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("Gateway server failed")?;

        info!("Gateway stopped");
        Ok(())
    }
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "mender backend running" }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let orchestrator = state.service.orchestrator();
    let fixer = orchestrator.fixer();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        languages: Language::ALL.iter().map(|l| l.to_string()).collect(),
        active_sessions: orchestrator.registry().count().await,
        session_capacity: orchestrator.registry().capacity(),
        on_no_fix: orchestrator.no_fix_policy(),
        primary_provider: fixer.primary().label(),
        fallback_provider: fixer.fallback().map(|f| f.label()),
    })
}

async fn execute(
    State(state): State<AppState>,
    Json(req): Json<CodeRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    debug!("POST /api/execute ({})", req.language);
    let result = state.service.execute(&req.language, &req.code).await?;
    Ok(Json(ExecuteResponse {
        message: "Execution completed".to_string(),
        result,
    }))
}

async fn debug_code(
    State(state): State<AppState>,
    Json(req): Json<CodeRequest>,
) -> Result<Json<DebugResponse>, ApiError> {
    debug!("POST /api/debug ({})", req.language);
    let report = state.service.debug_once(&req.language, &req.code).await?;
    Ok(Json(report.into()))
}

/// Runs the whole loop in its own task. If the client goes away the drop
/// guard cancels the session, which stops at the next attempt boundary.
async fn auto_retry(
    State(state): State<AppState>,
    Json(req): Json<RetryRequest>,
) -> Result<Json<SessionSummary>, ApiError> {
    debug!("POST /api/auto-retry ({})", req.language);
    let cancel = CancellationToken::new();
    let _abandon = cancel.clone().drop_guard();

    let service = state.service.clone();
    let summary = tokio::spawn(async move {
        service
            .run_session_with_cancel(&req.language, &req.code, req.max_attempts, cancel)
            .await
    })
    .await
    .map_err(|e| ApiError::internal(format!("retry task failed: {}", e)))??;

    Ok(Json(summary))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.service.list_sessions().await)
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<RetryRequest>,
) -> Result<(StatusCode, Json<SessionSummary>), ApiError> {
    let summary = state
        .service
        .start_session(&req.language, &req.code, req.max_attempts)
        .await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    Ok(Json(state.service.session(&id).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    Ok(Json(state.service.delete_session(&id).await?))
}

async fn step_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Attempt>, ApiError> {
    Ok(Json(state.service.step(&id).await?))
}
