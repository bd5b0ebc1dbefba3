use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::config::AppConfig;
use crate::error::CoreError;
use crate::orchestrator::{TurnOutcome, TurnRequest};
use crate::telemetry::sanitize_text;
use crate::tenant::{TenantHandle, TenantResourceManager, TenantStats};

/// Reply shown to the end user when a turn fails on infrastructure.
pub const APOLOGY: &str = "Sorry, I encountered an error processing your message. Please try again.";

/// Build the router. Split from [`start_server`] so tests can drive it.
pub fn router(state: AppState) -> Router {
    let timeout = state.request_timeout;

    Router::new()
        .route("/health", get(health))
        .route("/v1/tenants", get(list_tenants))
        .route("/v1/turns", post(process_turn))
        .route("/v1/admin/reload", post(reload_tenants))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(axum::middleware::from_fn(move |req: Request, next: Next| async move {
            match tokio::time::timeout(timeout, next.run(req)).await {
                Ok(res) => res,
                Err(_) => (StatusCode::REQUEST_TIMEOUT, "Request timed out").into_response(),
            }
        }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl-C, then release every tenant resource.
pub async fn start_server(config: Arc<AppConfig>, manager: TenantResourceManager) -> anyhow::Result<()> {
    let state = AppState {
        manager: manager.clone(),
        request_timeout: Duration::from_secs(config.server.request_timeout_secs),
    };
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    info!(name: "server.stopping", "Server stopping");
    manager.close().await?;
    Ok(())
}

/// Error body returned by every endpoint.
#[derive(Debug)]
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::EmbeddingFailed(_) | CoreError::CompletionFailed(_) => StatusCode::BAD_GATEWAY,
            CoreError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            CoreError::DuplicateCapability(_) | CoreError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = if self.0.is_infrastructure() {
            json!({ "error": self.0.to_string(), "reply": APOLOGY })
        } else {
            json!({ "error": self.0.to_string() })
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    tenants: TenantStats,
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        tenants: state.manager.stats().await,
    })
}

/// GET /v1/tenants
async fn list_tenants(State(state): State<AppState>) -> Json<Vec<TenantHandle>> {
    let tenants = state.manager.list_all().await;
    Json(tenants.iter().map(|t| TenantHandle::clone(t)).collect())
}

#[derive(Debug, Deserialize)]
pub struct TurnBody {
    pub routing_key: String,
    /// A fresh id is assigned when omitted.
    #[serde(default)]
    pub user_id: Option<Uuid>,
    pub text: String,
}

#[derive(Debug, Serialize)]
struct TurnResponse {
    tenant_id: String,
    user_id: Uuid,
    #[serde(flatten)]
    outcome: TurnOutcome,
}

/// POST /v1/turns
async fn process_turn(
    State(state): State<AppState>,
    Json(body): Json<TurnBody>,
) -> Result<Json<TurnResponse>, ApiError> {
    let tenant = state.manager.resolve(&body.routing_key).await?;
    let user_id = body.user_id.unwrap_or_else(Uuid::new_v4);
    tracing::debug!(
        tenant_id = %tenant.tenant_id,
        user_id = %user_id,
        text = %sanitize_text(&body.text),
        "turn received"
    );

    // The token fires if the request is dropped (client gone or timed out).
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let orchestrator = state.manager.build_orchestrator(&tenant.tenant_id).await?;
    let request = TurnRequest::new(tenant.tenant_id.clone(), user_id, body.text);
    let outcome = orchestrator.process_turn(&request, &cancel).await.map_err(|e| {
        warn!(tenant_id = %tenant.tenant_id, error = %e, "turn failed");
        ApiError::from(e)
    })?;

    Ok(Json(TurnResponse {
        tenant_id: tenant.tenant_id.clone(),
        user_id,
        outcome,
    }))
}

/// POST /v1/admin/reload
async fn reload_tenants(State(state): State<AppState>) -> Result<Json<TenantStats>, ApiError> {
    state.manager.reload().await?;
    Ok(Json(state.manager.stats().await))
}
