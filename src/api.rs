// HTTP surface: bulk orders, progress polling, compositing and operations

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::{Sink, SinkExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::config::Config;
use crate::core::errors::{CompositorError, OrchestratorError, PromptError, StoreError};
use crate::core::types::{
    BatchTaskState, BulkLineItem, ImageSource, Order, Organization, PlacementGeometry, PrintFlow,
    Product,
};
use crate::orchestration::BulkOrchestrator;
use crate::services::compositor::Compositor;
use crate::services::store::{OrderStore, OrganizationStore};
use crate::utils::{decode_base64_padded, Metrics};

type ApiError = (StatusCode, String);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<BulkOrchestrator>,
    pub compositor: Arc<Compositor>,
    pub orders: Arc<dyn OrderStore>,
    pub organizations: Arc<dyn OrganizationStore>,
    pub metrics: Metrics,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/bulk-order", post(bulk_order))
        .route("/progress/:task_id", get(progress_snapshot))
        .route("/ws/progress/:task_id", get(progress_ws))
        .route("/composite", post(composite))
        .route("/preview", post(preview))
        .route("/orders/:order_id", get(get_order))
        .route(
            "/organizations/:org_id",
            get(get_organization).put(put_organization),
        )
        .with_state(state)
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024))
}

#[derive(Debug, Deserialize)]
pub struct BulkOrderRequest {
    pub file: Vec<BulkLineItem>,
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(rename = "numImages", default)]
    pub num_images: i64,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BulkOrderResponse {
    pub task_id: String,
    pub items: Vec<BulkLineItem>,
    pub progress: BatchTaskState,
}

#[derive(Debug, Deserialize)]
pub struct CompositeRequest {
    /// Data URI or URL of the source image
    pub image: String,
    /// Base64 mask PNG; the configured default mask when absent
    #[serde(default)]
    pub mask: Option<String>,
    pub output_id: String,
    #[serde(default)]
    pub flow: PrintFlow,
}

#[derive(Debug, Serialize)]
pub struct CompositeResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub pattern: String,
    pub base_garment: String,
    pub geometry: PlacementGeometry,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub data_url: Option<String>,
}

/// Organization body; the id comes from the path
#[derive(Debug, Deserialize)]
pub struct OrganizationRequest {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub products: Vec<Product>,
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "active_tasks": state.orchestrator.registry().len(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Run a bulk batch to completion and return the updated line items.
///
/// # Errors:
/// - 403 when a bulk-order password is configured and does not match
/// - 400 for an empty file, no prompts, or `numImages <= 0`
/// - 409 when `task_id` is already running
/// - 502 when generation or prompt expansion gave out
async fn bulk_order(
    State(state): State<AppState>,
    Json(request): Json<BulkOrderRequest>,
) -> Result<Json<BulkOrderResponse>, ApiError> {
    state.metrics.record_endpoint_request("/bulk-order");
    check_password(&state, request.password.as_deref())?;

    if request.num_images <= 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "numImages must be greater than 0".to_string(),
        ));
    }

    let themes: Vec<String> = request
        .prompts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if themes.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No prompts provided".to_string()));
    }
    if request.file.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No line items provided".to_string()));
    }

    let task_id = request
        .task_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(
        "Bulk order {}: {} items, {} themes",
        task_id,
        request.file.len(),
        themes.len()
    );

    let report = state
        .orchestrator
        .run_bulk_batch(request.file, themes, &task_id)
        .await
        .map_err(|e| {
            error!("Bulk order {} failed: {}", task_id, e);
            (orchestrator_status(&e), e.to_string())
        })?;

    Ok(Json(BulkOrderResponse {
        task_id,
        items: report.items,
        progress: report.progress,
    }))
}

/// Admin password gate shared by bulk orders and organization writes
fn check_password(state: &AppState, given: Option<&str>) -> Result<(), ApiError> {
    match &state.config.server.bulk_order_password {
        Some(expected) if given != Some(expected.as_str()) => {
            warn!("Request rejected: bad password");
            Err((StatusCode::FORBIDDEN, "Invalid password".to_string()))
        }
        _ => Ok(()),
    }
}

fn orchestrator_status(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::EmptyBatch
        | OrchestratorError::PromptExpansion(PromptError::NoThemes) => StatusCode::BAD_REQUEST,
        OrchestratorError::DuplicateTask(_) => StatusCode::CONFLICT,
        OrchestratorError::RetryBudgetExceeded { .. } | OrchestratorError::PromptExpansion(_) => {
            StatusCode::BAD_GATEWAY
        }
        OrchestratorError::Persistence { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn progress_snapshot(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BatchTaskState>, ApiError> {
    state
        .orchestrator
        .get_progress(&task_id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("No running task {}", task_id)))
}

async fn progress_ws(
    ws: WebSocketUpgrade,
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    state.metrics.record_endpoint_request("/ws/progress");
    let orchestrator = state.orchestrator.clone();
    let interval = state.config.progress_interval();
    ws.on_upgrade(move |socket: WebSocket| {
        stream_progress(socket, orchestrator, interval, task_id)
    })
}

/// Push the task state every interval until the task is gone, then close.
async fn stream_progress<S>(
    mut socket: S,
    orchestrator: Arc<BulkOrchestrator>,
    interval: Duration,
    task_id: String,
) where
    S: Sink<Message> + Unpin,
{
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;
        let Some(progress) = orchestrator.get_progress(&task_id) else {
            break;
        };

        let payload = match serde_json::to_string(&progress) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize progress for {}: {}", task_id, e);
                break;
            }
        };
        if socket.send(Message::Text(payload)).await.is_err() {
            debug!("Progress client for {} disconnected", task_id);
            return;
        }
    }

    debug!("Task {} finished, closing progress channel", task_id);
    let _ = socket.send(Message::Close(None)).await;
}

async fn composite(
    State(state): State<AppState>,
    Json(request): Json<CompositeRequest>,
) -> Result<Json<CompositeResponse>, ApiError> {
    state.metrics.record_endpoint_request("/composite");

    let mask = match &request.mask {
        Some(encoded) => decode_base64_padded(encoded)
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?,
        None => {
            let path = &state.config.composite.default_mask_path;
            tokio::fs::read(path).await.map_err(|e| {
                error!("Default mask {} unreadable: {}", path.display(), e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Default mask unavailable".to_string(),
                )
            })?
        }
    };

    let url = state
        .compositor
        .composite_and_key(
            &ImageSource::from_reference(&request.image),
            Arc::new(mask),
            &request.output_id,
            request.flow,
        )
        .await
        .map_err(|e| (compositor_status(&e), e.to_string()))?;

    Ok(Json(CompositeResponse { url }))
}

fn compositor_status(err: &CompositorError) -> StatusCode {
    match err {
        CompositorError::Decode(_) | CompositorError::Geometry { .. } => StatusCode::BAD_REQUEST,
        CompositorError::SourceFetch(_) | CompositorError::Storage(_) => StatusCode::BAD_GATEWAY,
        CompositorError::Encode(_) | CompositorError::Io(_) | CompositorError::TaskJoin(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::Conflict { .. } => StatusCode::CONFLICT,
        StoreError::SeedFormat(_) => StatusCode::BAD_REQUEST,
        StoreError::Backend(_) | StoreError::SeedIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn get_order(
    Path(order_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Order>, ApiError> {
    state.metrics.record_endpoint_request("/orders");
    state
        .orders
        .get_order(&order_id)
        .await
        .map(Json)
        .map_err(|e| (store_status(&e), e.to_string()))
}

async fn get_organization(
    Path(org_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Organization>, ApiError> {
    state.metrics.record_endpoint_request("/organizations");
    match state.organizations.get_organization(&org_id).await {
        Ok(Some(organization)) => Ok(Json(organization)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            format!("No organization {}", org_id),
        )),
        Err(e) => Err((store_status(&e), e.to_string())),
    }
}

/// Create or replace an organization and its product catalog.
async fn put_organization(
    Path(org_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<OrganizationRequest>,
) -> Result<Json<Organization>, ApiError> {
    state.metrics.record_endpoint_request("/organizations");
    check_password(&state, request.password.as_deref())?;

    let organization = Organization {
        org_id,
        name: request.name,
        products: request.products,
    };
    state
        .organizations
        .upsert_organization(organization.clone())
        .await
        .map_err(|e| (store_status(&e), e.to_string()))?;

    info!(
        "Organization {} stored with {} products",
        organization.org_id,
        organization.products.len()
    );
    Ok(Json(organization))
}

/// Always 200; `data_url` is null when no preview could be built.
async fn preview(
    State(state): State<AppState>,
    Json(request): Json<PreviewRequest>,
) -> Json<PreviewResponse> {
    state.metrics.record_endpoint_request("/preview");

    let data_url = state
        .compositor
        .place_pattern(
            &ImageSource::from_reference(&request.pattern),
            &request.base_garment,
            &request.geometry,
        )
        .await;
    Json(PreviewResponse { data_url })
}
