//! HTTP API Server
//!
//! REST API for follow management, follow stats, and the local indices.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::follow::{Coordinator, FollowParametersUpdate, PutFollowRequest, StatsSnapshot};
use crate::shard::{IndexMetadata, IndexSettings, LocalCluster, SeqNo};

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    /// Follow relationships of this node
    pub coordinator: Arc<Coordinator>,
    /// Indices hosted by this node
    pub cluster: Arc<LocalCluster>,
    pub started_at: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        config: ApiConfig,
        node_id: String,
        coordinator: Arc<Coordinator>,
        cluster: Arc<LocalCluster>,
    ) -> Self {
        let state = Arc::new(AppState {
            node_id,
            coordinator,
            cluster,
            started_at: Instant::now(),
        });

        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Self::create_router(Arc::clone(&self.state)).layer(TraceLayer::new_for_http());
        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            // Follow management
            .route("/:index/_follow", put(handle_put_follow))
            .route("/:index/_pause_follow", post(handle_pause_follow))
            .route("/:index/_resume_follow", post(handle_resume_follow))
            .route("/:index/_unfollow", post(handle_unfollow))
            // Stats
            .route("/_follow/stats", get(handle_stats))
            .route("/:index/_follow/stats", get(handle_index_stats))
            // Local indices
            .route("/:index", put(handle_create_index))
            .route("/:index/_doc", post(handle_index_document))
            .route("/:index/_doc/:id", delete(handle_delete_document))
            .route("/:index/_count", get(handle_count))
            .route("/health", get(handle_health))
            .with_state(state)
    }

    /// Serve until `shutdown` completes
    pub async fn start(&self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Acknowledgement of a follow command
#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub acknowledged: bool,
}

/// Put follow response
#[derive(Debug, Serialize, Deserialize)]
pub struct PutFollowResponse {
    pub follow_index_created: bool,
    pub follow_index_shards_acked: bool,
    pub index_following_started: bool,
}

/// Stats query parameters
#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// Comma separated follower index names
    pub indices: Option<String>,
}

/// Per-index follow stats
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexFollowStats {
    pub index: String,
    pub shards: Vec<StatsSnapshot>,
}

/// Follow stats response
#[derive(Debug, Serialize, Deserialize)]
pub struct FollowStatsResponse {
    pub indices: Vec<IndexFollowStats>,
}

/// Document write parameters
#[derive(Debug, Deserialize)]
pub struct DocumentQuery {
    pub id: Option<String>,
}

/// Document write response
#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentResponse {
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_shard")]
    pub shard: u32,
    #[serde(rename = "_seq_no")]
    pub seq_no: SeqNo,
    pub result: String,
}

/// Count response
#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub followers: usize,
    pub uptime_seconds: u64,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error wrapper mapping crate errors onto HTTP statuses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::IndexNotFound(_) | Error::FollowerNotFound(_) | Error::ShardNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            Error::IndexAlreadyExists(_)
            | Error::AlreadyFollowing(_)
            | Error::InvalidState { .. } => StatusCode::CONFLICT,
            Error::FollowerIndexReadOnly(_) => StatusCode::BAD_REQUEST,
            err => match err.kind() {
                ErrorKind::Precondition | ErrorKind::User => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: self.0.code().to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ============ Handlers ============

async fn handle_put_follow(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    Json(mut req): Json<PutFollowRequest>,
) -> ApiResult<PutFollowResponse> {
    req.follower_index = index;
    state.coordinator.put_follow(req).await?;
    Ok(Json(PutFollowResponse {
        follow_index_created: true,
        follow_index_shards_acked: true,
        index_following_started: true,
    }))
}

async fn handle_pause_follow(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
) -> ApiResult<AckResponse> {
    state.coordinator.pause_follow(&index).await?;
    Ok(Json(AckResponse { acknowledged: true }))
}

async fn handle_resume_follow(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    params: Option<Json<FollowParametersUpdate>>,
) -> ApiResult<AckResponse> {
    state
        .coordinator
        .resume_follow(&index, params.map(|Json(p)| p))
        .await?;
    Ok(Json(AckResponse { acknowledged: true }))
}

async fn handle_unfollow(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
) -> ApiResult<AckResponse> {
    state.coordinator.remove_follow(&index).await?;
    Ok(Json(AckResponse { acknowledged: true }))
}

async fn handle_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<FollowStatsResponse> {
    let filter: Vec<String> = query
        .indices
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect();

    let snapshots = state.coordinator.stats(Some(filter.as_slice())).await;
    Ok(Json(group_by_index(snapshots)))
}

async fn handle_index_stats(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
) -> ApiResult<FollowStatsResponse> {
    state.coordinator.follow_info(&index).await?;
    let snapshots = state
        .coordinator
        .stats(Some(std::slice::from_ref(&index)))
        .await;
    Ok(Json(group_by_index(snapshots)))
}

fn group_by_index(snapshots: Vec<StatsSnapshot>) -> FollowStatsResponse {
    let mut grouped: BTreeMap<String, Vec<StatsSnapshot>> = BTreeMap::new();
    for snapshot in snapshots {
        grouped
            .entry(snapshot.follower_index.clone())
            .or_default()
            .push(snapshot);
    }

    FollowStatsResponse {
        indices: grouped
            .into_iter()
            .map(|(index, mut shards)| {
                shards.sort_by_key(|s| s.shard_id);
                IndexFollowStats { index, shards }
            })
            .collect(),
    }
}

async fn handle_create_index(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    settings: Option<Json<IndexSettings>>,
) -> ApiResult<IndexMetadata> {
    let settings = settings.map(|Json(s)| s).unwrap_or_default();
    let metadata = state.cluster.create_index(&index, settings).await?;
    Ok(Json(metadata))
}

async fn handle_index_document(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    Query(query): Query<DocumentQuery>,
    Json(source): Json<serde_json::Value>,
) -> std::result::Result<(StatusCode, Json<DocumentResponse>), ApiError> {
    let id = query.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let (shard, seq_no) = state
        .cluster
        .index_document(&index, Some(id.clone()), source)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(DocumentResponse {
            index,
            id,
            shard: shard.shard,
            seq_no,
            result: "created".to_string(),
        }),
    ))
}

async fn handle_delete_document(
    State(state): State<Arc<AppState>>,
    Path((index, id)): Path<(String, String)>,
) -> ApiResult<DocumentResponse> {
    let (shard, seq_no) = state.cluster.delete_document(&index, &id).await?;
    Ok(Json(DocumentResponse {
        index,
        id,
        shard: shard.shard,
        seq_no,
        result: "deleted".to_string(),
    }))
}

async fn handle_count(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
) -> ApiResult<CountResponse> {
    let count = state.cluster.doc_count(&index).await?;
    Ok(Json(CountResponse { count }))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: state.node_id.clone(),
        followers: state.coordinator.follower_names().await.len(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}
