use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::extract::{Extension, Path};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{BoxError, Json, Router};
use prometheus::{Registry, TextEncoder};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::model::JobId;
use crate::settings::HttpServerSettings;
use crate::tracker::{AggregatorStatus, DomainInfo, DomainTracker, InstanceInfo, InstanceTracker, JobInfo, TrackerError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Read API failed to satisfy a request.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("failed to start streamscope API: {0}")]
    Bootstrap(#[from] hyper::Error),

    #[error("could not open or bind to a TCP address for the streamscope API: {0}")]
    Io(#[from] std::io::Error),

    #[error("failure in prometheus: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("{entity} is not tracked: {name}")]
    NotFound { entity: &'static str, name: String },

    #[error("refresh failed: {0}")]
    Refresh(String),

    #[error("refresh task failed to complete: {0}")]
    RefreshTask(#[from] tokio::task::JoinError),

    #[error("failed to signal API shutdown")]
    GracefulShutdown,
}

impl ApiError {
    fn not_found(entity: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound { entity, name: name.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error=?self, "failure in streamscope API");
        }

        (status, self.to_string()).into_response()
    }
}

/// Shared state behind every route. Fatal refresh failures are forwarded so the engine can stop.
#[derive(Debug, Clone)]
pub struct ApiState {
    tracker: Arc<DomainTracker>,
    registries: Vec<Registry>,
    tx_fatal: mpsc::UnboundedSender<TrackerError>,
    request_timeout: Duration,
}

impl ApiState {
    pub fn new(
        tracker: Arc<DomainTracker>, registries: Vec<Registry>, tx_fatal: mpsc::UnboundedSender<TrackerError>,
    ) -> Self {
        Self { tracker, registries, tx_fatal, request_timeout: REQUEST_TIMEOUT }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

pub type TxApiGracefulShutdown = oneshot::Sender<()>;
pub type ApiJoinHandle = JoinHandle<Result<(), ApiError>>;

pub fn api_router(state: ApiState) -> Router {
    let middleware_stack = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(handle_api_error))
        .timeout(state.request_timeout)
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
        .into_inner();

    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/domain", get(get_domain))
        .route("/instances", get(get_instances))
        .route("/instances/:instance", get(get_instance))
        .route("/instances/:instance/jobs", get(get_jobs))
        .route("/instances/:instance/jobs/:job_id", get(get_job))
        .route("/instances/:instance/jobs/:job_id/snapshot", get(get_job_snapshot))
        .route("/instances/:instance/jobs/:job_id/metrics", get(get_job_metrics))
        .route("/refresh", post(post_refresh))
        .layer(middleware_stack)
}

#[tracing::instrument(level = "trace", skip(state))]
pub fn run_http_server(
    state: ApiState, settings: &HttpServerSettings,
) -> Result<(ApiJoinHandle, TxApiGracefulShutdown), ApiError> {
    let app = api_router(state);
    let address = format!("{}:{}", settings.host, settings.port);

    let (tx_shutdown, rx_shutdown) = oneshot::channel::<()>();
    let handle: ApiJoinHandle = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&address).await?;
        tracing::info!("streamscope API listening on {address}: {listener:?}");

        let std_listener = listener.into_std()?;
        let server = axum::Server::from_tcp(std_listener)?.serve(app.into_make_service());
        let graceful = server.with_graceful_shutdown(async {
            rx_shutdown.await.ok();
        });
        graceful.await?;
        tracing::info!("streamscope API shutting down");
        Ok(())
    });

    Ok((handle, tx_shutdown))
}

#[tracing::instrument(level = "info", skip(tx))]
pub fn shutdown_http_server(tx: TxApiGracefulShutdown) -> Result<(), ApiError> {
    if tx.send(()) == Err(()) {
        tracing::error!("failed to send shutdown signal to streamscope API");
        return Err(ApiError::GracefulShutdown);
    }

    Ok(())
}

#[tracing::instrument(level = "trace", skip(state))]
async fn get_metrics(Extension(state): Extension<Arc<ApiState>>) -> Result<String, ApiError> {
    let families: Vec<_> = state.registries.iter().flat_map(Registry::gather).collect();
    let report = TextEncoder::new().encode_to_string(&families)?;
    Ok(report)
}

#[tracing::instrument(level = "trace", skip(state))]
async fn get_domain(Extension(state): Extension<Arc<ApiState>>) -> Json<DomainInfo> {
    Json(state.tracker.info().await)
}

#[tracing::instrument(level = "trace", skip(state))]
async fn get_instances(Extension(state): Extension<Arc<ApiState>>) -> Json<Vec<InstanceInfo>> {
    Json(state.tracker.instance_infos().await)
}

#[derive(Debug, Serialize)]
struct InstanceReport {
    #[serde(flatten)]
    info: InstanceInfo,
    phase: crate::tracker::InstancePhase,
    snapshots: AggregatorStatus,
    metrics: AggregatorStatus,
}

#[tracing::instrument(level = "trace", skip(state))]
async fn get_instance(
    Path(instance): Path<String>, Extension(state): Extension<Arc<ApiState>>,
) -> Result<Json<InstanceReport>, ApiError> {
    let tracker = find_instance(&state, &instance).await?;
    let (snapshots, metrics) = tracker.aggregator_status().await;
    Ok(Json(InstanceReport {
        info: tracker.info().await,
        phase: tracker.phase().await,
        snapshots,
        metrics,
    }))
}

#[tracing::instrument(level = "trace", skip(state))]
async fn get_jobs(
    Path(instance): Path<String>, Extension(state): Extension<Arc<ApiState>>,
) -> Result<Json<Vec<JobInfo>>, ApiError> {
    let tracker = find_instance(&state, &instance).await?;
    Ok(Json(tracker.all_job_info().await))
}

#[tracing::instrument(level = "trace", skip(state))]
async fn get_job(
    Path((instance, job_id)): Path<(String, String)>, Extension(state): Extension<Arc<ApiState>>,
) -> Result<Json<JobInfo>, ApiError> {
    let tracker = find_instance(&state, &instance).await?;
    tracker
        .job_info(&JobId::new(job_id.as_str()))
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("job", job_id))
}

#[tracing::instrument(level = "trace", skip(state))]
async fn get_job_snapshot(
    Path((instance, job_id)): Path<(String, String)>, Extension(state): Extension<Arc<ApiState>>,
) -> Result<Response, ApiError> {
    let tracker = find_instance(&state, &instance).await?;
    let snapshot = tracker
        .job_snapshot(&JobId::new(job_id.as_str()))
        .await
        .ok_or_else(|| ApiError::not_found("job", job_id))?;
    Ok(raw_json(snapshot))
}

#[tracing::instrument(level = "trace", skip(state))]
async fn get_job_metrics(
    Path((instance, job_id)): Path<(String, String)>, Extension(state): Extension<Arc<ApiState>>,
) -> Result<Response, ApiError> {
    let tracker = find_instance(&state, &instance).await?;
    let metrics = tracker
        .job_metrics(&JobId::new(job_id.as_str()))
        .await
        .ok_or_else(|| ApiError::not_found("job metrics", job_id))?;
    Ok(raw_json(metrics))
}

/// Runs the refresh on its own task so it completes even when the request times out or the client
/// goes away.
#[tracing::instrument(level = "info", skip(state))]
async fn post_refresh(Extension(state): Extension<Arc<ApiState>>) -> Result<StatusCode, ApiError> {
    let tracker = state.tracker.clone();
    let tx_fatal = state.tx_fatal.clone();
    let refresh = tokio::spawn(async move {
        tracker.refresh().await.map_err(|err| {
            tracing::error!(error=?err, "on-demand refresh failed");
            let message = err.to_string();
            if tx_fatal.send(err).is_err() {
                tracing::warn!("engine no longer listening for fatal refresh failures");
            }
            message
        })
    });

    match refresh.await? {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(message) => Err(ApiError::Refresh(message)),
    }
}

async fn find_instance(state: &ApiState, instance: &str) -> Result<Arc<InstanceTracker>, ApiError> {
    state
        .tracker
        .instance(instance)
        .await
        .ok_or_else(|| ApiError::not_found("instance", instance))
}

fn raw_json(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

#[tracing::instrument(level = "trace", skip())]
async fn handle_api_error(method: Method, uri: Uri, error: BoxError) -> (StatusCode, String) {
    if error.is::<tower::timeout::error::Elapsed>() {
        return (StatusCode::REQUEST_TIMEOUT, format!("`{method} {uri}` timed out"));
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("`{method} {uri}` failed with {error}"),
    )
}
