use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use cluster_directory_api::{ClusterDirectoryApi, MigrateResult, API_CONTRACT_VERSION};
use cluster_directory_core::{
    Cluster, ClusterRecordId, DirectoryConfig, DirectoryError, KubeVersionCount, NewOrganization,
    OrgId, Organization, PageRequest, SearchRequest, StalenessRequest, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE,
};
use cluster_directory_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const LOG_ENV_VAR: &str = "CLUSTER_DIRECTORY_LOG";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ClusterDirectoryApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    retryable: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListParams {
    limit: Option<u32>,
    starting_after: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SearchParams {
    filter: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ZombieParams {
    threshold_seconds: Option<i64>,
    as_of: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "cluster-directory-service")]
#[command(about = "Local HTTP service for the cluster directory")]
struct Args {
    #[arg(long, env = "CLUSTER_DIRECTORY_DB", default_value = "./cluster_directory.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "CLUSTER_DIRECTORY_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "CLUSTER_DIRECTORY_DEFAULT_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    default_page_size: u32,
    #[arg(long, env = "CLUSTER_DIRECTORY_MAX_PAGE_SIZE", default_value_t = MAX_PAGE_SIZE)]
    max_page_size: u32,
    #[arg(long, env = "CLUSTER_DIRECTORY_ZOMBIE_THRESHOLD_SECONDS", default_value_t = 86_400)]
    zombie_threshold_seconds: i64,
}

impl Args {
    fn directory_config(&self) -> DirectoryConfig {
        DirectoryConfig {
            default_page_size: self.default_page_size,
            max_page_size: self.max_page_size,
            zombie_threshold: Duration::seconds(self.zombie_threshold_seconds),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            retryable: status == StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<DirectoryError> for ServiceError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::Validation(_) => Self::bad_request(err.to_string()),
            DirectoryError::Unavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// `SQLite` calls block; keep them off the async worker threads.
async fn blocking<T, F>(state: &ServiceState, op: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&ClusterDirectoryApi) -> Result<T, ServiceError> + Send + 'static,
{
    let api = state.api.clone();
    match tokio::task::spawn_blocking(move || op(&api)).await {
        Ok(result) => result,
        Err(err) => Err(ServiceError::internal(format!("request task failed: {err}"))),
    }
}

fn parse_org_id(raw: &str) -> Result<OrgId, ServiceError> {
    OrgId::parse(raw).map_err(ServiceError::from)
}

/// Malformed query strings answer with the error envelope instead of axum's plain text.
fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, ServiceError> {
    params.map(|Query(inner)| inner).map_err(|err| ServiceError::bad_request(err.body_text()))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    body.map(|Json(inner)| inner).map_err(|err| ServiceError::bad_request(err.body_text()))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .route("/v1/orgs", post(org_create))
        .route("/v1/orgs/:org_id", get(org_show))
        .route("/v1/orgs/:org_id/clusters", get(clusters_list))
        .route("/v1/orgs/:org_id/clusters/search", get(clusters_search))
        .route("/v1/orgs/:org_id/clusters/kube-versions", get(clusters_kube_versions))
        .route("/v1/orgs/:org_id/clusters/zombies", get(clusters_zombies))
        .route("/v1/orgs/:org_id/clusters/by-cluster-id/:cluster_id", get(cluster_show))
        .with_state(state)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let api = ClusterDirectoryApi::with_config(args.db.clone(), args.directory_config())?;
    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(
        bind = %args.bind,
        db = %args.db.display(),
        "cluster directory service listening"
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = blocking(&state, |api| {
        api.schema_status().map_err(|err| ServiceError::internal(format!("{err:#}")))
    })
    .await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    request: Result<Json<MigrateRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let request = json_body(request)?;
    let result = blocking(&state, move |api| {
        api.migrate(request.dry_run).map_err(|err| ServiceError::internal(format!("{err:#}")))
    })
    .await?;
    Ok(Json(envelope(result)))
}

async fn db_integrity_check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let report = blocking(&state, |api| {
        api.integrity_check().map_err(|err| ServiceError::internal(format!("{err:#}")))
    })
    .await?;
    Ok(Json(envelope(report)))
}

async fn org_create(
    State(state): State<ServiceState>,
    request: Result<Json<NewOrganization>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Organization>>, ServiceError> {
    let request = json_body(request)?;
    let org = blocking(&state, move |api| {
        api.create_local_org(&request).map_err(ServiceError::from)
    })
    .await?;
    Ok(Json(envelope(org)))
}

async fn org_show(
    State(state): State<ServiceState>,
    Path(org_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Organization>>, ServiceError> {
    let org_id = parse_org_id(&org_id)?;
    let org = blocking(&state, move |api| {
        api.organization(&org_id)
            .map_err(ServiceError::from)?
            .ok_or_else(|| ServiceError::not_found(format!("organization {org_id} not found")))
    })
    .await?;
    Ok(Json(envelope(org)))
}

async fn clusters_list(
    State(state): State<ServiceState>,
    Path(org_id): Path<String>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Vec<Cluster>>>, ServiceError> {
    let org_id = parse_org_id(&org_id)?;
    let params = query_params(params)?;
    let request = PageRequest {
        limit: params.limit,
        starting_after: params.starting_after.map(ClusterRecordId),
    };
    let clusters = blocking(&state, move |api| {
        api.clusters_by_org_id(&org_id, &request).map_err(ServiceError::from)
    })
    .await?;
    Ok(Json(envelope(clusters)))
}

async fn clusters_search(
    State(state): State<ServiceState>,
    Path(org_id): Path<String>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Vec<Cluster>>>, ServiceError> {
    let org_id = parse_org_id(&org_id)?;
    let params = query_params(params)?;
    let request = SearchRequest { filter: params.filter, limit: params.limit };
    let clusters = blocking(&state, move |api| {
        api.cluster_search(&org_id, &request).map_err(ServiceError::from)
    })
    .await?;
    Ok(Json(envelope(clusters)))
}

async fn clusters_kube_versions(
    State(state): State<ServiceState>,
    Path(org_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<KubeVersionCount>>>, ServiceError> {
    let org_id = parse_org_id(&org_id)?;
    let counts = blocking(&state, move |api| {
        api.cluster_count_by_kube_version(&org_id).map_err(ServiceError::from)
    })
    .await?;
    Ok(Json(envelope(counts)))
}

async fn clusters_zombies(
    State(state): State<ServiceState>,
    Path(org_id): Path<String>,
    params: Result<Query<ZombieParams>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Vec<Cluster>>>, ServiceError> {
    let org_id = parse_org_id(&org_id)?;
    let params = query_params(params)?;
    let as_of = params
        .as_of
        .as_deref()
        .map(|raw| OffsetDateTime::parse(raw, &Rfc3339))
        .transpose()
        .map_err(|err| ServiceError::bad_request(format!("as_of MUST be RFC3339: {err}")))?;
    let request = StalenessRequest { threshold_seconds: params.threshold_seconds, as_of };
    let clusters = blocking(&state, move |api| {
        api.cluster_zombies(&org_id, &request).map_err(ServiceError::from)
    })
    .await?;
    Ok(Json(envelope(clusters)))
}

async fn cluster_show(
    State(state): State<ServiceState>,
    Path((org_id, cluster_id)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<Cluster>>, ServiceError> {
    let org_id = parse_org_id(&org_id)?;
    let cluster = blocking(&state, move |api| {
        api.cluster_by_cluster_id(&org_id, &cluster_id)
            .map_err(ServiceError::from)?
            .ok_or_else(|| {
                ServiceError::not_found(format!("cluster {cluster_id} not found in org {org_id}"))
            })
    })
    .await?;
    Ok(Json(envelope(cluster)))
}
