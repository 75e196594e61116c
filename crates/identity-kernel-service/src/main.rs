use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use identity_kernel_api::{ApiError, IdentityKernelApi, MigrateResult, API_CONTRACT_VERSION};
use identity_kernel_core::{
    Contact, ContactId, IdentifyRequest, IdentityError, IdentityView, MergePolicy, ResolverConfig,
};
use identity_kernel_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
struct ServiceState {
    api: IdentityKernelApi,
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
}

/// Error body for `POST /identify`, kept flat for existing clients.
#[derive(Debug, Clone, Serialize)]
struct DetailError {
    #[serde(skip)]
    status: StatusCode,
    detail: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "identity-kernel-service")]
#[command(about = "Local HTTP service for contact identity resolution")]
struct Args {
    #[arg(long, env = "IDENTITY_KERNEL_DB", default_value = "./identity_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "IDENTITY_KERNEL_BIND", default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[arg(
        long,
        env = "IDENTITY_KERNEL_MERGE_POLICY",
        default_value = "report-oldest",
        value_parser = parse_merge_policy
    )]
    merge_policy: MergePolicy,
}

fn parse_merge_policy(value: &str) -> Result<MergePolicy, String> {
    MergePolicy::parse(value)
        .ok_or_else(|| format!("unknown merge policy `{value}`; expected report-oldest or merge"))
}

fn status_for(err: &ApiError) -> StatusCode {
    match err {
        ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ApiError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        ApiError::Resolution(IdentityError::InconsistentLink { .. }) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        ApiError::Resolution(_) | ApiError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %err, "request failed");
        }
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: err.to_string() }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<ApiError> for DetailError {
    fn from(err: ApiError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %err, "identify failed");
        }
        Self { status, detail: err.to_string() }
    }
}

impl IntoResponse for DetailError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
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

/// Run a synchronous API call on the blocking pool.
async fn call_api<T, F>(state: ServiceState, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&IdentityKernelApi) -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&state.api))
        .await
        .map_err(|err| ApiError::Storage(anyhow::anyhow!("api worker task failed: {err}")))?
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/identify", post(identify))
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity", get(db_integrity))
        .route("/v1/contacts/:id", get(contact_show))
        .route("/v1/identity/:contact_id", get(identity_show))
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = ResolverConfig { merge_policy: args.merge_policy };
    let state = ServiceState { api: IdentityKernelApi::with_config(args.db.clone(), config) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(
        bind = %args.bind,
        db = %args.db.display(),
        merge_policy = args.merge_policy.as_str(),
        "identity kernel service listening"
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn request_id(request: Request, next: Next) -> Response {
    let request_id = ulid::Ulid::new().to_string();
    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = next.run(request).instrument(span.clone()).await;
    span.in_scope(|| tracing::info!(status = response.status().as_u16(), "request completed"));
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn identify(
    State(state): State<ServiceState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentityView>, DetailError> {
    let Json(request) = payload.map_err(rejection_detail)?;
    let resolution = call_api(state, move |api| api.identify(&request)).await?;
    Ok(Json(resolution.view))
}

/// Malformed or mistyped bodies are 422; other rejections keep axum's status.
fn rejection_detail(rejection: JsonRejection) -> DetailError {
    let status = match &rejection {
        JsonRejection::JsonDataError(_) | JsonRejection::JsonSyntaxError(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => rejection.status(),
    };
    DetailError { status, detail: rejection.body_text() }
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = call_api(state, IdentityKernelApi::schema_status).await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = call_api(state, move |api| api.migrate(request.dry_run)).await?;
    Ok(Json(envelope(result)))
}

async fn db_integrity(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let report = call_api(state, IdentityKernelApi::integrity_check).await?;
    Ok(Json(envelope(report)))
}

async fn contact_show(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<Json<ServiceEnvelope<Contact>>, ServiceError> {
    let contact = call_api(state, move |api| api.contact_show(ContactId(id))).await?;
    Ok(Json(envelope(contact)))
}

async fn identity_show(
    State(state): State<ServiceState>,
    Path(contact_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<IdentityView>>, ServiceError> {
    let view = call_api(state, move |api| api.identity_show(ContactId(contact_id))).await?;
    Ok(Json(envelope(view)))
}
