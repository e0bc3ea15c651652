#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use kernel_core::{
    AccessTier, AuditFilter, ClassificationLevel, EntryFilter, GroupId, JobResult, JobType,
    KernelConfig, KernelEngine, KernelError, MembershipRole, MimeKind, NewEntry, NotebookId,
    OrgId, SecurityLabel, SubscriptionScope,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Bundles the kernel's own tunables with the service's transport-layer concerns,
/// mirroring the reference service's `ServiceConfig { engine_config, queue_path }` split.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub kernel: KernelConfig,
    pub audit_overflow_path: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            audit_overflow_path: PathBuf::from("kernel-service/data/audit-overflow.jsonl"),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<Mutex<KernelEngine>>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let mut engine = KernelEngine::bootstrap(config.kernel, config.audit_overflow_path)
            .await
            .map_err(ServiceError::Core)?;
        engine.start_background_tasks();
        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/notebooks", post(create_notebook).get(list_notebooks))
        .route("/v1/notebooks/:notebook_id", get(get_notebook).delete(delete_notebook))
        .route("/v1/notebooks/:notebook_id/entries", post(write_entry).get(browse_entries))
        .route("/v1/notebooks/:notebook_id/entries/:entry_id", get(get_entry))
        .route("/v1/notebooks/:notebook_id/entries/:entry_id/revisions", get(list_revisions))
        .route("/v1/notebooks/:notebook_id/entries/:entry_id/revise", post(revise_entry))
        .route("/v1/notebooks/:notebook_id/observe", get(observe_notebook))
        .route("/v1/notebooks/:notebook_id/access", post(share_access).get(list_access))
        .route("/v1/notebooks/:notebook_id/access/:principal", delete(revoke_access))
        .route("/v1/notebooks/:notebook_id/jobs/claim", post(claim_job))
        .route("/v1/notebooks/:notebook_id/jobs/stats", get(job_stats))
        .route("/v1/notebooks/:notebook_id/jobs/retry", post(retry_jobs))
        .route("/v1/jobs/:job_id/complete", post(complete_job))
        .route("/v1/jobs/:job_id/fail", post(fail_job))
        .route("/v1/notebooks/:notebook_id/reviews", get(list_reviews))
        .route("/v1/reviews/:entry_id/approve", post(approve_review))
        .route("/v1/reviews/:entry_id/reject", post(reject_review))
        .route("/v1/organizations", post(create_organization))
        .route("/v1/organizations/:org_id/groups", post(create_group))
        .route("/v1/organizations/:org_id/groups/:group_id/members", post(add_group_member))
        .route("/v1/subscriptions", post(create_subscription))
        .route("/v1/subscriptions/:subscription_id", get(get_subscription).delete(delete_subscription))
        .route("/v1/subscriptions/:subscription_id/sync", post(trigger_subscription_sync))
        .route("/v1/notebooks/:notebook_id/audit", get(query_audit))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("kernel error: {0}")]
    Core(#[from] KernelError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] KernelError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => {
                let status = match &err {
                    KernelError::NotFound | KernelError::InsufficientTier | KernelError::InsufficientClearance => {
                        StatusCode::NOT_FOUND
                    }
                    KernelError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    KernelError::Conflict(_) => StatusCode::CONFLICT,
                    KernelError::Unauthenticated => StatusCode::UNAUTHORIZED,
                    KernelError::RateLimited | KernelError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
                    KernelError::Gone => StatusCode::GONE,
                    KernelError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    KernelError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                };
                // Existence-concealed variants collapse to one message here too, not just one status.
                let message = if err.is_concealed_deny() { "not found".to_string() } else { err.to_string() };
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
        }
    }
}

fn principal_header(headers: &axum::http::HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-principal")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError::Http { status: StatusCode::UNAUTHORIZED, message: "missing X-Principal header".into() })
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", service: "kernel-service" })
}

#[derive(Debug, Deserialize)]
struct CreateNotebookRequest {
    name: String,
    classification: ClassificationLevel,
    #[serde(default)]
    compartments: Vec<String>,
    #[serde(default)]
    owning_group: Option<GroupId>,
}

async fn create_notebook(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<CreateNotebookRequest>,
) -> Result<Json<kernel_core::Notebook>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    let label = SecurityLabel::new(req.classification, req.compartments);
    Ok(Json(engine.create_notebook(&caller, &req.name, label, req.owning_group).await?))
}

async fn list_notebooks(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<Vec<kernel_core::Notebook>>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.list_notebooks(&caller).await))
}

async fn get_notebook(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(notebook_id): Path<NotebookId>,
) -> Result<Json<kernel_core::Notebook>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.get_notebook(&caller, notebook_id).await?))
}

async fn delete_notebook(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(notebook_id): Path<NotebookId>,
) -> Result<StatusCode, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    engine.delete_notebook(&caller, notebook_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct WriteEntryRequest {
    content: String,
    #[serde(default = "default_mime")]
    mime: MimeKind,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    references: Vec<Uuid>,
    #[serde(default)]
    fragment_of: Option<Uuid>,
    #[serde(default)]
    fragment_index: Option<u32>,
    #[serde(default)]
    asserted_classification: Option<ClassificationLevel>,
}

fn default_mime() -> MimeKind {
    MimeKind::PlainText
}

fn new_entry_from(req: WriteEntryRequest) -> NewEntry {
    let mut new_entry = NewEntry::new(req.content, req.mime);
    new_entry.topic = req.topic;
    new_entry.references = req.references;
    new_entry.fragment_of = req.fragment_of;
    new_entry.fragment_index = req.fragment_index;
    new_entry.asserted_classification = req.asserted_classification;
    new_entry
}

async fn write_entry(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(notebook_id): Path<NotebookId>,
    Json(req): Json<WriteEntryRequest>,
) -> Result<Json<kernel_core::WriteOutcome>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.write_entry(&caller, notebook_id, new_entry_from(req)).await?))
}

async fn get_entry(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path((notebook_id, entry_id)): Path<(NotebookId, Uuid)>,
) -> Result<Json<kernel_core::Entry>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.get_entry(&caller, notebook_id, entry_id).await?))
}

async fn list_revisions(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path((notebook_id, entry_id)): Path<(NotebookId, Uuid)>,
) -> Result<Json<Vec<kernel_core::Entry>>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.list_revisions(&caller, notebook_id, entry_id).await?))
}

async fn revise_entry(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path((notebook_id, entry_id)): Path<(NotebookId, Uuid)>,
    Json(req): Json<WriteEntryRequest>,
) -> Result<Json<kernel_core::WriteOutcome>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.revise_entry(&caller, notebook_id, entry_id, new_entry_from(req)).await?))
}

#[derive(Debug, Deserialize)]
struct BrowseQuery {
    query: Option<String>,
    topic_prefix: Option<String>,
    author: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn browse_entries(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(notebook_id): Path<NotebookId>,
    Query(q): Query<BrowseQuery>,
) -> Result<Json<Vec<kernel_core::Entry>>, ApiError> {
    let caller = principal_header(&headers)?;
    let filter = EntryFilter {
        query: q.query,
        topic_prefix: q.topic_prefix,
        author: q.author,
        limit: q.limit,
        offset: q.offset,
        ..Default::default()
    };
    let engine = state.engine.lock().await;
    Ok(Json(engine.browse(&caller, notebook_id, filter).await?))
}

#[derive(Debug, Deserialize)]
struct ObserveQuery {
    since_sequence: Option<u64>,
}

async fn observe_notebook(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(notebook_id): Path<NotebookId>,
    Query(q): Query<ObserveQuery>,
) -> Result<Json<kernel_core::ObserveResponse>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.observe(&caller, notebook_id, q.since_sequence.unwrap_or(0)).await?))
}

#[derive(Debug, Deserialize)]
struct ShareRequest {
    principal: String,
    tier: AccessTier,
}

async fn share_access(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(notebook_id): Path<NotebookId>,
    Json(req): Json<ShareRequest>,
) -> Result<StatusCode, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    engine.share(&caller, notebook_id, &req.principal, req.tier).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_access(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(notebook_id): Path<NotebookId>,
) -> Result<Json<Vec<kernel_core::AccessGrant>>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.list_grants(&caller, notebook_id).await?))
}

async fn revoke_access(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path((notebook_id, principal)): Path<(NotebookId, String)>,
) -> Result<StatusCode, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    engine.revoke(&caller, notebook_id, &principal).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ClaimJobRequest {
    worker_id: String,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    job_type: Option<JobType>,
}

async fn claim_job(
    State(state): State<ServiceState>,
    Path(notebook_id): Path<NotebookId>,
    Json(req): Json<ClaimJobRequest>,
) -> Result<Json<Option<kernel_core::Job>>, ApiError> {
    let engine = state.engine.lock().await;
    Ok(Json(
        engine.claim_job(notebook_id, req.job_type, &req.worker_id, req.agent_id.as_deref()).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct CompleteJobRequest {
    worker_id: String,
    entry_id: Uuid,
    result: JobResult,
}

async fn complete_job(
    State(state): State<ServiceState>,
    Path(job_id): Path<Uuid>,
    Json(req): Json<CompleteJobRequest>,
) -> Result<Json<kernel_core::Job>, ApiError> {
    let engine = state.engine.lock().await;
    Ok(Json(engine.complete_job(&req.worker_id, job_id, req.entry_id, req.result).await?))
}

#[derive(Debug, Deserialize)]
struct FailJobRequest {
    worker_id: String,
    error: String,
}

async fn fail_job(
    State(state): State<ServiceState>,
    Path(job_id): Path<Uuid>,
    Json(req): Json<FailJobRequest>,
) -> Result<Json<kernel_core::Job>, ApiError> {
    let engine = state.engine.lock().await;
    Ok(Json(engine.fail_job(&req.worker_id, job_id, &req.error).await?))
}

async fn job_stats(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(notebook_id): Path<NotebookId>,
) -> Result<Json<kernel_core::QueueStats>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.queue_stats(&caller, notebook_id).await?))
}

async fn retry_jobs(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(notebook_id): Path<NotebookId>,
) -> Result<Json<u64>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.retry_failed_jobs(&caller, notebook_id).await?))
}

async fn list_reviews(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(notebook_id): Path<NotebookId>,
) -> Result<Json<Vec<kernel_core::EntryReview>>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.list_pending_reviews(&caller, notebook_id).await?))
}

async fn approve_review(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(entry_id): Path<Uuid>,
) -> Result<Json<kernel_core::EntryReview>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.approve_review(&caller, entry_id).await?))
}

async fn reject_review(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(entry_id): Path<Uuid>,
) -> Result<Json<kernel_core::EntryReview>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.reject_review(&caller, entry_id).await?))
}

#[derive(Debug, Deserialize)]
struct CreateOrgRequest {
    name: String,
}

async fn create_organization(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<CreateOrgRequest>,
) -> Result<Json<kernel_core::Organization>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.create_organization(&caller, &req.name).await?))
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    name: String,
}

async fn create_group(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(org_id): Path<OrgId>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<kernel_core::Group>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.create_group(&caller, org_id, &req.name).await?))
}

#[derive(Debug, Deserialize)]
struct AddMemberRequest {
    principal: String,
    role: MembershipRole,
}

async fn add_group_member(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path((org_id, group_id)): Path<(OrgId, GroupId)>,
    Json(req): Json<AddMemberRequest>,
) -> Result<StatusCode, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    engine.add_group_member(&caller, org_id, group_id, &req.principal, req.role).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CreateSubscriptionRequest {
    subscriber_notebook: NotebookId,
    source_notebook: NotebookId,
    scope: SubscriptionScope,
    #[serde(default)]
    topic_filter: Option<String>,
    #[serde(default = "default_discount")]
    discount_factor: f64,
}

fn default_discount() -> f64 {
    1.0
}

async fn create_subscription(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Result<Json<kernel_core::Subscription>, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    Ok(Json(
        engine
            .create_subscription(
                &caller,
                req.subscriber_notebook,
                req.source_notebook,
                req.scope,
                req.topic_filter,
                req.discount_factor,
            )
            .await?,
    ))
}

async fn get_subscription(
    State(state): State<ServiceState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<kernel_core::Subscription>, ApiError> {
    let engine = state.engine.lock().await;
    Ok(Json(engine.get_subscription(subscription_id).await?))
}

async fn delete_subscription(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(subscription_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let caller = principal_header(&headers)?;
    let engine = state.engine.lock().await;
    engine.delete_subscription(&caller, subscription_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn trigger_subscription_sync(
    State(state): State<ServiceState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let engine = state.engine.lock().await;
    engine.trigger_subscription_sync(subscription_id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    actor: Option<String>,
    action: Option<String>,
    resource: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn query_audit(
    State(state): State<ServiceState>,
    headers: axum::http::HeaderMap,
    Path(notebook_id): Path<NotebookId>,
    Query(q): Query<AuditQuery>,
) -> Result<Json<Vec<kernel_core::AuditEvent>>, ApiError> {
    let caller = principal_header(&headers)?;
    let filter = AuditFilter {
        actor: q.actor,
        action: q.action,
        resource: q.resource,
        limit: q.limit,
        offset: q.offset,
        ..Default::default()
    };
    let engine = state.engine.lock().await;
    Ok(Json(engine.query_audit(&caller, notebook_id, filter).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> ServiceState {
        let path = std::env::temp_dir().join(format!("kernel-service-test-{}.jsonl", Uuid::new_v4()));
        ServiceState::bootstrap(ServiceConfig { kernel: KernelConfig::default(), audit_overflow_path: path })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_notebook_round_trips() {
        let app = build_router(test_state().await);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/notebooks")
                    .header("content-type", "application/json")
                    .header("x-principal", "alice")
                    .body(Body::from(
                        serde_json::json!({ "name": "research", "classification": "internal" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let notebook: kernel_core::Notebook = serde_json::from_slice(&bytes).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/v1/notebooks/{}", notebook.id))
                    .header("x-principal", "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_notebook_is_indistinguishable_from_unauthorized() {
        let app = build_router(test_state().await);

        let missing = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/v1/notebooks/{}", Uuid::new_v4()))
                    .header("x-principal", "bob")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn write_entry_enqueues_distill_job() {
        let app = build_router(test_state().await);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/notebooks")
                    .header("content-type", "application/json")
                    .header("x-principal", "alice")
                    .body(Body::from(
                        serde_json::json!({ "name": "research", "classification": "public" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let notebook: kernel_core::Notebook = serde_json::from_slice(&bytes).unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v1/notebooks/{}/entries", notebook.id))
                    .header("content-type", "application/json")
                    .header("x-principal", "alice")
                    .body(Body::from(serde_json::json!({ "content": "hello" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/v1/notebooks/{}/jobs/stats", notebook.id))
                    .header("x-principal", "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let stats: kernel_core::QueueStats = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stats.pending, 1);
    }
}
