//! JSON API over the runtime services, one tenant per `{company_id}` path.
//!
//! Company endpoints:
//! - `POST /api/v1/companies`                                   create a tenant
//! - `GET  /api/v1/companies/{company_id}`                      read a tenant
//! - `PATCH /api/v1/companies/{company_id}`                     update the profile
//! - `PUT  /api/v1/companies/{company_id}/tools/{category}`     connect a tool
//! - `POST /api/v1/companies/{company_id}/sync`                 sync one record or a batch
//!
//! Event endpoints:
//! - `GET  .../events?limit=`                                   unprocessed events, oldest first
//! - `POST .../events`                                          publish an event
//! - `POST .../events/claim`                                    lease a batch for a worker
//! - `POST .../events/dispatch`                                 run the built-in handlers once
//! - `POST .../events/{event_id}/processed`                     mark an event consumed
//!
//! Action endpoints:
//! - `POST .../actions`, `POST .../actions/execute`
//! - `GET  .../actions/pending`, `GET .../actions/{action_id}`
//! - `POST .../actions/{action_id}/approve|reject|expire`
//! - `GET  .../action-logs?action_id=`
//!
//! Analytics, runs and team:
//! - `POST .../analytics/recompute|reminders|win-loss`, `GET .../snapshots`
//! - `GET|POST .../agent-runs`, `POST .../agent-runs/{run_id}/finish`
//! - `PUT .../credentials/{tool}`, `GET|POST .../team-members`

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use kuria_core::domain::action::{
    ActionId, ActionLog, ActionPayload, ActionPreview, ActionProposal, ActionReceipt,
    ActionResult, ActionStatus, PendingAction, RiskTier,
};
use kuria_core::domain::agent_run::{AgentRun, AgentRunId, AgentRunOutcome};
use kuria_core::domain::company::{Company, CompanyId, CompanyProfile, ToolCategory, ToolConnection};
use kuria_core::domain::event::{Event, EventId, EventPayload, MarkOutcome};
use kuria_core::domain::metrics::SnapshotSet;
use kuria_core::domain::record::{ConnectorSource, RawRecord};
use kuria_core::domain::team::{Credential, TeamMember, TeamMemberId};
use kuria_core::errors::{ApplicationError, DomainError, InterfaceError};
use kuria_db::repositories::RepositoryError;
use kuria_runtime::{
    AgentRunError, AnalyticsError, DispatchReport, GovernanceError, RecomputeReport,
    ReminderReport, RouterError, Runtime, SyncError, SyncOutcome,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

const DEFAULT_EVENT_LIMIT: u32 = 100;
const MAX_EVENT_LIMIT: u32 = 1_000;
const DEFAULT_RUN_LIMIT: u32 = 50;
const MAX_LEASE_SECS: u64 = 24 * 60 * 60;

#[derive(Clone)]
pub struct ApiState {
    runtime: Runtime,
}

pub fn router(runtime: Runtime) -> Router {
    let company = Router::new()
        .route("/", get(get_company).patch(update_profile))
        .route("/tools/{category}", put(connect_tool))
        .route("/sync", post(sync_records))
        .route("/events", get(list_events).post(publish_event))
        .route("/events/claim", post(claim_events))
        .route("/events/dispatch", post(dispatch_events))
        .route("/events/{event_id}/processed", post(mark_processed))
        .route("/actions", post(submit_action))
        .route("/actions/execute", post(execute_action))
        .route("/actions/pending", get(list_pending_actions))
        .route("/actions/{action_id}", get(get_action_receipt))
        .route("/actions/{action_id}/approve", post(approve_action))
        .route("/actions/{action_id}/reject", post(reject_action))
        .route("/actions/{action_id}/expire", post(expire_action))
        .route("/action-logs", get(list_action_logs))
        .route("/analytics/recompute", post(recompute_analytics))
        .route("/analytics/reminders", post(run_reminders))
        .route("/analytics/win-loss", post(analyze_win_loss))
        .route("/snapshots", get(get_snapshots))
        .route("/agent-runs", get(list_agent_runs).post(start_agent_run))
        .route("/agent-runs/{run_id}/finish", post(finish_agent_run))
        .route("/credentials/{tool}", put(upsert_credential))
        .route("/team-members", get(list_team_members).post(add_team_member));

    Router::new()
        .route("/api/v1/companies", post(create_company))
        .nest("/api/v1/companies/{company_id}", company)
        .with_state(ApiState { runtime })
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_class: &'static str,
    pub correlation_id: String,
}

/// Interface error with a fresh correlation id. Server-side failures are
/// logged in full and answered with a generic message.
#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn from_application(error: ApplicationError) -> Self {
        Self(error.into_interface(Uuid::new_v4().to_string()))
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            error_class: "invalid_request",
            correlation_id: Uuid::new_v4().to_string(),
        })
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::from_application(ApplicationError::NotFound(message.into()))
    }

    fn encoding(what: &str, error: serde_json::Error) -> Self {
        Self::from_application(ApplicationError::Persistence(format!(
            "{what} could not be encoded: {error}"
        )))
    }
}

macro_rules! api_error_from {
    ($($source:ty),+ $(,)?) => {
        $(
            impl From<$source> for ApiError {
                fn from(value: $source) -> Self {
                    Self::from_application(value.into())
                }
            }
        )+
    };
}

api_error_from!(
    ApplicationError,
    DomainError,
    SyncError,
    RouterError,
    GovernanceError,
    AnalyticsError,
    AgentRunError,
);

impl From<RepositoryError> for ApiError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Conflict(message) => Self(InterfaceError::Conflict {
                message,
                error_class: "conflict",
                correlation_id: Uuid::new_v4().to_string(),
            }),
            other => Self::from_application(ApplicationError::Persistence(other.to_string())),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        Self::bad_request(value.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let error = if status.is_server_error() {
            error!(
                event_name = "api.request.failed",
                correlation_id = %self.0.correlation_id(),
                error_class = self.0.error_class(),
                error = %self.0,
                "request failed"
            );
            self.0.user_message().to_string()
        } else {
            self.0.message().to_string()
        };

        let body = ErrorBody {
            error,
            error_class: self.0.error_class(),
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// `Json` whose rejection uses the API error envelope.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct ApiJson<T>(T);

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateCompanyRequest {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub size_employees: Option<u32>,
    #[serde(default)]
    pub size_revenue: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectToolRequest {
    pub connector: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SyncRequest {
    Batch { records: Vec<RawRecord> },
    Single(RawRecord),
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItem {
    Synced(SyncOutcome),
    Failed { raw_id: String, error: String, error_class: &'static str },
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub synced: usize,
    pub failed: usize,
    pub results: Vec<BatchItem>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PublishEventRequest {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClaimRequest {
    pub worker_id: Option<String>,
    pub lease_secs: Option<u64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct MarkProcessedResponse {
    pub event_id: EventId,
    pub outcome: MarkOutcome,
}

#[derive(Debug, Serialize)]
pub struct EventView {
    pub id: EventId,
    pub company_id: CompanyId,
    pub event_type: String,
    pub payload: Value,
    pub processed: bool,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EventView {
    fn render(event: Event) -> ApiResult<Self> {
        let (event_type, payload) =
            event.payload.to_parts().map_err(|error| ApiError::encoding("event payload", error))?;
        Ok(Self {
            id: event.id,
            company_id: event.company_id,
            event_type,
            payload,
            processed: event.processed,
            claimed_by: event.claimed_by,
            claim_expires_at: event.claim_expires_at,
            processed_at: event.processed_at,
            created_at: event.created_at,
        })
    }

    fn render_all(events: Vec<Event>) -> ApiResult<Vec<Self>> {
        events.into_iter().map(Self::render).collect()
    }
}

/// Action proposal with the payload split into `action_type` + `payload`, so
/// action types this build does not know still pass through.
#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub level: RiskTier,
    pub agent: String,
    pub action_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub preview: ActionPreview,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl ActionRequest {
    fn into_proposal(self) -> ActionProposal {
        ActionProposal {
            level: self.level,
            agent: self.agent,
            payload: ActionPayload::from_parts(&self.action_type, self.payload),
            description: self.description,
            preview: self.preview,
            idempotency_key: self.idempotency_key,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub approver: String,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub decided_by: String,
}

#[derive(Debug, Serialize)]
pub struct PendingActionView {
    pub id: ActionId,
    pub level: RiskTier,
    pub agent: String,
    pub action_type: String,
    pub payload: Value,
    pub description: String,
    pub preview: ActionPreview,
    pub idempotency_key: Option<String>,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
}

impl PendingActionView {
    fn render(action: PendingAction) -> ApiResult<Self> {
        let (action_type, payload) = action
            .payload
            .to_parts()
            .map_err(|error| ApiError::encoding("action payload", error))?;
        Ok(Self {
            id: action.id,
            level: action.level,
            agent: action.agent,
            action_type,
            payload,
            description: action.description,
            preview: action.preview,
            idempotency_key: action.idempotency_key,
            status: action.status,
            created_at: action.created_at,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ActionLogView {
    pub action_id: ActionId,
    pub level: RiskTier,
    pub agent: String,
    pub action_type: String,
    pub payload: Value,
    pub status: String,
    pub result: Option<ActionResult>,
    pub error: Option<String>,
    pub attempts: u32,
    pub executed_at: DateTime<Utc>,
}

impl ActionLogView {
    fn render(log: ActionLog) -> ApiResult<Self> {
        let (action_type, payload) =
            log.payload.to_parts().map_err(|error| ApiError::encoding("action payload", error))?;
        Ok(Self {
            action_id: log.action_id,
            level: log.level,
            agent: log.agent,
            action_type,
            payload,
            status: log.status.as_str().to_string(),
            result: log.result,
            error: log.error,
            attempts: log.attempts,
            executed_at: log.executed_at,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionLogQuery {
    pub action_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WinLossResponse {
    pub analyzed: u32,
}

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub agent: String,
}

#[derive(Debug, Deserialize)]
pub struct CredentialRequest {
    pub secret: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Credential metadata; the secret itself is never returned.
#[derive(Debug, Serialize)]
pub struct CredentialResponse {
    pub tool: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct TeamMemberRequest {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

// ---------------------------------------------------------------------------
// Companies and sync
// ---------------------------------------------------------------------------

async fn require_company(state: &ApiState, company_id: &CompanyId) -> ApiResult<Company> {
    state
        .runtime
        .store
        .companies
        .find(company_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("company `{company_id}`")))
}

async fn create_company(
    State(state): State<ApiState>,
    ApiJson(request): ApiJson<CreateCompanyRequest>,
) -> ApiResult<(StatusCode, Json<Company>)> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    let id = match request.id.as_deref().map(str::trim) {
        Some("") => return Err(ApiError::bad_request("id must not be empty")),
        Some(id) => id.to_string(),
        None => Uuid::new_v4().to_string(),
    };

    let now = Utc::now();
    let company = Company {
        sector: request.sector,
        size_employees: request.size_employees,
        size_revenue: request.size_revenue,
        ..Company::new(CompanyId(id), name, now)
    };
    state.runtime.store.companies.create(&company).await?;

    info!(
        event_name = "api.company.created",
        company_id = %company.id,
        "company created"
    );
    Ok((StatusCode::CREATED, Json(company)))
}

async fn get_company(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
) -> ApiResult<Json<Company>> {
    Ok(Json(require_company(&state, &CompanyId(company_id)).await?))
}

async fn connect_tool(
    State(state): State<ApiState>,
    Path((company_id, category)): Path<(String, String)>,
    ApiJson(request): ApiJson<ConnectToolRequest>,
) -> ApiResult<Json<Company>> {
    let company_id = CompanyId(company_id);
    let category = ToolCategory::parse(&category)
        .ok_or_else(|| ApiError::bad_request(format!("unknown tool category `{category}`")))?;
    let connector = ConnectorSource::parse(&request.connector).ok_or_else(|| {
        ApiError::bad_request(format!("unknown connector `{}`", request.connector))
    })?;
    if connector.category() != category {
        return Err(ApiError::bad_request(format!(
            "connector `{connector}` does not belong to category `{}`",
            category.as_str()
        )));
    }

    let now = Utc::now();
    let connection = ToolConnection { connector, connected_at: now };
    if !state.runtime.store.companies.connect_tool(&company_id, category, connection, now).await? {
        return Err(ApiError::not_found(format!("company `{company_id}`")));
    }
    Ok(Json(require_company(&state, &company_id).await?))
}

async fn update_profile(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
    ApiJson(profile): ApiJson<CompanyProfile>,
) -> ApiResult<Json<Company>> {
    let company_id = CompanyId(company_id);
    if !state.runtime.store.companies.update_profile(&company_id, &profile, Utc::now()).await? {
        return Err(ApiError::not_found(format!("company `{company_id}`")));
    }
    Ok(Json(require_company(&state, &company_id).await?))
}

async fn sync_records(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
    ApiJson(request): ApiJson<SyncRequest>,
) -> ApiResult<Response> {
    let company_id = CompanyId(company_id);
    let now = Utc::now();
    match request {
        SyncRequest::Single(raw) => {
            let outcome = state.runtime.sync.sync(&company_id, raw, now).await?;
            let status = if outcome.created { StatusCode::CREATED } else { StatusCode::OK };
            Ok((status, Json(outcome)).into_response())
        }
        SyncRequest::Batch { records } => {
            require_company(&state, &company_id).await?;
            let raw_ids: Vec<String> = records.iter().map(|raw| raw.raw_id.clone()).collect();
            let results = state.runtime.sync.sync_batch(&company_id, records, now).await;

            let mut response = BatchResponse { synced: 0, failed: 0, results: Vec::new() };
            for (raw_id, result) in raw_ids.into_iter().zip(results) {
                match result {
                    Ok(outcome) => {
                        response.synced += 1;
                        response.results.push(BatchItem::Synced(outcome));
                    }
                    Err(error) => {
                        response.failed += 1;
                        let ApiError(interface) = ApiError::from(error);
                        let error = if interface.status_code() >= 500 {
                            interface.user_message().to_string()
                        } else {
                            interface.message().to_string()
                        };
                        response.results.push(BatchItem::Failed {
                            raw_id,
                            error,
                            error_class: interface.error_class(),
                        });
                    }
                }
            }
            Ok(Json(response).into_response())
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

async fn list_events(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<EventView>>> {
    let company_id = CompanyId(company_id);
    require_company(&state, &company_id).await?;
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT);
    let events = state.runtime.router.fetch_unprocessed(&company_id, limit).await?;
    Ok(Json(EventView::render_all(events)?))
}

async fn publish_event(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
    ApiJson(request): ApiJson<PublishEventRequest>,
) -> ApiResult<(StatusCode, Json<EventView>)> {
    let company_id = CompanyId(company_id);
    let event_type = request.event_type.trim();
    if event_type.is_empty() {
        return Err(ApiError::bad_request("event_type must not be empty"));
    }
    require_company(&state, &company_id).await?;

    let payload = EventPayload::from_parts(event_type, request.payload);
    let event = state.runtime.router.publish(&company_id, payload, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(EventView::render(event)?)))
}

async fn claim_events(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
    ApiJson(request): ApiJson<ClaimRequest>,
) -> ApiResult<Json<Vec<EventView>>> {
    let company_id = CompanyId(company_id);
    require_company(&state, &company_id).await?;

    let router = &state.runtime.router;
    let worker_id = request
        .worker_id
        .filter(|worker| !worker.trim().is_empty())
        .unwrap_or_else(|| router.worker_id().to_string());
    let lease = Duration::seconds(request.lease_secs.unwrap_or(300).clamp(1, MAX_LEASE_SECS) as i64);
    let limit = request.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT);

    let events = router.claim(&company_id, &worker_id, lease, limit, Utc::now()).await?;
    Ok(Json(EventView::render_all(events)?))
}

async fn dispatch_events(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
) -> ApiResult<Json<DispatchReport>> {
    let company_id = CompanyId(company_id);
    require_company(&state, &company_id).await?;
    Ok(Json(state.runtime.router.dispatch_pending(&company_id, Utc::now()).await?))
}

async fn mark_processed(
    State(state): State<ApiState>,
    Path((company_id, event_id)): Path<(String, String)>,
) -> ApiResult<Json<MarkProcessedResponse>> {
    let company_id = CompanyId(company_id);
    let event_id = EventId(event_id);
    let outcome = state.runtime.router.mark_processed(&company_id, &event_id, Utc::now()).await?;
    if outcome == MarkOutcome::NotFound {
        return Err(ApiError::not_found(format!("event `{event_id}`")));
    }
    Ok(Json(MarkProcessedResponse { event_id, outcome }))
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

async fn submit_action(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
    ApiJson(request): ApiJson<ActionRequest>,
) -> ApiResult<Json<ActionReceipt>> {
    let company_id = CompanyId(company_id);
    let receipt =
        state.runtime.governor.submit(&company_id, request.into_proposal(), Utc::now()).await?;
    Ok(Json(receipt))
}

async fn execute_action(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
    ApiJson(request): ApiJson<ActionRequest>,
) -> ApiResult<Json<ActionReceipt>> {
    let company_id = CompanyId(company_id);
    let receipt = state
        .runtime
        .governor
        .execute_direct(&company_id, request.into_proposal(), Utc::now())
        .await?;
    Ok(Json(receipt))
}

async fn list_pending_actions(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
) -> ApiResult<Json<Vec<PendingActionView>>> {
    let company_id = CompanyId(company_id);
    require_company(&state, &company_id).await?;
    let actions = state.runtime.governor.list_pending(&company_id).await?;
    let views = actions.into_iter().map(PendingActionView::render).collect::<ApiResult<_>>()?;
    Ok(Json(views))
}

async fn get_action_receipt(
    State(state): State<ApiState>,
    Path((company_id, action_id)): Path<(String, String)>,
) -> ApiResult<Json<ActionReceipt>> {
    let receipt =
        state.runtime.governor.receipt(&CompanyId(company_id), &ActionId(action_id)).await?;
    Ok(Json(receipt))
}

async fn approve_action(
    State(state): State<ApiState>,
    Path((company_id, action_id)): Path<(String, String)>,
    ApiJson(request): ApiJson<ApproveRequest>,
) -> ApiResult<Json<ActionReceipt>> {
    let approver = request.approver.trim();
    if approver.is_empty() {
        return Err(ApiError::bad_request("approver must not be empty"));
    }
    let receipt = state
        .runtime
        .governor
        .approve(&CompanyId(company_id), &ActionId(action_id), approver, Utc::now())
        .await?;
    Ok(Json(receipt))
}

async fn reject_action(
    State(state): State<ApiState>,
    Path((company_id, action_id)): Path<(String, String)>,
    ApiJson(request): ApiJson<RejectRequest>,
) -> ApiResult<Json<ActionReceipt>> {
    let decided_by = request.decided_by.trim();
    if decided_by.is_empty() {
        return Err(ApiError::bad_request("decided_by must not be empty"));
    }
    let receipt = state
        .runtime
        .governor
        .reject(&CompanyId(company_id), &ActionId(action_id), decided_by, Utc::now())
        .await?;
    Ok(Json(receipt))
}

async fn expire_action(
    State(state): State<ApiState>,
    Path((company_id, action_id)): Path<(String, String)>,
) -> ApiResult<Json<ActionReceipt>> {
    let receipt = state
        .runtime
        .governor
        .expire(&CompanyId(company_id), &ActionId(action_id), Utc::now())
        .await?;
    Ok(Json(receipt))
}

async fn list_action_logs(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
    Query(query): Query<ActionLogQuery>,
) -> ApiResult<Json<Vec<ActionLogView>>> {
    let company_id = CompanyId(company_id);
    require_company(&state, &company_id).await?;
    let action_id = query.action_id.map(ActionId);
    let logs = state.runtime.governor.list_logs(&company_id, action_id.as_ref()).await?;
    let views = logs.into_iter().map(ActionLogView::render).collect::<ApiResult<_>>()?;
    Ok(Json(views))
}

// ---------------------------------------------------------------------------
// Analytics
// ---------------------------------------------------------------------------

async fn recompute_analytics(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
) -> ApiResult<Json<RecomputeReport>> {
    let report = state.runtime.analytics.recompute(&CompanyId(company_id), Utc::now()).await?;
    Ok(Json(report))
}

async fn run_reminders(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
) -> ApiResult<Json<ReminderReport>> {
    let report = state.runtime.analytics.run_reminders(&CompanyId(company_id), Utc::now()).await?;
    Ok(Json(report))
}

async fn analyze_win_loss(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
) -> ApiResult<Json<WinLossResponse>> {
    let analyzed =
        state.runtime.analytics.analyze_win_loss(&CompanyId(company_id), Utc::now()).await?;
    Ok(Json(WinLossResponse { analyzed }))
}

async fn get_snapshots(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
) -> ApiResult<Json<SnapshotSet>> {
    let company_id = CompanyId(company_id);
    require_company(&state, &company_id).await?;
    Ok(Json(state.runtime.store.snapshots.load_all(&company_id).await?))
}

// ---------------------------------------------------------------------------
// Agent runs
// ---------------------------------------------------------------------------

async fn start_agent_run(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
    ApiJson(request): ApiJson<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<AgentRun>)> {
    let agent = request.agent.trim();
    if agent.is_empty() {
        return Err(ApiError::bad_request("agent must not be empty"));
    }
    let run = state.runtime.agent_runs.start(&CompanyId(company_id), agent, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn finish_agent_run(
    State(state): State<ApiState>,
    Path((company_id, run_id)): Path<(String, String)>,
    ApiJson(outcome): ApiJson<AgentRunOutcome>,
) -> ApiResult<Json<AgentRun>> {
    let run = state
        .runtime
        .agent_runs
        .finish(&CompanyId(company_id), &AgentRunId(run_id), outcome, Utc::now())
        .await?;
    Ok(Json(run))
}

async fn list_agent_runs(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<AgentRun>>> {
    let company_id = CompanyId(company_id);
    require_company(&state, &company_id).await?;
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_EVENT_LIMIT);
    Ok(Json(state.runtime.agent_runs.list(&company_id, limit).await?))
}

// ---------------------------------------------------------------------------
// Team and credentials
// ---------------------------------------------------------------------------

async fn upsert_credential(
    State(state): State<ApiState>,
    Path((company_id, tool)): Path<(String, String)>,
    ApiJson(request): ApiJson<CredentialRequest>,
) -> ApiResult<Json<CredentialResponse>> {
    let company_id = CompanyId(company_id);
    let tool = tool.trim().to_ascii_lowercase();
    if tool.is_empty() || request.secret.is_empty() {
        return Err(ApiError::bad_request("tool and secret must not be empty"));
    }
    require_company(&state, &company_id).await?;

    let credential = Credential {
        company_id: company_id.clone(),
        tool,
        secret: request.secret.into(),
        expires_at: request.expires_at,
        updated_at: Utc::now(),
    };
    state.runtime.store.team.upsert_credential(&credential).await?;

    info!(
        event_name = "api.credential.stored",
        company_id = %company_id,
        tool = %credential.tool,
        "credential stored"
    );
    Ok(Json(CredentialResponse {
        tool: credential.tool,
        expires_at: credential.expires_at,
        updated_at: credential.updated_at,
    }))
}

async fn add_team_member(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
    ApiJson(request): ApiJson<TeamMemberRequest>,
) -> ApiResult<(StatusCode, Json<TeamMember>)> {
    let company_id = CompanyId(company_id);
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    require_company(&state, &company_id).await?;

    let member = TeamMember {
        id: TeamMemberId(Uuid::new_v4().to_string()),
        company_id,
        name: name.to_string(),
        email: request.email,
        role: request.role,
        created_at: Utc::now(),
    };
    state.runtime.store.team.add_member(&member).await?;
    Ok((StatusCode::CREATED, Json(member)))
}

async fn list_team_members(
    State(state): State<ApiState>,
    Path(company_id): Path<String>,
) -> ApiResult<Json<Vec<TeamMember>>> {
    let company_id = CompanyId(company_id);
    require_company(&state, &company_id).await?;
    Ok(Json(state.runtime.store.team.list_members(&company_id).await?))
}
