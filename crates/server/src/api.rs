//! JSON API over the workflow engine.
//!
//! Catalog:
//! - `GET    /api/v1/processes` keyset page (`after`, `limit`, `include_archived`)
//! - `POST   /api/v1/processes` create a process
//! - `GET    /api/v1/processes/{id}` fetch one process
//! - `PUT    /api/v1/processes/{id}` update title, status or activation
//! - `POST   /api/v1/processes/{id}/deactivate` stop new submissions
//! - `DELETE /api/v1/processes/{id}` archive (soft delete)
//!
//! Steps:
//! - `GET    /api/v1/processes/{id}/steps` ordered steps
//! - `POST   /api/v1/processes/{id}/steps` append a step
//! - `POST   /api/v1/processes/{id}/steps/reorder` apply `{steps: [{id, order}]}`
//! - `PUT    /api/v1/steps/{id}` edit a step in place
//! - `DELETE /api/v1/steps/{id}` remove and renumber
//!
//! Approvals:
//! - `POST   /api/v1/entities` submit an entity
//! - `GET    /api/v1/entities/{id}` entity with decisions
//! - `POST   /api/v1/entities/{id}/decide` approve or reject the current step
//! - `GET    /api/v1/entities/{id}/eligible-actors`
//! - `GET    /api/v1/inbox` entities the caller may decide
//! - `GET    /api/v1/overdue` entities past their step timeout
//!
//! The acting user arrives in `x-actor-id`, set by the authenticating gateway.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{error, warn};
use uuid::Uuid;

use procura_core::audit::AuditContext;
use procura_core::domain::actor::UserId;
use procura_core::domain::approval::{
    ApprovableEntity, DecisionOutcome, EntityId, NewSubmission, SubjectRef,
};
use procura_core::domain::process::{
    NewProcess, Process, ProcessChanges, ProcessId, ProcessPage, ProcessStatus,
};
use procura_core::domain::step::{Approver, NewStep, ProcessStep, StepChanges, StepId};
use procura_core::errors::{ApplicationError, ErrorClass, InterfaceError, WorkflowError};
use procura_core::workflow::{DecisionCommand, ReorderEntry};
use procura_db::{OverdueEntity, WorkflowEngine};

pub const ACTOR_HEADER: &str = "x-actor-id";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    engine: Arc<WorkflowEngine>,
    api_token: Option<SecretString>,
}

impl ApiState {
    pub fn new(engine: Arc<WorkflowEngine>, api_token: Option<SecretString>) -> Self {
        let api_token = api_token.filter(|token| !token.expose_secret().is_empty());
        Self { engine, api_token }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/processes", get(list_processes).post(create_process))
        .route(
            "/api/v1/processes/{id}",
            get(get_process).put(update_process).delete(archive_process),
        )
        .route("/api/v1/processes/{id}/deactivate", post(deactivate_process))
        .route("/api/v1/processes/{id}/steps", get(list_steps).post(add_step))
        .route("/api/v1/processes/{id}/steps/reorder", post(reorder_steps))
        .route("/api/v1/steps/{id}", put(update_step).delete(remove_step))
        .route("/api/v1/entities", post(submit_entity))
        .route("/api/v1/entities/{id}", get(get_entity))
        .route("/api/v1/entities/{id}/decide", post(decide_entity))
        .route("/api/v1/entities/{id}/eligible-actors", get(eligible_actors))
        .route("/api/v1/inbox", get(inbox))
        .route("/api/v1/overdue", get(overdue))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn new(error: impl Into<ApplicationError>, correlation_id: &str) -> Self {
        Self(error.into().into_interface(correlation_id))
    }

    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self::new(ApplicationError::BadRequest(message.into()), correlation_id)
    }
}

fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::BadRequest => StatusCode::BAD_REQUEST,
        ErrorClass::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorClass::Forbidden => StatusCode::FORBIDDEN,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::Conflict => StatusCode::CONFLICT,
        ErrorClass::Unprocessable => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorClass::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0;
        let status = status_for(error.class);
        // Infrastructure failures are logged in full but only summarised to callers.
        let message = match error.class {
            ErrorClass::ServiceUnavailable | ErrorClass::Internal => {
                error!(
                    event_name = "api.request.failed",
                    correlation_id = %error.correlation_id,
                    kind = error.kind,
                    error = %error.message,
                    "request failed"
                );
                error.user_message().to_string()
            }
            _ => error.message.clone(),
        };

        let body = json!({
            "error": {
                "kind": error.kind,
                "message": message,
                "correlation_id": error.correlation_id,
                "details": error.details,
            }
        });
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

struct RequestContext {
    correlation_id: String,
    actor: Option<UserId>,
}

impl RequestContext {
    fn actor(&self) -> Result<UserId, ApiError> {
        self.actor.ok_or_else(|| {
            ApiError::bad_request(format!("missing `{ACTOR_HEADER}` header"), &self.correlation_id)
        })
    }

    fn audit(&self) -> AuditContext {
        let actor = self.actor.map(|actor| format!("user:{actor}")).unwrap_or_else(|| "anonymous".to_string());
        AuditContext::new(self.correlation_id.clone(), actor)
    }

    fn fail(&self, error: WorkflowError) -> ApiError {
        ApiError::new(error, &self.correlation_id)
    }
}

/// Compares in constant time over the token bytes; only the length check
/// short-circuits.
fn token_matches(presented: &str, expected: &str) -> bool {
    let (presented, expected) = (presented.as_bytes(), expected.as_bytes());
    presented.len() == expected.len() && presented.ct_eq(expected).unwrap_u8() == 1
}

/// Checks the bearer token when one is configured and reads the actor and
/// correlation headers. A present but malformed actor header is a 400.
fn request_context(state: &ApiState, headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Some(expected) = &state.api_token {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if !presented.is_some_and(|token| token_matches(token, expected.expose_secret())) {
            warn!(
                event_name = "api.auth.rejected",
                correlation_id = %correlation_id,
                "missing or invalid bearer token"
            );
            return Err(ApiError::new(
                ApplicationError::Unauthenticated("missing or invalid bearer token".to_string()),
                &correlation_id,
            ));
        }
    }

    let actor = match headers.get(ACTOR_HEADER) {
        None => None,
        Some(value) => {
            let parsed = value.to_str().ok().and_then(|raw| raw.trim().parse::<i64>().ok());
            match parsed {
                Some(id) if id > 0 => Some(UserId(id)),
                _ => {
                    return Err(ApiError::bad_request(
                        format!("`{ACTOR_HEADER}` must be a positive integer user id"),
                        &correlation_id,
                    ))
                }
            }
        }
    };

    Ok(RequestContext { correlation_id, actor })
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>, ctx: &RequestContext) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text(), &ctx.correlation_id))
}

fn path_id(id: Result<Path<i64>, PathRejection>, ctx: &RequestContext) -> Result<i64, ApiError> {
    id.map(|Path(id)| id)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text(), &ctx.correlation_id))
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListProcessesQuery {
    pub after: Option<i64>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateProcessRequest {
    pub title: String,
    #[serde(default = "default_status")]
    pub status: ProcessStatus,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_status() -> ProcessStatus {
    ProcessStatus::Active
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateProcessRequest {
    pub title: Option<String>,
    pub status: Option<ProcessStatus>,
    pub is_active: Option<bool>,
}

/// Step body with the nullable approver pair used by form clients.
#[derive(Debug, Default, Deserialize)]
pub struct StepRequest {
    pub approver_user_id: Option<i64>,
    pub approver_designation_id: Option<i64>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub timeout_days: Option<Option<u32>>,
}

/// Distinguishes an explicit `null` from an absent field.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl StepRequest {
    fn approver(&self) -> Result<Option<Approver>, WorkflowError> {
        match (self.approver_user_id, self.approver_designation_id) {
            (None, None) => Ok(None),
            (user, designation) => Approver::from_columns(user, designation).map(Some).ok_or_else(|| {
                WorkflowError::validation(
                    "approver",
                    "set exactly one of approver_user_id or approver_designation_id",
                )
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub steps: Vec<ReorderEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub process_id: i64,
    pub subject_kind: String,
    pub subject_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub outcome: String,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Serialize)]
pub struct StepsResponse {
    pub process_id: ProcessId,
    pub steps: Vec<ProcessStep>,
}

#[derive(Debug, Serialize)]
pub struct EntitiesResponse {
    pub entities: Vec<ApprovableEntity>,
}

#[derive(Debug, Serialize)]
pub struct EligibleActorsResponse {
    pub entity_id: EntityId,
    pub actors: Vec<UserId>,
}

#[derive(Debug, Serialize)]
pub struct OverdueResponse {
    pub checked_at: String,
    pub entities: Vec<OverdueEntity>,
}

// ---------------------------------------------------------------------------
// Catalog handlers
// ---------------------------------------------------------------------------

async fn list_processes(
    State(state): State<ApiState>,
    headers: HeaderMap,
    query: Result<Query<ListProcessesQuery>, QueryRejection>,
) -> Result<Json<ProcessPage>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    let Query(query) = query
        .map_err(|rejection| ApiError::bad_request(rejection.body_text(), &ctx.correlation_id))?;

    let page = state
        .engine
        .list_processes(query.after.map(ProcessId), query.limit, query.include_archived)
        .await
        .map_err(|error| ctx.fail(error))?;
    Ok(Json(page))
}

async fn create_process(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<CreateProcessRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Process>), ApiError> {
    let ctx = request_context(&state, &headers)?;
    ctx.actor()?;
    let body = json_body(payload, &ctx)?;

    let process = state
        .engine
        .create_process(
            &ctx.audit(),
            NewProcess { title: body.title, status: body.status, is_active: body.is_active },
        )
        .await
        .map_err(|error| ctx.fail(error))?;
    Ok((StatusCode::CREATED, Json(process)))
}

async fn get_process(
    State(state): State<ApiState>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Process>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    let id = path_id(id, &ctx)?;
    let process = state.engine.get_process(ProcessId(id)).await.map_err(|error| ctx.fail(error))?;
    Ok(Json(process))
}

async fn update_process(
    State(state): State<ApiState>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<UpdateProcessRequest>, JsonRejection>,
) -> Result<Json<Process>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    ctx.actor()?;
    let id = path_id(id, &ctx)?;
    let body = json_body(payload, &ctx)?;

    let changes =
        ProcessChanges { title: body.title, status: body.status, is_active: body.is_active };
    let process = state
        .engine
        .update_process(&ctx.audit(), ProcessId(id), changes)
        .await
        .map_err(|error| ctx.fail(error))?;
    Ok(Json(process))
}

async fn deactivate_process(
    State(state): State<ApiState>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Process>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    ctx.actor()?;
    let id = path_id(id, &ctx)?;
    let process = state
        .engine
        .deactivate(&ctx.audit(), ProcessId(id))
        .await
        .map_err(|error| ctx.fail(error))?;
    Ok(Json(process))
}

async fn archive_process(
    State(state): State<ApiState>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Process>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    ctx.actor()?;
    let id = path_id(id, &ctx)?;
    let process =
        state.engine.archive(&ctx.audit(), ProcessId(id)).await.map_err(|error| ctx.fail(error))?;
    Ok(Json(process))
}

// ---------------------------------------------------------------------------
// Step handlers
// ---------------------------------------------------------------------------

async fn list_steps(
    State(state): State<ApiState>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<StepsResponse>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    let process_id = ProcessId(path_id(id, &ctx)?);
    let steps = state.engine.ordered_steps(process_id).await.map_err(|error| ctx.fail(error))?;
    Ok(Json(StepsResponse { process_id, steps }))
}

async fn add_step(
    State(state): State<ApiState>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<StepRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProcessStep>), ApiError> {
    let ctx = request_context(&state, &headers)?;
    ctx.actor()?;
    let process_id = ProcessId(path_id(id, &ctx)?);
    let body = json_body(payload, &ctx)?;

    let approver = body.approver().map_err(|error| ctx.fail(error))?.ok_or_else(|| {
        ctx.fail(WorkflowError::validation(
            "approver",
            "set exactly one of approver_user_id or approver_designation_id",
        ))
    })?;
    let step = NewStep {
        approver,
        description: body.description.unwrap_or_default(),
        timeout_days: body.timeout_days.flatten(),
    };

    let created =
        state.engine.add_step(&ctx.audit(), process_id, step).await.map_err(|error| ctx.fail(error))?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn reorder_steps(
    State(state): State<ApiState>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<ReorderRequest>, JsonRejection>,
) -> Result<Json<StepsResponse>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    ctx.actor()?;
    let process_id = ProcessId(path_id(id, &ctx)?);
    let body = json_body(payload, &ctx)?;

    let steps = state
        .engine
        .reorder_entries(&ctx.audit(), process_id, &body.steps)
        .await
        .map_err(|error| ctx.fail(error))?;
    Ok(Json(StepsResponse { process_id, steps }))
}

async fn update_step(
    State(state): State<ApiState>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<StepRequest>, JsonRejection>,
) -> Result<Json<ProcessStep>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    ctx.actor()?;
    let step_id = StepId(path_id(id, &ctx)?);
    let body = json_body(payload, &ctx)?;

    let changes = StepChanges {
        approver: body.approver().map_err(|error| ctx.fail(error))?,
        description: body.description,
        timeout_days: body.timeout_days,
    };
    let step = state
        .engine
        .update_step(&ctx.audit(), step_id, changes)
        .await
        .map_err(|error| ctx.fail(error))?;
    Ok(Json(step))
}

async fn remove_step(
    State(state): State<ApiState>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    ctx.actor()?;
    let step_id = StepId(path_id(id, &ctx)?);
    let remaining =
        state.engine.remove_step(&ctx.audit(), step_id).await.map_err(|error| ctx.fail(error))?;
    Ok(Json(json!({ "removed": step_id, "steps": remaining })))
}

// ---------------------------------------------------------------------------
// Approval handlers
// ---------------------------------------------------------------------------

async fn submit_entity(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApprovableEntity>), ApiError> {
    let ctx = request_context(&state, &headers)?;
    let actor = ctx.actor()?;
    let body = json_body(payload, &ctx)?;

    let submission = NewSubmission {
        process_id: ProcessId(body.process_id),
        subject: SubjectRef { kind: body.subject_kind, id: body.subject_id },
        submitted_by: actor,
    };
    let entity =
        state.engine.submit(&ctx.audit(), submission).await.map_err(|error| ctx.fail(error))?;
    Ok((StatusCode::CREATED, Json(entity)))
}

async fn get_entity(
    State(state): State<ApiState>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<ApprovableEntity>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    let id = path_id(id, &ctx)?;
    let entity = state.engine.get_entity(EntityId(id)).await.map_err(|error| ctx.fail(error))?;
    Ok(Json(entity))
}

async fn decide_entity(
    State(state): State<ApiState>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<DecideRequest>, JsonRejection>,
) -> Result<Json<ApprovableEntity>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    let actor = ctx.actor()?;
    let entity_id = EntityId(path_id(id, &ctx)?);
    let body = json_body(payload, &ctx)?;

    let outcome = DecisionOutcome::parse(&body.outcome).ok_or_else(|| {
        ctx.fail(WorkflowError::validation("outcome", "expected `approve` or `reject`"))
    })?;
    let command = DecisionCommand { actor, outcome, note: body.note };
    let entity = state
        .engine
        .decide(&ctx.audit(), entity_id, command)
        .await
        .map_err(|error| ctx.fail(error))?;
    Ok(Json(entity))
}

async fn eligible_actors(
    State(state): State<ApiState>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<EligibleActorsResponse>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    let entity_id = EntityId(path_id(id, &ctx)?);
    let actors = state.engine.eligible_actors(entity_id).await.map_err(|error| ctx.fail(error))?;
    Ok(Json(EligibleActorsResponse { entity_id, actors }))
}

async fn inbox(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<EntitiesResponse>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    let actor = ctx.actor()?;
    let entities = state.engine.pending_for(actor).await.map_err(|error| ctx.fail(error))?;
    Ok(Json(EntitiesResponse { entities }))
}

async fn overdue(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<OverdueResponse>, ApiError> {
    let ctx = request_context(&state, &headers)?;
    let now = Utc::now();
    let entities = state.engine.overdue(now).await.map_err(|error| ctx.fail(error))?;
    Ok(Json(OverdueResponse { checked_at: now.to_rfc3339(), entities }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        extract::State,
        http::{HeaderMap, HeaderValue, Request, StatusCode},
        Json,
    };
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use procura_core::audit::InMemoryAuditSink;
    use procura_core::directory::StaticDirectory;
    use procura_core::domain::actor::{DesignationId, UserId};
    use procura_db::{EngineSettings, WorkflowEngine};

    use super::{inbox, router, token_matches, ApiState, ACTOR_HEADER};

    fn state(api_token: Option<&str>) -> ApiState {
        let directory = StaticDirectory::new([(UserId(4), DesignationId(2))]);
        let engine = WorkflowEngine::in_memory(
            Arc::new(directory),
            Arc::new(InMemoryAuditSink::default()),
            EngineSettings::default(),
        );
        ApiState::new(Arc::new(engine), api_token.map(|token| SecretString::from(token.to_string())))
    }

    async fn call(
        state: &ApiState,
        method: &str,
        uri: &str,
        actor: Option<i64>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(actor) = actor {
            request = request.header(ACTOR_HEADER, actor.to_string());
        }
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };

        let response =
            router(state.clone()).oneshot(request.body(body).expect("request")).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).expect("json") };
        (status, value)
    }

    async fn seed(state: &ApiState) -> (i64, Vec<i64>) {
        let (status, process) = call(
            state,
            "POST",
            "/api/v1/processes",
            Some(1),
            Some(json!({ "title": "Material Request", "status": "active", "is_active": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let process_id = process["id"].as_i64().expect("process id");

        let mut ids = Vec::new();
        for body in [
            json!({ "approver_user_id": 7, "description": "Store keeper", "timeout_days": 2 }),
            json!({ "approver_designation_id": 2, "description": "Department head" }),
            json!({ "approver_user_id": 9, "description": "Finance" }),
        ] {
            let (status, step) =
                call(state, "POST", &format!("/api/v1/processes/{process_id}/steps"), Some(1), Some(body)).await;
            assert_eq!(status, StatusCode::CREATED);
            ids.push(step["id"].as_i64().expect("step id"));
        }
        (process_id, ids)
    }

    #[tokio::test]
    async fn reorder_returns_authoritative_order() {
        let state = state(None);
        let (process_id, ids) = seed(&state).await;

        let (status, body) = call(
            &state,
            "POST",
            &format!("/api/v1/processes/{process_id}/steps/reorder"),
            Some(1),
            Some(json!({ "steps": [
                { "id": ids[2], "order": 1 },
                { "id": ids[0], "order": 2 },
                { "id": ids[1], "order": 3 },
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let order: Vec<i64> =
            body["steps"].as_array().expect("steps").iter().filter_map(|step| step["id"].as_i64()).collect();
        assert_eq!(order, vec![ids[2], ids[0], ids[1]]);
        assert_eq!(body["steps"][0]["order"], json!(1));
    }

    #[tokio::test]
    async fn foreign_step_in_reorder_is_unprocessable_with_details() {
        let state = state(None);
        let (process_id, ids) = seed(&state).await;

        let (status, body) = call(
            &state,
            "POST",
            &format!("/api/v1/processes/{process_id}/steps/reorder"),
            Some(1),
            Some(json!({ "steps": [
                { "id": ids[0], "order": 1 },
                { "id": ids[1], "order": 2 },
                { "id": 999, "order": 3 },
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["kind"], json!("invalid_reorder"));
        assert_eq!(body["error"]["details"]["extra"], json!([999]));
        assert_eq!(body["error"]["details"]["missing"], json!([ids[2]]));
        assert!(body["error"]["correlation_id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[tokio::test]
    async fn decisions_map_domain_errors_to_status_codes() {
        let state = state(None);
        let (process_id, _) = seed(&state).await;

        let (status, entity) = call(
            &state,
            "POST",
            "/api/v1/entities",
            Some(3),
            Some(json!({ "process_id": process_id, "subject_kind": "rfq", "subject_id": "RFQ-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let entity_id = entity["id"].as_i64().expect("entity id");
        let decide = format!("/api/v1/entities/{entity_id}/decide");

        let (status, body) =
            call(&state, "POST", &decide, Some(9), Some(json!({ "outcome": "approve" }))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["kind"], json!("unauthorized_actor"));

        let (status, body) =
            call(&state, "POST", &decide, Some(7), Some(json!({ "outcome": "reject", "note": "no budget" })))
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("rejected"));

        let (status, body) =
            call(&state, "POST", &decide, Some(7), Some(json!({ "outcome": "approve" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["kind"], json!("terminal_state"));

        let (status, _) =
            call(&state, "POST", &decide, Some(7), Some(json!({ "outcome": "maybe" }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn step_body_needs_exactly_one_approver() {
        let state = state(None);
        let (process_id, _) = seed(&state).await;
        let uri = format!("/api/v1/processes/{process_id}/steps");

        let (status, body) = call(
            &state,
            "POST",
            &uri,
            Some(1),
            Some(json!({ "approver_user_id": 1, "approver_designation_id": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["details"]["field"], json!("approver"));

        let (status, _) = call(&state, "POST", &uri, Some(1), Some(json!({ "description": "x" }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn removing_a_step_renumbers_the_rest() {
        let state = state(None);
        let (process_id, ids) = seed(&state).await;

        let (status, body) = call(&state, "DELETE", &format!("/api/v1/steps/{}", ids[0]), Some(1), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["steps"].as_array().map(Vec::len), Some(2));

        let (_, listed) = call(&state, "GET", &format!("/api/v1/processes/{process_id}/steps"), None, None).await;
        let orders: Vec<i64> =
            listed["steps"].as_array().expect("steps").iter().filter_map(|s| s["order"].as_i64()).collect();
        assert_eq!(orders, vec![1, 2]);

        let (status, _) = call(&state, "DELETE", &format!("/api/v1/steps/{}", ids[0]), Some(1), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mutations_require_actor_header() {
        let state = state(None);
        let (status, body) = call(
            &state,
            "POST",
            "/api/v1/processes",
            None,
            Some(json!({ "title": "Leave" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], json!("bad_request"));

        let (status, _) = call(&state, "GET", "/api/v1/processes/404", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn configured_token_is_enforced() {
        let state = state(Some("0123456789abcdef"));
        let (status, body) = call(&state, "GET", "/api/v1/processes", Some(1), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["kind"], json!("unauthenticated"));

        let request = axum::http::Request::builder()
            .method("GET")
            .uri("/api/v1/processes")
            .header("authorization", "Bearer 0123456789abcdef")
            .body(Body::empty())
            .expect("request");
        let response = router(state.clone()).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn token_comparison_needs_every_byte() {
        assert!(token_matches("0123456789abcdef", "0123456789abcdef"));
        assert!(!token_matches("0123456789abcdeX", "0123456789abcdef"));
        assert!(!token_matches("0123456789abcde", "0123456789abcdef"));
        assert!(!token_matches("", "0123456789abcdef"));
    }

    #[tokio::test]
    async fn near_miss_token_is_rejected() {
        let state = state(Some("0123456789abcdef"));
        for presented in ["Bearer 0123456789abcdeF", "Bearer 0123456789abcdef0", "0123456789abcdef"] {
            let request = axum::http::Request::builder()
                .method("GET")
                .uri("/api/v1/processes")
                .header("authorization", presented)
                .body(Body::empty())
                .expect("request");
            let response = router(state.clone()).oneshot(request).await.expect("response");
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{presented} was accepted");
        }
    }

    #[tokio::test]
    async fn inbox_handler_lists_entities_for_designation_holder() {
        let state = state(None);
        let (process_id, _) = seed(&state).await;
        let (_, entity) = call(
            &state,
            "POST",
            "/api/v1/entities",
            Some(3),
            Some(json!({ "process_id": process_id, "subject_kind": "rfq", "subject_id": "RFQ-2" })),
        )
        .await;
        let entity_id = entity["id"].as_i64().expect("entity id");
        call(
            &state,
            "POST",
            &format!("/api/v1/entities/{entity_id}/decide"),
            Some(7),
            Some(json!({ "outcome": "approve" })),
        )
        .await;

        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_HEADER, HeaderValue::from_static("4"));
        let Json(response) = inbox(State(state.clone()), headers).await.expect("inbox");
        assert_eq!(response.entities.len(), 1);
        assert_eq!(response.entities[0].id.0, entity_id);

        let (_, actors) =
            call(&state, "GET", &format!("/api/v1/entities/{entity_id}/eligible-actors"), None, None).await;
        assert_eq!(actors["actors"], json!([4]));
    }
}
