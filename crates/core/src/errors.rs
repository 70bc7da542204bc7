use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::domain::actor::UserId;
use crate::domain::approval::{ApprovalStatus, EntityId};
use crate::domain::process::ProcessId;
use crate::domain::step::StepId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Process,
    Step,
    Entity,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Process => "process",
            Self::Step => "step",
            Self::Entity => "entity",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("invalid `{field}`: {message}")]
    Validation { field: &'static str, message: String },
    #[error("{resource} `{id}` not found")]
    NotFound { resource: ResourceKind, id: i64 },
    #[error(
        "proposed order for process `{process}` is not a permutation of its steps \
         (missing {missing:?}, extra {extra:?}, duplicated {duplicates:?})"
    )]
    InvalidReorder {
        process: ProcessId,
        missing: Vec<StepId>,
        extra: Vec<StepId>,
        duplicates: Vec<StepId>,
    },
    #[error("user `{actor}` may not act on step {step_order} of entity `{entity}`")]
    UnauthorizedActor { entity: EntityId, actor: UserId, step_order: u32 },
    #[error("entity `{entity}` is already {status:?}")]
    TerminalState { entity: EntityId, status: ApprovalStatus },
    #[error("process `{process}` has no steps")]
    NoSteps { process: ProcessId },
    #[error("entity `{entity}` was modified concurrently (expected version {expected_version}): {reason}")]
    ConcurrentModification { entity: EntityId, expected_version: u32, reason: String },
    #[error("directory lookup failed: {0}")]
    Directory(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl WorkflowError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation { field, message: message.into() }
    }

    pub fn not_found(resource: ResourceKind, id: i64) -> Self {
        Self::NotFound { resource, id }
    }

    /// Stable machine-readable name reported to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "not_found",
            Self::InvalidReorder { .. } => "invalid_reorder",
            Self::UnauthorizedActor { .. } => "unauthorized_actor",
            Self::TerminalState { .. } => "terminal_state",
            Self::NoSteps { .. } => "no_steps",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::Directory(_) => "directory",
            Self::Persistence(_) => "persistence",
        }
    }

    /// Callers are expected to re-fetch and retry only on this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::Validation { field, .. } => Some(json!({ "field": field })),
            Self::NotFound { resource, id } => Some(json!({ "resource": resource, "id": id })),
            Self::InvalidReorder { missing, extra, duplicates, .. } => Some(json!({
                "missing": missing,
                "extra": extra,
                "duplicates": duplicates,
            })),
            Self::UnauthorizedActor { step_order, .. } => {
                Some(json!({ "step_order": step_order }))
            }
            Self::ConcurrentModification { expected_version, .. } => {
                Some(json!({ "expected_version": expected_version, "retryable": true }))
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    BadRequest,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    Unprocessable,
    ServiceUnavailable,
    Internal,
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("{kind}: {message}")]
pub struct InterfaceError {
    pub class: ErrorClass,
    pub kind: &'static str,
    pub message: String,
    pub correlation_id: String,
    pub details: Option<Value>,
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self.class {
            ErrorClass::BadRequest | ErrorClass::Unprocessable => {
                "The request could not be processed. Check inputs and try again."
            }
            ErrorClass::Unauthenticated => "Authentication is required for this request.",
            ErrorClass::Forbidden => "You are not permitted to act on this approval step.",
            ErrorClass::NotFound => "The requested record does not exist.",
            ErrorClass::Conflict => {
                "The record changed or is no longer open. Refresh and try again."
            }
            ErrorClass::ServiceUnavailable => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            ErrorClass::Internal => "An unexpected internal error occurred.",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let mut mapped = InterfaceError::from(self);
        mapped.correlation_id = correlation_id.into();
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = "unassigned".to_owned();
        match value {
            ApplicationError::Workflow(error) => {
                let class = match &error {
                    WorkflowError::Validation { .. } | WorkflowError::InvalidReorder { .. } => {
                        ErrorClass::Unprocessable
                    }
                    WorkflowError::NotFound { .. } => ErrorClass::NotFound,
                    WorkflowError::UnauthorizedActor { .. } => ErrorClass::Forbidden,
                    WorkflowError::TerminalState { .. }
                    | WorkflowError::NoSteps { .. }
                    | WorkflowError::ConcurrentModification { .. } => ErrorClass::Conflict,
                    WorkflowError::Directory(_) | WorkflowError::Persistence(_) => {
                        ErrorClass::ServiceUnavailable
                    }
                };
                Self {
                    class,
                    kind: error.kind(),
                    message: error.to_string(),
                    correlation_id: unassigned,
                    details: error.details(),
                }
            }
            ApplicationError::BadRequest(message) => Self {
                class: ErrorClass::BadRequest,
                kind: "bad_request",
                message,
                correlation_id: unassigned,
                details: None,
            },
            ApplicationError::Unauthenticated(message) => Self {
                class: ErrorClass::Unauthenticated,
                kind: "unauthenticated",
                message,
                correlation_id: unassigned,
                details: None,
            },
            ApplicationError::Configuration(message) => Self {
                class: ErrorClass::Internal,
                kind: "configuration",
                message,
                correlation_id: unassigned,
                details: None,
            },
        }
    }
}
