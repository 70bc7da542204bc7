use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use procura_core::domain::approval::{ApprovableEntity, EntityId, NewSubmission};
use procura_core::domain::process::{NewProcess, Process, ProcessId, ProcessPage, ProcessPageRequest};
use procura_core::domain::step::{NewStep, ProcessStep, StepId};
use procura_core::errors::{ResourceKind, WorkflowError};
use procura_core::workflow::Transition;

pub mod approval;
pub mod directory;
pub mod memory;
pub mod process;
pub mod step;

pub use approval::SqlApprovalRepository;
pub use directory::SqlDirectory;
pub use memory::InMemoryWorkflowStore;
pub use process::SqlProcessRepository;
pub use step::SqlStepRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{resource} `{id}` not found")]
    NotFound { resource: ResourceKind, id: i64 },
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

impl RepositoryError {
    /// Maps storage failures into the engine's error taxonomy. Conflicts are
    /// translated by the caller, which knows the entity and version involved.
    pub fn into_workflow(self) -> WorkflowError {
        match self {
            Self::Database(error) => WorkflowError::Persistence(error.to_string()),
            Self::Decode(message) => WorkflowError::Persistence(message),
            Self::NotFound { resource, id } => WorkflowError::not_found(resource, id),
            Self::Conflict(message) => WorkflowError::Persistence(message),
            Self::Workflow(error) => error,
        }
    }
}

#[async_trait]
pub trait ProcessRepository: Send + Sync {
    async fn insert(
        &self,
        process: NewProcess,
        now: DateTime<Utc>,
    ) -> Result<Process, RepositoryError>;

    async fn find_by_id(&self, id: ProcessId) -> Result<Option<Process>, RepositoryError>;

    async fn save(&self, process: &Process) -> Result<(), RepositoryError>;

    /// Keyset page ordered by id.
    async fn list_page(&self, request: ProcessPageRequest) -> Result<ProcessPage, RepositoryError>;
}

#[async_trait]
pub trait StepRepository: Send + Sync {
    /// Live steps of a process in ascending order.
    async fn list_for_process(
        &self,
        process_id: ProcessId,
    ) -> Result<Vec<ProcessStep>, RepositoryError>;

    /// Live step by id; removed steps are not returned.
    async fn find_by_id(&self, id: StepId) -> Result<Option<ProcessStep>, RepositoryError>;

    /// Appends at `order = N + 1`. Fails with a validation error once the
    /// process already holds `max_steps` live steps.
    async fn append(
        &self,
        process_id: ProcessId,
        step: NewStep,
        max_steps: u32,
        now: DateTime<Utc>,
    ) -> Result<ProcessStep, RepositoryError>;

    /// Persists approver, description and timeout; never the order.
    async fn save(&self, step: &ProcessStep) -> Result<(), RepositoryError>;

    /// Rewrites every live step's order from `proposed` in one transaction.
    async fn reorder(
        &self,
        process_id: ProcessId,
        proposed: &[StepId],
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessStep>, RepositoryError>;

    /// Soft-deletes the step and renumbers the remainder in one transaction.
    /// Returns the remaining live steps.
    async fn remove(
        &self,
        id: StepId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessStep>, RepositoryError>;
}

#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    async fn insert(
        &self,
        submission: NewSubmission,
        now: DateTime<Utc>,
    ) -> Result<ApprovableEntity, RepositoryError>;

    /// Entity with its decisions log in step order.
    async fn find_by_id(&self, id: EntityId) -> Result<Option<ApprovableEntity>, RepositoryError>;

    /// Applies a transition if the stored version still equals
    /// `transition.expected_version` and the decided step still sits at the
    /// recorded order; otherwise fails with `Conflict` and writes nothing.
    async fn record_decision(&self, transition: &Transition) -> Result<(), RepositoryError>;

    async fn list_pending(
        &self,
        process_id: Option<ProcessId>,
    ) -> Result<Vec<ApprovableEntity>, RepositoryError>;
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}
