pub mod audit;
pub mod config;
pub mod directory;
pub mod domain;
pub mod errors;
pub mod workflow;

pub use chrono;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use directory::{DirectoryAdapter, DirectoryError, StaticDirectory};
pub use domain::actor::{DesignationId, UserId};
pub use domain::approval::{
    ApprovableEntity, ApprovalStatus, Decision, DecisionOutcome, EntityId, NewSubmission,
    SubjectRef,
};
pub use domain::process::{
    NewProcess, Process, ProcessChanges, ProcessId, ProcessPage, ProcessPageRequest,
    ProcessStatus,
};
pub use domain::step::{Approver, NewStep, ProcessStep, StepChanges, StepId};
pub use errors::{ApplicationError, ErrorClass, InterfaceError, ResourceKind, WorkflowError};
pub use workflow::{ApprovalMachine, DecisionCommand, StepResolver, Transition};
