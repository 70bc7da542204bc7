use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::actor::UserId;
use crate::domain::process::ProcessId;
use crate::domain::step::StepId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approve,
    Reject,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Some(Self::Approve),
            "reject" | "rejected" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// The domain object an entity stands in for, e.g. a material request item.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    pub kind: String,
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub step_id: StepId,
    pub step_order: u32,
    pub actor_id: UserId,
    pub outcome: DecisionOutcome,
    pub note: String,
    pub decided_at: DateTime<Utc>,
}

/// Anything driven through a process chain.
///
/// While `status` is `Pending`, `current_step_order == decisions.len() + 1`.
/// `version` increments on every persisted decision and guards concurrent writers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovableEntity {
    pub id: EntityId,
    pub process_id: ProcessId,
    pub subject: SubjectRef,
    pub submitted_by: UserId,
    pub current_step_order: u32,
    pub status: ApprovalStatus,
    pub decisions: Vec<Decision>,
    pub version: u32,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovableEntity {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// When the entity arrived at its current step.
    pub fn stage_entered_at(&self) -> DateTime<Utc> {
        self.decisions.last().map(|decision| decision.decided_at).unwrap_or(self.submitted_at)
    }

    /// Advisory deadline for the current step given its timeout hint.
    pub fn current_step_due_at(&self, timeout_days: Option<u32>) -> Option<DateTime<Utc>> {
        if self.is_terminal() {
            return None;
        }
        timeout_days.map(|days| self.stage_entered_at() + Duration::days(i64::from(days)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubmission {
    pub process_id: ProcessId,
    pub subject: SubjectRef,
    pub submitted_by: UserId,
}
