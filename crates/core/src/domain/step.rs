use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::actor::{DesignationId, UserId};
use crate::domain::process::ProcessId;

pub const MAX_DESCRIPTION_CHARS: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub i64);

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who may decide a step. Exactly one of the two is ever bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Approver {
    User(UserId),
    Designation(DesignationId),
}

impl Approver {
    /// Builds an approver from the nullable column/field pair used on the wire
    /// and in storage. Returns `None` unless exactly one side is present.
    pub fn from_columns(user_id: Option<i64>, designation_id: Option<i64>) -> Option<Self> {
        match (user_id, designation_id) {
            (Some(user), None) => Some(Self::User(UserId(user))),
            (None, Some(designation)) => Some(Self::Designation(DesignationId(designation))),
            _ => None,
        }
    }

    pub fn user_column(&self) -> Option<i64> {
        match self {
            Self::User(user) => Some(user.0),
            Self::Designation(_) => None,
        }
    }

    pub fn designation_column(&self) -> Option<i64> {
        match self {
            Self::User(_) => None,
            Self::Designation(designation) => Some(designation.0),
        }
    }
}

impl std::fmt::Display for Approver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(user) => write!(f, "user:{user}"),
            Self::Designation(designation) => write!(f, "designation:{designation}"),
        }
    }
}

/// One position in a process chain. `id` is the step's identity; `order` is
/// its current 1-based position and changes on reorder or removal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStep {
    pub id: StepId,
    pub process_id: ProcessId,
    pub order: u32,
    pub approver: Approver,
    pub description: String,
    pub timeout_days: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStep {
    pub approver: Approver,
    pub description: String,
    pub timeout_days: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepChanges {
    pub approver: Option<Approver>,
    pub description: Option<String>,
    /// `Some(None)` clears the timeout hint.
    pub timeout_days: Option<Option<u32>>,
}

impl StepChanges {
    pub fn apply_to(&self, step: &mut ProcessStep) {
        if let Some(approver) = self.approver {
            step.approver = approver;
        }
        if let Some(description) = &self.description {
            step.description = description.trim().to_string();
        }
        if let Some(timeout_days) = self.timeout_days {
            step.timeout_days = timeout_days;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Approver, DesignationId, UserId};

    #[test]
    fn approver_requires_exactly_one_column() {
        assert_eq!(Approver::from_columns(Some(7), None), Some(Approver::User(UserId(7))));
        assert_eq!(
            Approver::from_columns(None, Some(2)),
            Some(Approver::Designation(DesignationId(2)))
        );
        assert_eq!(Approver::from_columns(Some(7), Some(2)), None);
        assert_eq!(Approver::from_columns(None, None), None);
    }

    #[test]
    fn approver_serializes_as_tagged_variant() {
        let json = serde_json::to_value(Approver::Designation(DesignationId(2))).expect("json");
        assert_eq!(json, serde_json::json!({"kind": "designation", "id": 2}));
    }
}
