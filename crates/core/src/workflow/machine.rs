use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::actor::UserId;
use crate::domain::approval::{ApprovableEntity, ApprovalStatus, Decision, DecisionOutcome};
use crate::domain::process::Process;
use crate::domain::step::ProcessStep;
use crate::errors::WorkflowError;
use crate::workflow::resolver::StepResolver;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionCommand {
    pub actor: UserId,
    pub outcome: DecisionOutcome,
    pub note: String,
}

/// Result of a successful `decide`: the entity as it must be persisted, the
/// decision row to append, and the version the store must still hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub entity: ApprovableEntity,
    pub decision: Decision,
    pub expected_version: u32,
}

impl Transition {
    pub fn is_final(&self) -> bool {
        self.entity.is_terminal()
    }
}

/// Pending -> Approved | Rejected. No transition leaves a terminal state and
/// steps are decided strictly in order.
#[derive(Clone)]
pub struct ApprovalMachine {
    resolver: StepResolver,
}

impl ApprovalMachine {
    pub fn new(resolver: StepResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &StepResolver {
        &self.resolver
    }

    /// Checks that a new entity may be attached to `process`.
    pub fn ensure_submittable(process: &Process, step_count: usize) -> Result<(), WorkflowError> {
        if process.is_archived() {
            return Err(WorkflowError::validation(
                "process_id",
                format!("process `{}` is archived", process.id),
            ));
        }
        if !process.is_active {
            return Err(WorkflowError::validation(
                "process_id",
                format!("process `{}` is not active", process.id),
            ));
        }
        if step_count == 0 {
            return Err(WorkflowError::NoSteps { process: process.id });
        }
        Ok(())
    }

    /// Every recorded decision must still name the live step at its recorded
    /// order, otherwise the cursor may point past an undecided step.
    pub fn ensure_history_in_place(
        entity: &ApprovableEntity,
        steps: &[ProcessStep],
    ) -> Result<(), WorkflowError> {
        for decision in &entity.decisions {
            let live = steps.iter().find(|step| step.order == decision.step_order);
            if live.map(|step| step.id) != Some(decision.step_id) {
                return Err(WorkflowError::ConcurrentModification {
                    entity: entity.id,
                    expected_version: entity.version,
                    reason: format!(
                        "decided step `{}` is no longer at order {}; the chain changed under this entity",
                        decision.step_id, decision.step_order
                    ),
                });
            }
        }
        Ok(())
    }

    /// `steps` must be the live steps of the entity's process in ascending order.
    pub async fn decide(
        &self,
        entity: &ApprovableEntity,
        steps: &[ProcessStep],
        command: DecisionCommand,
        now: DateTime<Utc>,
    ) -> Result<Transition, WorkflowError> {
        if entity.is_terminal() {
            return Err(WorkflowError::TerminalState { entity: entity.id, status: entity.status });
        }
        if steps.is_empty() {
            return Err(WorkflowError::NoSteps { process: entity.process_id });
        }

        let current = entity.current_step_order;
        if usize::try_from(current).ok() != Some(entity.decisions.len() + 1) {
            return Err(WorkflowError::ConcurrentModification {
                entity: entity.id,
                expected_version: entity.version,
                reason: format!(
                    "step cursor {current} disagrees with {} recorded decisions",
                    entity.decisions.len()
                ),
            });
        }

        Self::ensure_history_in_place(entity, steps)?;

        let Some(step) = steps.iter().find(|step| step.order == current) else {
            return Err(WorkflowError::ConcurrentModification {
                entity: entity.id,
                expected_version: entity.version,
                reason: format!(
                    "step {current} no longer exists; the process now has {} steps",
                    steps.len()
                ),
            });
        };

        if !self.resolver.can_act(step, command.actor).await? {
            return Err(WorkflowError::UnauthorizedActor {
                entity: entity.id,
                actor: command.actor,
                step_order: current,
            });
        }

        let decision = Decision {
            step_id: step.id,
            step_order: current,
            actor_id: command.actor,
            outcome: command.outcome,
            note: command.note.trim().to_string(),
            decided_at: now,
        };

        let last_order = steps.iter().map(|step| step.order).max().unwrap_or(current);
        let mut next = entity.clone();
        next.decisions.push(decision.clone());
        next.updated_at = now;
        next.version = entity.version.saturating_add(1);

        match command.outcome {
            DecisionOutcome::Reject => next.status = ApprovalStatus::Rejected,
            DecisionOutcome::Approve if current >= last_order => {
                next.status = ApprovalStatus::Approved
            }
            DecisionOutcome::Approve => next.current_step_order = current + 1,
        }

        Ok(Transition { entity: next, decision, expected_version: entity.version })
    }
}
