use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use procura_core::domain::approval::{ApprovableEntity, ApprovalStatus, EntityId, NewSubmission};
use procura_core::domain::process::{
    NewProcess, Process, ProcessId, ProcessPage, ProcessPageRequest,
};
use procura_core::domain::step::{NewStep, ProcessStep, StepId};
use procura_core::errors::{ResourceKind, WorkflowError};
use procura_core::workflow::{ordering, ApprovalMachine, Transition};

use super::{ApprovalRepository, ProcessRepository, RepositoryError, StepRepository};

#[derive(Default)]
struct StoreState {
    next_id: i64,
    processes: BTreeMap<ProcessId, Process>,
    steps: BTreeMap<StepId, ProcessStep>,
    /// Soft-deleted steps stay in `steps` for history; this holds their `removed_at`.
    removed: BTreeMap<StepId, DateTime<Utc>>,
    entities: BTreeMap<EntityId, ApprovableEntity>,
}

impl StoreState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn live_steps(&self, process_id: ProcessId) -> Vec<ProcessStep> {
        let mut steps: Vec<ProcessStep> = self
            .steps
            .values()
            .filter(|step| step.process_id == process_id && self.is_live(step.id))
            .cloned()
            .collect();
        steps.sort_by_key(|step| step.order);
        steps
    }

    fn is_live(&self, id: StepId) -> bool {
        !self.removed.contains_key(&id)
    }

    fn live_step(&self, id: StepId) -> Option<&ProcessStep> {
        self.steps.get(&id).filter(|step| self.is_live(step.id))
    }

    fn touch_process(
        &mut self,
        process_id: ProcessId,
        now: DateTime<Utc>,
    ) -> Result<&Process, RepositoryError> {
        let process = self.processes.get_mut(&process_id).ok_or(RepositoryError::NotFound {
            resource: ResourceKind::Process,
            id: process_id.0,
        })?;
        process.updated_at = now;
        Ok(process)
    }

    fn replace_steps(&mut self, steps: &[ProcessStep], now: DateTime<Utc>) {
        for step in steps {
            if let Some(stored) = self.steps.get_mut(&step.id) {
                if stored.order != step.order {
                    stored.order = step.order;
                    stored.updated_at = now;
                }
            }
        }
    }
}

/// Process, step and approval stores sharing one lock, so a reorder and a
/// decision never interleave. Every clone sees the same data.
#[derive(Clone, Default)]
pub struct InMemoryWorkflowStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ProcessRepository for InMemoryWorkflowStore {
    async fn insert(
        &self,
        process: NewProcess,
        now: DateTime<Utc>,
    ) -> Result<Process, RepositoryError> {
        let mut state = self.state.write().await;
        let created = Process {
            id: ProcessId(state.allocate_id()),
            title: process.title.trim().to_string(),
            status: process.status,
            is_active: process.is_active,
            archived_at: None,
            created_at: now,
            updated_at: now,
        };
        state.processes.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: ProcessId) -> Result<Option<Process>, RepositoryError> {
        Ok(self.state.read().await.processes.get(&id).cloned())
    }

    async fn save(&self, process: &Process) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        match state.processes.get_mut(&process.id) {
            Some(stored) => {
                *stored = process.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound { resource: ResourceKind::Process, id: process.id.0 }),
        }
    }

    async fn list_page(&self, request: ProcessPageRequest) -> Result<ProcessPage, RepositoryError> {
        let state = self.state.read().await;
        let after = request.after.unwrap_or(ProcessId(0));
        let items: Vec<Process> = state
            .processes
            .range(ProcessId(after.0 + 1)..)
            .map(|(_, process)| process)
            .filter(|process| request.include_archived || !process.is_archived())
            .take(request.limit as usize + 1)
            .cloned()
            .collect();
        Ok(ProcessPage::from_overfetch(items, request.limit))
    }
}

#[async_trait::async_trait]
impl StepRepository for InMemoryWorkflowStore {
    async fn list_for_process(
        &self,
        process_id: ProcessId,
    ) -> Result<Vec<ProcessStep>, RepositoryError> {
        Ok(self.state.read().await.live_steps(process_id))
    }

    async fn find_by_id(&self, id: StepId) -> Result<Option<ProcessStep>, RepositoryError> {
        Ok(self.state.read().await.live_step(id).cloned())
    }

    async fn append(
        &self,
        process_id: ProcessId,
        step: NewStep,
        max_steps: u32,
        now: DateTime<Utc>,
    ) -> Result<ProcessStep, RepositoryError> {
        let mut state = self.state.write().await;
        if state.touch_process(process_id, now)?.is_archived() {
            return Err(WorkflowError::validation(
                "process_id",
                format!("process `{process_id}` is archived"),
            )
            .into());
        }

        let live = state.live_steps(process_id);
        if live.len() >= max_steps as usize {
            return Err(WorkflowError::validation(
                "steps",
                format!("process `{process_id}` already has the maximum of {max_steps} steps"),
            )
            .into());
        }

        let order = live.iter().map(|step| step.order).max().unwrap_or(0) + 1;
        let created = ProcessStep {
            id: StepId(state.allocate_id()),
            process_id,
            order,
            approver: step.approver,
            description: step.description.trim().to_string(),
            timeout_days: step.timeout_days,
            created_at: now,
            updated_at: now,
        };
        state.steps.insert(created.id, created.clone());
        Ok(created)
    }

    async fn save(&self, step: &ProcessStep) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let live = state.is_live(step.id);
        let Some(stored) = state.steps.get_mut(&step.id).filter(|_| live) else {
            return Err(RepositoryError::NotFound { resource: ResourceKind::Step, id: step.id.0 });
        };
        stored.approver = step.approver;
        stored.description = step.description.clone();
        stored.timeout_days = step.timeout_days;
        stored.updated_at = step.updated_at;
        Ok(())
    }

    async fn reorder(
        &self,
        process_id: ProcessId,
        proposed: &[StepId],
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessStep>, RepositoryError> {
        let mut state = self.state.write().await;
        if !state.processes.contains_key(&process_id) {
            return Err(RepositoryError::NotFound {
                resource: ResourceKind::Process,
                id: process_id.0,
            });
        }

        let reordered = ordering::renumber(process_id, state.live_steps(process_id), proposed)?;
        state.replace_steps(&reordered, now);
        state.touch_process(process_id, now)?;
        Ok(state.live_steps(process_id))
    }

    async fn remove(
        &self,
        id: StepId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessStep>, RepositoryError> {
        let mut state = self.state.write().await;
        let Some(process_id) = state.live_step(id).map(|step| step.process_id) else {
            return Err(RepositoryError::NotFound { resource: ResourceKind::Step, id: id.0 });
        };
        state.touch_process(process_id, now)?;
        state.removed.insert(id, now);
        if let Some(step) = state.steps.get_mut(&id) {
            step.updated_at = now;
        }

        let compacted = ordering::compact(state.live_steps(process_id));
        state.replace_steps(&compacted, now);
        Ok(state.live_steps(process_id))
    }
}

#[async_trait::async_trait]
impl ApprovalRepository for InMemoryWorkflowStore {
    async fn insert(
        &self,
        submission: NewSubmission,
        now: DateTime<Utc>,
    ) -> Result<ApprovableEntity, RepositoryError> {
        let mut state = self.state.write().await;
        let entity = ApprovableEntity {
            id: EntityId(state.allocate_id()),
            process_id: submission.process_id,
            subject: submission.subject,
            submitted_by: submission.submitted_by,
            current_step_order: 1,
            status: ApprovalStatus::Pending,
            decisions: Vec::new(),
            version: 0,
            submitted_at: now,
            updated_at: now,
        };
        state.entities.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn find_by_id(&self, id: EntityId) -> Result<Option<ApprovableEntity>, RepositoryError> {
        Ok(self.state.read().await.entities.get(&id).cloned())
    }

    async fn record_decision(&self, transition: &Transition) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let entity_id = transition.entity.id;
        let decision = &transition.decision;

        let live = state.live_steps(transition.entity.process_id);
        let step_in_place = live
            .iter()
            .any(|step| step.id == decision.step_id && step.order == decision.step_order);
        let history_in_place =
            ApprovalMachine::ensure_history_in_place(&transition.entity, &live).is_ok();

        let Some(stored) = state.entities.get_mut(&entity_id) else {
            return Err(RepositoryError::NotFound { resource: ResourceKind::Entity, id: entity_id.0 });
        };
        if stored.version != transition.expected_version {
            return Err(RepositoryError::Conflict(format!(
                "entity `{entity_id}` no longer holds version {}",
                transition.expected_version
            )));
        }
        if !step_in_place {
            return Err(RepositoryError::Conflict(format!(
                "step `{}` is no longer at order {}",
                decision.step_id, decision.step_order
            )));
        }
        if !history_in_place {
            return Err(RepositoryError::Conflict(format!(
                "decided steps of entity `{entity_id}` were moved or removed"
            )));
        }
        if stored.decisions.iter().any(|existing| existing.step_order == decision.step_order) {
            return Err(RepositoryError::Conflict(format!(
                "step {} of entity `{entity_id}` is already decided",
                decision.step_order
            )));
        }

        *stored = transition.entity.clone();
        Ok(())
    }

    async fn list_pending(
        &self,
        process_id: Option<ProcessId>,
    ) -> Result<Vec<ApprovableEntity>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .entities
            .values()
            .filter(|entity| entity.status == ApprovalStatus::Pending)
            .filter(|entity| process_id.map_or(true, |process_id| entity.process_id == process_id))
            .cloned()
            .collect())
    }
}
