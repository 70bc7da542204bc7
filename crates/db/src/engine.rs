//! Transactional workflow operations.
//!
//! `WorkflowEngine` composes the repositories with the pure pieces in
//! `procura_core::workflow`. Every public operation maps storage failures
//! into [`WorkflowError`], logs a structured event and emits an audit record.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use procura_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use procura_core::config::WorkflowConfig;
use procura_core::directory::DirectoryAdapter;
use procura_core::domain::actor::UserId;
use procura_core::domain::approval::{ApprovableEntity, EntityId, NewSubmission};
use procura_core::domain::process::{
    NewProcess, Process, ProcessChanges, ProcessId, ProcessPage, ProcessPageRequest,
};
use procura_core::domain::step::{
    Approver, NewStep, ProcessStep, StepChanges, StepId, MAX_DESCRIPTION_CHARS,
};
use procura_core::errors::{ResourceKind, WorkflowError};
use procura_core::workflow::{
    sequence_from_entries, ApprovalMachine, DecisionCommand, ReorderEntry, StepResolver,
};

use crate::repositories::{
    ApprovalRepository, InMemoryWorkflowStore, ProcessRepository, RepositoryError,
    SqlApprovalRepository, SqlProcessRepository, SqlStepRepository, StepRepository,
};
use crate::DbPool;

const MAX_PAGE_SIZE: u32 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub max_steps_per_process: u32,
    pub default_page_size: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { max_steps_per_process: 64, default_page_size: 50 }
    }
}

impl From<&WorkflowConfig> for EngineSettings {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            max_steps_per_process: config.max_steps_per_process,
            default_page_size: config.default_page_size,
        }
    }
}

/// A pending entity whose current step has outlived its timeout hint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OverdueEntity {
    pub entity: ApprovableEntity,
    pub step: ProcessStep,
    pub due_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    processes: Arc<dyn ProcessRepository>,
    steps: Arc<dyn StepRepository>,
    approvals: Arc<dyn ApprovalRepository>,
    machine: ApprovalMachine,
    audit: Arc<dyn AuditSink>,
    settings: EngineSettings,
}

impl WorkflowEngine {
    pub fn new(
        processes: Arc<dyn ProcessRepository>,
        steps: Arc<dyn StepRepository>,
        approvals: Arc<dyn ApprovalRepository>,
        directory: Arc<dyn DirectoryAdapter>,
        audit: Arc<dyn AuditSink>,
        settings: EngineSettings,
    ) -> Self {
        let machine = ApprovalMachine::new(StepResolver::new(directory));
        Self { processes, steps, approvals, machine, audit, settings }
    }

    pub fn sql(
        pool: DbPool,
        directory: Arc<dyn DirectoryAdapter>,
        audit: Arc<dyn AuditSink>,
        settings: EngineSettings,
    ) -> Self {
        Self::new(
            Arc::new(SqlProcessRepository::new(pool.clone())),
            Arc::new(SqlStepRepository::new(pool.clone())),
            Arc::new(SqlApprovalRepository::new(pool)),
            directory,
            audit,
            settings,
        )
    }

    pub fn in_memory(
        directory: Arc<dyn DirectoryAdapter>,
        audit: Arc<dyn AuditSink>,
        settings: EngineSettings,
    ) -> Self {
        let store = InMemoryWorkflowStore::new();
        Self::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store),
            directory,
            audit,
            settings,
        )
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    // ---- process catalog ----

    pub async fn create_process(
        &self,
        context: &AuditContext,
        process: NewProcess,
    ) -> Result<Process, WorkflowError> {
        ensure_title(&process.title)?;
        let created =
            self.processes.insert(process, Utc::now()).await.map_err(RepositoryError::into_workflow)?;

        info!(
            event_name = "workflow.process.created",
            correlation_id = %context.correlation_id,
            process_id = created.id.0,
            status = created.status.as_str(),
            "process created"
        );
        self.record(context, "workflow.process.created", AuditCategory::Catalog, |event| {
            event.for_process(created.id).with_metadata("title", created.title.clone())
        });
        Ok(created)
    }

    pub async fn update_process(
        &self,
        context: &AuditContext,
        id: ProcessId,
        changes: ProcessChanges,
    ) -> Result<Process, WorkflowError> {
        if let Some(title) = &changes.title {
            ensure_title(title)?;
        }
        let mut process = self.get_process(id).await?;
        if changes.is_empty() {
            return Ok(process);
        }
        changes.apply_to(&mut process);
        process.updated_at = Utc::now();
        self.processes.save(&process).await.map_err(RepositoryError::into_workflow)?;

        info!(
            event_name = "workflow.process.updated",
            correlation_id = %context.correlation_id,
            process_id = id.0,
            is_active = process.is_active,
            "process updated"
        );
        self.record(context, "workflow.process.updated", AuditCategory::Catalog, |event| {
            event.for_process(id)
        });
        Ok(process)
    }

    /// Stops new submissions; entities already in the chain keep moving.
    pub async fn deactivate(
        &self,
        context: &AuditContext,
        id: ProcessId,
    ) -> Result<Process, WorkflowError> {
        self.update_process(context, id, ProcessChanges { is_active: Some(false), ..Default::default() })
            .await
    }

    /// Soft delete. Steps and entities stay readable.
    pub async fn archive(
        &self,
        context: &AuditContext,
        id: ProcessId,
    ) -> Result<Process, WorkflowError> {
        let mut process = self.get_process(id).await?;
        if process.is_archived() {
            return Ok(process);
        }
        let now = Utc::now();
        process.is_active = false;
        process.archived_at = Some(now);
        process.updated_at = now;
        self.processes.save(&process).await.map_err(RepositoryError::into_workflow)?;

        info!(
            event_name = "workflow.process.archived",
            correlation_id = %context.correlation_id,
            process_id = id.0,
            "process archived"
        );
        self.record(context, "workflow.process.archived", AuditCategory::Catalog, |event| {
            event.for_process(id)
        });
        Ok(process)
    }

    pub async fn get_process(&self, id: ProcessId) -> Result<Process, WorkflowError> {
        self.processes
            .find_by_id(id)
            .await
            .map_err(RepositoryError::into_workflow)?
            .ok_or_else(|| WorkflowError::not_found(ResourceKind::Process, id.0))
    }

    /// One keyset page; `limit` falls back to the configured page size.
    pub async fn list_processes(
        &self,
        after: Option<ProcessId>,
        limit: Option<u32>,
        include_archived: bool,
    ) -> Result<ProcessPage, WorkflowError> {
        let limit = limit.unwrap_or(self.settings.default_page_size);
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(WorkflowError::validation(
                "limit",
                format!("must be between 1 and {MAX_PAGE_SIZE}"),
            ));
        }
        self.processes
            .list_page(ProcessPageRequest { after, limit, include_archived })
            .await
            .map_err(RepositoryError::into_workflow)
    }

    pub fn process_pages(&self, include_archived: bool) -> ProcessPages<'_> {
        ProcessPages {
            engine: self,
            include_archived,
            cursor: None,
            exhausted: false,
        }
    }

    // ---- step store ----

    pub async fn add_step(
        &self,
        context: &AuditContext,
        process_id: ProcessId,
        step: NewStep,
    ) -> Result<ProcessStep, WorkflowError> {
        ensure_approver(&step.approver)?;
        ensure_description(&step.description)?;
        ensure_timeout(step.timeout_days)?;

        let created = self
            .steps
            .append(process_id, step, self.settings.max_steps_per_process, Utc::now())
            .await
            .map_err(RepositoryError::into_workflow)?;

        info!(
            event_name = "workflow.step.added",
            correlation_id = %context.correlation_id,
            process_id = process_id.0,
            step_id = created.id.0,
            order = created.order,
            approver = %created.approver,
            "step appended"
        );
        self.record(context, "workflow.step.added", AuditCategory::Steps, |event| {
            event
                .for_process(process_id)
                .with_metadata("step_id", created.id.to_string())
                .with_metadata("order", created.order.to_string())
        });
        Ok(created)
    }

    /// Edits a live step in place. The order never changes here.
    pub async fn update_step(
        &self,
        context: &AuditContext,
        id: StepId,
        changes: StepChanges,
    ) -> Result<ProcessStep, WorkflowError> {
        if let Some(approver) = &changes.approver {
            ensure_approver(approver)?;
        }
        if let Some(description) = &changes.description {
            ensure_description(description)?;
        }
        if let Some(timeout_days) = changes.timeout_days {
            ensure_timeout(timeout_days)?;
        }

        let mut step = self
            .steps
            .find_by_id(id)
            .await
            .map_err(RepositoryError::into_workflow)?
            .ok_or_else(|| WorkflowError::not_found(ResourceKind::Step, id.0))?;
        changes.apply_to(&mut step);
        step.updated_at = Utc::now();
        self.steps.save(&step).await.map_err(RepositoryError::into_workflow)?;

        info!(
            event_name = "workflow.step.updated",
            correlation_id = %context.correlation_id,
            process_id = step.process_id.0,
            step_id = id.0,
            "step updated"
        );
        self.record(context, "workflow.step.updated", AuditCategory::Steps, |event| {
            event.for_process(step.process_id).with_metadata("step_id", id.to_string())
        });
        Ok(step)
    }

    /// Soft-deletes the step and renumbers the rest to `1..N-1`.
    pub async fn remove_step(
        &self,
        context: &AuditContext,
        id: StepId,
    ) -> Result<Vec<ProcessStep>, WorkflowError> {
        let remaining =
            self.steps.remove(id, Utc::now()).await.map_err(RepositoryError::into_workflow)?;
        let process_id = remaining.first().map(|step| step.process_id);

        info!(
            event_name = "workflow.step.removed",
            correlation_id = %context.correlation_id,
            step_id = id.0,
            remaining = remaining.len(),
            "step removed"
        );
        self.record(context, "workflow.step.removed", AuditCategory::Steps, |event| {
            let event = event.with_metadata("step_id", id.to_string());
            match process_id {
                Some(process_id) => event.for_process(process_id),
                None => event,
            }
        });
        Ok(remaining)
    }

    /// Authoritative ascending read path.
    pub async fn ordered_steps(&self, process_id: ProcessId) -> Result<Vec<ProcessStep>, WorkflowError> {
        self.get_process(process_id).await?;
        self.steps.list_for_process(process_id).await.map_err(RepositoryError::into_workflow)
    }

    /// Replaces every step's order with its index in `proposed`, atomically.
    /// Returns the re-fetched ordering.
    pub async fn reorder(
        &self,
        context: &AuditContext,
        process_id: ProcessId,
        proposed: &[StepId],
    ) -> Result<Vec<ProcessStep>, WorkflowError> {
        let outcome = self.steps.reorder(process_id, proposed, Utc::now()).await;
        if let Err(error) = &outcome {
            warn!(
                event_name = "workflow.steps.reorder_refused",
                correlation_id = %context.correlation_id,
                process_id = process_id.0,
                error = %error,
                "reorder refused"
            );
        }
        outcome.map_err(RepositoryError::into_workflow)?;

        let steps = self.ordered_steps(process_id).await?;
        info!(
            event_name = "workflow.steps.reordered",
            correlation_id = %context.correlation_id,
            process_id = process_id.0,
            step_count = steps.len(),
            "steps reordered"
        );
        let sequence =
            steps.iter().map(|step| step.id.to_string()).collect::<Vec<_>>().join(",");
        self.record(context, "workflow.steps.reordered", AuditCategory::Reorder, |event| {
            event.for_process(process_id).with_metadata("sequence", sequence)
        });
        Ok(steps)
    }

    /// Reorder from `{id, order}` rows as sent by a drag-and-drop client.
    pub async fn reorder_entries(
        &self,
        context: &AuditContext,
        process_id: ProcessId,
        entries: &[ReorderEntry],
    ) -> Result<Vec<ProcessStep>, WorkflowError> {
        let proposed = sequence_from_entries(entries)?;
        self.reorder(context, process_id, &proposed).await
    }

    // ---- approval lifecycle ----

    pub async fn submit(
        &self,
        context: &AuditContext,
        submission: NewSubmission,
    ) -> Result<ApprovableEntity, WorkflowError> {
        if submission.subject.kind.trim().is_empty() {
            return Err(WorkflowError::validation("subject_kind", "must not be empty"));
        }
        if submission.subject.id.trim().is_empty() {
            return Err(WorkflowError::validation("subject_id", "must not be empty"));
        }

        let process = self.get_process(submission.process_id).await?;
        let steps = self
            .steps
            .list_for_process(process.id)
            .await
            .map_err(RepositoryError::into_workflow)?;
        ApprovalMachine::ensure_submittable(&process, steps.len())?;

        let entity = self
            .approvals
            .insert(submission, Utc::now())
            .await
            .map_err(RepositoryError::into_workflow)?;

        info!(
            event_name = "workflow.entity.submitted",
            correlation_id = %context.correlation_id,
            process_id = process.id.0,
            entity_id = entity.id.0,
            actor_id = entity.submitted_by.0,
            "entity submitted"
        );
        self.record(context, "workflow.entity.submitted", AuditCategory::Decision, |event| {
            event
                .for_process(process.id)
                .for_entity(entity.id)
                .with_metadata("subject", format!("{}:{}", entity.subject.kind, entity.subject.id))
        });
        Ok(entity)
    }

    pub async fn get_entity(&self, id: EntityId) -> Result<ApprovableEntity, WorkflowError> {
        self.approvals
            .find_by_id(id)
            .await
            .map_err(RepositoryError::into_workflow)?
            .ok_or_else(|| WorkflowError::not_found(ResourceKind::Entity, id.0))
    }

    /// Records one decision on the entity's current step. The write is
    /// conditional on the entity version read here; losing a race yields
    /// `ConcurrentModification` and nothing is written.
    pub async fn decide(
        &self,
        context: &AuditContext,
        id: EntityId,
        command: DecisionCommand,
    ) -> Result<ApprovableEntity, WorkflowError> {
        let entity = self.get_entity(id).await?;
        let steps = self
            .steps
            .list_for_process(entity.process_id)
            .await
            .map_err(RepositoryError::into_workflow)?;

        let actor = command.actor;
        let outcome = command.outcome;
        let transition = match self.machine.decide(&entity, &steps, command, Utc::now()).await {
            Ok(transition) => transition,
            Err(error) => {
                self.decision_refused(context, &entity, actor, &error);
                return Err(error);
            }
        };

        if let Err(error) = self.approvals.record_decision(&transition).await {
            let error = match error {
                RepositoryError::Conflict(reason) => WorkflowError::ConcurrentModification {
                    entity: entity.id,
                    expected_version: transition.expected_version,
                    reason,
                },
                other => other.into_workflow(),
            };
            self.decision_refused(context, &entity, actor, &error);
            return Err(error);
        }

        let decided = transition.entity;
        info!(
            event_name = "workflow.entity.decided",
            correlation_id = %context.correlation_id,
            process_id = decided.process_id.0,
            entity_id = decided.id.0,
            actor_id = actor.0,
            outcome = outcome.as_str(),
            step_order = transition.decision.step_order,
            status = decided.status.as_str(),
            "decision recorded"
        );
        self.record(context, "workflow.entity.decided", AuditCategory::Decision, |event| {
            event
                .for_process(decided.process_id)
                .for_entity(decided.id)
                .with_metadata("outcome", outcome.as_str())
                .with_metadata("step_order", transition.decision.step_order.to_string())
                .with_metadata("status", decided.status.as_str())
        });
        Ok(decided)
    }

    /// Inbox: pending entities whose current step `actor` may decide.
    pub async fn pending_for(&self, actor: UserId) -> Result<Vec<ApprovableEntity>, WorkflowError> {
        let pending = self.approvals.list_pending(None).await.map_err(RepositoryError::into_workflow)?;
        let mut chains: BTreeMap<ProcessId, Vec<ProcessStep>> = BTreeMap::new();
        let mut inbox = Vec::new();

        for entity in pending {
            let Some(step) = self.current_step(&mut chains, &entity).await? else {
                continue;
            };
            if self.machine.resolver().can_act(&step, actor).await? {
                inbox.push(entity);
            }
        }
        Ok(inbox)
    }

    /// Users entitled to decide the entity's current step. Empty once the
    /// entity is terminal.
    pub async fn eligible_actors(&self, id: EntityId) -> Result<Vec<UserId>, WorkflowError> {
        let entity = self.get_entity(id).await?;
        if entity.is_terminal() {
            return Ok(Vec::new());
        }
        let mut chains = BTreeMap::new();
        match self.current_step(&mut chains, &entity).await? {
            Some(step) => self.machine.resolver().eligible_actors(&step).await,
            None => Ok(Vec::new()),
        }
    }

    /// Pending entities whose current step was entered more than its
    /// `timeout_days` before `now`. Advisory only.
    pub async fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<OverdueEntity>, WorkflowError> {
        let pending = self.approvals.list_pending(None).await.map_err(RepositoryError::into_workflow)?;
        let mut chains = BTreeMap::new();
        let mut overdue = Vec::new();

        for entity in pending {
            let Some(step) = self.current_step(&mut chains, &entity).await? else {
                continue;
            };
            let Some(due_at) = entity.current_step_due_at(step.timeout_days) else {
                continue;
            };
            if due_at < now {
                overdue.push(OverdueEntity { entity, step, due_at });
            }
        }
        Ok(overdue)
    }

    async fn current_step(
        &self,
        chains: &mut BTreeMap<ProcessId, Vec<ProcessStep>>,
        entity: &ApprovableEntity,
    ) -> Result<Option<ProcessStep>, WorkflowError> {
        if !chains.contains_key(&entity.process_id) {
            let steps = self
                .steps
                .list_for_process(entity.process_id)
                .await
                .map_err(RepositoryError::into_workflow)?;
            chains.insert(entity.process_id, steps);
        }
        Ok(chains
            .get(&entity.process_id)
            .and_then(|steps| steps.iter().find(|step| step.order == entity.current_step_order))
            .cloned())
    }

    fn decision_refused(
        &self,
        context: &AuditContext,
        entity: &ApprovableEntity,
        actor: UserId,
        error: &WorkflowError,
    ) {
        warn!(
            event_name = "workflow.entity.decision_refused",
            correlation_id = %context.correlation_id,
            entity_id = entity.id.0,
            actor_id = actor.0,
            step_order = entity.current_step_order,
            error_kind = error.kind(),
            error = %error,
            "decision refused"
        );
        let outcome = if error.is_retryable() { AuditOutcome::Failed } else { AuditOutcome::Rejected };
        self.audit.emit(
            AuditEvent::new(context, "workflow.entity.decision_refused", AuditCategory::Decision, outcome)
                .for_process(entity.process_id)
                .for_entity(entity.id)
                .with_metadata("error_kind", error.kind()),
        );
    }

    fn record(
        &self,
        context: &AuditContext,
        event_type: &str,
        category: AuditCategory,
        build: impl FnOnce(AuditEvent) -> AuditEvent,
    ) {
        let event = AuditEvent::new(context, event_type, category, AuditOutcome::Success);
        self.audit.emit(build(event));
    }
}

/// Restartable walk over the catalog, one keyset page at a time.
pub struct ProcessPages<'a> {
    engine: &'a WorkflowEngine,
    include_archived: bool,
    cursor: Option<ProcessId>,
    exhausted: bool,
}

impl ProcessPages<'_> {
    /// `Ok(None)` once every page has been returned.
    pub async fn next_page(&mut self) -> Result<Option<ProcessPage>, WorkflowError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self.engine.list_processes(self.cursor, None, self.include_archived).await?;
        self.cursor = page.next_after;
        self.exhausted = page.next_after.is_none();
        if page.items.is_empty() {
            return Ok(None);
        }
        Ok(Some(page))
    }

    pub fn restart(&mut self) {
        self.cursor = None;
        self.exhausted = false;
    }

    pub async fn collect_all(mut self) -> Result<Vec<Process>, WorkflowError> {
        let mut processes = Vec::new();
        while let Some(page) = self.next_page().await? {
            processes.extend(page.items);
        }
        Ok(processes)
    }
}

fn ensure_title(title: &str) -> Result<(), WorkflowError> {
    if title.trim().is_empty() {
        return Err(WorkflowError::validation("title", "must not be empty"));
    }
    Ok(())
}

fn ensure_approver(approver: &Approver) -> Result<(), WorkflowError> {
    let id = match approver {
        Approver::User(user) => user.0,
        Approver::Designation(designation) => designation.0,
    };
    if id <= 0 {
        return Err(WorkflowError::validation("approver", "ids must be positive"));
    }
    Ok(())
}

fn ensure_description(description: &str) -> Result<(), WorkflowError> {
    if description.trim().chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(WorkflowError::validation(
            "description",
            format!("must be at most {MAX_DESCRIPTION_CHARS} characters"),
        ));
    }
    Ok(())
}

fn ensure_timeout(timeout_days: Option<u32>) -> Result<(), WorkflowError> {
    if timeout_days == Some(0) {
        return Err(WorkflowError::validation("timeout_days", "must be positive when set"));
    }
    Ok(())
}
