use std::sync::Arc;

use crate::directory::DirectoryAdapter;
use crate::domain::actor::UserId;
use crate::domain::step::{Approver, ProcessStep};
use crate::errors::WorkflowError;

/// Decides whether an actor is entitled to decide a step. Designation-bound
/// steps are resolved against the directory at call time, so a user who
/// changes designation gains or loses access immediately.
#[derive(Clone)]
pub struct StepResolver {
    directory: Arc<dyn DirectoryAdapter>,
}

impl StepResolver {
    pub fn new(directory: Arc<dyn DirectoryAdapter>) -> Self {
        Self { directory }
    }

    pub async fn can_act(&self, step: &ProcessStep, actor: UserId) -> Result<bool, WorkflowError> {
        match step.approver {
            Approver::User(user) => Ok(user == actor),
            Approver::Designation(designation) => {
                let held = self
                    .directory
                    .designation_of(actor)
                    .await
                    .map_err(|error| WorkflowError::Directory(error.to_string()))?;
                Ok(held == Some(designation))
            }
        }
    }

    pub async fn eligible_actors(&self, step: &ProcessStep) -> Result<Vec<UserId>, WorkflowError> {
        match step.approver {
            Approver::User(user) => Ok(vec![user]),
            Approver::Designation(designation) => self
                .directory
                .holders_of(designation)
                .await
                .map_err(|error| WorkflowError::Directory(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::StepResolver;
    use crate::directory::{DirectoryAdapter, DirectoryError, StaticDirectory};
    use crate::domain::actor::{DesignationId, UserId};
    use crate::domain::process::ProcessId;
    use crate::domain::step::{Approver, ProcessStep, StepId};
    use crate::errors::WorkflowError;

    fn step(approver: Approver) -> ProcessStep {
        let now = Utc::now();
        ProcessStep {
            id: StepId(1),
            process_id: ProcessId(1),
            order: 1,
            approver,
            description: "Review".to_string(),
            timeout_days: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn resolver() -> StepResolver {
        StepResolver::new(Arc::new(StaticDirectory::new([
            (UserId(4), DesignationId(2)),
            (UserId(5), DesignationId(2)),
            (UserId(7), DesignationId(3)),
        ])))
    }

    #[tokio::test]
    async fn user_step_matches_only_that_user() {
        let resolver = resolver();
        let step = step(Approver::User(UserId(7)));

        assert_eq!(resolver.can_act(&step, UserId(7)).await, Ok(true));
        assert_eq!(resolver.can_act(&step, UserId(4)).await, Ok(false));
    }

    #[tokio::test]
    async fn designation_step_matches_every_holder_and_nobody_else() {
        let resolver = resolver();
        let step = step(Approver::Designation(DesignationId(2)));

        assert_eq!(resolver.can_act(&step, UserId(4)).await, Ok(true));
        assert_eq!(resolver.can_act(&step, UserId(5)).await, Ok(true));
        assert_eq!(resolver.can_act(&step, UserId(7)).await, Ok(false));
        assert_eq!(resolver.can_act(&step, UserId(42)).await, Ok(false));
    }

    #[tokio::test]
    async fn eligible_actors_expand_designations() {
        let resolver = resolver();

        assert_eq!(
            resolver.eligible_actors(&step(Approver::Designation(DesignationId(2)))).await,
            Ok(vec![UserId(4), UserId(5)])
        );
        assert_eq!(
            resolver.eligible_actors(&step(Approver::User(UserId(9)))).await,
            Ok(vec![UserId(9)])
        );
    }

    struct DownDirectory;

    #[async_trait]
    impl DirectoryAdapter for DownDirectory {
        async fn designation_of(
            &self,
            _user: UserId,
        ) -> Result<Option<DesignationId>, DirectoryError> {
            Err(DirectoryError::Unavailable("ldap timeout".to_string()))
        }

        async fn holders_of(
            &self,
            _designation: DesignationId,
        ) -> Result<Vec<UserId>, DirectoryError> {
            Err(DirectoryError::Unavailable("ldap timeout".to_string()))
        }
    }

    #[tokio::test]
    async fn directory_outage_surfaces_as_error_not_denial() {
        let resolver = StepResolver::new(Arc::new(DownDirectory));

        let result = resolver.can_act(&step(Approver::Designation(DesignationId(2))), UserId(4)).await;
        assert!(matches!(result, Err(WorkflowError::Directory(_))));

        let direct = resolver.can_act(&step(Approver::User(UserId(4))), UserId(4)).await;
        assert_eq!(direct, Ok(true));
    }
}
