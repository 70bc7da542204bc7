//! Read-only port onto the user/designation directory.
//!
//! The directory is owned by another system; the engine only asks which
//! designation a user holds and, for notifications, who holds a designation.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::actor::{DesignationId, UserId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DirectoryAdapter: Send + Sync {
    /// `Ok(None)` when the user is unknown or holds no designation.
    async fn designation_of(&self, user: UserId) -> Result<Option<DesignationId>, DirectoryError>;

    async fn holders_of(&self, designation: DesignationId) -> Result<Vec<UserId>, DirectoryError>;
}

/// Fixed user-to-designation map, for tests and embedded deployments.
#[derive(Clone, Default)]
pub struct StaticDirectory {
    assignments: Arc<RwLock<BTreeMap<UserId, DesignationId>>>,
}

impl StaticDirectory {
    pub fn new(assignments: impl IntoIterator<Item = (UserId, DesignationId)>) -> Self {
        Self { assignments: Arc::new(RwLock::new(assignments.into_iter().collect())) }
    }

    pub fn assign(&self, user: UserId, designation: DesignationId) {
        match self.assignments.write() {
            Ok(mut assignments) => assignments.insert(user, designation),
            Err(poisoned) => poisoned.into_inner().insert(user, designation),
        };
    }

    pub fn unassign(&self, user: UserId) {
        match self.assignments.write() {
            Ok(mut assignments) => assignments.remove(&user),
            Err(poisoned) => poisoned.into_inner().remove(&user),
        };
    }

    fn snapshot(&self) -> BTreeMap<UserId, DesignationId> {
        match self.assignments.read() {
            Ok(assignments) => assignments.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl DirectoryAdapter for StaticDirectory {
    async fn designation_of(&self, user: UserId) -> Result<Option<DesignationId>, DirectoryError> {
        Ok(self.snapshot().get(&user).copied())
    }

    async fn holders_of(&self, designation: DesignationId) -> Result<Vec<UserId>, DirectoryError> {
        Ok(self
            .snapshot()
            .into_iter()
            .filter_map(|(user, held)| (held == designation).then_some(user))
            .collect())
    }
}
