//! Event source abstraction

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::model::{DeploymentEvent, DeploymentStatus, RepositoryId, WorkflowRunEvent};

/// Supplies deployment and workflow history for a repository.
///
/// Implementations return events whose timestamp is at or after `since`.
/// An error is scoped to the repository being queried.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn list_deployments(
        &self,
        repository: &RepositoryId,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeploymentEvent>>;

    async fn list_workflow_runs(
        &self,
        repository: &RepositoryId,
        since: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRunEvent>>;

    /// Current status of a deployment returned by an earlier listing.
    ///
    /// `None` when the source cannot look a single deployment up.
    async fn deployment_status(
        &self,
        _repository: &RepositoryId,
        _deployment_id: &str,
    ) -> Result<Option<DeploymentStatus>> {
        Ok(None)
    }
}
