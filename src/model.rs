//! Deployment, workflow run and incident data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{CollectorError, Result};

/// Identifies a repository as an `(owner, name)` pair
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryId {
    pub owner: String,
    #[serde(alias = "repo")]
    pub name: String,
}

impl RepositoryId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Metric label value, `owner/name`
    pub fn label(&self) -> String {
        self.to_string()
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("owner", &self.owner), ("name", &self.name)] {
            if value.trim().is_empty() {
                return Err(CollectorError::Config(format!(
                    "repository {} cannot be empty",
                    field
                )));
            }
            if !value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                return Err(CollectorError::Config(format!(
                    "repository {} '{}' contains invalid characters",
                    field, value
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepositoryId {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self> {
        let (owner, name) = s.trim().split_once('/').ok_or_else(|| {
            CollectorError::Config(format!("repository '{}' must be in owner/name form", s))
        })?;
        let id = RepositoryId::new(owner, name);
        id.validate()?;
        Ok(id)
    }
}

/// Resolved state of a deployment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOutcome {
    Success,
    Failure,
    InProgress,
    Unknown,
}

impl DeploymentOutcome {
    /// Success and failure are final; anything else may still change
    pub fn is_resolved(&self) -> bool {
        matches!(self, DeploymentOutcome::Success | DeploymentOutcome::Failure)
    }
}

impl fmt::Display for DeploymentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentOutcome::Success => write!(f, "success"),
            DeploymentOutcome::Failure => write!(f, "failure"),
            DeploymentOutcome::InProgress => write!(f, "in_progress"),
            DeploymentOutcome::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<&str> for DeploymentOutcome {
    /// Maps a GitHub deployment status state
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            // inactive marks a formerly successful deployment that was superseded
            "success" | "inactive" => DeploymentOutcome::Success,
            "failure" | "error" => DeploymentOutcome::Failure,
            "pending" | "queued" | "in_progress" => DeploymentOutcome::InProgress,
            _ => DeploymentOutcome::Unknown,
        }
    }
}

/// Latest status a source reports for a single deployment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub outcome: DeploymentOutcome,
    pub timestamp: DateTime<Utc>,
}

/// The change a deployment shipped
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReference {
    pub sha: String,
    pub authored_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub repository: RepositoryId,
    pub deployment_id: String,
    /// Completion instant of the deployment (time of its latest status)
    pub timestamp: DateTime<Utc>,
    pub environment: String,
    pub outcome: DeploymentOutcome,
    pub commit: Option<CommitReference>,
}

impl DeploymentEvent {
    pub fn new(
        repository: RepositoryId,
        deployment_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        environment: impl Into<String>,
        outcome: DeploymentOutcome,
    ) -> Self {
        Self {
            repository,
            deployment_id: deployment_id.into(),
            timestamp,
            environment: environment.into(),
            outcome,
            commit: None,
        }
    }

    pub fn with_commit(mut self, sha: impl Into<String>, authored_at: DateTime<Utc>) -> Self {
        self.commit = Some(CommitReference {
            sha: sha.into(),
            authored_at,
        });
        self
    }

    /// The same deployment as seen under a later status.
    ///
    /// The timestamp never moves backwards.
    pub fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.outcome = status.outcome;
        self.timestamp = self.timestamp.max(status.timestamp);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.deployment_id.trim().is_empty() {
            return Err(CollectorError::MalformedEvent(
                "deployment_id cannot be empty".to_string(),
            ));
        }
        if self.environment.trim().is_empty() {
            return Err(CollectorError::MalformedEvent(format!(
                "deployment {} has no environment",
                self.deployment_id
            )));
        }
        Ok(())
    }

    /// Seconds from authoring the shipped commit to completing the deployment.
    ///
    /// `None` when the commit is unknown or was authored after completion.
    pub fn lead_time_seconds(&self) -> Option<i64> {
        let commit = self.commit.as_ref()?;
        let seconds = (self.timestamp - commit.authored_at).num_seconds();
        (seconds >= 0).then_some(seconds)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowConclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
    Skipped,
    Neutral,
    /// Run has not concluded yet
    Pending,
    Other(String),
}

impl From<Option<&str>> for WorkflowConclusion {
    fn from(s: Option<&str>) -> Self {
        match s.map(|s| s.to_lowercase()) {
            None => WorkflowConclusion::Pending,
            Some(s) => match s.as_str() {
                "success" => WorkflowConclusion::Success,
                "failure" | "startup_failure" => WorkflowConclusion::Failure,
                "cancelled" => WorkflowConclusion::Cancelled,
                "timed_out" => WorkflowConclusion::TimedOut,
                "skipped" => WorkflowConclusion::Skipped,
                "neutral" => WorkflowConclusion::Neutral,
                "" => WorkflowConclusion::Pending,
                _ => WorkflowConclusion::Other(s),
            },
        }
    }
}

impl From<&WorkflowConclusion> for DeploymentOutcome {
    fn from(conclusion: &WorkflowConclusion) -> Self {
        match conclusion {
            WorkflowConclusion::Success => DeploymentOutcome::Success,
            WorkflowConclusion::Failure | WorkflowConclusion::TimedOut => {
                DeploymentOutcome::Failure
            }
            WorkflowConclusion::Pending => DeploymentOutcome::InProgress,
            _ => DeploymentOutcome::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunEvent {
    pub repository: RepositoryId,
    pub run_id: u64,
    pub name: String,
    pub path: String,
    /// Event that triggered the run (`push`, `release`, `deployment`, ...)
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub conclusion: WorkflowConclusion,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub head_sha: Option<String>,
    pub head_commit_at: Option<DateTime<Utc>>,
}

/// Unavailability of an environment between a failing and a restoring deployment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureIncident {
    pub repository: RepositoryId,
    pub environment: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    /// Failures observed while the incident was open, the opening one included
    pub failed_deployments: u32,
}

impl FailureIncident {
    pub fn open(repository: RepositoryId, environment: &str, opened_at: DateTime<Utc>) -> Self {
        Self {
            repository,
            environment: environment.to_string(),
            opened_at,
            closed_at: None,
            duration_seconds: None,
            failed_deployments: 1,
        }
    }

    /// Closes the incident, refusing restorations that do not come strictly later.
    pub fn close(&mut self, closed_at: DateTime<Utc>) -> bool {
        if closed_at <= self.opened_at {
            return false;
        }
        self.closed_at = Some(closed_at);
        self.duration_seconds = Some((closed_at - self.opened_at).num_seconds());
        true
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}
