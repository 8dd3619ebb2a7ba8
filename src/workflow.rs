//! Deriving deployment events from CI workflow runs
//!
//! Repositories that never create deployment records still deploy from CI.
//! Runs that look like deployments are converted into [`DeploymentEvent`]s
//! so the same engine can process them.

use crate::model::{DeploymentEvent, DeploymentOutcome, WorkflowRunEvent};

const DEPLOYMENT_INDICATORS: &[&str] = &[
    "deploy",
    "release",
    "publish",
    "continuous delivery",
    "continuous deployment",
    "promote",
    "provision",
    "rollout",
    "production",
    "staging",
    "prod",
    "push-to",
    "push_to",
    "delivery",
];

const DEPLOYMENT_TRIGGERS: &[&str] = &["deployment", "release"];

/// Whether a run's name, workflow path or trigger marks it as a deployment
pub fn is_deployment_workflow(run: &WorkflowRunEvent) -> bool {
    let name = run.name.to_lowercase();
    let path = run.path.to_lowercase();

    if DEPLOYMENT_INDICATORS
        .iter()
        .any(|indicator| name.contains(indicator) || path.contains(indicator))
    {
        return true;
    }

    // "cd" only as a whole word, it is a substring of too many names
    if name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word == "cd")
    {
        return true;
    }

    DEPLOYMENT_TRIGGERS.contains(&run.event.to_lowercase().as_str())
}

/// Converts a deployment-like run into a deployment to `environment`.
///
/// The run completes at `completed_at`; runs still going are stamped with
/// their creation time and stay in progress until a later delivery.
pub fn to_deployment_event(run: &WorkflowRunEvent, environment: &str) -> DeploymentEvent {
    let timestamp = run.completed_at.unwrap_or(run.timestamp);
    let outcome = DeploymentOutcome::from(&run.conclusion);

    let event = DeploymentEvent::new(
        run.repository.clone(),
        format!("run-{}", run.run_id),
        timestamp,
        environment,
        outcome,
    );

    match (&run.head_sha, run.head_commit_at) {
        (Some(sha), Some(authored_at)) => event.with_commit(sha.clone(), authored_at),
        _ => event,
    }
}

/// Keeps deployment-like runs and converts them
pub fn deployments_from_runs(runs: &[WorkflowRunEvent], environment: &str) -> Vec<DeploymentEvent> {
    runs.iter()
        .filter(|run| is_deployment_workflow(run))
        .map(|run| to_deployment_event(run, environment))
        .collect()
}
