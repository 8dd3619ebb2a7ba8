//! DORA engine: one collection cycle per call
//!
//! A cycle pulls the events newer than the repository's cursor, merges them
//! into the repository's state, recomputes the indicators and publishes them.
//! Nothing is published and the state is untouched when fetching fails.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, EventMode};
use crate::errors::Result;
use crate::indicators::{self, DoraSnapshot, EnvironmentFilter};
use crate::model::{DeploymentEvent, RepositoryId};
use crate::registry::{Metric, MetricRegistry};
use crate::source::EventSource;
use crate::state::{EventOrigin, IngestReport, RepositoryState};
use crate::workflow;

/// Engine tuning derived from the configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub window: Duration,
    pub environments: EnvironmentFilter,
    pub event_mode: EventMode,
    pub workflow_environment: String,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window: config.window(),
            environments: EnvironmentFilter::new(&config.production_environments),
            event_mode: config.event_mode,
            workflow_environment: config.workflow_environment.clone(),
        }
    }

    /// Deployments older than this are dropped from state
    pub fn retention(&self) -> Duration {
        self.window * 2
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Result of a completed cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub since: DateTime<Utc>,
    pub origin: EventOrigin,
    pub ingest: IngestReport,
    pub pruned: usize,
    pub snapshot: DoraSnapshot,
}

pub struct DoraEngine {
    source: Arc<dyn EventSource>,
    registry: Arc<dyn MetricRegistry>,
    settings: EngineSettings,
}

impl DoraEngine {
    pub fn new(
        source: Arc<dyn EventSource>,
        registry: Arc<dyn MetricRegistry>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            source,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run one collection cycle for the repository owning `state`.
    ///
    /// On error the state and the published values are left as they were.
    #[instrument(skip(self, state), fields(repository = %state.repository()))]
    pub async fn run_cycle(
        &self,
        state: &mut RepositoryState,
        now: DateTime<Utc>,
    ) -> Result<CycleReport> {
        let since = state
            .last_seen_cursor()
            .unwrap_or(now - self.settings.window);

        let (origin, batch) = self.fetch(state, since).await?;

        if state.origin().is_none() && !batch.is_empty() {
            state.set_origin(origin);
        }
        let ingest = state.ingest(batch);
        if ingest.dropped > 0 {
            warn!(
                "Dropped {} malformed events for {}",
                ingest.dropped,
                state.repository()
            );
        }
        let pruned = state.prune_before(now - self.settings.retention());

        let snapshot = indicators::compute(
            state,
            now,
            self.settings.window,
            &self.settings.environments,
        );
        self.publish(&snapshot, now);
        log_summary(&snapshot);

        Ok(CycleReport {
            since,
            origin,
            ingest,
            pruned,
            snapshot,
        })
    }

    async fn fetch(
        &self,
        state: &RepositoryState,
        since: DateTime<Utc>,
    ) -> Result<(EventOrigin, Vec<DeploymentEvent>)> {
        let repository = state.repository();

        let use_workflows = match self.settings.event_mode {
            EventMode::Deployments => false,
            EventMode::Workflows => true,
            EventMode::Auto => state.origin() == Some(EventOrigin::WorkflowRuns),
        };
        if use_workflows {
            return Ok((EventOrigin::WorkflowRuns, self.fetch_workflow_runs(repository, since).await?));
        }

        let mut deployments = self.source.list_deployments(repository, since).await?;
        if self.settings.event_mode == EventMode::Auto
            && deployments.is_empty()
            && state.origin().is_none()
        {
            info!(
                "No deployment records for {}, deriving deployments from workflow runs",
                repository
            );
            let derived = self.fetch_workflow_runs(repository, since).await?;
            return Ok((EventOrigin::WorkflowRuns, derived));
        }

        let refreshed = self.refresh_unresolved(state, &deployments).await?;
        deployments.extend(refreshed);
        Ok((EventOrigin::Deployments, deployments))
    }

    /// Re-reads held deployments that are still pending and were not listed again
    async fn refresh_unresolved(
        &self,
        state: &RepositoryState,
        listed: &[DeploymentEvent],
    ) -> Result<Vec<DeploymentEvent>> {
        let listed: HashSet<&str> = listed.iter().map(|e| e.deployment_id.as_str()).collect();
        let mut refreshed = Vec::new();

        for held in state.deployments() {
            if held.outcome.is_resolved() || listed.contains(held.deployment_id.as_str()) {
                continue;
            }
            let status = self
                .source
                .deployment_status(state.repository(), &held.deployment_id)
                .await?;
            if let Some(status) = status.filter(|s| s.outcome != held.outcome) {
                debug!(
                    "Deployment {} of {} moved from {} to {}",
                    held.deployment_id,
                    state.repository(),
                    held.outcome,
                    status.outcome
                );
                refreshed.push(held.clone().with_status(status));
            }
        }

        if !refreshed.is_empty() {
            info!(
                "Resolved {} pending deployments for {}",
                refreshed.len(),
                state.repository()
            );
        }
        Ok(refreshed)
    }

    async fn fetch_workflow_runs(
        &self,
        repository: &RepositoryId,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeploymentEvent>> {
        let runs = self.source.list_workflow_runs(repository, since).await?;
        let deployments =
            workflow::deployments_from_runs(&runs, &self.settings.workflow_environment);
        info!(
            "Identified {} deployment workflows out of {} runs for {}",
            deployments.len(),
            runs.len(),
            repository
        );
        Ok(deployments)
    }

    /// Overwrite the repository's gauges with `snapshot`
    pub fn publish(&self, snapshot: &DoraSnapshot, now: DateTime<Utc>) {
        let repository = &snapshot.repository;
        let set = |metric, value: f64| self.registry.set(metric, repository, value);

        set(Metric::DeploymentFrequency, snapshot.deployment_frequency);
        set(Metric::LeadTime, snapshot.lead_time_seconds.unwrap_or(0.0));
        set(
            Metric::ChangeFailureRate,
            snapshot.change_failure_rate.unwrap_or(0.0),
        );
        set(
            Metric::MeanTimeToRestore,
            snapshot.mean_time_to_restore_seconds.unwrap_or(0.0),
        );
        set(
            Metric::SuccessfulDeployments,
            snapshot.successful_deployments as f64,
        );
        set(Metric::FailedDeployments, snapshot.failed_deployments as f64);
        set(Metric::OpenIncidents, snapshot.open_incidents as f64);
        set(Metric::Recoveries, snapshot.restorations as f64);
        set(
            Metric::RecoveryTimeSum,
            snapshot.recovery_time_seconds_sum as f64,
        );
        set(
            Metric::DataIncomplete,
            if snapshot.is_complete() { 0.0 } else { 1.0 },
        );
        set(Metric::CollectionFailures, 0.0);
        set(Metric::LastCollection, now.timestamp() as f64);
    }

    /// Report consecutive failed cycles without touching the indicators
    pub fn record_failure(&self, repository: &RepositoryId, consecutive_failures: u32) {
        self.registry.set(
            Metric::CollectionFailures,
            repository,
            f64::from(consecutive_failures),
        );
    }
}

fn format_hours(seconds: Option<f64>) -> String {
    seconds
        .map(|s| format!("{:.2} hours", s / 3600.0))
        .unwrap_or_else(|| "no data".to_string())
}

fn log_summary(snapshot: &DoraSnapshot) {
    info!(
        "Summary for {} - Deployment Frequency: {:.4}/day, Lead Time: {}, Change Failure Rate: {}, MTTR: {}",
        snapshot.repository,
        snapshot.deployment_frequency,
        format_hours(snapshot.lead_time_seconds),
        snapshot
            .change_failure_rate
            .map(|r| format!("{:.2}%", r * 100.0))
            .unwrap_or_else(|| "no data".to_string()),
        format_hours(snapshot.mean_time_to_restore_seconds),
    );

    if !snapshot.is_complete() {
        info!(
            "Incomplete data for {}: {} published as 0",
            snapshot.repository,
            snapshot.missing_indicators().join(", ")
        );
    }
}
