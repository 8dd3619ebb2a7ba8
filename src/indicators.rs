//! DORA indicator computation over a trailing window

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::model::{DeploymentOutcome, RepositoryId};
use crate::state::RepositoryState;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Which environments count as production
#[derive(Clone, Debug)]
pub struct EnvironmentFilter {
    production: Vec<String>,
}

impl EnvironmentFilter {
    pub fn new<I, S>(environments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            production: environments
                .into_iter()
                .map(|e| e.as_ref().trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn is_production(&self, environment: &str) -> bool {
        let environment = environment.trim().to_lowercase();
        self.production.iter().any(|p| *p == environment)
    }
}

impl Default for EnvironmentFilter {
    fn default() -> Self {
        Self::new(["production", "prod"])
    }
}

/// The four indicators plus the counts they were derived from.
///
/// `None` marks an indicator without data; it is published as 0.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DoraSnapshot {
    pub repository: RepositoryId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub deployment_frequency: f64,
    pub lead_time_seconds: Option<f64>,
    pub change_failure_rate: Option<f64>,
    pub mean_time_to_restore_seconds: Option<f64>,
    pub successful_deployments: usize,
    pub failed_deployments: usize,
    pub pending_deployments: usize,
    pub restorations: usize,
    pub recovery_time_seconds_sum: i64,
    pub open_incidents: usize,
}

impl DoraSnapshot {
    /// Whether every indicator had samples in the window
    pub fn is_complete(&self) -> bool {
        self.lead_time_seconds.is_some()
            && self.change_failure_rate.is_some()
            && self.mean_time_to_restore_seconds.is_some()
    }

    /// Names of the indicators that had no samples
    pub fn missing_indicators(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.lead_time_seconds.is_none() {
            missing.push("lead_time");
        }
        if self.change_failure_rate.is_none() {
            missing.push("change_failure_rate");
        }
        if self.mean_time_to_restore_seconds.is_none() {
            missing.push("mean_time_to_restore");
        }
        missing
    }
}

fn in_window(at: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    at > start && at <= end
}

fn mean(sum: i64, count: usize) -> Option<f64> {
    (count > 0).then(|| sum as f64 / count as f64)
}

/// Computes the indicators for the window `(now - window, now]`.
pub fn compute(
    state: &RepositoryState,
    now: DateTime<Utc>,
    window: Duration,
    environments: &EnvironmentFilter,
) -> DoraSnapshot {
    let window_start = now - window;

    let mut successful = 0usize;
    let mut failed = 0usize;
    let mut pending = 0usize;
    let mut lead_time_sum = 0i64;
    let mut lead_time_samples = 0usize;

    for event in state.deployments() {
        if !environments.is_production(&event.environment)
            || !in_window(event.timestamp, window_start, now)
        {
            continue;
        }

        match event.outcome {
            DeploymentOutcome::Success => {
                successful += 1;
                if let Some(seconds) = event.lead_time_seconds() {
                    lead_time_sum += seconds;
                    lead_time_samples += 1;
                }
            }
            DeploymentOutcome::Failure => failed += 1,
            DeploymentOutcome::InProgress | DeploymentOutcome::Unknown => pending += 1,
        }
    }

    let mut recovery_sum = 0i64;
    let mut restorations = 0usize;
    for incident in state.closed_incidents() {
        if !environments.is_production(&incident.environment) {
            continue;
        }
        if let (Some(closed_at), Some(duration)) = (incident.closed_at, incident.duration_seconds) {
            if in_window(closed_at, window_start, now) {
                recovery_sum += duration;
                restorations += 1;
            }
        }
    }

    let open_incidents = state
        .open_incidents()
        .filter(|i| environments.is_production(&i.environment))
        .count();

    let window_days = window.num_seconds() as f64 / SECONDS_PER_DAY;
    let deployment_frequency = if window_days > 0.0 {
        successful as f64 / window_days
    } else {
        0.0
    };

    let attempted = successful + failed;
    let change_failure_rate = (attempted > 0).then(|| failed as f64 / attempted as f64);

    DoraSnapshot {
        repository: state.repository().clone(),
        window_start,
        window_end: now,
        deployment_frequency,
        lead_time_seconds: mean(lead_time_sum, lead_time_samples),
        change_failure_rate,
        mean_time_to_restore_seconds: mean(recovery_sum, restorations),
        successful_deployments: successful,
        failed_deployments: failed,
        pending_deployments: pending,
        restorations,
        recovery_time_seconds_sum: recovery_sum,
        open_incidents,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeploymentEvent;
    use chrono::TimeZone;

    fn repo() -> RepositoryId {
        RepositoryId::new("acme", "shop")
    }

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn deploy(id: &str, at: DateTime<Utc>, outcome: DeploymentOutcome) -> DeploymentEvent {
        DeploymentEvent::new(repo(), id, at, "production", outcome)
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "{} != {}", actual, expected);
    }

    #[test]
    fn test_environment_filter() {
        let filter = EnvironmentFilter::default();
        assert!(filter.is_production("Production"));
        assert!(filter.is_production(" prod "));
        assert!(!filter.is_production("staging"));

        let custom = EnvironmentFilter::new(["live", ""]);
        assert!(custom.is_production("LIVE"));
        assert!(!custom.is_production(""));
    }

    #[test]
    fn test_empty_repository_has_no_data() {
        let state = RepositoryState::new(repo());
        let snapshot = compute(&state, day(30), Duration::days(30), &EnvironmentFilter::default());

        assert_eq!(snapshot.deployment_frequency, 0.0);
        assert_eq!(snapshot.change_failure_rate, None);
        assert_eq!(snapshot.lead_time_seconds, None);
        assert_eq!(snapshot.mean_time_to_restore_seconds, None);
        assert!(!snapshot.is_complete());
        assert_eq!(
            snapshot.missing_indicators(),
            vec!["lead_time", "change_failure_rate", "mean_time_to_restore"]
        );
    }

    #[test]
    fn test_seven_day_window_scenario() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("1", day(1), DeploymentOutcome::Success),
            deploy("5", day(5), DeploymentOutcome::Failure),
            deploy("6", day(6), DeploymentOutcome::Success),
        ]);

        let snapshot = compute(&state, day(7), Duration::days(7), &EnvironmentFilter::default());

        assert_close(snapshot.deployment_frequency, 2.0 / 7.0);
        assert_close(snapshot.change_failure_rate.unwrap(), 1.0 / 3.0);
        assert_close(snapshot.mean_time_to_restore_seconds.unwrap(), 86_400.0);
        assert_eq!(snapshot.restorations, 1);
        assert_eq!(snapshot.recovery_time_seconds_sum, 86_400);
        assert_eq!(snapshot.open_incidents, 0);
    }

    #[test]
    fn test_window_bounds_exclude_old_deployments() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("old", day(0), DeploymentOutcome::Success),
            deploy("new", day(3), DeploymentOutcome::Success),
        ]);

        let snapshot = compute(&state, day(7), Duration::days(7), &EnvironmentFilter::default());
        assert_eq!(snapshot.successful_deployments, 1);
    }

    #[test]
    fn test_lead_time_mean_skips_missing_commits() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("1", day(2), DeploymentOutcome::Success).with_commit("a", day(2) - Duration::hours(1)),
            deploy("2", day(3), DeploymentOutcome::Success).with_commit("b", day(3) - Duration::hours(3)),
            deploy("3", day(4), DeploymentOutcome::Success),
            deploy("4", day(5), DeploymentOutcome::Success).with_commit("c", day(6)),
            deploy("5", day(5), DeploymentOutcome::Failure).with_commit("d", day(1)),
        ]);

        let snapshot = compute(&state, day(7), Duration::days(7), &EnvironmentFilter::default());
        assert_close(snapshot.lead_time_seconds.unwrap(), 7_200.0);
    }

    #[test]
    fn test_non_production_never_counts() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            DeploymentEvent::new(repo(), "s1", day(2), "staging", DeploymentOutcome::Failure),
            DeploymentEvent::new(repo(), "s2", day(3), "staging", DeploymentOutcome::Success)
                .with_commit("x", day(1)),
        ]);

        let snapshot = compute(&state, day(7), Duration::days(7), &EnvironmentFilter::default());

        assert_eq!(snapshot.deployment_frequency, 0.0);
        assert_eq!(snapshot.change_failure_rate, None);
        assert_eq!(snapshot.lead_time_seconds, None);
        assert_eq!(snapshot.mean_time_to_restore_seconds, None);
        assert_eq!(state.closed_incidents().len(), 1);
    }

    #[test]
    fn test_open_incident_excluded_from_mttr() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("1", day(2), DeploymentOutcome::Success),
            deploy("2", day(3), DeploymentOutcome::Failure),
        ]);

        let snapshot = compute(&state, day(7), Duration::days(7), &EnvironmentFilter::default());

        assert_eq!(snapshot.mean_time_to_restore_seconds, None);
        assert_eq!(snapshot.open_incidents, 1);
        assert_eq!(snapshot.successful_deployments, 1);
        assert_close(snapshot.change_failure_rate.unwrap(), 0.5);
    }

    #[test]
    fn test_pending_deployments_excluded() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("1", day(2), DeploymentOutcome::Unknown),
            deploy("2", day(3), DeploymentOutcome::InProgress),
        ]);

        let snapshot = compute(&state, day(7), Duration::days(7), &EnvironmentFilter::default());

        assert_eq!(snapshot.pending_deployments, 2);
        assert_eq!(snapshot.deployment_frequency, 0.0);
        assert_eq!(snapshot.change_failure_rate, None);
    }

    #[test]
    fn test_zero_window_does_not_divide_by_zero() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![deploy("1", day(2), DeploymentOutcome::Success)]);

        let snapshot = compute(&state, day(2), Duration::zero(), &EnvironmentFilter::default());
        assert_eq!(snapshot.deployment_frequency, 0.0);
    }
}
