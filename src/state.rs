//! Per-repository aggregate state
//!
//! Holds the resolved deployment sequence, the ingestion cursor and the
//! failure incidents derived from the sequence. A state is owned by exactly
//! one collection task, so nothing here is synchronized.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::model::{DeploymentEvent, DeploymentOutcome, FailureIncident, RepositoryId};

/// Position of a resolved deployment: completion time, then arrival order
type SequenceKey = (DateTime<Utc>, u64);

/// Where a repository's deployment records come from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOrigin {
    Deployments,
    WorkflowRuns,
}

/// Outcome of merging one batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Events that became the resolved record for their id
    pub accepted: usize,
    /// Re-deliveries older than the record already held
    pub superseded: usize,
    /// Malformed events that were dropped
    pub dropped: usize,
}

#[derive(Debug)]
pub struct RepositoryState {
    repository: RepositoryId,
    last_seen_cursor: Option<DateTime<Utc>>,
    sequence: BTreeMap<SequenceKey, DeploymentEvent>,
    positions: HashMap<String, SequenceKey>,
    next_arrival: u64,
    open_incidents: HashMap<String, FailureIncident>,
    closed_incidents: Vec<FailureIncident>,
    origin: Option<EventOrigin>,
}

impl RepositoryState {
    pub fn new(repository: RepositoryId) -> Self {
        Self {
            repository,
            last_seen_cursor: None,
            sequence: BTreeMap::new(),
            positions: HashMap::new(),
            next_arrival: 0,
            open_incidents: HashMap::new(),
            closed_incidents: Vec::new(),
            origin: None,
        }
    }

    pub fn repository(&self) -> &RepositoryId {
        &self.repository
    }

    pub fn last_seen_cursor(&self) -> Option<DateTime<Utc>> {
        self.last_seen_cursor
    }

    pub fn origin(&self) -> Option<EventOrigin> {
        self.origin
    }

    pub fn set_origin(&mut self, origin: EventOrigin) {
        self.origin = Some(origin);
    }

    /// Resolved deployments ordered by completion time
    pub fn deployments(&self) -> impl Iterator<Item = &DeploymentEvent> {
        self.sequence.values()
    }

    pub fn deployment(&self, deployment_id: &str) -> Option<&DeploymentEvent> {
        self.positions
            .get(deployment_id)
            .and_then(|key| self.sequence.get(key))
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn open_incidents(&self) -> impl Iterator<Item = &FailureIncident> {
        self.open_incidents.values()
    }

    pub fn open_incident(&self, environment: &str) -> Option<&FailureIncident> {
        self.open_incidents.get(environment)
    }

    pub fn closed_incidents(&self) -> &[FailureIncident] {
        &self.closed_incidents
    }

    /// Merge a batch of deployment events.
    ///
    /// Per deployment id the event with the latest timestamp wins; on an exact
    /// tie the later delivery wins. Incidents are re-derived afterwards so a
    /// corrected outcome updates them retroactively.
    pub fn ingest(&mut self, batch: Vec<DeploymentEvent>) -> IngestReport {
        let mut report = IngestReport::default();

        for event in batch {
            if let Err(e) = event.validate() {
                warn!("Dropping event for {}: {}", self.repository, e);
                report.dropped += 1;
                continue;
            }
            if event.repository != self.repository {
                warn!(
                    "Dropping deployment {} addressed to {} while ingesting {}",
                    event.deployment_id, event.repository, self.repository
                );
                report.dropped += 1;
                continue;
            }

            let timestamp = event.timestamp;
            if self.merge(event) {
                report.accepted += 1;
            } else {
                report.superseded += 1;
            }

            if self.last_seen_cursor.is_none_or(|cursor| timestamp > cursor) {
                self.last_seen_cursor = Some(timestamp);
            }
        }

        if report.accepted > 0 {
            self.rebuild_incidents();
        }

        debug!(
            "Ingested batch for {}: {} accepted, {} superseded, {} dropped",
            self.repository, report.accepted, report.superseded, report.dropped
        );

        report
    }

    /// Returns false when the held record is newer than `event`
    fn merge(&mut self, event: DeploymentEvent) -> bool {
        if let Some(key) = self.positions.get(&event.deployment_id).copied() {
            if event.timestamp < key.0 {
                return false;
            }
            self.sequence.remove(&key);
        }

        let key = (event.timestamp, self.next_arrival);
        self.next_arrival += 1;
        self.positions.insert(event.deployment_id.clone(), key);
        self.sequence.insert(key, event);
        true
    }

    /// Replays the resolved sequence to pair failures with restorations.
    fn rebuild_incidents(&mut self) {
        let mut open: HashMap<String, FailureIncident> = HashMap::new();
        let mut closed = Vec::new();

        for event in self.sequence.values() {
            match event.outcome {
                DeploymentOutcome::Failure => match open.get_mut(&event.environment) {
                    // the incident spans from the first failure, never reopened
                    Some(incident) => incident.failed_deployments += 1,
                    None => {
                        open.insert(
                            event.environment.clone(),
                            FailureIncident::open(
                                self.repository.clone(),
                                &event.environment,
                                event.timestamp,
                            ),
                        );
                    }
                },
                DeploymentOutcome::Success => {
                    if let Some(incident) = open.get_mut(&event.environment) {
                        if incident.close(event.timestamp) {
                            if let Some(incident) = open.remove(&event.environment) {
                                closed.push(incident);
                            }
                        }
                    }
                }
                DeploymentOutcome::InProgress | DeploymentOutcome::Unknown => {}
            }
        }

        self.open_incidents = open;
        self.closed_incidents = closed;
    }

    /// Drops resolved deployments completed before `horizon`.
    ///
    /// The horizon is pulled back to the opening failure of any incident that
    /// is still open or was restored after `horizon`, so pruning never erases
    /// an unrestored failure or shortens a restoration.
    /// Returns the number of deployments removed.
    pub fn prune_before(&mut self, horizon: DateTime<Utc>) -> usize {
        let horizon = self.retention_floor(horizon);
        let retained = self.sequence.split_off(&(horizon, 0));
        let removed = std::mem::replace(&mut self.sequence, retained);

        for event in removed.values() {
            self.positions.remove(&event.deployment_id);
        }

        if !removed.is_empty() {
            debug!(
                "Pruned {} deployments of {} older than {}",
                removed.len(),
                self.repository,
                horizon
            );
            self.rebuild_incidents();
        }

        removed.len()
    }

    /// Earliest instant still needed to re-derive the live incidents
    fn retention_floor(&self, horizon: DateTime<Utc>) -> DateTime<Utc> {
        let restored_late = self
            .closed_incidents
            .iter()
            .filter(|i| i.closed_at.is_some_and(|closed_at| closed_at > horizon));

        self.open_incidents
            .values()
            .chain(restored_late)
            .map(|i| i.opened_at)
            .fold(horizon, |floor, opened_at| floor.min(opened_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn repo() -> RepositoryId {
        RepositoryId::new("acme", "shop")
    }

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn deploy(id: &str, at: DateTime<Utc>, outcome: DeploymentOutcome) -> DeploymentEvent {
        DeploymentEvent::new(repo(), id, at, "production", outcome)
    }

    fn ids(state: &RepositoryState) -> Vec<String> {
        state.deployments().map(|e| e.deployment_id.clone()).collect()
    }

    #[test]
    fn test_empty_batch_leaves_state_untouched() {
        let mut state = RepositoryState::new(repo());
        let report = state.ingest(Vec::new());

        assert_eq!(report, IngestReport::default());
        assert!(state.is_empty());
        assert_eq!(state.last_seen_cursor(), None);
    }

    #[test]
    fn test_sequence_sorted_by_completion() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("c", day(3), DeploymentOutcome::Success),
            deploy("a", day(1), DeploymentOutcome::Success),
            deploy("b", day(2), DeploymentOutcome::Failure),
        ]);

        assert_eq!(ids(&state), vec!["a", "b", "c"]);
        assert_eq!(state.last_seen_cursor(), Some(day(3)));
    }

    #[test]
    fn test_equal_timestamps_keep_batch_order() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("fail", day(2), DeploymentOutcome::Failure),
            deploy("fix", day(2), DeploymentOutcome::Success),
        ]);

        assert_eq!(ids(&state), vec!["fail", "fix"]);
        // a restoration at the same instant does not close the incident
        assert!(state.open_incident("production").is_some());
        assert!(state.closed_incidents().is_empty());
    }

    #[test]
    fn test_latest_timestamp_wins_regardless_of_delivery_order() {
        let older = deploy("42", day(1), DeploymentOutcome::InProgress);
        let newer = deploy("42", day(2), DeploymentOutcome::Failure);

        let mut forward = RepositoryState::new(repo());
        forward.ingest(vec![older.clone(), newer.clone()]);

        let mut backward = RepositoryState::new(repo());
        let report = backward.ingest(vec![newer.clone()]);
        assert_eq!(report.accepted, 1);
        let report = backward.ingest(vec![older]);
        assert_eq!(report.superseded, 1);

        for state in [&forward, &backward] {
            assert_eq!(state.len(), 1);
            assert_eq!(state.deployment("42").unwrap().outcome, DeploymentOutcome::Failure);
        }
    }

    #[test]
    fn test_disjoint_batches_commute() {
        let first = vec![
            deploy("1", day(1), DeploymentOutcome::Success),
            deploy("2", day(4), DeploymentOutcome::Failure),
        ];
        let second = vec![
            deploy("3", day(2), DeploymentOutcome::Failure),
            deploy("4", day(5), DeploymentOutcome::Success),
        ];

        let mut a = RepositoryState::new(repo());
        a.ingest(first.clone());
        a.ingest(second.clone());

        let mut b = RepositoryState::new(repo());
        b.ingest(second);
        b.ingest(first);

        assert_eq!(a.deployments().collect::<Vec<_>>(), b.deployments().collect::<Vec<_>>());
        assert_eq!(a.last_seen_cursor(), b.last_seen_cursor());
        assert_eq!(a.closed_incidents(), b.closed_incidents());
        assert_eq!(
            a.open_incident("production").cloned(),
            b.open_incident("production").cloned()
        );
    }

    #[test]
    fn test_cursor_never_regresses() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![deploy("1", day(5), DeploymentOutcome::Success)]);
        state.ingest(vec![deploy("2", day(2), DeploymentOutcome::Success)]);

        assert_eq!(state.last_seen_cursor(), Some(day(5)));
    }

    #[test]
    fn test_malformed_events_dropped_rest_kept() {
        let mut state = RepositoryState::new(repo());
        let report = state.ingest(vec![
            deploy("", day(1), DeploymentOutcome::Success),
            DeploymentEvent::new(repo(), "2", day(2), "", DeploymentOutcome::Success),
            DeploymentEvent::new(
                RepositoryId::new("other", "repo"),
                "3",
                day(3),
                "production",
                DeploymentOutcome::Success,
            ),
            deploy("4", day(4), DeploymentOutcome::Success),
        ]);

        assert_eq!(report.dropped, 3);
        assert_eq!(report.accepted, 1);
        assert_eq!(ids(&state), vec!["4"]);
        assert_eq!(state.last_seen_cursor(), Some(day(4)));
    }

    #[test]
    fn test_failure_then_success_closes_incident() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("1", day(1), DeploymentOutcome::Success),
            deploy("2", day(5), DeploymentOutcome::Failure),
            deploy("3", day(6), DeploymentOutcome::Success),
        ]);

        let closed = state.closed_incidents();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].opened_at, day(5));
        assert_eq!(closed[0].closed_at, Some(day(6)));
        assert_eq!(closed[0].duration_seconds, Some(86_400));
        assert!(state.open_incident("production").is_none());
    }

    #[test]
    fn test_second_failure_extends_open_incident() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("1", day(1), DeploymentOutcome::Failure),
            deploy("2", day(2), DeploymentOutcome::Failure),
        ]);

        let incident = state.open_incident("production").unwrap();
        assert_eq!(incident.opened_at, day(1));
        assert_eq!(incident.failed_deployments, 2);

        state.ingest(vec![deploy("3", day(4), DeploymentOutcome::Success)]);
        let closed = state.closed_incidents();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].duration_seconds, Some(3 * 86_400));
    }

    #[test]
    fn test_success_without_incident_is_not_a_restoration() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("1", day(1), DeploymentOutcome::Success),
            deploy("2", day(2), DeploymentOutcome::Success),
        ]);

        assert!(state.closed_incidents().is_empty());
        assert_eq!(state.open_incidents().count(), 0);
    }

    #[test]
    fn test_incidents_are_per_environment() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("1", day(1), DeploymentOutcome::Failure),
            DeploymentEvent::new(repo(), "2", day(2), "staging", DeploymentOutcome::Success),
        ]);

        assert!(state.open_incident("production").is_some());
        assert!(state.closed_incidents().is_empty());
    }

    #[test]
    fn test_unknown_outcome_does_not_pair() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("1", day(1), DeploymentOutcome::Failure),
            deploy("2", day(2), DeploymentOutcome::Unknown),
        ]);

        assert!(state.open_incident("production").is_some());
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_corrected_outcome_removes_incident() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("1", day(1), DeploymentOutcome::Success),
            deploy("2", day(5), DeploymentOutcome::Failure),
            deploy("3", day(6), DeploymentOutcome::Success),
        ]);
        assert_eq!(state.closed_incidents().len(), 1);

        state.ingest(vec![deploy("2", day(5), DeploymentOutcome::Success)]);

        assert!(state.closed_incidents().is_empty());
        assert_eq!(state.open_incidents().count(), 0);
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn test_closed_incidents_always_end_after_opening() {
        let mut state = RepositoryState::new(repo());
        let outcomes = [
            DeploymentOutcome::Failure,
            DeploymentOutcome::Success,
            DeploymentOutcome::Failure,
            DeploymentOutcome::Failure,
            DeploymentOutcome::Success,
            DeploymentOutcome::Success,
        ];
        let batch = outcomes
            .iter()
            .enumerate()
            .map(|(i, outcome)| deploy(&i.to_string(), day(i as i64 / 2), *outcome))
            .collect();
        state.ingest(batch);

        assert!(!state.closed_incidents().is_empty());
        for incident in state.closed_incidents() {
            assert!(incident.closed_at.unwrap() > incident.opened_at);
        }
    }

    #[test]
    fn test_prune_before_horizon() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("1", day(1), DeploymentOutcome::Failure),
            deploy("2", day(10), DeploymentOutcome::Success),
            deploy("3", day(20), DeploymentOutcome::Success),
        ]);
        assert_eq!(state.closed_incidents().len(), 1);

        let removed = state.prune_before(day(10));

        assert_eq!(removed, 1);
        assert_eq!(ids(&state), vec!["2", "3"]);
        assert!(state.deployment("1").is_none());
        assert!(state.closed_incidents().is_empty());
        assert_eq!(state.last_seen_cursor(), Some(day(20)));
    }

    #[test]
    fn test_prune_keeps_unrestored_failure() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("0", day(0), DeploymentOutcome::Failure),
            DeploymentEvent::new(repo(), "1", day(1), "staging", DeploymentOutcome::Success),
        ]);

        let removed = state.prune_before(day(14));

        assert_eq!(removed, 0);
        let incident = state.open_incident("production").unwrap();
        assert_eq!(incident.opened_at, day(0));

        state.ingest(vec![deploy("16", day(16), DeploymentOutcome::Success)]);
        state.prune_before(day(15));

        let closed = state.closed_incidents();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].opened_at, day(0));
        assert_eq!(closed[0].duration_seconds, Some(16 * 86_400));
    }

    #[test]
    fn test_prune_releases_incident_restored_before_horizon() {
        let mut state = RepositoryState::new(repo());
        state.ingest(vec![
            deploy("0", day(0), DeploymentOutcome::Failure),
            deploy("9", day(9), DeploymentOutcome::Success),
            deploy("20", day(20), DeploymentOutcome::Failure),
        ]);

        // the open incident starts at day 20, the restored one ended at day 9
        let removed = state.prune_before(day(10));

        assert_eq!(removed, 2);
        assert_eq!(ids(&state), vec!["20"]);
        assert!(state.closed_incidents().is_empty());
        assert_eq!(state.open_incident("production").unwrap().opened_at, day(20));
    }

    #[test]
    fn test_equal_timestamps_across_batches_follow_arrival() {
        let base = vec![deploy("1", day(1), DeploymentOutcome::Failure)];
        let fix = vec![deploy("a", day(2), DeploymentOutcome::Success)];
        let regress = vec![deploy("b", day(2), DeploymentOutcome::Failure)];

        let mut fix_first = RepositoryState::new(repo());
        fix_first.ingest(base.clone());
        fix_first.ingest(fix.clone());
        fix_first.ingest(regress.clone());

        let mut regress_first = RepositoryState::new(repo());
        regress_first.ingest(base);
        regress_first.ingest(regress);
        regress_first.ingest(fix);

        assert_eq!(ids(&fix_first), vec!["1", "a", "b"]);
        assert_eq!(fix_first.closed_incidents().len(), 1);
        assert_eq!(fix_first.open_incident("production").unwrap().opened_at, day(2));

        assert_eq!(ids(&regress_first), vec!["1", "b", "a"]);
        assert_eq!(regress_first.closed_incidents().len(), 1);
        assert_eq!(regress_first.closed_incidents()[0].failed_deployments, 2);
        assert!(regress_first.open_incident("production").is_none());
    }
}
