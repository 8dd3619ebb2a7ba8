//! Periodic collection, one task per repository

use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::engine::DoraEngine;
use crate::model::RepositoryId;
use crate::state::RepositoryState;

/// Spawns and owns the per-repository collection tasks
pub struct Scheduler {
    engine: Arc<DoraEngine>,
    repositories: Vec<RepositoryId>,
    interval: Duration,
    start_jitter: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<DoraEngine>, repositories: Vec<RepositoryId>, interval: Duration) -> Self {
        Self {
            engine,
            repositories,
            interval,
            start_jitter: Duration::from_secs(5),
        }
    }

    /// Upper bound of the random delay before a task's first cycle
    pub fn with_start_jitter(mut self, start_jitter: Duration) -> Self {
        self.start_jitter = start_jitter;
        self
    }

    /// Start one task per repository; each owns its repository's state
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        info!(
            "Scheduling collection for {} repositories every {}s",
            self.repositories.len(),
            self.interval.as_secs()
        );

        self.repositories
            .iter()
            .map(|repository| {
                let engine = Arc::clone(&self.engine);
                let repository = repository.clone();
                let period = self.interval;
                let jitter_ms = self.start_jitter.as_millis() as u64;
                let delay = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));

                tokio::spawn(async move {
                    sleep(delay).await;
                    collect_repository(engine, repository, period).await;
                })
            })
            .collect()
    }

    /// Run one cycle for every repository concurrently from cold state
    pub async fn run_once(&self) -> Vec<(RepositoryId, bool)> {
        let now = Utc::now();
        let cycles = self.repositories.iter().map(|repository| {
            let engine = Arc::clone(&self.engine);
            let repository = repository.clone();
            async move {
                let mut state = RepositoryState::new(repository.clone());
                let ok = match engine.run_cycle(&mut state, now).await {
                    Ok(_) => true,
                    Err(e) => {
                        error!("Failed to collect metrics for {}: {}", repository, e);
                        engine.record_failure(&repository, 1);
                        false
                    }
                };
                (repository, ok)
            }
        });

        join_all(cycles).await
    }
}

/// Collection loop of one repository
async fn collect_repository(engine: Arc<DoraEngine>, repository: RepositoryId, period: Duration) {
    let mut state = RepositoryState::new(repository.clone());
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures: u32 = 0;

    info!("Starting collection task for {}", repository);

    loop {
        ticker.tick().await;

        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", %repository, %cycle_id);
        let result = engine.run_cycle(&mut state, Utc::now()).instrument(span).await;

        match result {
            Ok(report) => {
                consecutive_failures = 0;
                info!(
                    "Finished cycle {} for {}: {} accepted, {} superseded, {} dropped, {} pruned",
                    cycle_id,
                    repository,
                    report.ingest.accepted,
                    report.ingest.superseded,
                    report.ingest.dropped,
                    report.pruned
                );
            }
            Err(e) => {
                consecutive_failures += 1;
                error!(
                    "Collection cycle {} for {} failed (consecutive failures: {}), keeping last published values: {}",
                    cycle_id, repository, consecutive_failures, e
                );
                engine.record_failure(&repository, consecutive_failures);
            }
        }
    }
}
