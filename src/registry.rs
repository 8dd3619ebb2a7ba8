//! Metric registry the engine publishes into
//!
//! Every value is a gauge labelled by repository (`repo="owner/name"`) and is
//! overwritten on each write.

use metrics::{describe_gauge, gauge, with_local_recorder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::model::RepositoryId;

const REPOSITORY_LABEL: &str = "repo";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Metric {
    DeploymentFrequency,
    LeadTime,
    ChangeFailureRate,
    MeanTimeToRestore,
    SuccessfulDeployments,
    FailedDeployments,
    OpenIncidents,
    Recoveries,
    RecoveryTimeSum,
    DataIncomplete,
    CollectionFailures,
    LastCollection,
}

impl Metric {
    pub const ALL: [Metric; 12] = [
        Metric::DeploymentFrequency,
        Metric::LeadTime,
        Metric::ChangeFailureRate,
        Metric::MeanTimeToRestore,
        Metric::SuccessfulDeployments,
        Metric::FailedDeployments,
        Metric::OpenIncidents,
        Metric::Recoveries,
        Metric::RecoveryTimeSum,
        Metric::DataIncomplete,
        Metric::CollectionFailures,
        Metric::LastCollection,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::DeploymentFrequency => "dora_deployment_frequency",
            Metric::LeadTime => "dora_lead_time_seconds",
            Metric::ChangeFailureRate => "dora_change_failure_rate",
            Metric::MeanTimeToRestore => "dora_mean_time_to_restore_seconds",
            Metric::SuccessfulDeployments => "dora_deployments_successful",
            Metric::FailedDeployments => "dora_deployments_failed",
            Metric::OpenIncidents => "dora_incidents_open",
            Metric::Recoveries => "dora_recoveries",
            Metric::RecoveryTimeSum => "dora_recovery_time_seconds_sum",
            Metric::DataIncomplete => "dora_data_incomplete",
            Metric::CollectionFailures => "dora_collection_failures",
            Metric::LastCollection => "dora_last_collection_timestamp_seconds",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Metric::DeploymentFrequency => "Successful production deployments per day",
            Metric::LeadTime => "Mean lead time for changes in seconds",
            Metric::ChangeFailureRate => "Ratio of production deployments that failed",
            Metric::MeanTimeToRestore => "Mean time to restore service in seconds",
            Metric::SuccessfulDeployments => "Successful production deployments in the window",
            Metric::FailedDeployments => "Failed production deployments in the window",
            Metric::OpenIncidents => "Production failure incidents not yet restored",
            Metric::Recoveries => "Production incidents restored in the window",
            Metric::RecoveryTimeSum => "Sum of restore durations in the window in seconds",
            Metric::DataIncomplete => "1 when an indicator had no data and was published as 0",
            Metric::CollectionFailures => "Consecutive failed collection cycles",
            Metric::LastCollection => "Unix time of the last successful collection cycle",
        }
    }
}

/// Sink for repository-labelled gauges; shared by every collection task
pub trait MetricRegistry: Send + Sync {
    fn set(&self, metric: Metric, repository: &RepositoryId, value: f64);
}

/// Registry rendered in the Prometheus text exposition format
pub struct PrometheusRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl PrometheusRegistry {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        with_local_recorder(&recorder, || {
            for metric in Metric::ALL {
                describe_gauge!(metric.name(), metric.description());
            }
        });

        Self { recorder, handle }
    }

    /// Current exposition text
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Default for PrometheusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry for PrometheusRegistry {
    fn set(&self, metric: Metric, repository: &RepositoryId, value: f64) {
        with_local_recorder(&self.recorder, || {
            gauge!(metric.name(), REPOSITORY_LABEL => repository.label()).set(value);
        });
    }
}

/// Registry keeping values in memory, for inspection
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    values: RwLock<HashMap<(Metric, RepositoryId), f64>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, metric: Metric, repository: &RepositoryId) -> Option<f64> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(&(metric, repository.clone())).copied()
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricRegistry for InMemoryRegistry {
    fn set(&self, metric: Metric, repository: &RepositoryId, value: f64) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert((metric, repository.clone()), value);
    }
}
