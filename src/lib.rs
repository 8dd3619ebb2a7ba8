//! DORA Metrics Collector Library
//!
//! This library derives the four DORA indicators (deployment frequency, lead
//! time for changes, change failure rate, mean time to restore) from GitHub
//! deployment and workflow history and publishes them as Prometheus gauges.

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod github;
pub mod indicators;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod source;
pub mod state;
pub mod workflow;

pub use config::{Config, EventMode};
pub use engine::{CycleReport, DoraEngine, EngineSettings};
pub use errors::{CollectorError, Result};
pub use github::GitHubEventSource;
pub use indicators::{DoraSnapshot, EnvironmentFilter};
pub use model::{DeploymentEvent, DeploymentOutcome, FailureIncident, RepositoryId, WorkflowRunEvent};
pub use registry::{InMemoryRegistry, Metric, MetricRegistry, PrometheusRegistry};
pub use scheduler::Scheduler;
pub use source::EventSource;
pub use state::RepositoryState;
