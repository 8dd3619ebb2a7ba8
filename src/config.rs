//! Configuration management for the DORA collector

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{CollectorError, Result};
use crate::model::RepositoryId;

/// Which GitHub records are treated as deployments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventMode {
    /// Deployment records only
    Deployments,
    /// Deployment-like workflow runs only
    Workflows,
    /// Deployment records, falling back to workflow runs for repositories without any
    Auto,
}

impl FromStr for EventMode {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "deployments" => Ok(EventMode::Deployments),
            "workflows" | "workflow_runs" => Ok(EventMode::Workflows),
            "auto" => Ok(EventMode::Auto),
            other => Err(CollectorError::Config(format!(
                "EVENT_SOURCE_MODE must be deployments, workflows or auto, got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// GitHub API token
    #[serde(skip_serializing)]
    pub github_token: String,

    /// Base URL of the GitHub REST API
    pub github_api_url: String,

    /// Repositories to collect metrics for
    pub repositories: Vec<RepositoryId>,

    /// Port of the metrics endpoint
    pub port: u16,

    /// Time between collection cycles of a repository
    pub collection_interval: Duration,

    /// Trailing window the indicators cover, in days
    pub window_days: u32,

    /// Environments counted as production
    pub production_environments: Vec<String>,

    /// Source of deployment records
    pub event_mode: EventMode,

    /// Environment assigned to deployments derived from workflow runs
    pub workflow_environment: String,

    /// HTTP timeout for API requests
    pub http_timeout: Duration,

    /// Maximum retry attempts for transient API failures
    pub max_retries: u32,

    /// Retry backoff base
    pub retry_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github_token: String::new(),
            github_api_url: "https://api.github.com".to_string(),
            repositories: Vec::new(),
            port: 8000,
            collection_interval: Duration::from_secs(3600),
            window_days: 30,
            production_environments: vec!["production".to_string(), "prod".to_string()],
            event_mode: EventMode::Auto,
            workflow_environment: "production".to_string(),
            http_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff_ms: 1000,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        CollectorError::Config(format!("{} has an invalid value '{}'", name, value))
    })
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which resolves variable names
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(token) = lookup("GITHUB_TOKEN") {
            config.github_token = token.trim().to_string();
        }

        if let Some(api_url) = lookup("GITHUB_API_URL") {
            config.github_api_url = api_url.trim().to_string();
        }

        if let Some(repositories) = lookup("GITHUB_REPOSITORIES") {
            if !repositories.trim().is_empty() {
                config.repositories = serde_json::from_str(&repositories).map_err(|e| {
                    CollectorError::Config(format!(
                        "GITHUB_REPOSITORIES must be a JSON list of {{\"owner\", \"repo\"}} objects: {}",
                        e
                    ))
                })?;
            }
        }

        // legacy single repository variables
        if config.repositories.is_empty() {
            if let (Some(owner), Some(repo)) = (lookup("GITHUB_OWNER"), lookup("GITHUB_REPO")) {
                config.repositories = vec![RepositoryId::new(owner.trim(), repo.trim())];
            }
        }

        if let Some(port) = lookup("PORT") {
            config.port = parse_var("PORT", &port)?;
        }

        if let Some(hours) = lookup("UPDATE_INTERVAL_HOURS") {
            let hours: u64 = parse_var("UPDATE_INTERVAL_HOURS", &hours)?;
            config.collection_interval = Duration::from_secs(hours * 3600);
        }

        if let Some(seconds) = lookup("COLLECTION_INTERVAL_SECONDS") {
            let seconds: u64 = parse_var("COLLECTION_INTERVAL_SECONDS", &seconds)?;
            config.collection_interval = Duration::from_secs(seconds);
        }

        if let Some(days) = lookup("DORA_WINDOW_DAYS") {
            config.window_days = parse_var("DORA_WINDOW_DAYS", &days)?;
        }

        if let Some(environments) = lookup("PRODUCTION_ENVIRONMENTS") {
            config.production_environments = parse_list(&environments);
        }

        if let Some(mode) = lookup("EVENT_SOURCE_MODE") {
            config.event_mode = mode.parse()?;
        }

        if let Some(environment) = lookup("WORKFLOW_ENVIRONMENT") {
            config.workflow_environment = environment.trim().to_string();
        }

        if let Some(timeout) = lookup("HTTP_TIMEOUT_SECONDS") {
            let seconds: u64 = parse_var("HTTP_TIMEOUT_SECONDS", &timeout)?;
            config.http_timeout = Duration::from_secs(seconds);
        }

        if let Some(max_retries) = lookup("MAX_RETRIES") {
            config.max_retries = parse_var("MAX_RETRIES", &max_retries)?;
        }

        if let Some(backoff) = lookup("RETRY_BACKOFF_MS") {
            config.retry_backoff_ms = parse_var("RETRY_BACKOFF_MS", &backoff)?;
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(CollectorError::Config(msg.to_string()));

        if self.github_token.is_empty() {
            return invalid("GITHUB_TOKEN is required");
        }

        if self.github_api_url.is_empty() {
            return invalid("github_api_url cannot be empty");
        }

        if self.repositories.is_empty() {
            return invalid(
                "no repositories configured, set GITHUB_REPOSITORIES='[{\"owner\":\"username\",\"repo\":\"frontend\"}]'",
            );
        }

        let mut seen = HashSet::new();
        for repository in &self.repositories {
            repository.validate()?;
            if !seen.insert(repository) {
                return Err(CollectorError::Config(format!(
                    "repository {} is configured twice",
                    repository
                )));
            }
        }

        if self.collection_interval.is_zero() {
            return invalid("collection interval must be greater than 0");
        }

        if self.window_days == 0 {
            return invalid("window_days must be greater than 0");
        }

        if self.production_environments.is_empty() {
            return invalid("at least one production environment must be specified");
        }

        if self.workflow_environment.is_empty() {
            return invalid("workflow_environment cannot be empty");
        }

        if self.http_timeout.is_zero() {
            return invalid("http_timeout must be greater than 0");
        }

        Ok(())
    }

    /// Trailing window as a chrono duration
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.window_days))
    }
}
