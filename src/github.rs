//! GitHub REST API event source

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rand::Rng;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::errors::{CollectorError, Result};
use crate::model::{
    DeploymentEvent, DeploymentOutcome, DeploymentStatus, RepositoryId, WorkflowConclusion,
    WorkflowRunEvent,
};
use crate::source::EventSource;

const PER_PAGE: usize = 100;

/// Commit dates kept before the older half is evicted
const COMMIT_CACHE_CAPACITY: usize = 4096;

/// Deployments created this long before `since` may still report new statuses
const IN_FLIGHT_GRACE_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
struct RawDeployment {
    id: Option<u64>,
    sha: Option<String>,
    environment: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDeploymentStatus {
    state: Option<String>,
    created_at: Option<String>,
}

impl RawDeploymentStatus {
    fn outcome(&self) -> DeploymentOutcome {
        DeploymentOutcome::from(self.state.as_deref().unwrap_or(""))
    }
}

#[derive(Debug, Deserialize)]
struct RawCommit {
    commit: RawCommitDetail,
}

#[derive(Debug, Deserialize)]
struct RawCommitDetail {
    author: Option<RawSignature>,
}

#[derive(Debug, Deserialize)]
struct RawSignature {
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWorkflowRunPage {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    workflow_runs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawWorkflowRun {
    id: Option<u64>,
    name: Option<String>,
    path: Option<String>,
    event: Option<String>,
    status: Option<String>,
    conclusion: Option<String>,
    head_sha: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    run_started_at: Option<String>,
    head_commit: Option<RawHeadCommit>,
}

#[derive(Debug, Deserialize)]
struct RawHeadCommit {
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

impl RawWorkflowRun {
    fn into_event(self, repository: &RepositoryId) -> Result<WorkflowRunEvent> {
        let run_id = self
            .id
            .ok_or_else(|| CollectorError::MalformedEvent("workflow run without id".to_string()))?;
        let timestamp = parse_timestamp(self.created_at.as_deref()).ok_or_else(|| {
            CollectorError::MalformedEvent(format!("workflow run {} has no valid created_at", run_id))
        })?;

        let completed = self.status.as_deref() == Some("completed");
        let conclusion = if completed {
            WorkflowConclusion::from(self.conclusion.as_deref())
        } else {
            WorkflowConclusion::Pending
        };
        let completed_at = if completed {
            parse_timestamp(self.updated_at.as_deref())
        } else {
            None
        };

        Ok(WorkflowRunEvent {
            repository: repository.clone(),
            run_id,
            name: self.name.unwrap_or_default(),
            path: self.path.unwrap_or_default(),
            event: self.event.unwrap_or_default(),
            timestamp,
            conclusion,
            started_at: parse_timestamp(self.run_started_at.as_deref()),
            completed_at,
            head_sha: self.head_sha,
            head_commit_at: self
                .head_commit
                .and_then(|c| parse_timestamp(c.timestamp.as_deref())),
        })
    }
}

/// Event source backed by the GitHub deployments and Actions APIs
#[derive(Debug)]
pub struct GitHubEventSource {
    client: Client,
    api_url: String,
    timeout: Duration,
    max_retries: u32,
    retry_backoff_ms: u64,
    commit_cache: RwLock<HashMap<String, DateTime<Utc>>>,
    commit_cache_capacity: usize,
}

impl GitHubEventSource {
    /// Create a new GitHub event source
    pub fn new(
        api_url: String,
        token: &str,
        http_timeout: Duration,
        max_retries: u32,
        retry_backoff_ms: u64,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static("2022-11-28"),
        );
        if !token.is_empty() {
            let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| CollectorError::Config(format!("invalid GITHUB_TOKEN: {}", e)))?;
            auth.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, auth);
        }

        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("dora_collector/{}", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            timeout: http_timeout,
            max_retries,
            retry_backoff_ms,
            commit_cache: RwLock::new(HashMap::new()),
            commit_cache_capacity: COMMIT_CACHE_CAPACITY,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.github_api_url.clone(),
            &config.github_token,
            config.http_timeout,
            config.max_retries,
            config.retry_backoff_ms,
        )
    }

    fn repo_url(&self, repository: &RepositoryId, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_url, repository.owner, repository.name, suffix
        )
    }

    /// GET with retries on transient failures
    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        let mut attempt = 0;

        loop {
            match self.get_json_attempt(url, query).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;

                    let retryable =
                        e.is_transient() && !matches!(e, CollectorError::RateLimited { .. });
                    if !retryable || attempt > self.max_retries {
                        return Err(e);
                    }

                    let backoff_ms = self.retry_backoff_ms * 2_u64.pow(attempt - 1);
                    let jitter_ms = rand::rng().random_range(0..=backoff_ms / 4);
                    warn!(
                        "Request to {} failed (attempt {}), retrying in {}ms: {}",
                        url,
                        attempt,
                        backoff_ms + jitter_ms,
                        e
                    );
                    sleep(Duration::from_millis(backoff_ms + jitter_ms)).await;
                }
            }
        }
    }

    async fn get_json_attempt<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = timeout(self.timeout, self.client.get(url).query(query).send())
            .await
            .map_err(|_| CollectorError::Timeout)??;

        let response = Self::handle_response(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Map error statuses, detecting exhausted rate limits
    async fn handle_response(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let remaining = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let reset_at = response
            .headers()
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::FORBIDDEN
                && (remaining.as_deref() == Some("0")
                    || body.to_lowercase().contains("rate limit")));
        if rate_limited {
            return Err(CollectorError::RateLimited { reset_at });
        }

        let message = match status.as_u16() {
            401 => format!("Unauthorized, check GITHUB_TOKEN: {}", body),
            403 => format!("Forbidden: {}", body),
            404 => format!("Not found: {}", body),
            _ => body,
        };

        Err(CollectorError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Verify the token by fetching the authenticated user
    pub async fn check_access(&self) -> Result<String> {
        let url = format!("{}/user", self.api_url);
        let user: RawUser = self.get_json(&url, &[]).await?;
        Ok(user.login)
    }

    /// Test access, logging the outcome
    pub async fn test_connectivity(&self) -> bool {
        match self.check_access().await {
            Ok(login) => {
                info!("GitHub access confirmed for user: {}", login);
                true
            }
            Err(e) => {
                warn!("GitHub access check failed: {}", e);
                false
            }
        }
    }

    async fn latest_status(
        &self,
        repository: &RepositoryId,
        deployment_id: u64,
    ) -> Result<Option<RawDeploymentStatus>> {
        let url = self.repo_url(repository, &format!("deployments/{}/statuses", deployment_id));
        let statuses: Vec<RawDeploymentStatus> =
            self.get_json(&url, &[("per_page", "1".to_string())]).await?;
        Ok(statuses.into_iter().next())
    }

    /// Author date of a commit, `None` when GitHub no longer knows it
    async fn commit_authored_at(
        &self,
        repository: &RepositoryId,
        sha: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let cache_key = format!("{}@{}", repository, sha);
        if let Some(authored_at) = self.commit_cache.read().await.get(&cache_key) {
            return Ok(Some(*authored_at));
        }

        let url = self.repo_url(repository, &format!("commits/{}", sha));
        let commit: RawCommit = match self.get_json(&url, &[]).await {
            Ok(commit) => commit,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!("Error fetching commit {} of {}: {}", sha, repository, e);
                return Ok(None);
            }
        };

        let authored_at = commit
            .commit
            .author
            .and_then(|a| parse_timestamp(a.date.as_deref()));
        if let Some(authored_at) = authored_at {
            self.remember_commit(cache_key, authored_at).await;
        }
        Ok(authored_at)
    }

    /// Caches a commit date, evicting the older half once the cache is full
    async fn remember_commit(&self, cache_key: String, authored_at: DateTime<Utc>) {
        let mut cache = self.commit_cache.write().await;

        if cache.len() >= self.commit_cache_capacity {
            let mut dates: Vec<DateTime<Utc>> = cache.values().copied().collect();
            dates.sort_unstable();
            if let Some(cutoff) = dates.get(dates.len() / 2).copied() {
                cache.retain(|_, authored| *authored > cutoff);
            }
            debug!("Evicted commit dates, {} remain cached", cache.len());
        }

        cache.insert(cache_key, authored_at);
    }
}

#[async_trait]
impl EventSource for GitHubEventSource {
    #[instrument(skip(self), fields(repository = %repository))]
    async fn list_deployments(
        &self,
        repository: &RepositoryId,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeploymentEvent>> {
        let url = self.repo_url(repository, "deployments");
        let horizon = since - ChronoDuration::hours(IN_FLIGHT_GRACE_HOURS);
        let mut events = Vec::new();
        let mut page = 1;

        loop {
            let items: Vec<Value> = self
                .get_json(
                    &url,
                    &[("per_page", PER_PAGE.to_string()), ("page", page.to_string())],
                )
                .await?;
            let page_len = items.len();
            let mut reached_horizon = false;

            for item in items {
                let raw: RawDeployment = match serde_json::from_value(item) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("Dropping unreadable deployment of {}: {}", repository, e);
                        continue;
                    }
                };
                let (Some(id), Some(created_at)) = (raw.id, parse_timestamp(raw.created_at.as_deref()))
                else {
                    warn!("Dropping deployment of {} without id or created_at", repository);
                    continue;
                };

                // listing is newest first
                if created_at < horizon {
                    reached_horizon = true;
                    break;
                }

                let (outcome, timestamp) = match self.latest_status(repository, id).await? {
                    Some(status) => (
                        status.outcome(),
                        parse_timestamp(status.created_at.as_deref()).unwrap_or(created_at),
                    ),
                    None => (
                        DeploymentOutcome::Unknown,
                        parse_timestamp(raw.updated_at.as_deref()).unwrap_or(created_at),
                    ),
                };
                if timestamp < since {
                    continue;
                }

                let mut event = DeploymentEvent::new(
                    repository.clone(),
                    id.to_string(),
                    timestamp,
                    raw.environment.unwrap_or_default(),
                    outcome,
                );
                if let Some(sha) = raw.sha {
                    if let Some(authored_at) = self.commit_authored_at(repository, &sha).await? {
                        event = event.with_commit(sha, authored_at);
                    }
                }
                events.push(event);
            }

            if reached_horizon || page_len < PER_PAGE {
                break;
            }
            page += 1;
        }

        debug!("Retrieved {} deployments for {} since {}", events.len(), repository, since);
        Ok(events)
    }

    #[instrument(skip(self), fields(repository = %repository))]
    async fn list_workflow_runs(
        &self,
        repository: &RepositoryId,
        since: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRunEvent>> {
        let url = self.repo_url(repository, "actions/runs");
        let horizon = since - ChronoDuration::hours(IN_FLIGHT_GRACE_HOURS);
        let created = format!(">={}", horizon.format("%Y-%m-%dT%H:%M:%SZ"));
        let mut runs = Vec::new();
        let mut page = 1;
        let mut seen = 0;

        loop {
            let body: RawWorkflowRunPage = self
                .get_json(
                    &url,
                    &[
                        ("per_page", PER_PAGE.to_string()),
                        ("page", page.to_string()),
                        ("created", created.clone()),
                    ],
                )
                .await?;
            let page_len = body.workflow_runs.len();
            seen += page_len;

            for item in body.workflow_runs {
                let run = serde_json::from_value::<RawWorkflowRun>(item)
                    .map_err(CollectorError::from)
                    .and_then(|raw| raw.into_event(repository));
                match run {
                    Ok(run) if run.completed_at.unwrap_or(run.timestamp) >= since => runs.push(run),
                    Ok(_) => {}
                    Err(e) => warn!("Dropping workflow run of {}: {}", repository, e),
                }
            }

            // total_count is absent on some responses
            if page_len < PER_PAGE || (body.total_count > 0 && seen >= body.total_count) {
                break;
            }
            page += 1;
        }

        debug!("Retrieved {} workflow runs for {} since {}", runs.len(), repository, since);
        Ok(runs)
    }

    async fn deployment_status(
        &self,
        repository: &RepositoryId,
        deployment_id: &str,
    ) -> Result<Option<DeploymentStatus>> {
        let Ok(id) = deployment_id.parse::<u64>() else {
            return Ok(None);
        };

        let status = self.latest_status(repository, id).await?;
        Ok(status.and_then(|status| {
            Some(DeploymentStatus {
                outcome: status.outcome(),
                timestamp: parse_timestamp(status.created_at.as_deref())?,
            })
        }))
    }
}
