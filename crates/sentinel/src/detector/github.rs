use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

use super::{ExternalStatus, ObservedRun, RunSource};
use crate::{run::TriggerSource, Error, Result};

const RUN_ID_PREFIX: &str = "gha-";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    pub api_url: String,
    /// `owner/name`
    pub repository: String,
    pub token: Option<String>,
    /// Only runs of this workflow (by name) are tracked.
    pub workflow: Option<String>,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            repository: String::new(),
            token: None,
            workflow: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowRuns {
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRun {
    id: u64,
    name: Option<String>,
    status: Option<String>,
    conclusion: Option<String>,
    head_branch: Option<String>,
    event: Option<String>,
    run_started_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl WorkflowRun {
    fn external_status(&self) -> ExternalStatus {
        match (self.status.as_deref(), self.conclusion.as_deref()) {
            (Some("completed"), Some("success")) | (Some("completed"), Some("skipped")) => ExternalStatus::Succeeded,
            (Some("completed"), conclusion) => {
                ExternalStatus::Failed(Some(format!("workflow concluded {}", conclusion.unwrap_or("without a conclusion"))))
            }
            (Some("in_progress"), _) => ExternalStatus::InProgress,
            _ => ExternalStatus::Queued,
        }
    }

    fn observed(&self) -> ObservedRun {
        debug!(
            "Workflow run {} on {} ({})",
            self.id,
            self.head_branch.as_deref().unwrap_or("?"),
            self.event.as_deref().unwrap_or("?")
        );
        ObservedRun {
            run_id: format!("{}{}", RUN_ID_PREFIX, self.id),
            trigger: TriggerSource::Ci,
            started_at: self.run_started_at.unwrap_or(self.created_at),
            status: self.external_status(),
            labels: BTreeMap::new(),
        }
    }
}

/// Authenticated access to one repository's Actions API.
pub(crate) struct GithubClient {
    client: Client,
    base_url: Url,
    config: GithubConfig,
}

impl GithubClient {
    pub(crate) fn new(config: GithubConfig) -> Result<Self> {
        if config.repository.split('/').filter(|part| !part.is_empty()).count() != 2 {
            return Err(Error::Config(format!(
                "GitHub repository must be owner/name, got '{}'",
                config.repository
            )));
        }
        let mut base = config.api_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| Error::Config(format!("Invalid GitHub API URL: {}", e)))?;
        let client = Client::builder()
            .user_agent(concat!("focus-sentinel/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    pub(crate) fn config(&self) -> &GithubConfig {
        &self.config
    }

    /// URL of `path` below `repos/{owner}/{name}/actions/`.
    pub(crate) fn actions_endpoint(&self, path: &str) -> Result<Url> {
        let path = format!("repos/{}/actions/{}", self.config.repository, path);
        self.base_url
            .join(&path)
            .map_err(|e| Error::Internal(format!("Invalid GitHub path {}: {}", path, e)))
    }

    async fn send(&self, url: Url, accept: &str) -> Result<reqwest::Response> {
        let mut request = self.client.get(url).header("Accept", accept);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::TransientIo(format!("github: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(response)
    }

    pub(crate) async fn get<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<T> {
        Ok(self.send(url, "application/vnd.github+json").await?.json().await?)
    }

    /// Plain-text resources such as job logs. Redirects to the log archive
    /// are followed by the client.
    pub(crate) async fn get_text(&self, url: Url) -> Result<String> {
        self.send(url, "application/vnd.github+json")
            .await?
            .text()
            .await
            .map_err(|e| Error::TransientIo(format!("github: {}", e)))
    }
}

/// The numeric workflow run id behind a detected run id.
pub(crate) fn workflow_run_id(run_id: &str) -> Option<&str> {
    run_id.strip_prefix(RUN_ID_PREFIX)
}

/// Polls the GitHub Actions REST API for workflow runs of one repository.
pub struct GithubActionsSource {
    api: GithubClient,
}

impl GithubActionsSource {
    pub fn new(config: GithubConfig) -> Result<Self> {
        Ok(Self {
            api: GithubClient::new(config)?,
        })
    }

    fn wanted(&self, run: &WorkflowRun) -> bool {
        match (&self.api.config().workflow, &run.name) {
            (Some(wanted), Some(name)) => wanted == name,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

fn status_error(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Config(format!("GitHub rejected credentials ({}): {}", status, body))
        }
        StatusCode::NOT_FOUND => Error::NotFound(format!("GitHub resource ({}): {}", status, body)),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            Error::TransientIo(format!("GitHub returned {}: {}", status, body))
        }
        _ => Error::Validation(format!("GitHub returned {}: {}", status, body)),
    }
}

#[async_trait]
impl RunSource for GithubActionsSource {
    fn name(&self) -> String {
        format!("github:{}", self.api.config().repository)
    }

    async fn poll(&self) -> Result<Vec<ObservedRun>> {
        let mut observed = Vec::new();
        for status in ["in_progress", "queued"] {
            let mut url = self.api.actions_endpoint("runs")?;
            url.query_pairs_mut()
                .append_pair("status", status)
                .append_pair("per_page", "50");
            let runs: WorkflowRuns = self.api.get(url).await?;
            observed.extend(runs.workflow_runs.iter().filter(|r| self.wanted(r)).map(WorkflowRun::observed));
        }
        debug!("GitHub poll found {} active run(s)", observed.len());
        Ok(observed)
    }

    async fn status(&self, run_id: &str) -> Result<ExternalStatus> {
        let id = workflow_run_id(run_id)
            .ok_or_else(|| Error::Validation(format!("{} is not a GitHub Actions run", run_id)))?;
        let run: WorkflowRun = self.api.get(self.api.actions_endpoint(&format!("runs/{}", id))?).await?;
        Ok(run.external_status())
    }
}
