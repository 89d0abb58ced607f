use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use url::Url;

use super::{slack::status_error, AlertChannel, AlertMessage};
use crate::{anomaly::Severity, Error, Result};

/// The slice of the ticket tracker the sentinel uses.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TicketTracker: Send + Sync {
    /// Returns the new issue key.
    async fn create_issue(&self, summary: &str, description: &str, labels: Vec<String>) -> Result<String>;
    async fn update_issue(&self, key: &str, summary: &str, description: &str) -> Result<()>;
    async fn link_issue(&self, from: &str, to: &str, link_type: &str) -> Result<()>;
    async fn attach_evidence(&self, key: &str, evidence: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JiraConfig {
    pub base_url: String,
    pub project: String,
    pub issue_type: String,
    pub user: String,
    pub token: String,
    /// Issue every new ticket is linked to (e.g. the current test cycle).
    pub link_to: Option<String>,
}

pub struct JiraClient {
    client: Client,
    base_url: Url,
    config: JiraConfig,
}

#[derive(Deserialize)]
struct CreatedIssue {
    key: String,
}

impl JiraClient {
    pub fn new(config: JiraConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("Invalid Jira base URL: {}", e)))?;
        Ok(Self {
            client: Client::new(),
            base_url,
            config,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Internal(format!("Invalid Jira path {}: {}", path, e)))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .basic_auth(&self.config.user, Some(&self.config.token))
            .send()
            .await
            .map_err(|e| Error::ChannelUnavailable(format!("jira: {}", e)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error("jira", status, &body))
    }
}

#[async_trait]
impl TicketTracker for JiraClient {
    async fn create_issue(&self, summary: &str, description: &str, labels: Vec<String>) -> Result<String> {
        let body = json!({
            "fields": {
                "project": { "key": self.config.project },
                "issuetype": { "name": self.config.issue_type },
                "summary": summary,
                "description": description,
                "labels": labels,
            }
        });
        let response = self
            .send(self.client.post(self.endpoint("rest/api/2/issue")?).json(&body))
            .await?;
        let created: CreatedIssue = response.json().await?;
        info!("Opened Jira issue {}", created.key);
        Ok(created.key)
    }

    async fn update_issue(&self, key: &str, summary: &str, description: &str) -> Result<()> {
        let body = json!({ "fields": { "summary": summary, "description": description } });
        self.send(
            self.client
                .put(self.endpoint(&format!("rest/api/2/issue/{}", key))?)
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn link_issue(&self, from: &str, to: &str, link_type: &str) -> Result<()> {
        let body = json!({
            "type": { "name": link_type },
            "inwardIssue": { "key": from },
            "outwardIssue": { "key": to },
        });
        self.send(self.client.post(self.endpoint("rest/api/2/issueLink")?).json(&body))
            .await?;
        Ok(())
    }

    /// Evidence is posted as a comment.
    async fn attach_evidence(&self, key: &str, evidence: &str) -> Result<()> {
        let body = json!({ "body": format!("{{code}}\n{}\n{{code}}", evidence) });
        self.send(
            self.client
                .post(self.endpoint(&format!("rest/api/2/issue/{}/comment", key))?)
                .json(&body),
        )
        .await?;
        Ok(())
    }
}

/// Progress of one fingerprint's ticket. A step that failed is finished by
/// the next delivery instead of being skipped.
#[derive(Debug, Clone, Default)]
struct TicketState {
    run_id: String,
    key: Option<String>,
    evidence_attached: bool,
    linked: bool,
}

/// Opens a ticket for CRITICAL anomalies; other severities are acknowledged
/// without a ticket. Redelivery of a fingerprint updates its ticket.
pub struct TicketChannel {
    tracker: Arc<dyn TicketTracker>,
    link_to: Option<String>,
    issues: Mutex<HashMap<String, TicketState>>,
}

impl TicketChannel {
    pub fn new(tracker: Arc<dyn TicketTracker>, link_to: Option<String>) -> Self {
        Self {
            tracker,
            link_to,
            issues: Mutex::new(HashMap::new()),
        }
    }

    fn issues(&self) -> MutexGuard<'_, HashMap<String, TicketState>> {
        self.issues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_state(&self, fingerprint: &str, apply: impl FnOnce(&mut TicketState)) {
        if let Some(state) = self.issues().get_mut(fingerprint) {
            apply(state);
        }
    }

    fn is_complete(&self, state: &TicketState) -> bool {
        state.evidence_attached && (state.linked || self.link_to.is_none())
    }
}

#[async_trait]
impl AlertChannel for TicketChannel {
    fn name(&self) -> String {
        "ticket".to_string()
    }

    // Deliveries of one fingerprint are serialized by the dispatcher, so the
    // map is only locked between remote calls.
    async fn deliver(&self, message: &AlertMessage) -> Result<()> {
        if message.severity < Severity::Critical {
            debug!("Alert {} below CRITICAL, no ticket opened", message.fingerprint);
            return Ok(());
        }

        let state = self
            .issues()
            .entry(message.fingerprint.clone())
            .or_insert_with(|| TicketState {
                run_id: message.anomaly.run_id().to_string(),
                ..Default::default()
            })
            .clone();

        let key = match state.key.clone() {
            Some(key) if self.is_complete(&state) => {
                return self.tracker.update_issue(&key, &message.title, &message.body).await;
            }
            Some(key) => {
                debug!("Finishing ticket {} for {}", key, message.fingerprint);
                key
            }
            None => {
                let labels = vec![
                    "automation-sentinel".to_string(),
                    message.anomaly.kind().as_str().to_lowercase(),
                    message.fingerprint[..12.min(message.fingerprint.len())].to_string(),
                ];
                let key = self
                    .tracker
                    .create_issue(&message.title, &message.body, labels)
                    .await?;
                self.update_state(&message.fingerprint, |s| s.key = Some(key.clone()));
                key
            }
        };

        if !state.evidence_attached {
            let evidence = serde_json::to_string_pretty(&message.anomaly.evidence)?;
            self.tracker.attach_evidence(&key, &evidence).await?;
            self.update_state(&message.fingerprint, |s| s.evidence_attached = true);
        }
        if let Some(parent) = self.link_to.as_deref().filter(|_| !state.linked) {
            self.tracker.link_issue(&key, parent, "Relates").await?;
            self.update_state(&message.fingerprint, |s| s.linked = true);
        }
        Ok(())
    }

    fn forget_run(&self, run_id: &str) {
        self.issues().retain(|_, state| state.run_id != run_id);
    }
}
