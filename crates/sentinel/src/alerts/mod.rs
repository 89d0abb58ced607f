//! Alert delivery: one notification per anomaly condition per run.

mod dispatcher;
mod slack;
mod stdout;
mod ticket;

pub use dispatcher::{AlertDispatcher, DispatcherConfig};
pub use slack::SlackChannel;
pub use stdout::StdoutChannel;
pub use ticket::{JiraClient, JiraConfig, TicketChannel, TicketTracker};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{
    anomaly::{Anomaly, DedupKey, Severity},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "PENDING"),
            DeliveryStatus::Sent => write!(f, "SENT"),
            DeliveryStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(DeliveryStatus::Pending),
            "SENT" => Ok(DeliveryStatus::Sent),
            "FAILED" => Ok(DeliveryStatus::Failed),
            _ => Err(Error::Validation(format!("Invalid delivery status: {}", s))),
        }
    }
}

/// Outcome of dispatching one anomaly condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub key: DedupKey,
    /// Severity the last delivery attempt was made at.
    pub severity: Severity,
    pub channel: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlertRecord {
    pub fn pending(anomaly: &Anomaly, channel: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            key: anomaly.key.clone(),
            severity: anomaly.severity,
            channel: channel.into(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            dispatched_at: None,
            error: None,
            created_at: at,
            updated_at: at,
        }
    }
}

/// A rendered alert ready for a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertMessage {
    pub fingerprint: String,
    pub severity: Severity,
    pub title: String,
    pub body: String,
    pub anomaly: Anomaly,
}

/// Where notifications go (chat, ticket tracker, stdout).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> String;

    /// Deliver once. Transient failures should surface as
    /// `Error::ChannelUnavailable` so the dispatcher retries them.
    async fn deliver(&self, message: &AlertMessage) -> Result<()>;

    /// Release per-run state once the run has ended.
    fn forget_run(&self, _run_id: &str) {}
}
