mod engine;

pub use engine::{AnomalyEngine, RuleConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{kubernetes::PodEvent, logs::LogLine, Error, Result};

/// Evidence lists are capped so a long-lived anomaly stays bounded.
pub const MAX_EVIDENCE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    PodCrashLoop,
    LogErrorBurst,
    TimeoutExceeded,
    ResourceExhaustion,
    MonitoringDegraded,
}

impl AnomalyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::PodCrashLoop => "POD_CRASH_LOOP",
            AnomalyKind::LogErrorBurst => "LOG_ERROR_BURST",
            AnomalyKind::TimeoutExceeded => "TIMEOUT_EXCEEDED",
            AnomalyKind::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            AnomalyKind::MonitoringDegraded => "MONITORING_DEGRADED",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "POD_CRASH_LOOP" => Ok(AnomalyKind::PodCrashLoop),
            "LOG_ERROR_BURST" => Ok(AnomalyKind::LogErrorBurst),
            "TIMEOUT_EXCEEDED" => Ok(AnomalyKind::TimeoutExceeded),
            "RESOURCE_EXHAUSTION" => Ok(AnomalyKind::ResourceExhaustion),
            "MONITORING_DEGRADED" => Ok(AnomalyKind::MonitoringDegraded),
            _ => Err(Error::Validation(format!("Invalid anomaly kind: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            _ => Err(Error::Validation(format!("Invalid severity: {}", s))),
        }
    }
}

/// Identity of one logical anomaly: (run, kind, target resource).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub run_id: String,
    pub kind: AnomalyKind,
    /// Pod, log source or run the condition applies to.
    pub target: String,
}

impl DedupKey {
    pub fn new(run_id: impl Into<String>, kind: AnomalyKind, target: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            kind,
            target: target.into(),
        }
    }

    /// Stable hash of the key, usable as an external correlation id.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.run_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.target.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.run_id, self.kind, self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Evidence {
    LogLine { source: String, seq: u64 },
    PodEvent { id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub key: DedupKey,
    pub severity: Severity,
    pub message: String,
    pub evidence: Vec<Evidence>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub repeat_count: u32,
    /// Subsystem of the failing test nearest to the trigger, when known.
    pub subsystem: Option<String>,
}

impl Anomaly {
    pub fn new(
        key: DedupKey,
        severity: Severity,
        message: impl Into<String>,
        evidence: Vec<Evidence>,
        at: DateTime<Utc>,
    ) -> Self {
        let mut evidence = evidence;
        evidence.truncate(MAX_EVIDENCE);
        Self {
            key,
            severity,
            message: message.into(),
            evidence,
            first_seen: at,
            last_seen: at,
            repeat_count: 1,
            subsystem: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.key.run_id
    }

    pub fn kind(&self) -> AnomalyKind {
        self.key.kind
    }

    /// Fold a repeated firing of the same condition into this anomaly.
    /// Severity only ever rises.
    pub fn absorb(&mut self, severity: Severity, message: String, evidence: Vec<Evidence>, at: DateTime<Utc>) {
        self.repeat_count += 1;
        if at > self.last_seen {
            self.last_seen = at;
        }
        if severity > self.severity {
            self.severity = severity;
        }
        self.message = message;
        for item in evidence {
            if !self.evidence.contains(&item) {
                self.evidence.push(item);
            }
        }
        if self.evidence.len() > MAX_EVIDENCE {
            let excess = self.evidence.len() - MAX_EVIDENCE;
            self.evidence.drain(..excess);
        }
    }
}

/// Anything the engine consumes from the merged per-run stream.
#[derive(Debug, Clone)]
pub enum Observation {
    Log(LogLine),
    Pod(PodEvent),
}

impl Observation {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Observation::Log(line) => line.timestamp,
            Observation::Pod(event) => event.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_equality_is_structural() {
        let a = DedupKey::new("run-1", AnomalyKind::PodCrashLoop, "api-0");
        let b = DedupKey::new("run-1", AnomalyKind::PodCrashLoop, "api-0");
        let c = DedupKey::new("run-1", AnomalyKind::ResourceExhaustion, "api-0");
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a, c);
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn fingerprint_does_not_collide_on_concatenation() {
        let a = DedupKey::new("run-1", AnomalyKind::LogErrorBurst, "a/b");
        let b = DedupKey::new("run-1/a", AnomalyKind::LogErrorBurst, "b");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn absorb_keeps_highest_severity_and_bounds_evidence() {
        let now = Utc::now();
        let key = DedupKey::new("run-1", AnomalyKind::LogErrorBurst, "pod/api");
        let mut anomaly = Anomaly::new(key, Severity::Warning, "burst", vec![], now);
        for seq in 0..30 {
            anomaly.absorb(
                Severity::Info,
                "burst".into(),
                vec![Evidence::LogLine { source: "pod/api".into(), seq }],
                now,
            );
        }
        assert_eq!(anomaly.severity, Severity::Warning);
        assert_eq!(anomaly.repeat_count, 31);
        assert_eq!(anomaly.evidence.len(), MAX_EVIDENCE);
        assert_eq!(
            anomaly.evidence.last(),
            Some(&Evidence::LogLine { source: "pod/api".into(), seq: 29 })
        );
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            AnomalyKind::PodCrashLoop,
            AnomalyKind::LogErrorBurst,
            AnomalyKind::TimeoutExceeded,
            AnomalyKind::ResourceExhaustion,
            AnomalyKind::MonitoringDegraded,
        ] {
            assert_eq!(kind.as_str().parse::<AnomalyKind>().unwrap(), kind);
        }
    }
}
