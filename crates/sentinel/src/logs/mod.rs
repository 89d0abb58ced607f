//! Log lines and the multi-source log streamer.

mod buffer;
mod github;
mod sources;
mod streamer;

pub use buffer::LogBuffer;
pub use github::{GithubJobLogs, JobLogSource};
pub use sources::{FileLogSource, KubeLogSources, LogSource, LogSourceProvider, PodLogSource, StaticLogSources};
pub use streamer::{LogStreamer, LogSubscription, StreamerConfig};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::run::TestOutcome;

lazy_static! {
    static ref LEVEL_RE: Regex =
        Regex::new(r"\b(?P<level>TRACE|DEBUG|INFO|WARNING|WARN|ERROR|CRITICAL|FATAL)\b").expect("valid level regex");
    static ref MODULE_RE: Regex =
        Regex::new(r"\[(?P<module>[A-Za-z_][\w.]*)\]").expect("valid module regex");
    static ref TEST_RESULT_RE: Regex =
        Regex::new(r"(?P<node>\S+\.py::\S+)\s+(?P<outcome>PASSED|FAILED|ERROR)\b").expect("valid test result regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARNING" | "WARN" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            "CRITICAL" | "FATAL" => Some(LogLevel::Critical),
            _ => None,
        }
    }

    pub fn is_error(self) -> bool {
        self >= LogLevel::Error
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LineKind {
    Data,
    /// Synthetic marker: the source could not be reconnected.
    SourceLost { attempts: u32, error: String },
}

/// One line from one source. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub source: String,
    /// Strictly increasing per source.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub level: Option<LogLevel>,
    pub module: Option<String>,
    pub kind: LineKind,
}

/// A pytest result line (`tests/api/test_x.py::test_y PASSED`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub node_id: String,
    pub outcome: TestOutcome,
}

impl LogLine {
    pub fn new(source: impl Into<String>, seq: u64, timestamp: DateTime<Utc>, text: impl Into<String>) -> Self {
        let text = text.into();
        let level = LEVEL_RE
            .captures(&text)
            .and_then(|c| LogLevel::parse(&c["level"]));
        let module = MODULE_RE.captures(&text).map(|c| c["module"].to_string());
        Self {
            source: source.into(),
            seq,
            timestamp,
            text,
            level,
            module,
            kind: LineKind::Data,
        }
    }

    pub fn source_lost(source: impl Into<String>, seq: u64, timestamp: DateTime<Utc>, attempts: u32, error: String) -> Self {
        let source = source.into();
        Self {
            text: format!("log source {} lost after {} reconnect attempts: {}", source, attempts, error),
            source,
            seq,
            timestamp,
            level: Some(LogLevel::Warning),
            module: None,
            kind: LineKind::SourceLost { attempts, error },
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == LineKind::Data && self.level.map(LogLevel::is_error).unwrap_or(false)
    }

    pub fn is_source_lost(&self) -> bool {
        matches!(self.kind, LineKind::SourceLost { .. })
    }

    pub fn test_result(&self) -> Option<TestResult> {
        let caps = TEST_RESULT_RE.captures(&self.text)?;
        let outcome = match &caps["outcome"] {
            "PASSED" => TestOutcome::Passed,
            _ => TestOutcome::Failed,
        };
        Some(TestResult {
            node_id: caps["node"].to_string(),
            outcome,
        })
    }
}
