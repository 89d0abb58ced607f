//! Run Context
//!
//! One execution of the observed workload: identity, lifecycle state, timing and
//! accumulated test counters. Lifecycle transitions are monotonic.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Ci,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::TimedOut)
    }

    fn rank(self) -> u8 {
        match self {
            RunState::Pending => 0,
            RunState::Running => 1,
            RunState::Completed | RunState::Failed | RunState::TimedOut => 2,
        }
    }

    /// Whether a stored record in `self` may be overwritten with `next`.
    /// Re-saving the same state is allowed; leaving a terminal state is not.
    pub fn allows(self, next: RunState) -> bool {
        if self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunState::Pending),
            "running" => Ok(RunState::Running),
            "completed" => Ok(RunState::Completed),
            "failed" => Ok(RunState::Failed),
            "timed_out" => Ok(RunState::TimedOut),
            _ => Err(Error::Validation(format!("Invalid run state: {}", s))),
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Ci => write!(f, "ci"),
            TriggerSource::Local => write!(f, "local"),
        }
    }
}

impl FromStr for TriggerSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ci" => Ok(TriggerSource::Ci),
            "local" => Ok(TriggerSource::Local),
            _ => Err(Error::Validation(format!("Invalid trigger source: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub trigger: TriggerSource,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    /// Set iff `state` is terminal.
    pub ended_at: Option<DateTime<Utc>>,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub tests_passed: u32,
    pub tests_failed: u32,
    /// Diagnostic attached to a terminal transition (e.g. why the run timed out).
    pub reason: Option<String>,
    /// Optimistic concurrency token; 0 means "never persisted".
    pub version: i64,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, trigger: TriggerSource, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            trigger,
            state: RunState::Pending,
            started_at,
            ended_at: None,
            namespace: None,
            labels: BTreeMap::new(),
            tests_passed: 0,
            tests_failed: 0,
            reason: None,
            version: 0,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Kubernetes label selector (`k=v,k2=v2`) for the run's workload.
    pub fn label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        now - self.started_at
    }

    /// Move to `next`, rejecting any transition out of a terminal state or backwards.
    pub fn transition(&mut self, next: RunState, at: DateTime<Utc>) -> Result<()> {
        if self.state.is_terminal() || !self.state.allows(next) {
            return Err(Error::StateViolation {
                run_id: self.run_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(at);
        }
        Ok(())
    }

    pub fn finish(&mut self, state: RunState, reason: Option<String>, at: DateTime<Utc>) -> Result<()> {
        if !state.is_terminal() {
            return Err(Error::Validation(format!(
                "finish requires a terminal state, got {}",
                state
            )));
        }
        self.transition(state, at)?;
        self.reason = reason;
        Ok(())
    }

    pub fn record_test(&mut self, outcome: TestOutcome) {
        match outcome {
            TestOutcome::Passed => self.tests_passed += 1,
            TestOutcome::Failed => self.tests_failed += 1,
        }
    }
}

/// Cancellation signal tied to a run's lifecycle: subscribers stop once the run
/// reaches a terminal state or the owning sentinel drops the sender.
#[derive(Debug, Clone)]
pub struct RunSignal {
    rx: watch::Receiver<RunState>,
}

pub fn run_signal(initial: RunState) -> (watch::Sender<RunState>, RunSignal) {
    let (tx, rx) = watch::channel(initial);
    (tx, RunSignal { rx })
}

impl RunSignal {
    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_terminal() || self.rx.has_changed().is_err()
    }

    /// Resolves once the run is terminal. Cancel-safe.
    pub async fn finished(&mut self) {
        let _ = self.rx.wait_for(|state| state.is_terminal()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> RunContext {
        RunContext::new("run-1", TriggerSource::Ci, Utc::now())
    }

    #[test]
    fn terminal_state_is_final() {
        let mut ctx = run();
        let now = Utc::now();
        ctx.transition(RunState::Running, now).unwrap();
        ctx.transition(RunState::Completed, now).unwrap();
        assert_eq!(ctx.ended_at, Some(now));

        for next in [
            RunState::Pending,
            RunState::Running,
            RunState::Completed,
            RunState::Failed,
            RunState::TimedOut,
        ] {
            let err = ctx.transition(next, now).unwrap_err();
            assert!(matches!(err, Error::StateViolation { .. }));
            assert_eq!(ctx.state, RunState::Completed);
        }
    }

    #[test]
    fn backward_transition_rejected() {
        let mut ctx = run();
        ctx.transition(RunState::Running, Utc::now()).unwrap();
        assert!(ctx.transition(RunState::Pending, Utc::now()).is_err());
        assert_eq!(ctx.state, RunState::Running);
        assert!(ctx.ended_at.is_none());
    }

    #[test]
    fn pending_can_time_out_directly() {
        let mut ctx = run();
        ctx.finish(RunState::TimedOut, Some("source unreachable".into()), Utc::now())
            .unwrap();
        assert_eq!(ctx.state, RunState::TimedOut);
        assert!(ctx.ended_at.is_some());
        assert_eq!(ctx.reason.as_deref(), Some("source unreachable"));
    }

    #[test]
    fn finish_requires_terminal_state() {
        let mut ctx = run();
        assert!(ctx.finish(RunState::Running, None, Utc::now()).is_err());
        assert!(ctx.ended_at.is_none());
    }

    #[test]
    fn label_selector_is_sorted() {
        let mut labels = BTreeMap::new();
        labels.insert("tier".to_string(), "backend".to_string());
        labels.insert("app".to_string(), "focus-server".to_string());
        let ctx = run().with_labels(labels);
        assert_eq!(ctx.label_selector(), "app=focus-server,tier=backend");
    }

    #[tokio::test]
    async fn signal_fires_on_terminal_state() {
        let (tx, mut signal) = run_signal(RunState::Running);
        assert!(!signal.is_finished());
        tx.send(RunState::Failed).unwrap();
        signal.finished().await;
        assert!(signal.is_finished());
    }

    #[tokio::test]
    async fn signal_fires_when_sender_dropped() {
        let (tx, mut signal) = run_signal(RunState::Running);
        drop(tx);
        signal.finished().await;
        assert!(signal.is_finished());
    }
}
