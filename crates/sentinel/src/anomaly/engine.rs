use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use super::{Anomaly, AnomalyKind, DedupKey, Evidence, Observation, Severity, MAX_EVIDENCE};
use crate::{
    kubernetes::{PodEvent, PodEventKind},
    logs::LogLine,
    metrics,
    run::{RunContext, TestOutcome},
    structure::StructureAnalyzer,
    Error, Result,
};

pub const DEFAULT_RESOURCE_PATTERN: &str =
    r"(?i)oomkilled|out of memory|evicted|ephemeral-storage|memory pressure|disk pressure";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Error lines from one source within the window that make a burst.
    pub error_burst_threshold: u32,
    pub error_burst_window_secs: u64,
    /// CRASHED events for one pod within the window that make a crash loop.
    pub crash_threshold: u32,
    pub crash_window_secs: u64,
    pub max_run_duration_secs: u64,
    pub resource_pattern: String,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            error_burst_threshold: 10,
            error_burst_window_secs: 60,
            crash_threshold: 3,
            crash_window_secs: 600,
            max_run_duration_secs: 3 * 60 * 60,
            resource_pattern: DEFAULT_RESOURCE_PATTERN.to_string(),
        }
    }
}

/// Bounded rule state for one run.
#[derive(Debug)]
struct RunWindow {
    started_at: DateTime<Utc>,
    errors: HashMap<String, VecDeque<(DateTime<Utc>, u64)>>,
    crashes: HashMap<String, VecDeque<(DateTime<Utc>, uuid::Uuid)>>,
    terminal_pod_seen: bool,
    last_failed_test: Option<String>,
    open: HashMap<DedupKey, Anomaly>,
}

impl RunWindow {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            errors: HashMap::new(),
            crashes: HashMap::new(),
            terminal_pod_seen: false,
            last_failed_test: None,
            open: HashMap::new(),
        }
    }
}

/// A single rule firing before deduplication.
struct Firing {
    kind: AnomalyKind,
    target: String,
    severity: Severity,
    message: String,
    evidence: Vec<Evidence>,
}

/// Classifies log lines and pod events into deduplicated anomalies.
///
/// One engine is owned by one processing task, so all observations for a run
/// are applied in order by a single writer.
pub struct AnomalyEngine {
    config: RuleConfig,
    resource_re: Regex,
    analyzer: Option<StructureAnalyzer>,
    runs: HashMap<String, RunWindow>,
}

impl AnomalyEngine {
    pub fn new(config: RuleConfig) -> Result<Self> {
        let resource_re = Regex::new(&config.resource_pattern)
            .map_err(|e| Error::Config(format!("Invalid resource exhaustion pattern: {}", e)))?;
        Ok(Self {
            config,
            resource_re,
            analyzer: None,
            runs: HashMap::new(),
        })
    }

    pub fn with_analyzer(mut self, analyzer: StructureAnalyzer) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn begin_run(&mut self, run: &RunContext) {
        self.runs
            .entry(run.run_id.clone())
            .or_insert_with(|| RunWindow::new(run.started_at));
    }

    /// Apply one observation. Returns every anomaly the observation opened or
    /// updated; a repeat of an open condition comes back with a higher
    /// `repeat_count`, never as a second anomaly.
    pub fn process(&mut self, run_id: &str, observation: &Observation) -> Vec<Anomaly> {
        let at = observation.timestamp();
        let window = self.runs.entry(run_id.to_string()).or_insert_with(|| {
            debug!("Anomaly window for run {} opened implicitly", run_id);
            RunWindow::new(at)
        });

        let mut firings = match observation {
            Observation::Log(line) => log_rules(&self.config, window, line),
            Observation::Pod(event) => pod_rules(&self.config, &self.resource_re, window, event),
        };
        if let Some(firing) = timeout_rule(&self.config, window, run_id, at) {
            firings.push(firing);
        }

        let subsystem = window
            .last_failed_test
            .as_deref()
            .and_then(|node| self.analyzer.as_ref().and_then(|a| a.classify(node)));
        firings
            .into_iter()
            .map(|firing| record(window, run_id, firing, at, subsystem.clone()))
            .collect()
    }

    /// Time-driven rules; call periodically while the run is active.
    pub fn tick(&mut self, run_id: &str, now: DateTime<Utc>) -> Vec<Anomaly> {
        let Some(window) = self.runs.get_mut(run_id) else {
            return Vec::new();
        };
        match timeout_rule(&self.config, window, run_id, now) {
            Some(firing) => vec![record(window, run_id, firing, now, None)],
            None => Vec::new(),
        }
    }

    pub fn open_anomalies(&self, run_id: &str) -> Vec<Anomaly> {
        let mut open: Vec<Anomaly> = self
            .runs
            .get(run_id)
            .map(|w| w.open.values().cloned().collect())
            .unwrap_or_default();
        open.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then_with(|| a.key.cmp(&b.key)));
        open
    }

    /// Discard the run's window state, returning what was still open.
    pub fn end_run(&mut self, run_id: &str) -> Vec<Anomaly> {
        let open = self.open_anomalies(run_id);
        if self.runs.remove(run_id).is_some() {
            debug!("Anomaly window for run {} discarded ({} open)", run_id, open.len());
        }
        open
    }

    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }
}

fn record(
    window: &mut RunWindow,
    run_id: &str,
    firing: Firing,
    at: DateTime<Utc>,
    subsystem: Option<String>,
) -> Anomaly {
    let key = DedupKey::new(run_id, firing.kind, firing.target);
    match window.open.get_mut(&key) {
        Some(existing) => {
            existing.absorb(firing.severity, firing.message, firing.evidence, at);
            if existing.subsystem.is_none() {
                existing.subsystem = subsystem;
            }
            debug!("Anomaly {} repeated ({}x)", key, existing.repeat_count);
            existing.clone()
        }
        None => {
            metrics::ANOMALIES_RAISED
                .with_label_values(&[firing.kind.as_str()])
                .inc();
            let mut anomaly = Anomaly::new(key.clone(), firing.severity, firing.message, firing.evidence, at);
            anomaly.subsystem = subsystem;
            info!("Anomaly {} opened with severity {}", key, anomaly.severity);
            window.open.insert(key, anomaly.clone());
            anomaly
        }
    }
}

fn log_rules(config: &RuleConfig, window: &mut RunWindow, line: &LogLine) -> Vec<Firing> {
    let mut firings = Vec::new();

    if line.is_source_lost() {
        warn!("Monitoring degraded: {}", line.text);
        firings.push(Firing {
            kind: AnomalyKind::MonitoringDegraded,
            target: format!("log:{}", line.source),
            severity: Severity::Warning,
            message: line.text.clone(),
            evidence: vec![Evidence::LogLine {
                source: line.source.clone(),
                seq: line.seq,
            }],
        });
        return firings;
    }

    if let Some(result) = line.test_result() {
        if result.outcome == TestOutcome::Failed {
            window.last_failed_test = Some(result.node_id);
        }
    }

    if !line.is_error() {
        return firings;
    }

    let threshold = config.error_burst_threshold.max(1) as usize;
    let span = Duration::seconds(config.error_burst_window_secs as i64);
    let errors = window.errors.entry(line.source.clone()).or_default();
    errors.push_back((line.timestamp, line.seq));
    while errors
        .front()
        .map(|(t, _)| line.timestamp - *t > span)
        .unwrap_or(false)
    {
        errors.pop_front();
    }
    // Severity tops out at 2N, so older entries beyond that are irrelevant.
    while errors.len() > threshold * 2 {
        errors.pop_front();
    }

    let count = errors.len();
    if count >= threshold {
        let severity = if count >= threshold * 2 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        let evidence = errors
            .iter()
            .rev()
            .take(MAX_EVIDENCE)
            .rev()
            .map(|(_, seq)| Evidence::LogLine {
                source: line.source.clone(),
                seq: *seq,
            })
            .collect();
        firings.push(Firing {
            kind: AnomalyKind::LogErrorBurst,
            target: line.source.clone(),
            severity,
            message: format!(
                "{} error lines from {} within {}s",
                count, line.source, config.error_burst_window_secs
            ),
            evidence,
        });
    }
    firings
}

fn pod_rules(config: &RuleConfig, resource_re: &Regex, window: &mut RunWindow, event: &PodEvent) -> Vec<Firing> {
    let mut firings = Vec::new();
    let evidence = vec![Evidence::PodEvent { id: event.id }];

    if event.kind.is_terminal() {
        window.terminal_pod_seen = true;
    }

    match event.kind {
        PodEventKind::WatchLost => {
            firings.push(Firing {
                kind: AnomalyKind::MonitoringDegraded,
                target: event.pod.clone(),
                severity: Severity::Warning,
                message: event
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("pod watch lost for {}", event.namespace)),
                evidence,
            });
            return firings;
        }
        PodEventKind::Crashed => {
            let span = Duration::seconds(config.crash_window_secs as i64);
            let threshold = config.crash_threshold.max(1) as usize;
            let crashes = window.crashes.entry(event.pod.clone()).or_default();
            crashes.push_back((event.timestamp, event.id));
            while crashes
                .front()
                .map(|(t, _)| event.timestamp - *t > span)
                .unwrap_or(false)
            {
                crashes.pop_front();
            }
            while crashes.len() > threshold.max(MAX_EVIDENCE) {
                crashes.pop_front();
            }
            if crashes.len() >= threshold {
                firings.push(Firing {
                    kind: AnomalyKind::PodCrashLoop,
                    target: event.pod.clone(),
                    severity: Severity::Critical,
                    message: format!(
                        "pod {} crashed {} times within {}s",
                        event.pod,
                        crashes.len(),
                        config.crash_window_secs
                    ),
                    evidence: crashes
                        .iter()
                        .rev()
                        .take(MAX_EVIDENCE)
                        .rev()
                        .map(|(_, id)| Evidence::PodEvent { id: *id })
                        .collect(),
                });
            }
        }
        PodEventKind::CrashLoop { restarts } => {
            firings.push(Firing {
                kind: AnomalyKind::PodCrashLoop,
                target: event.pod.clone(),
                severity: Severity::Critical,
                message: format!("pod {} is crash looping ({} restarts in window)", event.pod, restarts),
                evidence: evidence.clone(),
            });
        }
        _ => {}
    }

    let reason = [event.reason.as_deref(), event.message.as_deref()]
        .into_iter()
        .flatten()
        .find(|text| resource_re.is_match(text));
    if let Some(reason) = reason {
        firings.push(Firing {
            kind: AnomalyKind::ResourceExhaustion,
            target: event.pod.clone(),
            severity: Severity::Critical,
            message: format!("pod {} {}: {}", event.pod, event.kind, reason),
            evidence,
        });
    }
    firings
}

fn timeout_rule(config: &RuleConfig, window: &RunWindow, run_id: &str, now: DateTime<Utc>) -> Option<Firing> {
    let limit = Duration::seconds(config.max_run_duration_secs as i64);
    let elapsed = now - window.started_at;
    if window.terminal_pod_seen || elapsed <= limit {
        return None;
    }
    let key = DedupKey::new(run_id, AnomalyKind::TimeoutExceeded, run_id);
    // Refresh only when this observation is newer than the last firing.
    if window.open.contains_key(&key) && now <= window.open[&key].last_seen {
        return None;
    }
    Some(Firing {
        kind: AnomalyKind::TimeoutExceeded,
        target: run_id.to_string(),
        severity: Severity::Critical,
        message: format!(
            "run {} active for {}s, limit is {}s",
            run_id,
            elapsed.num_seconds(),
            config.max_run_duration_secs
        ),
        evidence: Vec::new(),
    })
}
