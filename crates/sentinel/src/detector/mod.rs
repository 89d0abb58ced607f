//! Run detection: decides when a run starts and when it has ended.

mod github;
mod process;

pub use github::{GithubActionsSource, GithubConfig};
pub(crate) use github::{workflow_run_id, GithubClient};
pub use process::ProcessRunSource;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    metrics,
    retry::Backoff,
    run::{RunContext, RunState, TriggerSource},
    store::{update_with_retry, RunStore},
    Error, Result,
};

/// What the upstream run source reports for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ExternalStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed(Option<String>),
}

/// A run as seen by a poll, before it becomes a `RunContext`.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedRun {
    pub run_id: String,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub status: ExternalStatus,
    pub labels: BTreeMap<String, String>,
}

/// An upstream that knows which runs exist (CI API, local process table).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RunSource: Send + Sync {
    fn name(&self) -> String;

    /// Runs that are currently queued or in progress.
    async fn poll(&self) -> Result<Vec<ObservedRun>>;

    async fn status(&self, run_id: &str) -> Result<ExternalStatus>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub poll_interval_secs: u64,
    /// Runs still active after this long are finalized as TIMED_OUT.
    pub max_run_duration_secs: u64,
    /// Attempts against the run source before giving up on it.
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            max_run_duration_secs: 3 * 60 * 60,
            retry_attempts: 5,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
        }
    }
}

impl DetectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

pub struct RunDetector {
    source: Arc<dyn RunSource>,
    store: Arc<dyn RunStore>,
    config: DetectorConfig,
    backoff: Backoff,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
    seen: Mutex<HashSet<String>>,
    backlog: Mutex<VecDeque<ObservedRun>>,
}

impl RunDetector {
    pub fn new(source: Arc<dyn RunSource>, store: Arc<dyn RunStore>, config: DetectorConfig) -> Self {
        let backoff = Backoff::new(
            Duration::from_millis(config.retry_base_ms),
            Duration::from_millis(config.retry_max_ms),
            config.retry_attempts,
        );
        Self {
            source,
            store,
            config,
            backoff,
            namespace: None,
            labels: BTreeMap::new(),
            seen: Mutex::new(HashSet::new()),
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    /// Namespace and pod labels every detected run is scoped to.
    pub fn with_scope(mut self, namespace: Option<String>, labels: BTreeMap<String, String>) -> Self {
        self.namespace = namespace;
        self.labels = labels;
        self
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Return the next run not seen before, persisting it first. One poll can
    /// surface several runs; they are handed out one per call.
    ///
    /// An unreachable source is logged and reported as "nothing new".
    pub async fn detect(&self) -> Result<Option<RunContext>> {
        loop {
            let next = lock(&self.backlog).pop_front();
            let observed = match next {
                Some(observed) => observed,
                None => {
                    if !self.refill().await? {
                        return Ok(None);
                    }
                    continue;
                }
            };
            if let Some(run) = self.register(observed).await? {
                return Ok(Some(run));
            }
        }
    }

    async fn refill(&self) -> Result<bool> {
        let polled = match self.backoff.retry("poll run source", || self.source.poll()).await {
            Ok(polled) => polled,
            Err(e) if e.is_transient() => {
                warn!("Run source {} unreachable, skipping this poll: {}", self.source.name(), e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let mut seen = lock(&self.seen);
        let mut backlog = lock(&self.backlog);
        // Ids the source no longer reports cannot come back through this poll.
        seen.retain(|id| polled.iter().any(|o| &o.run_id == id));
        for observed in polled {
            if !seen.contains(&observed.run_id) && !backlog.iter().any(|b| b.run_id == observed.run_id) {
                backlog.push_back(observed);
            }
        }
        Ok(!backlog.is_empty())
    }

    /// A run is only marked seen once the store has answered for it, so a
    /// failed write leaves it to be picked up by the next poll.
    async fn register(&self, observed: ObservedRun) -> Result<Option<RunContext>> {
        let run_id = observed.run_id.clone();
        let registered = self.persist(observed).await;
        match &registered {
            Ok(_) => {
                lock(&self.seen).insert(run_id);
            }
            Err(e) => warn!("Failed to register run {}: {}", run_id, e),
        }
        registered
    }

    async fn persist(&self, observed: ObservedRun) -> Result<Option<RunContext>> {
        if let Some(existing) = self.store.load_run(&observed.run_id).await? {
            if existing.is_active() {
                info!("Resuming monitoring of run {} ({})", existing.run_id, existing.state);
                return Ok(Some(existing));
            }
            debug!("Run {} already finished as {}", existing.run_id, existing.state);
            return Ok(None);
        }

        let mut labels = self.labels.clone();
        labels.extend(observed.labels);
        let mut run = RunContext::new(&observed.run_id, observed.trigger, observed.started_at).with_labels(labels);
        run.namespace = self.namespace.clone();
        if observed.status == ExternalStatus::InProgress {
            run.transition(RunState::Running, Utc::now())?;
        }

        match self.store.save_run(&run).await {
            Ok(saved) => {
                metrics::RUNS_DETECTED.inc();
                info!(
                    "Detected run {} via {} ({}, started {})",
                    saved.run_id,
                    self.source.name(),
                    saved.state,
                    saved.started_at
                );
                Ok(Some(saved))
            }
            // Another writer registered it between our load and save.
            Err(Error::Conflict { .. }) => Ok(self
                .store
                .load_run(&observed.run_id)
                .await?
                .filter(RunContext::is_active)),
            Err(e) => Err(e),
        }
    }

    /// Bring the stored run in line with the source. The returned context is
    /// terminal once the source reports completion or failure, the run has
    /// exceeded the maximum duration, or the source stayed unreachable through
    /// every retry (the latter two end as TIMED_OUT with a reason).
    pub async fn finalize(&self, run_id: &str) -> Result<RunContext> {
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))?;
        if !run.is_active() {
            lock(&self.seen).remove(run_id);
            return Ok(run);
        }

        let now = Utc::now();
        let max_duration = ChronoDuration::seconds(self.config.max_run_duration_secs as i64);
        let (next, reason) = if run.elapsed(now) > max_duration {
            (
                RunState::TimedOut,
                Some(format!(
                    "run exceeded the maximum duration of {}s",
                    self.config.max_run_duration_secs
                )),
            )
        } else {
            match self.backoff.retry("query run status", || self.source.status(run_id)).await {
                Ok(ExternalStatus::Succeeded) => (RunState::Completed, None),
                Ok(ExternalStatus::Failed(reason)) => (RunState::Failed, reason),
                Ok(ExternalStatus::InProgress) if run.state == RunState::Pending => (RunState::Running, None),
                Ok(_) => return Ok(run),
                Err(e) if e.is_transient() => (
                    RunState::TimedOut,
                    Some(format!(
                        "run source {} unreachable after {} attempts: {}",
                        self.source.name(),
                        self.backoff.max_attempts,
                        e
                    )),
                ),
                Err(e) => return Err(e),
            }
        };

        let mut finished_here = false;
        let updated = update_with_retry(self.store.as_ref(), run_id, 3, |stored| {
            finished_here = false;
            if stored.state.is_terminal() || stored.state == next {
                return Ok(());
            }
            if next.is_terminal() {
                stored.finish(next, reason.clone(), now)?;
                finished_here = true;
                Ok(())
            } else {
                stored.transition(next, now)
            }
        })
        .await?;

        if updated.state.is_terminal() {
            lock(&self.seen).remove(run_id);
        }
        if finished_here {
            metrics::RUNS_FINALIZED.with_label_values(&[updated.state.as_str()]).inc();
            match &updated.reason {
                Some(reason) => info!("Run {} finalized as {}: {}", run_id, updated.state, reason),
                None => info!("Run {} finalized as {}", run_id, updated.state),
            }
        }
        Ok(updated)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertRecord;
    use crate::anomaly::{Anomaly, DedupKey};
    use crate::store::{MemoryStore, Page, RunFilter};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Memory store whose first `failing_saves` writes fail as if the database were locked.
    #[derive(Default)]
    struct LockedOnceStore {
        inner: MemoryStore,
        failing_saves: AtomicU32,
    }

    #[async_trait]
    impl RunStore for LockedOnceStore {
        async fn init(&self) -> Result<()> {
            self.inner.init().await
        }

        async fn save_run(&self, run: &RunContext) -> Result<RunContext> {
            let failing = self.failing_saves.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_saves.store(failing - 1, Ordering::SeqCst);
                return Err(Error::TransientIo("database is locked".into()));
            }
            self.inner.save_run(run).await
        }

        async fn load_run(&self, run_id: &str) -> Result<Option<RunContext>> {
            self.inner.load_run(run_id).await
        }

        async fn list_runs(&self, filter: &RunFilter, page: Page) -> Result<Vec<RunContext>> {
            self.inner.list_runs(filter, page).await
        }

        async fn save_anomaly(&self, anomaly: &Anomaly) -> Result<()> {
            self.inner.save_anomaly(anomaly).await
        }

        async fn list_anomalies(&self, run_id: &str) -> Result<Vec<Anomaly>> {
            self.inner.list_anomalies(run_id).await
        }

        async fn save_alert_record(&self, record: &AlertRecord) -> Result<()> {
            self.inner.save_alert_record(record).await
        }

        async fn get_alert_record(&self, key: &DedupKey, channel: &str) -> Result<Option<AlertRecord>> {
            self.inner.get_alert_record(key, channel).await
        }
    }

    fn observed(id: &str, status: ExternalStatus) -> ObservedRun {
        ObservedRun {
            run_id: id.to_string(),
            trigger: TriggerSource::Ci,
            started_at: Utc::now(),
            status,
            labels: BTreeMap::new(),
        }
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            retry_attempts: 3,
            retry_base_ms: 10,
            retry_max_ms: 100,
            ..Default::default()
        }
    }

    fn source() -> MockRunSource {
        let mut source = MockRunSource::new();
        source.expect_name().return_const("github".to_string());
        source
    }

    #[tokio::test]
    async fn detects_each_run_once() {
        let mut source = source();
        source
            .expect_poll()
            .returning(|| Ok(vec![observed("gha-1", ExternalStatus::InProgress), observed("gha-2", ExternalStatus::Queued)]));
        let store = Arc::new(MemoryStore::new());
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "focus-server".to_string());
        let detector = RunDetector::new(Arc::new(source), store.clone(), config())
            .with_scope(Some("focus-ci".into()), labels);

        let first = detector.detect().await.unwrap().unwrap();
        assert_eq!(first.run_id, "gha-1");
        assert_eq!(first.state, RunState::Running);
        assert_eq!(first.namespace.as_deref(), Some("focus-ci"));
        assert_eq!(first.label_selector(), "app=focus-server");

        let second = detector.detect().await.unwrap().unwrap();
        assert_eq!(second.run_id, "gha-2");
        assert_eq!(second.state, RunState::Pending);

        assert!(detector.detect().await.unwrap().is_none());
        assert_eq!(store.load_run("gha-1").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn finished_runs_in_history_are_not_redetected() {
        let store = Arc::new(MemoryStore::new());
        let mut done = RunContext::new("gha-3", TriggerSource::Ci, Utc::now());
        done.finish(RunState::Completed, None, Utc::now()).unwrap();
        store.save_run(&done).await.unwrap();

        let mut source = source();
        source
            .expect_poll()
            .returning(|| Ok(vec![observed("gha-3", ExternalStatus::InProgress)]));
        let detector = RunDetector::new(Arc::new(source), store, config());
        assert!(detector.detect().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finalize_follows_source_verdict() {
        let mut source = source();
        source
            .expect_poll()
            .returning(|| Ok(vec![observed("gha-4", ExternalStatus::InProgress)]));
        source
            .expect_status()
            .withf(|id| id == "gha-4")
            .returning(|_| Ok(ExternalStatus::Failed(Some("tests failed".into()))));
        let store = Arc::new(MemoryStore::new());
        let detector = RunDetector::new(Arc::new(source), store.clone(), config());
        detector.detect().await.unwrap().unwrap();

        let run = detector.finalize("gha-4").await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.reason.as_deref(), Some("tests failed"));
        assert!(run.ended_at.is_some());

        // Already terminal: a second finalize is a no-op.
        let again = detector.finalize("gha-4").await.unwrap();
        assert_eq!(again.version, run.version);
    }

    #[tokio::test]
    async fn in_progress_run_stays_active() {
        let mut source = source();
        source
            .expect_poll()
            .returning(|| Ok(vec![observed("gha-5", ExternalStatus::Queued)]));
        source.expect_status().returning(|_| Ok(ExternalStatus::InProgress));
        let detector = RunDetector::new(Arc::new(source), Arc::new(MemoryStore::new()), config());
        detector.detect().await.unwrap().unwrap();

        let run = detector.finalize("gha-5").await.unwrap();
        assert_eq!(run.state, RunState::Running);
        assert!(run.ended_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_source_times_the_run_out() {
        let mut source = source();
        source
            .expect_poll()
            .returning(|| Ok(vec![observed("gha-6", ExternalStatus::InProgress)]));
        source
            .expect_status()
            .times(3)
            .returning(|_| Err(Error::TransientIo("connection reset".into())));
        let detector = RunDetector::new(Arc::new(source), Arc::new(MemoryStore::new()), config());
        detector.detect().await.unwrap().unwrap();

        let run = detector.finalize("gha-6").await.unwrap();
        assert_eq!(run.state, RunState::TimedOut);
        assert!(run.reason.unwrap().contains("unreachable after 3 attempts"));
    }

    #[tokio::test]
    async fn overlong_run_times_out_without_asking_the_source() {
        let store = Arc::new(MemoryStore::new());
        let mut run = RunContext::new("gha-7", TriggerSource::Ci, Utc::now() - ChronoDuration::hours(4));
        run.transition(RunState::Running, Utc::now()).unwrap();
        store.save_run(&run).await.unwrap();

        let mut source = source();
        source.expect_status().never();
        let detector = RunDetector::new(Arc::new(source), store, config());

        let run = detector.finalize("gha-7").await.unwrap();
        assert_eq!(run.state, RunState::TimedOut);
        assert!(run.reason.unwrap().contains("maximum duration"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_poll_reports_nothing_new() {
        let mut source = source();
        source
            .expect_poll()
            .returning(|| Err(Error::TransientIo("dns failure".into())));
        let detector = RunDetector::new(Arc::new(source), Arc::new(MemoryStore::new()), config());
        assert!(detector.detect().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_registration_is_retried_on_next_poll() {
        let mut source = source();
        source
            .expect_poll()
            .returning(|| Ok(vec![observed("gha-1", ExternalStatus::InProgress)]));
        let store = Arc::new(LockedOnceStore {
            failing_saves: AtomicU32::new(1),
            ..Default::default()
        });
        let detector = RunDetector::new(Arc::new(source), store.clone(), config());

        assert!(matches!(detector.detect().await, Err(Error::TransientIo(_))));
        let run = detector.detect().await.unwrap().unwrap();
        assert_eq!(run.run_id, "gha-1");
        assert_eq!(run.version, 1);
        assert!(detector.detect().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seen_ids_are_pruned() {
        let mut source = source();
        let mut polls = 0;
        source.expect_poll().returning(move || {
            polls += 1;
            if polls == 1 {
                Ok(vec![observed("gha-8", ExternalStatus::InProgress)])
            } else {
                Ok(vec![observed("gha-9", ExternalStatus::InProgress)])
            }
        });
        source
            .expect_status()
            .returning(|_| Ok(ExternalStatus::Succeeded));
        let detector = RunDetector::new(Arc::new(source), Arc::new(MemoryStore::new()), config());

        detector.detect().await.unwrap().unwrap();
        assert!(lock(&detector.seen).contains("gha-8"));
        detector.finalize("gha-8").await.unwrap();
        assert!(!lock(&detector.seen).contains("gha-8"));

        // Ids that drop out of the source listing are forgotten as well.
        assert_eq!(detector.detect().await.unwrap().unwrap().run_id, "gha-9");
        let seen = lock(&detector.seen).clone();
        assert_eq!(seen, HashSet::from(["gha-9".to_string()]));
    }

    #[tokio::test]
    async fn finalize_unknown_run_is_not_found() {
        let detector = RunDetector::new(Arc::new(source()), Arc::new(MemoryStore::new()), config());
        assert!(matches!(detector.finalize("nope").await, Err(Error::NotFound(_))));
    }
}
