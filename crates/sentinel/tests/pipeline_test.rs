use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use focus_sentinel::{
    alerts::{AlertChannel, AlertDispatcher, AlertMessage, DeliveryStatus},
    anomaly::{Anomaly, AnomalyKind, RuleConfig, Severity},
    kubernetes::{KubernetesWatcher, PodApi, PodChange, PodListing, PodPhase, PodSnapshot, WatcherConfig},
    logs::{LogSource, StaticLogSources},
    run::{RunContext, RunState, TriggerSource},
    sentinel::Sentinel,
    store::{MemoryStore, RunStore},
    template::AlertTemplates,
    Result,
};

/// Collects every delivered alert.
#[derive(Default)]
struct RecordingChannel {
    delivered: Mutex<Vec<AlertMessage>>,
}

#[async_trait]
impl AlertChannel for RecordingChannel {
    fn name(&self) -> String {
        "recording".to_string()
    }

    async fn deliver(&self, message: &AlertMessage) -> Result<()> {
        self.delivered.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Emits a fixed script of lines, then stays connected.
struct ScriptedLog {
    id: String,
    lines: Vec<String>,
}

impl LogSource for ScriptedLog {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(&self, _since: Option<DateTime<Utc>>) -> BoxStream<'static, Result<String>> {
        stream::iter(self.lines.clone().into_iter().map(Ok))
            .chain(stream::pending())
            .boxed()
    }
}

/// One listing, then one scripted watch.
struct ScriptedPods {
    listing: PodListing,
    changes: Mutex<Option<Vec<Result<PodChange>>>>,
}

#[async_trait]
impl PodApi for ScriptedPods {
    async fn list(&self, _namespace: &str, _selector: &str) -> Result<PodListing> {
        Ok(self.listing.clone())
    }

    fn watch(&self, _namespace: &str, _selector: &str, _version: &str) -> BoxStream<'static, Result<PodChange>> {
        let changes = self.changes.lock().unwrap().take().unwrap_or_default();
        stream::iter(changes).chain(stream::pending()).boxed()
    }
}

fn pod(phase: PodPhase, restarts: u32) -> PodSnapshot {
    let mut pod = PodSnapshot::new("focus-api-0", "focus-ci", phase);
    pod.restart_count = restarts;
    pod
}

async fn running(store: &Arc<MemoryStore>, id: &str) -> RunContext {
    let mut run = RunContext::new(id, TriggerSource::Local, Utc::now()).with_namespace("focus-ci");
    run.transition(RunState::Running, Utc::now()).unwrap();
    store.save_run(&run).await.unwrap()
}

async fn finish(sentinel: &Sentinel, store: &Arc<MemoryStore>, id: &str) {
    let mut run = store.load_run(id).await.unwrap().unwrap();
    run.finish(RunState::Completed, None, Utc::now()).unwrap();
    let run = store.save_run(&run).await.unwrap();
    sentinel.stop_run(&run).await.unwrap();
}

async fn wait_for_anomalies(store: &Arc<MemoryStore>, id: &str, done: impl Fn(&[Anomaly]) -> bool) {
    for _ in 0..500 {
        if done(&store.list_anomalies(id).await.unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("anomalies for {} never reached the expected state", id);
}

fn dispatcher(store: Arc<MemoryStore>, channel: Arc<RecordingChannel>) -> AlertDispatcher {
    AlertDispatcher::new(
        store,
        channel,
        Arc::new(AlertTemplates::new(None).unwrap()),
        &Default::default(),
    )
}

#[tokio::test]
async fn error_burst_is_alerted_once_and_counters_follow_results() {
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(RecordingChannel::default());

    let mut lines = vec![
        "tests/integration/api/test_login.py::test_valid_user PASSED".to_string(),
        "tests/integration/api/test_login.py::test_locked_user FAILED".to_string(),
    ];
    lines.extend((0..12).map(|i| format!("2024-06-01 10:00:{:02} ERROR [api.auth] token refresh failed", i)));
    let source: Arc<dyn LogSource> = Arc::new(ScriptedLog {
        id: "pod/focus-api-0".into(),
        lines,
    });

    let sentinel = Sentinel::builder(store.clone(), RuleConfig::default())
        .log_provider(Arc::new(StaticLogSources::new(vec![source])))
        .dispatcher(dispatcher(store.clone(), channel.clone()))
        .build()
        .unwrap();

    let run = running(&store, "local-100").await;
    sentinel.start_run(run).await.unwrap();
    wait_for_anomalies(&store, "local-100", |found| found.first().map_or(false, |a| a.repeat_count == 3)).await;
    finish(&sentinel, &store, "local-100").await;

    let anomalies = sentinel.list_anomalies("local-100").await.unwrap();
    assert_eq!(anomalies.len(), 1);
    let burst = &anomalies[0];
    assert_eq!(burst.kind(), AnomalyKind::LogErrorBurst);
    assert_eq!(burst.severity, Severity::Warning);
    assert_eq!(burst.repeat_count, 3);
    assert_eq!(burst.subsystem.as_deref(), Some("api"));

    let delivered = channel.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].title.starts_with("[WARNING] LOG_ERROR_BURST"));

    let record = store
        .get_alert_record(&burst.key, "recording")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DeliveryStatus::Sent);

    let status = sentinel.get_run_status("local-100").await.unwrap();
    assert_eq!(status.run.tests_passed, 1);
    assert_eq!(status.run.tests_failed, 1);
    assert_eq!(status.run.state, RunState::Completed);
    assert!(!status.monitored);
}

#[tokio::test]
async fn repeated_crashes_raise_one_critical_crash_loop() {
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(RecordingChannel::default());
    let pods = ScriptedPods {
        listing: PodListing {
            pods: vec![pod(PodPhase::Running, 0)],
            resource_version: "100".into(),
        },
        changes: Mutex::new(Some(vec![
            Ok(PodChange::Applied(pod(PodPhase::Crashed, 1))),
            Ok(PodChange::Applied(pod(PodPhase::Running, 1))),
            Ok(PodChange::Applied(pod(PodPhase::Crashed, 2))),
            Ok(PodChange::Applied(pod(PodPhase::Running, 2))),
            Ok(PodChange::Applied(pod(PodPhase::Crashed, 3))),
        ])),
    };

    let sentinel = Sentinel::builder(store.clone(), RuleConfig::default())
        .watcher(KubernetesWatcher::new(Arc::new(pods), WatcherConfig::default()))
        .dispatcher(dispatcher(store.clone(), channel.clone()))
        .build()
        .unwrap();

    let run = running(&store, "local-200").await;
    sentinel.start_run(run).await.unwrap();
    wait_for_anomalies(&store, "local-200", |found| !found.is_empty()).await;
    finish(&sentinel, &store, "local-200").await;

    let anomalies = sentinel.list_anomalies("local-200").await.unwrap();
    let crash_loops: Vec<_> = anomalies
        .iter()
        .filter(|a| a.kind() == AnomalyKind::PodCrashLoop)
        .collect();
    assert_eq!(crash_loops.len(), 1);
    assert_eq!(crash_loops[0].severity, Severity::Critical);
    assert_eq!(crash_loops[0].key.target, "focus-api-0");

    let delivered = channel.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].severity, Severity::Critical);
}

fn crashing_pods(restarts: std::ops::RangeInclusive<u32>) -> ScriptedPods {
    ScriptedPods {
        listing: PodListing {
            pods: vec![pod(PodPhase::Running, 0)],
            resource_version: "100".into(),
        },
        // Back-off: the pod never reports Running between restarts.
        changes: Mutex::new(Some(
            restarts
                .map(|n| Ok(PodChange::Applied(pod(PodPhase::Crashed, n))))
                .collect(),
        )),
    }
}

#[tokio::test]
async fn back_off_restarts_raise_a_crash_loop() {
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(RecordingChannel::default());

    let sentinel = Sentinel::builder(store.clone(), RuleConfig::default())
        .watcher(KubernetesWatcher::new(Arc::new(crashing_pods(1..=4)), WatcherConfig::default()))
        .dispatcher(dispatcher(store.clone(), channel.clone()))
        .build()
        .unwrap();

    let run = running(&store, "local-300").await;
    sentinel.start_run(run).await.unwrap();
    wait_for_anomalies(&store, "local-300", |found| {
        found.iter().any(|a| a.kind() == AnomalyKind::PodCrashLoop)
    })
    .await;
    finish(&sentinel, &store, "local-300").await;

    let anomalies = sentinel.list_anomalies("local-300").await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind(), AnomalyKind::PodCrashLoop);
    assert_eq!(anomalies[0].severity, Severity::Critical);

    let delivered = channel.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
}

#[tokio::test]
async fn crash_threshold_above_evidence_cap_is_honored() {
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(RecordingChannel::default());
    let rules = RuleConfig {
        crash_threshold: 25,
        ..Default::default()
    };
    // Leave crash loop detection to the rule engine.
    let watcher = WatcherConfig {
        crash_loop_threshold: 100,
        ..Default::default()
    };

    let sentinel = Sentinel::builder(store.clone(), rules)
        .watcher(KubernetesWatcher::new(Arc::new(crashing_pods(1..=30)), watcher))
        .dispatcher(dispatcher(store.clone(), channel.clone()))
        .build()
        .unwrap();

    let run = running(&store, "local-400").await;
    sentinel.start_run(run).await.unwrap();
    wait_for_anomalies(&store, "local-400", |found| found.first().map_or(false, |a| a.repeat_count == 6)).await;
    finish(&sentinel, &store, "local-400").await;

    // Crashes 25 through 30 fire; the first 24 stay below the threshold.
    let anomalies = sentinel.list_anomalies("local-400").await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind(), AnomalyKind::PodCrashLoop);
    assert_eq!(anomalies[0].repeat_count, 6);
    assert_eq!(channel.delivered.lock().unwrap().len(), 1);
}
