//! Composition root: wires detection, streaming, watching, classification and
//! alerting together and answers read-only queries about runs.

use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    alerts::AlertDispatcher,
    anomaly::{Anomaly, AnomalyEngine, Observation, RuleConfig},
    detector::RunDetector,
    kubernetes::KubernetesWatcher,
    logs::{LogSourceProvider, LogStreamer, StreamerConfig},
    metrics,
    run::{run_signal, RunContext, RunSignal, RunState},
    store::{history_stream, update_with_retry, RunFilter, RunStore},
    structure::StructureAnalyzer,
    Error, Result,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelOptions {
    /// How often time-driven rules (run timeout) are evaluated.
    pub tick_interval_ms: u64,
    /// How long subscriptions get to release after a run ends.
    pub shutdown_grace_ms: u64,
    /// Observations queued between producers and the per-run processor.
    pub queue_capacity: usize,
    /// Reload-and-reapply attempts for counter updates.
    pub store_retry_attempts: u32,
}

impl Default for SentinelOptions {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            shutdown_grace_ms: 5_000,
            queue_capacity: 1_024,
            store_retry_attempts: 5,
        }
    }
}

/// A run plus what the sentinel knows about it right now.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    #[serde(flatten)]
    pub run: RunContext,
    /// Whether this process is currently following the run.
    pub monitored: bool,
    pub anomaly_count: usize,
}

struct RunHandle {
    state: watch::Sender<RunState>,
    task: JoinHandle<()>,
}

struct Shared {
    store: Arc<dyn RunStore>,
    dispatchers: Vec<Arc<AlertDispatcher>>,
    log_providers: Vec<Arc<dyn LogSourceProvider>>,
    watcher: Option<Arc<KubernetesWatcher>>,
    streamer: LogStreamer,
    rules: RuleConfig,
    analyzer: StructureAnalyzer,
    options: SentinelOptions,
}

pub struct Sentinel {
    shared: Arc<Shared>,
    detector: Option<Arc<RunDetector>>,
    runs: Mutex<HashMap<String, RunHandle>>,
}

pub struct SentinelBuilder {
    shared: Shared,
    detector: Option<RunDetector>,
}

impl SentinelBuilder {
    pub fn detector(mut self, detector: RunDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn dispatcher(mut self, dispatcher: AlertDispatcher) -> Self {
        self.shared.dispatchers.push(Arc::new(dispatcher));
        self
    }

    pub fn log_provider(mut self, provider: Arc<dyn LogSourceProvider>) -> Self {
        self.shared.log_providers.push(provider);
        self
    }

    pub fn watcher(mut self, watcher: KubernetesWatcher) -> Self {
        self.shared.watcher = Some(Arc::new(watcher));
        self
    }

    pub fn streamer(mut self, config: StreamerConfig) -> Self {
        self.shared.streamer = LogStreamer::new(config);
        self
    }

    pub fn analyzer(mut self, analyzer: StructureAnalyzer) -> Self {
        self.shared.analyzer = analyzer;
        self
    }

    pub fn options(mut self, options: SentinelOptions) -> Self {
        self.shared.options = options;
        self
    }

    pub fn build(self) -> Result<Sentinel> {
        // Fail on a bad rule set now rather than per run.
        AnomalyEngine::new(self.shared.rules.clone())?;
        Ok(Sentinel {
            shared: Arc::new(self.shared),
            detector: self.detector.map(Arc::new),
            runs: Mutex::new(HashMap::new()),
        })
    }
}

impl Sentinel {
    pub fn builder(store: Arc<dyn RunStore>, rules: RuleConfig) -> SentinelBuilder {
        SentinelBuilder {
            shared: Shared {
                store,
                dispatchers: Vec::new(),
                log_providers: Vec::new(),
                watcher: None,
                streamer: LogStreamer::new(StreamerConfig::default()),
                rules,
                analyzer: StructureAnalyzer::new(Vec::new()),
                options: SentinelOptions::default(),
            },
            detector: None,
        }
    }

    pub fn store(&self) -> Arc<dyn RunStore> {
        self.shared.store.clone()
    }

    // Queries

    pub async fn get_run_status(&self, run_id: &str) -> Result<RunStatus> {
        let run = self
            .shared
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))?;
        let anomaly_count = self.shared.store.list_anomalies(run_id).await?.len();
        let monitored = self.runs.lock().await.contains_key(run_id);
        Ok(RunStatus {
            run,
            monitored,
            anomaly_count,
        })
    }

    pub async fn list_anomalies(&self, run_id: &str) -> Result<Vec<Anomaly>> {
        if self.shared.store.load_run(run_id).await?.is_none() {
            return Err(Error::NotFound(format!("run {}", run_id)));
        }
        self.shared.store.list_anomalies(run_id).await
    }

    pub async fn list_active_runs(&self) -> Result<Vec<RunContext>> {
        history_stream(self.shared.store.clone(), RunFilter::active(), 100)
            .try_collect()
            .await
    }

    // Lifecycle

    /// Start following `run`. Idempotent per run id.
    pub async fn start_run(&self, run: RunContext) -> Result<()> {
        if !run.is_active() {
            return Err(Error::Validation(format!(
                "run {} is already {}",
                run.run_id, run.state
            )));
        }
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&run.run_id) {
            debug!("Run {} is already monitored", run.run_id);
            return Ok(());
        }

        let mut engine = AnomalyEngine::new(self.shared.rules.clone())?.with_analyzer(self.shared.analyzer.clone());
        engine.begin_run(&run);

        let (state, signal) = run_signal(run.state);
        let run_id = run.run_id.clone();
        metrics::ACTIVE_RUNS.inc();
        let task = tokio::spawn(monitor_run(self.shared.clone(), engine, run, signal));
        runs.insert(run_id, RunHandle { state, task });
        Ok(())
    }

    /// Signal that `run` ended and wait for its pipeline to drain. Pending
    /// alert deliveries finish before this returns.
    pub async fn stop_run(&self, run: &RunContext) -> Result<()> {
        if let Some(task) = self.release_run(run).await? {
            join_monitor(&run.run_id, task).await;
        }
        Ok(())
    }

    /// Detach `run` from this process and tell its pipeline to drain. Returns
    /// the monitor task, or `None` when the run was not monitored.
    async fn release_run(&self, run: &RunContext) -> Result<Option<JoinHandle<()>>> {
        if run.is_active() {
            return Err(Error::Validation(format!(
                "run {} is still {}",
                run.run_id, run.state
            )));
        }
        let Some(handle) = self.runs.lock().await.remove(&run.run_id) else {
            return Ok(None);
        };
        handle.state.send_replace(run.state);
        Ok(Some(handle.task))
    }

    pub async fn monitored_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop following every run without finalizing it, e.g. on process exit.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, RunHandle)> = self.runs.lock().await.drain().collect();
        let grace = Duration::from_millis(self.shared.options.shutdown_grace_ms);
        for (run_id, handle) in handles {
            // Dropping the sender finishes the run's signal.
            drop(handle.state);
            match tokio::time::timeout(grace * 2, handle.task).await {
                Ok(_) => debug!("Monitor for run {} stopped", run_id),
                Err(_) => warn!("Monitor for run {} did not stop in time", run_id),
            }
        }
    }

    /// Detection loop: resume runs left active by a previous process, then poll
    /// for new runs and finalize finished ones until `shutdown` resolves.
    ///
    /// A failure for one run is logged and the loop moves on. Ended runs drain
    /// in the background so a slow pipeline never delays detection.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let detector = self
            .detector
            .clone()
            .ok_or_else(|| Error::Config("no run detector configured".to_string()))?;

        for run in self.list_active_runs().await? {
            match detector.finalize(&run.run_id).await {
                Ok(run) if run.is_active() => self.start_or_log(run).await,
                Ok(run) => info!("Run {} ended while unobserved ({})", run.run_id, run.state),
                Err(e) => warn!("Could not reconcile run {}: {}", run.run_id, e),
            }
        }

        let mut draining = JoinSet::new();
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(detector.config().poll_interval());
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
                Some(joined) = draining.join_next(), if !draining.is_empty() => {
                    if let Err(e) = joined {
                        error!("Run drain task failed: {}", e);
                    }
                    continue;
                }
            }

            loop {
                match detector.detect().await {
                    Ok(Some(run)) => self.start_or_log(run).await,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Run detection failed: {}", e);
                        break;
                    }
                }
            }

            for run_id in self.monitored_runs().await {
                let run = match detector.finalize(&run_id).await {
                    Ok(run) if !run.is_active() => run,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Could not check run {}: {}", run_id, e);
                        continue;
                    }
                };
                match self.release_run(&run).await {
                    Ok(Some(task)) => {
                        draining.spawn(async move { join_monitor(&run.run_id, task).await });
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Could not stop run {}: {}", run.run_id, e),
                }
            }
        }

        info!("Sentinel stopping");
        let grace = Duration::from_millis(self.shared.options.shutdown_grace_ms);
        let drained = tokio::time::timeout(grace * 2, async {
            while draining.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("{} ended run(s) did not drain in time", draining.len());
            draining.abort_all();
        }
        self.shutdown().await;
        Ok(())
    }

    async fn start_or_log(&self, run: RunContext) {
        let run_id = run.run_id.clone();
        if let Err(e) = self.start_run(run).await {
            error!("Could not start monitoring run {}: {}", run_id, e);
        }
    }
}

async fn join_monitor(run_id: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!("Monitor for run {} panicked: {}", run_id, e);
    }
}

/// Everything for one run: producers feed one queue, one task applies the
/// rules in order and hands anomalies to the dispatchers.
#[instrument(skip_all, fields(run_id = %run.run_id))]
async fn monitor_run(shared: Arc<Shared>, mut engine: AnomalyEngine, run: RunContext, mut signal: RunSignal) {
    let run_id = run.run_id.clone();
    let grace = Duration::from_millis(shared.options.shutdown_grace_ms);
    let (tx, mut rx) = mpsc::channel::<Observation>(shared.options.queue_capacity.max(1));

    let mut sources = Vec::new();
    for provider in &shared.log_providers {
        match provider.sources_for(&run).await {
            Ok(found) => sources.extend(found),
            Err(e) => warn!("Could not resolve log sources: {}", e),
        }
    }
    let mut subscription = shared.streamer.subscribe(&run, sources, signal.clone());
    let log_tx = tx.clone();
    let logs = tokio::spawn(async move {
        while let Some(line) = subscription.next().await {
            if log_tx.send(Observation::Log(line)).await.is_err() {
                break;
            }
        }
        subscription.shutdown(grace).await;
    });

    let pods = match (&shared.watcher, run.namespace.as_deref()) {
        (Some(watcher), Some(namespace)) => {
            let mut events = watcher.subscribe(namespace, &run.label_selector(), signal.clone());
            let pod_tx = tx.clone();
            Some(tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if pod_tx.send(Observation::Pod(event)).await.is_err() {
                        break;
                    }
                }
            }))
        }
        _ => None,
    };
    drop(tx);

    let mut deliveries = JoinSet::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(shared.options.tick_interval_ms.max(1)));
    let mut producers_done = false;
    let mut finished = signal.is_finished();
    loop {
        if producers_done && finished {
            break;
        }
        tokio::select! {
            observation = rx.recv(), if !producers_done => match observation {
                Some(observation) => {
                    if let Observation::Log(line) = &observation {
                        if let Some(result) = line.test_result() {
                            record_test(&shared, &run_id, result.outcome).await;
                        }
                    }
                    let anomalies = engine.process(&run_id, &observation);
                    handle_anomalies(&shared, anomalies, &mut deliveries).await;
                }
                None => producers_done = true,
            },
            _ = ticker.tick() => {
                let anomalies = engine.tick(&run_id, Utc::now());
                handle_anomalies(&shared, anomalies, &mut deliveries).await;
            }
            _ = signal.finished(), if !finished => finished = true,
            Some(joined) = deliveries.join_next(), if !deliveries.is_empty() => {
                if let Err(e) = joined {
                    error!("Alert delivery task failed: {}", e);
                }
            }
        }
    }

    let open = engine.end_run(&run_id);
    // Deliveries already started are not cancelled.
    while let Some(joined) = deliveries.join_next().await {
        if let Err(e) = joined {
            error!("Alert delivery task failed: {}", e);
        }
    }
    let mut producers: Vec<JoinHandle<()>> = std::iter::once(logs).chain(pods).collect();
    // The log task spends up to `grace` releasing its own sources.
    let joined = tokio::time::timeout(grace * 2, async {
        for producer in producers.iter_mut() {
            let _ = producer.await;
        }
    })
    .await;
    if joined.is_err() {
        warn!("Producers for run {} did not stop in time, aborting", run_id);
        producers.iter().for_each(JoinHandle::abort);
    }
    for dispatcher in &shared.dispatchers {
        dispatcher.forget_run(&run_id);
    }
    metrics::ACTIVE_RUNS.dec();
    info!("Stopped monitoring run {} ({} anomaly condition(s))", run_id, open.len());
}

async fn record_test(shared: &Shared, run_id: &str, outcome: crate::run::TestOutcome) {
    let result = update_with_retry(shared.store.as_ref(), run_id, shared.options.store_retry_attempts, |run| {
        if run.is_active() {
            run.record_test(outcome);
        }
        Ok(())
    })
    .await;
    if let Err(e) = result {
        warn!("Could not update test counters for run {}: {}", run_id, e);
    }
}

async fn handle_anomalies(shared: &Arc<Shared>, anomalies: Vec<Anomaly>, deliveries: &mut JoinSet<()>) {
    for anomaly in anomalies {
        if let Err(e) = shared.store.save_anomaly(&anomaly).await {
            warn!("Could not persist anomaly {}: {}", anomaly.key, e);
        }
        for dispatcher in &shared.dispatchers {
            let dispatcher = dispatcher.clone();
            let anomaly = anomaly.clone();
            deliveries.spawn(async move {
                if let Err(e) = dispatcher.dispatch(&anomaly).await {
                    error!(
                        "Could not dispatch {} to {}: {}",
                        anomaly.key,
                        dispatcher.channel_name(),
                        e
                    );
                }
            });
        }
    }
}
