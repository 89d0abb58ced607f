use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{LogBuffer, LogLine, LogSource};
use crate::{metrics, retry::Backoff, run::{RunContext, RunSignal}};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamerConfig {
    /// Lines held for a slow consumer before the oldest are dropped.
    pub buffer_capacity: usize,
    /// Reconnects per source before it is declared lost.
    pub reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            reconnect_attempts: 5,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

impl StreamerConfig {
    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_max_ms),
            self.reconnect_attempts + 1,
        )
    }
}

/// Multiplexes every log source of a run into one arrival-ordered sequence.
pub struct LogStreamer {
    config: StreamerConfig,
}

impl LogStreamer {
    pub fn new(config: StreamerConfig) -> Self {
        Self { config }
    }

    /// Start one pump per source. The subscription ends when the run reaches a
    /// terminal state (after draining what was buffered), when every source has
    /// finished or been lost, or when the subscription is dropped.
    pub fn subscribe(
        &self,
        run: &RunContext,
        sources: Vec<Arc<dyn LogSource>>,
        signal: RunSignal,
    ) -> LogSubscription {
        let buffer = Arc::new(LogBuffer::new(self.config.buffer_capacity));
        info!(
            "Streaming logs for run {} from {} source(s)",
            run.run_id,
            sources.len()
        );
        if sources.is_empty() {
            warn!("No log sources for run {}", run.run_id);
            buffer.close();
        }

        let live = Arc::new(AtomicUsize::new(sources.len()));
        let tasks = sources
            .into_iter()
            .map(|source| {
                let guard = LiveGuard {
                    live: live.clone(),
                    buffer: buffer.clone(),
                };
                tokio::spawn(pump(
                    source,
                    buffer.clone(),
                    signal.clone(),
                    self.config.clone(),
                    guard,
                ))
            })
            .collect();

        LogSubscription { buffer, tasks }
    }
}

pub struct LogSubscription {
    buffer: Arc<LogBuffer>,
    tasks: Vec<JoinHandle<()>>,
}

impl LogSubscription {
    pub async fn next(&mut self) -> Option<LogLine> {
        self.buffer.pop().await
    }

    /// Lines evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.buffer.dropped()
    }

    pub fn into_stream(self) -> impl Stream<Item = LogLine> + Send + 'static {
        async_stream::stream! {
            let mut subscription = self;
            while let Some(line) = subscription.next().await {
                yield line;
            }
        }
    }

    /// Wait up to `grace` for the pumps to notice cancellation, then abort them.
    pub async fn shutdown(mut self, grace: Duration) {
        let mut tasks = std::mem::take(&mut self.tasks);
        let joined = tokio::time::timeout(grace, futures::future::join_all(tasks.iter_mut())).await;
        if joined.is_err() {
            warn!("Log pumps did not stop within {:?}, aborting", grace);
            for task in &tasks {
                task.abort();
            }
        }
        self.buffer.close();
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Closes the shared buffer once the last pump exits, however it exits.
struct LiveGuard {
    live: Arc<AtomicUsize>,
    buffer: Arc<LogBuffer>,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.buffer.close();
        }
    }
}

async fn pump(
    source: Arc<dyn LogSource>,
    buffer: Arc<LogBuffer>,
    mut signal: RunSignal,
    config: StreamerConfig,
    _guard: LiveGuard,
) {
    let backoff = config.backoff();
    let mut seq: u64 = 0;
    let mut failures: u32 = 0;
    let mut last_seen: Option<DateTime<Utc>> = None;

    loop {
        if signal.is_finished() {
            return;
        }
        let mut lines = source.open(last_seen);
        let error = loop {
            let next = tokio::select! {
                _ = signal.finished() => return,
                next = lines.next() => next,
            };
            match next {
                Some(Ok(text)) => {
                    failures = 0;
                    seq += 1;
                    let now = Utc::now();
                    last_seen = Some(now);
                    metrics::LOG_LINES_STREAMED.inc();
                    if buffer.push(LogLine::new(source.id(), seq, now, text)) {
                        metrics::LOG_LINES_DROPPED.inc();
                    }
                }
                Some(Err(e)) => break e,
                None => {
                    debug!("Log source {} finished", source.id());
                    return;
                }
            }
        };

        failures += 1;
        if failures > config.reconnect_attempts {
            warn!(
                "Log source {} lost after {} reconnect attempts: {}",
                source.id(),
                config.reconnect_attempts,
                error
            );
            metrics::LOG_SOURCES_LOST.inc();
            seq += 1;
            buffer.push(LogLine::source_lost(
                source.id(),
                seq,
                Utc::now(),
                config.reconnect_attempts,
                error.to_string(),
            ));
            return;
        }

        let delay = backoff.delay_for(failures - 1);
        warn!(
            "Log source {} disconnected ({}), reconnecting in {:?} (attempt {}/{})",
            source.id(),
            error,
            delay,
            failures,
            config.reconnect_attempts
        );
        tokio::select! {
            _ = signal.finished() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
