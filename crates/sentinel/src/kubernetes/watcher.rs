use chrono::Utc;
use futures::{stream::BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{PodApi, PodChange, PodEvent, PodTracker};
use crate::{metrics, retry::Backoff, run::RunSignal};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// A pod is in a crash loop once its crashes exceed this count within the window.
    pub crash_loop_threshold: u32,
    pub crash_loop_window_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            crash_loop_threshold: 3,
            crash_loop_window_secs: 600,
            reconnect_attempts: 5,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

pub struct KubernetesWatcher {
    api: Arc<dyn PodApi>,
    config: WatcherConfig,
}

impl KubernetesWatcher {
    pub fn new(api: Arc<dyn PodApi>, config: WatcherConfig) -> Self {
        Self { api, config }
    }

    /// Pod events for `namespace`/`selector` until the run finishes.
    ///
    /// Starts from a full listing, then follows the watch. Whenever the watch
    /// breaks, the pods are listed again and diffed against the last-known
    /// state, so transitions that happened during the gap come out as
    /// synthetic events. If the watch cannot be restored a single `WatchLost`
    /// event is emitted and the stream ends.
    pub fn subscribe(&self, namespace: &str, selector: &str, signal: RunSignal) -> BoxStream<'static, PodEvent> {
        let api = self.api.clone();
        let config = self.config.clone();
        let namespace = namespace.to_string();
        let selector = selector.to_string();
        let mut signal = signal;

        let stream = async_stream::stream! {
            let backoff = Backoff::new(
                Duration::from_millis(config.reconnect_base_ms),
                Duration::from_millis(config.reconnect_max_ms),
                config.reconnect_attempts + 1,
            );
            let mut tracker = PodTracker::new(
                config.crash_loop_threshold,
                chrono::Duration::seconds(config.crash_loop_window_secs as i64),
            );
            // None forces a list-and-diff before watching.
            let mut resource_version: Option<String> = None;
            let mut synced_once = false;
            let mut failures: u32 = 0;

            'subscription: loop {
                if signal.is_finished() {
                    break;
                }

                let error = match resource_version.clone() {
                    None => {
                        let listed = tokio::select! {
                            _ = signal.finished() => break 'subscription,
                            listed = api.list(&namespace, &selector) => listed,
                        };
                        match listed {
                            Ok(listing) => {
                                if synced_once {
                                    metrics::WATCH_RESYNCS.inc();
                                    info!("Resynchronising {} pods in {} after watch gap", listing.pods.len(), namespace);
                                }
                                let events = tracker.resync(&listing.pods, Utc::now(), synced_once);
                                for event in events {
                                    metrics::POD_EVENTS_OBSERVED.inc();
                                    yield event;
                                }
                                synced_once = true;
                                resource_version = Some(listing.resource_version);
                                continue;
                            }
                            Err(e) => e,
                        }
                    }
                    Some(version) => {
                        debug!("Watching pods in {} from version {}", namespace, version);
                        let mut changes = api.watch(&namespace, &selector, &version);
                        let broke = loop {
                            let next = tokio::select! {
                                _ = signal.finished() => break 'subscription,
                                next = changes.next() => next,
                            };
                            match next {
                                Some(Ok(PodChange::Applied(snapshot))) => {
                                    failures = 0;
                                    if let Some(v) = snapshot.resource_version.clone() {
                                        resource_version = Some(v);
                                    }
                                    for event in tracker.observe(&snapshot, Utc::now(), false) {
                                        metrics::POD_EVENTS_OBSERVED.inc();
                                        yield event;
                                    }
                                }
                                Some(Ok(PodChange::Deleted(snapshot))) => {
                                    failures = 0;
                                    debug!("Pod {} deleted", snapshot.name);
                                    tracker.forget(&snapshot.name);
                                }
                                Some(Ok(PodChange::Bookmark(version))) => {
                                    resource_version = Some(version);
                                }
                                Some(Err(e)) => break Some(e),
                                // Server-side timeout; resume from the last version seen.
                                None => break None,
                            }
                        };
                        match broke {
                            Some(e) => {
                                resource_version = None;
                                e
                            }
                            None => continue,
                        }
                    }
                };

                failures += 1;
                if failures > config.reconnect_attempts {
                    warn!(
                        "Pod watch for {} lost after {} reconnect attempts: {}",
                        namespace, config.reconnect_attempts, error
                    );
                    metrics::POD_EVENTS_OBSERVED.inc();
                    yield PodEvent::watch_lost(&namespace, config.reconnect_attempts, &error.to_string(), Utc::now());
                    break;
                }
                let delay = backoff.delay_for(failures - 1);
                warn!(
                    "Pod watch for {} interrupted ({}), resyncing in {:?} (attempt {}/{})",
                    namespace, error, delay, failures, config.reconnect_attempts
                );
                tokio::select! {
                    _ = signal.finished() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!("Pod subscription for {} closed", namespace);
        };
        stream.boxed()
    }
}
