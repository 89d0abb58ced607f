use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use super::{AlertChannel, AlertMessage, AlertRecord, DeliveryStatus};
use crate::{
    anomaly::{Anomaly, DedupKey},
    metrics,
    retry::Backoff,
    store::RunStore,
    template::AlertTemplates,
    Result,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Delivery attempts per dispatch, including the first.
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
        }
    }
}

/// Delivers anomalies to one channel, at most once per dedup key unless the
/// anomaly escalates.
///
/// The delivery outcome is persisted as an [`AlertRecord`] before and after
/// each attempt, so a restarted sentinel does not page twice for a condition
/// it already reported.
pub struct AlertDispatcher {
    store: Arc<dyn RunStore>,
    channel: Arc<dyn AlertChannel>,
    channel_name: String,
    templates: Arc<AlertTemplates>,
    backoff: Backoff,
    in_flight: std::sync::Mutex<HashMap<DedupKey, Arc<Mutex<()>>>>,
}

impl AlertDispatcher {
    pub fn new(
        store: Arc<dyn RunStore>,
        channel: Arc<dyn AlertChannel>,
        templates: Arc<AlertTemplates>,
        config: &DispatcherConfig,
    ) -> Self {
        let channel_name = channel.name();
        Self {
            store,
            channel,
            channel_name,
            templates,
            backoff: Backoff::new(
                Duration::from_millis(config.retry_base_ms),
                Duration::from_millis(config.retry_max_ms),
                config.retry_attempts,
            ),
            in_flight: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    async fn lock_key(&self, key: &DedupKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop per-key locks and channel state held for a finished run.
    pub fn forget_run(&self, run_id: &str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.retain(|key, _| key.run_id != run_id);
        drop(in_flight);
        self.channel.forget_run(run_id);
    }

    /// Deliver `anomaly` unless it was already reported at this severity or
    /// higher. Returns the record describing the final delivery state.
    ///
    /// Delivery failures are not errors of `dispatch`: they end in a FAILED
    /// record. Errors are returned only when the record itself cannot be
    /// read, rendered or stored.
    pub async fn dispatch(&self, anomaly: &Anomaly) -> Result<AlertRecord> {
        let _guard = self.lock_key(&anomaly.key).await;

        let existing = self
            .store
            .get_alert_record(&anomaly.key, &self.channel_name)
            .await?;
        let mut record = match existing {
            Some(record) if record.status != DeliveryStatus::Pending && anomaly.severity <= record.severity => {
                debug!(
                    "Suppressing alert {} on {} (already {} at {})",
                    anomaly.key, self.channel_name, record.status, record.severity
                );
                metrics::ALERTS_SUPPRESSED.inc();
                return Ok(record);
            }
            Some(mut record) => {
                if anomaly.severity > record.severity {
                    info!(
                        "Alert {} escalated from {} to {}, redelivering",
                        anomaly.key, record.severity, anomaly.severity
                    );
                }
                record.severity = anomaly.severity;
                record.status = DeliveryStatus::Pending;
                record.error = None;
                record.updated_at = Utc::now();
                record
            }
            None => AlertRecord::pending(anomaly, self.channel_name.clone(), Utc::now()),
        };
        self.store.save_alert_record(&record).await?;

        let (title, body) = self.templates.render(anomaly)?;
        let message = AlertMessage {
            fingerprint: anomaly.key.fingerprint(),
            severity: anomaly.severity,
            title,
            body,
            anomaly: anomaly.clone(),
        };

        let attempts = AtomicU32::new(0);
        let outcome = self
            .backoff
            .retry("alert delivery", || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.channel.deliver(&message)
            })
            .await;

        let now = Utc::now();
        record.attempts += attempts.load(Ordering::Relaxed);
        record.updated_at = now;
        match outcome {
            Ok(()) => {
                record.status = DeliveryStatus::Sent;
                record.dispatched_at = Some(now);
                metrics::ALERTS_SENT.inc();
                info!(
                    "Alert {} delivered to {} ({})",
                    anomaly.key, self.channel_name, anomaly.severity
                );
            }
            Err(e) => {
                record.status = DeliveryStatus::Failed;
                record.error = Some(e.to_string());
                metrics::ALERTS_FAILED.inc();
                // Nobody else will hear about this anomaly, so the log line is the alert.
                error!(
                    fingerprint = %message.fingerprint,
                    severity = %anomaly.severity,
                    "ALERT DELIVERY FAILED on {} after {} attempt(s) for {}: {} ({})",
                    self.channel_name, record.attempts, anomaly.key, message.title, e
                );
            }
        }
        self.store.save_alert_record(&record).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::MockAlertChannel;
    use crate::anomaly::{AnomalyKind, Severity};
    use crate::store::MemoryStore;
    use crate::Error;

    fn anomaly(severity: Severity) -> Anomaly {
        Anomaly::new(
            DedupKey::new("gha-21", AnomalyKind::LogErrorBurst, "pod/api-0"),
            severity,
            "12 error lines within 60s",
            vec![],
            Utc::now(),
        )
    }

    fn dispatcher(channel: MockAlertChannel, store: Arc<MemoryStore>) -> AlertDispatcher {
        let config = DispatcherConfig {
            retry_attempts: 3,
            retry_base_ms: 100,
            retry_max_ms: 1_000,
        };
        AlertDispatcher::new(
            store,
            Arc::new(channel),
            Arc::new(AlertTemplates::new(None).unwrap()),
            &config,
        )
    }

    fn channel() -> MockAlertChannel {
        let mut channel = MockAlertChannel::new();
        channel.expect_name().return_const("slack".to_string());
        channel
    }

    #[tokio::test]
    async fn repeated_dispatch_delivers_once() {
        let mut channel = channel();
        channel.expect_deliver().times(1).returning(|_| Ok(()));
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(channel, store.clone());

        let first = dispatcher.dispatch(&anomaly(Severity::Warning)).await.unwrap();
        let second = dispatcher.dispatch(&anomaly(Severity::Warning)).await.unwrap();

        assert_eq!(first.status, DeliveryStatus::Sent);
        assert_eq!(second, first);
        let stored = store
            .get_alert_record(&first.key, "slack")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn escalation_is_redelivered() {
        let mut channel = channel();
        channel
            .expect_deliver()
            .withf(|message| message.severity == Severity::Warning)
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_deliver()
            .withf(|message| message.severity == Severity::Critical && message.title.starts_with("[CRITICAL]"))
            .times(1)
            .returning(|_| Ok(()));
        let dispatcher = dispatcher(channel, Arc::new(MemoryStore::new()));

        dispatcher.dispatch(&anomaly(Severity::Warning)).await.unwrap();
        let record = dispatcher.dispatch(&anomaly(Severity::Critical)).await.unwrap();
        assert_eq!(record.severity, Severity::Critical);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let mut channel = channel();
        let mut calls = 0;
        channel.expect_deliver().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(Error::ChannelUnavailable("503".into()))
            } else {
                Ok(())
            }
        });
        let dispatcher = dispatcher(channel, Arc::new(MemoryStore::new()));

        let record = dispatcher.dispatch(&anomaly(Severity::Critical)).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_record_failure_and_suppress_repeats() {
        let mut channel = channel();
        channel
            .expect_deliver()
            .times(3)
            .returning(|_| Err(Error::ChannelUnavailable("connection refused".into())));
        let dispatcher = dispatcher(channel, Arc::new(MemoryStore::new()));

        let record = dispatcher.dispatch(&anomaly(Severity::Critical)).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert!(record.error.as_deref().unwrap().contains("connection refused"));

        // Same severity again: recorded as failed, not retried.
        let again = dispatcher.dispatch(&anomaly(Severity::Critical)).await.unwrap();
        assert_eq!(again.status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn rejected_payload_is_not_retried() {
        let mut channel = channel();
        channel
            .expect_deliver()
            .times(1)
            .returning(|_| Err(Error::Validation("invalid_payload".into())));
        let dispatcher = dispatcher(channel, Arc::new(MemoryStore::new()));

        let record = dispatcher.dispatch(&anomaly(Severity::Warning)).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn concurrent_dispatches_of_one_key_deliver_once() {
        let mut channel = channel();
        channel.expect_deliver().times(1).returning(|_| Ok(()));
        let dispatcher = Arc::new(dispatcher(channel, Arc::new(MemoryStore::new())));

        let a = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(&anomaly(Severity::Warning)).await })
        };
        let b = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(&anomaly(Severity::Warning)).await })
        };
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a.status, DeliveryStatus::Sent);
        assert_eq!(b.status, DeliveryStatus::Sent);
    }
}
