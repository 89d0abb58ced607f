use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{check_write, Page, RunFilter, RunStore};
use crate::{
    alerts::AlertRecord,
    anomaly::{Anomaly, DedupKey},
    run::RunContext,
    Result,
};

/// Process-local store with the same CAS contract as the database backends.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<String, RunContext>>,
    anomalies: RwLock<HashMap<DedupKey, Anomaly>>,
    alert_records: RwLock<HashMap<(DedupKey, String), AlertRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn save_run(&self, run: &RunContext) -> Result<RunContext> {
        let mut runs = self.runs.write().await;
        check_write(runs.get(&run.run_id), run)?;
        let mut saved = run.clone();
        saved.version += 1;
        debug!("Saved run {} at v{}", saved.run_id, saved.version);
        runs.insert(saved.run_id.clone(), saved.clone());
        Ok(saved)
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<RunContext>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter, page: Page) -> Result<Vec<RunContext>> {
        let runs = self.runs.read().await;
        let mut matching: Vec<&RunContext> = runs.values().filter(|r| filter.matches(r)).collect();
        matching.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(matching
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn save_anomaly(&self, anomaly: &Anomaly) -> Result<()> {
        self.anomalies
            .write()
            .await
            .insert(anomaly.key.clone(), anomaly.clone());
        Ok(())
    }

    async fn list_anomalies(&self, run_id: &str) -> Result<Vec<Anomaly>> {
        let anomalies = self.anomalies.read().await;
        let mut found: Vec<Anomaly> = anomalies
            .values()
            .filter(|a| a.run_id() == run_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then_with(|| a.key.cmp(&b.key)));
        Ok(found)
    }

    async fn save_alert_record(&self, record: &AlertRecord) -> Result<()> {
        self.alert_records
            .write()
            .await
            .insert((record.key.clone(), record.channel.clone()), record.clone());
        Ok(())
    }

    async fn get_alert_record(&self, key: &DedupKey, channel: &str) -> Result<Option<AlertRecord>> {
        Ok(self
            .alert_records
            .read()
            .await
            .get(&(key.clone(), channel.to_string()))
            .cloned())
    }
}
