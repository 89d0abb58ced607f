mod config;
mod factory;
mod memory;
mod sqlite;

pub use config::{DatabaseConfig, DatabaseType};
pub use factory::create_store;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::{
    alerts::AlertRecord,
    anomaly::{Anomaly, DedupKey},
    run::{RunContext, RunState, TriggerSource},
    Error, Result,
};

/// Durable run history with optimistic concurrency.
///
/// `save_run` is compare-and-set on `RunContext::version`: the caller passes the
/// version it loaded (0 for a new run) and gets back the stored context with the
/// bumped version. A stale version fails with `Error::Conflict`; moving a stored
/// run backwards or out of a terminal state fails with `Error::StateViolation`.
#[async_trait]
pub trait RunStore: Send + Sync {
    // Initialize database schema
    async fn init(&self) -> Result<()>;

    async fn save_run(&self, run: &RunContext) -> Result<RunContext>;
    async fn load_run(&self, run_id: &str) -> Result<Option<RunContext>>;
    async fn list_runs(&self, filter: &RunFilter, page: Page) -> Result<Vec<RunContext>>;

    // Anomalies upsert by dedup key
    async fn save_anomaly(&self, anomaly: &Anomaly) -> Result<()>;
    async fn list_anomalies(&self, run_id: &str) -> Result<Vec<Anomaly>>;

    // Alert records are kept per dedup key and channel
    async fn save_alert_record(&self, record: &AlertRecord) -> Result<()>;
    async fn get_alert_record(&self, key: &DedupKey, channel: &str) -> Result<Option<AlertRecord>>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilter {
    pub state: Option<RunState>,
    pub trigger: Option<TriggerSource>,
    /// Only runs that have not reached a terminal state.
    #[serde(default)]
    pub active_only: bool,
    pub started_after: Option<DateTime<Utc>>,
}

impl RunFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, run: &RunContext) -> bool {
        self.state.map_or(true, |s| run.state == s)
            && self.trigger.map_or(true, |t| run.trigger == t)
            && (!self.active_only || run.is_active())
            && self.started_after.map_or(true, |t| run.started_at > t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Page {
    pub fn first(limit: i64) -> Self {
        Self { offset: 0, limit }
    }

    pub fn next(self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// Check an incoming write against what is stored. Shared by every backend.
pub(crate) fn check_write(stored: Option<&RunContext>, incoming: &RunContext) -> Result<()> {
    if incoming.state.is_terminal() != incoming.ended_at.is_some() {
        return Err(Error::Validation(format!(
            "run {}: end timestamp must be set exactly when the state is terminal",
            incoming.run_id
        )));
    }
    let actual = stored.map(|s| s.version).unwrap_or(0);
    if actual != incoming.version {
        return Err(Error::Conflict {
            run_id: incoming.run_id.clone(),
            expected: incoming.version,
            actual,
        });
    }
    if let Some(stored) = stored {
        if !stored.state.allows(incoming.state) {
            return Err(Error::StateViolation {
                run_id: incoming.run_id.clone(),
                from: stored.state,
                to: incoming.state,
            });
        }
    }
    Ok(())
}

/// Load, apply, save; on `Conflict` reload and reapply, up to `max_attempts` times.
pub async fn update_with_retry<F>(
    store: &dyn RunStore,
    run_id: &str,
    max_attempts: u32,
    mut apply: F,
) -> Result<RunContext>
where
    F: FnMut(&mut RunContext) -> Result<()> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut run = store
            .load_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))?;
        apply(&mut run)?;
        match store.save_run(&run).await {
            Err(Error::Conflict { expected, actual, .. }) if attempt < max_attempts => {
                debug!(
                    "Conflict saving run {} (had v{}, store at v{}), retrying",
                    run_id, expected, actual
                );
            }
            result => return result,
        }
    }
}

/// Lazily page through run history matching `filter`.
pub fn history_stream(
    store: Arc<dyn RunStore>,
    filter: RunFilter,
    page_size: i64,
) -> BoxStream<'static, Result<RunContext>> {
    let stream = async_stream::try_stream! {
        let mut page = Page::first(page_size.max(1));
        loop {
            let runs = store.list_runs(&filter, page).await?;
            let fetched = runs.len() as i64;
            for run in runs {
                yield run;
            }
            if fetched < page.limit {
                break;
            }
            page = page.next();
        }
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn run(id: &str) -> RunContext {
        RunContext::new(id, TriggerSource::Ci, Utc::now())
    }

    #[test]
    fn stale_version_conflicts() {
        let mut stored = run("r1");
        stored.version = 3;
        let mut incoming = stored.clone();
        incoming.version = 2;
        assert!(matches!(
            check_write(Some(&stored), &incoming),
            Err(Error::Conflict { expected: 2, actual: 3, .. })
        ));
    }

    #[test]
    fn backward_state_is_a_violation() {
        let mut stored = run("r1");
        stored.version = 1;
        stored.finish(RunState::Completed, None, Utc::now()).unwrap();
        let mut incoming = run("r1");
        incoming.version = 1;
        incoming.state = RunState::Running;
        assert!(matches!(
            check_write(Some(&stored), &incoming),
            Err(Error::StateViolation { .. })
        ));
    }

    #[test]
    fn end_timestamp_must_match_terminal_state() {
        let mut incoming = run("r1");
        incoming.ended_at = Some(Utc::now());
        assert!(matches!(check_write(None, &incoming), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn update_with_retry_reapplies_after_conflict() {
        let store = MemoryStore::new();
        let saved = store.save_run(&run("r1")).await.unwrap();

        // A concurrent writer bumps the version between our load and save.
        let mut interleaved = false;
        let updated = update_with_retry(&store, "r1", 3, |run| {
            if !interleaved {
                interleaved = true;
                let mut other = saved.clone();
                other.tests_failed = 7;
                futures::executor::block_on(store.save_run(&other)).unwrap();
            }
            run.tests_passed += 1;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(updated.tests_passed, 1);
        assert_eq!(updated.tests_failed, 7);
        assert_eq!(updated.version, 3);
    }

    #[tokio::test]
    async fn history_stream_pages_lazily() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            store.save_run(&run(&format!("r{}", i))).await.unwrap();
        }
        let runs: Vec<RunContext> = history_stream(store, RunFilter::default(), 2)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(runs.len(), 5);
    }
}
