use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, error, info};

use super::{check_write, Page, RunFilter, RunStore};
use crate::{
    alerts::AlertRecord,
    anomaly::{Anomaly, DedupKey, Evidence},
    run::RunContext,
    Error, Result,
};

const RUN_COLUMNS: &str = "run_id, trigger_source, state, started_at, ended_at, namespace, labels, \
                           tests_passed, tests_failed, reason, version";

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Connecting to SQLite database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| {
                error!("Invalid SQLite location {}: {}", database_url, e);
                Error::Sqlx(e)
            })?
            .create_if_missing(true);

        // An in-memory database lives only as long as its one connection.
        let in_memory = database_url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            if let Some(parent) = std::path::Path::new(database_url).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await.map_err(|e| {
            error!("Failed to connect to SQLite: {}", e);
            Error::Sqlx(e)
        })?;

        Ok(Self { pool })
    }

    async fn current_version(&self, run_id: &str) -> Result<i64> {
        let version = sqlx::query("SELECT version FROM runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.try_get::<i64, _>("version"))
            .transpose()?;
        Ok(version.unwrap_or(0))
    }
}

fn run_from_row(row: &SqliteRow) -> Result<RunContext> {
    let labels: BTreeMap<String, String> = serde_json::from_str(row.try_get("labels")?)?;
    Ok(RunContext {
        run_id: row.try_get("run_id")?,
        trigger: row.try_get::<String, _>("trigger_source")?.parse()?,
        state: row.try_get::<String, _>("state")?.parse()?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        namespace: row.try_get("namespace")?,
        labels,
        tests_passed: row.try_get::<i64, _>("tests_passed")? as u32,
        tests_failed: row.try_get::<i64, _>("tests_failed")? as u32,
        reason: row.try_get("reason")?,
        version: row.try_get("version")?,
    })
}

fn anomaly_from_row(row: &SqliteRow) -> Result<Anomaly> {
    let evidence: Vec<Evidence> = serde_json::from_str(row.try_get("evidence")?)?;
    Ok(Anomaly {
        key: DedupKey::new(
            row.try_get::<String, _>("run_id")?,
            row.try_get::<String, _>("kind")?.parse()?,
            row.try_get::<String, _>("target")?,
        ),
        severity: row.try_get::<String, _>("severity")?.parse()?,
        message: row.try_get("message")?,
        evidence,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        repeat_count: row.try_get::<i64, _>("repeat_count")? as u32,
        subsystem: row.try_get("subsystem")?,
    })
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                Error::Migrate(e)
            })?;

        Ok(())
    }

    async fn save_run(&self, run: &RunContext) -> Result<RunContext> {
        debug!("Saving run {} (expecting v{})", run.run_id, run.version);

        let stored = self.load_run(&run.run_id).await?;
        check_write(stored.as_ref(), run)?;

        let labels_json = serde_json::to_string(&run.labels)?;
        let now = Utc::now();
        let affected = if run.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO runs (
                    run_id, trigger_source, state, started_at, ended_at, namespace, labels,
                    tests_passed, tests_failed, reason, version, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11)
                ON CONFLICT(run_id) DO NOTHING
                "#,
            )
            .bind(&run.run_id)
            .bind(run.trigger.to_string())
            .bind(run.state.as_str())
            .bind(run.started_at)
            .bind(run.ended_at)
            .bind(&run.namespace)
            .bind(labels_json)
            .bind(run.tests_passed as i64)
            .bind(run.tests_failed as i64)
            .bind(&run.reason)
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            // The version predicate makes the write a compare-and-set even if
            // another writer slipped in after the check above.
            sqlx::query(
                r#"
                UPDATE runs SET
                    state = ?1, ended_at = ?2, namespace = ?3, labels = ?4,
                    tests_passed = ?5, tests_failed = ?6, reason = ?7,
                    version = version + 1, updated_at = ?8
                WHERE run_id = ?9 AND version = ?10
                "#,
            )
            .bind(run.state.as_str())
            .bind(run.ended_at)
            .bind(&run.namespace)
            .bind(labels_json)
            .bind(run.tests_passed as i64)
            .bind(run.tests_failed as i64)
            .bind(&run.reason)
            .bind(now)
            .bind(&run.run_id)
            .bind(run.version)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if affected == 0 {
            let actual = self.current_version(&run.run_id).await?;
            return Err(Error::Conflict {
                run_id: run.run_id.clone(),
                expected: run.version,
                actual,
            });
        }

        let mut saved = run.clone();
        saved.version += 1;
        Ok(saved)
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<RunContext>> {
        debug!("Loading run {}", run_id);

        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, filter: &RunFilter, page: Page) -> Result<Vec<RunContext>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM runs WHERE 1 = 1", RUN_COLUMNS));
        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(trigger) = filter.trigger {
            query.push(" AND trigger_source = ").push_bind(trigger.to_string());
        }
        if filter.active_only {
            query.push(" AND state IN ('pending', 'running')");
        }
        if let Some(after) = filter.started_after {
            query.push(" AND started_at > ").push_bind(after);
        }
        query
            .push(" ORDER BY started_at DESC, run_id ASC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset);

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn save_anomaly(&self, anomaly: &Anomaly) -> Result<()> {
        debug!("Saving anomaly {}", anomaly.key);

        let evidence_json = serde_json::to_string(&anomaly.evidence)?;
        sqlx::query(
            r#"
            INSERT INTO anomalies (
                run_id, kind, target, fingerprint, severity, message, evidence,
                subsystem, first_seen, last_seen, repeat_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(run_id, kind, target) DO UPDATE SET
                severity = excluded.severity,
                message = excluded.message,
                evidence = excluded.evidence,
                subsystem = COALESCE(excluded.subsystem, anomalies.subsystem),
                last_seen = excluded.last_seen,
                repeat_count = excluded.repeat_count
            "#,
        )
        .bind(&anomaly.key.run_id)
        .bind(anomaly.key.kind.as_str())
        .bind(&anomaly.key.target)
        .bind(anomaly.key.fingerprint())
        .bind(anomaly.severity.to_string())
        .bind(&anomaly.message)
        .bind(evidence_json)
        .bind(&anomaly.subsystem)
        .bind(anomaly.first_seen)
        .bind(anomaly.last_seen)
        .bind(anomaly.repeat_count as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_anomalies(&self, run_id: &str) -> Result<Vec<Anomaly>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, kind, target, severity, message, evidence, subsystem,
                   first_seen, last_seen, repeat_count
            FROM anomalies
            WHERE run_id = ?1
            ORDER BY first_seen ASC, kind ASC, target ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(anomaly_from_row).collect()
    }

    async fn save_alert_record(&self, record: &AlertRecord) -> Result<()> {
        debug!("Saving alert record {} ({})", record.key, record.status);

        sqlx::query(
            r#"
            INSERT INTO alert_records (
                run_id, kind, target, severity, channel, status, attempts,
                dispatched_at, error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(run_id, kind, target, channel) DO UPDATE SET
                severity = excluded.severity,
                status = excluded.status,
                attempts = excluded.attempts,
                dispatched_at = excluded.dispatched_at,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.key.run_id)
        .bind(record.key.kind.as_str())
        .bind(&record.key.target)
        .bind(record.severity.to_string())
        .bind(&record.channel)
        .bind(record.status.to_string())
        .bind(record.attempts as i64)
        .bind(record.dispatched_at)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_alert_record(&self, key: &DedupKey, channel: &str) -> Result<Option<AlertRecord>> {
        let row = sqlx::query(
            r#"
            SELECT severity, channel, status, attempts, dispatched_at, error, created_at, updated_at
            FROM alert_records
            WHERE run_id = ?1 AND kind = ?2 AND target = ?3 AND channel = ?4
            "#,
        )
        .bind(&key.run_id)
        .bind(key.kind.as_str())
        .bind(&key.target)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(AlertRecord {
                key: key.clone(),
                severity: r.try_get::<String, _>("severity")?.parse()?,
                channel: r.try_get("channel")?,
                status: r.try_get::<String, _>("status")?.parse()?,
                attempts: r.try_get::<i64, _>("attempts")? as u32,
                dispatched_at: r.try_get::<Option<DateTime<Utc>>, _>("dispatched_at")?,
                error: r.try_get("error")?,
                created_at: r.try_get("created_at")?,
                updated_at: r.try_get("updated_at")?,
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{AnomalyKind, Severity};
    use crate::run::{RunState, TriggerSource};

    async fn store() -> SqliteStore {
        let store = SqliteStore::new(":memory:").await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn run_round_trips_with_labels() {
        let store = store().await;
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "focus".to_string());
        let run = RunContext::new("gha-1001", TriggerSource::Ci, Utc::now())
            .with_namespace("focus-ci")
            .with_labels(labels);

        let saved = store.save_run(&run).await.unwrap();
        assert_eq!(saved.version, 1);
        let loaded = store.load_run("gha-1001").await.unwrap().unwrap();
        assert_eq!(loaded.labels.get("app").map(String::as_str), Some("focus"));
        assert_eq!(loaded.namespace.as_deref(), Some("focus-ci"));
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn insert_twice_conflicts() {
        let store = store().await;
        let run = RunContext::new("gha-1", TriggerSource::Ci, Utc::now());
        store.save_run(&run).await.unwrap();
        assert!(matches!(
            store.save_run(&run).await,
            Err(Error::Conflict { expected: 0, actual: 1, .. })
        ));
    }

    #[tokio::test]
    async fn terminal_run_rejects_regression() {
        let store = store().await;
        let mut run = store
            .save_run(&RunContext::new("gha-2", TriggerSource::Ci, Utc::now()))
            .await
            .unwrap();
        run.finish(RunState::Failed, Some("exit 1".into()), Utc::now()).unwrap();
        let finished = store.save_run(&run).await.unwrap();

        let mut regressed = finished.clone();
        regressed.state = RunState::Running;
        regressed.ended_at = None;
        assert!(matches!(
            store.save_run(&regressed).await,
            Err(Error::StateViolation { from: RunState::Failed, to: RunState::Running, .. })
        ));
    }

    #[tokio::test]
    async fn anomaly_upsert_keeps_one_row_per_key() {
        let store = store().await;
        let now = Utc::now();
        let key = DedupKey::new("gha-3", AnomalyKind::LogErrorBurst, "pod/api");
        let mut anomaly = Anomaly::new(key, Severity::Warning, "burst", vec![], now);
        store.save_anomaly(&anomaly).await.unwrap();
        anomaly.absorb(Severity::Critical, "bigger burst".into(), vec![], now);
        store.save_anomaly(&anomaly).await.unwrap();

        let stored = store.list_anomalies("gha-3").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].repeat_count, 2);
        assert_eq!(stored[0].severity, Severity::Critical);
    }
}
