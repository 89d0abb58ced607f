use chrono::{Duration, Utc};
use futures::TryStreamExt;
use std::path::PathBuf;
use std::sync::Arc;

use focus_sentinel::{
    alerts::{AlertRecord, DeliveryStatus},
    anomaly::{Anomaly, AnomalyKind, DedupKey, Severity},
    run::{RunContext, RunState, TriggerSource},
    store::{create_store, history_stream, DatabaseConfig, DatabaseType, RunFilter, RunStore},
    Error,
};

async fn sqlite_store() -> Arc<dyn RunStore> {
    let config = DatabaseConfig {
        db_type: DatabaseType::Sqlite,
        sqlite_path: Some(PathBuf::from(":memory:")),
    };
    let store = create_store(&config).await.expect("Failed to create store");
    store.init().await.expect("Failed to initialize store");
    store
}

#[tokio::test]
async fn concurrent_stale_writers_see_exactly_one_conflict() {
    let store = sqlite_store().await;
    let saved = store
        .save_run(&RunContext::new("gha-5150", TriggerSource::Ci, Utc::now()))
        .await
        .unwrap();

    // Both writers loaded version 1.
    let mut first = saved.clone();
    first.transition(RunState::Running, Utc::now()).unwrap();
    let mut second = saved.clone();
    second.tests_failed = 4;

    let (a, b) = tokio::join!(store.save_run(&first), store.save_run(&second));
    let outcomes = [a, b];
    let ok = outcomes.iter().filter(|r| r.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|r| matches!(r, Err(Error::Conflict { expected: 1, actual: 2, .. })))
        .count();
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 1);

    let stored = store.load_run("gha-5150").await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn history_pages_through_every_matching_run() {
    let store = sqlite_store().await;
    let start = Utc::now() - Duration::hours(1);
    for i in 0..7 {
        let mut run = RunContext::new(format!("gha-{}", i), TriggerSource::Ci, start + Duration::minutes(i));
        if i % 2 == 0 {
            run.finish(RunState::Completed, None, start + Duration::minutes(i + 1)).unwrap();
        }
        store.save_run(&run).await.unwrap();
    }

    let all: Vec<RunContext> = history_stream(store.clone(), RunFilter::default(), 3)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(all.len(), 7);
    // Newest first.
    assert_eq!(all[0].run_id, "gha-6");

    let active: Vec<RunContext> = history_stream(store, RunFilter::active(), 2)
        .try_collect()
        .await
        .unwrap();
    let ids: Vec<&str> = active.iter().map(|r| r.run_id.as_str()).collect();
    assert_eq!(ids, vec!["gha-5", "gha-3", "gha-1"]);
}

#[tokio::test]
async fn alert_records_are_kept_per_channel() {
    let store = sqlite_store().await;
    let now = Utc::now();
    let anomaly = Anomaly::new(
        DedupKey::new("gha-77", AnomalyKind::ResourceExhaustion, "focus-db-0"),
        Severity::Critical,
        "pod focus-db-0 was OOM killed",
        Vec::new(),
        now,
    );

    let mut slack = AlertRecord::pending(&anomaly, "slack", now);
    slack.status = DeliveryStatus::Sent;
    slack.attempts = 1;
    slack.dispatched_at = Some(now);
    store.save_alert_record(&slack).await.unwrap();

    let mut jira = AlertRecord::pending(&anomaly, "jira", now);
    jira.status = DeliveryStatus::Failed;
    jira.attempts = 5;
    jira.error = Some("401 Unauthorized".into());
    store.save_alert_record(&jira).await.unwrap();

    let stored = store.get_alert_record(&anomaly.key, "slack").await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Sent);
    assert_eq!(stored.severity, Severity::Critical);

    let stored = store.get_alert_record(&anomaly.key, "jira").await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Failed);
    assert_eq!(stored.attempts, 5);
    assert_eq!(stored.error.as_deref(), Some("401 Unauthorized"));

    assert!(store.get_alert_record(&anomaly.key, "stdout").await.unwrap().is_none());
}
