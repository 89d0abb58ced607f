use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::{ExternalStatus, ObservedRun, RunSource};
use crate::{run::TriggerSource, Error, Result};

const RUN_ID_PREFIX: &str = "local-";

/// Finds local test runs by scanning the process table for a command line
/// containing `pattern` (e.g. `pytest`).
///
/// The exit status of a process that is not our child cannot be observed, so
/// a vanished process is reported as succeeded; failures surface through the
/// run's test counters and anomalies instead.
pub struct ProcessRunSource {
    proc_root: PathBuf,
    pattern: String,
    first_seen: Mutex<HashMap<u32, DateTime<Utc>>>,
}

impl ProcessRunSource {
    pub fn new(proc_root: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            proc_root: proc_root.into(),
            pattern: pattern.into(),
            first_seen: Mutex::new(HashMap::new()),
        }
    }

    async fn cmdline(&self, pid: u32) -> Option<String> {
        let raw = tokio::fs::read(self.proc_root.join(pid.to_string()).join("cmdline"))
            .await
            .ok()?;
        let args: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        Some(args.join(" "))
    }

    async fn matching_pids(&self) -> Result<Vec<u32>> {
        let mut entries = tokio::fs::read_dir(&self.proc_root)
            .await
            .map_err(|e| Error::Config(format!("Cannot read process table at {}: {}", self.proc_root.display(), e)))?;
        let mut pids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
                continue;
            };
            if let Some(cmdline) = self.cmdline(pid).await {
                if cmdline.contains(&self.pattern) {
                    pids.push(pid);
                }
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }
}

fn pid_of(run_id: &str) -> Result<u32> {
    run_id
        .strip_prefix(RUN_ID_PREFIX)
        .and_then(|pid| pid.parse().ok())
        .ok_or_else(|| Error::Validation(format!("{} is not a local process run", run_id)))
}

fn exists(root: &Path, pid: u32) -> bool {
    root.join(pid.to_string()).exists()
}

#[async_trait]
impl RunSource for ProcessRunSource {
    fn name(&self) -> String {
        format!("process:{}", self.pattern)
    }

    async fn poll(&self) -> Result<Vec<ObservedRun>> {
        let pids = self.matching_pids().await?;
        let now = Utc::now();
        let mut first_seen = self.first_seen.lock().unwrap_or_else(|e| e.into_inner());
        first_seen.retain(|pid, _| pids.contains(pid));
        let observed: Vec<ObservedRun> = pids
            .iter()
            .map(|pid| ObservedRun {
                run_id: format!("{}{}", RUN_ID_PREFIX, pid),
                trigger: TriggerSource::Local,
                started_at: *first_seen.entry(*pid).or_insert(now),
                status: ExternalStatus::InProgress,
                labels: BTreeMap::new(),
            })
            .collect();
        debug!("Process scan found {} matching process(es)", observed.len());
        Ok(observed)
    }

    async fn status(&self, run_id: &str) -> Result<ExternalStatus> {
        let pid = pid_of(run_id)?;
        if exists(&self.proc_root, pid) {
            Ok(ExternalStatus::InProgress)
        } else {
            Ok(ExternalStatus::Succeeded)
        }
    }
}
