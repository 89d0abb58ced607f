use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{LogSource, LogSourceProvider};
use crate::{
    detector::{workflow_run_id, GithubClient, GithubConfig},
    run::{RunContext, TriggerSource},
    Error, Result,
};

#[derive(Debug, Deserialize)]
struct Jobs {
    jobs: Vec<Job>,
}

#[derive(Debug, Deserialize)]
struct Job {
    id: u64,
    name: String,
    status: Option<String>,
}

impl Job {
    fn is_completed(&self) -> bool {
        self.status.as_deref() == Some("completed")
    }
}

/// One source per job of a GitHub Actions workflow run.
pub struct GithubJobLogs {
    api: Arc<GithubClient>,
    poll_interval: Duration,
}

impl GithubJobLogs {
    pub fn new(config: GithubConfig, poll_interval: Duration) -> Result<Self> {
        Ok(Self {
            api: Arc::new(GithubClient::new(config)?),
            poll_interval,
        })
    }
}

#[async_trait]
impl LogSourceProvider for GithubJobLogs {
    async fn sources_for(&self, run: &RunContext) -> Result<Vec<Arc<dyn LogSource>>> {
        if run.trigger != TriggerSource::Ci {
            return Ok(Vec::new());
        }
        let Some(id) = workflow_run_id(&run.run_id) else {
            return Ok(Vec::new());
        };
        let jobs: Jobs = self.api.get(self.api.actions_endpoint(&format!("runs/{}/jobs", id))?).await?;
        Ok(jobs
            .jobs
            .into_iter()
            .map(|job| {
                debug!("Adding log source for job {} ({}) of run {}", job.id, job.name, run.run_id);
                Arc::new(JobLogSource {
                    id: format!("job/{}", job.name),
                    job_id: job.id,
                    api: self.api.clone(),
                    poll_interval: self.poll_interval,
                }) as Arc<dyn LogSource>
            })
            .collect())
    }
}

/// Follows one job's log by re-reading it until the job completes. Logs that
/// are not published yet are retried on the next poll.
pub struct JobLogSource {
    id: String,
    job_id: u64,
    api: Arc<GithubClient>,
    poll_interval: Duration,
}

impl LogSource for JobLogSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(&self, since: Option<DateTime<Utc>>) -> BoxStream<'static, Result<String>> {
        let api = self.api.clone();
        let job_id = self.job_id;
        let poll_interval = self.poll_interval;

        let stream = async_stream::try_stream! {
            let job_url = api.actions_endpoint(&format!("jobs/{}", job_id))?;
            let log_url = api.actions_endpoint(&format!("jobs/{}/logs", job_id))?;
            let mut emitted = 0;
            loop {
                let job: Job = api.get(job_url.clone()).await?;
                let text = match api.get_text(log_url.clone()).await {
                    Ok(text) => text,
                    Err(Error::NotFound(_)) if !job.is_completed() => String::new(),
                    Err(e) => Err(e)?,
                };
                let lines: Vec<&str> = text.lines().collect();
                for line in lines.iter().skip(emitted) {
                    let (at, content) = split_timestamp(line);
                    // A reconnect replays the log; skip what was already read.
                    if matches!((since, at), (Some(since), Some(at)) if at <= since) {
                        continue;
                    }
                    yield content.to_string();
                }
                emitted = emitted.max(lines.len());
                if job.is_completed() {
                    break;
                }
                tokio::time::sleep(poll_interval).await;
            }
        };
        stream.boxed()
    }
}

/// Job log lines start with an RFC 3339 timestamp; the rest is the line as
/// the job printed it.
fn split_timestamp(line: &str) -> (Option<DateTime<Utc>>, &str) {
    let line = line.trim_start_matches('\u{feff}');
    let Some((stamp, rest)) = line.split_once(' ') else {
        return (None, line);
    };
    match DateTime::parse_from_rfc3339(stamp) {
        Ok(at) => (Some(at.with_timezone(&Utc)), rest),
        Err(_) => (None, line),
    }
}
