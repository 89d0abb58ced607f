use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, LogParams},
    Client, ResourceExt,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncSeekExt, BufReader};
use tracing::debug;

use crate::{run::RunContext, Result};

/// One live log source (a container's log, a CI job log, a local file).
///
/// `open` returns a raw line stream. An `Err` item means the connection dropped
/// and the streamer may reconnect; a clean end means the source has finished.
pub trait LogSource: Send + Sync {
    fn id(&self) -> &str;
    fn open(&self, since: Option<DateTime<Utc>>) -> BoxStream<'static, Result<String>>;
}

/// Resolves which sources belong to a run.
#[async_trait]
pub trait LogSourceProvider: Send + Sync {
    async fn sources_for(&self, run: &RunContext) -> Result<Vec<Arc<dyn LogSource>>>;
}

/// Follows one container's log through the Kubernetes API.
pub struct PodLogSource {
    id: String,
    api: Api<Pod>,
    pod: String,
    container: Option<String>,
}

impl PodLogSource {
    pub fn new(api: Api<Pod>, pod: impl Into<String>, container: Option<String>) -> Self {
        let pod = pod.into();
        let id = match &container {
            Some(c) => format!("{}/{}", pod, c),
            None => pod.clone(),
        };
        Self { id, api, pod, container }
    }
}

impl LogSource for PodLogSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(&self, since: Option<DateTime<Utc>>) -> BoxStream<'static, Result<String>> {
        let api = self.api.clone();
        let pod = self.pod.clone();
        let params = LogParams {
            container: self.container.clone(),
            follow: true,
            since_seconds: since.map(|t| (Utc::now() - t).num_seconds().max(1)),
            ..LogParams::default()
        };

        let stream = async_stream::try_stream! {
            let reader = api.log_stream(&pod, &params).await?;
            let lines = reader.lines();
            futures::pin_mut!(lines);
            while let Some(line) = lines.try_next().await? {
                yield line;
            }
        };
        stream.boxed()
    }
}

/// Tails a local file (e.g. a pytest log for a local run), like `tail -f`.
pub struct FileLogSource {
    id: String,
    path: PathBuf,
    poll_interval: Duration,
}

impl FileLogSource {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        let path = path.into();
        Self {
            id: format!("file:{}", path.display()),
            path,
            poll_interval,
        }
    }
}

impl LogSource for FileLogSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(&self, since: Option<DateTime<Utc>>) -> BoxStream<'static, Result<String>> {
        let path = self.path.clone();
        let poll_interval = self.poll_interval;
        // A reconnect resumes at the end of the file instead of replaying it.
        let resume_at_end = since.is_some();

        let stream = async_stream::try_stream! {
            let mut file = tokio::fs::File::open(&path).await?;
            if resume_at_end {
                file.seek(std::io::SeekFrom::End(0)).await?;
            }
            let mut reader = BufReader::new(file);
            let mut buf = String::new();
            loop {
                buf.clear();
                let read = reader.read_line(&mut buf).await?;
                if read == 0 {
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
                yield buf.trim_end_matches(['\r', '\n']).to_string();
            }
        };
        stream.boxed()
    }
}

/// One source per container of every pod matching the run's namespace and labels.
pub struct KubeLogSources {
    client: Client,
}

impl KubeLogSources {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogSourceProvider for KubeLogSources {
    async fn sources_for(&self, run: &RunContext) -> Result<Vec<Arc<dyn LogSource>>> {
        let Some(namespace) = run.namespace.as_deref() else {
            return Ok(Vec::new());
        };
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = run.label_selector();
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector);
        }
        let pods = api.list(&params).await?;

        let mut sources: Vec<Arc<dyn LogSource>> = Vec::new();
        for pod in pods.items {
            let name = pod.name_any();
            let containers = pod
                .spec
                .as_ref()
                .map(|s| s.containers.iter().map(|c| c.name.clone()).collect::<Vec<_>>())
                .unwrap_or_default();
            for container in containers {
                debug!("Adding log source {}/{} for run {}", name, container, run.run_id);
                sources.push(Arc::new(PodLogSource::new(api.clone(), name.clone(), Some(container))));
            }
        }
        Ok(sources)
    }
}

/// Fixed set of sources, used for local runs and in tests.
#[derive(Clone, Default)]
pub struct StaticLogSources {
    sources: Vec<Arc<dyn LogSource>>,
}

impl StaticLogSources {
    pub fn new(sources: Vec<Arc<dyn LogSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl LogSourceProvider for StaticLogSources {
    async fn sources_for(&self, _run: &RunContext) -> Result<Vec<Arc<dyn LogSource>>> {
        Ok(self.sources.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn file_source_follows_appended_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "first").unwrap();
        file.flush().unwrap();

        let source = FileLogSource::new(file.path(), Duration::from_millis(10));
        let mut stream = source.open(None);
        assert_eq!(stream.next().await.unwrap().unwrap(), "first");

        writeln!(file, "ERROR [focus.db] second").unwrap();
        file.flush().unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(next, "ERROR [focus.db] second");
    }

    #[tokio::test]
    async fn missing_file_surfaces_as_error_item() {
        let source = FileLogSource::new("/nonexistent/focus/pytest.log", Duration::from_millis(10));
        let mut stream = source.open(None);
        assert!(stream.next().await.unwrap().is_err());
    }
}
