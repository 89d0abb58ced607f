use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ContainerState, Pod};
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    Client, ResourceExt,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Coarse pod state the tracker reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Unknown,
    Scheduled,
    Running,
    Completed,
    Crashed,
    Evicted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    /// Sum of container restart counts.
    pub restart_count: u32,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub resource_version: Option<String>,
}

impl PodSnapshot {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, phase: PodPhase) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            phase,
            restart_count: 0,
            reason: None,
            message: None,
            resource_version: None,
        }
    }

    pub fn from_pod(pod: &Pod) -> Self {
        let mut snapshot = PodSnapshot::new(
            pod.name_any(),
            pod.namespace().unwrap_or_default(),
            PodPhase::Unknown,
        );
        snapshot.resource_version = pod.resource_version();

        let Some(status) = pod.status.as_ref() else {
            return snapshot;
        };
        let containers = status.container_statuses.as_deref().unwrap_or_default();
        snapshot.restart_count = containers
            .iter()
            .map(|c| c.restart_count.max(0) as u32)
            .sum();

        // A waiting or failed container outranks the pod phase.
        let failing = containers.iter().find_map(|c| failure_of(c.state.as_ref()));
        let last_failure = containers
            .iter()
            .find_map(|c| failure_of(c.last_state.as_ref()));

        let phase = status.phase.as_deref().unwrap_or("Unknown");
        snapshot.phase = if status.reason.as_deref() == Some("Evicted") {
            snapshot.reason = status.reason.clone();
            snapshot.message = status.message.clone();
            PodPhase::Evicted
        } else if let Some((reason, message)) = failing {
            snapshot.reason = reason;
            snapshot.message = message;
            PodPhase::Crashed
        } else {
            match phase {
                "Succeeded" => PodPhase::Completed,
                "Failed" => {
                    snapshot.reason = status.reason.clone();
                    snapshot.message = status.message.clone();
                    PodPhase::Crashed
                }
                "Running" => PodPhase::Running,
                "Pending" if pod.spec.as_ref().and_then(|s| s.node_name.as_ref()).is_some() => {
                    PodPhase::Scheduled
                }
                _ => PodPhase::Unknown,
            }
        };

        // Keep the previous termination reason (e.g. OOMKilled) visible after a restart.
        if snapshot.reason.is_none() {
            if let Some((reason, message)) = last_failure {
                snapshot.reason = reason;
                snapshot.message = message;
            }
        }
        snapshot
    }
}

/// `(reason, message)` when the container state is a crash.
fn failure_of(state: Option<&ContainerState>) -> Option<(Option<String>, Option<String>)> {
    let state = state?;
    if let Some(waiting) = &state.waiting {
        if matches!(
            waiting.reason.as_deref(),
            Some("CrashLoopBackOff") | Some("Error") | Some("OOMKilled")
        ) {
            return Some((waiting.reason.clone(), waiting.message.clone()));
        }
    }
    if let Some(terminated) = &state.terminated {
        if terminated.exit_code != 0 {
            return Some((terminated.reason.clone(), terminated.message.clone()));
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodListing {
    pub pods: Vec<PodSnapshot>,
    pub resource_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PodChange {
    Applied(PodSnapshot),
    Deleted(PodSnapshot),
    Bookmark(String),
}

/// The two read-only cluster calls the watcher needs.
#[async_trait]
pub trait PodApi: Send + Sync {
    async fn list(&self, namespace: &str, selector: &str) -> Result<PodListing>;

    /// Changes after `resource_version`. An `Err` item means the watch broke
    /// and state must be resynchronised by listing.
    fn watch(&self, namespace: &str, selector: &str, resource_version: &str) -> BoxStream<'static, Result<PodChange>>;
}

pub struct KubePodApi {
    client: Client,
    timeout_secs: u32,
}

impl KubePodApi {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            timeout_secs: 290,
        }
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn list(&self, namespace: &str, selector: &str) -> Result<PodListing> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(selector);
        }
        let list = self.api(namespace).list(&params).await?;
        debug!("Listed {} pods in {}", list.items.len(), namespace);
        Ok(PodListing {
            pods: list.items.iter().map(PodSnapshot::from_pod).collect(),
            resource_version: list.metadata.resource_version.unwrap_or_default(),
        })
    }

    fn watch(&self, namespace: &str, selector: &str, resource_version: &str) -> BoxStream<'static, Result<PodChange>> {
        let api = self.api(namespace);
        let mut params = WatchParams::default().timeout(self.timeout_secs);
        if !selector.is_empty() {
            params = params.labels(selector);
        }
        let version = resource_version.to_string();

        let stream = async_stream::try_stream! {
            let events = api.watch(&params, &version).await?;
            futures::pin_mut!(events);
            while let Some(event) = events.try_next().await? {
                match event {
                    WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                        yield PodChange::Applied(PodSnapshot::from_pod(&pod));
                    }
                    WatchEvent::Deleted(pod) => {
                        yield PodChange::Deleted(PodSnapshot::from_pod(&pod));
                    }
                    WatchEvent::Bookmark(bookmark) => {
                        yield PodChange::Bookmark(bookmark.metadata.resource_version);
                    }
                    WatchEvent::Error(e) => {
                        Err::<(), Error>(Error::TransientIo(format!("watch error {}: {}", e.code, e.message)))?;
                    }
                }
            }
        };
        stream.boxed()
    }
}
