//! Pod-state events for a run's namespace, with watch-gap recovery.

mod client;
mod tracker;
mod watcher;

pub use client::{KubePodApi, PodApi, PodChange, PodListing, PodPhase, PodSnapshot};
pub use tracker::PodTracker;
pub use watcher::{KubernetesWatcher, WatcherConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodEventKind {
    Scheduled,
    Running,
    Crashed,
    Evicted,
    Completed,
    Restarted,
    /// Crashes exceeded the configured threshold inside the sliding window.
    CrashLoop { restarts: u32 },
    /// The watch could not be re-established; monitoring of the namespace is degraded.
    WatchLost,
}

impl PodEventKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, PodEventKind::Completed | PodEventKind::Evicted)
    }
}

impl fmt::Display for PodEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodEventKind::Scheduled => write!(f, "SCHEDULED"),
            PodEventKind::Running => write!(f, "RUNNING"),
            PodEventKind::Crashed => write!(f, "CRASHED"),
            PodEventKind::Evicted => write!(f, "EVICTED"),
            PodEventKind::Completed => write!(f, "COMPLETED"),
            PodEventKind::Restarted => write!(f, "RESTARTED"),
            PodEventKind::CrashLoop { restarts } => write!(f, "CRASH_LOOP({})", restarts),
            PodEventKind::WatchLost => write!(f, "WATCH_LOST"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodEvent {
    pub id: Uuid,
    pub pod: String,
    pub namespace: String,
    pub kind: PodEventKind,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub restart_count: u32,
    /// Produced by a resync diff rather than observed on the watch.
    pub synthetic: bool,
}

impl PodEvent {
    pub fn new(
        pod: impl Into<String>,
        namespace: impl Into<String>,
        kind: PodEventKind,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pod: pod.into(),
            namespace: namespace.into(),
            kind,
            timestamp,
            reason: None,
            message: None,
            restart_count: 0,
            synthetic: false,
        }
    }

    pub fn with_reason(mut self, reason: Option<String>, message: Option<String>) -> Self {
        self.reason = reason;
        self.message = message;
        self
    }

    pub fn watch_lost(namespace: &str, attempts: u32, error: &str, at: DateTime<Utc>) -> Self {
        PodEvent::new(format!("watch:{}", namespace), namespace, PodEventKind::WatchLost, at).with_reason(
            Some("WatchLost".to_string()),
            Some(format!("pod watch lost after {} reconnect attempts: {}", attempts, error)),
        )
    }
}
