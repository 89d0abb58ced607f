use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use super::{PodEvent, PodEventKind, PodPhase, PodSnapshot};

#[derive(Debug, Clone)]
struct TrackedPod {
    phase: PodPhase,
    restart_count: u32,
    crashes: VecDeque<DateTime<Utc>>,
    in_loop: bool,
}

impl TrackedPod {
    fn unknown() -> Self {
        Self {
            phase: PodPhase::Unknown,
            restart_count: 0,
            crashes: VecDeque::new(),
            in_loop: false,
        }
    }
}

/// Last-known state of every watched pod.
///
/// Each snapshot is diffed against what was last seen, so replaying an
/// unchanged pod (for example after a resync) produces no events.
#[derive(Debug)]
pub struct PodTracker {
    pods: HashMap<String, TrackedPod>,
    crash_loop_threshold: u32,
    crash_loop_window: Duration,
}

impl PodTracker {
    pub fn new(crash_loop_threshold: u32, crash_loop_window: Duration) -> Self {
        Self {
            pods: HashMap::new(),
            crash_loop_threshold,
            crash_loop_window,
        }
    }

    pub fn phase_of(&self, pod: &str) -> Option<PodPhase> {
        self.pods.get(pod).map(|p| p.phase)
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// Apply one snapshot and return the transitions it implies.
    pub fn observe(&mut self, snapshot: &PodSnapshot, at: DateTime<Utc>, synthetic: bool) -> Vec<PodEvent> {
        let threshold = self.crash_loop_threshold;
        let window = self.crash_loop_window;
        let tracked = self
            .pods
            .entry(snapshot.name.clone())
            .or_insert_with(TrackedPod::unknown);

        let mut kinds = Vec::new();
        let known = tracked.phase != PodPhase::Unknown;
        if known && snapshot.restart_count > tracked.restart_count {
            // Every restart follows a crash. A crash already observed as the
            // Crashed phase is not counted twice.
            let restarts = snapshot.restart_count - tracked.restart_count;
            let already_seen = u32::from(tracked.phase == PodPhase::Crashed);
            match snapshot.phase {
                PodPhase::Crashed => {
                    // Still in back-off: each restart came up and went down again.
                    for _ in 0..restarts {
                        if tracked.phase == PodPhase::Crashed || !kinds.is_empty() {
                            kinds.push(PodEventKind::Restarted);
                        }
                        kinds.push(PodEventKind::Crashed);
                    }
                }
                _ => {
                    for _ in 0..restarts.saturating_sub(already_seen) {
                        kinds.push(PodEventKind::Crashed);
                    }
                    if snapshot.phase == PodPhase::Running {
                        kinds.push(PodEventKind::Restarted);
                    }
                }
            }
        } else if snapshot.phase != tracked.phase {
            match (tracked.phase, snapshot.phase) {
                (_, PodPhase::Unknown) => {}
                (PodPhase::Crashed, PodPhase::Running) => kinds.push(PodEventKind::Restarted),
                (_, PodPhase::Scheduled) => kinds.push(PodEventKind::Scheduled),
                (_, PodPhase::Running) => kinds.push(PodEventKind::Running),
                (_, PodPhase::Crashed) => kinds.push(PodEventKind::Crashed),
                (_, PodPhase::Evicted) => kinds.push(PodEventKind::Evicted),
                (_, PodPhase::Completed) => kinds.push(PodEventKind::Completed),
            }
        }

        tracked.phase = snapshot.phase;
        tracked.restart_count = tracked.restart_count.max(snapshot.restart_count);

        for _ in kinds.iter().filter(|k| **k == PodEventKind::Crashed) {
            tracked.crashes.push_back(at);
        }
        while tracked
            .crashes
            .front()
            .map(|t| at - *t > window)
            .unwrap_or(false)
        {
            tracked.crashes.pop_front();
        }
        let in_window = tracked.crashes.len() as u32;
        if in_window > threshold && !tracked.in_loop {
            tracked.in_loop = true;
            info!(
                "Pod {} crashed {} times within {}s",
                snapshot.name,
                in_window,
                window.num_seconds()
            );
            kinds.push(PodEventKind::CrashLoop { restarts: in_window });
        } else if in_window <= threshold {
            tracked.in_loop = false;
        }

        let restart_count = tracked.restart_count;
        kinds
            .into_iter()
            .map(|kind| {
                let mut event = PodEvent::new(&snapshot.name, &snapshot.namespace, kind, at)
                    .with_reason(snapshot.reason.clone(), snapshot.message.clone());
                event.restart_count = restart_count;
                event.synthetic = synthetic;
                debug!("Pod {} -> {}", snapshot.name, event.kind);
                event
            })
            .collect()
    }

    /// Diff a full listing against last-known state. Pods missing from the
    /// listing are forgotten.
    pub fn resync(&mut self, pods: &[PodSnapshot], at: DateTime<Utc>, synthetic: bool) -> Vec<PodEvent> {
        let listed: std::collections::HashSet<&str> = pods.iter().map(|p| p.name.as_str()).collect();
        self.pods.retain(|name, _| listed.contains(name.as_str()));
        pods.iter()
            .flat_map(|pod| self.observe(pod, at, synthetic))
            .collect()
    }

    pub fn forget(&mut self, pod: &str) {
        self.pods.remove(pod);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(phase: PodPhase, restarts: u32) -> PodSnapshot {
        let mut s = PodSnapshot::new("api-0", "focus-ci", phase);
        s.restart_count = restarts;
        s
    }

    fn kinds(events: &[PodEvent]) -> Vec<PodEventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn walks_the_lifecycle() {
        let mut tracker = PodTracker::new(3, Duration::minutes(10));
        let now = Utc::now();
        assert_eq!(kinds(&tracker.observe(&snap(PodPhase::Scheduled, 0), now, false)), vec![PodEventKind::Scheduled]);
        assert_eq!(kinds(&tracker.observe(&snap(PodPhase::Running, 0), now, false)), vec![PodEventKind::Running]);
        assert!(tracker.observe(&snap(PodPhase::Running, 0), now, false).is_empty());
        assert_eq!(kinds(&tracker.observe(&snap(PodPhase::Completed, 0), now, false)), vec![PodEventKind::Completed]);
    }

    #[test]
    fn crash_then_restart_reenters_running() {
        let mut tracker = PodTracker::new(3, Duration::minutes(10));
        let now = Utc::now();
        tracker.observe(&snap(PodPhase::Running, 0), now, false);
        assert_eq!(kinds(&tracker.observe(&snap(PodPhase::Crashed, 1), now, false)), vec![PodEventKind::Crashed]);
        let restarted = tracker.observe(&snap(PodPhase::Running, 2), now, false);
        assert_eq!(kinds(&restarted), vec![PodEventKind::Restarted]);
        assert_eq!(restarted[0].restart_count, 2);
    }

    #[test]
    fn missed_crash_is_inferred_from_restart_count() {
        let mut tracker = PodTracker::new(3, Duration::minutes(10));
        let now = Utc::now();
        tracker.observe(&snap(PodPhase::Running, 0), now, false);
        assert_eq!(
            kinds(&tracker.observe(&snap(PodPhase::Running, 1), now, true)),
            vec![PodEventKind::Crashed, PodEventKind::Restarted]
        );
    }

    #[test]
    fn crash_loop_fires_once_per_episode() {
        let mut tracker = PodTracker::new(3, Duration::minutes(10));
        let start = Utc::now();
        tracker.observe(&snap(PodPhase::Running, 0), start, false);

        let mut loops = 0;
        for i in 1..=6u32 {
            let at = start + Duration::seconds(i as i64 * 30);
            let crashed = tracker.observe(&snap(PodPhase::Crashed, 2 * i - 1), at, false);
            tracker.observe(&snap(PodPhase::Running, 2 * i), at, false);
            loops += crashed
                .iter()
                .filter(|e| matches!(e.kind, PodEventKind::CrashLoop { .. }))
                .count();
        }
        assert_eq!(loops, 1);
    }

    #[test]
    fn back_off_restarts_without_running_still_count() {
        let mut tracker = PodTracker::new(3, Duration::minutes(10));
        let start = Utc::now();
        tracker.observe(&snap(PodPhase::Running, 0), start, false);

        let mut events = Vec::new();
        for restarts in 1..=6u32 {
            let at = start + Duration::seconds(restarts as i64 * 20);
            events.extend(tracker.observe(&snap(PodPhase::Crashed, restarts), at, false));
        }
        let crashed = events.iter().filter(|e| e.kind == PodEventKind::Crashed).count();
        let loops: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.kind, PodEventKind::CrashLoop { .. }))
            .collect();
        assert_eq!(crashed, 6);
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].kind, PodEventKind::CrashLoop { restarts: 4 });
        assert_eq!(tracker.phase_of("api-0"), Some(PodPhase::Crashed));
    }

    #[test]
    fn crashed_to_crashed_is_a_restart_and_a_crash() {
        let mut tracker = PodTracker::new(5, Duration::minutes(10));
        let now = Utc::now();
        tracker.observe(&snap(PodPhase::Running, 0), now, false);
        tracker.observe(&snap(PodPhase::Crashed, 1), now, false);
        assert_eq!(
            kinds(&tracker.observe(&snap(PodPhase::Crashed, 2), now, false)),
            vec![PodEventKind::Restarted, PodEventKind::Crashed]
        );
        // Two restarts missed while in back-off.
        assert_eq!(
            kinds(&tracker.observe(&snap(PodPhase::Crashed, 4), now, false)),
            vec![
                PodEventKind::Restarted,
                PodEventKind::Crashed,
                PodEventKind::Restarted,
                PodEventKind::Crashed
            ]
        );
    }

    #[test]
    fn crashes_outside_window_do_not_loop() {
        let mut tracker = PodTracker::new(2, Duration::minutes(1));
        let start = Utc::now();
        tracker.observe(&snap(PodPhase::Running, 0), start, false);
        for i in 1..=5u32 {
            let at = start + Duration::minutes(i as i64 * 5);
            let events = tracker.observe(&snap(PodPhase::Crashed, 2 * i - 1), at, false);
            assert!(!events.iter().any(|e| matches!(e.kind, PodEventKind::CrashLoop { .. })));
            tracker.observe(&snap(PodPhase::Running, 2 * i), at, false);
        }
    }

    #[test]
    fn resync_of_unchanged_state_is_silent() {
        let mut tracker = PodTracker::new(3, Duration::minutes(10));
        let now = Utc::now();
        let pods = vec![snap(PodPhase::Running, 0)];
        assert_eq!(tracker.resync(&pods, now, false).len(), 1);
        assert!(tracker.resync(&pods, now, true).is_empty());
        assert!(tracker.resync(&[], now, true).is_empty());
        assert!(tracker.is_empty());
    }
}
