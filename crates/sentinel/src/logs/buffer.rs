use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

use super::LogLine;

/// Bounded single-consumer queue between source pumps and the subscriber.
/// When full, the oldest line is dropped so producers never wait on the consumer.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct BufferState {
    lines: VecDeque<LogLine>,
    dropped: u64,
    closed: bool,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(BufferState {
                lines: VecDeque::with_capacity(capacity),
                ..Default::default()
            }),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue without blocking. Returns `true` if an older line was evicted.
    pub fn push(&self, line: LogLine) -> bool {
        let evicted = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return false;
            }
            let evicted = if state.lines.len() >= self.capacity {
                state.lines.pop_front();
                state.dropped += 1;
                true
            } else {
                false
            };
            state.lines.push_back(line);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Next buffered line; waits while empty and returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<LogLine> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(line) = state.lines.pop_front() {
                    return Some(line);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting lines; already buffered lines can still be drained.
    pub fn close(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
        self.notify.notify_one();
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
