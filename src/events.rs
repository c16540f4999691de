//! In-process event bus bridging the engine to WebSocket clients.
//!
//! Subscribers register a bounded channel. Progress topics are lossy: a
//! full channel drops the event. Lifecycle topics (`task_started`,
//! `task_complete`) must be delivered, so a subscriber that cannot absorb
//! one is disconnected and logged rather than blocking the publisher.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;

use crate::paths::RelPath;
use crate::queue::TaskStatus;
use crate::types::Side;

/// Minimum spacing between progress events for one operation.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Default per-subscriber channel capacity.
pub const SUBSCRIBER_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Everything the engine publishes. Serialized as `{type, data}` frames for
/// the WebSocket bridge.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    QueueProgress {
        task_id: String,
        bytes_transferred: u64,
        total_bytes: u64,
        progress_pct: f64,
    },
    TaskStarted {
        task_id: String,
        kind: String,
    },
    TaskComplete {
        task_id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<serde_json::Value>,
    },
    HashProgress {
        side: Side,
        relpath: RelPath,
        bytes_hashed: u64,
        total_bytes: u64,
    },
    VerifyProgress {
        folder: String,
        current: usize,
        total: usize,
    },
    ScanProgress {
        side: Side,
        files_seen: usize,
    },
    IndexRefreshed {
        side: Side,
        file_count: usize,
        total_bytes: u64,
    },
}

impl Event {
    /// Progress topics may be dropped for a slow subscriber; lifecycle
    /// topics may not.
    pub fn is_lossy(&self) -> bool {
        !matches!(self, Event::TaskStarted { .. } | Event::TaskComplete { .. })
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bounded subscriber channel. The returned id unsubscribes.
    pub fn subscribe(&self, capacity: usize) -> (u64, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().retain(|s| s.id != id);
    }

    /// Fan an event out to every subscriber. Never blocks: lossy events are
    /// dropped on a full channel, lifecycle events disconnect the laggard.
    pub fn publish(&self, event: Event) {
        let lossy = event.is_lossy();
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if lossy {
                    true
                } else {
                    warn!(subscriber = sub.id, "Subscriber too slow for lifecycle event, disconnecting");
                    false
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Progress throttling
// ---------------------------------------------------------------------------

/// Rate limiter for progress publication inside chunked I/O loops.
pub struct Throttle {
    last: Option<Instant>,
    interval: Duration,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { last: None, interval }
    }

    /// True when enough time has passed since the last accepted tick.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(n: u64) -> Event {
        Event::QueueProgress {
            task_id: "t".into(),
            bytes_transferred: n,
            total_bytes: 100,
            progress_pct: n as f64,
        }
    }

    fn complete() -> Event {
        Event::TaskComplete {
            task_id: "t".into(),
            status: TaskStatus::Completed,
            error: None,
            detail: None,
        }
    }

    #[test]
    fn lossy_events_drop_on_full_channel() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(1);
        bus.publish(progress(1));
        bus.publish(progress(2)); // dropped, channel full

        assert!(matches!(rx.try_recv().unwrap(), Event::QueueProgress { bytes_transferred: 1, .. }));
        assert!(rx.try_recv().is_err());
        // Subscriber still connected.
        bus.publish(progress(3));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn lifecycle_overflow_disconnects() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(1);
        bus.publish(complete());
        bus.publish(complete()); // overflow on a lifecycle topic

        assert!(rx.try_recv().is_ok());
        // The subscriber was disconnected; the channel is closed once drained.
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn unsubscribe_removes_channel() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe(4);
        bus.unsubscribe(id);
        bus.publish(progress(1));
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn events_serialize_as_type_data_frames() {
        let json = serde_json::to_value(progress(5)).unwrap();
        assert_eq!(json["type"], "queue_progress");
        assert_eq!(json["data"]["bytes_transferred"], 5);
    }

    #[test]
    fn throttle_spacing() {
        let mut t = Throttle::new(Duration::from_secs(3600));
        assert!(t.ready());
        assert!(!t.ready());
    }
}
