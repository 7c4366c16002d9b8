//! Event Bus (§4.4) — typed in-process pub/sub, the sole synchronization
//! contract between Persistence, the manager, and external collaborators
//! (UI, dashboard).
//!
//! Per the REDESIGN FLAGS in spec.md §9, the duck-typed `map[string]any`
//! payload of the original is replaced here with a tagged variant per
//! event type; a free-form map is only produced at the external
//! serialization boundary via [`Event::to_json_map`].

pub mod debounce;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use tokio::sync::Notify;

use crate::config::diff::ConfigDiff;

/// Depth of each subscriber's inbox (spec.md §4.4 "bounded").
const INBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerStateChanged,
    ServerAutoDisabled,
    ConnectionEstablished,
    ConnectionLost,
    ToolsDiscovered,
    ConfigChanged,
    AppStateChanged,
}

/// A typed event envelope. Each variant is one row of the `type` ∈ {...}
/// enumeration in spec.md §3.
#[derive(Debug, Clone)]
pub enum Event {
    ServerStateChanged {
        server_name: String,
        old_state: String,
        new_state: String,
        timestamp: u64,
    },
    ServerAutoDisabled {
        server_name: String,
        reason: String,
        consecutive_failures: u32,
        timestamp: u64,
    },
    ConnectionEstablished {
        server_name: String,
        tool_count: usize,
        duration_ms: u64,
        timestamp: u64,
    },
    ConnectionLost {
        server_name: String,
        reason: String,
        timestamp: u64,
    },
    ToolsDiscovered {
        server_name: String,
        tool_count: usize,
        timestamp: u64,
    },
    ConfigChanged {
        diff: ConfigDiff,
        timestamp: u64,
    },
    AppStateChanged {
        detail: String,
        timestamp: u64,
    },
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ServerStateChanged { .. } => EventKind::ServerStateChanged,
            Event::ServerAutoDisabled { .. } => EventKind::ServerAutoDisabled,
            Event::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            Event::ConnectionLost { .. } => EventKind::ConnectionLost,
            Event::ToolsDiscovered { .. } => EventKind::ToolsDiscovered,
            Event::ConfigChanged { .. } => EventKind::ConfigChanged,
            Event::AppStateChanged { .. } => EventKind::AppStateChanged,
        }
    }

    pub fn server_name(&self) -> Option<&str> {
        match self {
            Event::ServerStateChanged { server_name, .. }
            | Event::ServerAutoDisabled { server_name, .. }
            | Event::ConnectionEstablished { server_name, .. }
            | Event::ConnectionLost { server_name, .. }
            | Event::ToolsDiscovered { server_name, .. } => Some(server_name),
            Event::ConfigChanged { .. } | Event::AppStateChanged { .. } => None,
        }
    }

    /// Free-form map used only at the external serialization boundary
    /// (spec.md §6 "Event envelope").
    pub fn to_json_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("type".into(), Value::String(format!("{:?}", self.kind())));
        if let Some(name) = self.server_name() {
            map.insert("server_name".into(), Value::String(name.to_string()));
        }
        match self {
            Event::ServerStateChanged {
                old_state,
                new_state,
                timestamp,
                ..
            } => {
                map.insert("old_state".into(), Value::String(old_state.clone()));
                map.insert("new_state".into(), Value::String(new_state.clone()));
                map.insert("timestamp".into(), Value::from(*timestamp));
            }
            Event::ServerAutoDisabled {
                reason,
                consecutive_failures,
                timestamp,
                ..
            } => {
                map.insert("reason".into(), Value::String(reason.clone()));
                map.insert(
                    "consecutive_failures".into(),
                    Value::from(*consecutive_failures),
                );
                map.insert("timestamp".into(), Value::from(*timestamp));
            }
            Event::ConnectionEstablished {
                tool_count,
                duration_ms,
                timestamp,
                ..
            } => {
                map.insert("tool_count".into(), Value::from(*tool_count));
                map.insert("duration_ms".into(), Value::from(*duration_ms));
                map.insert("timestamp".into(), Value::from(*timestamp));
            }
            Event::ConnectionLost {
                reason, timestamp, ..
            } => {
                map.insert("reason".into(), Value::String(reason.clone()));
                map.insert("timestamp".into(), Value::from(*timestamp));
            }
            Event::ToolsDiscovered {
                tool_count,
                timestamp,
                ..
            } => {
                map.insert("tool_count".into(), Value::from(*tool_count));
                map.insert("timestamp".into(), Value::from(*timestamp));
            }
            Event::ConfigChanged { diff, timestamp } => {
                map.insert("added".into(), Value::from(diff.added.clone()));
                map.insert("removed".into(), Value::from(diff.removed.clone()));
                map.insert(
                    "transport_changed".into(),
                    Value::from(diff.transport_changed.clone()),
                );
                map.insert(
                    "metadata_changed".into(),
                    Value::from(diff.metadata_changed.clone()),
                );
                map.insert("timestamp".into(), Value::from(*timestamp));
            }
            Event::AppStateChanged { detail, timestamp } => {
                map.insert("detail".into(), Value::String(detail.clone()));
                map.insert("timestamp".into(), Value::from(*timestamp));
            }
        }
        map
    }
}

type Handler = Box<dyn Fn(Event) + Send + Sync + 'static>;

/// A per-subscriber bounded inbox. Implemented as a mutex-guarded deque
/// rather than `tokio::sync::mpsc` so that a full inbox can drop its
/// *oldest* entry (spec.md §4.4 "Failure semantics") instead of blocking
/// the publisher or rejecting the newest entry.
struct Inbox {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl Inbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(INBOX_CAPACITY)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: Event) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= INBOX_CAPACITY {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    async fn recv(&self) -> Option<Event> {
        loop {
            if let Some(event) = self.queue.lock().unwrap().pop_front() {
                return Some(event);
            }
            self.notify.notified().await;
        }
    }
}

struct Subscriber {
    kinds: Option<HashSet<EventKind>>,
    inbox: Arc<Inbox>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl Subscriber {
    fn matches(&self, kind: EventKind) -> bool {
        match &self.kinds {
            None => true,
            Some(set) => set.contains(&kind),
        }
    }
}

/// A live subscription. Dropping it stops the drain task and unregisters
/// the subscriber from future publishes.
pub struct Subscription {
    closed: Arc<std::sync::atomic::AtomicBool>,
    dropped_counter: Arc<Inbox>,
}

impl Subscription {
    /// Count of events dropped for this subscriber because its inbox was
    /// full (spec.md §8 property 11).
    pub fn dropped_events(&self) -> u64 {
        self.dropped_counter.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// In-process, multi-subscriber typed pub/sub (spec.md §4.4).
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for the given event kinds (`None` = all kinds).
    /// The handler runs on a dedicated drain task; handlers for the same
    /// subscriber are serialized, but cross-subscriber ordering is not
    /// guaranteed (spec.md §4.4).
    pub fn subscribe(&self, kinds: Option<Vec<EventKind>>, handler: Handler) -> Subscription {
        let inbox = Arc::new(Inbox::new());
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let subscriber = Subscriber {
            kinds: kinds.map(|k| k.into_iter().collect()),
            inbox: inbox.clone(),
            closed: closed.clone(),
        };
        self.subscribers.lock().unwrap().push(subscriber);

        let drain_inbox = inbox.clone();
        let drain_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                if drain_closed.load(Ordering::Relaxed) {
                    return;
                }
                match drain_inbox.recv().await {
                    Some(event) => {
                        // Isolate a panicking handler — it must not take down
                        // the bus (spec.md §4.4 "Failure semantics").
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            handler(event)
                        }));
                        if let Err(panic) = result {
                            tracing::error!(?panic, "event subscriber handler panicked");
                        }
                    }
                    None => return,
                }
            }
        });

        Subscription {
            closed,
            dropped_counter: inbox,
        }
    }

    /// Dispatch synchronously to every matching subscriber's inbox.
    pub fn publish(&self, event: Event) {
        let subscribers = self.subscribers.lock().unwrap();
        let kind = event.kind();
        for subscriber in subscribers.iter() {
            if subscriber.closed.load(Ordering::Relaxed) {
                continue;
            }
            if subscriber.matches(kind) {
                subscriber.inbox.push(event.clone());
            }
        }
    }

    /// Drop subscribers whose `Subscription` handle has been dropped.
    /// Bounded bookkeeping — call periodically, not required for
    /// correctness since closed subscribers are already skipped.
    pub fn prune_closed(&self) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|s| !s.closed.load(Ordering::Relaxed));
    }
}
