//! Per-session publish/subscribe of structured progress events.
//!
//! Distinct from [`crate::event_bus`]: that hub is a single global stream of
//! node/diagnostic/LLM events for the graph runtime, with no per-subscriber
//! buffer or replay policy. The Progress Bus is keyed per session, drops
//! only non-terminal events on a full subscriber buffer, and replays the
//! current state to late subscribers — bookkeeping the generic bus does not
//! track.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    ProgressUpdate,
    ProgressThinking,
    ProgressSearching,
    ResearchComplete,
    Error,
}

impl ProgressEventType {
    /// Terminal events are never dropped by the bounded-buffer policy.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressEventType::ResearchComplete | ProgressEventType::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    pub stage: String,
    pub progress: u8,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
    pub error: Option<String>,
}

impl ProgressEvent {
    #[must_use]
    pub fn update(session_id: impl Into<String>, stage: impl Into<String>, progress: u8) -> Self {
        Self {
            session_id: session_id.into(),
            event_type: ProgressEventType::ProgressUpdate,
            stage: stage.into(),
            progress,
            timestamp: Utc::now(),
            detail: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn thinking(session_id: impl Into<String>, stage: impl Into<String>, progress: u8) -> Self {
        Self {
            event_type: ProgressEventType::ProgressThinking,
            ..Self::update(session_id, stage, progress)
        }
    }

    #[must_use]
    pub fn searching(session_id: impl Into<String>, stage: impl Into<String>, progress: u8) -> Self {
        Self {
            event_type: ProgressEventType::ProgressSearching,
            ..Self::update(session_id, stage, progress)
        }
    }

    #[must_use]
    pub fn complete(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            event_type: ProgressEventType::ResearchComplete,
            stage: "completed".to_string(),
            progress: 100,
            timestamp: Utc::now(),
            detail: None,
            error: None,
        }
    }

    #[must_use]
    pub fn error(session_id: impl Into<String>, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            event_type: ProgressEventType::Error,
            stage: stage.into(),
            progress: 0,
            timestamp: Utc::now(),
            detail: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ProgressBusError {
    #[error("no subscribers for session {session_id}")]
    #[diagnostic(code(deepresearch::progress::no_subscribers))]
    NoSubscribers { session_id: String },
}

pub type Result<T> = std::result::Result<T, ProgressBusError>;

struct SubscriberState {
    queue: Mutex<VecDeque<ProgressEvent>>,
    notify: Notify,
    dropped: std::sync::atomic::AtomicU64,
    capacity: usize,
}

impl SubscriberState {
    fn push(&self, event: ProgressEvent) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            // Evict the oldest non-terminal event to make room; if every
            // queued event is terminal (at most one ever will be) grow past
            // capacity rather than lose it.
            if let Some(pos) = queue.iter().position(|e| !e.event_type.is_terminal()) {
                queue.remove(pos);
                self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            } else if !event.event_type.is_terminal() {
                self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return;
            }
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_waiters();
    }
}

/// One subscriber's view: a bounded, drop-oldest-non-terminal queue plus a
/// counter of events dropped due to backpressure.
pub struct Subscription {
    state: Arc<SubscriberState>,
}

impl Subscription {
    pub async fn recv(&self) -> Option<ProgressEvent> {
        loop {
            if let Some(event) = self.state.queue.lock().pop_front() {
                return Some(event);
            }
            self.state.notify.notified().await;
        }
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.state.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[derive(Default)]
struct SessionChannel {
    subscribers: Vec<Arc<SubscriberState>>,
    last_event: Option<ProgressEvent>,
    closed: bool,
}

/// In-process, per-session progress fan-out.
pub struct ProgressBus {
    sessions: Mutex<HashMap<String, SessionChannel>>,
    capacity: usize,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Publish never blocks: on a full subscriber buffer the oldest
    /// non-terminal event is evicted to make room; terminal events are
    /// never dropped.
    pub fn publish(&self, event: ProgressEvent) {
        let mut sessions = self.sessions.lock();
        let channel = sessions.entry(event.session_id.clone()).or_default();
        if channel.closed {
            return;
        }
        channel.last_event = Some(event.clone());
        for sub in &channel.subscribers {
            sub.push(event.clone());
        }
    }

    /// Subscribe to a session's events. The new subscriber immediately
    /// receives a synthetic replay of the last known state (if any), then
    /// live events.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let state = Arc::new(SubscriberState {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: std::sync::atomic::AtomicU64::new(0),
            capacity: self.capacity,
        });

        let mut sessions = self.sessions.lock();
        let channel = sessions.entry(session_id.to_string()).or_default();
        if let Some(last) = channel.last_event.clone() {
            state.push(last);
        }
        channel.subscribers.push(state.clone());

        Subscription { state }
    }

    /// Mark a session closed and detach its subscribers. Already-queued
    /// terminal events remain readable until consumed.
    pub fn close(&self, session_id: &str) {
        let mut sessions = self.sessions.lock();
        if let Some(channel) = sessions.get_mut(session_id) {
            channel.closed = true;
            channel.subscribers.clear();
        }
    }
}
