//! Per-session fan-out of progress events to live subscribers.
//!
//! Each subscriber owns a bounded queue. A subscriber that cannot keep up is
//! disconnected rather than allowed to block the producer; a disconnected or
//! closed subscriber is dropped from the registry on the next publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::Stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::event::SessionEvent;
use crate::progress::SessionProgress;

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<SessionEvent>,
}

struct HubInner {
    queue_capacity: usize,
    heartbeat_interval: Duration,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<String, Vec<SubscriberSlot>>>,
}

impl HubInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<String, Vec<SubscriberSlot>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Event hub registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn remove_subscriber(&self, session_id: &str, subscriber_id: u64) {
        let mut registry = self.registry();
        if let Some(slots) = registry.get_mut(session_id) {
            slots.retain(|s| s.id != subscriber_id);
            if slots.is_empty() {
                registry.remove(session_id);
            }
        }
    }
}

/// Fan-out registry for session event streams.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new(queue_capacity: usize, heartbeat_interval: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                // seed events (snapshot + possible terminal tail) must fit
                queue_capacity: queue_capacity.max(4),
                heartbeat_interval,
                next_id: AtomicU64::new(1),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Opens a subscription seeded with one `progress` event built from the
    /// given snapshot, so new observers get immediate context before the
    /// live stream. Subscribing to a terminal session also seeds the final
    /// `complete`/`error` event and ends the stream after it.
    pub fn subscribe(&self, snapshot: SessionProgress) -> Subscription {
        let session_id = snapshot.session_id.clone();
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let terminal_tail = if snapshot.is_terminal() {
            Some(terminal_event(&snapshot))
        } else {
            None
        };

        // Capacity is at least 4, so the seed sends cannot fail.
        let _ = tx.try_send(SessionEvent::Progress {
            session: snapshot,
        });

        if let Some(tail) = terminal_tail {
            let _ = tx.try_send(tail);
            // Sender dropped: the stream ends once the seeds are drained.
        } else {
            self.inner
                .registry()
                .entry(session_id.clone())
                .or_default()
                .push(SubscriberSlot { id, tx });
        }

        Subscription {
            session_id,
            id,
            rx,
            heartbeat_interval: self.inner.heartbeat_interval,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Pushes an event to every live subscriber of the session. Slow
    /// subscribers (full queue) are disconnected; closed ones are dropped.
    pub fn publish(&self, session_id: &str, event: &SessionEvent) {
        let mut registry = self.inner.registry();
        let Some(slots) = registry.get_mut(session_id) else {
            return;
        };

        slots.retain(|slot| match slot.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "Session {}: subscriber {} cannot keep up, disconnecting",
                    session_id,
                    slot.id
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if slots.is_empty() {
            registry.remove(session_id);
        }
    }

    /// Drops every subscriber of a session. Their streams end after the
    /// events already queued are drained.
    pub fn close_session(&self, session_id: &str) {
        self.inner.registry().remove(session_id);
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .registry()
            .get(session_id)
            .map_or(0, Vec::len)
    }
}

/// Builds the final event for a terminal snapshot.
pub(crate) fn terminal_event(snapshot: &SessionProgress) -> SessionEvent {
    match snapshot.error_context.clone() {
        Some(error) => SessionEvent::Error { error },
        None => SessionEvent::Complete {
            session: snapshot.clone(),
        },
    }
}

/// A live observer of one session's event stream.
pub struct Subscription {
    session_id: String,
    id: u64,
    rx: mpsc::Receiver<SessionEvent>,
    heartbeat_interval: Duration,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Receives the next event. Yields a `heartbeat` when nothing arrives
    /// within the heartbeat interval, and `None` once the stream is closed
    /// (terminal event delivered, subscriber disconnected, or session gone).
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        match tokio::time::timeout(self.heartbeat_interval, self.rx.recv()).await {
            Ok(event) => event,
            Err(_) => Some(SessionEvent::Heartbeat {
                timestamp: Utc::now(),
            }),
        }
    }

    /// Adapts the subscription into a stream of events.
    pub fn into_stream(self) -> impl Stream<Item = SessionEvent> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_subscriber(&self.session_id, self.id);
        }
    }
}
