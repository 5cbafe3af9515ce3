//! Session reaper: periodic eviction of abandoned and expired sessions.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;

use super::EngineInner;

/// Starts the reaper task. It holds only a weak reference to the engine and
/// stops once the engine is dropped.
pub(crate) fn spawn(inner: Weak<EngineInner>) {
    let Some(strong) = inner.upgrade() else {
        return;
    };
    let reap_interval = strong.config.reap_interval();
    let idle_timeout = strong.config.idle_timeout();
    let retention = strong.config.retention();
    drop(strong);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reap_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(engine) = inner.upgrade() else {
                break;
            };
            reap(&engine, idle_timeout, retention);
        }
        log::debug!("Session reaper task stopped");
    });
}

/// One scan: evicts terminal sessions past the retention window and
/// non-terminal sessions with no producer activity and no subscribers
/// beyond the idle threshold.
pub(crate) fn reap(inner: &Arc<EngineInner>, idle_timeout: Duration, retention: Duration) {
    let now = Utc::now();
    let idle = chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::MAX);
    let keep = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);

    let stale: Vec<String> = {
        let sessions = inner.read_sessions();
        sessions
            .iter()
            .filter(|(id, slot)| {
                let state = slot.lock_state();
                if state.is_terminal() {
                    let terminal_at = state.completed_at.unwrap_or(state.last_update);
                    now.signed_duration_since(terminal_at) > keep
                } else {
                    now.signed_duration_since(state.last_update) > idle
                        && inner.hub.subscriber_count(id) == 0
                }
            })
            .map(|(id, _)| String::clone(id))
            .collect()
    };

    for session_id in stale {
        inner.evict(&session_id);
        log::info!("Reaped session {}", session_id);
    }
}
