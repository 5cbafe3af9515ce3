//! Event types pushed to session subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::progress::{ErrorContext, SessionProgress};

/// One event on a session's stream.
///
/// `progress` and `complete` carry the full current snapshot, never a diff,
/// so a dropped event is healed by the next one and reconnection needs no
/// replay cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Any accepted state mutation.
    Progress { session: SessionProgress },
    /// Keep-alive when no progress has fired within the heartbeat interval.
    Heartbeat { timestamp: DateTime<Utc> },
    /// The session reached `completed`. Last event on the stream.
    Complete { session: SessionProgress },
    /// The session reached `failed`. Last event on the stream.
    Error { error: ErrorContext },
}

impl SessionEvent {
    /// Wire name of the event type.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Progress { .. } => "progress",
            SessionEvent::Heartbeat { .. } => "heartbeat",
            SessionEvent::Complete { .. } => "complete",
            SessionEvent::Error { .. } => "error",
        }
    }

    /// Whether this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::Complete { .. } | SessionEvent::Error { .. }
        )
    }
}
