use serde::Serialize;

/// Structured trace events emitted across all SessionGrid crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionCreated {
        session_id: String,
    },
    SessionResolved {
        session_id: String,
        cache_hit: bool,
    },
    SessionIdChanged {
        old_session_id: String,
        new_session_id: String,
        indexes: usize,
    },
    SessionClosed {
        session_id: String,
        access_ms: i64,
    },
    SessionDestroyed {
        session_id: String,
        reason: String,
        listeners: usize,
        indexes: usize,
    },
    IndexUpdated {
        index: String,
        value: String,
        session_id: String,
        op: IndexOp,
    },
    ListenerFailed {
        session_id: String,
        attribute: String,
        error: String,
    },
}

/// Direction of a secondary-index mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexOp {
    Add,
    Remove,
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "sg_event");
    }
}
