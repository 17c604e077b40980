//! Destroy/expire notification.
//!
//! Publishes the lifecycle event, tells every attribute carrying a
//! [`DestructionListener`](crate::attribute::DestructionListener) that its
//! session is going away, then removes the session from every secondary
//! index it currently resolves to.  Nothing here propagates: listener
//! failures (including panics) and index failures are logged per item.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use sg_domain::trace::TraceEvent;

use crate::events::{SessionEvent, SessionEventSink};
use crate::index::{resolve_indexes, IndexManagers, IndexResolver};
use crate::record::{SessionSnapshot, SessionView};

#[derive(Clone)]
pub struct DestroyNotifier {
    events: Arc<dyn SessionEventSink>,
    resolvers: Arc<[Arc<dyn IndexResolver>]>,
    indexes: IndexManagers,
}

impl DestroyNotifier {
    pub fn new(
        events: Arc<dyn SessionEventSink>,
        resolvers: Arc<[Arc<dyn IndexResolver>]>,
        indexes: IndexManagers,
    ) -> Self {
        Self {
            events,
            resolvers,
            indexes,
        }
    }

    /// Notify everything interested in `session` going away.  `event`
    /// builds the published event (destroyed vs. expired).
    pub fn accept(&self, session: &dyn SessionView, event: fn(SessionSnapshot) -> SessionEvent) {
        let snapshot = SessionSnapshot::capture(session);
        let kind = event(snapshot.clone());
        let reason = format!("{:?}", kind.kind).to_lowercase();
        self.events.publish(kind);

        let mut listeners = 0;
        for (name, value) in snapshot.attributes() {
            let Some(listener) = value.listener() else {
                continue;
            };
            listeners += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_destroy(name, &snapshot)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            tracing::warn!(
                session_id = %snapshot.id(),
                attribute = %name,
                error = %error,
                "destruction listener failed"
            );
            TraceEvent::ListenerFailed {
                session_id: snapshot.id().to_string(),
                attribute: name.clone(),
                error,
            }
            .emit();
        }

        let resolved = resolve_indexes(&self.resolvers, &snapshot);
        for (index, value) in &resolved {
            if let Err(e) = self.indexes.remove(index, value, snapshot.id()) {
                tracing::warn!(
                    session_id = %snapshot.id(),
                    index = %index,
                    error = %e,
                    "failed to remove session from index"
                );
            }
        }

        TraceEvent::SessionDestroyed {
            session_id: snapshot.id().to_string(),
            reason,
            listeners,
            indexes: resolved.len(),
        }
        .emit();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".into()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
