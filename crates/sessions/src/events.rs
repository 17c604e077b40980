//! Session lifecycle events and the execution context used for
//! off-request notification.

use crate::record::{SessionSnapshot, SessionView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Created,
    /// Explicit invalidation / delete.
    Destroyed,
    /// Idle timeout reached, reported by an expiration sweep.
    Expired,
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session: SessionSnapshot,
}

impl SessionEvent {
    pub fn created(session: SessionSnapshot) -> Self {
        Self {
            kind: SessionEventKind::Created,
            session,
        }
    }

    pub fn destroyed(session: SessionSnapshot) -> Self {
        Self {
            kind: SessionEventKind::Destroyed,
            session,
        }
    }

    pub fn expired(session: SessionSnapshot) -> Self {
        Self {
            kind: SessionEventKind::Expired,
            session,
        }
    }
}

pub trait SessionEventSink: Send + Sync {
    fn publish(&self, event: SessionEvent);
}

/// Default sink: logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl SessionEventSink for TracingEventSink {
    fn publish(&self, event: SessionEvent) {
        tracing::debug!(
            kind = ?event.kind,
            session_id = %event.session.id(),
            attributes = event.session.attributes().len(),
            "session event"
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs work under a deployment's identity when no request thread is
/// available (e.g. expiration sweeps).
pub trait ExecutionContext: Send + Sync {
    fn run(&self, task: &mut dyn FnMut());
}

/// Runs inline on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectContext;

impl ExecutionContext for DirectContext {
    fn run(&self, task: &mut dyn FnMut()) {
        task()
    }
}

/// Runs inside a `deployment` span so everything logged by listeners and
/// index cleanup is attributed to the owning deployment.
#[derive(Debug, Clone)]
pub struct DeploymentContext {
    deployment: String,
}

impl DeploymentContext {
    pub fn new(deployment: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
        }
    }

    pub fn deployment(&self) -> &str {
        &self.deployment
    }
}

impl ExecutionContext for DeploymentContext {
    fn run(&self, task: &mut dyn FnMut()) {
        let span = tracing::info_span!("deployment", name = %self.deployment());
        let _entered = span.enter();
        task()
    }
}
