//! Shared fixture: a repository over the in-memory store with a
//! `principal` index resolved from the `user` attribute.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use sg_sessions::{
    AttributeIndexResolver, MemoryIndexManager, MemorySessionStore, SessionEvent,
    SessionEventKind, SessionEventSink, SessionId, SessionRepository, PRINCIPAL_NAME_INDEX,
};

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(SessionEventKind, SessionId)>>,
}

impl RecordingSink {
    pub fn kinds(&self) -> Vec<SessionEventKind> {
        self.events.lock().iter().map(|(k, _)| *k).collect()
    }

    pub fn count(&self, kind: SessionEventKind) -> usize {
        self.events.lock().iter().filter(|(k, _)| *k == kind).count()
    }
}

impl SessionEventSink for RecordingSink {
    fn publish(&self, event: SessionEvent) {
        use sg_sessions::SessionView;
        self.events
            .lock()
            .push((event.kind, event.session.id().clone()));
    }
}

pub struct Fixture {
    pub repo: SessionRepository,
    pub store: Arc<MemorySessionStore>,
    pub principal: Arc<MemoryIndexManager>,
    pub events: Arc<RecordingSink>,
    pub released: Arc<Mutex<Vec<SessionId>>>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_max_idle(Some(Duration::from_secs(30 * 60)))
    }

    pub fn with_max_idle(max_idle: Option<Duration>) -> Self {
        let store = Arc::new(MemorySessionStore::new());
        let principal = Arc::new(MemoryIndexManager::new());
        let events = Arc::new(RecordingSink::default());
        let released = Arc::new(Mutex::new(Vec::new()));
        let hook = released.clone();
        let repo = SessionRepository::builder(store.clone())
            .resolver(Arc::new(AttributeIndexResolver::new(
                PRINCIPAL_NAME_INDEX,
                "user",
            )))
            .index_manager(PRINCIPAL_NAME_INDEX, principal.clone())
            .event_sink(events.clone())
            .default_max_idle(max_idle)
            .on_release(move |id| hook.lock().push(id.clone()))
            .build()
            .unwrap();
        Self {
            repo,
            store,
            principal,
            events,
            released,
        }
    }

    pub fn principal_ids(&self, value: &str) -> Vec<SessionId> {
        self.repo
            .find_by_principal_name(value)
            .into_keys()
            .collect()
    }

    pub fn release_count(&self) -> usize {
        self.released.lock().len()
    }
}

/// Destruction listener counting its invocations.
#[derive(Default)]
pub struct CountingListener(pub AtomicUsize);

impl CountingListener {
    pub fn calls(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl sg_sessions::DestructionListener for CountingListener {
    fn on_destroy(
        &self,
        _name: &str,
        _session: &dyn sg_sessions::SessionView,
    ) -> sg_domain::error::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
