//! Repository scenarios against the in-memory store: index consistency,
//! idempotent release, the request cache, id changes, destroy isolation and
//! expiration.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::{CountingListener, Fixture};
use sg_domain::config::{IndexConfig, SessionsConfig};
use sg_domain::error::{Error, Result};
use sg_sessions::{
    AttributeIndexResolver, AttributeValue, DestructionListener, ExecutionContext,
    MemoryIndexManager, MemorySessionStore, RequestContext, SessionEventKind, SessionId,
    SessionRecord, SessionRepository, SessionStore, SessionView, PRINCIPAL_NAME_INDEX,
};

#[test]
fn principal_index_follows_attribute_changes_until_delete() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();

    let session = fx.repo.create().unwrap();
    let id = session.id();
    session.set_attribute("user", "alice").unwrap();
    assert_eq!(fx.principal_ids("alice"), vec![id.clone()]);

    session.set_attribute("user", "bob").unwrap();
    assert!(fx.principal_ids("alice").is_empty());
    assert_eq!(fx.principal_ids("bob"), vec![id.clone()]);
    fx.repo.save(&mut ctx, &session);

    assert!(fx.repo.delete(&mut ctx, &id));
    assert!(fx.principal_ids("bob").is_empty());
    assert!(!fx.store.contains(&id));
    assert_eq!(fx.principal.entry_count(), 0);
}

#[test]
fn find_by_index_returns_snapshots() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();
    let a = fx.repo.create().unwrap();
    let b = fx.repo.create().unwrap();
    a.set_attribute("user", "alice").unwrap();
    b.set_attribute("user", "alice").unwrap();
    b.set_attribute("cart", serde_json::json!({"items": 3})).unwrap();
    fx.repo.save(&mut ctx, &a);
    fx.repo.save(&mut ctx, &b);

    let found = fx.repo.find_by_index("principal", "alice");
    assert_eq!(found.len(), 2);
    let snap = &found[&b.id()];
    assert_eq!(snap.attribute("cart").unwrap().value()["items"], 3);
    assert!(!snap.metadata().is_new());
}

#[test]
fn removing_the_indexed_attribute_drops_the_mapping() {
    let fx = Fixture::new();
    let session = fx.repo.create().unwrap();
    session.set_attribute("user", "alice").unwrap();
    let previous = session.remove_attribute("user").unwrap();
    assert_eq!(previous.unwrap().as_str(), Some("alice"));
    assert!(fx.principal_ids("alice").is_empty());
    assert!(session.attribute("user").unwrap().is_none());
}

#[test]
fn setting_the_same_index_value_touches_no_index_batch() {
    let fx = Fixture::new();
    let session = fx.repo.create().unwrap();
    session.set_attribute("user", "alice").unwrap();
    let batches = fx.principal.stats().batches();
    session.set_attribute("user", "alice").unwrap();
    session.set_attribute("theme", "dark").unwrap();
    assert_eq!(fx.principal.stats().batches(), batches);
}

#[test]
fn repeated_close_commits_once() {
    let fx = Fixture::new();
    let session = fx.repo.create().unwrap();
    assert_eq!(fx.store.stats().commits(), 0);

    assert!(session.close());
    assert!(!session.close());
    assert!(!session.invalidate());
    assert!(!session.close());

    assert_eq!(fx.store.stats().commits(), 1);
    assert_eq!(fx.store.stats().rollbacks(), 0);
    assert_eq!(fx.release_count(), 1);
    assert_eq!(fx.events.kinds(), vec![SessionEventKind::Created]);
}

#[test]
fn repeated_invalidate_destroys_once() {
    let fx = Fixture::new();
    let session = fx.repo.create().unwrap();
    let listener = Arc::new(CountingListener::default());
    session
        .set_attribute("tracker", AttributeValue::from("x").with_listener(listener.clone()))
        .unwrap();

    assert!(session.invalidate());
    assert!(!session.invalidate());
    assert!(!session.close());

    assert_eq!(listener.calls(), 1);
    assert_eq!(fx.events.count(SessionEventKind::Destroyed), 1);
    assert_eq!(fx.store.stats().commits(), 1);
    assert_eq!(fx.release_count(), 1);
}

#[test]
fn released_handle_is_unusable() {
    let fx = Fixture::new();
    let session = fx.repo.create().unwrap();
    session.close();

    assert!(session.is_released());
    assert!(!session.is_valid());
    assert!(matches!(
        session.set_attribute("user", "alice"),
        Err(Error::SessionReleased(_))
    ));
    assert!(matches!(session.attribute("user"), Err(Error::SessionReleased(_))));
    assert!(session.change_id().is_err());
}

#[test]
fn first_close_starts_interval_at_creation() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();
    let session = fx.repo.create().unwrap();
    let id = session.id();
    assert!(session.is_new().unwrap());
    let created = session.creation_time().unwrap();
    fx.repo.save(&mut ctx, &session);

    let again = fx.repo.find(&mut ctx, &id).unwrap();
    let first = again.metadata().unwrap().last_access.unwrap();
    assert_eq!(first.start, created);
    assert!(!again.is_new().unwrap());
    assert_eq!(again.last_accessed_time().unwrap(), first.end);
    fx.repo.save(&mut ctx, &again);

    let third = fx.repo.find(&mut ctx, &id).unwrap();
    let second = third.metadata().unwrap().last_access.unwrap();
    assert!(second.start >= first.end);
}

#[test]
fn new_sessions_get_default_max_idle() {
    let fx = Fixture::with_max_idle(Some(Duration::from_secs(90)));
    let session = fx.repo.create().unwrap();
    assert_eq!(session.max_idle().unwrap(), Some(Duration::from_secs(90)));
    session.set_max_idle(None).unwrap();
    assert_eq!(session.max_idle().unwrap(), None);
}

#[test]
fn find_twice_in_one_request_hits_store_once() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();
    let created = fx.repo.create().unwrap();
    let id = created.id();
    fx.repo.save(&mut ctx, &created);

    let first = fx.repo.find(&mut ctx, &id).unwrap();
    let second = fx.repo.find(&mut ctx, &id).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fx.store.stats().lookups(), 1);
}

#[test]
fn save_clears_the_request_cache() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();
    let created = fx.repo.create().unwrap();
    let id = created.id();
    fx.repo.save(&mut ctx, &created);

    let first = fx.repo.find(&mut ctx, &id).unwrap();
    fx.repo.save(&mut ctx, &first);
    assert!(ctx.is_empty());

    let second = fx.repo.find(&mut ctx, &id).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(fx.store.stats().lookups(), 2);
}

#[test]
fn delete_of_unknown_id_still_clears_the_cache() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();
    let created = fx.repo.create().unwrap();
    let id = created.id();
    fx.repo.save(&mut ctx, &created);

    let _cached = fx.repo.find(&mut ctx, &id).unwrap();
    assert!(!ctx.is_empty());
    assert!(!fx.repo.delete(&mut ctx, &SessionId::from("missing")));
    assert!(ctx.is_empty());

    fx.repo.find(&mut ctx, &id).unwrap();
    assert_eq!(fx.store.stats().lookups(), 3);
}

#[test]
fn cache_can_be_disabled() {
    let store = Arc::new(MemorySessionStore::new());
    let repo = SessionRepository::builder(store.clone())
        .request_cache(false)
        .build()
        .unwrap();
    let mut ctx = RequestContext::new();
    let created = repo.create().unwrap();
    let id = created.id();
    repo.save(&mut ctx, &created);

    let a = repo.find(&mut ctx, &id).unwrap();
    let b = repo.find(&mut ctx, &id).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert!(ctx.is_empty());
    assert_eq!(store.stats().lookups(), 2);
}

#[test]
fn change_id_moves_session_and_index() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();
    let session = fx.repo.create().unwrap();
    session.set_attribute("user", "alice").unwrap();
    session.set_attribute("cart", "3 items").unwrap();
    let old_id = session.id();

    let new_id = session.change_id().unwrap();
    assert_ne!(new_id, old_id);
    assert_eq!(session.id(), new_id);
    assert_eq!(fx.principal_ids("alice"), vec![new_id.clone()]);
    assert!(!fx.store.contains(&old_id));
    assert_eq!(session.attribute("cart").unwrap().unwrap().as_str(), Some("3 items"));
    assert_eq!(session.max_idle().unwrap(), Some(Duration::from_secs(30 * 60)));

    fx.repo.save(&mut ctx, &session);
    assert!(fx.repo.find(&mut ctx, &old_id).is_none());
    let found = fx.repo.find(&mut ctx, &new_id).unwrap();
    assert_eq!(found.attribute("user").unwrap().unwrap().as_str(), Some("alice"));
    assert_eq!(*fx.released.lock(), vec![new_id]);
}

#[test]
fn failed_change_id_keeps_the_old_session() {
    let fx = Fixture::new();
    let session = fx.repo.create().unwrap();
    session.set_attribute("user", "alice").unwrap();
    let id = session.id();

    fx.store.fail_next_create();
    assert!(matches!(session.change_id(), Err(Error::StoreUnavailable(_))));
    assert_eq!(session.id(), id);
    assert_eq!(fx.principal_ids("alice"), vec![id]);
    session.set_attribute("user", "bob").unwrap();
    assert_eq!(fx.store.len(), 1);
}

struct FailingListener;

impl DestructionListener for FailingListener {
    fn on_destroy(&self, name: &str, _session: &dyn SessionView) -> Result<()> {
        Err(Error::Other(format!("{name}: cannot release")))
    }
}

#[test]
fn failing_listener_does_not_block_destroy() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();
    let session = fx.repo.create().unwrap();
    let id = session.id();
    let counting = Arc::new(CountingListener::default());
    session
        .set_attribute("a", AttributeValue::from("x").with_listener(Arc::new(FailingListener)))
        .unwrap();
    session
        .set_attribute("b", AttributeValue::from("y").with_listener(counting.clone()))
        .unwrap();
    session.set_attribute("user", "alice").unwrap();
    fx.repo.save(&mut ctx, &session);

    assert!(fx.repo.delete(&mut ctx, &id));
    assert_eq!(counting.calls(), 1);
    assert!(fx.principal_ids("alice").is_empty());
    assert!(!fx.store.contains(&id));
}

#[test]
fn create_failure_discards_batch_and_propagates() {
    let fx = Fixture::new();
    fx.store.fail_next_create();
    let err = fx.repo.create().err().unwrap();
    assert!(matches!(err, Error::StoreUnavailable(_)));
    assert_eq!(fx.store.stats().rollbacks(), 1);
    assert!(fx.store.is_empty());
    assert!(fx.events.kinds().is_empty());
}

#[test]
fn lookup_outage_degrades_to_not_found() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();
    let created = fx.repo.create().unwrap();
    let id = created.id();
    fx.repo.save(&mut ctx, &created);

    fx.store.set_fail_lookups(true);
    assert!(fx.repo.find(&mut ctx, &id).is_none());
    fx.store.set_fail_lookups(false);
    assert!(fx.repo.find(&mut ctx, &id).is_some());
}

#[test]
fn find_by_index_skips_sessions_gone_from_the_store() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();
    let session = fx.repo.create().unwrap();
    session.set_attribute("user", "alice").unwrap();
    let id = session.id();
    fx.repo.save(&mut ctx, &session);

    // Remove the record behind the index's back.
    let batch = fx.store.begin().unwrap();
    let mut record = fx.store.find(&batch, &id).unwrap().unwrap();
    record.invalidate(&batch).unwrap();
    batch.close().unwrap();

    assert!(fx.repo.find_by_index("principal", "alice").is_empty());
    assert!(fx.repo.find_by_index("no-such-index", "alice").is_empty());
    assert!(fx.repo.find_by_index("principal", "nobody").is_empty());
}

#[test]
fn expired_sessions_are_not_found() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();
    let created = fx.repo.create().unwrap();
    let id = created.id();
    fx.repo.save(&mut ctx, &created);

    fx.store.backdate(&id, Utc::now() - chrono::Duration::hours(1));
    assert!(fx.repo.find(&mut ctx, &id).is_none());
}

#[test]
fn expiration_sweep_notifies_and_cleans_up() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();
    let session = fx.repo.create().unwrap();
    let id = session.id();
    let listener = Arc::new(CountingListener::default());
    session
        .set_attribute("tracker", AttributeValue::from("t").with_listener(listener.clone()))
        .unwrap();
    session.set_attribute("user", "alice").unwrap();
    fx.repo.save(&mut ctx, &session);

    fx.store.backdate(&id, Utc::now() - chrono::Duration::hours(2));
    let expired = fx.store.expired_ids(Utc::now());
    assert_eq!(expired, vec![id.clone()]);
    for id in &expired {
        fx.repo.expire(id);
    }

    assert_eq!(listener.calls(), 1);
    assert_eq!(fx.events.count(SessionEventKind::Expired), 1);
    assert_eq!(fx.events.count(SessionEventKind::Destroyed), 0);
    assert!(fx.principal_ids("alice").is_empty());
    assert!(!fx.store.contains(&id));

    // Already gone: a second report is a no-op.
    fx.repo.expire(&id);
    assert_eq!(listener.calls(), 1);
}

#[test]
fn config_builds_attribute_resolvers() {
    let config = SessionsConfig {
        default_max_idle_secs: 120,
        deployment: "shop".into(),
        request_cache: true,
        indexes: vec![IndexConfig {
            name: "login".into(),
            attribute: "username".into(),
        }],
    };
    let store = Arc::new(MemorySessionStore::new());

    let missing = SessionRepository::builder(store.clone())
        .with_config(&config)
        .build();
    assert!(matches!(missing, Err(Error::UnknownIndex(name)) if name == "login"));

    let repo = SessionRepository::builder(store)
        .with_config(&config)
        .index_manager("login", Arc::new(MemoryIndexManager::new()))
        .build()
        .unwrap();
    let session = repo.create().unwrap();
    session.set_attribute("username", "carol").unwrap();
    assert_eq!(session.max_idle().unwrap(), Some(Duration::from_secs(120)));
    assert_eq!(
        repo.find_by_index("login", "carol").into_keys().collect::<Vec<_>>(),
        vec![session.id()]
    );
}

#[test]
fn invalidating_a_handle_expired_underneath_only_releases_it() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();
    let session = fx.repo.create().unwrap();
    let id = session.id();
    let listener = Arc::new(CountingListener::default());
    session
        .set_attribute("tracker", AttributeValue::from("t").with_listener(listener.clone()))
        .unwrap();
    session.set_attribute("user", "alice").unwrap();
    fx.repo.save(&mut ctx, &session);

    let held = fx.repo.find(&mut ctx, &id).unwrap();
    fx.repo.expire(&id);
    assert!(!held.is_valid());

    assert!(held.invalidate());
    assert_eq!(listener.calls(), 1);
    assert_eq!(fx.events.count(SessionEventKind::Expired), 1);
    assert_eq!(fx.events.count(SessionEventKind::Destroyed), 0);
    assert_eq!(fx.release_count(), 2);
    assert_eq!(fx.store.stats().rollbacks(), 1);
}

#[test]
fn invalidating_a_handle_deleted_by_another_request_only_releases_it() {
    let fx = Fixture::new();
    let mut ctx = RequestContext::new();
    let session = fx.repo.create().unwrap();
    let id = session.id();
    let listener = Arc::new(CountingListener::default());
    session
        .set_attribute("tracker", AttributeValue::from("t").with_listener(listener.clone()))
        .unwrap();
    fx.repo.save(&mut ctx, &session);

    let held = fx.repo.find(&mut ctx, &id).unwrap();
    let mut other = RequestContext::new();
    assert!(fx.repo.delete(&mut other, &id));

    assert!(held.invalidate());
    assert_eq!(listener.calls(), 1);
    assert_eq!(fx.events.count(SessionEventKind::Destroyed), 1);
}

#[test]
fn set_attribute_reports_index_failure() {
    let fx = Fixture::new();
    let session = fx.repo.create().unwrap();
    fx.principal.set_unavailable(true);

    let err = session.set_attribute("user", "alice").unwrap_err();
    assert!(matches!(&err, Error::Index { index, .. } if index == PRINCIPAL_NAME_INDEX));

    fx.principal.set_unavailable(false);
    assert_eq!(session.attribute("user").unwrap().unwrap().as_str(), Some("alice"));
    assert!(fx.principal_ids("alice").is_empty());
}

#[test]
fn failed_commit_on_close_is_swallowed() {
    let fx = Fixture::new();
    let session = fx.repo.create().unwrap();
    session.set_attribute("user", "alice").unwrap();
    fx.store.fail_next_commit();

    assert!(session.close());
    assert!(!session.close());
    assert_eq!(fx.store.stats().failed_commits(), 1);
    assert_eq!(fx.store.stats().commits(), 0);
    assert_eq!(fx.release_count(), 1);
}

#[test]
fn failed_commit_on_invalidate_is_swallowed() {
    let fx = Fixture::new();
    let session = fx.repo.create().unwrap();
    session.set_attribute("user", "alice").unwrap();
    fx.store.fail_next_commit();

    assert!(session.invalidate());
    assert!(!session.invalidate());
    assert_eq!(fx.store.stats().failed_commits(), 1);
    assert_eq!(fx.release_count(), 1);
    assert_eq!(fx.events.count(SessionEventKind::Destroyed), 1);
    assert!(fx.principal_ids("alice").is_empty());
}

/// Marks itself active for the duration of each task it runs.
#[derive(Default)]
struct RecordingContext {
    active: Arc<AtomicBool>,
    runs: AtomicUsize,
}

impl ExecutionContext for RecordingContext {
    fn run(&self, task: &mut dyn FnMut()) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        task();
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Remembers whether the context was active when it was notified.
struct ContextAwareListener {
    active: Arc<AtomicBool>,
    saw_context: AtomicBool,
}

impl DestructionListener for ContextAwareListener {
    fn on_destroy(&self, _name: &str, _session: &dyn SessionView) -> Result<()> {
        self.saw_context
            .store(self.active.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn expire_runs_under_the_execution_context() {
    let store = Arc::new(MemorySessionStore::new());
    let principal = Arc::new(MemoryIndexManager::new());
    let context = Arc::new(RecordingContext::default());
    let repo = SessionRepository::builder(store.clone())
        .resolver(Arc::new(AttributeIndexResolver::new(PRINCIPAL_NAME_INDEX, "user")))
        .index_manager(PRINCIPAL_NAME_INDEX, principal.clone())
        .execution_context(context.clone())
        .build()
        .unwrap();

    let mut ctx = RequestContext::new();
    let session = repo.create().unwrap();
    let id = session.id();
    let listener = Arc::new(ContextAwareListener {
        active: context.active.clone(),
        saw_context: AtomicBool::new(false),
    });
    session
        .set_attribute("tracker", AttributeValue::from("t").with_listener(listener.clone()))
        .unwrap();
    session.set_attribute("user", "alice").unwrap();
    repo.save(&mut ctx, &session);
    assert_eq!(context.runs.load(Ordering::SeqCst), 0);

    repo.expire(&id);

    assert_eq!(context.runs.load(Ordering::SeqCst), 1);
    assert!(listener.saw_context.load(Ordering::SeqCst));
    assert!(!context.active.load(Ordering::SeqCst));
    assert!(repo.find_by_principal_name("alice").is_empty());
    assert!(!store.contains(&id));
    assert_eq!(principal.entry_count(), 0);
}
