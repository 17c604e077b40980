//! Session repository: the entry point for request code.
//!
//! Creates and finds sessions (wrapping them in [`SessionFacade`]s), commits
//! them on save, destroys them on delete, answers secondary-index queries
//! and handles expiration reported by the store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use sg_domain::config::SessionsConfig;
use sg_domain::error::{Error, Result};
use sg_domain::trace::TraceEvent;

use crate::batch::Batch;
use crate::events::{
    DeploymentContext, DirectContext, ExecutionContext, SessionEvent, SessionEventSink,
    TracingEventSink,
};
use crate::facade::{ReleaseAction, SessionFacade};
use crate::index::{AttributeIndexResolver, IndexManagers, IndexResolver};
use crate::notifier::DestroyNotifier;
use crate::record::{RecordView, SessionId, SessionRecord, SessionSnapshot};
use crate::request::RequestContext;
use crate::store::{IndexManager, SessionStore};

/// Index name conventionally holding the authenticated principal.
pub const PRINCIPAL_NAME_INDEX: &str = "principal";

type ReleaseHook = Arc<dyn Fn(&SessionId) + Send + Sync>;

/// State shared between the repository and every facade it hands out.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) resolvers: Arc<[Arc<dyn IndexResolver>]>,
    pub(crate) indexes: IndexManagers,
    pub(crate) notifier: DestroyNotifier,
    events: Arc<dyn SessionEventSink>,
    context: Arc<dyn ExecutionContext>,
    default_max_idle: Option<Duration>,
    request_cache: bool,
    on_release: Option<ReleaseHook>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionRepositoryBuilder {
    store: Arc<dyn SessionStore>,
    resolvers: Vec<Arc<dyn IndexResolver>>,
    indexes: IndexManagers,
    events: Arc<dyn SessionEventSink>,
    context: Arc<dyn ExecutionContext>,
    default_max_idle: Option<Duration>,
    request_cache: bool,
    on_release: Option<ReleaseHook>,
}

impl SessionRepositoryBuilder {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            resolvers: Vec::new(),
            indexes: IndexManagers::new(),
            events: Arc::new(TracingEventSink),
            context: Arc::new(DirectContext),
            default_max_idle: None,
            request_cache: true,
            on_release: None,
        }
    }

    /// Apply the `[sessions]` config: one attribute resolver per configured
    /// index, default max idle, deployment context and cache toggle.  Index
    /// managers for the configured names still have to be supplied.
    pub fn with_config(mut self, config: &SessionsConfig) -> Self {
        for index in &config.indexes {
            self.resolvers.push(Arc::new(AttributeIndexResolver::new(
                index.name.clone(),
                index.attribute.clone(),
            )));
        }
        self.default_max_idle = match config.default_max_idle_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        self.context = Arc::new(DeploymentContext::new(config.deployment.clone()));
        self.request_cache = config.request_cache;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn IndexResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn index_manager(mut self, name: impl Into<String>, manager: Arc<dyn IndexManager>) -> Self {
        self.indexes.insert(name, manager);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn SessionEventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn execution_context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.context = context;
        self
    }

    pub fn default_max_idle(mut self, max_idle: Option<Duration>) -> Self {
        self.default_max_idle = max_idle;
        self
    }

    pub fn request_cache(mut self, enabled: bool) -> Self {
        self.request_cache = enabled;
        self
    }

    /// Called once per session when its facade is released (saved or
    /// invalidated).
    pub fn on_release(mut self, hook: impl Fn(&SessionId) + Send + Sync + 'static) -> Self {
        self.on_release = Some(Arc::new(hook));
        self
    }

    /// Fails when a resolver names an index with no registered manager.
    pub fn build(self) -> Result<SessionRepository> {
        for resolver in &self.resolvers {
            if !self.indexes.contains(resolver.index_name()) {
                return Err(Error::UnknownIndex(resolver.index_name().to_owned()));
            }
        }
        let resolvers: Arc<[Arc<dyn IndexResolver>]> = self.resolvers.into();
        let notifier =
            DestroyNotifier::new(self.events.clone(), resolvers.clone(), self.indexes.clone());

        tracing::info!(
            resolvers = resolvers.len(),
            indexes = self.indexes.len(),
            max_idle_secs = self.default_max_idle.map(|d| d.as_secs()).unwrap_or(0),
            request_cache = self.request_cache,
            "session repository ready"
        );

        Ok(SessionRepository {
            shared: Arc::new(Shared {
                store: self.store,
                resolvers,
                indexes: self.indexes,
                notifier,
                events: self.events,
                context: self.context,
                default_max_idle: self.default_max_idle,
                request_cache: self.request_cache,
                on_release: self.on_release,
            }),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repository
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct SessionRepository {
    shared: Arc<Shared>,
}

impl SessionRepository {
    pub fn builder(store: Arc<dyn SessionStore>) -> SessionRepositoryBuilder {
        SessionRepositoryBuilder::new(store)
    }

    /// Create a new session.  A store failure discards the batch and is
    /// returned to the caller.
    pub fn create(&self) -> Result<Arc<SessionFacade>> {
        let store = &self.shared.store;
        let id = store.next_id();
        let batch = store.begin()?;

        let record = match self.create_record(&batch, &id) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "session creation failed");
                batch.discard();
                return Err(e);
            }
        };

        let snapshot = RecordView::new(record.as_ref(), &batch).snapshot();
        let facade = SessionFacade::open(self.shared.clone(), record, batch, self.release_action());
        self.shared.events.publish(SessionEvent::created(snapshot));
        TraceEvent::SessionCreated {
            session_id: id.to_string(),
        }
        .emit();
        Ok(Arc::new(facade))
    }

    /// Look a session up.  Absent, invalid or expired sessions are `None`,
    /// and so is a store failure: the caller simply gets a new session.
    pub fn find(&self, ctx: &mut RequestContext, id: &SessionId) -> Option<Arc<SessionFacade>> {
        if self.shared.request_cache {
            if let Some(facade) = ctx.lookup(id) {
                TraceEvent::SessionResolved {
                    session_id: id.to_string(),
                    cache_hit: true,
                }
                .emit();
                return Some(facade);
            }
        }

        let store = &self.shared.store;
        let batch = match store.begin() {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "session lookup failed");
                return None;
            }
        };
        let record = match store.find(&batch, id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                batch.discard();
                return None;
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "session lookup failed");
                batch.discard();
                return None;
            }
        };
        if !record.is_valid(&batch) || record.metadata(&batch).is_expired(Utc::now()) {
            tracing::debug!(session_id = %id, "ignoring invalid or expired session");
            batch.discard();
            return None;
        }

        let facade = Arc::new(SessionFacade::open(
            self.shared.clone(),
            record,
            batch,
            self.release_action(),
        ));
        if self.shared.request_cache {
            ctx.remember(facade.clone());
        }
        TraceEvent::SessionResolved {
            session_id: id.to_string(),
            cache_hit: false,
        }
        .emit();
        Some(facade)
    }

    /// Destroy a session.  The request cache is cleared whether or not the
    /// session existed.  Returns `true` if a session was destroyed.
    pub fn delete(&self, ctx: &mut RequestContext, id: &SessionId) -> bool {
        let destroyed = match self.find(ctx, id) {
            Some(facade) => facade.invalidate(),
            None => false,
        };
        ctx.clear();
        destroyed
    }

    /// Commit the request's changes to `session` and release it.
    pub fn save(&self, ctx: &mut RequestContext, session: &SessionFacade) {
        ctx.clear();
        session.close();
    }

    /// Read-only snapshots of every session indexed under `value`.
    ///
    /// Ids that no longer resolve (expired between the index read and the
    /// session read) are skipped.  Unknown indexes and store failures yield
    /// an empty map.
    pub fn find_by_index(&self, index: &str, value: &str) -> BTreeMap<SessionId, SessionSnapshot> {
        let ids = match self.shared.indexes.sessions(index, value) {
            Ok(ids) => ids,
            Err(Error::UnknownIndex(_)) => {
                tracing::debug!(index = %index, "lookup on unknown index");
                return BTreeMap::new();
            }
            Err(e) => {
                tracing::warn!(index = %index, error = %e, "index lookup failed");
                return BTreeMap::new();
            }
        };
        if ids.is_empty() {
            return BTreeMap::new();
        }

        let store = &self.shared.store;
        let batch = match store.begin() {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(index = %index, error = %e, "session lookup failed");
                return BTreeMap::new();
            }
        };
        let mut sessions = BTreeMap::new();
        for id in ids {
            match store.read_only(&batch, &id) {
                Ok(Some(snapshot)) => {
                    sessions.insert(id, snapshot);
                }
                Ok(None) => {
                    tracing::trace!(session_id = %id, index = %index, "indexed session is gone");
                }
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "failed to read indexed session");
                }
            }
        }
        if let Err(e) = batch.close() {
            tracing::warn!(index = %index, error = %e, "failed to close lookup batch");
        }
        sessions
    }

    pub fn find_by_principal_name(&self, principal: &str) -> BTreeMap<SessionId, SessionSnapshot> {
        self.find_by_index(PRINCIPAL_NAME_INDEX, principal)
    }

    /// Handle a session the store found expired.  Runs under the
    /// configured execution context since there is no request around it.
    pub fn expire(&self, id: &SessionId) {
        let shared = &self.shared;
        shared.context.run(&mut || {
            let batch = match shared.store.begin() {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "expiration lookup failed");
                    return;
                }
            };
            let mut record = match shared.store.find(&batch, id) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    batch.discard();
                    return;
                }
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "expiration lookup failed");
                    batch.discard();
                    return;
                }
            };
            shared
                .notifier
                .accept(&RecordView::new(record.as_ref(), &batch), SessionEvent::expired);
            match record.invalidate(&batch) {
                Ok(()) => {
                    if let Err(e) = batch.close() {
                        tracing::error!(session_id = %id, error = %e, "failed to commit expiration");
                    }
                }
                Err(e) => {
                    tracing::error!(session_id = %id, error = %e, "failed to expire session");
                    batch.discard();
                }
            }
        });
    }

    fn create_record(&self, batch: &Batch, id: &SessionId) -> Result<Box<dyn SessionRecord>> {
        let mut record = self.shared.store.create(batch, id)?;
        if let Some(max_idle) = self.shared.default_max_idle {
            record.set_max_idle(batch, Some(max_idle))?;
        }
        Ok(record)
    }

    fn release_action(&self) -> ReleaseAction {
        let hook = self.shared.on_release.clone();
        Box::new(move |id: &SessionId| {
            if let Some(hook) = hook {
                hook(id);
            }
        })
    }
}
