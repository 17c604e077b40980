//! The per-session handle given to request code.
//!
//! A facade owns the session record, the suspended batch it was loaded
//! under, and a one-shot release action.  Every operation resumes the batch
//! for its duration.  [`SessionFacade::close`] and
//! [`SessionFacade::invalidate`] both swap the state from Open to Released
//! under the facade lock; the caller that performs the swap does the final
//! commit, everyone after it is a no-op.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use sg_domain::error::{Error, Result};
use sg_domain::trace::TraceEvent;

use crate::attribute::AttributeValue;
use crate::batch::{Batch, BatchToken};
use crate::events::SessionEvent;
use crate::index::{diff, resolve_indexes};
use crate::record::{RecordView, SessionId, SessionMetadata, SessionRecord, SessionSnapshot};
use crate::repository::Shared;

/// Runs once, with the session's id at release time.
pub type ReleaseAction = Box<dyn FnOnce(&SessionId) + Send>;

pub struct SessionFacade {
    shared: Arc<Shared>,
    id: RwLock<SessionId>,
    state: Mutex<FacadeState>,
}

enum FacadeState {
    Open(OpenSession),
    Released,
}

struct OpenSession {
    record: Box<dyn SessionRecord>,
    batch: BatchToken,
    release: ReleaseAction,
    /// Start of the access interval committed on close.
    start: DateTime<Utc>,
}

impl SessionFacade {
    /// Wrap `record`, loaded under the still-Active `batch`, and suspend
    /// the batch.
    pub(crate) fn open(
        shared: Arc<Shared>,
        record: Box<dyn SessionRecord>,
        batch: Batch,
        release: ReleaseAction,
    ) -> Self {
        let metadata = record.metadata(&batch);
        // A session that never committed an access interval is closing for
        // the first time: its interval starts at creation.
        let start = if metadata.is_new() {
            metadata.creation_time
        } else {
            Utc::now()
        };
        let id = record.id().clone();
        Self {
            shared,
            id: RwLock::new(id),
            state: Mutex::new(FacadeState::Open(OpenSession {
                record,
                batch: batch.suspend(),
                release,
                start,
            })),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id.read().clone()
    }

    pub fn is_released(&self) -> bool {
        matches!(*self.state.lock(), FacadeState::Released)
    }

    // ── attributes ──────────────────────────────────────────────────

    pub fn attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        self.read(|record, batch| record.attribute(batch, name))
    }

    pub fn attribute_names(&self) -> Result<Vec<String>> {
        self.read(|record, batch| record.attribute_names(batch))
    }

    /// Set `name`, keeping every secondary index in step.  Returns the
    /// previous value.
    pub fn set_attribute(
        &self,
        name: &str,
        value: impl Into<AttributeValue>,
    ) -> Result<Option<AttributeValue>> {
        let value = value.into();
        self.mutate(name, |record, batch| record.set_attribute(batch, name, value))
    }

    pub fn remove_attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        self.mutate(name, |record, batch| record.remove_attribute(batch, name))
    }

    // ── metadata ────────────────────────────────────────────────────

    pub fn metadata(&self) -> Result<SessionMetadata> {
        self.read(|record, batch| record.metadata(batch))
    }

    pub fn creation_time(&self) -> Result<DateTime<Utc>> {
        Ok(self.metadata()?.creation_time)
    }

    pub fn last_accessed_time(&self) -> Result<DateTime<Utc>> {
        Ok(self.metadata()?.last_accessed_time())
    }

    pub fn max_idle(&self) -> Result<Option<Duration>> {
        Ok(self.metadata()?.max_idle)
    }

    pub fn set_max_idle(&self, max_idle: Option<Duration>) -> Result<()> {
        self.with_open(|open| {
            let OpenSession { record, batch, .. } = open;
            batch.scoped(|b| record.set_max_idle(b, max_idle))
        })
    }

    pub fn is_new(&self) -> Result<bool> {
        Ok(self.metadata()?.is_new())
    }

    /// `false` once released or once the underlying record was invalidated.
    pub fn is_valid(&self) -> bool {
        self.read(|record, batch| record.is_valid(batch))
            .unwrap_or(false)
    }

    /// Detached copy of the current state.
    pub fn snapshot(&self) -> Result<SessionSnapshot> {
        self.read(|record, batch| RecordView::new(record, batch).snapshot())
    }

    // ── identity ────────────────────────────────────────────────────

    /// Move the session to a freshly generated id.
    ///
    /// Attributes, max idle and last access are copied onto a new record,
    /// the old record is invalidated, and only then is every resolved
    /// index flipped from the old id to the new one (new id added first).
    /// If building the replacement fails, the replacement is invalidated
    /// and the error returned; the session keeps its old id.
    pub fn change_id(&self) -> Result<SessionId> {
        let shared = self.shared.clone();
        self.with_open(|open| {
            let old_id = open.record.id().clone();
            let new_id = shared.store.next_id();

            let OpenSession { record, batch, .. } = open;
            let (replacement, indexes) = batch.scoped(|b| -> Result<_> {
                let indexes =
                    resolve_indexes(&shared.resolvers, &RecordView::new(record.as_ref(), b));
                let mut replacement = shared.store.create(b, &new_id)?;
                let built = copy_record(record.as_ref(), replacement.as_mut(), b)
                    .and_then(|()| record.invalidate(b));
                if let Err(e) = built {
                    if let Err(inv) = replacement.invalidate(b) {
                        tracing::warn!(
                            session_id = %new_id,
                            error = %inv,
                            "failed to invalidate partial replacement session"
                        );
                    }
                    return Err(e);
                }
                Ok((replacement, indexes))
            })?;

            *record = replacement;
            *self.id.write() = new_id.clone();

            for (index, value) in &indexes {
                if let Err(e) = shared.indexes.reassign(index, value, &old_id, &new_id) {
                    tracing::error!(
                        index = %index,
                        old_session_id = %old_id,
                        new_session_id = %new_id,
                        error = %e,
                        "failed to move index entry to new session id"
                    );
                }
            }

            TraceEvent::SessionIdChanged {
                old_session_id: old_id.to_string(),
                new_session_id: new_id.to_string(),
                indexes: indexes.len(),
            }
            .emit();
            Ok(new_id)
        })
    }

    // ── end of life ─────────────────────────────────────────────────

    /// Commit the access interval and release the session.  Returns `true`
    /// for the call that actually performed the release.  Failures are
    /// logged, never returned.
    pub fn close(&self) -> bool {
        let Some(open) = self.take_open() else {
            return false;
        };
        let OpenSession {
            mut record,
            batch,
            release,
            start,
        } = open;
        let id = record.id().clone();
        let batch = batch.resume();

        let written = if record.is_valid(&batch) {
            let end = Utc::now();
            record
                .set_last_access(&batch, start, end)
                .map(|()| end.signed_duration_since(start).num_milliseconds())
        } else {
            Ok(0)
        };

        match written {
            Ok(access_ms) => match batch.close() {
                Ok(()) => TraceEvent::SessionClosed {
                    session_id: id.to_string(),
                    access_ms,
                }
                .emit(),
                Err(e) => {
                    tracing::error!(session_id = %id, error = %e, "failed to commit session")
                }
            },
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "failed to record session access");
                batch.discard();
            }
        }

        run_release(release, &id);
        true
    }

    /// Destroy the session: notify listeners, drop its index entries,
    /// invalidate the record and release.  Returns `true` for the call that
    /// actually performed the release.  Failures are logged, never
    /// returned.  A record already invalidated elsewhere (expired, or
    /// deleted by another request) is only released.
    pub fn invalidate(&self) -> bool {
        let Some(open) = self.take_open() else {
            return false;
        };
        let OpenSession {
            mut record,
            batch,
            release,
            ..
        } = open;
        let id = record.id().clone();
        let batch = batch.resume();

        // Already expired or deleted through another handle: its end of life
        // has been announced once, only the release is left.
        if !record.is_valid(&batch) {
            tracing::debug!(session_id = %id, "session already invalid; skipping destroy");
            batch.discard();
            run_release(release, &id);
            return true;
        }

        self.shared
            .notifier
            .accept(&RecordView::new(record.as_ref(), &batch), SessionEvent::destroyed);

        match record.invalidate(&batch) {
            Ok(()) => {
                if let Err(e) = batch.close() {
                    tracing::error!(session_id = %id, error = %e, "failed to commit invalidation");
                }
            }
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "failed to invalidate session");
                batch.discard();
            }
        }

        run_release(release, &id);
        true
    }

    // ── helpers ─────────────────────────────────────────────────────

    fn take_open(&self) -> Option<OpenSession> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, FacadeState::Released) {
            FacadeState::Open(open) => Some(open),
            FacadeState::Released => {
                tracing::trace!(session_id = %self.id(), "session already released");
                None
            }
        }
    }

    fn with_open<R>(&self, f: impl FnOnce(&mut OpenSession) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock();
        match &mut *state {
            FacadeState::Open(open) => f(open),
            FacadeState::Released => Err(Error::SessionReleased(self.id().to_string())),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&dyn SessionRecord, &Batch) -> R) -> Result<R> {
        self.with_open(|open| {
            let OpenSession { record, batch, .. } = open;
            Ok(batch.scoped(|b| f(record.as_ref(), b)))
        })
    }

    /// Apply an attribute write and bring the indexes in line with it.
    fn mutate(
        &self,
        name: &str,
        write: impl FnOnce(&mut dyn SessionRecord, &Batch) -> Result<Option<AttributeValue>>,
    ) -> Result<Option<AttributeValue>> {
        let shared = self.shared.clone();
        self.with_open(|open| {
            let OpenSession { record, batch, .. } = open;
            let (previous, changes) = batch.scoped(|b| -> Result<_> {
                if !record.is_valid(b) {
                    return Err(Error::SessionInvalid(record.id().to_string()));
                }
                let before =
                    resolve_indexes(&shared.resolvers, &RecordView::new(record.as_ref(), b));
                let previous = write(record.as_mut(), b)?;
                let after =
                    resolve_indexes(&shared.resolvers, &RecordView::new(record.as_ref(), b));
                Ok((previous, diff(&before, &after)))
            })?;

            let id = record.id().clone();
            for change in &changes {
                shared.indexes.apply(change, &id).map_err(|e| {
                    tracing::warn!(
                        session_id = %id,
                        attribute = %name,
                        index = %change.index,
                        error = %e,
                        "failed to update index"
                    );
                    e
                })?;
            }
            Ok(previous)
        })
    }
}

impl Drop for SessionFacade {
    fn drop(&mut self) {
        if let FacadeState::Open(open) = self.state.get_mut() {
            tracing::debug!(
                session_id = %self.id.get_mut(),
                batch = open.batch.batch_id(),
                "session dropped without release"
            );
        }
    }
}

fn copy_record(source: &dyn SessionRecord, target: &mut dyn SessionRecord, batch: &Batch) -> Result<()> {
    for name in source.attribute_names(batch) {
        if let Some(value) = source.attribute(batch, &name) {
            target.set_attribute(batch, &name, value)?;
        }
    }
    let metadata = source.metadata(batch);
    target.set_max_idle(batch, metadata.max_idle)?;
    if let Some(access) = metadata.last_access {
        target.set_last_access(batch, access.start, access.end)?;
    }
    Ok(())
}

fn run_release(release: ReleaseAction, id: &SessionId) {
    if catch_unwind(AssertUnwindSafe(|| release(id))).is_err() {
        tracing::error!(session_id = %id, "session release callback panicked");
    }
}
