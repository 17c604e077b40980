//! In-process store and index manager.
//!
//! Non-transactional: writes land immediately and batches only count
//! commits and rollbacks.  Useful for embedding, demos and tests; it also
//! supports failure injection and counts store round-trips.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use sg_domain::error::{Error, Result};

use crate::attribute::AttributeValue;
use crate::batch::{Batch, Transaction};
use crate::record::{AccessInterval, SessionId, SessionMetadata, SessionRecord, SessionSnapshot};
use crate::store::{IndexHandle, IndexManager, SessionStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Instrumentation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Counters shared by a store and every batch it starts, plus the commit
/// failure switch those batches consult.
#[derive(Debug, Default)]
pub struct StoreStats {
    batches: AtomicUsize,
    commits: AtomicUsize,
    failed_commits: AtomicUsize,
    rollbacks: AtomicUsize,
    lookups: AtomicUsize,
    reads: AtomicUsize,
    fail_next_commit: AtomicBool,
}

impl StoreStats {
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn failed_commits(&self) -> usize {
        self.failed_commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// `find` round-trips.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// `read_only` round-trips.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn begin(self: &Arc<Self>) -> Batch {
        self.batches.fetch_add(1, Ordering::SeqCst);
        Batch::begin(Box::new(MemoryTransaction {
            stats: self.clone(),
        }))
    }
}

struct MemoryTransaction {
    stats: Arc<StoreStats>,
}

impl Transaction for MemoryTransaction {
    fn commit(self: Box<Self>) -> Result<()> {
        if self.stats.fail_next_commit.swap(false, Ordering::SeqCst) {
            self.stats.failed_commits.fetch_add(1, Ordering::SeqCst);
            return Err(Error::StoreUnavailable("commit rejected".into()));
        }
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        self.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct StoredSession {
    attributes: BTreeMap<String, AttributeValue>,
    metadata: SessionMetadata,
    valid: bool,
}

type Sessions = Arc<RwLock<HashMap<SessionId, Arc<RwLock<StoredSession>>>>>;

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Sessions,
    stats: Arc<StoreStats>,
    fail_next_create: AtomicBool,
    fail_lookups: AtomicBool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Make the next `create` fail with `StoreUnavailable`.
    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    /// Make the next batch commit fail with `StoreUnavailable`.  Writes
    /// already applied stay applied.
    pub fn fail_next_commit(&self) {
        self.stats.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make every `find`/`read_only` fail with `StoreUnavailable` until reset.
    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Ids of sessions idle past their max idle at `now`, for an
    /// expiration sweep to hand to the repository.
    pub fn expired_ids(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, entry)| entry.read().metadata.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Rewrite a session's last access, e.g. to simulate idle time.
    pub fn backdate(&self, id: &SessionId, last_access_end: DateTime<Utc>) {
        if let Some(entry) = self.sessions.read().get(id) {
            let mut entry = entry.write();
            let start = entry
                .metadata
                .last_access
                .map(|a| a.start.min(last_access_end))
                .unwrap_or(last_access_end);
            entry.metadata.creation_time = entry.metadata.creation_time.min(start);
            entry.metadata.last_access = Some(AccessInterval {
                start,
                end: last_access_end,
            });
        }
    }

    fn check_lookups(&self) -> Result<()> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("lookups disabled".into()));
        }
        Ok(())
    }
}

impl SessionStore for MemorySessionStore {
    fn next_id(&self) -> SessionId {
        SessionId::new(uuid::Uuid::new_v4().to_string())
    }

    fn begin(&self) -> Result<Batch> {
        Ok(self.stats.begin())
    }

    fn create(&self, batch: &Batch, id: &SessionId) -> Result<Box<dyn SessionRecord>> {
        batch.ensure_active()?;
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(format!("cannot create {id}")));
        }
        let entry = Arc::new(RwLock::new(StoredSession {
            attributes: BTreeMap::new(),
            metadata: SessionMetadata::new(Utc::now()),
            valid: true,
        }));
        self.sessions.write().insert(id.clone(), entry.clone());
        Ok(Box::new(MemorySessionRecord {
            id: id.clone(),
            entry,
            sessions: self.sessions.clone(),
        }))
    }

    fn find(&self, batch: &Batch, id: &SessionId) -> Result<Option<Box<dyn SessionRecord>>> {
        batch.ensure_active()?;
        self.stats.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_lookups()?;
        let entry = self.sessions.read().get(id).cloned();
        Ok(entry.map(|entry| {
            Box::new(MemorySessionRecord {
                id: id.clone(),
                entry,
                sessions: self.sessions.clone(),
            }) as Box<dyn SessionRecord>
        }))
    }

    fn read_only(&self, batch: &Batch, id: &SessionId) -> Result<Option<SessionSnapshot>> {
        batch.ensure_active()?;
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        self.check_lookups()?;
        let sessions = self.sessions.read();
        Ok(sessions.get(id).map(|entry| {
            let entry = entry.read();
            SessionSnapshot::new(id.clone(), entry.attributes.clone(), entry.metadata.clone())
        }))
    }
}

struct MemorySessionRecord {
    id: SessionId,
    entry: Arc<RwLock<StoredSession>>,
    sessions: Sessions,
}

impl MemorySessionRecord {
    fn write<R>(&self, batch: &Batch, f: impl FnOnce(&mut StoredSession) -> R) -> Result<R> {
        batch.ensure_active()?;
        let mut entry = self.entry.write();
        if !entry.valid {
            return Err(Error::SessionInvalid(self.id.to_string()));
        }
        Ok(f(&mut entry))
    }
}

impl SessionRecord for MemorySessionRecord {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn metadata(&self, _batch: &Batch) -> SessionMetadata {
        self.entry.read().metadata.clone()
    }

    fn attribute(&self, _batch: &Batch, name: &str) -> Option<AttributeValue> {
        self.entry.read().attributes.get(name).cloned()
    }

    fn attribute_names(&self, _batch: &Batch) -> Vec<String> {
        self.entry.read().attributes.keys().cloned().collect()
    }

    fn is_valid(&self, _batch: &Batch) -> bool {
        self.entry.read().valid
    }

    fn set_attribute(
        &mut self,
        batch: &Batch,
        name: &str,
        value: AttributeValue,
    ) -> Result<Option<AttributeValue>> {
        self.write(batch, |s| s.attributes.insert(name.to_owned(), value))
    }

    fn remove_attribute(&mut self, batch: &Batch, name: &str) -> Result<Option<AttributeValue>> {
        self.write(batch, |s| s.attributes.remove(name))
    }

    fn set_max_idle(&mut self, batch: &Batch, max_idle: Option<Duration>) -> Result<()> {
        self.write(batch, |s| s.metadata.max_idle = max_idle)
    }

    fn set_last_access(
        &mut self,
        batch: &Batch,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        self.write(batch, |s| {
            s.metadata.last_access = Some(AccessInterval { start, end })
        })
    }

    fn invalidate(&mut self, batch: &Batch) -> Result<()> {
        self.write(batch, |s| s.valid = false)?;
        self.sessions.write().remove(&self.id);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Index manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type Entries = Arc<RwLock<HashMap<String, BTreeSet<SessionId>>>>;

/// One in-memory secondary index with its own batch counters.
#[derive(Default)]
pub struct MemoryIndexManager {
    entries: Entries,
    stats: Arc<StoreStats>,
    unavailable: AtomicBool,
}

impl MemoryIndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Refuse new batches with `StoreUnavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of distinct index values currently stored.
    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }
}

impl IndexManager for MemoryIndexManager {
    fn begin(&self) -> Result<Batch> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("index unavailable".into()));
        }
        Ok(self.stats.begin())
    }

    fn create_or_find(&self, batch: &Batch, value: &str) -> Result<Box<dyn IndexHandle>> {
        batch.ensure_active()?;
        self.entries.write().entry(value.to_owned()).or_default();
        Ok(Box::new(MemoryIndexHandle {
            value: value.to_owned(),
            entries: self.entries.clone(),
        }))
    }

    fn find(&self, batch: &Batch, value: &str) -> Result<Option<Box<dyn IndexHandle>>> {
        batch.ensure_active()?;
        if !self.entries.read().contains_key(value) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryIndexHandle {
            value: value.to_owned(),
            entries: self.entries.clone(),
        })))
    }
}

struct MemoryIndexHandle {
    value: String,
    entries: Entries,
}

impl IndexHandle for MemoryIndexHandle {
    fn value(&self) -> &str {
        &self.value
    }

    fn add_session(&mut self, batch: &Batch, id: &SessionId) -> Result<()> {
        batch.ensure_active()?;
        self.entries
            .write()
            .entry(self.value.clone())
            .or_default()
            .insert(id.clone());
        Ok(())
    }

    fn remove_session(&mut self, batch: &Batch, id: &SessionId) -> Result<()> {
        batch.ensure_active()?;
        if let Some(ids) = self.entries.write().get_mut(&self.value) {
            ids.remove(id);
        }
        Ok(())
    }

    fn list_sessions(&self, batch: &Batch) -> Result<BTreeSet<SessionId>> {
        batch.ensure_active()?;
        Ok(self
            .entries
            .read()
            .get(&self.value)
            .cloned()
            .unwrap_or_default())
    }

    /// Drops the entry only if it is still empty under the write lock, so
    /// an id added by a concurrent batch after the caller's emptiness check
    /// survives.
    fn invalidate(self: Box<Self>, batch: &Batch) -> Result<()> {
        batch.ensure_active()?;
        let mut entries = self.entries.write();
        if entries.get(&self.value).is_some_and(BTreeSet::is_empty) {
            entries.remove(&self.value);
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
