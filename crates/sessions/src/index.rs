//! Secondary index maintenance.
//!
//! Resolvers are pure: they derive at most one index value per index name
//! from a session's current state.  [`resolve_indexes`] runs all of them;
//! [`diff`] compares two resolutions; [`IndexManagers`] applies changes to
//! the per-index stores, each change in its own index batch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;

use sg_domain::error::{Error, Result};
use sg_domain::trace::{IndexOp, TraceEvent};

use crate::batch::Batch;
use crate::record::{SessionId, SessionView};
use crate::store::IndexManager;

/// `index name → index value` for one session; unresolved indexes are absent.
pub type ResolvedIndexes = BTreeMap<String, String>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resolvers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub trait IndexResolver: Send + Sync {
    fn index_name(&self) -> &str;
    fn resolve(&self, session: &dyn SessionView) -> Option<String>;
}

/// Uses the string (or number/bool) value of one attribute as the index value.
#[derive(Debug, Clone)]
pub struct AttributeIndexResolver {
    index: String,
    attribute: String,
}

impl AttributeIndexResolver {
    pub fn new(index: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            attribute: attribute.into(),
        }
    }
}

impl IndexResolver for AttributeIndexResolver {
    fn index_name(&self) -> &str {
        &self.index
    }

    fn resolve(&self, session: &dyn SessionView) -> Option<String> {
        let attr = session.attribute(&self.attribute)?;
        match attr.value() {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Resolver backed by a closure.
pub struct FnIndexResolver<F> {
    index: String,
    f: F,
}

impl<F> FnIndexResolver<F>
where
    F: Fn(&dyn SessionView) -> Option<String> + Send + Sync,
{
    pub fn new(index: impl Into<String>, f: F) -> Self {
        Self {
            index: index.into(),
            f,
        }
    }
}

impl<F> IndexResolver for FnIndexResolver<F>
where
    F: Fn(&dyn SessionView) -> Option<String> + Send + Sync,
{
    fn index_name(&self) -> &str {
        &self.index
    }

    fn resolve(&self, session: &dyn SessionView) -> Option<String> {
        (self.f)(session)
    }
}

/// Resolve every index for `session`.
pub fn resolve_indexes(
    resolvers: &[Arc<dyn IndexResolver>],
    session: &dyn SessionView,
) -> ResolvedIndexes {
    resolvers
        .iter()
        .filter_map(|r| {
            r.resolve(session)
                .map(|value| (r.index_name().to_owned(), value))
        })
        .collect()
}

/// One index whose resolved value differs between two resolutions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexChange {
    pub index: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Changed indexes between `before` and `after`, compared on the resolved
/// value only.
pub fn diff(before: &ResolvedIndexes, after: &ResolvedIndexes) -> Vec<IndexChange> {
    let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    names
        .into_iter()
        .filter_map(|name| {
            let old = before.get(name);
            let new = after.get(name);
            (old != new).then(|| IndexChange {
                index: name.clone(),
                old: old.cloned(),
                new: new.cloned(),
            })
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Index managers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registry of index managers keyed by index name.
#[derive(Clone, Default)]
pub struct IndexManagers {
    managers: HashMap<String, Arc<dyn IndexManager>>,
}

impl IndexManagers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, manager: Arc<dyn IndexManager>) {
        self.managers.insert(name.into(), manager);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.managers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Move `id` from `change.old` to `change.new` in one index batch.
    pub fn apply(&self, change: &IndexChange, id: &SessionId) -> Result<()> {
        self.in_batch(&change.index, |manager, batch| {
            if let Some(old) = &change.old {
                remove_from_entry(&change.index, manager, batch, old, id)?;
            }
            if let Some(new) = &change.new {
                add_to_entry(&change.index, manager, batch, new, id)?;
            }
            Ok(())
        })
    }

    /// Point `value` at `new_id` instead of `old_id`.  The new id is added
    /// before the old one is removed so the entry never lacks the session.
    pub fn reassign(
        &self,
        index: &str,
        value: &str,
        old_id: &SessionId,
        new_id: &SessionId,
    ) -> Result<()> {
        self.in_batch(index, |manager, batch| {
            add_to_entry(index, manager, batch, value, new_id)?;
            remove_from_entry(index, manager, batch, value, old_id)
        })
    }

    pub fn remove(&self, index: &str, value: &str, id: &SessionId) -> Result<()> {
        self.in_batch(index, |manager, batch| {
            remove_from_entry(index, manager, batch, value, id)
        })
    }

    /// Current ids for `value`; empty when the value is unknown.
    pub fn sessions(&self, index: &str, value: &str) -> Result<BTreeSet<SessionId>> {
        self.in_batch(index, |manager, batch| match manager.find(batch, value)? {
            Some(entry) => entry.list_sessions(batch),
            None => Ok(BTreeSet::new()),
        })
    }

    fn in_batch<R>(
        &self,
        index: &str,
        f: impl FnOnce(&dyn IndexManager, &Batch) -> Result<R>,
    ) -> Result<R> {
        let manager = self
            .managers
            .get(index)
            .ok_or_else(|| Error::UnknownIndex(index.to_owned()))?;
        let batch = manager.begin().map_err(|e| index_error(index, e))?;
        match f(manager.as_ref(), &batch) {
            Ok(out) => {
                batch.close().map_err(|e| index_error(index, e))?;
                Ok(out)
            }
            Err(e) => {
                batch.discard();
                Err(index_error(index, e))
            }
        }
    }
}

/// Attribute a manager failure to the index it happened on.
fn index_error(index: &str, err: Error) -> Error {
    match err {
        Error::Index { .. } | Error::UnknownIndex(_) => err,
        other => Error::index(index, other.to_string()),
    }
}

fn add_to_entry(
    index: &str,
    manager: &dyn IndexManager,
    batch: &Batch,
    value: &str,
    id: &SessionId,
) -> Result<()> {
    let mut entry = manager.create_or_find(batch, value)?;
    entry.add_session(batch, id)?;
    TraceEvent::IndexUpdated {
        index: index.to_owned(),
        value: value.to_owned(),
        session_id: id.to_string(),
        op: IndexOp::Add,
    }
    .emit();
    Ok(())
}

/// Drops the whole entry once its last session is gone.
fn remove_from_entry(
    index: &str,
    manager: &dyn IndexManager,
    batch: &Batch,
    value: &str,
    id: &SessionId,
) -> Result<()> {
    let Some(mut entry) = manager.find(batch, value)? else {
        return Ok(());
    };
    entry.remove_session(batch, id)?;
    if entry.list_sessions(batch)?.is_empty() {
        entry.invalidate(batch)?;
    }
    TraceEvent::IndexUpdated {
        index: index.to_owned(),
        value: value.to_owned(),
        session_id: id.to_string(),
        op: IndexOp::Remove,
    }
    .emit();
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
