//! Session identity, metadata and the store-side record handle.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sg_domain::error::Result;

use crate::attribute::AttributeValue;
use crate::batch::Batch;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identity & metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opaque session identifier produced by the store's identifier factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The most recently committed request interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub creation_time: DateTime<Utc>,
    /// `None` until the first request touching the session has committed.
    pub last_access: Option<AccessInterval>,
    /// `None` (or zero) means the session never expires on its own.
    pub max_idle: Option<Duration>,
}

impl SessionMetadata {
    pub fn new(creation_time: DateTime<Utc>) -> Self {
        Self {
            creation_time,
            last_access: None,
            max_idle: None,
        }
    }

    /// A session is new until its first access interval commits.
    pub fn is_new(&self) -> bool {
        self.last_access.is_none()
    }

    pub fn last_accessed_time(&self) -> DateTime<Utc> {
        self.last_access
            .map(|a| a.end)
            .unwrap_or(self.creation_time)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Some(max_idle) = self.max_idle.filter(|d| !d.is_zero()) else {
            return false;
        };
        let Ok(max_idle) = chrono::Duration::from_std(max_idle) else {
            return false;
        };
        now.signed_duration_since(self.last_accessed_time()) > max_idle
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Read-only views
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read access to a session's current attribute and metadata state.
/// Index resolvers and destruction listeners see sessions through this.
pub trait SessionView {
    fn id(&self) -> &SessionId;
    fn attribute(&self, name: &str) -> Option<AttributeValue>;
    fn attribute_names(&self) -> Vec<String>;
    fn metadata(&self) -> SessionMetadata;
}

/// Detached copy of a session, safe to hand out after its batch closed.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    id: SessionId,
    attributes: BTreeMap<String, AttributeValue>,
    metadata: SessionMetadata,
}

impl SessionSnapshot {
    pub fn new(
        id: SessionId,
        attributes: BTreeMap<String, AttributeValue>,
        metadata: SessionMetadata,
    ) -> Self {
        Self {
            id,
            attributes,
            metadata,
        }
    }

    pub fn capture(session: &dyn SessionView) -> Self {
        let attributes = session
            .attribute_names()
            .into_iter()
            .filter_map(|name| session.attribute(&name).map(|v| (name, v)))
            .collect();
        Self {
            id: session.id().clone(),
            attributes,
            metadata: session.metadata(),
        }
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }
}

impl SessionView for SessionSnapshot {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.attributes.get(name).cloned()
    }

    fn attribute_names(&self) -> Vec<String> {
        self.attributes.keys().cloned().collect()
    }

    fn metadata(&self) -> SessionMetadata {
        self.metadata.clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store-side record handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live session record owned by the store.  Every access takes the
/// Active batch it runs under.
pub trait SessionRecord: Send {
    fn id(&self) -> &SessionId;
    fn metadata(&self, batch: &Batch) -> SessionMetadata;
    fn attribute(&self, batch: &Batch, name: &str) -> Option<AttributeValue>;
    fn attribute_names(&self, batch: &Batch) -> Vec<String>;
    fn is_valid(&self, batch: &Batch) -> bool;

    /// Returns the previous value.
    fn set_attribute(
        &mut self,
        batch: &Batch,
        name: &str,
        value: AttributeValue,
    ) -> Result<Option<AttributeValue>>;
    fn remove_attribute(&mut self, batch: &Batch, name: &str) -> Result<Option<AttributeValue>>;
    fn set_max_idle(&mut self, batch: &Batch, max_idle: Option<Duration>) -> Result<()>;
    fn set_last_access(
        &mut self,
        batch: &Batch,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()>;
    fn invalidate(&mut self, batch: &Batch) -> Result<()>;
}

/// A record seen through its Active batch.
pub struct RecordView<'a> {
    record: &'a dyn SessionRecord,
    batch: &'a Batch,
}

impl<'a> RecordView<'a> {
    pub fn new(record: &'a dyn SessionRecord, batch: &'a Batch) -> Self {
        Self { record, batch }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::capture(self)
    }
}

impl SessionView for RecordView<'_> {
    fn id(&self) -> &SessionId {
        self.record.id()
    }

    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.record.attribute(self.batch, name)
    }

    fn attribute_names(&self) -> Vec<String> {
        self.record.attribute_names(self.batch)
    }

    fn metadata(&self) -> SessionMetadata {
        self.record.metadata(self.batch)
    }
}
