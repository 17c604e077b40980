//! Collaborator traits for the physical session store and the secondary
//! index stores.  Partitioning, replication, persistence and encoding all
//! live behind these.

use std::collections::BTreeSet;

use sg_domain::error::Result;

use crate::batch::Batch;
use crate::record::{SessionId, SessionRecord, SessionSnapshot};

/// Primary session store.
pub trait SessionStore: Send + Sync {
    /// Identifier factory.
    fn next_id(&self) -> SessionId;

    /// Batch factory.  Fails with `StoreUnavailable` when the store cannot
    /// start a unit of work.
    fn begin(&self) -> Result<Batch>;

    fn create(&self, batch: &Batch, id: &SessionId) -> Result<Box<dyn SessionRecord>>;

    fn find(&self, batch: &Batch, id: &SessionId) -> Result<Option<Box<dyn SessionRecord>>>;

    /// Detached copy of a session, without touching its access metadata.
    fn read_only(&self, batch: &Batch, id: &SessionId) -> Result<Option<SessionSnapshot>>;
}

/// Store for one named secondary index (`index value → session ids`).
/// An index may live in a different cache than the primary sessions, so it
/// hands out its own batches.
pub trait IndexManager: Send + Sync {
    fn begin(&self) -> Result<Batch>;

    fn create_or_find(&self, batch: &Batch, value: &str) -> Result<Box<dyn IndexHandle>>;

    fn find(&self, batch: &Batch, value: &str) -> Result<Option<Box<dyn IndexHandle>>>;
}

/// One index entry: the sessions currently exhibiting `value`.
pub trait IndexHandle: Send {
    fn value(&self) -> &str;
    fn add_session(&mut self, batch: &Batch, id: &SessionId) -> Result<()>;
    fn remove_session(&mut self, batch: &Batch, id: &SessionId) -> Result<()>;
    fn list_sessions(&self, batch: &Batch) -> Result<BTreeSet<SessionId>>;
    /// Remove the entry if it holds no sessions.  An id added by another
    /// batch after the caller saw the entry empty must survive.
    fn invalidate(self: Box<Self>, batch: &Batch) -> Result<()>;
}
