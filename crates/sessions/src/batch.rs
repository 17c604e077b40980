//! Transactional units of work and their suspend/resume hand-off.
//!
//! A [`Batch`] is Active on exactly one thread.  [`Batch::suspend`] detaches
//! it into a [`BatchToken`] that can be moved to another thread or async
//! continuation; the token is the only way back to an Active batch.  Every
//! store operation takes `&Batch`, so nothing touches the store without
//! first resuming.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use sg_domain::error::{Error, Result};

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

/// Store-side transaction driven by a [`Batch`].
pub trait Transaction: Send {
    fn commit(self: Box<Self>) -> Result<()>;
    fn rollback(self: Box<Self>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Active,
    Suspended,
    Closed,
    Discarded,
}

/// An open unit of work against one store.
///
/// Dropping a batch that was neither closed nor discarded rolls it back.
pub struct Batch {
    id: u64,
    tx: Option<Box<dyn Transaction>>,
    state: BatchState,
    owner: Option<ThreadId>,
}

impl Batch {
    /// Wrap a freshly started store transaction as an Active batch owned
    /// by the calling thread.
    pub fn begin(tx: Box<dyn Transaction>) -> Self {
        let id = NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(batch = id, "batch started");
        Self {
            id,
            tx: Some(tx),
            state: BatchState::Active,
            owner: Some(thread::current().id()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == BatchState::Active
    }

    /// Succeeds only when the batch is Active on the calling thread.
    /// Store implementations call this before mutating anything.
    pub fn ensure_active(&self) -> Result<()> {
        match self.state {
            BatchState::Active if self.owner == Some(thread::current().id()) => Ok(()),
            BatchState::Active => Err(Error::Other(format!(
                "batch {} is active on another thread",
                self.id
            ))),
            state => Err(Error::Other(format!("batch {} is {state:?}", self.id))),
        }
    }

    /// Detach from the current thread.
    pub fn suspend(mut self) -> BatchToken {
        self.state = BatchState::Suspended;
        self.owner = None;
        tracing::trace!(batch = self.id, "batch suspended");
        BatchToken { batch: self }
    }

    /// Commit the underlying transaction.
    pub fn close(mut self) -> Result<()> {
        self.state = BatchState::Closed;
        match self.tx.take() {
            Some(tx) => {
                tracing::trace!(batch = self.id, "batch closed");
                tx.commit()
            }
            None => Ok(()),
        }
    }

    /// Roll back the underlying transaction.
    pub fn discard(mut self) {
        self.state = BatchState::Discarded;
        if let Some(tx) = self.tx.take() {
            tracing::trace!(batch = self.id, "batch discarded");
            tx.rollback();
        }
    }

    fn activate(&mut self) {
        self.state = BatchState::Active;
        self.owner = Some(thread::current().id());
    }

    fn deactivate(&mut self) {
        self.state = BatchState::Suspended;
        self.owner = None;
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tracing::warn!(
                batch = self.id,
                state = ?self.state,
                "batch dropped without close; rolling back"
            );
            self.state = BatchState::Discarded;
            tx.rollback();
        }
    }
}

/// A suspended batch.  Transferable across threads; consumed by
/// [`BatchToken::resume`] or temporarily reactivated by
/// [`BatchToken::scoped`].
#[must_use = "a suspended batch rolls back when dropped"]
pub struct BatchToken {
    batch: Batch,
}

impl BatchToken {
    pub fn batch_id(&self) -> u64 {
        self.batch.id
    }

    /// Reattach the batch to the current thread for good.  The caller is
    /// responsible for closing, discarding or suspending it again.
    pub fn resume(mut self) -> Batch {
        self.batch.activate();
        tracing::trace!(batch = self.batch.id, "batch resumed");
        self.batch
    }

    /// Run `f` with the batch Active on the current thread, then revert it
    /// to Suspended (also when `f` panics).
    pub fn scoped<R>(&mut self, f: impl FnOnce(&Batch) -> R) -> R {
        self.batch.activate();
        let scope = Resuspend(&mut self.batch);
        f(&*scope.0)
    }
}

struct Resuspend<'a>(&'a mut Batch);

impl Drop for Resuspend<'_> {
    fn drop(&mut self) {
        self.0.deactivate();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
