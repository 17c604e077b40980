//! Session lifecycle facade and secondary-index consistency for SessionGrid.
//!
//! Request code creates or finds a session through [`SessionRepository`],
//! mutates it through the returned [`SessionFacade`], and hands it back via
//! `save` or `delete`.  Each facade carries a suspended [`Batch`] that may
//! be resumed on whichever thread finishes the request, and keeps the
//! configured secondary indexes in step with attribute changes.

pub mod attribute;
pub mod batch;
pub mod events;
pub mod facade;
pub mod index;
pub mod memory;
pub mod notifier;
pub mod record;
pub mod repository;
pub mod request;
pub mod store;

pub use attribute::{AttributeValue, DestructionListener};
pub use batch::{Batch, BatchState, BatchToken, Transaction};
pub use events::{
    DeploymentContext, DirectContext, ExecutionContext, SessionEvent, SessionEventKind,
    SessionEventSink, TracingEventSink,
};
pub use facade::SessionFacade;
pub use index::{
    AttributeIndexResolver, FnIndexResolver, IndexChange, IndexManagers, IndexResolver,
    ResolvedIndexes,
};
pub use memory::{MemoryIndexManager, MemorySessionStore, StoreStats};
pub use notifier::DestroyNotifier;
pub use record::{SessionId, SessionMetadata, SessionRecord, SessionSnapshot, SessionView};
pub use repository::{SessionRepository, SessionRepositoryBuilder, PRINCIPAL_NAME_INDEX};
pub use request::RequestContext;
pub use store::{IndexHandle, IndexManager, SessionStore};
