//! Request-scoped lookup cache.
//!
//! One `RequestContext` lives for the duration of one request and is passed
//! explicitly to the repository.  It remembers the last session found so
//! repeated lookups of the same id within the request reuse the same facade
//! instead of going back to the store.

use std::sync::Arc;

use crate::facade::SessionFacade;
use crate::record::SessionId;

#[derive(Default)]
pub struct RequestContext {
    cached: Option<Arc<SessionFacade>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached facade for `id`, if it is still open.
    pub(crate) fn lookup(&self, id: &SessionId) -> Option<Arc<SessionFacade>> {
        self.cached
            .as_ref()
            .filter(|f| f.id() == *id && !f.is_released())
            .cloned()
    }

    pub(crate) fn remember(&mut self, facade: Arc<SessionFacade>) {
        self.cached = Some(facade);
    }

    pub fn clear(&mut self) {
        self.cached = None;
    }

    pub fn is_empty(&self) -> bool {
        self.cached.is_none()
    }
}
