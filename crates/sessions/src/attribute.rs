//! Session attribute values.
//!
//! The payload is an opaque JSON value (encoding is the store's concern).
//! An attribute may additionally carry a [`DestructionListener`] that is
//! told when the session holding it is destroyed or expires.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use sg_domain::error::Result;

use crate::record::SessionView;

/// Capability of an attribute to observe the end of its session.
pub trait DestructionListener: Send + Sync {
    fn on_destroy(&self, name: &str, session: &dyn SessionView) -> Result<()>;
}

#[derive(Clone)]
pub struct AttributeValue {
    value: Value,
    listener: Option<Arc<dyn DestructionListener>>,
}

impl AttributeValue {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn DestructionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    pub fn listener(&self) -> Option<&Arc<dyn DestructionListener>> {
        self.listener.as_ref()
    }
}

impl fmt::Debug for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeValue")
            .field("value", &self.value)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl From<Value> for AttributeValue {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
