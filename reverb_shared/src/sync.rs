//! Replicated field cells.
//!
//! A `SyncVar` is one JSON-serializable slot with change tracking. The cell is
//! the single source of truth for "changed since last broadcast": the server's
//! tick consults and clears the flag, and a client applying a received sync
//! writes through the same path so change listeners fire on both sides.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::codec::to_value;
use crate::errors::ReverbError;

type ChangeListener = Box<dyn Fn(&Value, &Value) + Send + Sync>;

/// A scalar slot that tracks "changed since last broadcast".
pub struct SyncVar {
    value: Value,
    has_changed: bool,
    listeners: Vec<ChangeListener>,
}

impl SyncVar {
    /// Creates a cell holding `initial`. The value must be representable as
    /// JSON; anything else is rejected here rather than at broadcast time.
    pub fn new<T: Serialize>(initial: &T) -> Result<Self, ReverbError> {
        Ok(Self::from_value(to_value(initial)?))
    }

    /// Creates a cell from an already-decoded wire value.
    pub fn from_value(value: Value) -> Self {
        Self {
            value,
            has_changed: false,
            listeners: Vec::new(),
        }
    }

    /// Registers a hook invoked with `(old, new)` after the stored value has
    /// been replaced by a differing one.
    pub fn with_listener(
        mut self,
        listener: impl Fn(&Value, &Value) + Send + Sync + 'static,
    ) -> Self {
        self.add_listener(listener);
        self
    }

    pub fn add_listener(&mut self, listener: impl Fn(&Value, &Value) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Reads the value back as a concrete type.
    pub fn get_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.value.clone())
    }

    /// Stores a new value. The change flag is raised iff the new value
    /// differs from the previous one; equality is deep.
    pub fn set<T: Serialize>(&mut self, value: &T) -> Result<(), ReverbError> {
        self.set_value(to_value(value)?);
        Ok(())
    }

    /// Stores an already-decoded wire value, same change semantics as `set`.
    pub fn set_value(&mut self, value: Value) {
        if self.value == value {
            return;
        }
        let old = std::mem::replace(&mut self.value, value);
        self.has_changed = true;
        for listener in &self.listeners {
            listener(&old, &self.value);
        }
    }

    pub fn has_changed(&self) -> bool {
        self.has_changed
    }

    /// Called by the tick once the value has been emitted.
    pub fn clear_changed(&mut self) {
        self.has_changed = false;
    }
}

impl fmt::Debug for SyncVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncVar")
            .field("value", &self.value)
            .field("has_changed", &self.has_changed)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
