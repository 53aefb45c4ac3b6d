//! Type registry and live object table.
//!
//! The type registry maps wire names to constructors and is populated once at
//! application startup; after that it is only read. The live table maps uids
//! to objects or tombstones. Mutations go through a plain mutex and iteration
//! always works on a snapshot, so handler tasks, the tick and reapers never
//! contend on a held iterator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::errors::ReverbError;
use crate::object::{ReverbClass, ReverbObject, BASE_TYPE_NAME};

/// A live object shared between the table, handler tasks and the app.
pub type SharedObject = Arc<AsyncMutex<Box<dyn ReverbObject>>>;

type Constructor =
    Box<dyn Fn(&[Value], Option<u16>) -> Result<Box<dyn ReverbObject>, ReverbError> + Send + Sync>;

/// Wire name to constructor. The abstract base name is always listed but has
/// no constructor; asking for it fails like any unknown type.
pub struct TypeRegistry {
    types: RwLock<HashMap<String, Option<Constructor>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut types: HashMap<String, Option<Constructor>> = HashMap::new();
        types.insert(BASE_TYPE_NAME.to_string(), None);
        Self {
            types: RwLock::new(types),
        }
    }

    /// Lists a class under its wire name. Registering the same name twice is
    /// a no-op, so both sides can share one registration routine.
    pub fn register<T: ReverbClass>(&self) {
        let mut types = self.types.write().expect("type table poisoned");
        if types.contains_key(T::TYPE_NAME) {
            return;
        }
        debug!(type_name = T::TYPE_NAME, "type registered");
        types.insert(
            T::TYPE_NAME.to_string(),
            Some(Box::new(|values, owner_tag| {
                T::construct(values, owner_tag)
                    .map(|object| Box::new(object) as Box<dyn ReverbObject>)
            })),
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types
            .read()
            .expect("type table poisoned")
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.types
            .read()
            .expect("type table poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Builds an instance of `name` from a spawn payload.
    pub fn construct(
        &self,
        name: &str,
        values: &[Value],
        owner_tag: Option<u16>,
    ) -> Result<Box<dyn ReverbObject>, ReverbError> {
        let types = self.types.read().expect("type table poisoned");
        match types.get(name) {
            Some(Some(constructor)) => constructor(values, owner_tag),
            _ => Err(ReverbError::TypeNotFound(name.to_string())),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One slot of the live table.
pub enum LiveEntry {
    Object {
        type_name: String,
        object: SharedObject,
    },
    /// Marker left behind by a despawn until the reaper drops it. In-flight
    /// remote calls naming the uid resolve here and are silently discarded.
    Tombstone,
}

/// Result of a uid lookup.
pub enum Lookup {
    Live(SharedObject),
    Tombstone,
    Missing,
}

/// uid to entity-or-tombstone map.
#[derive(Default)]
pub struct ObjectTable {
    entries: Mutex<HashMap<String, LiveEntry>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LiveEntry>> {
        self.entries.lock().expect("live table poisoned")
    }

    pub fn insert(
        &self,
        uid: &str,
        type_name: &str,
        object: SharedObject,
    ) -> Result<(), ReverbError> {
        let mut entries = self.lock();
        if entries.contains_key(uid) {
            return Err(ReverbError::DuplicateObject(uid.to_string()));
        }
        entries.insert(
            uid.to_string(),
            LiveEntry::Object {
                type_name: type_name.to_string(),
                object,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, uid: &str) -> Lookup {
        match self.lock().get(uid) {
            Some(LiveEntry::Object { object, .. }) => Lookup::Live(object.clone()),
            Some(LiveEntry::Tombstone) => Lookup::Tombstone,
            None => Lookup::Missing,
        }
    }

    /// Resolves a uid to a live object; tombstones count as gone.
    pub fn get(&self, uid: &str) -> Result<SharedObject, ReverbError> {
        match self.lookup(uid) {
            Lookup::Live(object) => Ok(object),
            _ => Err(ReverbError::ObjectNotFound(uid.to_string())),
        }
    }

    /// Copies the live entries out for iteration.
    pub fn snapshot(&self) -> Vec<(String, SharedObject)> {
        self.lock()
            .iter()
            .filter_map(|(uid, entry)| match entry {
                LiveEntry::Object { object, .. } => Some((uid.clone(), object.clone())),
                LiveEntry::Tombstone => None,
            })
            .collect()
    }

    /// All live objects of one class.
    pub fn of_type(&self, type_name: &str) -> Vec<SharedObject> {
        self.lock()
            .values()
            .filter_map(|entry| match entry {
                LiveEntry::Object {
                    type_name: t,
                    object,
                } if t == type_name => Some(object.clone()),
                _ => None,
            })
            .collect()
    }

    /// Swaps a live entry for a tombstone, handing back the object.
    pub fn bury(&self, uid: &str) -> Lookup {
        let mut entries = self.lock();
        match entries.get(uid) {
            Some(LiveEntry::Object { .. }) => {
                let Some(LiveEntry::Object { object, .. }) =
                    entries.insert(uid.to_string(), LiveEntry::Tombstone)
                else {
                    unreachable!("entry checked above");
                };
                Lookup::Live(object)
            }
            Some(LiveEntry::Tombstone) => Lookup::Tombstone,
            None => Lookup::Missing,
        }
    }

    /// Physically drops a tombstone once the reap delay has passed. Uids are
    /// never reused, so a stale reaper can only ever hit its own tombstone.
    pub fn reap(&self, uid: &str) {
        let mut entries = self.lock();
        if matches!(entries.get(uid), Some(LiveEntry::Tombstone)) {
            entries.remove(uid);
        }
    }

    /// Client-side removal: the entry goes away immediately.
    pub fn remove(&self, uid: &str) -> Option<LiveEntry> {
        self.lock().remove(uid)
    }

    pub fn live_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| matches!(entry, LiveEntry::Object { .. }))
            .count()
    }
}
