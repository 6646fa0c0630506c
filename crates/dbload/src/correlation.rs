//! Identifiers handed from one stage to the next.
//!
//! Stores assign their own identifiers (a serial integer, a document id), so
//! a comment can't compute the id of the article it belongs to. The insert
//! stage that writes articles records each id under the article's sequence
//! position, and the comment stage looks it up by position.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::LoadError;
use crate::model::Entity;

/// Thread-safe map from sequence position to store-assigned identifier.
///
/// Each position is written at most once, by the worker that owns it.
/// Reads only observe writes from stages that have fully completed; the
/// store itself provides no ordering beyond its lock.
#[derive(Debug)]
pub struct IdCorrelationStore {
    entity: Entity,
    ids: Mutex<HashMap<usize, String>>,
}

impl IdCorrelationStore {
    pub fn new(entity: Entity) -> Self {
        Self::with_capacity(entity, 0)
    }

    pub fn with_capacity(entity: Entity, capacity: usize) -> Self {
        Self {
            entity,
            ids: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, String>> {
        // A panicking worker can't leave the map half-updated.
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `id` for `position`.
    ///
    /// Fails if `position` already has an identifier; the existing one is
    /// kept.
    pub fn put(&self, position: usize, id: String) -> Result<(), LoadError> {
        let mut ids = self.lock();
        if ids.contains_key(&position) {
            return Err(LoadError::DuplicateIdentifier {
                entity: self.entity,
                position,
            });
        }
        ids.insert(position, id);
        Ok(())
    }

    /// Returns the identifier recorded for `position`, or an empty string if
    /// none was recorded.
    ///
    /// An empty identifier is not an error here. It is passed on to the store,
    /// which rejects it as a missing reference.
    pub fn get(&self, position: usize) -> String {
        self.try_get(position).unwrap_or_default()
    }

    pub fn try_get(&self, position: usize) -> Option<String> {
        self.lock().get(&position).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forgets every identifier and releases the memory backing them.
    ///
    /// Safe to call on an empty store.
    pub fn reset(&self) {
        let mut ids = self.lock();
        ids.clear();
        ids.shrink_to_fit();
    }
}
