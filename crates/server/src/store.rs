//! Byte storage for live batches, keyed by batch id.

use std::collections::HashMap;

use bytes::Bytes;

/// Flat id → bytes mapping. No policy beyond storage; the queue decides when
/// entries appear and disappear.
#[derive(Debug, Default)]
pub struct BatchStore {
    batches: HashMap<u64, Bytes>,
}

impl BatchStore {
    pub fn insert(&mut self, id: u64, bytes: Bytes) {
        self.batches.insert(id, bytes);
    }

    /// Inserts only when the id has no entry yet. Used for shadow copies,
    /// which must capture the bytes of the *first* dispatch.
    pub fn insert_if_absent(&mut self, id: u64, bytes: Bytes) {
        self.batches.entry(id).or_insert(bytes);
    }

    pub fn replace(&mut self, id: u64, bytes: Bytes) {
        self.batches.insert(id, bytes);
    }

    pub fn take(&mut self, id: u64) -> Option<Bytes> {
        self.batches.remove(&id)
    }

    pub fn peek(&self, id: u64) -> Option<&Bytes> {
        self.batches.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.batches.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }
}
