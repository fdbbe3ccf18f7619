use std::collections::{hash_map, HashMap};

/// Monotonic id allocation for reservation records. Ids are never reused,
/// so a stale ticket can be told apart from a later grant.
#[derive(Debug)]
pub(crate) struct IdMap<T> {
    inner: HashMap<u64, T>,
    cursor: u64,
}

impl<T> IdMap<T> {
    pub fn new() -> Self {
        IdMap {
            inner: HashMap::new(),
            cursor: 0,
        }
    }

    pub fn insert(&mut self, item: T) -> u64 {
        let id = self.cursor;
        self.cursor += 1;
        self.inner.insert(id, item);
        id
    }

    pub fn remove(&mut self, id: u64) -> Option<T> {
        self.inner.remove(&id)
    }

    pub fn iter(&self) -> hash_map::Iter<'_, u64, T> {
        self.inner.iter()
    }

    pub fn iter_mut(&mut self) -> hash_map::IterMut<'_, u64, T> {
        self.inner.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}
