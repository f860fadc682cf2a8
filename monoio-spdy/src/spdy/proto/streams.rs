use std::sync::{Arc, Mutex};

use fnv::FnvHashMap;

use crate::{common::lock, spdy::frame::StreamId};

/// A stream table shared between the read path and the stream handles.
///
/// The lock is only held inside these methods; callers get `Arc`s back and
/// never hold the table while taking another lock.
#[derive(Debug)]
pub(crate) struct StreamMap<T> {
    inner: Mutex<FnvHashMap<StreamId, Arc<T>>>,
}

impl<T> Default for StreamMap<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(FnvHashMap::default()),
        }
    }
}

impl<T> StreamMap<T> {
    pub(crate) fn insert(&self, id: StreamId, value: Arc<T>) -> Option<Arc<T>> {
        lock(&self.inner).insert(id, value)
    }

    pub(crate) fn get(&self, id: StreamId) -> Option<Arc<T>> {
        lock(&self.inner).get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: StreamId) -> Option<Arc<T>> {
        lock(&self.inner).remove(&id)
    }

    pub(crate) fn contains(&self, id: StreamId) -> bool {
        lock(&self.inner).contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    /// Take every entry out, leaving the table empty.
    pub(crate) fn drain(&self) -> Vec<Arc<T>> {
        lock(&self.inner).drain().map(|(_, v)| v).collect()
    }

    /// Entries matching `f`, cloned out.
    pub(crate) fn select(&self, mut f: impl FnMut(StreamId) -> bool) -> Vec<Arc<T>> {
        lock(&self.inner)
            .iter()
            .filter(|(id, _)| f(**id))
            .map(|(_, v)| v.clone())
            .collect()
    }
}
