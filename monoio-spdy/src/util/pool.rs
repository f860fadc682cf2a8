use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

use bytes::BytesMut;

use crate::common::lock;

/// Source of scratch buffers for header (de)compression and frame assembly.
///
/// Every buffer handed out by `allocate` is given back through `free` exactly
/// once; `PooledBuffer` does that on drop, so early returns and `?` paths
/// release too.
pub trait BufferPool: Send + Sync {
    fn allocate(&self) -> BytesMut;
    fn free(&self, buf: BytesMut);
    /// Capacity of the buffers this pool hands out.
    fn buffer_size(&self) -> usize;
}

/// Keeps up to `max_pooled` cleared buffers for reuse.
pub struct DefaultBufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_pooled: usize,
}

impl DefaultBufferPool {
    pub fn new(buffer_size: usize, max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            buffer_size,
            max_pooled,
        }
    }

    pub fn pooled(&self) -> usize {
        lock(&self.buffers).len()
    }
}

impl BufferPool for DefaultBufferPool {
    fn allocate(&self) -> BytesMut {
        match lock(&self.buffers).pop() {
            Some(buf) => buf,
            None => BytesMut::with_capacity(self.buffer_size),
        }
    }

    fn free(&self, mut buf: BytesMut) {
        // Split buffers and ones grown past twice the size are dropped.
        if buf.capacity() < self.buffer_size || buf.capacity() > 2 * self.buffer_size {
            return;
        }
        buf.clear();
        let mut buffers = lock(&self.buffers);
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl fmt::Debug for DefaultBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultBufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("max_pooled", &self.max_pooled)
            .finish()
    }
}

/// A buffer borrowed from a pool, returned when dropped.
pub struct PooledBuffer {
    // option is for take when drop
    buf: Option<BytesMut>,
    pool: Arc<dyn BufferPool>,
}

impl PooledBuffer {
    pub fn new(pool: &Arc<dyn BufferPool>) -> Self {
        Self {
            buf: Some(pool.allocate()),
            pool: pool.clone(),
        }
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().expect("buffer should be present")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().expect("buffer should be present")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free(buf);
        }
    }
}
