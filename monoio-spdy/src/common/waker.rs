use std::{fmt, sync::Mutex, task::Waker};

use super::lock;

/// StreamWaker holds the task waiting on a stream half. Unlike a local
/// waker it may be woken from the read path while the owner runs elsewhere.
pub struct StreamWaker {
    waker: Mutex<Option<Waker>>,
}

impl StreamWaker {
    pub const fn new() -> Self {
        Self {
            waker: Mutex::new(None),
        }
    }

    pub fn register(&self, waker: &Waker) {
        let mut slot = lock(&self.waker);
        match &*slot {
            Some(old_waker) if old_waker.will_wake(waker) => (),
            _ => *slot = Some(waker.clone()),
        }
    }

    pub fn wake(&self) {
        let waker = lock(&self.waker).take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl Default for StreamWaker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamWaker")
    }
}
