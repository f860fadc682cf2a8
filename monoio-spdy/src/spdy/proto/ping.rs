use std::time::{Duration, Instant};

use fnv::FnvHashMap;

use super::config::Role;

/// PINGs sent by this side and not yet answered.
#[derive(Debug)]
pub(crate) struct PingTracker {
    role: Role,
    next_id: u32,
    outstanding: FnvHashMap<u32, Instant>,
}

impl PingTracker {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            role,
            next_id: role.first_stream_id(),
            outstanding: FnvHashMap::default(),
        }
    }

    /// Allocate an id of local parity and start timing it.
    pub(crate) fn start(&mut self) -> u32 {
        let id = self.next_id;
        // ids wrap around, keeping their parity
        self.next_id = match self.next_id.checked_add(2) {
            Some(next) => next,
            None => self.role.first_stream_id(),
        };
        self.outstanding.insert(id, Instant::now());
        id
    }

    /// Whether a received PING is an answer to one of ours rather than a
    /// request to echo.
    pub(crate) fn is_local(&self, id: u32) -> bool {
        self.role.is_local_id(id)
    }

    /// Round trip time of an answered PING, or None if it was never sent.
    pub(crate) fn complete(&mut self, id: u32) -> Option<Duration> {
        self.outstanding.remove(&id).map(|sent| sent.elapsed())
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}
