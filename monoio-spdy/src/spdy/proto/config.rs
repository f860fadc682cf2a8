use super::flow_control::DEFAULT_INITIAL_WINDOW_SIZE;
use crate::spdy::{
    codec::writer::DEFAULT_MAX_DATA_PAYLOAD,
    frame::{settings_id, Setting, Settings, StreamId},
};

pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1_024;
pub const DEFAULT_MAX_POOLED_BUFFERS: usize = 64;

/// Which end of the connection this engine plays. Decides the parity of
/// the stream ids and ping ids it allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn first_stream_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` (a stream or ping id) belongs to this side.
    pub fn is_local_id(self, id: u32) -> bool {
        match self {
            Role::Client => id % 2 == 1,
            Role::Server => id != 0 && id % 2 == 0,
        }
    }

    pub fn is_peer_id(self, id: u32) -> bool {
        id != 0 && !self.is_local_id(id)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Receive window of every stream, announced to the peer when it
    /// differs from the protocol default.
    pub initial_window_size: i32,

    /// Maximum number of peer initiated streams open at once. Excess
    /// SYN_STREAMs are refused.
    pub max_concurrent_streams: Option<u32>,

    /// Size of pooled buffers, also the bound of the compression scratch space.
    pub buffer_size: usize,

    /// Idle buffers kept by the default pool.
    pub max_pooled_buffers: usize,

    /// Largest DATA frame payload written.
    pub max_data_payload: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_concurrent_streams: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_pooled_buffers: DEFAULT_MAX_POOLED_BUFFERS,
            max_data_payload: DEFAULT_MAX_DATA_PAYLOAD,
        }
    }
}

impl Config {
    /// The SETTINGS frame announcing local limits, if any differ from the
    /// protocol defaults.
    pub(crate) fn settings(&self) -> Option<Settings> {
        let mut entries = Vec::new();
        if let Some(max) = self.max_concurrent_streams {
            entries.push(Setting {
                flags: 0,
                id: settings_id::MAX_CONCURRENT_STREAMS,
                value: max,
            });
        }
        if self.initial_window_size != DEFAULT_INITIAL_WINDOW_SIZE {
            entries.push(Setting {
                flags: 0,
                id: settings_id::INITIAL_WINDOW_SIZE,
                value: self.initial_window_size.max(0) as u32,
            });
        }
        if entries.is_empty() {
            None
        } else {
            Some(Settings { flags: 0, entries })
        }
    }
}
