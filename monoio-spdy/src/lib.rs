pub mod common;
pub mod spdy;
pub mod util;

pub use self::{
    common::{
        error::{Handled, Ignored, SpdyError},
        header::HeaderBlock,
    },
    spdy::{
        codec::{
            decoder::{Decoded, FrameDecoder},
            writer::{FrameEncoder, FrameSink},
        },
        proto::{
            config::{Config, Role},
            connection::{SpdyConnection, StreamHandler},
            stream::{IncomingStream, OutgoingStream},
        },
    },
    util::pool::{BufferPool, DefaultBufferPool},
};
