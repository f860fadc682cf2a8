mod deflate;
mod dictionary;
mod frames;
mod inflate;
mod parser;

pub mod decoder;
pub mod writer;

pub use self::{
    decoder::{Decoded, FrameDecoder},
    inflate::MAX_HEADER_BLOCK_SIZE,
    writer::{FrameEncoder, FrameSink, DEFAULT_MAX_DATA_PAYLOAD},
};
