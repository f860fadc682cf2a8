pub mod config;
pub mod connection;
pub mod flow_control;
mod ping;
pub mod stream;
mod streams;

pub use self::{
    config::{Config, Role},
    connection::{SpdyConnection, StreamHandler, DEFAULT_PRIORITY},
    flow_control::{FlowControl, WindowSize, DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE},
    stream::{IncomingStream, OutgoingStream},
};
