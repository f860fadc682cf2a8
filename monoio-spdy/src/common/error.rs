use std::io;

use thiserror::Error as ThisError;

use crate::spdy::frame::{GoAwayStatus, RstStatus, StreamId};

#[derive(ThisError, Debug)]
pub enum SpdyError {
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("stream {stream_id} error: {status:?}")]
    Stream {
        stream_id: StreamId,
        status: RstStatus,
    },
    #[error("unexpected frame type {0}")]
    UnexpectedFrameType(u16),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("header decompression error {0}")]
    Decompress(#[from] flate2::DecompressError),
    #[error("header compression error {0}")]
    Compress(#[from] flate2::CompressError),
    #[error("stream {0} was reset")]
    Reset(StreamId),
    #[error("stream {0} is finished")]
    StreamFinished(StreamId),
    #[error("stream {0} must send its headers first")]
    HeadersNotSent(StreamId),
    #[error("header block of {0} bytes is too large")]
    HeaderBlockTooLarge(usize),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("channel closed")]
    ChannelClosed,
    #[error("too many concurrent streams")]
    StreamLimit,
    #[error("missing header {0}")]
    MissingHeader(&'static str),
    #[error("http error {0}")]
    Http(#[from] http::Error),
    #[error("io error {0}")]
    Io(#[from] io::Error),
}

impl SpdyError {
    pub(crate) fn protocol(reason: &'static str) -> Self {
        SpdyError::Protocol(reason)
    }

    pub(crate) fn stream(stream_id: StreamId, status: RstStatus) -> Self {
        SpdyError::Stream { stream_id, status }
    }

    /// Connection errors tear the whole session down with GOAWAY; everything
    /// else is scoped to a single stream or to the caller.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            SpdyError::Protocol(_)
                | SpdyError::UnexpectedFrameType(_)
                | SpdyError::UnsupportedVersion(_)
                | SpdyError::Decompress(_)
                | SpdyError::Compress(_)
                | SpdyError::Io(_)
        )
    }

    pub fn rst_status(&self) -> RstStatus {
        match self {
            SpdyError::Stream { status, .. } => *status,
            SpdyError::UnsupportedVersion(_) => RstStatus::UnsupportedVersion,
            SpdyError::Reset(_) | SpdyError::ChannelClosed => RstStatus::Cancel,
            SpdyError::StreamFinished(_) => RstStatus::StreamAlreadyClosed,
            SpdyError::StreamLimit => RstStatus::RefusedStream,
            SpdyError::HeaderBlockTooLarge(_) => RstStatus::FrameTooLarge,
            SpdyError::Compress(_) | SpdyError::Io(_) => RstStatus::InternalError,
            _ => RstStatus::ProtocolError,
        }
    }

    pub fn go_away_status(&self) -> GoAwayStatus {
        match self {
            SpdyError::Compress(_) | SpdyError::Io(_) => GoAwayStatus::InternalError,
            _ => GoAwayStatus::ProtocolError,
        }
    }
}

/// What the engine did with a frame that was well formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Applied,
    Ignored(Ignored),
}

/// Reasons a well formed frame had no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignored {
    /// The frame references a stream that is closed, reset or never existed.
    UnknownStream(StreamId),
    /// A new stream arrived after the peer sent GOAWAY.
    PeerGoneAway(StreamId),
    /// A setting id this engine does not act on.
    UnknownSetting(u32),
    /// A PING of our parity that we have no record of sending.
    UnsolicitedPong(u32),
    /// The stream was refused: the local concurrency limit was hit, or this
    /// side already sent GOAWAY.
    Refused(StreamId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        let e = SpdyError::stream(3, RstStatus::FlowControlError);
        assert!(!e.is_connection_error());
        assert_eq!(e.rst_status(), RstStatus::FlowControlError);

        let e = SpdyError::protocol("zero length header name");
        assert!(e.is_connection_error());
        assert_eq!(e.go_away_status(), GoAwayStatus::ProtocolError);

        let e = SpdyError::UnexpectedFrameType(42);
        assert!(e.is_connection_error());
        assert_eq!(e.to_string(), "unexpected frame type 42");

        let e = SpdyError::HeaderBlockTooLarge(2 << 20);
        assert!(!e.is_connection_error());
        assert_eq!(e.rst_status(), RstStatus::FrameTooLarge);

        let e = SpdyError::from(io::Error::new(io::ErrorKind::OutOfMemory, "pool"));
        assert_eq!(e.go_away_status(), GoAwayStatus::InternalError);
    }
}
