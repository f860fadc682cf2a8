//! SPDY/3 wire vocabulary: frame header layout, control frame types, flags,
//! status codes and the decoded frame structs handed to the connection.
use bytes::{BufMut, Bytes, BytesMut};

use crate::common::header::HeaderBlock;

pub const SPDY_VERSION: u16 = 3;

/// Every frame starts with this many bytes.
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest length that fits the 24 bit length field.
pub const MAX_FRAME_LEN: usize = 0x00ff_ffff;

pub const STREAM_ID_MASK: u32 = 0x7fff_ffff;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_UNIDIRECTIONAL: u8 = 0x02;
pub const FLAG_SETTINGS_CLEAR_SETTINGS: u8 = 0x01;

pub type StreamId = u32;

pub mod control_type {
    pub const SYN_STREAM: u16 = 1;
    pub const SYN_REPLY: u16 = 2;
    pub const RST_STREAM: u16 = 3;
    pub const SETTINGS: u16 = 4;
    pub const PING: u16 = 6;
    pub const GOAWAY: u16 = 7;
    pub const HEADERS: u16 = 8;
    pub const WINDOW_UPDATE: u16 = 9;
}

pub mod settings_id {
    pub const UPLOAD_BANDWIDTH: u32 = 1;
    pub const DOWNLOAD_BANDWIDTH: u32 = 2;
    pub const ROUND_TRIP_TIME: u32 = 3;
    pub const MAX_CONCURRENT_STREAMS: u32 = 4;
    pub const CURRENT_CWND: u32 = 5;
    pub const DOWNLOAD_RETRANS_RATE: u32 = 6;
    pub const INITIAL_WINDOW_SIZE: u32 = 7;
    pub const CLIENT_CERTIFICATE_VECTOR_SIZE: u32 = 8;
}

/// RST_STREAM status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RstStatus {
    ProtocolError,
    InvalidStream,
    RefusedStream,
    UnsupportedVersion,
    Cancel,
    InternalError,
    FlowControlError,
    StreamInUse,
    StreamAlreadyClosed,
    FrameTooLarge,
    Unknown(u32),
}

impl RstStatus {
    pub fn code(self) -> u32 {
        match self {
            RstStatus::ProtocolError => 1,
            RstStatus::InvalidStream => 2,
            RstStatus::RefusedStream => 3,
            RstStatus::UnsupportedVersion => 4,
            RstStatus::Cancel => 5,
            RstStatus::InternalError => 6,
            RstStatus::FlowControlError => 7,
            RstStatus::StreamInUse => 8,
            RstStatus::StreamAlreadyClosed => 9,
            RstStatus::FrameTooLarge => 11,
            RstStatus::Unknown(c) => c,
        }
    }
}

impl From<u32> for RstStatus {
    fn from(code: u32) -> Self {
        match code {
            1 => RstStatus::ProtocolError,
            2 => RstStatus::InvalidStream,
            3 => RstStatus::RefusedStream,
            4 => RstStatus::UnsupportedVersion,
            5 => RstStatus::Cancel,
            6 => RstStatus::InternalError,
            7 => RstStatus::FlowControlError,
            8 => RstStatus::StreamInUse,
            9 => RstStatus::StreamAlreadyClosed,
            11 => RstStatus::FrameTooLarge,
            c => RstStatus::Unknown(c),
        }
    }
}

/// GOAWAY status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GoAwayStatus {
    Ok,
    ProtocolError,
    InternalError,
    Unknown(u32),
}

impl GoAwayStatus {
    pub fn code(self) -> u32 {
        match self {
            GoAwayStatus::Ok => 0,
            GoAwayStatus::ProtocolError => 1,
            GoAwayStatus::InternalError => 2,
            GoAwayStatus::Unknown(c) => c,
        }
    }
}

impl From<u32> for GoAwayStatus {
    fn from(code: u32) -> Self {
        match code {
            0 => GoAwayStatus::Ok,
            1 => GoAwayStatus::ProtocolError,
            2 => GoAwayStatus::InternalError,
            c => GoAwayStatus::Unknown(c),
        }
    }
}

/// The fixed 8 byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHead {
    Control {
        version: u16,
        frame_type: u16,
        flags: u8,
        length: u32,
    },
    Data {
        stream_id: StreamId,
        flags: u8,
        length: u32,
    },
}

impl FrameHead {
    pub fn parse(b: &[u8; FRAME_HEADER_LEN]) -> Self {
        let flags = b[4];
        let length = u32::from_be_bytes([0, b[5], b[6], b[7]]);
        if b[0] & 0x80 != 0 {
            FrameHead::Control {
                version: u16::from_be_bytes([b[0] & 0x7f, b[1]]),
                frame_type: u16::from_be_bytes([b[2], b[3]]),
                flags,
                length,
            }
        } else {
            FrameHead::Data {
                stream_id: u32::from_be_bytes([b[0], b[1], b[2], b[3]]) & STREAM_ID_MASK,
                flags,
                length,
            }
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match *self {
            FrameHead::Control {
                version,
                frame_type,
                flags,
                length,
            } => {
                dst.put_u16(0x8000 | version);
                dst.put_u16(frame_type);
                dst.put_u32(((flags as u32) << 24) | (length & MAX_FRAME_LEN as u32));
            }
            FrameHead::Data {
                stream_id,
                flags,
                length,
            } => {
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(((flags as u32) << 24) | (length & MAX_FRAME_LEN as u32));
            }
        }
    }

    pub fn flags(&self) -> u8 {
        match *self {
            FrameHead::Control { flags, .. } | FrameHead::Data { flags, .. } => flags,
        }
    }

    pub fn length(&self) -> u32 {
        match *self {
            FrameHead::Control { length, .. } | FrameHead::Data { length, .. } => length,
        }
    }

    pub fn is_fin(&self) -> bool {
        self.flags() & FLAG_FIN != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynStream {
    pub stream_id: StreamId,
    pub associated_stream_id: StreamId,
    pub priority: u8,
    pub flags: u8,
    pub headers: HeaderBlock,
}

impl SynStream {
    pub fn is_fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }

    pub fn is_unidirectional(&self) -> bool {
        self.flags & FLAG_UNIDIRECTIONAL != 0
    }
}

/// SYN_REPLY and HEADERS share a layout: a stream id followed by a header block.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHeaders {
    pub stream_id: StreamId,
    pub flags: u8,
    pub headers: HeaderBlock,
}

impl StreamHeaders {
    pub fn is_fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStream {
    pub stream_id: StreamId,
    pub status: RstStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub flags: u8,
    pub id: u32,
    pub value: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub flags: u8,
    pub entries: Vec<Setting>,
}

impl Settings {
    pub fn get(&self, id: u32) -> Option<u32> {
        self.entries.iter().find(|s| s.id == id).map(|s| s.value)
    }

    pub fn clears_settings(&self) -> bool {
        self.flags & FLAG_SETTINGS_CLEAR_SETTINGS != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoAway {
    pub last_good_stream_id: StreamId,
    pub status: GoAwayStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    pub stream_id: StreamId,
    pub delta: u32,
}

/// A fully parsed control frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    SynStream(SynStream),
    SynReply(StreamHeaders),
    RstStream(RstStream),
    Settings(Settings),
    Ping(Ping),
    GoAway(GoAway),
    Headers(StreamHeaders),
    WindowUpdate(WindowUpdate),
}

/// A slice of a DATA frame body. Bodies are surfaced as they arrive, so one
/// DATA frame may produce several chunks; only the final chunk of a frame
/// carrying `FLAG_FIN` has `fin` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub stream_id: StreamId,
    pub data: Bytes,
    pub fin: bool,
}
