//! One incremental body parser per control frame type.
//!
//! Fixed-size fields are only read once all their bytes are present; a split
//! field is left in the input and comes back through push-back.
use bytes::Buf;
use fnv::FnvHashSet;

use super::{
    inflate::{HeaderBlockParser, HeaderInflater},
    parser::HandleData,
};
use crate::{
    common::error::SpdyError,
    spdy::frame::{
        control_type, Frame, GoAway, Ping, RstStream, Setting, Settings, StreamHeaders,
        SynStream, WindowUpdate, STREAM_ID_MASK,
    },
};

#[derive(Debug)]
pub(crate) struct SynStreamParser {
    flags: u8,
    prefix: Option<(u32, u32, u8)>,
    headers: HeaderBlockParser,
}

impl HandleData for SynStreamParser {
    fn handle_data(
        &mut self,
        src: &mut &[u8],
        inflater: &mut HeaderInflater,
    ) -> Result<(), SpdyError> {
        if self.prefix.is_none() {
            if src.len() < 10 {
                return Ok(());
            }
            let stream_id = src.get_u32() & STREAM_ID_MASK;
            let associated = src.get_u32() & STREAM_ID_MASK;
            let priority = src.get_u8() >> 5;
            // slot, unused in SPDY/3
            src.advance(1);
            self.prefix = Some((stream_id, associated, priority));
        }
        self.headers.handle_data(src, inflater)
    }

    fn finished(&mut self) -> Result<(), SpdyError> {
        if self.prefix.is_none() {
            return Err(SpdyError::protocol("SYN_STREAM too short"));
        }
        self.headers.finished()
    }
}

/// SYN_REPLY and HEADERS bodies.
#[derive(Debug)]
pub(crate) struct StreamHeadersParser {
    flags: u8,
    stream_id: Option<u32>,
    headers: HeaderBlockParser,
}

impl HandleData for StreamHeadersParser {
    fn handle_data(
        &mut self,
        src: &mut &[u8],
        inflater: &mut HeaderInflater,
    ) -> Result<(), SpdyError> {
        if self.stream_id.is_none() {
            if src.len() < 4 {
                return Ok(());
            }
            self.stream_id = Some(src.get_u32() & STREAM_ID_MASK);
        }
        self.headers.handle_data(src, inflater)
    }

    fn finished(&mut self) -> Result<(), SpdyError> {
        if self.stream_id.is_none() {
            return Err(SpdyError::protocol("header frame too short"));
        }
        self.headers.finished()
    }
}

/// Frames made of a fixed number of 32 bit words (RST_STREAM, PING, GOAWAY,
/// WINDOW_UPDATE).
#[derive(Debug)]
pub(crate) struct WordsParser<const N: usize> {
    words: [u32; N],
    read: usize,
}

impl<const N: usize> Default for WordsParser<N> {
    fn default() -> Self {
        Self {
            words: [0; N],
            read: 0,
        }
    }
}

impl<const N: usize> HandleData for WordsParser<N> {
    fn handle_data(&mut self, src: &mut &[u8], _: &mut HeaderInflater) -> Result<(), SpdyError> {
        while self.read < N && src.len() >= 4 {
            self.words[self.read] = src.get_u32();
            self.read += 1;
        }
        // Trailing bytes in a fixed frame are tolerated and dropped.
        if self.read == N {
            src.advance(src.len());
        }
        Ok(())
    }

    fn finished(&mut self) -> Result<(), SpdyError> {
        if self.read < N {
            return Err(SpdyError::protocol("control frame too short"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct SettingsParser {
    flags: u8,
    count: Option<u32>,
    read: u32,
    entries: Vec<Setting>,
    seen: FnvHashSet<u32>,
}

impl HandleData for SettingsParser {
    fn handle_data(&mut self, src: &mut &[u8], _: &mut HeaderInflater) -> Result<(), SpdyError> {
        let count = match self.count {
            Some(c) => c,
            None => {
                if src.len() < 4 {
                    return Ok(());
                }
                let c = src.get_u32();
                self.count = Some(c);
                c
            }
        };
        while self.read < count && src.len() >= 8 {
            let flags = src.get_u8();
            let id = (src.get_u16() as u32) << 8 | src.get_u8() as u32;
            let value = src.get_u32();
            self.read += 1;
            // Only the first value of a repeated id counts.
            if !self.seen.insert(id) {
                tracing::debug!(id, value, "ignoring duplicate setting");
                continue;
            }
            self.entries.push(Setting { flags, id, value });
        }
        Ok(())
    }

    fn finished(&mut self) -> Result<(), SpdyError> {
        match self.count {
            Some(c) if c == self.read => Ok(()),
            _ => Err(SpdyError::protocol("SETTINGS entry count mismatch")),
        }
    }
}

/// Whichever body parser the current control frame needs.
#[derive(Debug)]
pub(crate) enum ControlFrameParser {
    SynStream(SynStreamParser),
    SynReply(StreamHeadersParser),
    Headers(StreamHeadersParser),
    RstStream(WordsParser<2>),
    Settings(SettingsParser),
    Ping(WordsParser<1>),
    GoAway(WordsParser<2>),
    WindowUpdate(WordsParser<2>),
}

impl ControlFrameParser {
    pub(crate) fn for_type(frame_type: u16, flags: u8) -> Result<Self, SpdyError> {
        let headers = || StreamHeadersParser {
            flags,
            stream_id: None,
            headers: HeaderBlockParser::new(),
        };
        Ok(match frame_type {
            control_type::SYN_STREAM => ControlFrameParser::SynStream(SynStreamParser {
                flags,
                prefix: None,
                headers: HeaderBlockParser::new(),
            }),
            control_type::SYN_REPLY => ControlFrameParser::SynReply(headers()),
            control_type::HEADERS => ControlFrameParser::Headers(headers()),
            control_type::RST_STREAM => ControlFrameParser::RstStream(Default::default()),
            control_type::SETTINGS => ControlFrameParser::Settings(SettingsParser {
                flags,
                ..Default::default()
            }),
            control_type::PING => ControlFrameParser::Ping(Default::default()),
            control_type::GOAWAY => ControlFrameParser::GoAway(Default::default()),
            control_type::WINDOW_UPDATE => ControlFrameParser::WindowUpdate(Default::default()),
            other => return Err(SpdyError::UnexpectedFrameType(other)),
        })
    }

    /// The decoded frame; only meaningful once the body parser finished.
    pub(crate) fn into_frame(self) -> Frame {
        match self {
            ControlFrameParser::SynStream(p) => {
                let (stream_id, associated_stream_id, priority) = p.prefix.unwrap_or_default();
                Frame::SynStream(SynStream {
                    stream_id,
                    associated_stream_id,
                    priority,
                    flags: p.flags,
                    headers: p.headers.into_headers(),
                })
            }
            ControlFrameParser::SynReply(p) => Frame::SynReply(p.into_stream_headers()),
            ControlFrameParser::Headers(p) => Frame::Headers(p.into_stream_headers()),
            ControlFrameParser::RstStream(p) => Frame::RstStream(RstStream {
                stream_id: p.words[0] & STREAM_ID_MASK,
                status: p.words[1].into(),
            }),
            ControlFrameParser::Settings(p) => Frame::Settings(Settings {
                flags: p.flags,
                entries: p.entries,
            }),
            ControlFrameParser::Ping(p) => Frame::Ping(Ping { id: p.words[0] }),
            ControlFrameParser::GoAway(p) => Frame::GoAway(GoAway {
                last_good_stream_id: p.words[0] & STREAM_ID_MASK,
                status: p.words[1].into(),
            }),
            ControlFrameParser::WindowUpdate(p) => Frame::WindowUpdate(WindowUpdate {
                stream_id: p.words[0] & STREAM_ID_MASK,
                delta: p.words[1] & STREAM_ID_MASK,
            }),
        }
    }
}

impl StreamHeadersParser {
    fn into_stream_headers(self) -> StreamHeaders {
        StreamHeaders {
            stream_id: self.stream_id.unwrap_or_default(),
            flags: self.flags,
            headers: self.headers.into_headers(),
        }
    }
}

impl HandleData for ControlFrameParser {
    fn handle_data(
        &mut self,
        src: &mut &[u8],
        inflater: &mut HeaderInflater,
    ) -> Result<(), SpdyError> {
        match self {
            ControlFrameParser::SynStream(p) => p.handle_data(src, inflater),
            ControlFrameParser::SynReply(p) | ControlFrameParser::Headers(p) => {
                p.handle_data(src, inflater)
            }
            ControlFrameParser::Settings(p) => p.handle_data(src, inflater),
            ControlFrameParser::Ping(p) => p.handle_data(src, inflater),
            ControlFrameParser::RstStream(p)
            | ControlFrameParser::GoAway(p)
            | ControlFrameParser::WindowUpdate(p) => p.handle_data(src, inflater),
        }
    }

    fn finished(&mut self) -> Result<(), SpdyError> {
        match self {
            ControlFrameParser::SynStream(p) => p.finished(),
            ControlFrameParser::SynReply(p) | ControlFrameParser::Headers(p) => p.finished(),
            ControlFrameParser::Settings(p) => p.finished(),
            ControlFrameParser::Ping(p) => p.finished(),
            ControlFrameParser::RstStream(p)
            | ControlFrameParser::GoAway(p)
            | ControlFrameParser::WindowUpdate(p) => p.finished(),
        }
    }
}
