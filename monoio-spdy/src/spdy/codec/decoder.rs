use std::sync::Arc;

use bytes::{Buf, Bytes};

use super::{frames::ControlFrameParser, inflate::HeaderInflater, parser::PushBackParser};
use crate::{
    common::error::SpdyError,
    spdy::frame::{DataChunk, Frame, FrameHead, StreamId, FRAME_HEADER_LEN, SPDY_VERSION},
    util::pool::BufferPool,
};

/// What one `decode` step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Frame(Frame),
    Data(DataChunk),
}

#[derive(Debug)]
enum DecodeState {
    /// Accumulating the 8 byte frame header.
    Head,
    /// A control frame body is being handed to its parser.
    Control(PushBackParser<ControlFrameParser>),
    /// A data frame body is being passed through.
    Data {
        stream_id: StreamId,
        fin: bool,
        remaining: usize,
    },
}

/// Splits a byte stream into SPDY frames.
///
/// The frame header decides which body parser runs next, like a composed
/// decoder: control bodies are parsed to completion internally and surface as
/// one `Frame`; data bodies are passed through as they arrive.
#[derive(Debug)]
pub struct FrameDecoder {
    head: [u8; FRAME_HEADER_LEN],
    filled: usize,
    state: DecodeState,
    inflater: HeaderInflater,
}

impl FrameDecoder {
    pub fn new(pool: Arc<dyn BufferPool>) -> Self {
        Self {
            head: [0; FRAME_HEADER_LEN],
            filled: 0,
            state: DecodeState::Head,
            inflater: HeaderInflater::new(pool),
        }
    }

    /// Decode the next item from `src`, advancing it past what was used.
    ///
    /// `Ok(None)` means `src` is exhausted and more bytes are needed; call
    /// again until then, as one buffer may hold many frames.
    pub fn decode(&mut self, src: &mut &[u8]) -> Result<Option<Decoded>, SpdyError> {
        loop {
            match self.state {
                DecodeState::Head => {
                    let n = (FRAME_HEADER_LEN - self.filled).min(src.len());
                    self.head[self.filled..self.filled + n].copy_from_slice(&src[..n]);
                    src.advance(n);
                    self.filled += n;
                    if self.filled < FRAME_HEADER_LEN {
                        return Ok(None);
                    }
                    self.filled = 0;
                    if let Some(decoded) = self.select(FrameHead::parse(&self.head))? {
                        return Ok(Some(decoded));
                    }
                }
                DecodeState::Control(ref mut parser) => {
                    if !parser.parse(src, &mut self.inflater)? {
                        return Ok(None);
                    }
                    if let DecodeState::Control(parser) =
                        std::mem::replace(&mut self.state, DecodeState::Head)
                    {
                        let frame = parser.into_handler().into_frame();
                        tracing::trace!(frame = ?frame, "recv");
                        return Ok(Some(Decoded::Frame(frame)));
                    }
                }
                DecodeState::Data {
                    stream_id,
                    fin,
                    ref mut remaining,
                } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let n = (*remaining).min(src.len());
                    let data = Bytes::copy_from_slice(&src[..n]);
                    src.advance(n);
                    *remaining -= n;
                    let last = *remaining == 0;
                    if last {
                        self.state = DecodeState::Head;
                    }
                    return Ok(Some(Decoded::Data(DataChunk {
                        stream_id,
                        data,
                        fin: last && fin,
                    })));
                }
            }
        }
    }

    /// Pick the body handler for a freshly read header. An empty data frame
    /// completes right here.
    fn select(&mut self, head: FrameHead) -> Result<Option<Decoded>, SpdyError> {
        match head {
            FrameHead::Control {
                version,
                frame_type,
                flags,
                length,
            } => {
                if version != SPDY_VERSION {
                    return Err(SpdyError::UnsupportedVersion(version));
                }
                let parser = ControlFrameParser::for_type(frame_type, flags)?;
                self.state = DecodeState::Control(PushBackParser::new(length as usize, parser));
                Ok(None)
            }
            FrameHead::Data {
                stream_id,
                flags,
                length,
            } => {
                if length == 0 {
                    return Ok(Some(Decoded::Data(DataChunk {
                        stream_id,
                        data: Bytes::new(),
                        fin: head.is_fin(),
                    })));
                }
                self.state = DecodeState::Data {
                    stream_id,
                    fin: flags & crate::spdy::frame::FLAG_FIN != 0,
                    remaining: length as usize,
                };
                Ok(None)
            }
        }
    }

    /// Body bytes of the current frame still owed by the transport. Control
    /// bodies are consumed internally and always report zero.
    pub fn frame_length(&self) -> usize {
        match self.state {
            DecodeState::Data { remaining, .. } => remaining,
            _ => 0,
        }
    }

    /// True between frames.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Head) && self.filled == 0
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::{
        common::header::HeaderBlock,
        spdy::{
            codec::writer::FrameEncoder,
            frame::{Ping, SynStream, FLAG_FIN},
        },
        util::pool::DefaultBufferPool,
    };

    fn pool() -> Arc<dyn BufferPool> {
        Arc::new(DefaultBufferPool::new(1024, 8))
    }

    fn decode_all(decoder: &mut FrameDecoder, mut src: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();
        while let Some(d) = decoder.decode(&mut src).unwrap() {
            out.push(d);
        }
        assert!(src.is_empty());
        out
    }

    #[test]
    fn ping_then_data_in_one_buffer() {
        let raw = hex::decode("800300060000000400000001 00000003010000026869".replace(' ', ""))
            .unwrap();
        let mut decoder = FrameDecoder::new(pool());
        let out = decode_all(&mut decoder, &raw);
        assert_eq!(
            out,
            vec![
                Decoded::Frame(Frame::Ping(Ping { id: 1 })),
                Decoded::Data(DataChunk {
                    stream_id: 3,
                    data: Bytes::from_static(b"hi"),
                    fin: true,
                }),
            ]
        );
        assert!(decoder.is_idle());
    }

    #[test]
    fn data_body_reports_outstanding_length() {
        let raw = hex::decode("0000000500000004 6162".replace(' ', "")).unwrap();
        let mut decoder = FrameDecoder::new(pool());
        let out = decode_all(&mut decoder, &raw);
        assert_eq!(out.len(), 1);
        assert_eq!(decoder.frame_length(), 2);
        let out = decode_all(&mut decoder, b"cd");
        assert_eq!(
            out,
            vec![Decoded::Data(DataChunk {
                stream_id: 5,
                data: Bytes::from_static(b"cd"),
                fin: false,
            })]
        );
        assert_eq!(decoder.frame_length(), 0);
    }

    #[test]
    fn control_frames_report_zero_length() {
        let mut decoder = FrameDecoder::new(pool());
        let raw = hex::decode("8003000600000004 0000".replace(' ', "")).unwrap();
        assert!(decode_all(&mut decoder, &raw).is_empty());
        assert_eq!(decoder.frame_length(), 0);
        assert!(!decoder.is_idle());
    }

    #[test]
    fn empty_fin_data_frame() {
        let raw = hex::decode("0000000901000000").unwrap();
        let mut decoder = FrameDecoder::new(pool());
        assert_eq!(
            decode_all(&mut decoder, &raw),
            vec![Decoded::Data(DataChunk {
                stream_id: 9,
                data: Bytes::new(),
                fin: true,
            })]
        );
    }

    #[test]
    fn syn_stream_split_byte_by_byte() {
        let headers: HeaderBlock = [(":method", "GET"), (":path", "/"), ("x-a", "1")]
            .into_iter()
            .collect();
        let syn = Frame::SynStream(SynStream {
            stream_id: 1,
            associated_stream_id: 0,
            priority: 3,
            flags: FLAG_FIN,
            headers,
        });
        let mut encoder = FrameEncoder::new(pool()).unwrap();
        let mut wire = BytesMut::new();
        encoder.encode_frame(&syn, &mut wire).unwrap();
        encoder.encode_frame(&syn, &mut wire).unwrap();

        let mut decoder = FrameDecoder::new(pool());
        let mut out = Vec::new();
        for b in wire.chunks(1) {
            out.extend(decode_all(&mut decoder, b));
        }
        assert_eq!(out, vec![Decoded::Frame(syn.clone()), Decoded::Frame(syn)]);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let raw = hex::decode("8002000600000004").unwrap();
        let mut decoder = FrameDecoder::new(pool());
        assert!(matches!(
            decoder.decode(&mut &raw[..]),
            Err(SpdyError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn unknown_control_type_is_rejected() {
        let raw = hex::decode("8003000a00000000").unwrap();
        let mut decoder = FrameDecoder::new(pool());
        assert!(matches!(
            decoder.decode(&mut &raw[..]),
            Err(SpdyError::UnexpectedFrameType(10))
        ));
    }
}
