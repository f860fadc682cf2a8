use std::{collections::VecDeque, io, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use fnv::FnvHashSet;

use super::{deflate::HeaderDeflater, inflate::MAX_HEADER_BLOCK_SIZE};
use crate::{
    common::{error::SpdyError, header::HeaderBlock},
    spdy::frame::{
        control_type, Frame, FrameHead, GoAway, RstStatus, StreamHeaders, StreamId, FLAG_FIN,
        MAX_FRAME_LEN, SPDY_VERSION, STREAM_ID_MASK,
    },
    util::pool::BufferPool,
};

/// Largest DATA payload put in one frame. Bigger writes go out as several
/// frames so a single stream cannot hog a flush.
pub const DEFAULT_MAX_DATA_PAYLOAD: usize = 16 * 1_024;

/// Where encoded frames go.
pub trait FrameSink: Send + Sync {
    /// Write the given frames, in order.
    fn send(&self, frames: Vec<Bytes>) -> io::Result<()>;

    /// Nothing follows the frames already handed over; close the write side
    /// once they are flushed.
    fn shutdown_writes(&self) -> io::Result<()>;
}

/// Serializes frames to their wire layout.
///
/// Owns the session's compression context, so header blocks must be encoded
/// in the order they are written.
#[derive(Debug)]
pub struct FrameEncoder {
    deflater: HeaderDeflater,
}

impl FrameEncoder {
    pub fn new(pool: Arc<dyn BufferPool>) -> Result<Self, SpdyError> {
        Ok(Self {
            deflater: HeaderDeflater::new(pool)?,
        })
    }

    pub fn encode_frame(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), SpdyError> {
        match frame {
            Frame::SynStream(v) => {
                check_header_block(v.stream_id, &v.headers)?;
                let block = self.deflater.compress_block(&v.headers)?;
                control_head(control_type::SYN_STREAM, v.flags, 10 + block.len(), dst)?;
                dst.put_u32(v.stream_id & STREAM_ID_MASK);
                dst.put_u32(v.associated_stream_id & STREAM_ID_MASK);
                dst.put_u8(v.priority << 5);
                // credential slot
                dst.put_u8(0);
                dst.extend_from_slice(&block);
            }
            Frame::SynReply(v) => self.stream_headers(control_type::SYN_REPLY, v, dst)?,
            Frame::Headers(v) => self.stream_headers(control_type::HEADERS, v, dst)?,
            Frame::RstStream(v) => {
                control_head(control_type::RST_STREAM, 0, 8, dst)?;
                dst.put_u32(v.stream_id & STREAM_ID_MASK);
                dst.put_u32(v.status.code());
            }
            Frame::Settings(v) => {
                control_head(control_type::SETTINGS, v.flags, 4 + 8 * v.entries.len(), dst)?;
                dst.put_u32(v.entries.len() as u32);
                for entry in v.entries.iter() {
                    dst.put_u32((entry.flags as u32) << 24 | (entry.id & 0x00ff_ffff));
                    dst.put_u32(entry.value);
                }
            }
            Frame::Ping(v) => {
                control_head(control_type::PING, 0, 4, dst)?;
                dst.put_u32(v.id);
            }
            Frame::GoAway(v) => {
                control_head(control_type::GOAWAY, 0, 8, dst)?;
                dst.put_u32(v.last_good_stream_id & STREAM_ID_MASK);
                dst.put_u32(v.status.code());
            }
            Frame::WindowUpdate(v) => {
                control_head(control_type::WINDOW_UPDATE, 0, 8, dst)?;
                dst.put_u32(v.stream_id & STREAM_ID_MASK);
                dst.put_u32(v.delta & STREAM_ID_MASK);
            }
        }
        Ok(())
    }

    pub fn encode_data(
        &mut self,
        stream_id: StreamId,
        fin: bool,
        payload: &[u8],
        dst: &mut BytesMut,
    ) -> Result<(), SpdyError> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(SpdyError::stream(stream_id, RstStatus::FrameTooLarge));
        }
        FrameHead::Data {
            stream_id,
            flags: if fin { FLAG_FIN } else { 0 },
            length: payload.len() as u32,
        }
        .encode(dst);
        dst.extend_from_slice(payload);
        Ok(())
    }

    fn stream_headers(
        &mut self,
        frame_type: u16,
        v: &StreamHeaders,
        dst: &mut BytesMut,
    ) -> Result<(), SpdyError> {
        check_header_block(v.stream_id, &v.headers)?;
        let block = self.deflater.compress_block(&v.headers)?;
        control_head(frame_type, v.flags, 4 + block.len(), dst)?;
        dst.put_u32(v.stream_id & STREAM_ID_MASK);
        dst.extend_from_slice(&block);
        Ok(())
    }
}

/// Uncompressed header blocks are capped like inbound ones. Checked before
/// compressing, so a refused block leaves the compression context untouched.
fn check_header_block(stream_id: StreamId, headers: &HeaderBlock) -> Result<(), SpdyError> {
    let len = headers.encoded_len();
    if len > MAX_HEADER_BLOCK_SIZE {
        tracing::debug!(stream_id, len, "header block too large");
        return Err(SpdyError::stream(stream_id, RstStatus::FrameTooLarge));
    }
    Ok(())
}

fn control_head(frame_type: u16, flags: u8, len: usize, dst: &mut BytesMut) -> Result<(), SpdyError> {
    if len > MAX_FRAME_LEN {
        return Err(SpdyError::protocol("control frame too large"));
    }
    FrameHead::Control {
        version: SPDY_VERSION,
        frame_type,
        flags,
        length: len as u32,
    }
    .encode(dst);
    Ok(())
}

/// A frame belonging to one stream. These keep their order within the stream.
#[derive(Debug)]
pub(crate) enum StreamItem {
    /// SYN_STREAM, SYN_REPLY or HEADERS; compressed when written.
    Frame(Frame),
    Data { payload: Bytes, fin: bool },
}

#[derive(Debug)]
struct Queued {
    stream_id: StreamId,
    priority: u8,
    seq: u64,
    item: StreamItem,
}

/// Outbound frame queue.
///
/// Control frames go out first in FIFO order. Stream frames follow ordered by
/// priority, then by arrival; DATA is released only as far as flow control
/// grants, and whatever cannot go out stays parked, holding back the later
/// frames of its stream until the next flush. GOAWAY always ends a flush and
/// closes the queue.
#[derive(Debug)]
pub(crate) struct FrameWriter {
    encoder: FrameEncoder,
    control: VecDeque<Frame>,
    queued: Vec<Queued>,
    seq: u64,
    go_away: Option<GoAway>,
    max_data_payload: usize,
    shut: bool,
}

impl FrameWriter {
    pub(crate) fn new(pool: Arc<dyn BufferPool>, max_data_payload: usize) -> Result<Self, SpdyError> {
        Ok(Self {
            encoder: FrameEncoder::new(pool)?,
            control: VecDeque::new(),
            queued: Vec::new(),
            seq: 0,
            go_away: None,
            max_data_payload: max_data_payload.clamp(1, MAX_FRAME_LEN),
            shut: false,
        })
    }

    pub(crate) fn push_control(&mut self, frame: Frame) {
        if self.shut {
            tracing::trace!(frame = ?frame, "writer shut, dropping");
            return;
        }
        self.control.push_back(frame);
    }

    pub(crate) fn push_stream(&mut self, stream_id: StreamId, priority: u8, item: StreamItem) {
        if self.shut {
            tracing::trace!(stream_id, "writer shut, dropping stream frame");
            return;
        }
        self.seq += 1;
        self.queued.push(Queued {
            stream_id,
            priority,
            seq: self.seq,
            item,
        });
    }

    /// Schedule the final GOAWAY. Only the first one counts.
    pub(crate) fn set_go_away(&mut self, frame: GoAway) -> bool {
        if self.shut || self.go_away.is_some() {
            return false;
        }
        self.go_away = Some(frame);
        true
    }

    /// Drop everything still queued for a stream; returns how many frames
    /// were dropped.
    pub(crate) fn purge_stream(&mut self, stream_id: StreamId) -> usize {
        let before = self.queued.len();
        self.queued.retain(|q| q.stream_id != stream_id);
        before - self.queued.len()
    }

    pub(crate) fn has_queued(&self, stream_id: StreamId) -> bool {
        self.queued.iter().any(|q| q.stream_id == stream_id)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.control.is_empty() && self.queued.is_empty() && self.go_away.is_none()
    }

    pub(crate) fn is_shut(&self) -> bool {
        self.shut
    }

    /// Encode everything that may go out now and hand it to `sink`.
    ///
    /// `grant(stream_id, wanted)` returns how many DATA bytes the stream may
    /// send right now; whatever it returns is considered spent.
    ///
    /// A frame that fails to encode is dropped and its error returned, after
    /// the frames encoded before it were handed to `sink`.
    pub(crate) fn flush<F>(&mut self, sink: &dyn FrameSink, grant: F) -> Result<(), SpdyError>
    where
        F: FnMut(StreamId, usize) -> usize,
    {
        let span = tracing::trace_span!("FrameWriter::flush");
        let _e = span.enter();

        if self.shut {
            return Ok(());
        }

        let mut out = Vec::new();
        let encoded = self.encode_pending(&mut out, grant);
        if !out.is_empty() {
            tracing::trace!(frames = out.len(), "flushing");
            sink.send(out)?;
        }
        if self.shut {
            sink.shutdown_writes()?;
        }
        encoded
    }

    fn encode_pending<F>(&mut self, out: &mut Vec<Bytes>, mut grant: F) -> Result<(), SpdyError>
    where
        F: FnMut(StreamId, usize) -> usize,
    {
        while let Some(frame) = self.control.pop_front() {
            tracing::debug!(frame = ?frame, "send");
            let mut buf = BytesMut::new();
            self.encoder.encode_frame(&frame, &mut buf)?;
            out.push(buf.freeze());
        }

        self.queued.sort_by_key(|q| (q.priority, q.seq));
        let mut blocked = FnvHashSet::default();
        let mut i = 0;
        while i < self.queued.len() {
            let stream_id = self.queued[i].stream_id;
            if blocked.contains(&stream_id) {
                i += 1;
                continue;
            }
            let done = match self.queued[i].item {
                StreamItem::Frame(ref frame) => {
                    tracing::debug!(frame = ?frame, "send");
                    let mut buf = BytesMut::new();
                    self.encoder
                        .encode_frame(frame, &mut buf)
                        .map(|_| out.push(buf.freeze()))
                        .map(|_| true)
                }
                StreamItem::Data { ref payload, fin } if payload.is_empty() => {
                    let mut buf = BytesMut::with_capacity(8);
                    self.encoder
                        .encode_data(stream_id, fin, &[], &mut buf)
                        .map(|_| out.push(buf.freeze()))
                        .map(|_| true)
                }
                StreamItem::Data {
                    ref mut payload,
                    fin,
                } => {
                    let mut res = Ok(());
                    while !payload.is_empty() {
                        let want = payload.len().min(self.max_data_payload);
                        let granted = grant(stream_id, want).min(want);
                        if granted == 0 {
                            tracing::trace!(stream_id, pending = payload.len(), "parked on flow control");
                            break;
                        }
                        let chunk = payload.split_to(granted);
                        let last = payload.is_empty() && fin;
                        let mut buf = BytesMut::with_capacity(chunk.len() + 8);
                        res = self.encoder.encode_data(stream_id, last, &chunk, &mut buf);
                        if res.is_err() {
                            break;
                        }
                        tracing::trace!(stream_id, len = chunk.len(), fin = last, "send data");
                        out.push(buf.freeze());
                    }
                    res.map(|_| payload.is_empty())
                }
            };
            match done {
                Ok(true) => {
                    self.queued.remove(i);
                }
                Ok(false) => {
                    blocked.insert(stream_id);
                    i += 1;
                }
                Err(e) => {
                    tracing::debug!(stream_id, error = ?e, "dropping frame that failed to encode");
                    self.queued.remove(i);
                    return Err(e);
                }
            }
        }

        if let Some(go_away) = self.go_away.take() {
            let frame = Frame::GoAway(go_away);
            tracing::debug!(frame = ?frame, "send");
            let mut buf = BytesMut::new();
            self.encoder.encode_frame(&frame, &mut buf)?;
            out.push(buf.freeze());
            self.shut = true;
            if !self.queued.is_empty() {
                tracing::debug!(dropped = self.queued.len(), "dropping parked frames after GOAWAY");
                self.queued.clear();
            }
        }
        Ok(())
    }
}

/// Header block shorthand for queueing reply and trailer frames.
pub(crate) fn stream_headers(stream_id: StreamId, fin: bool, headers: HeaderBlock) -> StreamHeaders {
    StreamHeaders {
        stream_id,
        flags: if fin { FLAG_FIN } else { 0 },
        headers,
    }
}
