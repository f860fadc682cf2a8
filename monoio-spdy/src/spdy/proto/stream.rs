use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_core::Stream;

use super::connection::Shared;
use crate::{
    common::{error::SpdyError, header::HeaderBlock, lock, waker::StreamWaker},
    spdy::{
        codec::{
            writer::{stream_headers, StreamItem},
            MAX_HEADER_BLOCK_SIZE,
        },
        frame::{Frame, RstStatus, StreamId},
    },
};

pub(crate) const RECV_CLOSED: u8 = 0b01;
pub(crate) const SEND_CLOSED: u8 = 0b10;
const BOTH_CLOSED: u8 = RECV_CLOSED | SEND_CLOSED;

/// How a stream ended other than by FIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Terminal {
    Reset(RstStatus),
    ConnectionClosed,
}

impl Terminal {
    fn into_error(self, stream_id: StreamId) -> SpdyError {
        match self {
            Terminal::Reset(_) => SpdyError::Reset(stream_id),
            Terminal::ConnectionClosed => SpdyError::ChannelClosed,
        }
    }
}

#[derive(Debug, Default)]
struct RecvState {
    headers: HeaderBlock,
    headers_received: bool,
    /// HEADERS frames not yet folded into `headers`.
    pending: Vec<HeaderBlock>,
    buffer: VecDeque<Bytes>,
    fin: bool,
    read_any: bool,
}

impl RecvState {
    fn merge_pending(&mut self) {
        for block in self.pending.drain(..) {
            self.headers.merge(block);
        }
    }
}

#[derive(Debug, Default)]
struct SendState {
    headers_sent: bool,
    fin: bool,
}

/// State of one stream shared by its two halves and the connection tables.
#[derive(Debug)]
pub(crate) struct StreamInner {
    pub(crate) id: StreamId,
    pub(crate) priority: u8,
    pub(crate) associated_stream_id: StreamId,
    pub(crate) locally_initiated: bool,
    pub(crate) unidirectional: bool,
    recv: Mutex<RecvState>,
    send: Mutex<SendState>,
    terminal: Mutex<Option<Terminal>>,
    waker: StreamWaker,
    closed: AtomicU8,
    reset: AtomicBool,
    data_sent: AtomicBool,
}

impl StreamInner {
    pub(crate) fn new(
        id: StreamId,
        priority: u8,
        associated_stream_id: StreamId,
        locally_initiated: bool,
        unidirectional: bool,
    ) -> Self {
        Self {
            id,
            priority,
            associated_stream_id,
            locally_initiated,
            unidirectional,
            recv: Mutex::default(),
            send: Mutex::new(SendState {
                // the SYN_STREAM of a local stream carries its headers
                headers_sent: locally_initiated,
                fin: false,
            }),
            terminal: Mutex::new(None),
            waker: StreamWaker::new(),
            closed: AtomicU8::new(0),
            reset: AtomicBool::new(false),
            data_sent: AtomicBool::new(false),
        }
    }

    /// The SYN_STREAM opening this stream carried FIN.
    pub(crate) fn set_send_fin(&self) {
        lock(&self.send).fin = true;
    }

    /// The header block opening this half: SYN_STREAM or SYN_REPLY.
    /// Returns false if one was already received.
    pub(crate) fn on_reply(&self, headers: HeaderBlock, fin: bool) -> bool {
        {
            let mut recv = lock(&self.recv);
            if recv.headers_received {
                return false;
            }
            recv.headers = headers;
            recv.headers_received = true;
            recv.fin |= fin;
        }
        self.waker.wake();
        true
    }

    /// A HEADERS frame; merged lazily by the reader.
    pub(crate) fn on_headers(&self, headers: HeaderBlock, fin: bool) {
        {
            let mut recv = lock(&self.recv);
            recv.pending.push(headers);
            recv.fin |= fin;
        }
        self.waker.wake();
    }

    pub(crate) fn on_data(&self, data: Bytes, fin: bool) {
        {
            let mut recv = lock(&self.recv);
            if !data.is_empty() {
                recv.buffer.push_back(data);
            }
            recv.fin |= fin;
        }
        self.waker.wake();
    }

    /// End the stream without FIN. Returns the number of buffered bytes
    /// thrown away.
    pub(crate) fn terminate(&self, how: Terminal) -> usize {
        {
            let mut terminal = lock(&self.terminal);
            if terminal.is_none() {
                *terminal = Some(how);
            }
        }
        let discarded = {
            let mut recv = lock(&self.recv);
            recv.buffer.drain(..).map(|b| b.len()).sum()
        };
        self.waker.wake();
        discarded
    }

    pub(crate) fn terminal(&self) -> Option<Terminal> {
        *lock(&self.terminal)
    }

    /// Close the given sides. Returns true if this call closed the last one.
    pub(crate) fn mark_closed(&self, sides: u8) -> bool {
        let before = self.closed.fetch_or(sides, Ordering::AcqRel);
        before != BOTH_CLOSED && before | sides == BOTH_CLOSED
    }

    pub(crate) fn is_closed(&self, side: u8) -> bool {
        self.closed.load(Ordering::Acquire) & side != 0
    }

    /// Claim the one RST this stream may cause. True for the first caller.
    pub(crate) fn mark_reset(&self) -> bool {
        !self.reset.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    pub(crate) fn data_sent(&self) -> bool {
        self.data_sent.load(Ordering::Acquire)
    }

    fn abort_status(&self) -> Option<RstStatus> {
        let recv = lock(&self.recv);
        if recv.fin || self.terminal().is_some() {
            return None;
        }
        Some(if self.locally_initiated && self.data_sent() {
            RstStatus::Cancel
        } else if !recv.read_any {
            RstStatus::RefusedStream
        } else {
            RstStatus::InternalError
        })
    }
}

/// The receiving half of a stream.
///
/// Dropping it before the peer finished the stream resets the stream.
#[derive(Debug)]
pub struct IncomingStream {
    inner: Arc<StreamInner>,
    conn: Arc<Shared>,
    done: bool,
}

impl IncomingStream {
    pub(crate) fn new(inner: Arc<StreamInner>, conn: Arc<Shared>) -> Self {
        Self {
            inner,
            conn,
            done: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.inner.id
    }

    pub fn associated_stream_id(&self) -> StreamId {
        self.inner.associated_stream_id
    }

    pub fn priority(&self) -> u8 {
        self.inner.priority
    }

    pub fn is_unidirectional(&self) -> bool {
        self.inner.unidirectional
    }

    /// The headers received so far, with any later HEADERS folded in.
    pub fn headers(&self) -> HeaderBlock {
        let mut recv = lock(&self.inner.recv);
        recv.merge_pending();
        recv.headers.clone()
    }

    /// Whether the peer sent its FIN. Buffered data may still be unread.
    pub fn is_last_frame_received(&self) -> bool {
        lock(&self.inner.recv).fin
    }

    /// Whether nothing more will arrive: FIN received, or the stream ended.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed(RECV_CLOSED)
    }

    /// Ready once the SYN_STREAM or SYN_REPLY headers are in.
    pub fn poll_headers(&mut self, cx: &mut Context<'_>) -> Poll<Result<HeaderBlock, SpdyError>> {
        if let Some(ready) = self.headers_now() {
            return Poll::Ready(ready);
        }
        self.inner.waker.register(cx.waker());
        match self.headers_now() {
            Some(ready) => Poll::Ready(ready),
            None => Poll::Pending,
        }
    }

    fn headers_now(&self) -> Option<Result<HeaderBlock, SpdyError>> {
        let mut recv = lock(&self.inner.recv);
        if recv.headers_received {
            recv.merge_pending();
            return Some(Ok(recv.headers.clone()));
        }
        drop(recv);
        self.inner
            .terminal()
            .map(|t| Err(t.into_error(self.inner.id)))
    }

    /// Take the next buffered chunk without registering for a wakeup.
    /// `Ready(None)` is the end of the stream.
    pub fn poll_read_now(&mut self) -> Poll<Option<Result<Bytes, SpdyError>>> {
        let chunk = {
            let mut recv = lock(&self.inner.recv);
            recv.merge_pending();
            match recv.buffer.pop_front() {
                Some(chunk) => {
                    recv.read_any = true;
                    chunk
                }
                None if recv.fin => return Poll::Ready(None),
                None => {
                    drop(recv);
                    return match self.inner.terminal() {
                        Some(t) => Poll::Ready(Some(Err(t.into_error(self.inner.id)))),
                        None => Poll::Pending,
                    };
                }
            }
        };
        self.conn.data_read(self.inner.id, chunk.len());
        Poll::Ready(Some(Ok(chunk)))
    }

    /// Stop reading. Unless the peer already finished, the stream is reset:
    /// CANCEL if we opened it and sent data on it, REFUSED_STREAM if nothing
    /// was read yet, INTERNAL_ERROR otherwise. Idempotent.
    pub fn close(&mut self) {
        if std::mem::replace(&mut self.done, true) {
            return;
        }
        match self.inner.abort_status() {
            Some(status) => self.conn.reset_stream(&self.inner, status, true),
            None => {
                let discarded = {
                    let mut recv = lock(&self.inner.recv);
                    recv.buffer.drain(..).map(|b| b.len()).sum::<usize>()
                };
                self.conn.data_read(self.inner.id, discarded);
            }
        }
    }
}

impl Stream for IncomingStream {
    type Item = Result<Bytes, SpdyError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Poll::Ready(item) = self.poll_read_now() {
            return Poll::Ready(item);
        }
        // register before the second look so a concurrent push is not missed
        self.inner.waker.register(cx.waker());
        self.poll_read_now()
    }
}

impl Drop for IncomingStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// The sending half of a stream.
///
/// For a stream the peer opened, `send_headers` must come first and goes
/// out as SYN_REPLY; later header blocks are HEADERS frames. Dropping the
/// half before finishing resets the stream with CANCEL.
#[derive(Debug)]
pub struct OutgoingStream {
    inner: Arc<StreamInner>,
    conn: Arc<Shared>,
}

impl OutgoingStream {
    pub(crate) fn new(inner: Arc<StreamInner>, conn: Arc<Shared>) -> Self {
        Self { inner, conn }
    }

    pub fn stream_id(&self) -> StreamId {
        self.inner.id
    }

    pub fn priority(&self) -> u8 {
        self.inner.priority
    }

    pub fn is_reset(&self) -> bool {
        self.inner.is_reset()
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.inner.send).fin
    }

    /// Current send window of this stream, if the connection still tracks it.
    pub fn send_window(&self) -> Option<i32> {
        self.conn.stream_send_window(self.inner.id)
    }

    fn check_open(&self) -> Result<(), SpdyError> {
        match self.inner.terminal() {
            Some(t) => Err(t.into_error(self.inner.id)),
            None => Ok(()),
        }
    }

    /// Send a header block: SYN_REPLY if this half has not replied yet,
    /// HEADERS otherwise.
    pub fn send_headers(&mut self, headers: HeaderBlock, fin: bool) -> Result<(), SpdyError> {
        self.check_open()?;
        let block_len = headers.encoded_len();
        if block_len > MAX_HEADER_BLOCK_SIZE {
            return Err(SpdyError::HeaderBlockTooLarge(block_len));
        }
        let frame = {
            let mut send = lock(&self.inner.send);
            if send.fin {
                return Err(SpdyError::StreamFinished(self.inner.id));
            }
            let frame = stream_headers(self.inner.id, fin, headers);
            let frame = if send.headers_sent {
                Frame::Headers(frame)
            } else {
                Frame::SynReply(frame)
            };
            send.headers_sent = true;
            send.fin = fin;
            frame
        };
        self.queue(StreamItem::Frame(frame), fin)
    }

    /// Queue body bytes. They go out as fast as flow control allows.
    pub fn write(&mut self, data: Bytes, fin: bool) -> Result<(), SpdyError> {
        self.check_open()?;
        if data.is_empty() && !fin {
            return Ok(());
        }
        {
            let mut send = lock(&self.inner.send);
            if send.fin {
                return Err(SpdyError::StreamFinished(self.inner.id));
            }
            if !send.headers_sent {
                return Err(SpdyError::HeadersNotSent(self.inner.id));
            }
            send.fin = fin;
        }
        if !data.is_empty() {
            self.inner.data_sent.store(true, Ordering::Release);
        }
        self.queue(StreamItem::Data { payload: data, fin }, fin)
    }

    /// Close the stream with a trailing header block.
    pub fn send_trailers(&mut self, trailers: HeaderBlock) -> Result<(), SpdyError> {
        if !lock(&self.inner.send).headers_sent {
            return Err(SpdyError::HeadersNotSent(self.inner.id));
        }
        self.send_headers(trailers, true)
    }

    /// Close the sending side with an empty FIN data frame.
    pub fn finish(&mut self) -> Result<(), SpdyError> {
        self.write(Bytes::new(), true)
    }

    /// Reset the stream. Only the first reset of a stream sends RST_STREAM.
    pub fn reset(&mut self, status: RstStatus) {
        self.conn.reset_stream(&self.inner, status, true);
    }

    fn queue(&self, item: StreamItem, fin: bool) -> Result<(), SpdyError> {
        let res = self.conn.queue_stream(&self.inner, item);
        if fin {
            self.conn.half_closed(&self.inner, SEND_CLOSED);
        }
        res
    }
}

impl Drop for OutgoingStream {
    fn drop(&mut self) {
        let finished = lock(&self.inner.send).fin;
        if !finished && self.inner.terminal().is_none() {
            self.reset(RstStatus::Cancel);
        }
    }
}
