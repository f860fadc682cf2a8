use std::{
    fmt,
    sync::{Arc, Mutex},
};

use indexmap::IndexMap;

use super::{
    config::{Config, Role},
    flow_control::FlowControl,
    ping::PingTracker,
    stream::{IncomingStream, OutgoingStream, StreamInner, Terminal, RECV_CLOSED, SEND_CLOSED},
    streams::StreamMap,
};
use crate::{
    common::{
        error::{Handled, Ignored, SpdyError},
        header::HeaderBlock,
        lock,
    },
    spdy::{
        codec::{
            decoder::{Decoded, FrameDecoder},
            writer::{FrameSink, FrameWriter, StreamItem},
            MAX_HEADER_BLOCK_SIZE,
        },
        frame::{
            settings_id, DataChunk, Frame, GoAway, GoAwayStatus, Ping, RstStatus, RstStream,
            Setting, Settings, StreamHeaders, StreamId, SynStream, WindowUpdate, FLAG_FIN,
            FLAG_UNIDIRECTIONAL, STREAM_ID_MASK,
        },
    },
    util::pool::{BufferPool, DefaultBufferPool},
};

/// SYN_STREAM priority used by `create_stream`. 0 is the highest, 7 the lowest.
pub const DEFAULT_PRIORITY: u8 = 3;

/// Receives streams opened by the peer.
pub trait StreamHandler: Send + Sync + 'static {
    /// Called once the SYN_STREAM is fully decoded. `reply` is None for
    /// unidirectional streams, which get no answer.
    fn on_stream(&self, stream: IncomingStream, reply: Option<OutgoingStream>);
}

impl<F> StreamHandler for F
where
    F: Fn(IncomingStream, Option<OutgoingStream>) + Send + Sync + 'static,
{
    fn on_stream(&self, stream: IncomingStream, reply: Option<OutgoingStream>) {
        self(stream, reply)
    }
}

#[derive(Debug)]
struct ConnState {
    next_stream_id: StreamId,
    /// Highest peer stream id accepted, reported in our GOAWAY.
    last_good_stream_id: StreamId,
    this_gone_away: bool,
    peer_gone_away: bool,
    closed: bool,
    local_open: usize,
    peer_open: usize,
    peer_settings: IndexMap<u32, Setting>,
    peer_max_concurrent_streams: Option<u32>,
}

/// Connection state reachable from the read path and from stream handles.
///
/// Locks are taken in the order state, writer, flow, pings; stream tables
/// and per-stream locks are only held briefly and never while taking
/// another lock.
pub(crate) struct Shared {
    role: Role,
    config: Config,
    sink: Arc<dyn FrameSink>,
    state: Mutex<ConnState>,
    writer: Mutex<FrameWriter>,
    flow: Mutex<FlowControl>,
    pings: Mutex<PingTracker>,
    incoming: StreamMap<StreamInner>,
    outgoing: StreamMap<StreamInner>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("role", &self.role)
            .field("incoming", &self.incoming.len())
            .field("outgoing", &self.outgoing.len())
            .finish()
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Write whatever the queue and flow control allow. A stream frame that
    /// cannot be encoded resets its stream; the rest of the queue still goes.
    pub(crate) fn pump(&self) -> Result<(), SpdyError> {
        let flushed = {
            let mut writer = lock(&self.writer);
            let flushed = writer.flush(&*self.sink, |stream_id, wanted| {
                lock(&self.flow).grab_for_stream(stream_id, wanted)
            });
            lock(&self.flow).sweep(|stream_id| writer.has_queued(stream_id));
            flushed
        };
        match flushed {
            Err(SpdyError::Stream { stream_id, status }) => {
                self.send_rst(stream_id, status);
                Ok(())
            }
            flushed => flushed,
        }
    }

    /// Pump on behalf of a caller that has nowhere to report failure.
    fn pump_quietly(&self) {
        if let Err(e) = self.pump() {
            tracing::debug!(error = ?e, "flush failed");
        }
    }

    fn push_control(&self, frame: Frame) {
        lock(&self.writer).push_control(frame);
    }

    pub(crate) fn queue_stream(&self, inner: &StreamInner, item: StreamItem) -> Result<(), SpdyError> {
        if self.is_closed() {
            return Err(SpdyError::ChannelClosed);
        }
        {
            let mut writer = lock(&self.writer);
            if writer.is_shut() {
                return Err(SpdyError::ChannelClosed);
            }
            writer.push_stream(inner.id, inner.priority, item);
        }
        self.pump()
    }

    pub(crate) fn stream_send_window(&self, stream_id: StreamId) -> Option<i32> {
        lock(&self.flow).stream_send_window(stream_id)
    }

    /// The application consumed (or discarded) `n` bytes of a stream.
    pub(crate) fn data_read(&self, stream_id: StreamId, n: usize) {
        if self.is_closed() {
            return;
        }
        let updates = lock(&self.flow).on_read(stream_id, n);
        if updates.is_empty() {
            return;
        }
        for update in updates {
            tracing::trace!(stream_id = update.stream_id, delta = update.delta, "window update");
            self.push_control(Frame::WindowUpdate(update));
        }
        self.pump_quietly();
    }

    /// Close one side of a stream; the stream leaves the connection once
    /// both are closed.
    pub(crate) fn half_closed(&self, inner: &StreamInner, side: u8) {
        if side & RECV_CLOSED != 0 {
            self.incoming.remove(inner.id);
        }
        if side & SEND_CLOSED != 0 {
            self.outgoing.remove(inner.id);
        }
        if inner.mark_closed(side) {
            self.retire(inner);
        }
    }

    fn retire(&self, inner: &StreamInner) {
        tracing::trace!(stream_id = inner.id, "stream closed");
        {
            let mut state = lock(&self.state);
            if inner.locally_initiated {
                state.local_open = state.local_open.saturating_sub(1);
            } else {
                state.peer_open = state.peer_open.saturating_sub(1);
            }
        }
        lock(&self.flow).retire(inner.id);
    }

    /// Reset a stream, locally or because the peer did. Only the first
    /// reset of a stream has an effect, and only a local one with `send`
    /// writes RST_STREAM.
    pub(crate) fn reset_stream(&self, inner: &StreamInner, status: RstStatus, send: bool) {
        if !inner.mark_reset() {
            return;
        }
        let discarded = inner.terminate(Terminal::Reset(status));
        self.incoming.remove(inner.id);
        self.outgoing.remove(inner.id);
        if inner.mark_closed(RECV_CLOSED | SEND_CLOSED) {
            let mut state = lock(&self.state);
            if inner.locally_initiated {
                state.local_open = state.local_open.saturating_sub(1);
            } else {
                state.peer_open = state.peer_open.saturating_sub(1);
            }
        }
        if self.is_closed() {
            return;
        }
        {
            let mut writer = lock(&self.writer);
            let dropped = writer.purge_stream(inner.id);
            if send {
                tracing::debug!(stream_id = inner.id, status = ?status, dropped, "reset stream");
                writer.push_control(Frame::RstStream(RstStream {
                    stream_id: inner.id,
                    status,
                }));
            } else {
                tracing::debug!(stream_id = inner.id, status = ?status, dropped, "stream reset by peer");
            }
        }
        let updates = {
            let mut flow = lock(&self.flow);
            flow.remove(inner.id);
            flow.on_read(inner.id, discarded)
        };
        for update in updates {
            self.push_control(Frame::WindowUpdate(update));
        }
        self.pump_quietly();
    }

    /// RST_STREAM for a stream error, whether or not the stream is known.
    fn send_rst(&self, stream_id: StreamId, status: RstStatus) {
        let inner = self
            .incoming
            .get(stream_id)
            .or_else(|| self.outgoing.get(stream_id));
        match inner {
            Some(inner) => self.reset_stream(&inner, status, true),
            None => {
                tracing::debug!(stream_id, status = ?status, "reset unknown stream");
                self.push_control(Frame::RstStream(RstStream { stream_id, status }));
            }
        }
    }

    /// Returns false if GOAWAY was already sent.
    fn send_go_away(&self, status: GoAwayStatus) -> Result<bool, SpdyError> {
        let last_good_stream_id = {
            let mut state = lock(&self.state);
            if state.this_gone_away || state.closed {
                return Ok(false);
            }
            state.this_gone_away = true;
            state.last_good_stream_id
        };
        tracing::debug!(last_good_stream_id, status = ?status, "go away");
        lock(&self.writer).set_go_away(GoAway {
            last_good_stream_id,
            status,
        });
        self.pump()?;
        Ok(true)
    }

    /// Close every stream and forget them.
    fn close(&self) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.local_open = 0;
            state.peer_open = 0;
        }
        let mut streams = self.incoming.drain();
        streams.extend(self.outgoing.drain());
        tracing::debug!(streams = streams.len(), "connection closed");
        for inner in streams {
            inner.terminate(Terminal::ConnectionClosed);
            inner.mark_closed(RECV_CLOSED | SEND_CLOSED);
        }
        lock(&self.flow).clear();
    }

    /// A connection error: best effort GOAWAY, then local teardown.
    fn abort(&self, error: &SpdyError) {
        tracing::warn!(error = %error, "connection error");
        if let Err(e) = self.send_go_away(error.go_away_status()) {
            tracing::debug!(error = ?e, "GOAWAY not delivered");
        }
        self.close();
    }
}

/// One SPDY/3 session.
///
/// Bytes read from the transport go to `handle_read`; encoded frames leave
/// through the `FrameSink`. Stream handles may be used from other threads.
pub struct SpdyConnection<H> {
    shared: Arc<Shared>,
    decoder: FrameDecoder,
    handler: H,
}

impl<H: StreamHandler> SpdyConnection<H> {
    pub fn new(
        role: Role,
        config: Config,
        pool: Arc<dyn BufferPool>,
        sink: Arc<dyn FrameSink>,
        handler: H,
    ) -> Result<Self, SpdyError> {
        let writer = FrameWriter::new(pool.clone(), config.max_data_payload)?;
        let announce = config.settings();
        let shared = Arc::new(Shared {
            role,
            sink,
            state: Mutex::new(ConnState {
                next_stream_id: role.first_stream_id(),
                last_good_stream_id: 0,
                this_gone_away: false,
                peer_gone_away: false,
                closed: false,
                local_open: 0,
                peer_open: 0,
                peer_settings: IndexMap::new(),
                peer_max_concurrent_streams: None,
            }),
            writer: Mutex::new(writer),
            flow: Mutex::new(FlowControl::new(config.initial_window_size)),
            pings: Mutex::new(PingTracker::new(role)),
            incoming: StreamMap::default(),
            outgoing: StreamMap::default(),
            config,
        });
        if let Some(settings) = announce {
            shared.push_control(Frame::Settings(settings));
            shared.pump()?;
        }
        Ok(Self {
            shared,
            decoder: FrameDecoder::new(pool),
            handler,
        })
    }

    /// Like `new`, with a `DefaultBufferPool` sized from `config`.
    pub fn with_default_pool(
        role: Role,
        config: Config,
        sink: Arc<dyn FrameSink>,
        handler: H,
    ) -> Result<Self, SpdyError> {
        let pool: Arc<dyn BufferPool> = Arc::new(DefaultBufferPool::new(
            config.buffer_size,
            config.max_pooled_buffers,
        ));
        Self::new(role, config, pool, sink, handler)
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Feed bytes read from the transport. Frames may be split anywhere.
    ///
    /// Stream errors reset their stream and reading continues. A
    /// connection error sends GOAWAY, closes the connection and is returned.
    pub fn handle_read(&mut self, mut src: &[u8]) -> Result<(), SpdyError> {
        if self.shared.is_closed() {
            return Err(SpdyError::ChannelClosed);
        }
        loop {
            let decoded = match self.decoder.decode(&mut src) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(e) => {
                    self.shared.abort(&e);
                    return Err(e);
                }
            };
            let res = match decoded {
                Decoded::Frame(frame) => self.process_frame(frame),
                Decoded::Data(chunk) => self.process_data(chunk),
            };
            match self.route(res) {
                Err(e) if e.is_connection_error() => return Err(e),
                _ => {}
            }
        }
        match self.shared.pump() {
            Err(e) if e.is_connection_error() => {
                self.shared.abort(&e);
                Err(e)
            }
            res => res,
        }
    }

    /// Body bytes of the DATA frame being read still owed by the transport.
    pub fn frame_length(&self) -> usize {
        self.decoder.frame_length()
    }

    /// Apply one decoded control frame.
    ///
    /// A stream error has already been answered with RST_STREAM when it is
    /// returned; a connection error has already closed the connection.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<Handled, SpdyError> {
        let res = self.process_frame(frame);
        let res = self.route(res);
        self.shared.pump_quietly();
        res
    }

    /// Apply one chunk of DATA. Same error contract as `handle_frame`.
    pub fn handle_data(&mut self, chunk: DataChunk) -> Result<Handled, SpdyError> {
        let res = self.process_data(chunk);
        let res = self.route(res);
        self.shared.pump_quietly();
        res
    }

    fn route(&self, res: Result<Handled, SpdyError>) -> Result<Handled, SpdyError> {
        match res {
            Ok(Handled::Ignored(reason)) => {
                tracing::debug!(reason = ?reason, "frame ignored");
                Ok(Handled::Ignored(reason))
            }
            Err(SpdyError::Stream { stream_id, status }) => {
                self.shared.send_rst(stream_id, status);
                Err(SpdyError::Stream { stream_id, status })
            }
            Err(e) if e.is_connection_error() => {
                self.shared.abort(&e);
                Err(e)
            }
            res => res,
        }
    }

    fn process_frame(&mut self, frame: Frame) -> Result<Handled, SpdyError> {
        match frame {
            Frame::SynStream(v) => self.on_syn_stream(v),
            Frame::SynReply(v) => self.on_syn_reply(v),
            Frame::Headers(v) => self.on_headers(v),
            Frame::RstStream(v) => self.on_rst_stream(v),
            Frame::Settings(v) => self.on_settings(v),
            Frame::Ping(v) => self.on_ping(v),
            Frame::GoAway(v) => self.on_go_away(v),
            Frame::WindowUpdate(v) => self.on_window_update(v),
        }
    }

    fn on_syn_stream(&mut self, v: SynStream) -> Result<Handled, SpdyError> {
        let stream_id = v.stream_id;
        let shared = &self.shared;
        if !shared.role.is_peer_id(stream_id) {
            return Err(SpdyError::protocol("SYN_STREAM with a local stream id"));
        }
        {
            let state = lock(&shared.state);
            if state.peer_gone_away {
                return Ok(Handled::Ignored(Ignored::PeerGoneAway(stream_id)));
            }
            if state.this_gone_away || state.closed {
                return Ok(Handled::Ignored(Ignored::Refused(stream_id)));
            }
        }
        if shared.incoming.contains(stream_id) || shared.outgoing.contains(stream_id) {
            return Err(SpdyError::stream(stream_id, RstStatus::StreamInUse));
        }
        let refused = {
            let mut state = lock(&shared.state);
            if stream_id <= state.last_good_stream_id {
                return Err(SpdyError::protocol("SYN_STREAM id is not increasing"));
            }
            state.last_good_stream_id = stream_id;
            match shared.config.max_concurrent_streams {
                Some(max) if state.peer_open >= max as usize => true,
                _ => {
                    state.peer_open += 1;
                    false
                }
            }
        };
        if refused {
            shared.send_rst(stream_id, RstStatus::RefusedStream);
            return Ok(Handled::Ignored(Ignored::Refused(stream_id)));
        }

        let fin = v.is_fin();
        let unidirectional = v.is_unidirectional();
        tracing::debug!(
            stream_id,
            priority = v.priority,
            associated_stream_id = v.associated_stream_id,
            fin,
            unidirectional,
            "new stream"
        );
        let inner = Arc::new(StreamInner::new(
            stream_id,
            v.priority,
            v.associated_stream_id,
            false,
            unidirectional,
        ));
        inner.on_reply(v.headers, fin);
        lock(&shared.flow).register(stream_id);
        shared.incoming.insert(stream_id, inner.clone());
        if !unidirectional {
            shared.outgoing.insert(stream_id, inner.clone());
        }
        if fin {
            shared.half_closed(&inner, RECV_CLOSED);
        }
        let reply = if unidirectional {
            shared.half_closed(&inner, SEND_CLOSED);
            None
        } else {
            Some(OutgoingStream::new(inner.clone(), shared.clone()))
        };
        let stream = IncomingStream::new(inner, shared.clone());
        self.handler.on_stream(stream, reply);
        Ok(Handled::Applied)
    }

    fn on_syn_reply(&mut self, v: StreamHeaders) -> Result<Handled, SpdyError> {
        let Some(inner) = self.shared.incoming.get(v.stream_id) else {
            return Ok(Handled::Ignored(Ignored::UnknownStream(v.stream_id)));
        };
        if !inner.locally_initiated {
            return Err(SpdyError::stream(v.stream_id, RstStatus::ProtocolError));
        }
        let fin = v.is_fin();
        if !inner.on_reply(v.headers, fin) {
            return Err(SpdyError::stream(v.stream_id, RstStatus::StreamInUse));
        }
        tracing::trace!(stream_id = v.stream_id, fin, "reply");
        if fin {
            self.shared.half_closed(&inner, RECV_CLOSED);
        }
        Ok(Handled::Applied)
    }

    fn on_headers(&mut self, v: StreamHeaders) -> Result<Handled, SpdyError> {
        let Some(inner) = self.shared.incoming.get(v.stream_id) else {
            return Ok(Handled::Ignored(Ignored::UnknownStream(v.stream_id)));
        };
        let fin = v.is_fin();
        inner.on_headers(v.headers, fin);
        if fin {
            self.shared.half_closed(&inner, RECV_CLOSED);
        }
        Ok(Handled::Applied)
    }

    fn on_rst_stream(&mut self, v: RstStream) -> Result<Handled, SpdyError> {
        let inner = self
            .shared
            .incoming
            .get(v.stream_id)
            .or_else(|| self.shared.outgoing.get(v.stream_id));
        match inner {
            Some(inner) => {
                self.shared.reset_stream(&inner, v.status, false);
                Ok(Handled::Applied)
            }
            None => Ok(Handled::Ignored(Ignored::UnknownStream(v.stream_id))),
        }
    }

    fn on_settings(&mut self, v: Settings) -> Result<Handled, SpdyError> {
        let mut applied = false;
        let mut unknown = None;
        let mut window = None;
        {
            let mut state = lock(&self.shared.state);
            if v.clears_settings() {
                state.peer_settings.clear();
                state.peer_max_concurrent_streams = None;
            }
            for entry in v.entries.iter() {
                state.peer_settings.insert(entry.id, *entry);
                match entry.id {
                    settings_id::MAX_CONCURRENT_STREAMS => {
                        state.peer_max_concurrent_streams = Some(entry.value);
                        applied = true;
                    }
                    settings_id::INITIAL_WINDOW_SIZE => {
                        window = Some(entry.value);
                        applied = true;
                    }
                    id => {
                        tracing::trace!(id, value = entry.value, "setting not acted on");
                        unknown.get_or_insert(id);
                    }
                }
            }
        }
        if let Some(value) = window {
            let delta = lock(&self.shared.flow).apply_initial_window_size(value);
            tracing::debug!(value, delta, "initial window size changed");
        }
        match unknown {
            Some(id) if !applied => Ok(Handled::Ignored(Ignored::UnknownSetting(id))),
            _ => Ok(Handled::Applied),
        }
    }

    fn on_ping(&mut self, v: Ping) -> Result<Handled, SpdyError> {
        let mut pings = lock(&self.shared.pings);
        if !pings.is_local(v.id) {
            drop(pings);
            tracing::trace!(id = v.id, "echo ping");
            self.shared.push_control(Frame::Ping(v));
            return Ok(Handled::Applied);
        }
        match pings.complete(v.id) {
            Some(rtt) => {
                tracing::debug!(id = v.id, rtt = ?rtt, "ping answered");
                Ok(Handled::Applied)
            }
            None => Ok(Handled::Ignored(Ignored::UnsolicitedPong(v.id))),
        }
    }

    fn on_go_away(&mut self, v: GoAway) -> Result<Handled, SpdyError> {
        tracing::debug!(
            last_good_stream_id = v.last_good_stream_id,
            status = ?v.status,
            "peer going away"
        );
        lock(&self.shared.state).peer_gone_away = true;
        // our streams the peer never processed
        let role = self.shared.role;
        let unprocessed = |id: StreamId| role.is_local_id(id) && id > v.last_good_stream_id;
        let mut doomed = self.shared.outgoing.select(unprocessed);
        doomed.extend(self.shared.incoming.select(unprocessed));
        for inner in doomed {
            self.shared
                .reset_stream(&inner, RstStatus::RefusedStream, false);
        }
        Ok(Handled::Applied)
    }

    fn on_window_update(&mut self, v: WindowUpdate) -> Result<Handled, SpdyError> {
        let mut flow = lock(&self.shared.flow);
        if v.stream_id == 0 {
            if flow.update_send_window(v.delta)? {
                tracing::trace!(delta = v.delta, "connection window reopened");
            }
            return Ok(Handled::Applied);
        }
        if flow.update_stream_send_window(v.stream_id, v.delta)? {
            Ok(Handled::Applied)
        } else {
            Ok(Handled::Ignored(Ignored::UnknownStream(v.stream_id)))
        }
    }

    fn process_data(&mut self, chunk: DataChunk) -> Result<Handled, SpdyError> {
        let stream_id = chunk.stream_id;
        let len = chunk.data.len();
        let accounted = lock(&self.shared.flow).on_data(stream_id, len);
        // nobody will read dropped bytes; stream 0 credits only the connection
        let Some(inner) = self.shared.incoming.get(stream_id) else {
            self.shared.data_read(0, len);
            return Ok(Handled::Ignored(Ignored::UnknownStream(stream_id)));
        };
        if let Err(e) = accounted {
            self.shared.data_read(0, len);
            return Err(e);
        }
        tracing::trace!(stream_id, len, fin = chunk.fin, "recv data");
        inner.on_data(chunk.data, chunk.fin);
        if chunk.fin {
            self.shared.half_closed(&inner, RECV_CLOSED);
        }
        Ok(Handled::Applied)
    }

    /// Open a request stream (client only). The SYN_STREAM is queued right
    /// away; with `fin` the request has no body.
    pub fn create_stream(
        &self,
        headers: HeaderBlock,
        fin: bool,
    ) -> Result<(OutgoingStream, IncomingStream), SpdyError> {
        self.create_stream_with_priority(headers, DEFAULT_PRIORITY, fin)
    }

    pub fn create_stream_with_priority(
        &self,
        headers: HeaderBlock,
        priority: u8,
        fin: bool,
    ) -> Result<(OutgoingStream, IncomingStream), SpdyError> {
        if self.shared.role != Role::Client {
            return Err(SpdyError::Unsupported("only clients open request streams"));
        }
        let inner = self.open_local(headers, priority, 0, fin, false)?;
        Ok((
            OutgoingStream::new(inner.clone(), self.shared.clone()),
            IncomingStream::new(inner, self.shared.clone()),
        ))
    }

    /// Push a unidirectional stream tied to a stream the peer opened
    /// (server only).
    pub fn push_stream(
        &self,
        associated_stream_id: StreamId,
        headers: HeaderBlock,
        fin: bool,
    ) -> Result<OutgoingStream, SpdyError> {
        if self.shared.role != Role::Server {
            return Err(SpdyError::Unsupported("only servers push streams"));
        }
        if !self.shared.role.is_peer_id(associated_stream_id) {
            return Err(SpdyError::Unsupported("pushed streams need a peer stream"));
        }
        let inner = self.open_local(headers, DEFAULT_PRIORITY, associated_stream_id, fin, true)?;
        Ok(OutgoingStream::new(inner, self.shared.clone()))
    }

    fn open_local(
        &self,
        headers: HeaderBlock,
        priority: u8,
        associated_stream_id: StreamId,
        fin: bool,
        unidirectional: bool,
    ) -> Result<Arc<StreamInner>, SpdyError> {
        let shared = &self.shared;
        let block_len = headers.encoded_len();
        if block_len > MAX_HEADER_BLOCK_SIZE {
            return Err(SpdyError::HeaderBlockTooLarge(block_len));
        }
        let stream_id = {
            let mut state = lock(&shared.state);
            if state.closed || state.this_gone_away || state.peer_gone_away {
                return Err(SpdyError::ChannelClosed);
            }
            if let Some(max) = state.peer_max_concurrent_streams {
                if state.local_open >= max as usize {
                    return Err(SpdyError::StreamLimit);
                }
            }
            let stream_id = state.next_stream_id;
            if stream_id > STREAM_ID_MASK {
                return Err(SpdyError::ChannelClosed);
            }
            state.next_stream_id += 2;
            state.local_open += 1;
            stream_id
        };
        let priority = priority.min(7);
        tracing::debug!(stream_id, priority, fin, unidirectional, "open stream");

        let inner = Arc::new(StreamInner::new(
            stream_id,
            priority,
            associated_stream_id,
            true,
            unidirectional,
        ));
        if fin {
            inner.set_send_fin();
        }
        lock(&shared.flow).register(stream_id);
        shared.outgoing.insert(stream_id, inner.clone());
        if !unidirectional {
            shared.incoming.insert(stream_id, inner.clone());
        }
        let mut flags = 0;
        if fin {
            flags |= FLAG_FIN;
        }
        if unidirectional {
            flags |= FLAG_UNIDIRECTIONAL;
        }
        let syn = SynStream {
            stream_id,
            associated_stream_id,
            priority,
            flags,
            headers,
        };
        let queued = shared.queue_stream(&inner, StreamItem::Frame(Frame::SynStream(syn)));
        if fin {
            shared.half_closed(&inner, SEND_CLOSED);
        }
        if unidirectional {
            shared.half_closed(&inner, RECV_CLOSED);
        }
        queued?;
        Ok(inner)
    }

    /// Take up to `requested` bytes of the connection send window.
    pub fn grab_flow_control_bytes(&self, requested: usize) -> usize {
        lock(&self.shared.flow).grab_flow_control_bytes(requested)
    }

    pub fn send_window(&self) -> i32 {
        lock(&self.shared.flow).send_window()
    }

    /// Send GOAWAY; no new streams are accepted or opened afterwards and
    /// the write side shuts down once it is flushed. Only the first call
    /// sends anything.
    pub fn send_go_away(&self, status: GoAwayStatus) -> Result<(), SpdyError> {
        self.shared.send_go_away(status).map(|_| ())
    }

    /// Send a PING; returns its id. The answer is matched in `handle_read`.
    pub fn ping(&self) -> Result<u32, SpdyError> {
        if self.shared.is_closed() {
            return Err(SpdyError::ChannelClosed);
        }
        let id = lock(&self.shared.pings).start();
        self.shared.push_control(Frame::Ping(Ping { id }));
        self.shared.pump()?;
        Ok(id)
    }

    pub fn outstanding_pings(&self) -> usize {
        lock(&self.shared.pings).outstanding()
    }

    /// The transport reached EOF. Without a prior GOAWAY from the peer this
    /// was an abrupt close, answered with a best effort GOAWAY(PROTOCOL_ERROR).
    pub fn on_peer_closed(&self) {
        let abrupt = !lock(&self.shared.state).peer_gone_away;
        if abrupt {
            tracing::debug!("peer closed without GOAWAY");
            if let Err(e) = self.shared.send_go_away(GoAwayStatus::ProtocolError) {
                tracing::debug!(error = ?e, "GOAWAY not delivered");
            }
        }
        self.shared.close();
    }

    /// Close every open stream, waking their readers, and forget them.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Every setting the peer announced, in arrival order.
    pub fn peer_settings(&self) -> Settings {
        let state = lock(&self.shared.state);
        Settings {
            flags: 0,
            entries: state.peer_settings.values().copied().collect(),
        }
    }

    pub fn last_good_stream_id(&self) -> StreamId {
        lock(&self.shared.state).last_good_stream_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn is_going_away(&self) -> bool {
        let state = lock(&self.shared.state);
        state.this_gone_away || state.peer_gone_away
    }

    pub fn peer_gone_away(&self) -> bool {
        lock(&self.shared.state).peer_gone_away
    }

    /// Whether frames are still waiting for the sink or for send window.
    pub fn has_pending_writes(&self) -> bool {
        !lock(&self.shared.writer).is_idle()
    }

    /// Streams with at least one side still open.
    pub fn open_streams(&self) -> usize {
        let state = lock(&self.shared.state);
        state.local_open + state.peer_open
    }
}

impl<H> fmt::Debug for SpdyConnection<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpdyConnection")
            .field("shared", &self.shared)
            .field("decoder", &self.decoder)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
        task::{Context, Poll, Wake, Waker},
    };

    use bytes::{Bytes, BytesMut};
    use futures_core::Stream;
    use quickcheck::{QuickCheck, TestResult};
    use rand::Rng;

    use super::*;
    use crate::spdy::{
        codec::writer::{stream_headers, tests::RecordingSink, FrameEncoder},
        frame::FLAG_SETTINGS_CLEAR_SETTINGS,
        proto::flow_control::DEFAULT_INITIAL_WINDOW_SIZE,
    };

    type Accepted = Arc<Mutex<Vec<(IncomingStream, Option<OutgoingStream>)>>>;

    #[derive(Clone, Default)]
    struct Collect(Accepted);

    impl StreamHandler for Collect {
        fn on_stream(&self, stream: IncomingStream, reply: Option<OutgoingStream>) {
            self.0.lock().unwrap().push((stream, reply));
        }
    }

    fn pool() -> Arc<dyn BufferPool> {
        Arc::new(DefaultBufferPool::new(1024, 8))
    }

    /// The engine under test plus the peer's half of the codec.
    struct Harness {
        conn: SpdyConnection<Collect>,
        sink: Arc<RecordingSink>,
        accepted: Accepted,
        encoder: FrameEncoder,
        decoder: FrameDecoder,
    }

    impl Harness {
        fn new(role: Role, config: Config) -> Self {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
            let sink = Arc::new(RecordingSink::default());
            let handler = Collect::default();
            let accepted = handler.0.clone();
            let conn = SpdyConnection::new(role, config, pool(), sink.clone(), handler).unwrap();
            Self {
                conn,
                sink,
                accepted,
                encoder: FrameEncoder::new(pool()).unwrap(),
                decoder: FrameDecoder::new(pool()),
            }
        }

        fn client() -> Self {
            Self::new(Role::Client, Config::default())
        }

        fn server() -> Self {
            Self::new(Role::Server, Config::default())
        }

        fn feed(&mut self, frame: Frame) -> Result<(), SpdyError> {
            let mut buf = BytesMut::new();
            self.encoder.encode_frame(&frame, &mut buf).unwrap();
            self.conn.handle_read(&buf)
        }

        fn feed_data(&mut self, stream_id: StreamId, data: &[u8], fin: bool) -> Result<(), SpdyError> {
            let mut buf = BytesMut::new();
            self.encoder.encode_data(stream_id, fin, data, &mut buf).unwrap();
            self.conn.handle_read(&buf)
        }

        fn output(&mut self) -> Vec<Decoded> {
            self.sink.take_decoded(&mut self.decoder)
        }

        fn frames(&mut self) -> Vec<Frame> {
            self.output()
                .into_iter()
                .filter_map(|d| match d {
                    Decoded::Frame(f) => Some(f),
                    Decoded::Data(_) => None,
                })
                .collect()
        }

        fn accept(&self) -> (IncomingStream, Option<OutgoingStream>) {
            self.accepted.lock().unwrap().remove(0)
        }
    }

    fn request() -> HeaderBlock {
        [
            (":method", "GET"),
            (":path", "/"),
            (":version", "HTTP/1.1"),
            (":host", "example.com"),
            (":scheme", "https"),
        ]
        .into_iter()
        .collect()
    }

    fn response() -> HeaderBlock {
        [(":status", "200"), (":version", "HTTP/1.1")]
            .into_iter()
            .collect()
    }

    fn syn(stream_id: StreamId, fin: bool) -> Frame {
        Frame::SynStream(SynStream {
            stream_id,
            associated_stream_id: 0,
            priority: DEFAULT_PRIORITY,
            flags: if fin { FLAG_FIN } else { 0 },
            headers: request(),
        })
    }

    fn reply(stream_id: StreamId, fin: bool) -> Frame {
        Frame::SynReply(StreamHeaders {
            stream_id,
            flags: if fin { FLAG_FIN } else { 0 },
            headers: response(),
        })
    }

    fn setting(id: u32, value: u32) -> Frame {
        Frame::Settings(Settings {
            flags: 0,
            entries: vec![Setting { flags: 0, id, value }],
        })
    }

    fn window_update(stream_id: StreamId, delta: u32) -> Frame {
        Frame::WindowUpdate(WindowUpdate { stream_id, delta })
    }

    fn data_of(out: &[Decoded], stream_id: StreamId) -> Vec<u8> {
        out.iter()
            .filter_map(|d| match d {
                Decoded::Data(c) if c.stream_id == stream_id => Some(&c.data[..]),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    #[test]
    fn syn_stream_with_fin_is_read_closed() {
        let mut h = Harness::server();
        h.feed(syn(1, true)).unwrap();
        h.feed(syn(3, false)).unwrap();

        let (mut first, reply) = h.accept();
        assert_eq!(first.stream_id(), 1);
        assert_eq!(first.headers().get_str(":method"), Some("GET"));
        assert!(first.is_last_frame_received());
        assert!(first.is_closed());
        assert!(matches!(first.poll_read_now(), Poll::Ready(None)));

        let (second, _reply) = h.accept();
        assert!(!second.is_last_frame_received());
        assert_eq!(h.conn.last_good_stream_id(), 3);

        let mut reply = reply.unwrap();
        reply.send_headers(response(), false).unwrap();
        reply.write(Bytes::from_static(b"hello"), true).unwrap();
        let out = h.output();
        assert!(matches!(
            &out[0],
            Decoded::Frame(Frame::SynReply(StreamHeaders { stream_id: 1, flags: 0, .. }))
        ));
        assert_eq!(
            out[1],
            Decoded::Data(DataChunk {
                stream_id: 1,
                data: Bytes::from_static(b"hello"),
                fin: true,
            })
        );
        assert_eq!(h.conn.open_streams(), 1);
    }

    #[test]
    fn reads_split_at_random_points() {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let mut h = Harness::server();
            let mut wire = BytesMut::new();
            h.encoder.encode_frame(&syn(1, false), &mut wire).unwrap();
            h.encoder
                .encode_data(1, false, b"hello world", &mut wire)
                .unwrap();
            h.encoder.encode_data(1, true, b"", &mut wire).unwrap();

            let mut rest = &wire[..];
            while !rest.is_empty() {
                let n = rng.gen_range(1..=rest.len().min(16));
                h.conn.handle_read(&rest[..n]).unwrap();
                rest = &rest[n..];
            }

            let (mut incoming, _reply) = h.accept();
            assert_eq!(incoming.headers(), request());
            let mut body = Vec::new();
            while let Poll::Ready(Some(Ok(chunk))) = incoming.poll_read_now() {
                body.extend_from_slice(&chunk);
            }
            assert_eq!(body, b"hello world");
            assert!(matches!(incoming.poll_read_now(), Poll::Ready(None)));
        }
    }

    struct Flag(AtomicBool);

    impl Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn pending_read_is_woken_by_data() {
        let mut h = Harness::server();
        h.feed(syn(1, false)).unwrap();
        let (mut incoming, _reply) = h.accept();

        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let waker = Waker::from(flag.clone());
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut incoming).poll_next(&mut cx).is_pending());

        h.feed_data(1, b"hi", true).unwrap();
        assert!(flag.0.load(Ordering::SeqCst));
        match Pin::new(&mut incoming).poll_next(&mut cx) {
            Poll::Ready(Some(Ok(chunk))) => assert_eq!(&chunk[..], b"hi"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            Pin::new(&mut incoming).poll_next(&mut cx),
            Poll::Ready(None)
        ));
    }

    #[test]
    fn data_waits_for_send_window() {
        let mut h = Harness::client();
        h.feed(setting(settings_id::INITIAL_WINDOW_SIZE, 0)).unwrap();
        let (mut out, _incoming) = h.conn.create_stream(request(), false).unwrap();
        out.write(Bytes::from_static(b"x"), false).unwrap();

        assert_eq!(h.conn.grab_flow_control_bytes(1), 0);
        assert_eq!(out.send_window(), Some(0));
        let sent = h.output();
        assert!(matches!(&sent[..], [Decoded::Frame(Frame::SynStream(_))]));
        assert!(h.conn.has_pending_writes());

        // stream credit alone is not enough, the connection is still shut
        h.feed(window_update(1, 10)).unwrap();
        assert!(data_of(&h.output(), 1).is_empty());

        h.feed(window_update(0, 10)).unwrap();
        assert_eq!(data_of(&h.output(), 1), b"x");
        assert_eq!(out.send_window(), Some(9));
        assert!(!h.conn.has_pending_writes());
    }

    #[test]
    fn connection_window_update_releases_parked_data() {
        let mut h = Harness::client();
        h.feed(setting(settings_id::INITIAL_WINDOW_SIZE, 0)).unwrap();
        let (mut out, _incoming) = h.conn.create_stream(request(), false).unwrap();
        h.feed(window_update(1, 100)).unwrap();
        out.write(Bytes::from_static(b"hello"), false).unwrap();
        assert_eq!(h.conn.send_window(), 0);
        assert!(data_of(&h.output(), 1).is_empty());

        h.feed(window_update(0, 1000)).unwrap();
        assert_eq!(data_of(&h.output(), 1), b"hello");
        assert_eq!(h.conn.send_window(), 995);
        assert_eq!(out.send_window(), Some(95));
    }

    #[test]
    fn no_new_streams_after_peer_go_away() {
        let mut h = Harness::server();
        let handled = h.conn.handle_frame(Frame::GoAway(GoAway {
            last_good_stream_id: 5,
            status: GoAwayStatus::Ok,
        }));
        assert_eq!(handled.unwrap(), Handled::Applied);
        assert!(h.conn.peer_gone_away());
        assert!(h.conn.is_going_away());

        let handled = h.conn.handle_frame(syn(7, false)).unwrap();
        assert_eq!(handled, Handled::Ignored(Ignored::PeerGoneAway(7)));
        assert!(h.accepted.lock().unwrap().is_empty());
        assert!(h.frames().is_empty());
        assert!(matches!(
            h.conn.push_stream(1, response(), true),
            Err(SpdyError::ChannelClosed)
        ));
    }

    #[test]
    fn go_away_resets_unprocessed_local_streams() {
        let mut h = Harness::client();
        let mut streams: Vec<_> = (0..3)
            .map(|_| h.conn.create_stream(request(), true).unwrap())
            .collect();
        h.output();

        h.feed(Frame::GoAway(GoAway {
            last_good_stream_id: 1,
            status: GoAwayStatus::Ok,
        }))
        .unwrap();
        assert!(h
            .frames()
            .iter()
            .all(|f| !matches!(f, Frame::RstStream(_))));

        assert!(streams[0].1.poll_read_now().is_pending());
        for (_, incoming) in streams.iter_mut().skip(1) {
            let id = incoming.stream_id();
            assert!(matches!(
                incoming.poll_read_now(),
                Poll::Ready(Some(Err(SpdyError::Reset(i)))) if i == id
            ));
        }
        assert!(matches!(
            h.conn.create_stream(request(), true),
            Err(SpdyError::ChannelClosed)
        ));
    }

    #[test]
    fn zero_length_header_name_is_a_connection_error() {
        let mut h = Harness::server();
        let mut headers = HeaderBlock::new();
        headers.append("", "x");
        let err = h
            .feed(Frame::SynStream(SynStream {
                stream_id: 1,
                associated_stream_id: 0,
                priority: 0,
                flags: 0,
                headers,
            }))
            .unwrap_err();
        assert!(matches!(err, SpdyError::Protocol(_)));
        assert!(err.is_connection_error());

        assert_eq!(
            h.frames(),
            vec![Frame::GoAway(GoAway {
                last_good_stream_id: 0,
                status: GoAwayStatus::ProtocolError,
            })]
        );
        assert!(h.sink.is_shut());
        assert!(h.conn.is_closed());
        assert!(matches!(
            h.conn.handle_read(&[0x80]),
            Err(SpdyError::ChannelClosed)
        ));
    }

    #[test]
    fn syn_stream_with_local_parity_is_a_connection_error() {
        let mut h = Harness::server();
        let err = h.feed(syn(2, false)).unwrap_err();
        assert!(matches!(err, SpdyError::Protocol(_)));
        assert!(matches!(
            &h.frames()[..],
            [Frame::GoAway(GoAway {
                status: GoAwayStatus::ProtocolError,
                ..
            })]
        ));
    }

    #[test]
    fn stream_ids_keep_parity() {
        fn prop(n: u8) -> TestResult {
            if n == 0 || n > 32 {
                return TestResult::discard();
            }
            let client = Harness::client();
            let ids: Vec<_> = (0..n)
                .map(|_| client.conn.create_stream(request(), true).unwrap())
                .map(|(out, _)| out.stream_id())
                .collect();
            let client_ok = ids
                .iter()
                .enumerate()
                .all(|(i, id)| *id == 1 + 2 * i as u32);

            let mut server = Harness::server();
            server.feed(syn(1, false)).unwrap();
            let pushed: Vec<_> = (0..n)
                .map(|_| server.conn.push_stream(1, response(), true).unwrap())
                .map(|out| out.stream_id())
                .collect();
            let server_ok = pushed
                .iter()
                .enumerate()
                .all(|(i, id)| *id == 2 + 2 * i as u32);
            TestResult::from_bool(client_ok && server_ok)
        }
        QuickCheck::new()
            .tests(20)
            .quickcheck(prop as fn(u8) -> TestResult);
    }

    #[test]
    fn rst_stream_is_sent_once() {
        let mut h = Harness::server();
        h.feed(syn(1, false)).unwrap();
        let (incoming, reply) = h.accept();
        let mut reply = reply.unwrap();
        reply.reset(RstStatus::Cancel);
        reply.reset(RstStatus::InternalError);
        assert!(reply.is_reset());
        assert!(matches!(
            reply.write(Bytes::from_static(b"late"), false),
            Err(SpdyError::Reset(1))
        ));
        drop(reply);
        drop(incoming);
        assert_eq!(
            h.frames(),
            vec![Frame::RstStream(RstStream {
                stream_id: 1,
                status: RstStatus::Cancel,
            })]
        );

        let handled = h
            .conn
            .handle_frame(Frame::RstStream(RstStream {
                stream_id: 1,
                status: RstStatus::Cancel,
            }))
            .unwrap();
        assert_eq!(handled, Handled::Ignored(Ignored::UnknownStream(1)));
        assert!(h.frames().is_empty());
        assert_eq!(h.conn.open_streams(), 0);
    }

    #[test]
    fn peer_reset_ends_the_stream_without_answer() {
        let mut h = Harness::client();
        let (out, mut incoming) = h.conn.create_stream(request(), false).unwrap();
        h.output();
        h.feed(Frame::RstStream(RstStream {
            stream_id: 1,
            status: RstStatus::RefusedStream,
        }))
        .unwrap();
        assert!(matches!(
            incoming.poll_read_now(),
            Poll::Ready(Some(Err(SpdyError::Reset(1))))
        ));
        assert!(out.is_reset());
        drop(out);
        drop(incoming);
        assert!(h.frames().is_empty());
    }

    #[test]
    fn streams_over_the_limit_are_refused() {
        let config = Config {
            max_concurrent_streams: Some(1),
            ..Config::default()
        };
        let mut h = Harness::new(Role::Server, config);
        assert_eq!(
            h.frames(),
            vec![setting(settings_id::MAX_CONCURRENT_STREAMS, 1)]
        );

        h.feed(syn(1, false)).unwrap();
        let handled = h.conn.handle_frame(syn(3, false)).unwrap();
        assert_eq!(handled, Handled::Ignored(Ignored::Refused(3)));
        assert_eq!(
            h.frames(),
            vec![Frame::RstStream(RstStream {
                stream_id: 3,
                status: RstStatus::RefusedStream,
            })]
        );
        assert_eq!(h.accepted.lock().unwrap().len(), 1);

        // finishing both halves of stream 1 frees the slot
        h.feed_data(1, b"", true).unwrap();
        let (_incoming, reply) = h.accept();
        reply.unwrap().send_headers(response(), true).unwrap();
        assert_eq!(h.conn.open_streams(), 0);
        h.feed(syn(5, false)).unwrap();
        assert_eq!(h.accept().0.stream_id(), 5);
    }

    #[test]
    fn settings_change_stream_windows() {
        let mut h = Harness::client();
        let (out, _incoming) = h.conn.create_stream(request(), false).unwrap();
        assert_eq!(out.send_window(), Some(DEFAULT_INITIAL_WINDOW_SIZE));

        h.feed(setting(settings_id::INITIAL_WINDOW_SIZE, 1000)).unwrap();
        assert_eq!(out.send_window(), Some(1000));
        assert_eq!(
            h.conn.peer_settings().get(settings_id::INITIAL_WINDOW_SIZE),
            Some(1000)
        );

        let handled = h
            .conn
            .handle_frame(setting(settings_id::ROUND_TRIP_TIME, 20))
            .unwrap();
        assert_eq!(
            handled,
            Handled::Ignored(Ignored::UnknownSetting(settings_id::ROUND_TRIP_TIME))
        );
        assert_eq!(h.conn.peer_settings().entries.len(), 2);

        h.feed(Frame::Settings(Settings {
            flags: FLAG_SETTINGS_CLEAR_SETTINGS,
            entries: vec![],
        }))
        .unwrap();
        assert!(h.conn.peer_settings().entries.is_empty());
    }

    #[test]
    fn peer_max_concurrent_streams_limits_local_streams() {
        let mut h = Harness::client();
        h.feed(setting(settings_id::MAX_CONCURRENT_STREAMS, 1)).unwrap();
        let (_out, _incoming) = h.conn.create_stream(request(), false).unwrap();
        assert!(matches!(
            h.conn.create_stream(request(), false),
            Err(SpdyError::StreamLimit)
        ));
    }

    #[test]
    fn pings_are_echoed_and_matched() {
        let mut h = Harness::server();
        h.feed(Frame::Ping(Ping { id: 1 })).unwrap();
        assert_eq!(h.frames(), vec![Frame::Ping(Ping { id: 1 })]);

        let id = h.conn.ping().unwrap();
        assert_eq!(id, 2);
        assert_eq!(h.frames(), vec![Frame::Ping(Ping { id: 2 })]);
        assert_eq!(h.conn.outstanding_pings(), 1);

        let handled = h.conn.handle_frame(Frame::Ping(Ping { id: 2 })).unwrap();
        assert_eq!(handled, Handled::Applied);
        assert_eq!(h.conn.outstanding_pings(), 0);
        let handled = h.conn.handle_frame(Frame::Ping(Ping { id: 2 })).unwrap();
        assert_eq!(handled, Handled::Ignored(Ignored::UnsolicitedPong(2)));
        assert!(h.frames().is_empty());
    }

    #[test]
    fn reading_returns_receive_window() {
        let mut h = Harness::server();
        h.feed(syn(1, false)).unwrap();
        let (mut incoming, _reply) = h.accept();
        let body = vec![7u8; 40_000];
        h.feed_data(1, &body, false).unwrap();
        assert!(h.frames().is_empty());

        let mut read = 0;
        while let Poll::Ready(Some(Ok(chunk))) = incoming.poll_read_now() {
            read += chunk.len();
        }
        assert_eq!(read, body.len());

        let mut credited = (0, 0);
        for frame in h.frames() {
            if let Frame::WindowUpdate(update) = frame {
                if update.stream_id == 0 {
                    credited.0 += update.delta;
                } else {
                    assert_eq!(update.stream_id, 1);
                    credited.1 += update.delta;
                }
            }
        }
        assert_eq!(credited, (40_000, 40_000));
    }

    #[test]
    fn stream_receive_window_overrun_resets_the_stream() {
        let config = Config {
            initial_window_size: 100,
            ..Config::default()
        };
        let mut h = Harness::new(Role::Server, config);
        h.output();
        h.feed(syn(1, false)).unwrap();
        let (mut incoming, _reply) = h.accept();

        h.feed_data(1, &[0u8; 101], false).unwrap();
        assert!(h.frames().contains(&Frame::RstStream(RstStream {
            stream_id: 1,
            status: RstStatus::FlowControlError,
        })));
        assert!(matches!(
            incoming.poll_read_now(),
            Poll::Ready(Some(Err(SpdyError::Reset(1))))
        ));
        assert!(!h.conn.is_closed());
    }

    #[test]
    fn data_for_unknown_stream_is_ignored() {
        let mut h = Harness::server();
        let handled = h
            .conn
            .handle_data(DataChunk {
                stream_id: 9,
                data: Bytes::from_static(b"stray"),
                fin: false,
            })
            .unwrap();
        assert_eq!(handled, Handled::Ignored(Ignored::UnknownStream(9)));
        assert!(h.frames().is_empty());
    }

    #[test]
    fn duplicate_syn_reply_is_stream_in_use() {
        let mut h = Harness::client();
        let (_out, incoming) = h.conn.create_stream(request(), true).unwrap();
        h.output();
        assert_eq!(h.conn.handle_frame(reply(1, false)).unwrap(), Handled::Applied);
        assert_eq!(incoming.headers().get_str(":status"), Some("200"));

        let err = h.conn.handle_frame(reply(1, false)).unwrap_err();
        assert!(matches!(
            err,
            SpdyError::Stream {
                stream_id: 1,
                status: RstStatus::StreamInUse
            }
        ));
        assert_eq!(
            h.frames(),
            vec![Frame::RstStream(RstStream {
                stream_id: 1,
                status: RstStatus::StreamInUse,
            })]
        );
    }

    #[test]
    fn trailing_headers_are_merged() {
        let mut h = Harness::client();
        let (_out, mut incoming) = h.conn.create_stream(request(), true).unwrap();
        h.feed(reply(1, false)).unwrap();
        h.feed_data(1, b"body", false).unwrap();
        let mut trailers = HeaderBlock::new();
        trailers.append("grpc-status", "0");
        h.feed(Frame::Headers(StreamHeaders {
            stream_id: 1,
            flags: FLAG_FIN,
            headers: trailers,
        }))
        .unwrap();

        assert!(incoming.is_last_frame_received());
        let headers = incoming.headers();
        assert_eq!(headers.get_str(":status"), Some("200"));
        assert_eq!(headers.get_str("grpc-status"), Some("0"));
        assert!(matches!(
            incoming.poll_read_now(),
            Poll::Ready(Some(Ok(b))) if &b[..] == b"body"
        ));
        assert!(matches!(incoming.poll_read_now(), Poll::Ready(None)));
        assert_eq!(h.conn.open_streams(), 0);
    }

    #[test]
    fn reply_needs_headers_before_data() {
        let mut h = Harness::server();
        h.feed(syn(1, true)).unwrap();
        let (_incoming, reply) = h.accept();
        let mut reply = reply.unwrap();
        assert!(matches!(
            reply.write(Bytes::from_static(b"x"), false),
            Err(SpdyError::HeadersNotSent(1))
        ));
        reply.send_headers(response(), true).unwrap();
        assert!(reply.is_finished());
        assert!(matches!(reply.finish(), Err(SpdyError::StreamFinished(1))));
    }

    #[test]
    fn roles_guard_stream_creation() {
        let server = Harness::server();
        assert!(matches!(
            server.conn.create_stream(request(), true),
            Err(SpdyError::Unsupported(_))
        ));
        let client = Harness::client();
        assert!(matches!(
            client.conn.push_stream(2, response(), true),
            Err(SpdyError::Unsupported(_))
        ));
        let (out, _incoming) = client
            .conn
            .create_stream_with_priority(request(), 9, true)
            .unwrap();
        assert_eq!(out.priority(), 7);
    }

    #[test]
    fn pushed_streams_are_unidirectional() {
        let mut h = Harness::server();
        h.feed(syn(1, false)).unwrap();
        let mut pushed = h.conn.push_stream(1, response(), false).unwrap();
        pushed.write(Bytes::from_static(b"asset"), true).unwrap();
        let out = h.output();
        match &out[0] {
            Decoded::Frame(Frame::SynStream(syn)) => {
                assert_eq!(syn.stream_id, 2);
                assert_eq!(syn.associated_stream_id, 1);
                assert!(syn.is_unidirectional());
                assert!(!syn.is_fin());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(data_of(&out, 2), b"asset");
    }

    #[test]
    fn fin_on_open_leaves_nothing_to_send() {
        let mut h = Harness::client();
        h.output();
        let (mut out, _incoming) = h.conn.create_stream(request(), true).unwrap();
        assert!(matches!(
            out.write(Bytes::from_static(b"late"), false),
            Err(SpdyError::StreamFinished(1))
        ));
        assert!(matches!(
            out.send_headers(response(), false),
            Err(SpdyError::StreamFinished(1))
        ));
        drop(out);
        let out = h.output();
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Decoded::Frame(Frame::SynStream(syn)) if syn.is_fin()));

        let mut h = Harness::server();
        h.feed(syn(1, false)).unwrap();
        h.output();
        let pushed = h.conn.push_stream(1, response(), true).unwrap();
        drop(pushed);
        let frames = h.frames();
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Frame::SynStream(syn) if syn.stream_id == 2 && syn.is_fin()));
        assert_eq!(h.conn.open_streams(), 1);
    }

    #[test]
    fn oversized_header_block_fails_only_its_stream() {
        let mut h = Harness::server();
        h.feed(syn(1, false)).unwrap();
        h.feed(syn(3, false)).unwrap();
        let (_first, reply1) = h.accept();
        let (_second, reply3) = h.accept();
        let (mut reply1, mut reply3) = (reply1.unwrap(), reply3.unwrap());
        h.output();

        let mut big = response();
        big.insert("x-big", vec![b'a'; MAX_HEADER_BLOCK_SIZE]);
        assert!(matches!(
            reply1.send_headers(big.clone(), false),
            Err(SpdyError::HeaderBlockTooLarge(_))
        ));
        assert!(h.frames().is_empty());
        reply3.send_headers(response(), true).unwrap();

        // one that slipped into the queue resets its stream on flush
        let inner = h.conn.shared.incoming.get(1).unwrap();
        let item = StreamItem::Frame(Frame::SynReply(stream_headers(1, false, big)));
        h.conn.shared.queue_stream(&inner, item).unwrap();
        h.feed(Frame::Ping(Ping { id: 1 })).unwrap();
        assert_eq!(
            h.frames(),
            vec![
                reply(3, true),
                Frame::RstStream(RstStream {
                    stream_id: 1,
                    status: RstStatus::FrameTooLarge,
                }),
                Frame::Ping(Ping { id: 1 }),
            ]
        );
        assert!(!h.conn.is_closed());
        assert!(reply1.send_headers(response(), false).is_err());
    }

    #[test]
    fn oversized_request_headers_take_no_stream_id() {
        let mut h = Harness::client();
        h.output();
        let mut big = request();
        big.insert("x-big", vec![b'a'; MAX_HEADER_BLOCK_SIZE]);
        assert!(matches!(
            h.conn.create_stream(big, false),
            Err(SpdyError::HeaderBlockTooLarge(_))
        ));
        let (_out, _incoming) = h.conn.create_stream(request(), false).unwrap();
        assert!(matches!(
            &h.frames()[..],
            [Frame::SynStream(SynStream { stream_id: 1, .. })]
        ));
        assert_eq!(h.conn.open_streams(), 1);
    }

    #[test]
    fn peer_close_without_go_away_answers_with_protocol_error() {
        let mut h = Harness::client();
        let (mut out, mut incoming) = h.conn.create_stream(request(), false).unwrap();
        h.output();
        h.conn.on_peer_closed();
        assert_eq!(
            h.frames(),
            vec![Frame::GoAway(GoAway {
                last_good_stream_id: 0,
                status: GoAwayStatus::ProtocolError,
            })]
        );
        assert!(h.conn.is_closed());
        assert!(matches!(
            incoming.poll_read_now(),
            Poll::Ready(Some(Err(SpdyError::ChannelClosed)))
        ));
        assert!(matches!(
            out.write(Bytes::from_static(b"x"), false),
            Err(SpdyError::ChannelClosed)
        ));
    }

    #[test]
    fn peer_close_after_go_away_is_quiet() {
        let mut h = Harness::client();
        h.feed(Frame::GoAway(GoAway {
            last_good_stream_id: 0,
            status: GoAwayStatus::Ok,
        }))
        .unwrap();
        h.conn.on_peer_closed();
        assert!(h.frames().is_empty());
        assert!(h.conn.is_closed());
    }

    #[test]
    fn local_go_away_is_sent_once_and_refuses_new_streams() {
        let mut h = Harness::server();
        h.feed(syn(1, false)).unwrap();
        h.conn.send_go_away(GoAwayStatus::Ok).unwrap();
        h.conn.send_go_away(GoAwayStatus::InternalError).unwrap();
        assert_eq!(
            h.frames(),
            vec![Frame::GoAway(GoAway {
                last_good_stream_id: 1,
                status: GoAwayStatus::Ok,
            })]
        );
        assert!(h.sink.is_shut());
        let handled = h.conn.handle_frame(syn(3, false)).unwrap();
        assert_eq!(handled, Handled::Ignored(Ignored::Refused(3)));
    }
}
