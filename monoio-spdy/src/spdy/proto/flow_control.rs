use fnv::{FnvHashMap, FnvHashSet};
use smallvec::SmallVec;

use crate::{
    common::error::SpdyError,
    spdy::frame::{RstStatus, StreamId, WindowUpdate},
};

pub type WindowSize = i32;

/// SPDY/3 initial window, for streams and for the connection.
pub const DEFAULT_INITIAL_WINDOW_SIZE: WindowSize = 64 * 1_024;

pub const MAX_WINDOW_SIZE: WindowSize = WindowSize::MAX;

/// Sending budget of one stream.
///
/// `initial_window_size` is the connection-wide initial window this window
/// last accounted for; a SETTINGS change made since is folded in by
/// `resync` on the next send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    window: WindowSize,
    initial_window_size: WindowSize,
}

impl SendWindow {
    pub fn new(initial_window_size: WindowSize) -> Self {
        Self {
            window: initial_window_size,
            initial_window_size,
        }
    }

    pub fn window(&self) -> WindowSize {
        self.window
    }

    /// Fold in the difference between the initial window last seen and the
    /// current one.
    pub fn resync(&mut self, current: WindowSize) {
        if current != self.initial_window_size {
            self.window = self
                .window
                .saturating_add(current.saturating_sub(self.initial_window_size));
            self.initial_window_size = current;
        }
    }

    /// Returns false if the window would overflow.
    pub fn increase(&mut self, delta: u32) -> bool {
        match self.window.checked_add(delta as WindowSize) {
            Some(w) if delta <= MAX_WINDOW_SIZE as u32 => {
                self.window = w;
                true
            }
            _ => false,
        }
    }

    fn take(&mut self, n: usize) {
        self.window -= n as WindowSize;
    }

    fn available(&self) -> usize {
        self.window.max(0) as usize
    }
}

/// Receiving budget. Arriving DATA spends `available`; bytes the application
/// has read are credited back to the peer with a WINDOW_UPDATE once the
/// window falls under half of its initial size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveWindow {
    initial: WindowSize,
    available: WindowSize,
    /// Read but not yet credited.
    unclaimed: WindowSize,
}

impl ReceiveWindow {
    pub fn new(initial: WindowSize) -> Self {
        Self {
            initial,
            available: initial,
            unclaimed: 0,
        }
    }

    pub fn available(&self) -> WindowSize {
        self.available
    }

    /// Account for `n` arriving bytes. Returns false if the peer overran
    /// the window; the bytes are accounted anyway.
    pub fn receive(&mut self, n: usize) -> bool {
        let n = n.min(MAX_WINDOW_SIZE as usize) as WindowSize;
        let fits = n <= self.available;
        self.available = self.available.saturating_sub(n);
        fits
    }

    /// Account for `n` bytes handed to the application. Returns the
    /// WINDOW_UPDATE delta to send, if it is time for one.
    pub fn read(&mut self, n: usize) -> Option<u32> {
        self.unclaimed = self
            .unclaimed
            .saturating_add(n.min(MAX_WINDOW_SIZE as usize) as WindowSize);
        if self.unclaimed > 0 && self.available < self.initial / 2 {
            let delta = self.unclaimed;
            self.available = self.available.saturating_add(delta);
            self.unclaimed = 0;
            Some(delta as u32)
        } else {
            None
        }
    }

    fn adjust(&mut self, delta: WindowSize) {
        self.initial = self.initial.saturating_add(delta);
        self.available = self.available.saturating_add(delta);
    }
}

#[derive(Debug)]
struct StreamFlow {
    send: SendWindow,
    receive: ReceiveWindow,
}

/// All flow-control accounting of one connection. The connection keeps it
/// behind a single lock, so every read-modify-write here is serialized.
#[derive(Debug)]
pub struct FlowControl {
    send_window: WindowSize,
    receive: ReceiveWindow,
    /// Initial send window of streams, as last announced by the peer.
    initial_send_window: WindowSize,
    /// Initial receive window of streams, as configured locally.
    initial_receive_window: WindowSize,
    streams: FnvHashMap<StreamId, StreamFlow>,
    /// Closed streams whose queued frames may still need their window.
    retired: FnvHashSet<StreamId>,
}

impl FlowControl {
    pub fn new(initial_receive_window: WindowSize) -> Self {
        Self {
            send_window: DEFAULT_INITIAL_WINDOW_SIZE,
            receive: ReceiveWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            initial_send_window: DEFAULT_INITIAL_WINDOW_SIZE,
            initial_receive_window,
            streams: FnvHashMap::default(),
            retired: FnvHashSet::default(),
        }
    }

    pub fn send_window(&self) -> WindowSize {
        self.send_window
    }

    pub fn receive_window(&self) -> WindowSize {
        self.receive.available()
    }

    pub fn initial_send_window(&self) -> WindowSize {
        self.initial_send_window
    }

    /// Take up to `requested` bytes of the connection send window. The
    /// amount returned is deducted before it is returned.
    pub fn grab_flow_control_bytes(&mut self, requested: usize) -> usize {
        let granted = requested.min(self.send_window.max(0) as usize);
        self.send_window -= granted as WindowSize;
        granted
    }

    /// Take up to `requested` bytes for a stream, bounded by both the
    /// stream's and the connection's window and deducted from both.
    pub fn grab_for_stream(&mut self, stream_id: StreamId, requested: usize) -> usize {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return 0;
        };
        stream.send.resync(self.initial_send_window);
        let granted = requested
            .min(stream.send.available())
            .min(self.send_window.max(0) as usize);
        stream.send.take(granted);
        self.send_window -= granted as WindowSize;
        granted
    }

    pub fn stream_send_window(&mut self, stream_id: StreamId) -> Option<WindowSize> {
        let initial = self.initial_send_window;
        self.streams.get_mut(&stream_id).map(|s| {
            s.send.resync(initial);
            s.send.window()
        })
    }

    pub fn register(&mut self, stream_id: StreamId) {
        self.streams.insert(
            stream_id,
            StreamFlow {
                send: SendWindow::new(self.initial_send_window),
                receive: ReceiveWindow::new(self.initial_receive_window),
            },
        );
    }

    pub fn remove(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
        self.retired.remove(&stream_id);
    }

    /// The stream is closed but may still have queued frames. It is
    /// dropped by the next `sweep` that finds nothing queued.
    pub fn retire(&mut self, stream_id: StreamId) {
        if self.streams.contains_key(&stream_id) {
            self.retired.insert(stream_id);
        }
    }

    pub fn sweep(&mut self, mut has_queued: impl FnMut(StreamId) -> bool) {
        let done: SmallVec<[StreamId; 8]> = self
            .retired
            .iter()
            .copied()
            .filter(|id| !has_queued(*id))
            .collect();
        for id in done {
            self.remove(id);
        }
    }

    pub fn is_tracked(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// WINDOW_UPDATE for the whole connection. Returns whether the window
    /// was exhausted before.
    pub fn update_send_window(&mut self, delta: u32) -> Result<bool, SpdyError> {
        let was_exhausted = self.send_window <= 0;
        match self.send_window.checked_add(delta as WindowSize) {
            Some(w) if delta <= MAX_WINDOW_SIZE as u32 => self.send_window = w,
            _ => return Err(SpdyError::protocol("connection send window overflow")),
        }
        Ok(was_exhausted)
    }

    /// WINDOW_UPDATE for one stream. `Ok(false)` means the stream is unknown.
    pub fn update_stream_send_window(
        &mut self,
        stream_id: StreamId,
        delta: u32,
    ) -> Result<bool, SpdyError> {
        let initial = self.initial_send_window;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(false);
        };
        stream.send.resync(initial);
        if stream.send.increase(delta) {
            Ok(true)
        } else {
            Err(SpdyError::stream(stream_id, RstStatus::FlowControlError))
        }
    }

    /// The peer changed SETTINGS_INITIAL_WINDOW_SIZE. The difference is
    /// applied to both connection windows right away; open streams pick it
    /// up lazily through `SendWindow::resync`.
    pub fn apply_initial_window_size(&mut self, value: u32) -> WindowSize {
        let value = value.min(MAX_WINDOW_SIZE as u32) as WindowSize;
        let delta = value - self.initial_send_window;
        self.initial_send_window = value;
        self.send_window = self.send_window.saturating_add(delta);
        self.receive.adjust(delta);
        delta
    }

    /// DATA arrived. The connection window is only accounted; a stream
    /// that overran its own window is a stream error.
    pub fn on_data(&mut self, stream_id: StreamId, n: usize) -> Result<(), SpdyError> {
        if !self.receive.receive(n) {
            tracing::debug!(
                len = n,
                window = self.receive.available(),
                "peer overran the connection window"
            );
        }
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if !stream.receive.receive(n) {
                return Err(SpdyError::stream(stream_id, RstStatus::FlowControlError));
            }
        }
        Ok(())
    }

    /// The application consumed `n` bytes of a stream (or they were
    /// discarded). Returns the WINDOW_UPDATEs now due.
    pub fn on_read(&mut self, stream_id: StreamId, n: usize) -> SmallVec<[WindowUpdate; 2]> {
        let mut updates = SmallVec::new();
        if n == 0 {
            return updates;
        }
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if let Some(delta) = stream.receive.read(n) {
                updates.push(WindowUpdate { stream_id, delta });
            }
        }
        if let Some(delta) = self.receive.read(n) {
            updates.push(WindowUpdate {
                stream_id: 0,
                delta,
            });
        }
        updates
    }

    pub fn clear(&mut self) {
        self.streams.clear();
        self.retired.clear();
    }
}
