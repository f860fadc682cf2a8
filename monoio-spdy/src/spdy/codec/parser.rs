use bytes::{Buf, BytesMut};

use super::inflate::HeaderInflater;
use crate::common::error::SpdyError;

/// Body logic of one logical unit (a control frame body).
///
/// `handle_data` consumes as much of `src` as it can act on and leaves the
/// rest in place; whatever it leaves is handed back, prefixed to new input,
/// on the next call. It must cope with an empty `src`.
pub(crate) trait HandleData {
    fn handle_data(
        &mut self,
        src: &mut &[u8],
        inflater: &mut HeaderInflater,
    ) -> Result<(), SpdyError>;

    /// Called once, after the last byte of the unit was handed over.
    fn finished(&mut self) -> Result<(), SpdyError> {
        Ok(())
    }
}

/// Drives a `HandleData` over a unit of known length that may arrive split
/// across any number of input buffers.
#[derive(Debug)]
pub(crate) struct PushBackParser<P> {
    /// Bytes of the unit not yet taken from the input.
    remaining: usize,
    /// Taken but not yet consumed by the handler.
    pushed_back: Option<BytesMut>,
    finished: bool,
    handler: P,
}

impl<P: HandleData> PushBackParser<P> {
    pub(crate) fn new(length: usize, handler: P) -> Self {
        Self {
            remaining: length,
            pushed_back: None,
            finished: false,
            handler,
        }
    }

    /// Take at most the unit's remaining bytes from `src`. Returns whether
    /// the unit is complete; bytes past the unit are left in `src`.
    pub(crate) fn parse(
        &mut self,
        src: &mut &[u8],
        inflater: &mut HeaderInflater,
    ) -> Result<bool, SpdyError> {
        if self.finished {
            return Ok(true);
        }
        let take = src.len().min(self.remaining);
        let (unit, rest) = src.split_at(take);
        *src = rest;
        self.remaining -= take;

        match self.pushed_back.take() {
            Some(mut pending) => {
                pending.extend_from_slice(unit);
                let mut view: &[u8] = &pending;
                self.handler.handle_data(&mut view, inflater)?;
                let consumed = pending.len() - view.len();
                pending.advance(consumed);
                if !pending.is_empty() {
                    self.pushed_back = Some(pending);
                }
            }
            None => {
                let mut view = unit;
                self.handler.handle_data(&mut view, inflater)?;
                if !view.is_empty() {
                    // The caller reuses its buffer, so leftovers are copied out.
                    self.pushed_back = Some(BytesMut::from(view));
                }
            }
        }

        if self.remaining == 0 {
            self.finished = true;
            if self.pushed_back.is_some() {
                return Err(SpdyError::protocol("frame body shorter than its fields"));
            }
            self.handler.finished()?;
        }
        Ok(self.finished)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining
    }

    pub(crate) fn into_handler(self) -> P {
        self.handler
    }
}
