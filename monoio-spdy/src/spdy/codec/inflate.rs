//! Header block decompression.
//!
//! A session has one zlib stream per direction; every header block the peer
//! sends continues it. `HeaderInflater` owns the receiving stream and
//! `HeaderBlockParser` turns its output into a `HeaderBlock`, one field at a
//! time, keeping partial fields across calls.
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use flate2::{Decompress, FlushDecompress};

use super::{dictionary::SPDY_DICTIONARY, parser::HandleData};
use crate::{
    common::{error::SpdyError, header::HeaderBlock},
    util::pool::{BufferPool, PooledBuffer},
};

/// Scratch buffers smaller than this make zlib spin for no benefit.
const MIN_SCRATCH: usize = 256;

/// Upper bound on the decompressed size of one header block.
pub const MAX_HEADER_BLOCK_SIZE: usize = 1024 * 1024;

pub(crate) struct HeaderInflater {
    decompress: Decompress,
    pool: Arc<dyn BufferPool>,
}

impl HeaderInflater {
    pub(crate) fn new(pool: Arc<dyn BufferPool>) -> Self {
        Self {
            decompress: Decompress::new(true),
            pool,
        }
    }

    /// Inflate all of `input`, handing the output to `block`.
    ///
    /// Input is fed in scratch-sized pieces and output drained until zlib
    /// neither consumes nor produces anything more.
    pub(crate) fn inflate(
        &mut self,
        mut input: &[u8],
        block: &mut HeaderBlockParser,
    ) -> Result<(), SpdyError> {
        let mut scratch = PooledBuffer::new(&self.pool);
        let size = self.pool.buffer_size().max(MIN_SCRATCH);
        scratch.resize(size, 0);

        loop {
            let in_before = self.decompress.total_in();
            let out_before = self.decompress.total_out();
            let piece = &input[..input.len().min(size)];
            let res = self
                .decompress
                .decompress(piece, &mut scratch[..], FlushDecompress::Sync);
            let consumed = (self.decompress.total_in() - in_before) as usize;
            let produced = (self.decompress.total_out() - out_before) as usize;
            input = &input[consumed..];

            let mut dictionary_set = false;
            if let Err(e) = res {
                if e.needs_dictionary().is_none() {
                    return Err(e.into());
                }
                tracing::trace!("header inflater loading dictionary");
                self.decompress.set_dictionary(SPDY_DICTIONARY)?;
                dictionary_set = true;
            }

            if produced > 0 {
                block.feed_output(&scratch[..produced])?;
            }

            if dictionary_set {
                continue;
            }
            if input.is_empty() && produced < size {
                return Ok(());
            }
            if consumed == 0 && produced == 0 {
                return Err(SpdyError::protocol("header block stalled"));
            }
        }
    }
}

impl std::fmt::Debug for HeaderInflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderInflater")
            .field("total_in", &self.decompress.total_in())
            .field("total_out", &self.decompress.total_out())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldState {
    NameLen,
    Name(usize),
    ValueLen,
    Value(usize),
}

/// Incremental name/value parser over decompressed header block bytes.
#[derive(Debug)]
pub(crate) struct HeaderBlockParser {
    headers: HeaderBlock,
    num_headers: Option<u32>,
    read_headers: u32,
    state: FieldState,
    /// A name or value whose bytes span several outputs.
    partial: BytesMut,
    name: Option<String>,
    /// Decompressed bytes too short to parse yet (a split length prefix).
    overflow: BytesMut,
    decoded: usize,
}

impl Default for HeaderBlockParser {
    fn default() -> Self {
        Self {
            headers: HeaderBlock::new(),
            num_headers: None,
            read_headers: 0,
            state: FieldState::NameLen,
            partial: BytesMut::new(),
            name: None,
            overflow: BytesMut::new(),
            decoded: 0,
        }
    }
}

impl HeaderBlockParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn into_headers(self) -> HeaderBlock {
        self.headers
    }

    /// Accept one slice of decompressed output.
    pub(crate) fn feed_output(&mut self, out: &[u8]) -> Result<(), SpdyError> {
        self.decoded += out.len();
        if self.decoded > MAX_HEADER_BLOCK_SIZE {
            return Err(SpdyError::protocol("header block too large"));
        }
        if self.overflow.is_empty() {
            let mut view = out;
            self.parse_fields(&mut view)?;
            self.overflow.extend_from_slice(view);
        } else {
            let mut buf = std::mem::take(&mut self.overflow);
            buf.extend_from_slice(out);
            let mut view: &[u8] = &buf;
            self.parse_fields(&mut view)?;
            let consumed = buf.len() - view.len();
            buf.advance(consumed);
            self.overflow = buf;
        }
        Ok(())
    }

    fn parse_fields(&mut self, src: &mut &[u8]) -> Result<(), SpdyError> {
        let num_headers = match self.num_headers {
            Some(n) => n,
            None => {
                if src.len() < 4 {
                    return Ok(());
                }
                let n = src.get_u32();
                self.num_headers = Some(n);
                n
            }
        };

        while self.read_headers < num_headers {
            match self.state {
                FieldState::NameLen => {
                    if src.len() < 4 {
                        return Ok(());
                    }
                    let len = src.get_u32() as usize;
                    if len == 0 {
                        return Err(SpdyError::protocol("zero length header name"));
                    }
                    self.state = FieldState::Name(len);
                }
                FieldState::Name(len) => {
                    if !self.read_field(src, len) {
                        return Ok(());
                    }
                    let raw = self.partial.split();
                    let mut name = String::from_utf8(raw.to_vec())
                        .map_err(|_| SpdyError::protocol("header name is not utf-8"))?;
                    name.make_ascii_lowercase();
                    self.name = Some(name);
                    self.state = FieldState::ValueLen;
                }
                FieldState::ValueLen => {
                    if src.len() < 4 {
                        return Ok(());
                    }
                    self.state = FieldState::Value(src.get_u32() as usize);
                }
                FieldState::Value(len) => {
                    if !self.read_field(src, len) {
                        return Ok(());
                    }
                    let value = self.partial.split().freeze();
                    let name = self
                        .name
                        .take()
                        .ok_or(SpdyError::protocol("header value without name"))?;
                    let mut start = 0;
                    for nul in memchr::memchr_iter(0, &value) {
                        self.headers.append(name.clone(), value.slice(start..nul));
                        start = nul + 1;
                    }
                    self.headers.append(name, value.slice(start..));
                    self.read_headers += 1;
                    self.state = FieldState::NameLen;
                }
            }
        }

        if !src.is_empty() {
            return Err(SpdyError::protocol("data after the last header"));
        }
        Ok(())
    }

    /// Move up to `len` bytes of the current field into `partial`; true once
    /// the whole field is there.
    fn read_field(&mut self, src: &mut &[u8], len: usize) -> bool {
        let n = (len - self.partial.len()).min(src.len());
        self.partial.extend_from_slice(&src[..n]);
        src.advance(n);
        self.partial.len() == len
    }

    fn is_complete(&self) -> bool {
        match self.num_headers {
            None => self.decoded == 0,
            Some(n) => {
                n == self.read_headers
                    && self.state == FieldState::NameLen
                    && self.partial.is_empty()
                    && self.overflow.is_empty()
            }
        }
    }
}

impl HandleData for HeaderBlockParser {
    fn handle_data(
        &mut self,
        src: &mut &[u8],
        inflater: &mut HeaderInflater,
    ) -> Result<(), SpdyError> {
        if src.is_empty() {
            return Ok(());
        }
        inflater.inflate(src, self)?;
        *src = &[];
        Ok(())
    }

    fn finished(&mut self) -> Result<(), SpdyError> {
        if !self.is_complete() {
            return Err(SpdyError::protocol("truncated header block"));
        }
        Ok(())
    }
}
