use std::sync::Arc;

use bytes::BytesMut;
use flate2::{Compress, Compression, FlushCompress};
use smallvec::SmallVec;

use super::dictionary::SPDY_DICTIONARY;
use crate::{
    common::{error::SpdyError, header::HeaderBlock},
    util::pool::{BufferPool, PooledBuffer},
};

const MIN_SCRATCH: usize = 256;

/// Sending half of the session's header compression stream.
pub(crate) struct HeaderDeflater {
    compress: Compress,
    pool: Arc<dyn BufferPool>,
}

impl HeaderDeflater {
    pub(crate) fn new(pool: Arc<dyn BufferPool>) -> Result<Self, SpdyError> {
        let mut compress = Compress::new(Compression::default(), true);
        compress.set_dictionary(SPDY_DICTIONARY)?;
        Ok(Self { compress, pool })
    }

    /// Compress one header block, sync-flushed so the peer can decode it
    /// without waiting for the next one.
    ///
    /// Output that outgrows one pooled buffer continues in another; the
    /// pieces are joined into the returned block.
    pub(crate) fn compress_block(&mut self, headers: &HeaderBlock) -> Result<BytesMut, SpdyError> {
        let mut raw = PooledBuffer::new(&self.pool);
        headers.encode_raw(&mut raw);
        let size = self.pool.buffer_size().max(MIN_SCRATCH);

        let mut pieces: SmallVec<[PooledBuffer; 2]> = SmallVec::new();
        let mut input: &[u8] = &raw;
        loop {
            let mut out = PooledBuffer::new(&self.pool);
            out.resize(size, 0);
            let in_before = self.compress.total_in();
            let out_before = self.compress.total_out();
            self.compress
                .compress(input, &mut out[..], FlushCompress::Sync)?;
            let consumed = (self.compress.total_in() - in_before) as usize;
            let produced = (self.compress.total_out() - out_before) as usize;
            input = &input[consumed..];
            out.truncate(produced);
            pieces.push(out);
            if input.is_empty() && produced < size {
                break;
            }
        }

        let total = pieces.iter().map(|p| p.len()).sum();
        let mut block = BytesMut::with_capacity(total);
        for piece in pieces.iter() {
            block.extend_from_slice(piece);
        }
        Ok(block)
    }
}

impl std::fmt::Debug for HeaderDeflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderDeflater")
            .field("total_in", &self.compress.total_in())
            .field("total_out", &self.compress.total_out())
            .finish()
    }
}
