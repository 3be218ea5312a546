use std::io::{self, SeekFrom};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

/// Starting window for reads of unknown length.
pub(crate) const DEFAULT_CAPACITY: usize = 16 * 1024;

/// Fixed window over a growable allocation.
///
/// The window widens by half its current size, carrying filled content
/// along, and never narrows during an operation.
pub(crate) struct TransferBuffer {
    buf: BytesMut,
    filled: usize,
}

impl TransferBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self { buf: BytesMut::zeroed(capacity), filled: 0 }
    }

    pub(crate) fn filled(&self) -> usize {
        self.filled
    }

    pub(crate) fn window(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.filled == self.buf.len()
    }

    pub(crate) fn unfilled(&mut self) -> &mut [u8] {
        &mut self.buf[self.filled..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.buf.len());
        self.filled += n;
    }

    /// Widen the window by half.
    pub(crate) fn grow(&mut self) {
        self.grow_to(usize::MAX);
    }

    /// Widen the window by half, not beyond `max`.
    pub(crate) fn grow_to(&mut self, max: usize) {
        let len = self.buf.len();
        debug_assert!(len < max);
        let widened = (len + len / 2).max(len + 1).min(max);
        self.buf.resize(widened, 0);
    }

    /// Take the filled prefix.
    pub(crate) fn into_bytes(mut self) -> Bytes {
        self.buf.truncate(self.filled);
        self.buf.freeze()
    }
}

/// Read from `offset`, up to `len` bytes when bounded, to end of data when
/// not.
///
/// A bounded read returns fewer than `len` bytes only when the data ends
/// first. An unbounded read starts with a [`DEFAULT_CAPACITY`] window and
/// widens it whenever it fills.
pub(crate) async fn read_at<R>(io: &mut R, offset: u64, len: Option<usize>) -> io::Result<Bytes>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    io.seek(SeekFrom::Start(offset)).await?;

    let mut buf = match len {
        Some(0) => return Ok(Bytes::new()),
        Some(len) => TransferBuffer::with_capacity(len),
        None => TransferBuffer::with_capacity(DEFAULT_CAPACITY),
    };

    loop {
        if buf.is_full() {
            match len {
                // requested amount in hand
                Some(_) => break,
                None => buf.grow(),
            }
        }
        let read = io.read(buf.unfilled()).await?;
        if read == 0 {
            break;
        }
        buf.advance(read);
    }

    Ok(buf.into_bytes())
}

/// Write all of `data` at `offset`, resuming after partial writes.
pub(crate) async fn write_at<W>(io: &mut W, offset: u64, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + AsyncSeek + Unpin,
{
    io.seek(SeekFrom::Start(offset)).await?;

    let mut written = 0;
    while written < data.len() {
        let n = io.write(&data[written..]).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        written += n;
    }
    io.flush().await
}
