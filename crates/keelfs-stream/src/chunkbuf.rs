//! Fixed-capacity byte buffer with independent read and write cursors.
//!
//! The compression writer stages one plaintext chunk in it; the compression
//! reader decodes one chunk into it and serves reads from the read cursor.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::StreamError;

/// One chunk worth of staged bytes.
#[derive(Debug)]
pub struct ChunkBuffer {
    buf: Vec<u8>,
    capacity: usize,
    read_off: usize,
}

impl ChunkBuffer {
    /// Empty buffer that accepts at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self::from_vec(Vec::with_capacity(capacity), capacity)
    }

    /// Wrap a (pooled) allocation. Existing contents are discarded.
    pub fn from_vec(mut buf: Vec<u8>, capacity: usize) -> Self {
        buf.clear();
        Self {
            buf,
            capacity,
            read_off: 0,
        }
    }

    /// Give the allocation back, e.g. to a [`crate::BufferPool`].
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// Maximum number of bytes the buffer holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// True once `len() == capacity()`.
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    /// Bytes between the read cursor and the write cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.read_off
    }

    /// Position of the read cursor.
    pub fn position(&self) -> usize {
        self.read_off
    }

    /// All written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop all content and rewind both cursors.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.read_off = 0;
    }

    /// Replace the content with the output of `fill`, which appends to the
    /// provided (cleared) vector. Used to decompress straight into the buffer.
    pub fn refill_with<F>(&mut self, fill: F) -> crate::error::Result<()>
    where
        F: FnOnce(&mut Vec<u8>) -> crate::error::Result<()>,
    {
        self.reset();
        fill(&mut self.buf)?;
        if self.buf.len() > self.capacity {
            let len = self.buf.len();
            self.reset();
            return Err(StreamError::BadIndex(format!(
                "decoded chunk of {} bytes exceeds chunk size {}",
                len, self.capacity
            )));
        }
        Ok(())
    }
}

impl Read for ChunkBuffer {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = out.len().min(self.remaining());
        out[..n].copy_from_slice(&self.buf[self.read_off..self.read_off + n]);
        self.read_off += n;
        Ok(n)
    }
}

impl Write for ChunkBuffer {
    /// Accepts as many bytes as fit; returns 0 once full.
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = data.len().min(self.capacity - self.buf.len());
        self.buf.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ChunkBuffer {
    /// Moves the read cursor within `[0, len()]`.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => off as i128,
            SeekFrom::Current(delta) => self.read_off as i128 + delta as i128,
            SeekFrom::End(delta) => self.buf.len() as i128 + delta as i128,
        };
        if target < 0 || target > self.buf.len() as i128 {
            return Err(StreamError::InvalidSeek { offset: target }.into());
        }
        self.read_off = target as usize;
        Ok(self.read_off as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_stops_at_capacity() {
        let mut cb = ChunkBuffer::new(4);
        assert_eq!(cb.write(b"abcdef").unwrap(), 4);
        assert!(cb.is_full());
        assert_eq!(cb.write(b"g").unwrap(), 0);
        assert_eq!(cb.as_slice(), b"abcd");
    }

    #[test]
    fn test_read_after_write() {
        let mut cb = ChunkBuffer::new(16);
        cb.write_all(b"hello world").unwrap();
        let mut out = [0u8; 5];
        cb.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert_eq!(cb.remaining(), 6);
    }

    #[test]
    fn test_seek_reslices() {
        let mut cb = ChunkBuffer::new(16);
        cb.write_all(b"0123456789").unwrap();
        cb.seek(SeekFrom::Start(7)).unwrap();
        let mut rest = Vec::new();
        cb.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"789");
        cb.seek(SeekFrom::End(-4)).unwrap();
        assert_eq!(cb.position(), 6);
        cb.seek(SeekFrom::Current(-6)).unwrap();
        assert_eq!(cb.position(), 0);
    }

    #[test]
    fn test_seek_out_of_range_keeps_position() {
        let mut cb = ChunkBuffer::new(8);
        cb.write_all(b"abc").unwrap();
        cb.seek(SeekFrom::Start(1)).unwrap();
        assert!(cb.seek(SeekFrom::Start(4)).is_err());
        assert!(cb.seek(SeekFrom::Current(-2)).is_err());
        assert_eq!(cb.position(), 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut cb = ChunkBuffer::new(8);
        cb.write_all(b"abc").unwrap();
        cb.seek(SeekFrom::Start(2)).unwrap();
        cb.reset();
        assert!(cb.is_empty());
        assert_eq!(cb.position(), 0);
    }

    #[test]
    fn test_refill_rejects_oversized_output() {
        let mut cb = ChunkBuffer::new(4);
        let err = cb
            .refill_with(|v| {
                v.extend_from_slice(b"too long");
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, StreamError::BadIndex(_)));
        assert!(cb.is_empty());
    }

    #[test]
    fn test_from_vec_discards_old_content() {
        let cb = ChunkBuffer::from_vec(b"stale".to_vec(), 8);
        assert!(cb.is_empty());
    }
}
