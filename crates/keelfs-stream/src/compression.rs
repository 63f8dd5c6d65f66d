//! Chunked, seekable compression stream (LZ4/Zstd/Snappy).
//!
//! Layout:
//!
//! ```text
//! header  : magic[8] version[2] algorithm[2]
//! chunks  : each chunk_size plaintext bytes compressed independently
//! index   : (raw_offset[8], compressed_offset[8])* , one per chunk plus a terminal record
//! trailer : chunk_size[4] index_byte_size[8]
//! ```
//!
//! Compressed offsets are absolute stream offsets. The terminal record holds
//! the total plaintext size and the offset where the index begins.

use std::io::{self, Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::buffer_pool::{BufferPool, PooledBuf};
use crate::chunkbuf::ChunkBuffer;
use crate::error::{Result, StreamError};
use crate::read_full;

/// Magic bytes at the start of every compressed stream.
pub const MAGIC: [u8; 8] = *b"keelZIP\x01";
/// Current format version.
pub const VERSION: u16 = 1;
/// Header size: magic, version, algorithm id.
pub const HEADER_SIZE: usize = 8 + 2 + 2;
/// Size of one index record.
pub const RECORD_SIZE: usize = 16;
/// Trailer size: chunk size, index byte size.
pub const TRAILER_SIZE: usize = 4 + 8;
/// Default plaintext bytes per chunk.
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;
/// Zstd level used when writing.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionAlgorithm {
    /// No compression (passthrough)
    None,
    /// Snappy raw format: cheap, moderate ratio
    Snappy,
    /// LZ4 block format, hot path (~4 GB/s per core)
    #[default]
    Lz4,
    /// Zstandard: higher ratio (~3:1), used for text-like content
    Zstd {
        /// Compression level (1=fastest, 19=best ratio, 3=balanced default)
        level: i32,
    },
}

impl CompressionAlgorithm {
    /// Id stored in the stream header.
    pub fn id(self) -> u16 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Snappy => 1,
            CompressionAlgorithm::Lz4 => 2,
            CompressionAlgorithm::Zstd { .. } => 3,
        }
    }

    /// Look up a registered algorithm by header id.
    pub fn from_id(id: u16) -> Result<Self> {
        match id {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Snappy),
            2 => Ok(CompressionAlgorithm::Lz4),
            3 => Ok(CompressionAlgorithm::Zstd {
                level: DEFAULT_ZSTD_LEVEL,
            }),
            other => Err(StreamError::BadAlgorithm(other)),
        }
    }
}

/// Compress `data`, appending the output to `out`.
pub fn compress_into(data: &[u8], algo: CompressionAlgorithm, out: &mut Vec<u8>) -> Result<()> {
    match algo {
        CompressionAlgorithm::None => out.extend_from_slice(data),
        CompressionAlgorithm::Snappy => {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| StreamError::CompressionFailed(e.to_string()))?;
            out.extend_from_slice(&compressed);
        }
        CompressionAlgorithm::Lz4 => out.extend_from_slice(&lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd { level } => {
            let compressed = zstd::bulk::compress(data, level)
                .map_err(|e| StreamError::CompressionFailed(e.to_string()))?;
            out.extend_from_slice(&compressed);
        }
    }
    Ok(())
}

/// Decompress `data` (produced by [`compress_into`] with the same algorithm),
/// appending the output to `out`. `limit` caps the decoded size.
pub fn decompress_into(
    data: &[u8],
    algo: CompressionAlgorithm,
    limit: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    match algo {
        CompressionAlgorithm::None => out.extend_from_slice(data),
        CompressionAlgorithm::Snappy => {
            let decoded = snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| StreamError::DecompressionFailed(e.to_string()))?;
            out.extend_from_slice(&decoded);
        }
        CompressionAlgorithm::Lz4 => {
            let decoded = lz4_flex::decompress_size_prepended(data)
                .map_err(|e| StreamError::DecompressionFailed(e.to_string()))?;
            out.extend_from_slice(&decoded);
        }
        CompressionAlgorithm::Zstd { .. } => {
            let decoded = zstd::bulk::decompress(data, limit)
                .map_err(|e| StreamError::DecompressionFailed(e.to_string()))?;
            out.extend_from_slice(&decoded);
        }
    }
    Ok(())
}

/// Check whether compressing data is worthwhile.
/// Returns false if data appears to be already compressed or random (high entropy).
pub fn is_compressible(data: &[u8]) -> bool {
    if data.len() < 64 {
        return true;
    }
    let sample = &data[..data.len().min(1024)];
    let compressed = lz4_flex::compress_prepend_size(sample);
    (compressed.len() as f64) < (sample.len() as f64 * 0.95)
}

/// One index entry: where a chunk starts in plaintext and in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// Plaintext offset of the chunk.
    pub raw_offset: u64,
    /// Absolute stream offset of the compressed chunk.
    pub compressed_offset: u64,
}

impl Record {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.raw_offset.to_le_bytes());
        out.extend_from_slice(&self.compressed_offset.to_le_bytes());
    }

    fn decode(b: &[u8]) -> Self {
        Self {
            raw_offset: le_u64(&b[..8]),
            compressed_offset: le_u64(&b[8..16]),
        }
    }
}

fn le_u64(b: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&b[..8]);
    u64::from_le_bytes(arr)
}

fn encode_header(algo: CompressionAlgorithm) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[..8].copy_from_slice(&MAGIC);
    out[8..10].copy_from_slice(&VERSION.to_le_bytes());
    out[10..12].copy_from_slice(&algo.id().to_le_bytes());
    out
}

fn decode_header(b: &[u8]) -> Result<CompressionAlgorithm> {
    if b.len() < HEADER_SIZE {
        return Err(StreamError::Truncated {
            what: "compression header",
            need: HEADER_SIZE,
            got: b.len(),
        });
    }
    let mut found = [0u8; 8];
    found.copy_from_slice(&b[..8]);
    if found != MAGIC {
        return Err(StreamError::BadMagic {
            expected: MAGIC,
            found,
        });
    }
    let version = u16::from_le_bytes([b[8], b[9]]);
    if version != VERSION {
        return Err(StreamError::UnsupportedVersion { version });
    }
    CompressionAlgorithm::from_id(u16::from_le_bytes([b[10], b[11]]))
}

/// Validate a decoded index. Raw and compressed offsets must both strictly
/// increase, and no chunk may decode to more than `chunk_size` bytes.
fn validate_index(index: &[Record], chunk_size: u32) -> Result<()> {
    let first = index
        .first()
        .ok_or_else(|| StreamError::BadIndex("index is empty".to_string()))?;
    if first.raw_offset != 0 {
        return Err(StreamError::BadIndex(format!(
            "first chunk starts at raw offset {}",
            first.raw_offset
        )));
    }
    for pair in index.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b.raw_offset <= a.raw_offset || b.compressed_offset <= a.compressed_offset {
            return Err(StreamError::BadIndex(format!(
                "offsets not increasing: {:?} -> {:?}",
                a, b
            )));
        }
        if b.raw_offset - a.raw_offset > chunk_size as u64 {
            return Err(StreamError::BadIndex(format!(
                "chunk at raw offset {} spans {} bytes, chunk size is {}",
                a.raw_offset,
                b.raw_offset - a.raw_offset,
                chunk_size
            )));
        }
    }
    Ok(())
}

/// Compressing writer. Call [`Writer::finish`] to write the index and trailer.
pub struct Writer<W: Write> {
    inner: W,
    algo: CompressionAlgorithm,
    chunk: ChunkBuffer,
    scratch: PooledBuf,
    index: Vec<Record>,
    raw_offset: u64,
    compressed_offset: u64,
    pool: BufferPool,
}

impl<W: Write> Writer<W> {
    /// Writer with the default chunk size and a private buffer pool.
    pub fn new(sink: W, algo: CompressionAlgorithm) -> Result<Self> {
        Self::with_options(sink, algo, DEFAULT_CHUNK_SIZE, &BufferPool::default())
    }

    /// Writer with an explicit chunk size and shared buffer pool. The header is
    /// written immediately.
    pub fn with_options(
        mut sink: W,
        algo: CompressionAlgorithm,
        chunk_size: u32,
        pool: &BufferPool,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(StreamError::BadIndex("chunk size is zero".to_string()));
        }
        sink.write_all(&encode_header(algo))?;
        let chunk_size = chunk_size as usize;
        Ok(Self {
            inner: sink,
            algo,
            chunk: ChunkBuffer::from_vec(pool.acquire(chunk_size), chunk_size),
            scratch: pool.acquire_pooled(chunk_size + chunk_size / 8 + 64),
            index: Vec::new(),
            raw_offset: 0,
            compressed_offset: HEADER_SIZE as u64,
            pool: pool.clone(),
        })
    }

    fn flush_chunk(&mut self) -> Result<()> {
        if self.chunk.is_empty() {
            return Ok(());
        }
        self.index.push(Record {
            raw_offset: self.raw_offset,
            compressed_offset: self.compressed_offset,
        });
        self.scratch.clear();
        compress_into(self.chunk.as_slice(), self.algo, &mut self.scratch)?;
        self.inner.write_all(&self.scratch)?;
        trace!(
            raw_offset = self.raw_offset,
            raw_len = self.chunk.len(),
            compressed_len = self.scratch.len(),
            "wrote chunk"
        );
        self.raw_offset += self.chunk.len() as u64;
        self.compressed_offset += self.scratch.len() as u64;
        self.chunk.reset();
        Ok(())
    }

    /// Flush the pending chunk, append index and trailer, and return the sink.
    pub fn finish(mut self) -> Result<W> {
        self.flush_chunk()?;
        self.index.push(Record {
            raw_offset: self.raw_offset,
            compressed_offset: self.compressed_offset,
        });
        let mut tail = Vec::with_capacity(self.index.len() * RECORD_SIZE + TRAILER_SIZE);
        for record in &self.index {
            record.encode(&mut tail);
        }
        let index_size = (self.index.len() * RECORD_SIZE) as u64;
        tail.extend_from_slice(&(self.chunk.capacity() as u32).to_le_bytes());
        tail.extend_from_slice(&index_size.to_le_bytes());
        self.inner.write_all(&tail)?;
        self.inner.flush()?;
        debug!(
            chunks = self.index.len() - 1,
            raw_size = self.raw_offset,
            compressed_size = self.compressed_offset + tail.len() as u64,
            "compression writer finished"
        );
        let chunk = std::mem::replace(&mut self.chunk, ChunkBuffer::new(0));
        self.pool.release(chunk.capacity(), chunk.into_vec());
        Ok(self.inner)
    }
}

impl<W: Write> Write for Writer<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < data.len() {
            written += self.chunk.write(&data[written..])?;
            if self.chunk.is_full() {
                self.flush_chunk()?;
            }
        }
        Ok(written)
    }

    /// Flushes the sink only; the pending chunk is kept so chunk boundaries
    /// stay at multiples of the chunk size.
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct Parsed {
    algo: CompressionAlgorithm,
    chunk_size: u32,
    index: Vec<Record>,
}

/// Decompressing reader. Parses the header, trailer and index on first use.
pub struct Reader<R> {
    inner: R,
    parsed: Option<Parsed>,
    chunk: ChunkBuffer,
    scratch: PooledBuf,
    current_chunk: Option<usize>,
    inner_pos: Option<u64>,
    pos: u64,
    pool: BufferPool,
}

impl<R: Read + Seek> Reader<R> {
    /// Wrap a source positioned at the start of a compressed stream.
    pub fn new(source: R) -> Self {
        Self::with_pool(source, &BufferPool::default())
    }

    /// Like [`Reader::new`], drawing staging buffers from `pool`.
    pub fn with_pool(source: R, pool: &BufferPool) -> Self {
        Self {
            inner: source,
            parsed: None,
            chunk: ChunkBuffer::new(0),
            scratch: pool.acquire_pooled(0),
            current_chunk: None,
            inner_pos: None,
            pos: 0,
            pool: pool.clone(),
        }
    }

    /// Borrow the underlying source.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Algorithm named in the header.
    pub fn algorithm(&mut self) -> Result<CompressionAlgorithm> {
        Ok(self.parse()?.algo)
    }

    /// Plaintext length, from the terminal index record.
    pub fn plaintext_len(&mut self) -> Result<u64> {
        let parsed = self.parse()?;
        Ok(parsed.index.last().map(|r| r.raw_offset).unwrap_or(0))
    }

    fn parse(&mut self) -> Result<&Parsed> {
        if self.parsed.is_none() {
            let parsed = self.parse_layout()?;
            let chunk_size = parsed.chunk_size as usize;
            self.chunk = ChunkBuffer::from_vec(self.pool.acquire(chunk_size), chunk_size);
            self.scratch = self.pool.acquire_pooled(chunk_size + chunk_size / 8 + 64);
            self.parsed = Some(parsed);
        }
        self.parsed
            .as_ref()
            .ok_or_else(|| StreamError::BadIndex("index not loaded".to_string()))
    }

    fn parse_layout(&mut self) -> Result<Parsed> {
        let start = self.inner.stream_position()?;
        let mut header = [0u8; HEADER_SIZE];
        let got = read_full(&mut self.inner, &mut header)?;
        let algo = decode_header(&header[..got])?;

        let end = self.inner.seek(SeekFrom::End(0))?;
        if end < start + (HEADER_SIZE + TRAILER_SIZE + RECORD_SIZE) as u64 {
            return Err(StreamError::Truncated {
                what: "compression trailer",
                need: HEADER_SIZE + TRAILER_SIZE + RECORD_SIZE,
                got: end.saturating_sub(start) as usize,
            });
        }
        self.inner.seek(SeekFrom::Start(end - TRAILER_SIZE as u64))?;
        let mut trailer = [0u8; TRAILER_SIZE];
        self.inner.read_exact(&mut trailer)?;
        let chunk_size = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let index_size = le_u64(&trailer[4..]);
        if chunk_size == 0 {
            return Err(StreamError::BadIndex("chunk size is zero".to_string()));
        }
        if index_size == 0 || index_size % RECORD_SIZE as u64 != 0 {
            return Err(StreamError::BadIndex(format!(
                "index size {} is not a positive multiple of {}",
                index_size, RECORD_SIZE
            )));
        }
        let body_end = end - TRAILER_SIZE as u64;
        if index_size > body_end - start - HEADER_SIZE as u64 {
            return Err(StreamError::BadIndex(format!(
                "index size {} exceeds stream size {}",
                index_size, end
            )));
        }
        let index_start = body_end - index_size;
        self.inner.seek(SeekFrom::Start(index_start))?;
        let mut raw_index = vec![0u8; index_size as usize];
        self.inner.read_exact(&mut raw_index)?;

        // Offsets in the stream are relative to where the stream began.
        let index: Vec<Record> = raw_index
            .chunks_exact(RECORD_SIZE)
            .map(|b| {
                let r = Record::decode(b);
                Record {
                    raw_offset: r.raw_offset,
                    compressed_offset: r.compressed_offset + start,
                }
            })
            .collect();
        validate_index(&index, chunk_size)?;
        let terminal = index[index.len() - 1];
        if terminal.compressed_offset != index_start {
            return Err(StreamError::BadIndex(format!(
                "index begins at {}, terminal record says {}",
                index_start, terminal.compressed_offset
            )));
        }
        if index[0].compressed_offset != start + HEADER_SIZE as u64 {
            return Err(StreamError::BadIndex(format!(
                "first chunk at {}, expected {}",
                index[0].compressed_offset,
                start + HEADER_SIZE as u64
            )));
        }

        let data_start = start + HEADER_SIZE as u64;
        self.inner.seek(SeekFrom::Start(data_start))?;
        self.inner_pos = Some(data_start);
        debug!(
            algorithm = ?algo,
            chunk_size,
            chunks = index.len() - 1,
            raw_size = terminal.raw_offset,
            "compression reader: index loaded"
        );
        Ok(Parsed {
            algo,
            chunk_size,
            index,
        })
    }

    /// Index of the chunk holding raw offset `pos`, if any.
    fn chunk_for(index: &[Record], pos: u64) -> Option<usize> {
        let chunks = index.len().saturating_sub(1);
        if chunks == 0 || pos >= index[chunks].raw_offset {
            return None;
        }
        // Last record whose raw_offset <= pos.
        let idx = index[..chunks].partition_point(|r| r.raw_offset <= pos);
        Some(idx - 1)
    }

    fn load_chunk(&mut self, idx: usize) -> Result<()> {
        let (algo, rec, next) = {
            let parsed = self.parse()?;
            (parsed.algo, parsed.index[idx], parsed.index[idx + 1])
        };
        self.current_chunk = None;
        if self.inner_pos != Some(rec.compressed_offset) {
            self.inner.seek(SeekFrom::Start(rec.compressed_offset))?;
        }
        let compressed_len = (next.compressed_offset - rec.compressed_offset) as usize;
        self.scratch.clear();
        self.scratch.resize(compressed_len, 0);
        self.inner_pos = None;
        self.inner.read_exact(&mut self.scratch)?;
        self.inner_pos = Some(next.compressed_offset);

        let raw_len = (next.raw_offset - rec.raw_offset) as usize;
        let scratch = &self.scratch;
        self.chunk
            .refill_with(|out| decompress_into(scratch, algo, raw_len, out))?;
        if self.chunk.len() != raw_len {
            let got = self.chunk.len();
            self.chunk.reset();
            return Err(StreamError::BadIndex(format!(
                "chunk {} decoded to {} bytes, index says {}",
                idx, got, raw_len
            )));
        }
        trace!(chunk = idx, raw_len, compressed_len, "decoded chunk");
        self.current_chunk = Some(idx);
        Ok(())
    }
}

impl<R> Drop for Reader<R> {
    fn drop(&mut self) {
        let chunk = std::mem::replace(&mut self.chunk, ChunkBuffer::new(0));
        self.pool.release(chunk.capacity(), chunk.into_vec());
    }
}

impl<R: Read + Seek> Read for Reader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.chunk.remaining() == 0 {
            let pos = self.pos;
            let target = Self::chunk_for(&self.parse()?.index, pos);
            let Some(idx) = target else {
                return Ok(0);
            };
            let chunk_start = self.parse()?.index[idx].raw_offset;
            if self.current_chunk != Some(idx) {
                self.load_chunk(idx)?;
            }
            self.chunk.seek(SeekFrom::Start(pos - chunk_start))?;
            if self.chunk.remaining() == 0 {
                return Ok(0);
            }
        }
        let n = self.chunk.read(out)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for Reader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => off as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
            SeekFrom::End(delta) => self.plaintext_len()? as i128 + delta as i128,
        };
        if target < 0 {
            return Err(StreamError::InvalidSeek { offset: target }.into());
        }
        let target = target as u64;
        let parsed = self.parse()?;
        let idx = Self::chunk_for(&parsed.index, target);
        let chunk_start = idx.map(|i| parsed.index[i].raw_offset);
        match (idx, chunk_start) {
            (Some(i), Some(start)) if self.current_chunk == Some(i) => {
                self.chunk.seek(SeekFrom::Start(target - start))?;
            }
            _ => {
                // Decoded lazily by the next read.
                self.current_chunk = None;
                self.chunk.reset();
            }
        }
        self.pos = target;
        Ok(target)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::io::Cursor;

    const ALGOS: [CompressionAlgorithm; 4] = [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Snappy,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Zstd { level: 3 },
    ];

    fn pack(data: &[u8], algo: CompressionAlgorithm, chunk_size: u32) -> Vec<u8> {
        let mut w =
            Writer::with_options(Vec::new(), algo, chunk_size, &BufferPool::default()).unwrap();
        w.write_all(data).unwrap();
        w.finish().unwrap()
    }

    fn unpack(blob: Vec<u8>) -> Vec<u8> {
        let mut r = Reader::new(Cursor::new(blob));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        out
    }

    fn text(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog; "
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    proptest! {
        #[test]
        fn prop_lz4_roundtrip(data in prop::collection::vec(0u8..=255, 0..20_000)) {
            prop_assert_eq!(unpack(pack(&data, CompressionAlgorithm::Lz4, 1024)), data);
        }

        #[test]
        fn prop_zstd_roundtrip(data in prop::collection::vec(0u8..=255, 0..20_000)) {
            let algo = CompressionAlgorithm::Zstd { level: 3 };
            prop_assert_eq!(unpack(pack(&data, algo, 1024)), data);
        }

        #[test]
        fn prop_snappy_roundtrip(data in prop::collection::vec(0u8..=255, 0..20_000)) {
            prop_assert_eq!(unpack(pack(&data, CompressionAlgorithm::Snappy, 1024)), data);
        }

        #[test]
        fn prop_seek_then_read_to_end(
            data in prop::collection::vec(0u8..4, 0..8_000),
            frac in 0.0f64..=1.0,
        ) {
            let offset = (data.len() as f64 * frac) as usize;
            let blob = pack(&data, CompressionAlgorithm::Lz4, 700);
            let mut r = Reader::new(Cursor::new(blob));
            prop_assert_eq!(r.seek(SeekFrom::Start(offset as u64)).unwrap(), offset as u64);
            let mut out = Vec::new();
            r.read_to_end(&mut out).unwrap();
            prop_assert_eq!(&out[..], &data[offset..]);
        }
    }

    #[test]
    fn empty_roundtrips() {
        for algo in ALGOS {
            let blob = pack(&[], algo, 1024);
            assert_eq!(blob.len(), HEADER_SIZE + RECORD_SIZE + TRAILER_SIZE);
            assert_eq!(unpack(blob), b"");
        }
    }

    #[test]
    fn test_all_algorithms_roundtrip_text() {
        let data = text(50_000);
        for algo in ALGOS {
            let blob = pack(&data, algo, 4096);
            if algo != CompressionAlgorithm::None {
                assert!(blob.len() < data.len(), "{:?} did not shrink text", algo);
            }
            assert_eq!(unpack(blob), data);
        }
    }

    #[test]
    fn test_index_layout() {
        let data = text(10_000);
        let blob = pack(&data, CompressionAlgorithm::None, 4096);
        let mut r = Reader::new(Cursor::new(blob));
        assert_eq!(r.plaintext_len().unwrap(), 10_000);
        let index = &r.parsed.as_ref().unwrap().index;
        let raws: Vec<u64> = index.iter().map(|r| r.raw_offset).collect();
        assert_eq!(raws, vec![0, 4096, 8192, 10_000]);
        assert_eq!(index[0].compressed_offset, HEADER_SIZE as u64);
        assert_eq!(index[1].compressed_offset, HEADER_SIZE as u64 + 4096);
    }

    #[test]
    fn test_seek_end_and_backwards() {
        let data = text(30_000);
        let blob = pack(&data, CompressionAlgorithm::Zstd { level: 3 }, 4096);
        let mut r = Reader::new(Cursor::new(blob));
        assert_eq!(r.seek(SeekFrom::End(0)).unwrap(), 30_000);
        assert_eq!(r.seek(SeekFrom::End(-10)).unwrap(), 29_990);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, &data[29_990..]);
        r.seek(SeekFrom::Start(5)).unwrap();
        let mut small = [0u8; 8];
        r.read_exact(&mut small).unwrap();
        assert_eq!(&small, &data[5..13]);
        r.seek(SeekFrom::Current(4096)).unwrap();
        r.read_exact(&mut small).unwrap();
        assert_eq!(&small, &data[4109..4117]);
    }

    #[test]
    fn test_seek_past_end_reads_nothing() {
        let blob = pack(&text(100), CompressionAlgorithm::Lz4, 64);
        let mut r = Reader::new(Cursor::new(blob));
        r.seek(SeekFrom::Start(1_000)).unwrap();
        let mut out = Vec::new();
        assert_eq!(r.read_to_end(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_negative_seek_rejected() {
        let blob = pack(&text(100), CompressionAlgorithm::Lz4, 64);
        let mut r = Reader::new(Cursor::new(blob));
        r.seek(SeekFrom::Start(50)).unwrap();
        let err = r.seek(SeekFrom::Current(-51)).unwrap_err();
        assert!(matches!(
            StreamError::from_io(&err),
            Some(StreamError::InvalidSeek { .. })
        ));
        assert_eq!(r.stream_position().unwrap(), 50);
    }

    #[test]
    fn test_bad_magic() {
        let mut blob = pack(&text(100), CompressionAlgorithm::Lz4, 64);
        blob[1] ^= 0xff;
        let mut r = Reader::new(Cursor::new(blob));
        let err = r.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(matches!(
            StreamError::from_io(&err),
            Some(StreamError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut blob = pack(&text(100), CompressionAlgorithm::Lz4, 64);
        blob[8] = 9;
        let mut r = Reader::new(Cursor::new(blob));
        assert!(matches!(
            r.algorithm(),
            Err(StreamError::UnsupportedVersion { version: 9 })
        ));
    }

    #[test]
    fn test_unknown_algorithm() {
        let mut blob = pack(&text(100), CompressionAlgorithm::Lz4, 64);
        blob[10] = 77;
        let mut r = Reader::new(Cursor::new(blob));
        assert!(matches!(r.algorithm(), Err(StreamError::BadAlgorithm(77))));
    }

    #[test]
    fn test_index_size_not_multiple_of_record() {
        let mut blob = pack(&text(100), CompressionAlgorithm::Lz4, 64);
        let n = blob.len();
        blob[n - 8..].copy_from_slice(&17u64.to_le_bytes());
        let mut r = Reader::new(Cursor::new(blob));
        assert!(matches!(r.plaintext_len(), Err(StreamError::BadIndex(_))));
    }

    #[test]
    fn test_non_monotonic_index() {
        let mut blob = pack(&text(300), CompressionAlgorithm::None, 64);
        let n = blob.len();
        let index_size = le_u64(&blob[n - 8..]) as usize;
        let index_start = n - TRAILER_SIZE - index_size;
        // Make the second record's raw offset go backwards.
        blob[index_start + RECORD_SIZE..index_start + RECORD_SIZE + 8]
            .copy_from_slice(&0u64.to_le_bytes());
        let mut r = Reader::new(Cursor::new(blob));
        assert!(matches!(r.plaintext_len(), Err(StreamError::BadIndex(_))));
    }

    #[test]
    fn test_truncated_stream() {
        let blob = pack(&text(300), CompressionAlgorithm::Lz4, 64);
        let mut r = Reader::new(Cursor::new(blob[..HEADER_SIZE + 4].to_vec()));
        assert!(matches!(
            r.plaintext_len(),
            Err(StreamError::Truncated { .. })
        ));
    }

    #[test]
    fn test_corrupt_chunk_detected() {
        let mut blob = pack(&text(300), CompressionAlgorithm::Lz4, 128);
        blob[HEADER_SIZE] ^= 0xff;
        let mut r = Reader::new(Cursor::new(blob));
        assert!(r.read_to_end(&mut Vec::new()).is_err());
    }

    #[test]
    fn test_ids_roundtrip_through_registry() {
        for algo in ALGOS {
            assert_eq!(CompressionAlgorithm::from_id(algo.id()).unwrap().id(), algo.id());
        }
        assert!(matches!(
            CompressionAlgorithm::from_id(4),
            Err(StreamError::BadAlgorithm(4))
        ));
    }

    #[test]
    fn test_is_compressible() {
        assert!(is_compressible(&text(4096)));
        let mut noise = vec![0u8; 4096];
        StdRng::seed_from_u64(0x2545_f491).fill_bytes(&mut noise);
        assert!(!is_compressible(&noise));
    }

    #[test]
    fn test_reader_works_at_nonzero_start() {
        let data = text(5_000);
        let mut blob = b"PREFIX".to_vec();
        blob.extend(pack(&data, CompressionAlgorithm::Lz4, 1000));
        let mut cur = Cursor::new(blob);
        cur.seek(SeekFrom::Start(6)).unwrap();
        let mut r = Reader::new(cur);
        r.seek(SeekFrom::Start(2_500)).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, &data[2_500..]);
    }
}
