//! Stream composition: plaintext → compress → encrypt on the way out,
//! decrypt → decompress on the way in.

use std::io::{self, Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::buffer_pool::BufferPool;
use crate::compression::{self, CompressionAlgorithm, DEFAULT_CHUNK_SIZE};
use crate::encryption::{self, CipherAlgorithm, EncryptionKey, DEFAULT_BLOCK_SIZE, FLAG_COMPRESSED};
use crate::error::Result;
use crate::heuristic::guess_algorithm;

/// Per-file stream policy, normally looked up by path outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hint {
    /// Cipher used for the blocks.
    pub cipher: CipherAlgorithm,
    /// Compression applied before encryption.
    pub compression: CompressionAlgorithm,
}

impl Default for Hint {
    fn default() -> Self {
        Self {
            cipher: CipherAlgorithm::AesGcm256,
            compression: CompressionAlgorithm::None,
        }
    }
}

impl Hint {
    /// Default cipher, compression guessed from the path and leading bytes.
    pub fn for_path(path: &str, header: &[u8]) -> Self {
        Self {
            cipher: CipherAlgorithm::default(),
            compression: guess_algorithm(path, header),
        }
    }

    fn flags(&self) -> u32 {
        let mut flags = self.cipher.flag();
        if self.compression != CompressionAlgorithm::None {
            flags |= FLAG_COMPRESSED;
        }
        flags
    }
}

/// Block and chunk sizes for [`OutStream`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Plaintext bytes per encryption block.
    pub block_size: u32,
    /// Plaintext bytes per compression chunk.
    pub chunk_size: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Writer producing one immutable blob from plaintext.
pub enum OutStream<W: Write> {
    /// Encryption only.
    Plain(encryption::Writer<W>),
    /// Compression feeding encryption.
    Compressed(compression::Writer<encryption::Writer<W>>),
}

impl<W: Write> OutStream<W> {
    /// Build the writer stack for `hint` with default sizes.
    pub fn new(sink: W, key: &EncryptionKey, hint: Hint) -> Result<Self> {
        Self::with_options(sink, key, hint, StreamConfig::default(), &BufferPool::default())
    }

    /// Build the writer stack with explicit sizes and a shared buffer pool.
    pub fn with_options(
        sink: W,
        key: &EncryptionKey,
        hint: Hint,
        config: StreamConfig,
        pool: &BufferPool,
    ) -> Result<Self> {
        let enc = encryption::Writer::with_options(sink, key, hint.flags(), config.block_size, pool)?;
        debug!(?hint, "opened out stream");
        if hint.compression == CompressionAlgorithm::None {
            return Ok(OutStream::Plain(enc));
        }
        Ok(OutStream::Compressed(compression::Writer::with_options(
            enc,
            hint.compression,
            config.chunk_size,
            pool,
        )?))
    }

    /// Close every layer and return the sink.
    pub fn finish(self) -> Result<W> {
        match self {
            OutStream::Plain(enc) => enc.finish(),
            OutStream::Compressed(zip) => zip.finish()?.finish(),
        }
    }
}

impl<W: Write> Write for OutStream<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            OutStream::Plain(w) => w.write(data),
            OutStream::Compressed(w) => w.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutStream::Plain(w) => w.flush(),
            OutStream::Compressed(w) => w.flush(),
        }
    }
}

/// Seekable plaintext view of a blob written by [`OutStream`].
pub enum InStream<R> {
    /// Encryption only.
    Plain(encryption::Reader<R>),
    /// Compression inside encryption.
    Compressed(compression::Reader<encryption::Reader<R>>),
}

impl<R: Read + Seek> InStream<R> {
    /// Open a blob, unwrapping compression if the encryption header says so.
    pub fn new(source: R, key: &EncryptionKey) -> Result<Self> {
        Self::with_pool(source, key, &BufferPool::default())
    }

    /// Like [`InStream::new`] with a shared buffer pool.
    #[instrument(skip_all)]
    pub fn with_pool(source: R, key: &EncryptionKey, pool: &BufferPool) -> Result<Self> {
        let dec = encryption::Reader::with_pool(source, key, pool)?;
        if dec.header().is_compressed() {
            debug!("in stream: compressed payload");
            Ok(InStream::Compressed(compression::Reader::with_pool(dec, pool)))
        } else {
            Ok(InStream::Plain(dec))
        }
    }

    /// Plaintext length of the blob.
    pub fn plaintext_len(&mut self) -> Result<u64> {
        match self {
            InStream::Plain(r) => r.plaintext_len(),
            InStream::Compressed(r) => r.plaintext_len(),
        }
    }
}

impl<R: Read + Seek> Read for InStream<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self {
            InStream::Plain(r) => r.read(out),
            InStream::Compressed(r) => r.read(out),
        }
    }
}

impl<R: Read + Seek> Seek for InStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            InStream::Plain(r) => r.seek(pos),
            InStream::Compressed(r) => r.seek(pos),
        }
    }
}

/// Encrypt (and maybe compress) a whole buffer.
pub fn pack(data: &[u8], key: &EncryptionKey, hint: Hint) -> Result<Vec<u8>> {
    let mut out = OutStream::new(Vec::new(), key, hint)?;
    out.write_all(data)?;
    out.finish()
}

/// Decode a whole blob produced by [`pack`] or [`OutStream`].
pub fn unpack(blob: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    let mut input = InStream::new(io::Cursor::new(blob), key)?;
    let mut out = Vec::new();
    input.read_to_end(&mut out)?;
    Ok(out)
}
