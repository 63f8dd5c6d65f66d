#![warn(missing_docs)]

//! KeelFS stream codecs: seekable block encryption (AES-GCM / ChaCha20-Poly1305)
//! and seekable chunked compression (Snappy / LZ4 / Zstd)
//!
//! Write path: Data → Compress (chunked, indexed) → Encrypt (fixed blocks) → Blob
//! Read path:  Blob → Decrypt (random access) → Decompress (random access) → Data

use std::io::{self, Read};

pub mod buffer_pool;
pub mod chunkbuf;
pub mod compression;
pub mod encryption;
pub mod error;
pub mod heuristic;
pub mod pipeline;

pub use buffer_pool::{BufferPool, BufferPoolConfig, BufferPoolStats, PooledBuf};
pub use chunkbuf::ChunkBuffer;
pub use compression::CompressionAlgorithm;
pub use encryption::{CipherAlgorithm, EncryptionKey, Header};
pub use error::{ErrorClass, StreamError};
pub use heuristic::guess_algorithm;
pub use pipeline::{pack, unpack, Hint, InStream, OutStream, StreamConfig};

/// Read until `buf` is full or the source hits EOF, returning the byte count.
pub(crate) fn read_full<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
