//! Seekable AEAD block stream (AES-256-GCM or ChaCha20-Poly1305).
//!
//! Layout: a 36-byte header followed by blocks of `nonce || ciphertext`, each
//! block sealing at most `block_len` plaintext bytes. The nonce of block `i`
//! is `i` (big endian, low 8 bytes), so encrypting the same plaintext with the
//! same key always yields the same bytes. Content-addressed storage relies on
//! that to deduplicate ciphertext; do not switch to random nonces.

use std::io::{self, Read, Seek, SeekFrom, Write};

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::buffer_pool::{BufferPool, PooledBuf};
use crate::error::{Result, StreamError};
use crate::read_full;

/// Magic bytes at the start of every encrypted stream.
pub const MAGIC: [u8; 8] = *b"keelENC\x01";
/// Size of the fixed header: magic, flags, key length, block length, MAC.
pub const HEADER_SIZE: usize = 8 + 4 + 4 + 4 + MAC_SIZE;
/// Bytes of the header covered by the MAC.
const MAC_INPUT_SIZE: usize = 20;
/// Truncated HMAC-SHA256 length.
pub const MAC_SIZE: usize = 16;
/// AEAD nonce size (both ciphers).
pub const NONCE_SIZE: usize = 12;
/// AEAD tag size (both ciphers).
pub const TAG_SIZE: usize = 16;
/// Key size (both ciphers).
pub const KEY_SIZE: usize = 32;
/// Default plaintext bytes per block.
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

/// Flag: blocks are sealed with AES-256-GCM.
pub const FLAG_AES_GCM: u32 = 1 << 0;
/// Flag: blocks are sealed with ChaCha20-Poly1305.
pub const FLAG_CHACHA20_POLY1305: u32 = 1 << 1;
/// Flag: the plaintext is itself a compressed stream.
pub const FLAG_COMPRESSED: u32 = 1 << 8;

const CIPHER_MASK: u32 = FLAG_AES_GCM | FLAG_CHACHA20_POLY1305;

type HmacSha256 = Hmac<Sha256>;

/// 256-bit (32-byte) encryption key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; KEY_SIZE]);

impl EncryptionKey {
    /// Build a key from raw bytes, which must be exactly [`KEY_SIZE`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_SIZE] =
            bytes
                .try_into()
                .map_err(|_| StreamError::KeyLengthMismatch {
                    expected: KEY_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CipherAlgorithm {
    /// AES-256-GCM, hardware accelerated on x86 with AES-NI
    #[default]
    AesGcm256,
    /// ChaCha20-Poly1305: constant-time, fast on non-AES hardware
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    /// Header flag bit selecting this cipher.
    pub fn flag(self) -> u32 {
        match self {
            CipherAlgorithm::AesGcm256 => FLAG_AES_GCM,
            CipherAlgorithm::ChaCha20Poly1305 => FLAG_CHACHA20_POLY1305,
        }
    }

    /// Decode the cipher bits of a flags word; exactly one must be set.
    pub fn from_flags(flags: u32) -> Result<Self> {
        match flags & CIPHER_MASK {
            FLAG_AES_GCM => Ok(CipherAlgorithm::AesGcm256),
            FLAG_CHACHA20_POLY1305 => Ok(CipherAlgorithm::ChaCha20Poly1305),
            _ => Err(StreamError::BadCipher { flags }),
        }
    }
}

/// Parsed encryption header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Cipher and content flags.
    pub flags: u32,
    /// Key length the stream was written with.
    pub key_len: u32,
    /// Maximum plaintext bytes per block.
    pub block_len: u32,
}

impl Header {
    /// Header for a new stream.
    pub fn new(flags: u32, block_len: u32) -> Self {
        Self {
            flags,
            key_len: KEY_SIZE as u32,
            block_len,
        }
    }

    /// Cipher selected by the flags.
    pub fn cipher(&self) -> Result<CipherAlgorithm> {
        CipherAlgorithm::from_flags(self.flags)
    }

    /// True if the plaintext is a compressed stream.
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// On-disk size of one full block.
    pub fn block_stride(&self) -> u64 {
        (NONCE_SIZE + TAG_SIZE) as u64 + self.block_len as u64
    }

    /// Serialize and MAC the header.
    pub fn encode(&self, key: &EncryptionKey) -> Result<[u8; HEADER_SIZE]> {
        let mut out = [0u8; HEADER_SIZE];
        out[..8].copy_from_slice(&MAGIC);
        out[8..12].copy_from_slice(&self.flags.to_le_bytes());
        out[12..16].copy_from_slice(&self.key_len.to_le_bytes());
        out[16..20].copy_from_slice(&self.block_len.to_le_bytes());
        let mut mac = header_mac(key)?;
        mac.update(&out[..MAC_INPUT_SIZE]);
        let tag = mac.finalize().into_bytes();
        out[MAC_INPUT_SIZE..].copy_from_slice(&tag[..MAC_SIZE]);
        Ok(out)
    }

    /// Parse and authenticate a header. The MAC is checked before any field
    /// other than the magic is interpreted.
    pub fn decode(bytes: &[u8], key: &EncryptionKey) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(StreamError::Truncated {
                what: "encryption header",
                need: HEADER_SIZE,
                got: bytes.len(),
            });
        }
        let mut found = [0u8; 8];
        found.copy_from_slice(&bytes[..8]);
        if found != MAGIC {
            return Err(StreamError::BadMagic {
                expected: MAGIC,
                found,
            });
        }

        let mut mac = header_mac(key)?;
        mac.update(&bytes[..MAC_INPUT_SIZE]);
        mac.verify_truncated_left(&bytes[MAC_INPUT_SIZE..HEADER_SIZE])
            .map_err(|_| StreamError::BadHeaderMac)?;

        let header = Self {
            flags: le_u32(&bytes[8..12]),
            key_len: le_u32(&bytes[12..16]),
            block_len: le_u32(&bytes[16..20]),
        };
        if header.key_len as usize != key.0.len() {
            return Err(StreamError::KeyLengthMismatch {
                expected: header.key_len as usize,
                actual: key.0.len(),
            });
        }
        header.cipher()?;
        if header.block_len == 0 {
            return Err(StreamError::BadHeader("block length is zero".to_string()));
        }
        Ok(header)
    }

    /// Read and authenticate the header at the current position.
    pub fn read_from<R: Read>(source: &mut R, key: &EncryptionKey) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        let got = read_full(source, &mut buf)?;
        Self::decode(&buf[..got], key)
    }

    /// Read the header without consuming it: the source position is restored.
    pub fn peek<R: Read + Seek>(source: &mut R, key: &EncryptionKey) -> Result<Self> {
        let start = source.stream_position()?;
        let header = Self::read_from(source, key);
        source.seek(SeekFrom::Start(start))?;
        header
    }
}

fn header_mac(key: &EncryptionKey) -> Result<HmacSha256> {
    <HmacSha256 as KeyInit>::new_from_slice(&key.0)
        .map_err(|e| StreamError::EncryptionFailed(e.to_string()))
}

fn le_u32(b: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&b[..4]);
    u32::from_le_bytes(arr)
}

/// Nonce of block `index`: zero prefix, then the index in big endian.
pub fn block_nonce(index: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[NONCE_SIZE - 8..].copy_from_slice(&index.to_be_bytes());
    nonce
}

fn nonce_index(nonce: &[u8; NONCE_SIZE]) -> u64 {
    let mut idx = [0u8; 8];
    idx.copy_from_slice(&nonce[NONCE_SIZE - 8..]);
    u64::from_be_bytes(idx)
}

/// Ciphertext size of a stream holding `plain_len` bytes.
pub fn encrypted_size(plain_len: u64, block_len: u32) -> u64 {
    let block_len = block_len as u64;
    let full = plain_len / block_len;
    let rest = plain_len % block_len;
    let mut size = HEADER_SIZE as u64 + full * (block_len + (NONCE_SIZE + TAG_SIZE) as u64);
    if rest > 0 {
        size += rest + (NONCE_SIZE + TAG_SIZE) as u64;
    }
    size
}

/// Plaintext size of an encrypted stream that is `stream_len` bytes long.
pub fn plaintext_size(stream_len: u64, block_len: u32) -> Result<u64> {
    if stream_len < HEADER_SIZE as u64 {
        return Err(StreamError::Truncated {
            what: "encryption header",
            need: HEADER_SIZE,
            got: stream_len as usize,
        });
    }
    let overhead = (NONCE_SIZE + TAG_SIZE) as u64;
    let stride = block_len as u64 + overhead;
    let data = stream_len - HEADER_SIZE as u64;
    let full = data / stride;
    let rest = data % stride;
    if rest == 0 {
        return Ok(full * block_len as u64);
    }
    if rest < overhead {
        return Err(StreamError::Truncated {
            what: "final block",
            need: overhead as usize,
            got: rest as usize,
        });
    }
    Ok(full * block_len as u64 + rest - overhead)
}

enum Cipher {
    AesGcm(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl Cipher {
    fn new(algo: CipherAlgorithm, key: &EncryptionKey) -> Result<Self> {
        Ok(match algo {
            CipherAlgorithm::AesGcm256 => Cipher::AesGcm(Box::new(
                Aes256Gcm::new_from_slice(&key.0)
                    .map_err(|e| StreamError::EncryptionFailed(e.to_string()))?,
            )),
            CipherAlgorithm::ChaCha20Poly1305 => Cipher::ChaCha(Box::new(
                ChaCha20Poly1305::new_from_slice(&key.0)
                    .map_err(|e| StreamError::EncryptionFailed(e.to_string()))?,
            )),
        })
    }

    /// Encrypt `buf` in place and append the tag.
    fn seal(&self, nonce: &[u8; NONCE_SIZE], buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Cipher::AesGcm(c) => c.encrypt_in_place(aes_gcm::Nonce::from_slice(nonce), b"", buf),
            Cipher::ChaCha(c) => {
                c.encrypt_in_place(chacha20poly1305::Nonce::from_slice(nonce), b"", buf)
            }
        }
        .map_err(|e| StreamError::EncryptionFailed(e.to_string()))
    }

    /// Verify and strip the tag, decrypting `buf` in place.
    fn open(&self, nonce: &[u8; NONCE_SIZE], buf: &mut Vec<u8>, block: u64) -> Result<()> {
        match self {
            Cipher::AesGcm(c) => c.decrypt_in_place(aes_gcm::Nonce::from_slice(nonce), b"", buf),
            Cipher::ChaCha(c) => {
                c.decrypt_in_place(chacha20poly1305::Nonce::from_slice(nonce), b"", buf)
            }
        }
        .map_err(|_| StreamError::DecryptionAuthFailed { block })
    }
}

/// Encrypting writer. Call [`Writer::finish`] to seal the last partial block.
pub struct Writer<W: Write> {
    inner: W,
    cipher: Cipher,
    block_len: usize,
    block_index: u64,
    plain: PooledBuf,
}

impl<W: Write> Writer<W> {
    /// Writer with the default block size and a private buffer pool.
    pub fn new(sink: W, key: &EncryptionKey, flags: u32) -> Result<Self> {
        Self::with_options(sink, key, flags, DEFAULT_BLOCK_SIZE, &BufferPool::default())
    }

    /// Writer with an explicit block size and shared buffer pool. The header is
    /// written immediately.
    pub fn with_options(
        mut sink: W,
        key: &EncryptionKey,
        flags: u32,
        block_len: u32,
        pool: &BufferPool,
    ) -> Result<Self> {
        if block_len == 0 {
            return Err(StreamError::BadHeader("block length is zero".to_string()));
        }
        let header = Header::new(flags, block_len);
        let cipher = Cipher::new(header.cipher()?, key)?;
        sink.write_all(&header.encode(key)?)?;
        debug!(flags, block_len, "encryption writer: header written");
        Ok(Self {
            inner: sink,
            cipher,
            block_len: block_len as usize,
            block_index: 0,
            plain: pool.acquire_pooled(block_len as usize + TAG_SIZE),
        })
    }

    fn seal_block(&mut self) -> Result<()> {
        if self.plain.is_empty() {
            return Ok(());
        }
        let nonce = block_nonce(self.block_index);
        self.cipher.seal(&nonce, &mut self.plain)?;
        self.inner.write_all(&nonce)?;
        self.inner.write_all(&self.plain)?;
        trace!(block = self.block_index, len = self.plain.len(), "sealed block");
        self.plain.clear();
        self.block_index += 1;
        Ok(())
    }

    /// Seal the pending block, flush and return the sink.
    pub fn finish(mut self) -> Result<W> {
        self.seal_block()?;
        self.inner.flush()?;
        debug!(blocks = self.block_index, "encryption writer finished");
        Ok(self.inner)
    }
}

impl<W: Write> Write for Writer<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < data.len() {
            let room = self.block_len - self.plain.len();
            let n = room.min(data.len() - written);
            self.plain.extend_from_slice(&data[written..written + n]);
            written += n;
            if self.plain.len() == self.block_len {
                self.seal_block()?;
            }
        }
        Ok(written)
    }

    /// Flushes the sink only; a partial block stays buffered until
    /// [`Writer::finish`] so that block boundaries stay aligned.
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypting reader. Seekable when the source is.
pub struct Reader<R> {
    inner: R,
    header: Header,
    cipher: Cipher,
    backlog: PooledBuf,
    backlog_off: usize,
    current_block: Option<u64>,
    next_block: u64,
    pos: u64,
    /// Bytes of this stream taken from the source, header included.
    consumed: u64,
    /// Source offset of the header, learned on the first seek.
    origin: Option<u64>,
    end_offset: Option<u64>,
}

impl<R: Read> Reader<R> {
    /// Parse and verify the header at the current source position.
    pub fn new(source: R, key: &EncryptionKey) -> Result<Self> {
        Self::with_pool(source, key, &BufferPool::default())
    }

    /// Like [`Reader::new`], drawing the block buffer from `pool`.
    pub fn with_pool(mut source: R, key: &EncryptionKey, pool: &BufferPool) -> Result<Self> {
        let header = Header::read_from(&mut source, key)?;
        let cipher = Cipher::new(header.cipher()?, key)?;
        debug!(
            flags = header.flags,
            block_len = header.block_len,
            "encryption reader: header verified"
        );
        Ok(Self {
            inner: source,
            header,
            cipher,
            backlog: pool.acquire_pooled(header.block_len as usize + TAG_SIZE),
            backlog_off: 0,
            current_block: None,
            next_block: 0,
            pos: 0,
            consumed: HEADER_SIZE as u64,
            origin: None,
            end_offset: None,
        })
    }

    /// The verified header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Borrow the underlying source.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Decode the block the source is positioned at. Returns false at end of stream.
    fn decode_next(&mut self) -> Result<bool> {
        let expected = self.next_block;
        self.current_block = None;
        self.backlog.clear();
        self.backlog_off = 0;

        let mut nonce = [0u8; NONCE_SIZE];
        let got = read_full(&mut self.inner, &mut nonce)?;
        self.consumed += got as u64;
        if got == 0 {
            return Ok(false);
        }
        if got < NONCE_SIZE {
            return Err(StreamError::Truncated {
                what: "block nonce",
                need: NONCE_SIZE,
                got,
            });
        }
        let found = nonce_index(&nonce);
        if found != expected {
            return Err(StreamError::CorruptStream { expected, found });
        }

        let stride = self.header.block_len as usize + TAG_SIZE;
        self.backlog.resize(stride, 0);
        let n = read_full(&mut self.inner, &mut self.backlog)?;
        self.consumed += n as u64;
        if n < TAG_SIZE {
            self.backlog.clear();
            return Err(StreamError::Truncated {
                what: "block ciphertext",
                need: TAG_SIZE,
                got: n,
            });
        }
        self.backlog.truncate(n);
        self.cipher.open(&nonce, &mut self.backlog, expected)?;
        trace!(block = expected, len = self.backlog.len(), "opened block");
        self.current_block = Some(expected);
        self.next_block = expected + 1;
        Ok(true)
    }
}

impl<R: Read + Seek> Reader<R> {
    /// Plaintext length of the whole stream. Measures the source once and
    /// restores its position.
    pub fn plaintext_len(&mut self) -> Result<u64> {
        let end = match self.end_offset {
            Some(end) => end,
            None => {
                let origin = self.origin()?;
                let cur = self.inner.stream_position()?;
                let end = self.inner.seek(SeekFrom::End(0))?.saturating_sub(origin);
                self.inner.seek(SeekFrom::Start(cur))?;
                self.end_offset = Some(end);
                end
            }
        };
        plaintext_size(end, self.header.block_len)
    }

    /// Source offset where the stream begins. The source may hold other
    /// data before the header.
    fn origin(&mut self) -> Result<u64> {
        if let Some(origin) = self.origin {
            return Ok(origin);
        }
        let here = self.inner.stream_position()?;
        let origin = here.checked_sub(self.consumed).ok_or_else(|| {
            StreamError::BadHeader(format!(
                "source at {} but {} stream bytes were read",
                here, self.consumed
            ))
        })?;
        self.origin = Some(origin);
        Ok(origin)
    }

    fn seek_to(&mut self, target: u64) -> Result<u64> {
        let block_len = self.header.block_len as u64;
        let block = target / block_len;
        if self.current_block != Some(block) {
            if self.next_block != block {
                let rel = HEADER_SIZE as u64 + block * self.header.block_stride();
                let origin = self.origin()?;
                self.inner.seek(SeekFrom::Start(origin + rel))?;
                self.consumed = rel;
                self.next_block = block;
            }
            self.decode_next()?;
        }
        self.backlog_off = (target - block * block_len) as usize;
        self.pos = target;
        Ok(target)
    }
}

impl<R: Read> Read for Reader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.backlog_off >= self.backlog.len() {
            let block = self.pos / self.header.block_len as u64;
            if self.current_block == Some(block) {
                // Short final block fully consumed.
                return Ok(0);
            }
            debug_assert_eq!(block, self.next_block);
            if !self.decode_next()? {
                return Ok(0);
            }
            self.backlog_off = (self.pos - block * self.header.block_len as u64) as usize;
            if self.backlog_off >= self.backlog.len() {
                return Ok(0);
            }
        }
        let n = out.len().min(self.backlog.len() - self.backlog_off);
        out[..n].copy_from_slice(&self.backlog[self.backlog_off..self.backlog_off + n]);
        self.backlog_off += n;
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
        Ok(self.seek_to(target as u64)?)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }
}
