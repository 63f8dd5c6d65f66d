//! Error types for the keelfs-stream codecs

use std::io;

/// Broad class of a codec error, used by callers to decide whether a stream is still usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed framing: bad magic, bad version, truncated header/trailer/index
    Format,
    /// Authentication or block-order failure: the stream was tampered with or corrupted
    Integrity,
    /// Caller/configuration mistake: unknown algorithm, wrong key length
    Config,
    /// Seek outside the addressable range; the stream position is unchanged
    Bounds,
    /// Tier-2 page cache failure; readers fall back to the backing stream
    Cache,
    /// Error from the underlying stream
    Io,
}

/// All errors that can occur while encoding or decoding a keelfs stream
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Stream does not start with the expected magic bytes
    #[error("Bad magic: expected {expected:02x?}, found {found:02x?}")]
    BadMagic {
        /// Magic bytes the codec writes
        expected: [u8; 8],
        /// Magic bytes found in the stream
        found: [u8; 8],
    },
    /// Stream format version is newer or older than this codec understands
    #[error("Unsupported format version {version}")]
    UnsupportedVersion {
        /// Version found in the header
        version: u16,
    },
    /// Header fields are inconsistent
    #[error("Bad header: {0}")]
    BadHeader(String),
    /// Header, trailer or index ended before its fixed size
    #[error("Truncated {what}: need {need} bytes, got {got}")]
    Truncated {
        /// Which structure was cut short
        what: &'static str,
        /// Bytes required
        need: usize,
        /// Bytes available
        got: usize,
    },
    /// Encryption header MAC did not verify with the supplied key
    #[error("Header MAC mismatch: wrong key or tampered header")]
    BadHeaderMac,
    /// A block carried a different index than its position implies
    #[error("Corrupt stream: expected block {expected}, found {found}")]
    CorruptStream {
        /// Block index implied by the plaintext offset
        expected: u64,
        /// Block index decoded from the nonce
        found: u64,
    },
    /// Block authentication tag mismatch: the data is corrupted or was tampered with
    #[error("Decryption failed for block {block}: authentication tag mismatch")]
    DecryptionAuthFailed {
        /// Index of the failing block
        block: u64,
    },
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Key length does not match what the cipher (or the header) requires
    #[error("Key length mismatch: expected {expected} bytes, got {actual}")]
    KeyLengthMismatch {
        /// Required key length
        expected: usize,
        /// Supplied key length
        actual: usize,
    },
    /// Header flags do not select exactly one known cipher
    #[error("Bad cipher selection in flags {flags:#010x}")]
    BadCipher {
        /// Raw flags word
        flags: u32,
    },
    /// Compression index is malformed
    #[error("Bad compression index: {0}")]
    BadIndex(String),
    /// Algorithm id is not in the registered set
    #[error("Unknown compression algorithm id {0}")]
    BadAlgorithm(u16),
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression operation failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// Seek to a negative or otherwise unreachable position
    #[error("Invalid seek to offset {offset}")]
    InvalidSeek {
        /// Requested absolute offset
        offset: i128,
    },
    /// I/O error from the underlying stream
    #[error("IO error: {0}")]
    Io(#[source] io::Error),
}

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, StreamError>;

impl StreamError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorClass {
        match self {
            StreamError::BadMagic { .. }
            | StreamError::UnsupportedVersion { .. }
            | StreamError::BadHeader(_)
            | StreamError::Truncated { .. }
            | StreamError::BadIndex(_)
            | StreamError::DecompressionFailed(_) => ErrorClass::Format,
            StreamError::BadHeaderMac
            | StreamError::CorruptStream { .. }
            | StreamError::DecryptionAuthFailed { .. } => ErrorClass::Integrity,
            StreamError::KeyLengthMismatch { .. }
            | StreamError::BadCipher { .. }
            | StreamError::BadAlgorithm(_)
            | StreamError::EncryptionFailed(_)
            | StreamError::CompressionFailed(_) => ErrorClass::Config,
            StreamError::InvalidSeek { .. } => ErrorClass::Bounds,
            StreamError::Io(_) => ErrorClass::Io,
        }
    }

    /// Recover the typed error from an `io::Error` produced by one of the codecs'
    /// `Read`/`Write`/`Seek` impls.
    pub fn from_io(err: &io::Error) -> Option<&StreamError> {
        err.get_ref().and_then(|e| e.downcast_ref::<StreamError>())
    }
}

/// Unwraps codec errors that crossed a `Read`/`Seek` boundary, so a
/// decompressor over a decryptor still reports the decryptor's error.
impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|e| e.is::<StreamError>()) {
            return StreamError::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<StreamError>()) {
            Some(Ok(typed)) => *typed,
            Some(Err(other)) => StreamError::Io(io::Error::new(kind, other)),
            None => StreamError::Io(kind.into()),
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(e) => e,
            other => {
                let kind = match other.kind() {
                    ErrorClass::Config | ErrorClass::Bounds => io::ErrorKind::InvalidInput,
                    _ => io::ErrorKind::InvalidData,
                };
                io::Error::new(kind, other)
            }
        }
    }
}
