//! Error types for the page cache and paged overlay

use std::io;

use keelfs_stream::{ErrorClass, StreamError};
use thiserror::Error;

/// Errors raised by [`PageCache`](crate::PageCache) and [`Layer`](crate::Layer).
#[derive(Debug, Error)]
pub enum CacheError {
    /// Tier-2 (swap) I/O failure
    #[error("Swap I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failure of the read-only stream under an overlay
    #[error("Backing stream error: {0}")]
    Backing(io::Error),

    /// A swapped-out page could not be decoded
    #[error("Corrupt swap entry for inode {inode:#x} page {index}: {source}")]
    CorruptEntry {
        /// Owning stream
        inode: u64,
        /// Page index within the stream
        index: u64,
        /// What failed to decode
        source: EntryError,
    },

    /// Write range does not fit inside one page
    #[error("Range {offset}+{len} exceeds page size")]
    PageBounds {
        /// Page-relative start
        offset: usize,
        /// Length of the range
        len: usize,
    },

    /// Unusable cache configuration
    #[error("Invalid cache config: {0}")]
    Config(String),

    /// Seek or I/O offset outside the addressable range
    #[error("Invalid offset {offset}")]
    InvalidSeek {
        /// Requested absolute offset
        offset: i128,
    },
}

/// Why a serialized page (a swap entry) was rejected.
#[derive(Debug, Error)]
pub enum EntryError {
    /// Zero-length swap file
    #[error("empty entry")]
    Empty,
    /// Leading flag byte names no known encoding
    #[error("unknown entry flag {0}")]
    UnknownFlag(u8),
    /// Snappy body failed to decompress
    #[error("snappy: {0}")]
    Snappy(#[from] snap::Error),
    /// Fewer than four bytes, so no extent count
    #[error("missing extent count")]
    MissingCount,
    /// More extents than a page can hold
    #[error("extent count {0} out of range")]
    ExtentCount(usize),
    /// Total size disagrees with the extent count
    #[error("length {len} does not match {count} extents plus one page")]
    Length {
        /// Encoded length
        len: usize,
        /// Extent count from the prefix
        count: usize,
    },
    /// Empty or out-of-page extent
    #[error("bad extent [{low}, {high})")]
    BadExtent {
        /// Start of the range
        low: u32,
        /// End of the range
        high: u32,
    },
    /// Extent overlapping, touching or preceding the one before it
    #[error("extent [{low}, {high}) not after [{prev_low}, {prev_high})")]
    Unordered {
        /// Start of the range
        low: u32,
        /// End of the range
        high: u32,
        /// Start of the previous range
        prev_low: u32,
        /// End of the previous range
        prev_high: u32,
    },
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Classify this error. Backing stream failures keep the class of the codec error they carry.
    pub fn kind(&self) -> ErrorClass {
        match self {
            CacheError::Io(_) | CacheError::CorruptEntry { .. } => ErrorClass::Cache,
            CacheError::Backing(e) => StreamError::from_io(e)
                .map(StreamError::kind)
                .unwrap_or(ErrorClass::Io),
            CacheError::PageBounds { .. } | CacheError::InvalidSeek { .. } => ErrorClass::Bounds,
            CacheError::Config(_) => ErrorClass::Config,
        }
    }
}

impl From<CacheError> for io::Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Backing(e) => e,
            other => {
                let kind = match other.kind() {
                    ErrorClass::Bounds | ErrorClass::Config => io::ErrorKind::InvalidInput,
                    _ => io::ErrorKind::Other,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_errors_are_cache_class() {
        let err = CacheError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "ro"));
        assert_eq!(err.kind(), ErrorClass::Cache);
        let err = CacheError::CorruptEntry {
            inode: 1,
            index: 2,
            source: EntryError::MissingCount,
        };
        assert_eq!(err.kind(), ErrorClass::Cache);
        assert!(err.to_string().contains("page 2"));
        assert!(err.to_string().contains("missing extent count"));
    }

    #[test]
    fn test_backing_error_keeps_codec_class() {
        let inner: io::Error = StreamError::DecryptionAuthFailed { block: 4 }.into();
        let err = CacheError::Backing(inner);
        assert_eq!(err.kind(), ErrorClass::Integrity);

        let io_err: io::Error = err.into();
        assert!(matches!(
            StreamError::from_io(&io_err),
            Some(StreamError::DecryptionAuthFailed { block: 4 })
        ));
    }

    #[test]
    fn test_plain_backing_error_is_io_class() {
        let err = CacheError::Backing(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert_eq!(err.kind(), ErrorClass::Io);
    }

    #[test]
    fn test_bounds_map_to_invalid_input() {
        let io_err: io::Error = CacheError::InvalidSeek { offset: -1 }.into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidInput);
    }
}
