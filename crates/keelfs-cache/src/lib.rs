#![warn(missing_docs)]

//! KeelFS page cache: fixed-size pages with written-extent tracking, a
//! two-tier (memory + swap) page cache, and the copy-on-write paged overlay
//! that turns an immutable stream into a writable, truncatable file.

pub mod cache;
pub mod config;
pub mod error;
pub mod overlay;
pub mod page;

pub use cache::{CacheStats, PageCache, PageKey};
pub use config::{CacheConfig, SwapMode};
pub use error::{CacheError, EntryError, Result};
pub use overlay::Layer;
pub use page::{Extent, Page, PAGE_SIZE};
