//! KeelFS Test & Validation Infrastructure
//!
//! Cross-crate tests for the stream codecs, the page cache and the paged
//! overlay, plus the shared harness they run on.

pub mod harness;
mod stream_tests;

pub use harness::{init_tracing, random_bytes, small_cache, test_key, text_bytes, TestEnv};
