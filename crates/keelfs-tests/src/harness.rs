//! Test Harness - scratch directories, caches and data generators

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use keelfs_cache::{CacheConfig, PageCache, SwapMode, PAGE_SIZE};
use keelfs_stream::EncryptionKey;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tempfile::TempDir;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING: Once = Once::new();

/// Route `tracing` output through the test writer, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(EnvFilter::from_default_env())
            .try_init();
    });
}

/// Per-test scratch directory.
#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
    test_name: String,
}

impl TestEnv {
    pub fn new(test_name: &str) -> Self {
        init_tracing();
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        Self {
            temp_dir,
            test_name: test_name.to_string(),
        }
    }

    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn swap_dir(&self) -> PathBuf {
        self.temp_dir.path().join("swap")
    }

    /// Cache whose memory tier holds `pages` pages, swapping to this env's directory.
    pub fn disk_cache(&self, pages: u64, compress: bool) -> Arc<PageCache> {
        small_cache(
            pages,
            SwapMode::Disk {
                dir: self.swap_dir(),
                compress,
            },
        )
    }
}

/// Cache whose memory tier holds exactly `pages` full pages.
pub fn small_cache(pages: u64, swap: SwapMode) -> Arc<PageCache> {
    let config = CacheConfig {
        l1_max_memory: pages * (PAGE_SIZE as u64 + 64),
        swap,
        refill_on_miss: true,
    };
    Arc::new(PageCache::new(config).expect("failed to open page cache"))
}

/// Deterministic pseudo-random bytes.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = vec![0u8; len];
    rng.fill_bytes(&mut out);
    out
}

/// Repetitive text that compresses well.
pub fn text_bytes(len: usize) -> Vec<u8> {
    b"The quick brown fox jumps over the lazy dog; pack my box with five dozen liquor jugs.\n"
        .iter()
        .cycle()
        .take(len)
        .copied()
        .collect()
}

/// Key derived from a seed byte.
pub fn test_key(seed: u8) -> EncryptionKey {
    let mut key = [0u8; 32];
    for (i, b) in key.iter_mut().enumerate() {
        *b = seed.wrapping_mul(31).wrapping_add(i as u8);
    }
    EncryptionKey(key)
}
