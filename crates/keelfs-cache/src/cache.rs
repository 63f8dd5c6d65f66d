//! Two-tier page cache.
//!
//! Tier 1 is a byte-budgeted LRU of pages in memory. When it overflows, the
//! least recently used page is written back to tier 2 before it is dropped,
//! so memory pressure never loses a write. Tier 2 is a directory of page
//! files, an unbounded map, or nothing at all.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::config::{CacheConfig, SwapMode};
use crate::error::{CacheError, EntryError, Result};
use crate::page::{Page, PAGE_SIZE};

const ENTRY_RAW: u8 = 0;
const ENTRY_SNAPPY: u8 = 1;

/// Identity of one page: owning stream and page index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    /// Stream identity.
    pub inode: u64,
    /// Page number, `offset / PAGE_SIZE`.
    pub index: u64,
}

impl PageKey {
    /// Key for page `index` of `inode`.
    pub fn new(inode: u64, index: u64) -> Self {
        Self { inode, index }
    }

    /// Key of the page holding byte `offset`.
    pub fn for_offset(inode: u64, offset: u64) -> Self {
        Self::new(inode, offset / PAGE_SIZE as u64)
    }
}

/// Counters for one cache.
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Lookups served from memory.
    pub l1_hits: u64,
    /// Lookups served from swap.
    pub l2_hits: u64,
    /// Lookups found in neither tier.
    pub misses: u64,
    /// Pages written back to swap.
    pub swapped_out: u64,
    /// Pages dropped because swap is disabled.
    pub dropped: u64,
    /// Write-backs that failed and left the page in memory.
    pub swap_errors: u64,
    /// Pages in memory.
    pub l1_pages: usize,
    /// Bytes charged against the memory budget.
    pub l1_bytes: u64,
}

/// On-disk tier: `<dir>/<inode hex>/<index>`.
#[derive(Debug)]
struct DiskSwap {
    dir: PathBuf,
    compress: bool,
}

impl DiskSwap {
    fn new(dir: &Path, compress: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            compress,
        })
    }

    fn inode_dir(&self, inode: u64) -> PathBuf {
        self.dir.join(format!("{:016x}", inode))
    }

    fn path(&self, key: PageKey) -> PathBuf {
        self.inode_dir(key.inode).join(key.index.to_string())
    }

    fn put(&self, key: PageKey, page: &Page) -> Result<()> {
        let mut raw = Vec::new();
        page.encode(&mut raw);
        let (flag, body) = if self.compress {
            let packed = snap::raw::Encoder::new()
                .compress_vec(&raw)
                .map_err(io::Error::other)?;
            (ENTRY_SNAPPY, packed)
        } else {
            (ENTRY_RAW, raw)
        };

        let path = self.path(key);
        fs::create_dir_all(self.inode_dir(key.inode))?;
        let mut tmp_path = path.clone();
        tmp_path.set_extension("tmp");
        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&[flag])?;
            tmp_file.write_all(&body)?;
        }
        fs::rename(&tmp_path, &path)?;
        trace!(inode = key.inode, index = key.index, bytes = body.len() + 1, "page swapped to disk");
        Ok(())
    }

    fn get(&self, key: PageKey) -> Result<Option<Page>> {
        let bytes = match fs::read(self.path(key)) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let decoded = match bytes.split_first() {
            None => Err(EntryError::Empty),
            Some((&ENTRY_RAW, body)) => Page::decode(body),
            Some((&ENTRY_SNAPPY, body)) => snap::raw::Decoder::new()
                .decompress_vec(body)
                .map_err(EntryError::from)
                .and_then(|raw| Page::decode(&raw)),
            Some((&other, _)) => Err(EntryError::UnknownFlag(other)),
        };
        let page = decoded.map_err(|source| CacheError::CorruptEntry {
            inode: key.inode,
            index: key.index,
            source,
        })?;
        Ok(Some(page))
    }

    fn remove(&self, key: PageKey) -> Result<()> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every inode directory this swap wrote. Other entries under
    /// the swap root are left alone.
    fn clear(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let owned = entry.file_name().to_str().is_some_and(is_inode_dir_name);
            if owned && entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Names produced by [`DiskSwap::inode_dir`]: 16 lowercase hex digits.
fn is_inode_dir_name(name: &str) -> bool {
    name.len() == 16
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Second tier, chosen by [`SwapMode`].
#[derive(Debug)]
enum Tier2 {
    Disk(DiskSwap),
    Memory(HashMap<PageKey, Arc<Page>>),
    Disabled,
}

impl Tier2 {
    fn open(mode: &SwapMode) -> Result<Self> {
        Ok(match mode {
            SwapMode::Disk { dir, compress } => Tier2::Disk(DiskSwap::new(dir, *compress)?),
            SwapMode::Memory => Tier2::Memory(HashMap::new()),
            SwapMode::Disabled => Tier2::Disabled,
        })
    }

    /// Returns `false` when the page was dropped instead of stored.
    fn put(&mut self, key: PageKey, page: Arc<Page>) -> Result<bool> {
        match self {
            Tier2::Disk(disk) => disk.put(key, &page).map(|()| true),
            Tier2::Memory(map) => {
                map.insert(key, page);
                Ok(true)
            }
            Tier2::Disabled => Ok(false),
        }
    }

    fn get(&self, key: PageKey) -> Result<Option<Arc<Page>>> {
        match self {
            Tier2::Disk(disk) => Ok(disk.get(key)?.map(Arc::new)),
            Tier2::Memory(map) => Ok(map.get(&key).cloned()),
            Tier2::Disabled => Ok(None),
        }
    }

    fn remove(&mut self, key: PageKey) -> Result<()> {
        match self {
            Tier2::Disk(disk) => disk.remove(key),
            Tier2::Memory(map) => {
                map.remove(&key);
                Ok(())
            }
            Tier2::Disabled => Ok(()),
        }
    }

    fn clear(&mut self) -> Result<()> {
        match self {
            Tier2::Disk(disk) => disk.clear(),
            Tier2::Memory(map) => {
                map.clear();
                Ok(())
            }
            Tier2::Disabled => Ok(()),
        }
    }
}

struct CacheInner {
    l1: LruCache<PageKey, Arc<Page>>,
    l1_bytes: u64,
    tier2: Tier2,
    stats: CacheStats,
}

impl CacheInner {
    fn l1_insert(&mut self, key: PageKey, page: Arc<Page>) {
        self.l1_bytes += page.footprint();
        if let Some(old) = self.l1.put(key, page) {
            self.l1_bytes = self.l1_bytes.saturating_sub(old.footprint());
        }
    }

    fn l1_remove(&mut self, key: &PageKey) -> Option<Arc<Page>> {
        let page = self.l1.pop(key)?;
        self.l1_bytes = self.l1_bytes.saturating_sub(page.footprint());
        Some(page)
    }

    /// Write back least recently used pages until the budget holds. A page
    /// whose write-back fails stays resident at the cold end.
    fn shrink(&mut self, budget: u64) {
        while self.l1_bytes > budget && self.l1.len() > 1 {
            let Some((key, page)) = self.l1.pop_lru() else {
                break;
            };
            self.l1_bytes = self.l1_bytes.saturating_sub(page.footprint());
            match self.tier2.put(key, Arc::clone(&page)) {
                Ok(true) => self.stats.swapped_out += 1,
                Ok(false) => {
                    self.stats.dropped += 1;
                    debug!(inode = key.inode, index = key.index, "page dropped, swap disabled");
                }
                Err(e) => {
                    warn!(inode = key.inode, index = key.index, error = %e, "swap write failed, keeping page in memory");
                    self.stats.swap_errors += 1;
                    self.l1_insert(key, page);
                    self.l1.demote(&key);
                    break;
                }
            }
        }
    }

    fn lookup(&mut self, key: PageKey, refill: bool) -> Result<Option<Arc<Page>>> {
        if let Some(page) = self.l1.get(&key) {
            self.stats.l1_hits += 1;
            return Ok(Some(Arc::clone(page)));
        }
        match self.tier2.get(key)? {
            Some(page) => {
                self.stats.l2_hits += 1;
                if refill {
                    self.l1_insert(key, Arc::clone(&page));
                }
                Ok(Some(page))
            }
            None => {
                self.stats.misses += 1;
                Ok(None)
            }
        }
    }

    fn remove_both(&mut self, key: PageKey) {
        self.l1_remove(&key);
        if let Err(e) = self.tier2.remove(key) {
            warn!(inode = key.inode, index = key.index, error = %e, "failed to remove swapped page");
        }
    }
}

/// Two-tier page cache shared by every overlay of a mount.
pub struct PageCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PageCache {
    /// Open a cache, creating the swap directory if one is configured.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let tier2 = Tier2::open(&config.swap)?;
        debug!(
            l1_max_memory = config.l1_max_memory,
            swap = ?config.swap,
            refill_on_miss = config.refill_on_miss,
            "page cache opened"
        );
        Ok(Self {
            config,
            inner: Mutex::new(CacheInner {
                l1: LruCache::unbounded(),
                l1_bytes: 0,
                tier2,
                stats: CacheStats::default(),
            }),
        })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look a page up in memory, then in swap.
    pub fn get(&self, key: PageKey) -> Result<Option<Arc<Page>>> {
        let mut inner = self.inner.lock();
        let page = inner.lookup(key, self.config.refill_on_miss)?;
        inner.shrink(self.config.l1_max_memory);
        Ok(page)
    }

    /// Store a page in memory, writing colder pages back to swap if the
    /// budget overflows. Write-back failures are logged and never lose the page.
    pub fn set(&self, key: PageKey, page: Page) {
        let mut inner = self.inner.lock();
        inner.l1_insert(key, Arc::new(page));
        inner.shrink(self.config.l1_max_memory);
    }

    /// Overlay `data` at `offset` within the page, creating the page if
    /// neither tier has it.
    pub fn merge(&self, key: PageKey, offset: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut page = match inner.l1_remove(&key) {
            Some(page) => page,
            None => inner.tier2.get(key)?.unwrap_or_default(),
        };
        Arc::make_mut(&mut page).overlay(offset, data)?;
        inner.l1_insert(key, page);
        inner.shrink(self.config.l1_max_memory);
        Ok(())
    }

    /// Remove pages from both tiers.
    pub fn delete(&self, keys: &[PageKey]) {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.remove_both(*key);
        }
    }

    /// Remove every page of `inode` that holds bytes below `size`.
    #[instrument(skip(self))]
    pub fn evict(&self, inode: u64, size: u64) {
        let pages = size.div_ceil(PAGE_SIZE as u64);
        let mut inner = self.inner.lock();
        for index in 0..pages {
            inner.remove_both(PageKey::new(inode, index));
        }
        debug!(pages, "evicted");
    }

    /// Drop every page from both tiers.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.l1.clear();
        inner.l1_bytes = 0;
        if let Err(e) = inner.tier2.clear() {
            warn!(error = %e, "failed to clear swap");
        }
        debug!("page cache closed");
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            l1_pages: inner.l1.len(),
            l1_bytes: inner.l1_bytes,
            ..inner.stats.clone()
        }
    }
}
