//! Copy-on-write paged overlay over a read-only backing stream.
//!
//! Writes land in the shared [`PageCache`]; reads combine cached pages with
//! the backing stream. Bytes past the backing stream's size but inside the
//! logical length read as zero.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use keelfs_stream::BufferPool;
use tracing::{instrument, trace, warn};

use crate::cache::{PageCache, PageKey};
use crate::error::{CacheError, Result};
use crate::page::{Page, PAGE_SIZE};

/// Backing stream that reads as zeros past `size` and only seeks when the
/// requested offset differs from where the last read stopped.
struct ZeroPad<R> {
    inner: R,
    size: u64,
    pos: Option<u64>,
}

impl<R: Read + Seek> ZeroPad<R> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let real = if offset >= self.size {
            0
        } else {
            (self.size - offset).min(buf.len() as u64) as usize
        };
        if real > 0 {
            if self.pos != Some(offset) {
                self.inner.seek(SeekFrom::Start(offset))?;
            }
            self.pos = None;
            self.inner.read_exact(&mut buf[..real])?;
            self.pos = Some(offset + real as u64);
        }
        buf[real..].fill(0);
        Ok(())
    }
}

/// Writable view of one stream: a read-only backing stream plus the pages
/// written through this layer.
pub struct Layer<R> {
    backing: ZeroPad<R>,
    cache: Arc<PageCache>,
    inode: u64,
    len: u64,
    high_water: u64,
    cursor: u64,
    pool: BufferPool,
}

impl<R> std::fmt::Debug for Layer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("inode", &self.inode)
            .field("len", &self.len)
            .field("backing_size", &self.backing.size)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl<R: Read + Seek> Layer<R> {
    /// Overlay `backing` (of `backing_size` bytes) as stream `inode` in `cache`.
    pub fn new(backing: R, cache: Arc<PageCache>, inode: u64, backing_size: u64) -> Self {
        Self::with_pool(backing, cache, inode, backing_size, &BufferPool::default())
    }

    /// Like [`Layer::new`], drawing underlay scratch buffers from `pool`.
    pub fn with_pool(
        backing: R,
        cache: Arc<PageCache>,
        inode: u64,
        backing_size: u64,
        pool: &BufferPool,
    ) -> Self {
        Self {
            backing: ZeroPad {
                inner: backing,
                size: backing_size,
                pos: None,
            },
            cache,
            inode,
            len: backing_size,
            high_water: backing_size,
            cursor: 0,
            pool: pool.clone(),
        }
    }

    /// Stream identity used for page keys.
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Logical length.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the logical length is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing stream, fixed at construction.
    pub fn backing_size(&self) -> u64 {
        self.backing.size
    }

    /// Write `buf` at `offset`, extending the logical length if needed.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(CacheError::InvalidSeek {
                offset: offset as i128 + buf.len() as i128,
            })?;

        let mut done = 0;
        while done < buf.len() {
            let abs = offset + done as u64;
            let rel = (abs % PAGE_SIZE as u64) as usize;
            let n = (PAGE_SIZE - rel).min(buf.len() - done);
            self.cache
                .merge(PageKey::for_offset(self.inode, abs), rel, &buf[done..done + n])?;
            done += n;
        }

        if end > self.len {
            self.len = end;
            self.high_water = self.high_water.max(end);
        }
        trace!(inode = self.inode, offset, len = buf.len(), "write_at");
        Ok(buf.len())
    }

    /// Read into `buf` from `offset`, clipped to the logical length.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let n = (self.len - offset).min(buf.len() as u64) as usize;

        let mut done = 0;
        while done < n {
            let abs = offset + done as u64;
            let rel = (abs % PAGE_SIZE as u64) as usize;
            let take = (PAGE_SIZE - rel).min(n - done);
            self.read_page(abs - rel as u64, rel, &mut buf[done..done + take])?;
            done += take;
        }
        Ok(n)
    }

    fn read_page(&mut self, base: u64, rel: usize, out: &mut [u8]) -> Result<()> {
        let key = PageKey::for_offset(self.inode, base);
        let cached = match self.cache.get(key) {
            Ok(page) => page,
            Err(e) => {
                warn!(inode = key.inode, index = key.index, error = %e, "page unavailable, reading backing stream");
                None
            }
        };
        let Some(cached) = cached else {
            return self.read_backing(base + rel as u64, out);
        };

        let (low, high) = (rel, rel + out.len());
        if cached.occludes(low, high) {
            out.copy_from_slice(&cached.data()[low..high]);
            return Ok(());
        }

        let mut page = Page::clone(&cached);
        let mut scratch = self.pool.acquire_pooled(PAGE_SIZE);
        for gap in page.gaps(low, high) {
            scratch.clear();
            scratch.resize(gap.len(), 0);
            self.read_backing(base + gap.low as u64, &mut scratch)?;
            page.underlay(gap.low as usize, &scratch)?;
        }
        out.copy_from_slice(&page.data()[low..high]);
        self.cache.set(key, page);
        Ok(())
    }

    fn read_backing(&mut self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.backing
            .read_at(offset, out)
            .map_err(CacheError::Backing)
    }

    /// Set the logical length. No data is touched: shrinking hides bytes and
    /// growing again exposes the backing stream (or zeros) underneath.
    pub fn truncate(&mut self, size: u64) {
        self.len = size;
        self.high_water = self.high_water.max(size);
    }

    /// Drop this stream's pages from the cache and hand back the backing stream.
    #[instrument(skip(self), fields(inode = self.inode, high_water = self.high_water))]
    pub fn close(self) -> R {
        self.cache.evict(self.inode, self.high_water);
        self.backing.inner
    }
}

impl<R: Read + Seek> Read for Layer<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.cursor)?;
        self.cursor += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Write for Layer<R> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.write_at(buf, self.cursor)?;
        self.cursor += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<R: Read + Seek> Seek for Layer<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target: i128 = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::End(d) => self.len as i128 + d as i128,
            SeekFrom::Current(d) => self.cursor as i128 + d as i128,
        };
        if target < 0 || target > u64::MAX as i128 {
            return Err(CacheError::InvalidSeek { offset: target }.into());
        }
        self.cursor = target as u64;
        Ok(self.cursor)
    }
}
