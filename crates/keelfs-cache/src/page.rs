//! Fixed-size pages and their written-extent lists.
//!
//! A page is a copy of `PAGE_SIZE` bytes of a stream's logical address space.
//! Its extents record which byte ranges hold known content (written by the
//! caller or filled in from the backing stream); everything outside the
//! extents is unspecified and must not be served.

use std::fmt;

use crate::error::{CacheError, EntryError, Result};

/// Bytes per page.
pub const PAGE_SIZE: usize = 64 * 1024;

const EXTENT_SIZE: usize = 8;

/// Half-open byte range `[low, high)` within a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    /// First byte covered.
    pub low: u32,
    /// One past the last byte covered.
    pub high: u32,
}

impl Extent {
    /// Build an extent from a start and a length.
    pub fn new(low: usize, len: usize) -> Self {
        Self {
            low: low as u32,
            high: (low + len) as u32,
        }
    }

    /// Number of bytes covered.
    pub fn len(&self) -> usize {
        (self.high - self.low) as usize
    }

    /// Whether the extent covers nothing.
    pub fn is_empty(&self) -> bool {
        self.high <= self.low
    }
}

/// Insert `new` into a sorted, disjoint extent list, merging every extent it
/// overlaps or touches.
fn insert_extent(extents: &mut Vec<Extent>, new: Extent) {
    if new.is_empty() {
        return;
    }
    let start = extents.partition_point(|e| e.high < new.low);
    let end = extents.partition_point(|e| e.low <= new.high);
    let mut merged = new;
    if start < end {
        merged.low = merged.low.min(extents[start].low);
        merged.high = merged.high.max(extents[end - 1].high);
    }
    extents.splice(start..end, std::iter::once(merged));
}

/// One page of cached data.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Vec<u8>,
    extents: Vec<Extent>,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("extents", &self.extents)
            .finish_non_exhaustive()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Page {
    /// An all-zero page with no extents.
    pub fn new() -> Self {
        Self {
            data: vec![0u8; PAGE_SIZE],
            extents: Vec::new(),
        }
    }

    /// Raw page bytes, including bytes outside any extent.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Sorted, disjoint, non-adjacent extents.
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Memory charged against the cache budget.
    pub fn footprint(&self) -> u64 {
        (self.data.len() + self.extents.len() * EXTENT_SIZE) as u64
    }

    fn check_range(offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= PAGE_SIZE => Ok(()),
            _ => Err(CacheError::PageBounds { offset, len }),
        }
    }

    /// Write `src` at `offset`, replacing whatever was there, and mark it covered.
    pub fn overlay(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        Self::check_range(offset, src.len())?;
        self.data[offset..offset + src.len()].copy_from_slice(src);
        insert_extent(&mut self.extents, Extent::new(offset, src.len()));
        Ok(())
    }

    /// Fill only the uncovered bytes of `[offset, offset + src.len())` from
    /// `src`, then mark the whole range covered. Covered bytes keep their value.
    pub fn underlay(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        Self::check_range(offset, src.len())?;
        for gap in self.gaps(offset, offset + src.len()) {
            let (lo, hi) = (gap.low as usize, gap.high as usize);
            self.data[lo..hi].copy_from_slice(&src[lo - offset..hi - offset]);
        }
        insert_extent(&mut self.extents, Extent::new(offset, src.len()));
        Ok(())
    }

    /// Whether one extent covers all of `[low, high)`.
    pub fn occludes(&self, low: usize, high: usize) -> bool {
        if high <= low {
            return true;
        }
        let i = self.extents.partition_point(|e| (e.high as usize) < high);
        self.extents
            .get(i)
            .is_some_and(|e| e.low as usize <= low && high <= e.high as usize)
    }

    /// Sub-ranges of `[low, high)` not covered by any extent, in order.
    pub fn gaps(&self, low: usize, high: usize) -> Vec<Extent> {
        let mut out = Vec::new();
        let mut cursor = low;
        for e in &self.extents {
            let (el, eh) = (e.low as usize, e.high as usize);
            if eh <= cursor {
                continue;
            }
            if el >= high {
                break;
            }
            if el > cursor {
                out.push(Extent::new(cursor, el - cursor));
            }
            cursor = eh;
            if cursor >= high {
                break;
            }
        }
        if cursor < high {
            out.push(Extent::new(cursor, high - cursor));
        }
        out
    }

    /// Serialize: extent count, `(low, high)` pairs, then the page bytes.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.reserve(4 + self.extents.len() * EXTENT_SIZE + PAGE_SIZE);
        out.extend_from_slice(&(self.extents.len() as u32).to_le_bytes());
        for e in &self.extents {
            out.extend_from_slice(&e.low.to_le_bytes());
            out.extend_from_slice(&e.high.to_le_bytes());
        }
        out.extend_from_slice(&self.data);
    }

    /// Parse a page written by [`Page::encode`], rejecting extent lists that
    /// are unsorted, overlapping, adjacent or out of range.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, EntryError> {
        let count_bytes: [u8; 4] = bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(EntryError::MissingCount)?;
        let count = u32::from_le_bytes(count_bytes) as usize;
        if count > PAGE_SIZE / 2 + 1 {
            return Err(EntryError::ExtentCount(count));
        }
        let data_start = 4 + count * EXTENT_SIZE;
        if bytes.len() != data_start + PAGE_SIZE {
            return Err(EntryError::Length {
                len: bytes.len(),
                count,
            });
        }

        let mut extents = Vec::with_capacity(count);
        for raw in bytes[4..data_start].chunks_exact(EXTENT_SIZE) {
            let low = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let high = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
            if low >= high || high as usize > PAGE_SIZE {
                return Err(EntryError::BadExtent { low, high });
            }
            if let Some(prev) = extents.last().filter(|p: &&Extent| p.high >= low) {
                return Err(EntryError::Unordered {
                    low,
                    high,
                    prev_low: prev.low,
                    prev_high: prev.high,
                });
            }
            extents.push(Extent { low, high });
        }

        Ok(Self {
            data: bytes[data_start..].to_vec(),
            extents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ext(low: u32, high: u32) -> Extent {
        Extent { low, high }
    }

    #[test]
    fn test_overlay_merges_adjacent_and_overlapping() {
        let mut page = Page::new();
        page.overlay(10, b"abcd").unwrap();
        page.overlay(20, b"xy").unwrap();
        assert_eq!(page.extents(), &[ext(10, 14), ext(20, 22)]);

        page.overlay(14, b"!").unwrap();
        assert_eq!(page.extents(), &[ext(10, 15), ext(20, 22)]);

        page.overlay(12, &[b'z'; 9]).unwrap();
        assert_eq!(page.extents(), &[ext(10, 22)]);
        assert_eq!(&page.data()[10..22], b"abzzzzzzzzzy");
    }

    #[test]
    fn test_overlay_out_of_page_rejected() {
        let mut page = Page::new();
        assert!(matches!(
            page.overlay(PAGE_SIZE - 1, b"ab"),
            Err(CacheError::PageBounds { .. })
        ));
        assert!(page.extents().is_empty());
        page.overlay(PAGE_SIZE - 2, b"ab").unwrap();
    }

    #[test]
    fn test_empty_overlay_adds_nothing() {
        let mut page = Page::new();
        page.overlay(5, b"").unwrap();
        assert!(page.extents().is_empty());
    }

    #[test]
    fn test_underlay_keeps_written_bytes() {
        let mut page = Page::new();
        page.overlay(2, b"XY").unwrap();
        page.underlay(0, b"0123456789").unwrap();
        assert_eq!(&page.data()[..10], b"01XY456789");
        assert_eq!(page.extents(), &[ext(0, 10)]);
    }

    #[test]
    fn test_occludes_and_gaps() {
        let mut page = Page::new();
        page.overlay(4, b"aaaa").unwrap();
        page.overlay(12, b"bb").unwrap();

        assert!(page.occludes(4, 8));
        assert!(page.occludes(5, 7));
        assert!(!page.occludes(3, 8));
        assert!(!page.occludes(4, 13));
        assert!(page.occludes(9, 9));

        assert_eq!(page.gaps(0, 16), vec![ext(0, 4), ext(8, 12), ext(14, 16)]);
        assert_eq!(page.gaps(5, 7), vec![]);
        assert_eq!(page.gaps(6, 13), vec![ext(8, 12)]);
        assert_eq!(page.gaps(20, 30), vec![ext(20, 30)]);
    }

    #[test]
    fn test_encode_decode() {
        let mut page = Page::new();
        page.overlay(100, b"hello").unwrap();
        page.overlay(PAGE_SIZE - 3, b"end").unwrap();
        let mut buf = Vec::new();
        page.encode(&mut buf);
        assert_eq!(buf.len(), 4 + 2 * 8 + PAGE_SIZE);
        assert_eq!(Page::decode(&buf).unwrap(), page);
    }

    #[test]
    fn test_decode_rejects_bad_extents() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_le_bytes());
        for v in [0u32, 10, 10, 20] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&vec![0u8; PAGE_SIZE]);
        assert!(matches!(
            Page::decode(&buf),
            Err(EntryError::Unordered { low: 10, prev_high: 10, .. })
        ));

        let mut short = Vec::new();
        Page::new().encode(&mut short);
        short.pop();
        assert!(matches!(
            Page::decode(&short),
            Err(EntryError::Length { count: 0, .. })
        ));
        assert!(matches!(Page::decode(&[1, 0]), Err(EntryError::MissingCount)));
    }

    fn write_op() -> impl Strategy<Value = (usize, Vec<u8>)> {
        (0usize..PAGE_SIZE).prop_flat_map(|off| {
            let max = (PAGE_SIZE - off).min(3000);
            (Just(off), proptest::collection::vec(any::<u8>(), 0..=max))
        })
    }

    proptest! {
        #[test]
        fn prop_extents_match_plain_buffer(ops in proptest::collection::vec(write_op(), 1..40)) {
            let mut page = Page::new();
            let mut model = vec![0u8; PAGE_SIZE];
            let mut covered = vec![false; PAGE_SIZE];
            for (off, data) in &ops {
                page.overlay(*off, data).unwrap();
                model[*off..off + data.len()].copy_from_slice(data);
                for c in &mut covered[*off..off + data.len()] {
                    *c = true;
                }
            }

            for pair in page.extents().windows(2) {
                prop_assert!(pair[0].high < pair[1].low);
            }
            let mut from_extents = vec![false; PAGE_SIZE];
            for e in page.extents() {
                prop_assert!(!e.is_empty());
                for c in &mut from_extents[e.low as usize..e.high as usize] {
                    *c = true;
                }
            }
            prop_assert_eq!(&from_extents, &covered);
            prop_assert_eq!(page.data(), &model[..]);
        }
    }
}
