//! Fixed-size storage pages and page-oriented chunk ingestion.
//!
//! A [`StoragePage`] is the unit the record source hands over: 8 KiB with a
//! line-pointer directory growing from the front and record payloads growing
//! from the back. The visibility collaborator marks each line visible or
//! dead before the page reaches this crate.
//!
//! Two consumers:
//! - [`ChunkStore::insert_block`] copies every visible record of a page into
//!   a Row chunk (bulk scan ingestion), all-or-nothing;
//! - Block-format chunks store raw pages via [`ChunkStore::append_page`] and
//!   resolve record boundaries lazily at fetch time.

use crate::error::{Result, ScanError};

use super::layout::{self, align_chunk, align_record, ChunkFormat, PAGE_SIZE, ROW_ITEM_HEADER};
use super::record::RecordView;
use super::store::ChunkStore;

/// Page header: page id, line count, free-space bounds. 16 bytes.
const PAGE_HEADER: usize = 16;

/// Line pointer: record offset, length, flags. 8 bytes.
const LINE_ITEM: usize = 8;

/// Line flag: record is visible to the scan.
const LINE_VISIBLE: u16 = 1;

/// Outcome of [`ChunkStore::insert_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockInsert {
    /// All visible records of the page were absorbed (count given).
    Inserted(usize),
    /// The worst-case space demand does not fit; nothing was copied.
    /// Retry against a fresh chunk.
    Full,
}

// ============================================================================
// StoragePage
// ============================================================================

/// One fixed-size storage page with a line-pointer directory.
pub struct StoragePage {
    bytes: Box<[u8]>,
}

impl StoragePage {
    /// Start building a page.
    pub fn builder(page_id: u32) -> PageBuilder {
        let mut bytes = vec![0u8; PAGE_SIZE].into_boxed_slice();
        layout::write_u32(&mut bytes, 0, page_id);
        layout::write_u32(&mut bytes, 4, 0);
        layout::write_u32(&mut bytes, 8, PAGE_HEADER as u32);
        layout::write_u32(&mut bytes, 12, PAGE_SIZE as u32);
        PageBuilder { page: StoragePage { bytes } }
    }

    /// The raw page image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Page identifier assigned by the record source.
    pub fn page_id(&self) -> u32 {
        page_id(&self.bytes)
    }

    /// Total line pointers, visible or not.
    pub fn line_count(&self) -> usize {
        line_count(&self.bytes)
    }

    /// Number of visible lines.
    pub fn visible_count(&self) -> usize {
        (0..self.line_count())
            .filter(|&i| matches!(record_bytes(&self.bytes, i), Some((_, true))))
            .count()
    }

    /// Record payload and visibility of line `i`.
    pub fn record_bytes(&self, i: usize) -> Option<(&[u8], bool)> {
        record_bytes(&self.bytes, i)
    }
}

/// Incrementally fills a page from the back.
pub struct PageBuilder {
    page: StoragePage,
}

impl PageBuilder {
    /// Append one record payload. Returns false when the page cannot hold
    /// it; the page is left unchanged in that case.
    pub fn push(&mut self, payload: &[u8], visible: bool) -> bool {
        let bytes = &mut self.page.bytes;
        let nlines = layout::read_u32(bytes, 4) as usize;
        let lower = layout::read_u32(bytes, 8) as usize;
        let upper = layout::read_u32(bytes, 12) as usize;
        if lower + LINE_ITEM + payload.len() > upper {
            return false;
        }
        let new_upper = upper - payload.len();
        bytes[new_upper..upper].copy_from_slice(payload);
        let line_off = lower;
        bytes[line_off..line_off + 2].copy_from_slice(&(new_upper as u16).to_ne_bytes());
        bytes[line_off + 2..line_off + 4].copy_from_slice(&(payload.len() as u16).to_ne_bytes());
        let flags: u16 = if visible { LINE_VISIBLE } else { 0 };
        bytes[line_off + 4..line_off + 6].copy_from_slice(&flags.to_ne_bytes());
        layout::write_u32(bytes, 4, (nlines + 1) as u32);
        layout::write_u32(bytes, 8, (lower + LINE_ITEM) as u32);
        layout::write_u32(bytes, 12, new_upper as u32);
        true
    }

    pub fn finish(self) -> StoragePage {
        self.page
    }
}

// Raw readers shared between owned pages and page images inside a Block
// chunk buffer.

fn page_id(bytes: &[u8]) -> u32 {
    layout::read_u32(bytes, 0)
}

fn line_count(bytes: &[u8]) -> usize {
    layout::read_u32(bytes, 4) as usize
}

fn record_bytes(bytes: &[u8], i: usize) -> Option<(&[u8], bool)> {
    if i >= line_count(bytes) {
        return None;
    }
    let line_off = PAGE_HEADER + i * LINE_ITEM;
    let off = u16::from_ne_bytes(bytes[line_off..line_off + 2].try_into().unwrap()) as usize;
    let len = u16::from_ne_bytes(bytes[line_off + 2..line_off + 4].try_into().unwrap()) as usize;
    let flags = u16::from_ne_bytes(bytes[line_off + 4..line_off + 6].try_into().unwrap());
    Some((&bytes[off..off + len], flags & LINE_VISIBLE != 0))
}

/// Source row identifier for line `line` of page `page_id`.
fn line_src_id(page_id: u32, line: usize) -> u32 {
    (page_id << 16) | (line as u32 + 1)
}

// ============================================================================
// Page ingestion into chunks
// ============================================================================

impl ChunkStore {
    /// Copy every visible record of `page` into this Row chunk.
    ///
    /// The worst-case space demand (every line visible, a full page of
    /// payload) is checked up front; if it does not fit the chunk is left
    /// untouched and [`BlockInsert::Full`] tells the caller to retry with a
    /// fresh chunk. No partial absorption.
    pub fn insert_block(&mut self, page: &StoragePage) -> Result<BlockInsert> {
        let h = self.header();
        if h.format != ChunkFormat::Row as u32 {
            return Err(ScanError::FormatMisuse {
                operation: "insert_block",
                format: self.format(),
            });
        }
        let lines = page.line_count();
        let ncols = h.ncols as usize;
        let nitems = h.nitems as usize;
        // Conservative worst case, including the hash-format front reserve,
        // so the same chunk can still be re-targeted as a join build side.
        let worst = layout::length_for(
            ChunkFormat::Hash,
            ncols,
            nitems + lines,
            h.usage as usize + ROW_ITEM_HEADER * lines + PAGE_SIZE,
        );
        if worst > h.length as usize {
            return Ok(BlockInsert::Full);
        }

        let mut h = h;
        let mut ntup = 0usize;
        for i in 0..lines {
            let Some((payload, visible)) = page.record_bytes(i) else {
                continue;
            };
            if !visible {
                continue;
            }
            let required = align_record(ROW_ITEM_HEADER + payload.len());
            h.usage += required as u64;
            let off = (h.length - h.usage) as usize;
            {
                let buf = self.bytes_mut();
                layout::write_u32(buf, off, payload.len() as u32);
                layout::write_u32(buf, off + 4, line_src_id(page.page_id(), i));
                buf[off + ROW_ITEM_HEADER..off + ROW_ITEM_HEADER + payload.len()]
                    .copy_from_slice(payload);
            }
            self.set_row_index_entry(nitems + ntup, off as u32);
            ntup += 1;
        }
        h.nitems += ntup as u32;
        self.write_header(&h);
        Ok(BlockInsert::Inserted(ntup))
    }

    /// Append a raw page to a Block chunk. Returns false when the page
    /// capacity is exhausted.
    pub fn append_page(&mut self, page: &StoragePage) -> Result<bool> {
        let h = self.header();
        if h.format != ChunkFormat::Block as u32 {
            return Err(ScanError::FormatMisuse {
                operation: "append_page",
                format: self.format(),
            });
        }
        if h.nitems >= h.nrooms {
            return Ok(false);
        }
        let nitems = h.nitems as usize;
        let region = self.page_region_offset() + nitems * PAGE_SIZE;
        self.bytes_mut()[region..region + PAGE_SIZE].copy_from_slice(page.as_bytes());
        self.set_row_index_entry(nitems, page.page_id());
        let mut h = h;
        h.nitems += 1;
        self.write_header(&h);
        Ok(true)
    }

    /// Number of visible records across all stored pages (Block format).
    /// Boundaries are resolved lazily; nothing is cached.
    pub fn block_record_count(&self) -> Result<usize> {
        let h = self.header();
        if h.format != ChunkFormat::Block as u32 {
            return Err(ScanError::FormatMisuse {
                operation: "block_record_count",
                format: self.format(),
            });
        }
        let mut total = 0;
        for p in 0..h.nitems as usize {
            let bytes = self.page_image(p);
            total += (0..line_count(bytes))
                .filter(|&i| matches!(record_bytes(bytes, i), Some((_, true))))
                .count();
        }
        Ok(total)
    }

    /// Resolve the `index`-th visible record across the stored pages.
    pub(crate) fn fetch_block_record(&self, index: usize) -> Result<RecordView<'_>> {
        let h = self.header();
        let mut remaining = index;
        for p in 0..h.nitems as usize {
            let bytes = self.page_image(p);
            let pid = page_id(bytes);
            for i in 0..line_count(bytes) {
                let Some((payload, visible)) = record_bytes(bytes, i) else {
                    break;
                };
                if !visible {
                    continue;
                }
                if remaining == 0 {
                    return Ok(RecordView::new(payload, self.colmeta(), line_src_id(pid, i)));
                }
                remaining -= 1;
            }
        }
        Err(ScanError::OutOfRange { index, count: index - remaining })
    }

    fn page_region_offset(&self) -> usize {
        let h = self.header();
        layout::head_len(h.ncols as usize) + align_chunk(4 * h.nrooms as usize)
    }

    fn page_image(&self, p: usize) -> &[u8] {
        let start = self.page_region_offset() + p * PAGE_SIZE;
        &self.as_bytes()[start..start + PAGE_SIZE]
    }
}

// ============================================================================
// Tests
// ============================================================================
