//! In-chunk open-hash index over Hash-format chunks.
//!
//! The bucket table is an array of u32 offsets living right after the record
//! index; each entry points at the hash prefix of the first record in that
//! bucket's chain, and every hash prefix carries the offset of the next one.
//! Offset 0 means empty/end of chain -- no record can live at the chunk
//! header. Everything is an offset from the chunk base, so the built index
//! ships to the device as-is.

use crate::error::{Result, ScanError};

use super::layout::{self, bucket_count_for, HASH_ITEM_PREFIX};
use super::record::RecordView;
use super::store::ChunkStore;

impl ChunkStore {
    /// Build the open-hash index over all records currently in this Hash
    /// chunk. One-shot: building twice is a misuse, as is any non-Hash
    /// format.
    ///
    /// Records are linked at the head of their bucket chain, so same-bucket
    /// records appear most-recently-inserted first. That ordering is an
    /// implementation consequence (and changes when a shrink rebuilds the
    /// table); callers must not rely on it.
    pub fn build_hash_index(&mut self) -> Result<()> {
        let h = self.header();
        if h.format != super::layout::ChunkFormat::Hash as u32 {
            return Err(ScanError::FormatMisuse {
                operation: "build_hash_index",
                format: self.format(),
            });
        }
        if h.nslots != 0 {
            return Err(ScanError::FormatMisuse {
                operation: "build_hash_index (already built)",
                format: self.format(),
            });
        }
        let mut h = h;
        h.nslots = bucket_count_for(h.nitems as usize) as u32;
        self.write_header(&h);
        rebuild_chains(self);
        Ok(())
    }

    /// Walk the bucket chain for `hash`, yielding records whose stored hash
    /// value matches exactly. The caller still has to verify record
    /// equality -- equal full hashes can collide.
    pub fn hash_lookup(&self, hash: u32) -> Result<HashChain<'_>> {
        let h = self.header();
        if h.format != super::layout::ChunkFormat::Hash as u32 || h.nslots == 0 {
            return Err(ScanError::FormatMisuse {
                operation: "hash_lookup",
                format: self.format(),
            });
        }
        let table_off = bucket_table_offset(self);
        let bucket = (hash % h.nslots) as usize;
        let head = layout::read_u32(self.as_bytes(), table_off + 4 * bucket);
        Ok(HashChain { chunk: self, hash, cursor: head })
    }

}

/// Byte offset of the bucket table: right after the record-offset index.
fn bucket_table_offset(chunk: &ChunkStore) -> usize {
    let h = chunk.header();
    layout::head_len(h.ncols as usize) + layout::row_index_len(h.nitems as usize)
}

/// Zero the bucket table and relink every record at the head of its bucket.
/// Bucket assignment depends on absolute record position, so a shrink that
/// moves the payload calls this again.
pub(crate) fn rebuild_chains(chunk: &mut ChunkStore) {
    let h = chunk.header();
    let nslots = h.nslots as usize;
    let nitems = h.nitems as usize;
    debug_assert!(nslots > 0);
    let table_off = bucket_table_offset(chunk);

    let index: Vec<u32> = (0..nitems).map(|i| chunk.row_index_entry(i)).collect();
    let bytes = chunk.bytes_mut();
    for b in 0..nslots {
        layout::write_u32(bytes, table_off + 4 * b, 0);
    }
    for (i, row_off) in index.into_iter().enumerate() {
        let item_off = row_off as usize - HASH_ITEM_PREFIX;
        let hash = layout::read_u32(bytes, item_off);
        debug_assert_eq!(layout::read_u32(bytes, item_off + 8), i as u32, "stored rowid");
        let bucket = (hash as usize % nslots) * 4 + table_off;
        let chain_head = layout::read_u32(bytes, bucket);
        layout::write_u32(bytes, item_off + 4, chain_head);
        layout::write_u32(bytes, bucket, item_off as u32);
    }
}

/// Iterator over one bucket chain, filtered to exact hash matches.
pub struct HashChain<'a> {
    chunk: &'a ChunkStore,
    hash: u32,
    cursor: u32,
}

impl<'a> Iterator for HashChain<'a> {
    /// (record index, record view)
    type Item = (usize, RecordView<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.chunk.as_bytes();
        while self.cursor != 0 {
            let item_off = self.cursor as usize;
            let stored_hash = layout::read_u32(bytes, item_off);
            let next = layout::read_u32(bytes, item_off + 4);
            let rowid = layout::read_u32(bytes, item_off + 8) as usize;
            self.cursor = next;
            if stored_hash == self.hash {
                // A chain offset outside the chunk would mean corruption;
                // terminate the walk rather than panic.
                let view = self
                    .chunk
                    .record_at_offset((item_off + HASH_ITEM_PREFIX) as u32)
                    .ok()?;
                return Some((rowid, view));
            }
        }
        None
    }
}

// ============================================================================
// Tests
// ============================================================================
