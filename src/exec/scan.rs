//! Chunk materialization loop over an external record source.
//!
//! [`TableScan`] pulls visibility-filtered storage pages from a
//! [`RecordSource`] and packs them into Row chunks via the all-or-nothing
//! page ingestion of the store. A page that does not fit the current chunk
//! is carried over to the next one; a page that cannot fit even a fresh
//! chunk is the caller's sizing bug and comes back as `ChunkFull`.

use crate::chunk::layout::{self, ChunkFormat, PAGE_SIZE, ROW_ITEM_HEADER};
use crate::chunk::{BlockInsert, ChunkStore, RecordDescriptor, StoragePage};
use crate::error::{Result, ScanError};

/// External collaborator yielding raw storage pages. Every line on a page
/// is already visibility-checked; dead lines are merely flagged.
pub trait RecordSource {
    /// The next page, or `None` at end of input.
    fn next_page(&mut self) -> Option<StoragePage>;
}

/// Materializes the record stream into Row chunks sized by the caller's
/// byte budget.
pub struct TableScan<S> {
    source: S,
    desc: RecordDescriptor,
    table_id: u32,
    /// Page that did not fit the previous chunk; absorbed first by the next.
    carry: Option<StoragePage>,
}

impl<S: RecordSource> TableScan<S> {
    pub fn new(source: S, desc: RecordDescriptor, table_id: u32) -> Self {
        Self { source, desc, table_id, carry: None }
    }

    /// Materialize the next chunk of up to `byte_budget` bytes, or `None`
    /// at end of input.
    pub fn next_chunk(&mut self, byte_budget: usize) -> Result<Option<ChunkStore>> {
        let mut chunk = ChunkStore::create_row(&self.desc, byte_budget)?;
        chunk.set_table_id(self.table_id);

        loop {
            let Some(page) = self.carry.take().or_else(|| self.source.next_page()) else {
                break;
            };
            match chunk.insert_block(&page)? {
                BlockInsert::Inserted(_) => continue,
                BlockInsert::Full => {
                    if chunk.record_count() == 0 {
                        // Even an empty chunk of this budget cannot absorb
                        // the page: the budget is too small to ever make
                        // progress.
                        let lines = page.line_count();
                        let needed = layout::length_for(
                            ChunkFormat::Hash,
                            self.desc.ncols(),
                            lines,
                            ROW_ITEM_HEADER * lines + PAGE_SIZE,
                        );
                        return Err(ScanError::ChunkFull {
                            needed,
                            available: chunk.length(),
                        });
                    }
                    self.carry = Some(page);
                    return Ok(Some(chunk));
                }
            }
        }
        if chunk.record_count() == 0 {
            return Ok(None);
        }
        Ok(Some(chunk))
    }
}

// ============================================================================
// Tests
// ============================================================================
