//! Owning chunk container: creation, record insertion, fetch, growth and
//! compaction.
//!
//! A `ChunkStore` owns exactly one chunk buffer. While a chunk is being
//! filled it is exclusively owned (`&mut`); once handed to the pipeline it
//! is sealed read-only behind an `Arc` ([`SharedChunk`]) and may be
//! referenced by any number of in-flight tasks. The last reference dropping
//! frees the buffer exactly once.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{Result, ScanError};

use super::descriptor::{RecordDescriptor, TypeTag};
use super::layout::{
    self, align_chunk, align_down, align_record, ChunkFormat, ChunkHeader, ColumnMeta,
    CHUNK_ALIGN, COLMETA_SIZE, HASH_ITEM_PREFIX, HEADER_SIZE, PAGE_SIZE, ROW_ITEM_HEADER,
    UNBOUNDED_ROOMS,
};
use super::record::{RecordView, SlotRow, Value};

/// A sealed, read-only chunk shared between the scan loop and in-flight
/// tasks. Cloning retains, dropping releases; the buffer is destroyed when
/// the last reference goes away.
pub type SharedChunk = Arc<ChunkStore>;

// ============================================================================
// Aligned buffer
// ============================================================================

/// Owned, zero-initialized, `CHUNK_ALIGN`-aligned byte buffer.
///
/// Raw allocation rather than `Vec<u8>` because the header and index regions
/// are accessed through `#[repr(C)]` struct views that need real alignment.
struct ChunkBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
}

impl ChunkBuffer {
    fn alloc(capacity: usize) -> Self {
        assert!(capacity > 0, "chunk buffer must be non-empty");
        let layout = Layout::from_size_align(capacity, CHUNK_ALIGN)
            .expect("chunk buffer layout");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).expect("chunk buffer allocation failed");
        Self { ptr, capacity }
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the buffer is allocated with `capacity` bytes and stays
        // alive as long as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, plus `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }
}

impl Drop for ChunkBuffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, CHUNK_ALIGN)
            .expect("chunk buffer layout");
        // SAFETY: allocated in `alloc` with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), layout) }
    }
}

// SAFETY: the buffer is plain bytes behind a unique owner; all shared access
// goes through `&self` and is read-only.
unsafe impl Send for ChunkBuffer {}
unsafe impl Sync for ChunkBuffer {}

// ============================================================================
// ChunkStore
// ============================================================================

/// Reference-counted owner of one chunk buffer (see [`SharedChunk`] for the
/// shared form) with the insert/fetch/grow/shrink primitives of the store.
pub struct ChunkStore {
    buf: ChunkBuffer,
    desc: RecordDescriptor,
}

/// A fetched record: zero-copy view for Row/Hash/Block chunks, decoded
/// values for Slot chunks.
#[derive(Debug)]
pub enum RecordData<'a> {
    View(RecordView<'a>),
    Slots(SlotRow),
}

impl RecordData<'_> {
    /// Decode into owned column values regardless of format.
    pub fn values(&self) -> Vec<Value> {
        match self {
            RecordData::View(v) => v.values(),
            RecordData::Slots(s) => s.values.clone(),
        }
    }
}

impl ChunkStore {
    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create a Row-format chunk. `size_hint` is rounded down to the chunk
    /// alignment; capacity in records is unbounded (append until full).
    pub fn create_row(desc: &RecordDescriptor, size_hint: usize) -> Result<Self> {
        Self::create_back_filled(desc, size_hint, ChunkFormat::Row)
    }

    /// Create a Hash-format chunk for a join build side.
    pub fn create_hash(desc: &RecordDescriptor, size_hint: usize) -> Result<Self> {
        Self::create_back_filled(desc, size_hint, ChunkFormat::Hash)
    }

    fn create_back_filled(
        desc: &RecordDescriptor,
        size_hint: usize,
        format: ChunkFormat,
    ) -> Result<Self> {
        let length = align_down(size_hint, CHUNK_ALIGN);
        let needed = layout::front_len(format, desc.ncols(), 0) + CHUNK_ALIGN;
        if length < needed {
            return Err(ScanError::ChunkFull { needed, available: length });
        }
        let mut store = Self::init(desc, length, format);
        let mut h = store.header();
        h.nrooms = UNBOUNDED_ROOMS;
        store.write_header(&h);
        Ok(store)
    }

    /// Create a Slot-format chunk with room for exactly `nrooms` records and
    /// `extra` bytes of variable-length side buffer.
    pub fn create_slot(desc: &RecordDescriptor, nrooms: usize, extra: usize) -> Result<Self> {
        let length = layout::head_len(desc.ncols())
            + align_chunk(layout::slot_stride(desc.ncols()) * nrooms)
            + align_chunk(extra);
        let mut store = Self::init(desc, length, ChunkFormat::Slot);
        let mut h = store.header();
        h.nrooms = nrooms as u32;
        store.write_header(&h);
        Ok(store)
    }

    /// Create a Block-format chunk. Page capacity is derived from the buffer
    /// length; a hint too small for even one page is rejected.
    pub fn create_block(desc: &RecordDescriptor, size_hint: usize) -> Result<Self> {
        let length = align_down(size_hint, CHUNK_ALIGN);
        let ncols = desc.ncols();
        let head = layout::head_len(ncols);
        if length <= head {
            return Err(ScanError::ChunkFull {
                needed: layout::length_for(ChunkFormat::Block, ncols, 1, 0),
                available: length,
            });
        }
        let mut nrooms = (length - head) / (4 + PAGE_SIZE);
        while nrooms > 0 && layout::length_for(ChunkFormat::Block, ncols, nrooms, 0) > length {
            nrooms -= 1;
        }
        if nrooms == 0 {
            return Err(ScanError::ChunkFull {
                needed: layout::length_for(ChunkFormat::Block, ncols, 1, 0),
                available: length,
            });
        }
        let mut store = Self::init(desc, length, ChunkFormat::Block);
        let mut h = store.header();
        h.nrooms = nrooms as u32;
        store.write_header(&h);
        Ok(store)
    }

    /// Zero-fill the header, copy per-column metadata, compute the
    /// static-offset shortcuts.
    fn init(desc: &RecordDescriptor, length: usize, format: ChunkFormat) -> Self {
        let buf = ChunkBuffer::alloc(length);
        let mut store = Self { buf, desc: desc.clone() };
        let header = ChunkHeader {
            length: length as u64,
            usage: 0,
            ncols: desc.ncols() as u32,
            nitems: 0,
            nrooms: 0,
            format: format as u32,
            nslots: 0,
            table_id: 0,
        };
        store.write_header(&header);
        let metas = layout::compile_colmeta(desc);
        for (i, meta) in metas.iter().enumerate() {
            // SAFETY: colmeta entries live inside the allocated buffer at
            // 4-byte-aligned offsets.
            unsafe {
                let dst = store.buf.ptr.as_ptr().add(HEADER_SIZE + i * COLMETA_SIZE);
                std::ptr::write(dst as *mut ColumnMeta, *meta);
            }
        }
        store
    }

    // ------------------------------------------------------------------
    // Header and metadata access
    // ------------------------------------------------------------------

    pub(crate) fn header(&self) -> ChunkHeader {
        // SAFETY: the buffer starts with a ChunkHeader, written in init and
        // kept valid by every mutation; the base pointer is 64-byte aligned.
        unsafe { std::ptr::read(self.buf.ptr.as_ptr() as *const ChunkHeader) }
    }

    pub(crate) fn write_header(&mut self, h: &ChunkHeader) {
        // SAFETY: as in header().
        unsafe { std::ptr::write(self.buf.ptr.as_ptr() as *mut ChunkHeader, *h) }
    }

    /// Per-column on-chunk metadata.
    pub(crate) fn colmeta(&self) -> &[ColumnMeta] {
        let ncols = self.header().ncols as usize;
        // SAFETY: init wrote `ncols` ColumnMeta entries right after the
        // header; alignment is 4 and the region is inside the buffer.
        unsafe {
            std::slice::from_raw_parts(
                self.buf.ptr.as_ptr().add(HEADER_SIZE) as *const ColumnMeta,
                ncols,
            )
        }
    }

    /// Chunk format.
    pub fn format(&self) -> ChunkFormat {
        ChunkFormat::from_code(self.header().format).expect("valid format in header")
    }

    /// Number of stored records (pages for Block format).
    pub fn record_count(&self) -> usize {
        self.header().nitems as usize
    }

    /// Logical chunk length in bytes (may be less than the allocation after
    /// a shrink).
    pub fn length(&self) -> usize {
        self.header().length as usize
    }

    /// Payload bytes in use.
    pub fn usage(&self) -> usize {
        self.header().usage as usize
    }

    /// Record capacity ([`UNBOUNDED_ROOMS`] for append-only formats).
    pub fn nrooms(&self) -> u32 {
        self.header().nrooms
    }

    /// Hash bucket count (0 until the index is built).
    pub fn nslots(&self) -> u32 {
        self.header().nslots
    }

    /// Source relation tag.
    pub fn table_id(&self) -> u32 {
        self.header().table_id
    }

    /// Stamp the source relation tag.
    pub fn set_table_id(&mut self, table_id: u32) {
        let mut h = self.header();
        h.table_id = table_id;
        self.write_header(&h);
    }

    /// Host-side descriptor this chunk was created with.
    pub fn descriptor(&self) -> &RecordDescriptor {
        &self.desc
    }

    /// The chunk image: exactly the bytes a device upload transfers.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf.as_slice()[..self.length()]
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }

    pub(crate) fn row_index_entry(&self, i: usize) -> u32 {
        let off = layout::head_len(self.header().ncols as usize) + 4 * i;
        layout::read_u32(self.buf.as_slice(), off)
    }

    pub(crate) fn set_row_index_entry(&mut self, i: usize, v: u32) {
        let off = layout::head_len(self.header().ncols as usize) + 4 * i;
        layout::write_u32(self.buf.as_mut_slice(), off, v);
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Append one encoded record to a Row chunk. `Ok(false)` means the chunk
    /// is full -- the caller's signal to seal this chunk and start a new one.
    pub fn insert_record(&mut self, src_id: u32, payload: &[u8]) -> Result<bool> {
        let h = self.header();
        if h.format != ChunkFormat::Row as u32 {
            return Err(ScanError::FormatMisuse {
                operation: "insert_record",
                format: self.format(),
            });
        }
        if h.nitems >= h.nrooms {
            return Ok(false);
        }
        let required = align_record(ROW_ITEM_HEADER + payload.len());
        let ncols = h.ncols as usize;
        let nitems = h.nitems as usize;
        let needed =
            layout::length_for(ChunkFormat::Row, ncols, nitems + 1, h.usage as usize + required);
        if needed > h.length as usize {
            return Ok(false);
        }

        let mut h = h;
        h.usage += required as u64;
        let off = (h.length - h.usage) as usize;
        {
            let buf = self.buf.as_mut_slice();
            layout::write_u32(buf, off, payload.len() as u32);
            layout::write_u32(buf, off + 4, src_id);
            buf[off + ROW_ITEM_HEADER..off + ROW_ITEM_HEADER + payload.len()]
                .copy_from_slice(payload);
        }
        self.set_row_index_entry(nitems, off as u32);
        h.nitems += 1;
        self.write_header(&h);
        Ok(true)
    }

    /// Convenience: encode `values` per the chunk's descriptor and append.
    pub fn insert_values(&mut self, src_id: u32, values: &[Value]) -> Result<bool> {
        let payload = super::record::encode_record(&self.desc, values);
        self.insert_record(src_id, &payload)
    }

    /// Append one encoded record with its hash value to a Hash chunk. The
    /// chain link starts at the unset sentinel; [`ChunkStore::build_hash_index`]
    /// links it later.
    pub fn insert_hash_record(&mut self, src_id: u32, payload: &[u8], hash: u32) -> Result<bool> {
        let h = self.header();
        if h.format != ChunkFormat::Hash as u32 || h.nslots != 0 {
            return Err(ScanError::FormatMisuse {
                operation: "insert_hash_record",
                format: self.format(),
            });
        }
        if h.nitems >= h.nrooms {
            return Ok(false);
        }
        let required = align_record(HASH_ITEM_PREFIX + ROW_ITEM_HEADER + payload.len());
        let ncols = h.ncols as usize;
        let nitems = h.nitems as usize;
        let needed =
            layout::length_for(ChunkFormat::Hash, ncols, nitems + 1, h.usage as usize + required);
        if needed > h.length as usize {
            return Ok(false);
        }

        let mut h = h;
        h.usage += required as u64;
        let item_off = (h.length - h.usage) as usize;
        {
            let buf = self.buf.as_mut_slice();
            layout::write_u32(buf, item_off, hash);
            layout::write_u32(buf, item_off + 4, layout::HASH_CHAIN_UNSET);
            layout::write_u32(buf, item_off + 8, nitems as u32);
            let row_off = item_off + HASH_ITEM_PREFIX;
            layout::write_u32(buf, row_off, payload.len() as u32);
            layout::write_u32(buf, row_off + 4, src_id);
            buf[row_off + ROW_ITEM_HEADER..row_off + ROW_ITEM_HEADER + payload.len()]
                .copy_from_slice(payload);
        }
        // The index points at the embedded row item; the hash prefix sits
        // HASH_ITEM_PREFIX bytes before it.
        self.set_row_index_entry(nitems, (item_off + HASH_ITEM_PREFIX) as u32);
        h.nitems += 1;
        self.write_header(&h);
        Ok(true)
    }

    /// Write one record into the next Slot row. Variable-length values go to
    /// the side buffer at the back; their slot stores the byte offset.
    ///
    /// # Panics
    /// Panics when the value count or a non-null value type does not match
    /// the chunk's columns (caller bug, same contract as record encoding).
    pub fn insert_slot_record(&mut self, values: &[Value]) -> Result<bool> {
        let h = self.header();
        if h.format != ChunkFormat::Slot as u32 {
            return Err(ScanError::FormatMisuse {
                operation: "insert_slot_record",
                format: self.format(),
            });
        }
        let ncols = h.ncols as usize;
        assert_eq!(values.len(), ncols, "slot record arity mismatch");
        if h.nitems >= h.nrooms {
            return Ok(false);
        }

        // Side-buffer demand for this record.
        let mut side_needed = 0usize;
        for (idx, value) in values.iter().enumerate() {
            if let Some(tag) = value.type_tag() {
                let col = TypeTag::from_code(self.colmeta()[idx].type_tag).expect("valid tag");
                assert_eq!(tag, col, "slot value type mismatch at column {}", idx);
                if let Value::Bytes(b) = value {
                    side_needed += align_record(4 + b.len());
                }
            }
        }
        let fixed_end = layout::head_len(ncols)
            + align_chunk(layout::slot_stride(ncols) * h.nrooms as usize);
        if fixed_end + h.usage as usize + side_needed > h.length as usize {
            return Ok(false);
        }

        let mut h = h;
        let stride = layout::slot_stride(ncols);
        let row_base = layout::head_len(ncols) + stride * h.nitems as usize;
        for (idx, value) in values.iter().enumerate() {
            let (bits, null) = match value {
                Value::Null => (0u64, 1u8),
                Value::Bool(b) => (*b as u64, 0),
                Value::Int32(v) => (*v as u32 as u64, 0),
                Value::Int64(v) => (*v as u64, 0),
                Value::Float64(v) => (v.to_bits(), 0),
                Value::Bytes(b) => {
                    h.usage += align_record(4 + b.len()) as u64;
                    let off = (h.length - h.usage) as usize;
                    let buf = self.buf.as_mut_slice();
                    layout::write_u32(buf, off, b.len() as u32);
                    buf[off + 4..off + 4 + b.len()].copy_from_slice(b);
                    (off as u64, 0)
                }
            };
            let buf = self.buf.as_mut_slice();
            layout::write_u64(buf, row_base + 8 * idx, bits);
            buf[row_base + 8 * ncols + idx] = null;
        }
        h.nitems += 1;
        self.write_header(&h);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------

    /// Fetch the record at `index`: zero-copy for Row/Hash/Block, decoded
    /// slots for Slot format.
    pub fn fetch(&self, index: usize) -> Result<RecordData<'_>> {
        match self.format() {
            ChunkFormat::Slot => self.fetch_slot(index).map(RecordData::Slots),
            _ => self.fetch_row(index).map(RecordData::View),
        }
    }

    /// Fetch a Row/Hash/Block record as a zero-copy view.
    pub fn fetch_row(&self, index: usize) -> Result<RecordView<'_>> {
        match self.format() {
            ChunkFormat::Row | ChunkFormat::Hash => {
                let nitems = self.record_count();
                if index >= nitems {
                    return Err(ScanError::OutOfRange { index, count: nitems });
                }
                self.record_at_offset(self.row_index_entry(index))
            }
            ChunkFormat::Block => self.fetch_block_record(index),
            ChunkFormat::Slot => Err(ScanError::FormatMisuse {
                operation: "fetch_row",
                format: self.format(),
            }),
        }
    }

    /// View the record whose row item starts at `offset` from the chunk
    /// base. Offsets come from the row index or from a device result buffer.
    pub(crate) fn record_at_offset(&self, offset: u32) -> Result<RecordView<'_>> {
        let bytes = self.as_bytes();
        let off = offset as usize;
        if off + ROW_ITEM_HEADER > bytes.len() {
            return Err(ScanError::OutOfRange { index: off, count: bytes.len() });
        }
        let len = layout::read_u32(bytes, off) as usize;
        let src_id = layout::read_u32(bytes, off + 4);
        let data = bytes
            .get(off + ROW_ITEM_HEADER..off + ROW_ITEM_HEADER + len)
            .ok_or(ScanError::OutOfRange { index: off, count: bytes.len() })?;
        Ok(RecordView::new(data, self.colmeta(), src_id))
    }

    /// Decode the Slot row at `index`.
    pub fn fetch_slot(&self, index: usize) -> Result<SlotRow> {
        let h = self.header();
        if h.format != ChunkFormat::Slot as u32 {
            return Err(ScanError::FormatMisuse {
                operation: "fetch_slot",
                format: self.format(),
            });
        }
        let nitems = h.nitems as usize;
        if index >= nitems {
            return Err(ScanError::OutOfRange { index, count: nitems });
        }
        let ncols = h.ncols as usize;
        let bytes = self.as_bytes();
        let row_base = layout::head_len(ncols) + layout::slot_stride(ncols) * index;
        let mut values = Vec::with_capacity(ncols);
        for (idx, meta) in self.colmeta().iter().enumerate() {
            let bits = layout::read_u64(bytes, row_base + 8 * idx);
            let null = bytes[row_base + 8 * ncols + idx] != 0;
            if null {
                values.push(Value::Null);
                continue;
            }
            let tag = TypeTag::from_code(meta.type_tag).expect("valid tag");
            values.push(match tag {
                TypeTag::Bool => Value::Bool(bits != 0),
                TypeTag::Int32 => Value::Int32(bits as u32 as i32),
                TypeTag::Int64 => Value::Int64(bits as i64),
                TypeTag::Float64 => Value::Float64(f64::from_bits(bits)),
                TypeTag::Bytes => {
                    let off = bits as usize;
                    if off + 4 > bytes.len() {
                        return Err(ScanError::OutOfRange { index: off, count: bytes.len() });
                    }
                    let len = layout::read_u32(bytes, off) as usize;
                    let data = bytes
                        .get(off + 4..off + 4 + len)
                        .ok_or(ScanError::OutOfRange { index: off, count: bytes.len() })?;
                    Value::Bytes(data.to_vec())
                }
            });
        }
        Ok(SlotRow { values })
    }

    // ------------------------------------------------------------------
    // Growth and compaction
    // ------------------------------------------------------------------

    /// Grow the chunk to `new_length` bytes (rounded down to the chunk
    /// alignment). Header and index are copied verbatim, payload records are
    /// shifted toward the new end and every index entry rewritten by the
    /// same shift. No-op if the chunk is already big enough.
    pub fn expand(&mut self, new_length: usize) -> Result<()> {
        let h = self.header();
        let new_len = align_down(new_length, CHUNK_ALIGN);
        let old_len = h.length as usize;
        if new_len <= old_len {
            return Ok(());
        }
        let ncols = h.ncols as usize;
        let nitems = h.nitems as usize;
        let usage = h.usage as usize;

        match self.format() {
            ChunkFormat::Row | ChunkFormat::Hash => {
                if h.nslots != 0 {
                    // A built bucket table holds absolute offsets a raw
                    // shift would invalidate.
                    return Err(ScanError::FormatMisuse {
                        operation: "expand after hash index build",
                        format: self.format(),
                    });
                }
                let shift = new_len - old_len;
                let mut next = ChunkBuffer::alloc(new_len);
                let front = layout::head_len(ncols) + 4 * nitems;
                let old_bytes = self.buf.as_slice();
                let new_bytes = next.as_mut_slice();
                new_bytes[..front].copy_from_slice(&old_bytes[..front]);
                new_bytes[new_len - usage..new_len]
                    .copy_from_slice(&old_bytes[old_len - usage..old_len]);
                layout::write_u64(new_bytes, 0, new_len as u64);
                for i in 0..nitems {
                    let off = layout::head_len(ncols) + 4 * i;
                    let v = layout::read_u32(new_bytes, off);
                    layout::write_u32(new_bytes, off, v + shift as u32);
                }
                self.buf = next;
                Ok(())
            }
            ChunkFormat::Slot => {
                if usage > 0 {
                    // Slot values may embed side-buffer offsets; a raw shift
                    // cannot relocate them safely.
                    return Err(ScanError::FormatMisuse {
                        operation: "expand slot chunk with side buffer in use",
                        format: self.format(),
                    });
                }
                let mut next = ChunkBuffer::alloc(new_len);
                let fixed_end = layout::head_len(ncols)
                    + align_chunk(layout::slot_stride(ncols) * h.nrooms as usize);
                next.as_mut_slice()[..fixed_end]
                    .copy_from_slice(&self.buf.as_slice()[..fixed_end]);
                layout::write_u64(next.as_mut_slice(), 0, new_len as u64);
                self.buf = next;
                Ok(())
            }
            ChunkFormat::Block => Err(ScanError::FormatMisuse {
                operation: "expand",
                format: self.format(),
            }),
        }
    }

    /// Reclaim the slack between the index and payload regions. A shift
    /// smaller than one storage page or smaller than the index footprint is
    /// not worth the move and leaves the chunk untouched. Hash chunks with a
    /// built index get their bucket table rebuilt (bucket assignment depends
    /// on absolute position).
    pub fn shrink(&mut self) -> Result<()> {
        let h = self.header();
        let ncols = h.ncols as usize;
        let nitems = h.nitems as usize;
        let usage = h.usage as usize;
        let old_len = h.length as usize;

        match self.format() {
            ChunkFormat::Row | ChunkFormat::Hash => {
                let required = layout::length_for(self.format(), ncols, nitems, usage);
                let shift = align_down(old_len.saturating_sub(required), CHUNK_ALIGN);
                if shift < PAGE_SIZE || shift < 8 * nitems {
                    return Ok(());
                }
                {
                    let buf = self.buf.as_mut_slice();
                    buf.copy_within(old_len - usage..old_len, old_len - usage - shift);
                }
                for i in 0..nitems {
                    let v = self.row_index_entry(i);
                    self.set_row_index_entry(i, v - shift as u32);
                }
                let mut h = h;
                h.length -= shift as u64;
                self.write_header(&h);
                if h.nslots > 0 {
                    super::hash::rebuild_chains(self);
                }
                Ok(())
            }
            ChunkFormat::Slot => {
                if usage > 0 {
                    return Err(ScanError::FormatMisuse {
                        operation: "shrink slot chunk with side buffer in use",
                        format: self.format(),
                    });
                }
                let mut h = h;
                h.nrooms = h.nitems;
                h.length = layout::length_for(ChunkFormat::Slot, ncols, nitems, 0) as u64;
                self.write_header(&h);
                Ok(())
            }
            ChunkFormat::Block => Err(ScanError::FormatMisuse {
                operation: "shrink",
                format: self.format(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Consistency
    // ------------------------------------------------------------------

    /// Check the structural invariants: `usage <= length`, `nitems <=
    /// nrooms`, and the front and payload regions not overlapping.
    pub fn is_consistent(&self) -> bool {
        let h = self.header();
        let Some(format) = ChunkFormat::from_code(h.format) else {
            return false;
        };
        let length = h.length as usize;
        let usage = h.usage as usize;
        let ncols = h.ncols as usize;
        let nitems = h.nitems as usize;
        if usage > length || h.nitems > h.nrooms || length > self.buf.capacity {
            return false;
        }
        let front = match format {
            ChunkFormat::Row | ChunkFormat::Hash => layout::front_len(format, ncols, nitems),
            ChunkFormat::Slot => {
                layout::head_len(ncols)
                    + align_chunk(layout::slot_stride(ncols) * h.nrooms as usize)
            }
            ChunkFormat::Block => {
                layout::head_len(ncols)
                    + align_chunk(4 * h.nrooms as usize)
                    + PAGE_SIZE * nitems
            }
        };
        front <= length - usage
    }

    /// Replace this chunk's contents with a downloaded device image. The
    /// image must be the same length and keep format/column structure and
    /// the structural invariants intact.
    pub(crate) fn apply_image(&mut self, image: &[u8]) -> bool {
        if image.len() != self.length() {
            return false;
        }
        let before = self.header();
        self.buf.as_mut_slice()[..image.len()].copy_from_slice(image);
        let after = self.header();
        after.format == before.format
            && after.ncols == before.ncols
            && after.length == before.length
            && self.is_consistent()
    }
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = self.header();
        f.debug_struct("ChunkStore")
            .field("format", &self.format())
            .field("length", &h.length)
            .field("usage", &h.usage)
            .field("nitems", &h.nitems)
            .field("nrooms", &h.nrooms)
            .field("nslots", &h.nslots)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
