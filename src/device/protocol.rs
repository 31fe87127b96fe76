//! `#[repr(C)]` task-parameter and result-buffer structs shared between the
//! pipeline and device kernels, plus the meta-region layout arithmetic.
//!
//! The meta region of a task reservation is:
//!
//! ```text
//! +---------------+ 0
//! | TaskParams    |  96 bytes
//! +---------------+ RESULT_OFFSET (96)
//! | ResultHeader  |  16 bytes
//! +---------------+ RESULT_ITEMS_OFFSET (112)
//! | u32 x nrooms  |  offsets of passing records in the source chunk
//! +---------------+ meta_len (chunk-aligned)
//! ```
//!
//! Kernels see the region as raw bytes with no alignment guarantee, so all
//! access goes through the ne_bytes readers in [`crate::chunk::layout`].

use crate::chunk::layout::{self, align_chunk};

/// Filter kernel symbol.
pub const KERNEL_FILTER: &str = "scan_filter";
/// Row projection kernel symbol.
pub const KERNEL_PROJECT_ROW: &str = "scan_project_row";
/// Slot projection kernel symbol.
pub const KERNEL_PROJECT_SLOT: &str = "scan_project_slot";

/// Kernel completed normally.
pub const STATUS_SUCCESS: u32 = 0;
/// Recoverable: the predicate needs a value the device cannot compute.
pub const STATUS_CPU_RECHECK: u32 = 1;
/// Recoverable: the destination chunk ran out of space.
pub const STATUS_DST_NO_SPACE: u32 = 2;
/// Kernel-internal fault (corrupt input image, region mismatch).
pub const STATUS_KERNEL_FAULT: u32 = 100;

/// Runtime fault: kernel symbol not in the registry.
pub const FAULT_BAD_KERNEL: u32 = 200;
/// Runtime fault: malformed command batch (bad reservation or regions).
pub const FAULT_BAD_BATCH: u32 = 201;
/// Host-side fault: downloaded image failed validation.
pub const FAULT_CORRUPT_RESULT: u32 = 202;

/// Upper bound on projected columns carried in TaskParams.
pub const MAX_PROJECTION_COLS: usize = 16;

/// Comparison operator codes carried in `TaskParams::filter_op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CompareOp {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Le = 3,
    Gt = 4,
    Ge = 5,
}

impl CompareOp {
    /// Convert from the wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(CompareOp::Eq),
            1 => Some(CompareOp::Ne),
            2 => Some(CompareOp::Lt),
            3 => Some(CompareOp::Le),
            4 => Some(CompareOp::Gt),
            5 => Some(CompareOp::Ge),
            _ => None,
        }
    }

    /// Evaluate over i64 operands.
    pub fn eval_i64(self, lhs: i64, rhs: i64) -> bool {
        match self {
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Gt => lhs > rhs,
            CompareOp::Ge => lhs >= rhs,
        }
    }

    /// Evaluate over f64 operands.
    pub fn eval_f64(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Gt => lhs > rhs,
            CompareOp::Ge => lhs >= rhs,
        }
    }
}

/// `filter_value` holds an i64.
pub const FILTER_VALUE_INT: u32 = 0;
/// `filter_value` holds f64 bits (device reports cpu-recheck).
pub const FILTER_VALUE_FLOAT: u32 = 1;

/// Task parameters uploaded ahead of the source chunk.
///
/// Layout: 96 bytes, 8-byte aligned.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskParams {
    /// 1 if a filter predicate is present (offset 0).
    pub filter_present: u32,
    /// Source column the predicate tests (offset 4).
    pub filter_column: u32,
    /// Comparison operator code (offset 8).
    pub filter_op: u32,
    /// FILTER_VALUE_INT / FILTER_VALUE_FLOAT (offset 12).
    pub filter_value_kind: u32,
    /// Threshold bits (offset 16).
    pub filter_value: i64,
    /// 1 if a projection is present (offset 24).
    pub proj_present: u32,
    /// Number of projected columns (offset 28).
    pub proj_ncols: u32,
    /// Source column index per projected column (offset 32).
    pub proj_columns: [u32; MAX_PROJECTION_COLS],
}

/// Result buffer header written by the filter kernel.
///
/// Layout: 16 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultHeader {
    /// Kernel status code, first nonzero wins.
    pub status: u32,
    /// Number of passing records (offsets filled below the header).
    pub nitems: u32,
    /// Capacity of the offset array.
    pub nrooms: u32,
    /// 1 when no filter ran and every source record is implicitly visible.
    pub all_visible: u32,
}

/// Byte offset of [`ResultHeader`] inside the meta region.
pub const RESULT_OFFSET: usize = std::mem::size_of::<TaskParams>();
/// Byte offset of the result offset array inside the meta region.
pub const RESULT_ITEMS_OFFSET: usize = RESULT_OFFSET + std::mem::size_of::<ResultHeader>();

const _: () = assert!(std::mem::size_of::<TaskParams>() == 96);
const _: () = assert!(std::mem::size_of::<ResultHeader>() == 16);
const _: () = assert!(RESULT_OFFSET % 8 == 0);

/// Device memory granularity: every region of a reservation starts on this
/// boundary.
pub const DEVICE_MEM_ALIGN: usize = 256;

/// Round up to the device memory granularity.
pub const fn device_align(v: usize) -> usize {
    (v + DEVICE_MEM_ALIGN - 1) & !(DEVICE_MEM_ALIGN - 1)
}

/// Total meta-region length for a result array of `nrooms` offsets.
pub fn meta_len(nrooms: usize) -> usize {
    align_chunk(RESULT_ITEMS_OFFSET + 4 * nrooms)
}

/// Serialize the meta region: params, zeroed result header with `nrooms`
/// and the all-visible flag, zeroed offset array.
pub fn encode_meta(params: &TaskParams, nrooms: u32, all_visible: bool) -> Vec<u8> {
    let mut out = vec![0u8; meta_len(nrooms as usize)];
    layout::write_u32(&mut out, 0, params.filter_present);
    layout::write_u32(&mut out, 4, params.filter_column);
    layout::write_u32(&mut out, 8, params.filter_op);
    layout::write_u32(&mut out, 12, params.filter_value_kind);
    layout::write_u64(&mut out, 16, params.filter_value as u64);
    layout::write_u32(&mut out, 24, params.proj_present);
    layout::write_u32(&mut out, 28, params.proj_ncols);
    for (i, col) in params.proj_columns.iter().enumerate() {
        layout::write_u32(&mut out, 32 + 4 * i, *col);
    }
    layout::write_u32(&mut out, RESULT_OFFSET + 8, nrooms);
    layout::write_u32(&mut out, RESULT_OFFSET + 12, all_visible as u32);
    out
}

/// Decode [`TaskParams`] from a meta region image.
pub fn decode_params(meta: &[u8]) -> TaskParams {
    let mut proj_columns = [0u32; MAX_PROJECTION_COLS];
    for (i, col) in proj_columns.iter_mut().enumerate() {
        *col = layout::read_u32(meta, 32 + 4 * i);
    }
    TaskParams {
        filter_present: layout::read_u32(meta, 0),
        filter_column: layout::read_u32(meta, 4),
        filter_op: layout::read_u32(meta, 8),
        filter_value_kind: layout::read_u32(meta, 12),
        filter_value: layout::read_u64(meta, 16) as i64,
        proj_present: layout::read_u32(meta, 24),
        proj_ncols: layout::read_u32(meta, 28),
        proj_columns,
    }
}

/// Decode the result header from a downloaded result region (which starts
/// at the header, not at the meta base).
pub fn decode_result_header(result: &[u8]) -> ResultHeader {
    ResultHeader {
        status: layout::read_u32(result, 0),
        nitems: layout::read_u32(result, 4),
        nrooms: layout::read_u32(result, 8),
        all_visible: layout::read_u32(result, 12),
    }
}

/// Passing-record offsets from a downloaded result region.
pub fn decode_result_offsets(result: &[u8]) -> Vec<u32> {
    let header = decode_result_header(result);
    let n = header.nitems.min(header.nrooms) as usize;
    (0..n).map(|i| layout::read_u32(result, 16 + 4 * i)).collect()
}

/// Record a kernel status into the meta region's result header unless an
/// earlier nonzero status is already there (first failure wins).
pub fn merge_status(meta: &mut [u8], status: u32) {
    if status != STATUS_SUCCESS && layout::read_u32(meta, RESULT_OFFSET) == STATUS_SUCCESS {
        layout::write_u32(meta, RESULT_OFFSET, status);
    }
}

/// True for the two kernel conditions the host resolves by fallback
/// recomputation.
pub fn status_is_recoverable(status: u32) -> bool {
    status == STATUS_CPU_RECHECK || status == STATUS_DST_NO_SPACE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(std::mem::size_of::<TaskParams>(), 96, "TaskParams must be 96 bytes");
        assert_eq!(std::mem::size_of::<ResultHeader>(), 16, "ResultHeader must be 16 bytes");
        assert_eq!(RESULT_OFFSET, 96);
        assert_eq!(RESULT_ITEMS_OFFSET, 112);
    }

    #[test]
    fn test_meta_roundtrip() {
        let mut params = TaskParams {
            filter_present: 1,
            filter_column: 2,
            filter_op: 4,
            filter_value_kind: FILTER_VALUE_INT,
            filter_value: -77,
            proj_present: 1,
            proj_ncols: 3,
            proj_columns: [0; MAX_PROJECTION_COLS],
        };
        params.proj_columns[0] = 2;
        params.proj_columns[1] = 0;
        params.proj_columns[2] = 1;

        let meta = encode_meta(&params, 128, false);
        assert_eq!(meta.len(), meta_len(128));
        assert_eq!(decode_params(&meta), params, "params roundtrip through the meta image");

        let header = decode_result_header(&meta[RESULT_OFFSET..]);
        assert_eq!(header.status, STATUS_SUCCESS);
        assert_eq!(header.nitems, 0);
        assert_eq!(header.nrooms, 128);
        assert_eq!(header.all_visible, 0);
    }

    #[test]
    fn test_merge_status_first_failure_wins() {
        let mut meta = encode_meta(&TaskParams::default(), 4, true);
        merge_status(&mut meta, STATUS_SUCCESS);
        assert_eq!(decode_result_header(&meta[RESULT_OFFSET..]).status, STATUS_SUCCESS);
        merge_status(&mut meta, STATUS_CPU_RECHECK);
        assert_eq!(decode_result_header(&meta[RESULT_OFFSET..]).status, STATUS_CPU_RECHECK);
        merge_status(&mut meta, STATUS_KERNEL_FAULT);
        assert_eq!(
            decode_result_header(&meta[RESULT_OFFSET..]).status,
            STATUS_CPU_RECHECK,
            "later status must not overwrite the first failure"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(status_is_recoverable(STATUS_CPU_RECHECK));
        assert!(status_is_recoverable(STATUS_DST_NO_SPACE));
        assert!(!status_is_recoverable(STATUS_SUCCESS));
        assert!(!status_is_recoverable(STATUS_KERNEL_FAULT));
    }

    #[test]
    fn test_device_align() {
        assert_eq!(device_align(0), 0);
        assert_eq!(device_align(1), 256);
        assert_eq!(device_align(256), 256);
        assert_eq!(device_align(257), 512);
    }
}
