//! Reference filter/projection kernels.
//!
//! These are the host-executable stand-ins for externally generated device
//! code. They deliberately see chunks the way real device kernels would: as
//! raw byte images addressed purely by offsets from the region base, with no
//! host structs, no pointers, no alignment assumptions. If these kernels can
//! evaluate a chunk, so can an accelerator given the same bytes.
//!
//! Status discipline: kernels return a [`super::protocol`] status code.
//! `STATUS_CPU_RECHECK` and `STATUS_DST_NO_SPACE` are the two recoverable
//! conditions the pipeline resolves by host fallback; everything >=
//! `STATUS_KERNEL_FAULT` aborts the task.

use crate::chunk::descriptor::TypeTag;
use crate::chunk::layout::{self, align_chunk, align_record, ChunkFormat, ROW_ITEM_HEADER};

use super::protocol::{
    self, CompareOp, FILTER_VALUE_INT, RESULT_OFFSET, STATUS_CPU_RECHECK, STATUS_DST_NO_SPACE,
    STATUS_KERNEL_FAULT, STATUS_SUCCESS,
};
use super::KernelCtx;

/// Filter kernel: evaluate the predicate over every source record and write
/// the byte offsets of passing records into the result buffer.
///
/// The device path only evaluates integer-family comparisons; any other
/// predicate shape is reported as `STATUS_CPU_RECHECK` for the host to
/// finish.
pub fn scan_filter(ctx: &mut KernelCtx<'_>) -> u32 {
    let params = protocol::decode_params(ctx.meta);
    if params.filter_present == 0 {
        return STATUS_SUCCESS;
    }
    let src = ctx.src;
    let header = layout::header_from_bytes(src);
    let ncols = header.ncols as usize;
    let col = params.filter_column as usize;
    if col >= ncols || header.format != ChunkFormat::Row as u32 {
        return STATUS_KERNEL_FAULT;
    }
    if params.filter_value_kind != FILTER_VALUE_INT {
        return STATUS_CPU_RECHECK;
    }
    let Some(op) = CompareOp::from_code(params.filter_op) else {
        return STATUS_KERNEL_FAULT;
    };
    let metas: Vec<_> = (0..ncols).map(|i| layout::colmeta_from_bytes(src, i)).collect();
    let tag = TypeTag::from_code(metas[col].type_tag);
    if !matches!(tag, Some(TypeTag::Bool | TypeTag::Int32 | TypeTag::Int64)) {
        return STATUS_CPU_RECHECK;
    }
    let tag = tag.expect("checked above");

    let head = layout::head_len(ncols);
    let nrooms = layout::read_u32(ctx.meta, RESULT_OFFSET + 8);
    let mut pass = 0u32;
    for i in 0..header.nitems as usize {
        let row_off = layout::read_u32(src, head + 4 * i) as usize;
        let len = layout::read_u32(src, row_off) as usize;
        let data = &src[row_off + ROW_ITEM_HEADER..row_off + ROW_ITEM_HEADER + len];
        let Some(coff) = layout::column_offset(&metas, data, col) else {
            return STATUS_KERNEL_FAULT;
        };
        let value = match tag {
            TypeTag::Bool => data[coff] as i64,
            TypeTag::Int32 => {
                i32::from_ne_bytes(data[coff..coff + 4].try_into().unwrap()) as i64
            }
            TypeTag::Int64 => i64::from_ne_bytes(data[coff..coff + 8].try_into().unwrap()),
            _ => unreachable!(),
        };
        if op.eval_i64(value, params.filter_value) {
            if pass >= nrooms {
                return STATUS_KERNEL_FAULT;
            }
            layout::write_u32(
                ctx.meta,
                protocol::RESULT_ITEMS_OFFSET + 4 * pass as usize,
                row_off as u32,
            );
            pass += 1;
        }
    }
    layout::write_u32(ctx.meta, RESULT_OFFSET + 4, pass);
    STATUS_SUCCESS
}

/// Offsets of the records the projection must materialize: the filter's
/// result array, or every record when no filter ran.
fn visible_offsets(meta: &[u8], src: &[u8]) -> Vec<u32> {
    let result = &meta[RESULT_OFFSET..];
    let header = protocol::decode_result_header(result);
    if header.all_visible != 0 {
        let src_header = layout::header_from_bytes(src);
        let head = layout::head_len(src_header.ncols as usize);
        (0..src_header.nitems as usize)
            .map(|i| layout::read_u32(src, head + 4 * i))
            .collect()
    } else {
        protocol::decode_result_offsets(result)
    }
}

/// Row projection kernel: materialize the projected columns of every
/// visible record into the destination Row chunk.
pub fn scan_project_row(ctx: &mut KernelCtx<'_>) -> u32 {
    let params = protocol::decode_params(ctx.meta);
    let src = ctx.src;
    let Some(dst) = ctx.dst.as_deref_mut() else {
        return STATUS_KERNEL_FAULT;
    };
    if params.proj_present == 0 || params.proj_ncols as usize > protocol::MAX_PROJECTION_COLS {
        return STATUS_KERNEL_FAULT;
    }
    let src_header = layout::header_from_bytes(src);
    let src_ncols = src_header.ncols as usize;
    let src_metas: Vec<_> =
        (0..src_ncols).map(|i| layout::colmeta_from_bytes(src, i)).collect();

    let mut dst_header = layout::header_from_bytes(dst);
    if dst_header.format != ChunkFormat::Row as u32 {
        return STATUS_KERNEL_FAULT;
    }
    let dst_ncols = dst_header.ncols as usize;
    let dst_metas: Vec<_> =
        (0..dst_ncols).map(|i| layout::colmeta_from_bytes(dst, i)).collect();
    let dst_head = layout::head_len(dst_ncols);

    for row_off in visible_offsets(ctx.meta, src) {
        let row_off = row_off as usize;
        let len = layout::read_u32(src, row_off) as usize;
        let src_id = layout::read_u32(src, row_off + 4);
        let data = &src[row_off + ROW_ITEM_HEADER..row_off + ROW_ITEM_HEADER + len];

        // Re-encode the projected columns in destination order.
        let mut out = Vec::with_capacity(len);
        for k in 0..params.proj_ncols as usize {
            let sc = params.proj_columns[k] as usize;
            if sc >= src_ncols {
                return STATUS_KERNEL_FAULT;
            }
            let Some(coff) = layout::column_offset(&src_metas, data, sc) else {
                return STATUS_KERNEL_FAULT;
            };
            let m = dst_metas[k];
            let pad = layout::align_up(out.len(), m.align as usize) - out.len();
            out.extend(std::iter::repeat(0u8).take(pad));
            if m.byte_len >= 0 {
                out.extend_from_slice(&data[coff..coff + m.byte_len as usize]);
            } else {
                let vlen = layout::read_u32(data, coff) as usize;
                out.extend_from_slice(&data[coff..coff + 4 + vlen]);
            }
        }

        let required = align_record(ROW_ITEM_HEADER + out.len());
        let needed = layout::length_for(
            ChunkFormat::Row,
            dst_ncols,
            dst_header.nitems as usize + 1,
            dst_header.usage as usize + required,
        );
        if needed > dst_header.length as usize {
            write_row_header(dst, &dst_header);
            return STATUS_DST_NO_SPACE;
        }
        dst_header.usage += required as u64;
        let off = (dst_header.length - dst_header.usage) as usize;
        layout::write_u32(dst, off, out.len() as u32);
        layout::write_u32(dst, off + 4, src_id);
        dst[off + ROW_ITEM_HEADER..off + ROW_ITEM_HEADER + out.len()].copy_from_slice(&out);
        layout::write_u32(dst, dst_head + 4 * dst_header.nitems as usize, off as u32);
        dst_header.nitems += 1;
    }
    write_row_header(dst, &dst_header);
    STATUS_SUCCESS
}

/// Slot projection kernel: decode the projected columns of every visible
/// record into the destination Slot chunk's (value, null) pairs, spilling
/// variable-length values to the side buffer.
pub fn scan_project_slot(ctx: &mut KernelCtx<'_>) -> u32 {
    let params = protocol::decode_params(ctx.meta);
    let src = ctx.src;
    let Some(dst) = ctx.dst.as_deref_mut() else {
        return STATUS_KERNEL_FAULT;
    };
    if params.proj_present == 0 {
        return STATUS_KERNEL_FAULT;
    }
    let src_header = layout::header_from_bytes(src);
    let src_ncols = src_header.ncols as usize;
    let src_metas: Vec<_> =
        (0..src_ncols).map(|i| layout::colmeta_from_bytes(src, i)).collect();

    let mut dst_header = layout::header_from_bytes(dst);
    if dst_header.format != ChunkFormat::Slot as u32 {
        return STATUS_KERNEL_FAULT;
    }
    let dst_ncols = dst_header.ncols as usize;
    let stride = layout::slot_stride(dst_ncols);
    let dst_head = layout::head_len(dst_ncols);
    let fixed_end = dst_head + align_chunk(stride * dst_header.nrooms as usize);

    for row_off in visible_offsets(ctx.meta, src) {
        if dst_header.nitems >= dst_header.nrooms {
            write_row_header(dst, &dst_header);
            return STATUS_DST_NO_SPACE;
        }
        let row_off = row_off as usize;
        let len = layout::read_u32(src, row_off) as usize;
        let data = &src[row_off + ROW_ITEM_HEADER..row_off + ROW_ITEM_HEADER + len];
        let row_base = dst_head + stride * dst_header.nitems as usize;

        for k in 0..params.proj_ncols as usize {
            let sc = params.proj_columns[k] as usize;
            if sc >= src_ncols {
                return STATUS_KERNEL_FAULT;
            }
            let m = src_metas[sc];
            let Some(coff) = layout::column_offset(&src_metas, data, sc) else {
                return STATUS_KERNEL_FAULT;
            };
            let bits = match TypeTag::from_code(m.type_tag) {
                Some(TypeTag::Bool) => data[coff] as u64,
                Some(TypeTag::Int32) => {
                    u32::from_ne_bytes(data[coff..coff + 4].try_into().unwrap()) as u64
                }
                Some(TypeTag::Int64) | Some(TypeTag::Float64) => {
                    u64::from_ne_bytes(data[coff..coff + 8].try_into().unwrap())
                }
                Some(TypeTag::Bytes) => {
                    let vlen = layout::read_u32(data, coff) as usize;
                    let need = align_record(4 + vlen);
                    if fixed_end + dst_header.usage as usize + need
                        > dst_header.length as usize
                    {
                        write_row_header(dst, &dst_header);
                        return STATUS_DST_NO_SPACE;
                    }
                    dst_header.usage += need as u64;
                    let soff = (dst_header.length - dst_header.usage) as usize;
                    layout::write_u32(dst, soff, vlen as u32);
                    dst[soff + 4..soff + 4 + vlen]
                        .copy_from_slice(&data[coff + 4..coff + 4 + vlen]);
                    soff as u64
                }
                None => return STATUS_KERNEL_FAULT,
            };
            layout::write_u64(dst, row_base + 8 * k, bits);
            dst[row_base + 8 * dst_ncols + k] = 0;
        }
        dst_header.nitems += 1;
    }
    write_row_header(dst, &dst_header);
    STATUS_SUCCESS
}

/// Write back the header fields a projection kernel mutates.
fn write_row_header(dst: &mut [u8], h: &layout::ChunkHeader) {
    layout::write_u64(dst, 8, h.usage);
    layout::write_u32(dst, 20, h.nitems);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkStore, RecordDescriptor, TypeTag, Value};
    use crate::device::protocol::{encode_meta, TaskParams};

    fn desc() -> RecordDescriptor {
        RecordDescriptor::new(vec![
            ("id", TypeTag::Int64),
            ("score", TypeTag::Float64),
            ("name", TypeTag::Bytes),
        ])
    }

    fn src_chunk(n: i64) -> ChunkStore {
        let mut chunk = ChunkStore::create_row(&desc(), 1 << 16).unwrap();
        for i in 0..n {
            chunk
                .insert_values(
                    i as u32,
                    &[
                        Value::Int64(i),
                        Value::Float64(i as f64 / 2.0),
                        Value::Bytes(format!("row{i}").into_bytes()),
                    ],
                )
                .unwrap();
        }
        chunk
    }

    fn filter_params(col: u32, op: CompareOp, value: i64) -> TaskParams {
        TaskParams {
            filter_present: 1,
            filter_column: col,
            filter_op: op as u32,
            filter_value_kind: FILTER_VALUE_INT,
            filter_value: value,
            ..Default::default()
        }
    }

    fn run_filter(chunk: &ChunkStore, params: &TaskParams) -> (u32, Vec<u32>) {
        let n = chunk.record_count() as u32;
        let mut meta = encode_meta(params, n, params.filter_present == 0);
        let mut ctx = KernelCtx {
            meta: &mut meta,
            src: chunk.as_bytes(),
            dst: None,
            threads: n,
            threadgroup: 256,
        };
        let status = scan_filter(&mut ctx);
        let offsets = protocol::decode_result_offsets(&meta[RESULT_OFFSET..]);
        (status, offsets)
    }

    #[test]
    fn test_filter_matches_expected_rows() {
        let chunk = src_chunk(100);
        let (status, offsets) = run_filter(&chunk, &filter_params(0, CompareOp::Ge, 90));
        assert_eq!(status, STATUS_SUCCESS);
        assert_eq!(offsets.len(), 10, "ids 90..99 pass");
        for off in offsets {
            let view = chunk.record_at_offset(off).unwrap();
            let id = view.value(0).unwrap().as_i64().unwrap();
            assert!(id >= 90, "offset {} resolves to a passing record, got id {}", off, id);
        }
    }

    #[test]
    fn test_filter_no_matches() {
        let chunk = src_chunk(10);
        let (status, offsets) = run_filter(&chunk, &filter_params(0, CompareOp::Lt, 0));
        assert_eq!(status, STATUS_SUCCESS);
        assert!(offsets.is_empty());
    }

    #[test]
    fn test_filter_float_predicate_needs_recheck() {
        let chunk = src_chunk(10);
        // Column 1 is Float64: outside device support, recoverable.
        let (status, _) = run_filter(&chunk, &filter_params(1, CompareOp::Gt, 2));
        assert_eq!(status, STATUS_CPU_RECHECK, "float predicate must fall back to the host");
    }

    #[test]
    fn test_filter_bad_column_faults() {
        let chunk = src_chunk(4);
        let (status, _) = run_filter(&chunk, &filter_params(7, CompareOp::Eq, 0));
        assert_eq!(status, STATUS_KERNEL_FAULT);
    }

    fn project_params(cols: &[u32]) -> TaskParams {
        let mut params = TaskParams {
            proj_present: 1,
            proj_ncols: cols.len() as u32,
            ..Default::default()
        };
        params.proj_columns[..cols.len()].copy_from_slice(cols);
        params
    }

    #[test]
    fn test_project_row_all_visible() {
        let src = src_chunk(20);
        let out_desc = desc().project(&[2, 0]).unwrap();
        let mut dst = ChunkStore::create_row(&out_desc, src.length()).unwrap();

        let params = project_params(&[2, 0]);
        let mut meta = encode_meta(&params, 0, true);
        let mut image = dst.as_bytes().to_vec();
        let mut ctx = KernelCtx {
            meta: &mut meta,
            src: src.as_bytes(),
            dst: Some(&mut image),
            threads: 20,
            threadgroup: 256,
        };
        assert_eq!(scan_project_row(&mut ctx), STATUS_SUCCESS);
        assert!(dst.apply_image(&image), "projected image must stay consistent");
        assert_eq!(dst.record_count(), 20);
        for i in 0..20 {
            let view = dst.fetch_row(i).unwrap();
            assert_eq!(
                view.values(),
                vec![
                    Value::Bytes(format!("row{i}").into_bytes()),
                    Value::Int64(i as i64)
                ],
                "projected record {} reorders columns correctly",
                i
            );
        }
    }

    #[test]
    fn test_project_row_dst_too_small() {
        let src = src_chunk(200);
        let out_desc = desc().project(&[0]).unwrap();
        let mut dst = ChunkStore::create_row(&out_desc, 512).unwrap();

        let params = project_params(&[0]);
        let mut meta = encode_meta(&params, 0, true);
        let mut image = dst.as_bytes().to_vec();
        let mut ctx = KernelCtx {
            meta: &mut meta,
            src: src.as_bytes(),
            dst: Some(&mut image),
            threads: 200,
            threadgroup: 256,
        };
        assert_eq!(
            scan_project_row(&mut ctx),
            STATUS_DST_NO_SPACE,
            "overflowing the destination is the recoverable no-space condition"
        );
    }

    #[test]
    fn test_project_slot_decodes_values() {
        let src = src_chunk(8);
        let out_desc = desc().project(&[0, 1, 2]).unwrap();
        let mut dst = ChunkStore::create_slot(&out_desc, 8, 1024).unwrap();

        let params = project_params(&[0, 1, 2]);
        let mut meta = encode_meta(&params, 0, true);
        let mut image = dst.as_bytes().to_vec();
        let mut ctx = KernelCtx {
            meta: &mut meta,
            src: src.as_bytes(),
            dst: Some(&mut image),
            threads: 8,
            threadgroup: 256,
        };
        assert_eq!(scan_project_slot(&mut ctx), STATUS_SUCCESS);
        assert!(dst.apply_image(&image));
        assert_eq!(dst.record_count(), 8);
        for i in 0..8i64 {
            let row = dst.fetch_slot(i as usize).unwrap();
            assert_eq!(row.values[0], Value::Int64(i));
            assert_eq!(row.values[1], Value::Float64(i as f64 / 2.0));
            assert_eq!(row.values[2], Value::Bytes(format!("row{i}").into_bytes()));
        }
    }

    #[test]
    fn test_project_slot_room_exhaustion() {
        let src = src_chunk(8);
        let out_desc = desc().project(&[0]).unwrap();
        let mut dst = ChunkStore::create_slot(&out_desc, 4, 0).unwrap();

        let params = project_params(&[0]);
        let mut meta = encode_meta(&params, 0, true);
        let mut image = dst.as_bytes().to_vec();
        let mut ctx = KernelCtx {
            meta: &mut meta,
            src: src.as_bytes(),
            dst: Some(&mut image),
            threads: 8,
            threadgroup: 256,
        };
        assert_eq!(scan_project_slot(&mut ctx), STATUS_DST_NO_SPACE);
    }

    #[test]
    fn test_filter_then_project_pipeline_order() {
        // Filter writes offsets, projection consumes them from the same meta
        // region -- the in-reservation handoff the real device does.
        let src = src_chunk(50);
        let out_desc = desc().project(&[0]).unwrap();
        let mut dst = ChunkStore::create_row(&out_desc, src.length()).unwrap();

        let mut params = filter_params(0, CompareOp::Lt, 5);
        params.proj_present = 1;
        params.proj_ncols = 1;
        params.proj_columns[0] = 0;

        let mut meta = encode_meta(&params, 50, false);
        let mut image = dst.as_bytes().to_vec();
        {
            let mut ctx = KernelCtx {
                meta: &mut meta,
                src: src.as_bytes(),
                dst: None,
                threads: 50,
                threadgroup: 256,
            };
            assert_eq!(scan_filter(&mut ctx), STATUS_SUCCESS);
        }
        {
            let mut ctx = KernelCtx {
                meta: &mut meta,
                src: src.as_bytes(),
                dst: Some(&mut image),
                threads: 50,
                threadgroup: 256,
            };
            assert_eq!(scan_project_row(&mut ctx), STATUS_SUCCESS);
        }
        assert!(dst.apply_image(&image));
        assert_eq!(dst.record_count(), 5, "only ids 0..4 survive the filter");
        for i in 0..5 {
            assert_eq!(
                dst.fetch_row(i).unwrap().values(),
                vec![Value::Int64(i as i64)]
            );
        }
    }
}
