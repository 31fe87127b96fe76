//! Host recomputation of filter and projection for tasks the device
//! reported as recoverable.
//!
//! The device path and this path share their specs ([`FilterSpec`],
//! [`Projection`]), so the visible-row set is identical by construction --
//! the recoverable task is re-evaluated from the raw source chunk as if the
//! device had never run. Destination chunks are rebuilt from scratch with
//! exact sizing, which also resolves the destination-out-of-space condition.

use crate::chunk::layout::{self, align_record, ChunkFormat, CHUNK_ALIGN, ROW_ITEM_HEADER};
use crate::chunk::record::encode_record;
use crate::chunk::{ChunkStore, RecordDescriptor, Value};
use crate::error::{Result, ScanError};

use super::predicate::{Projection, ProjectionOutput, ScanKernels};
use super::task::{ScanTask, TaskState};

/// Re-evaluate filter and projection on the host and move the task to
/// `Completed`. Expects a task in `FallbackRequired`.
pub(crate) fn recompute(
    task: &mut ScanTask,
    kernels: &ScanKernels,
    desc: &RecordDescriptor,
) -> Result<()> {
    let src = &task.src;
    let nitems = src.record_count();

    let mut passing = Vec::with_capacity(nitems);
    for i in 0..nitems {
        let view = src.fetch_row(i)?;
        let visible = match &kernels.filter {
            Some(filter) => filter.spec.matches(&view),
            None => true,
        };
        if visible {
            passing.push(i);
        }
    }

    match &kernels.projection {
        None => {
            task.result_offsets = passing.iter().map(|&i| src.row_index_entry(i)).collect();
            task.all_visible = false;
        }
        Some(projection) => {
            let dst = materialize(src, &passing, &projection.spec, desc)?;
            task.dst = Some(dst);
        }
    }
    task.fallback_used = true;
    // The device's recoverable condition is resolved, not surfaced.
    task.error = None;
    task.advance(TaskState::Completed);
    Ok(())
}

/// Build a fresh destination chunk holding the projection of the passing
/// records, sized exactly so the inserts cannot run out of room.
fn materialize(
    src: &ChunkStore,
    passing: &[usize],
    projection: &Projection,
    desc: &RecordDescriptor,
) -> Result<ChunkStore> {
    let out_desc = projection
        .output_descriptor(desc)
        .expect("projection columns validated at pipeline creation");

    match projection.output {
        ProjectionOutput::Row => {
            let mut rows = Vec::with_capacity(passing.len());
            let mut usage = 0usize;
            for &i in passing {
                let view = src.fetch_row(i)?;
                let payload = encode_record(&out_desc, &projection.project_values(&view));
                usage += align_record(ROW_ITEM_HEADER + payload.len());
                rows.push((view.src_id(), payload));
            }
            let length = layout::length_for(ChunkFormat::Row, out_desc.ncols(), rows.len(), usage);
            let mut dst = ChunkStore::create_row(&out_desc, length + 2 * CHUNK_ALIGN)?;
            for (src_id, payload) in rows {
                if !dst.insert_record(src_id, &payload)? {
                    return Err(ScanError::ChunkFull {
                        needed: payload.len(),
                        available: dst.length(),
                    });
                }
            }
            Ok(dst)
        }
        ProjectionOutput::Slot => {
            let mut rows = Vec::with_capacity(passing.len());
            let mut side = 0usize;
            for &i in passing {
                let view = src.fetch_row(i)?;
                let values = projection.project_values(&view);
                for value in &values {
                    if let Value::Bytes(b) = value {
                        side += align_record(4 + b.len());
                    }
                }
                rows.push(values);
            }
            let mut dst = ChunkStore::create_slot(&out_desc, rows.len(), side)?;
            for values in rows {
                if !dst.insert_slot_record(&values)? {
                    return Err(ScanError::ChunkFull { needed: side, available: dst.length() });
                }
            }
            Ok(dst)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
