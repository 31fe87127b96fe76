//! The unit of accelerator work: one source chunk, one optional destination,
//! one device reservation, one terminal disposition.
//!
//! A `ScanTask` owns its device memory through a single
//! [`DeviceReservation`] token covering metadata + source + destination.
//! The token is taken out exactly once (`Option::take`), whichever path gets
//! there first -- completion callback or abort -- so cleanup is one
//! deterministic call and double-free is unrepresentable.

use crate::chunk::{ChunkStore, SharedChunk};
use crate::device::{DeviceReservation, StageTimings};
use crate::error::ScanError;

/// Pipeline position of a task.
///
/// `Created` through `Downloading` are the driving stages;
/// `Completed` / `FallbackRequired` / `Failed` are terminal dispositions
/// (fallback resolution moves `FallbackRequired` to `Completed` on the
/// consumer side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    MemoryReserved,
    Uploading,
    Executing,
    Downloading,
    Completed,
    FallbackRequired,
    Failed,
}

impl TaskState {
    /// Whether the pipeline is done with this task.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::FallbackRequired | TaskState::Failed
        )
    }

    /// Legal forward transitions of the state machine.
    fn can_advance_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, MemoryReserved)
                | (MemoryReserved, Uploading)
                | (Uploading, Executing)
                | (Executing, Downloading)
                | (Downloading, Completed)
                | (Downloading, FallbackRequired)
                | (Downloading, Failed)
                | (FallbackRequired, Completed)
                | (FallbackRequired, Failed)
        )
    }
}

/// One in-flight unit of device work over a source chunk.
pub struct ScanTask {
    id: u64,
    state: TaskState,
    /// Sealed source chunk; shared with the scan loop and released when the
    /// last holder drops it.
    pub(crate) src: SharedChunk,
    /// Destination chunk, exclusively owned until the task is handed out.
    pub(crate) dst: Option<ChunkStore>,
    /// The per-task device ownership record. `take`n exactly once.
    pub(crate) reservation: Option<DeviceReservation>,
    /// Byte offsets of passing records in the source chunk, downloaded from
    /// the device result buffer (empty when `all_visible`).
    pub(crate) result_offsets: Vec<u32>,
    /// No filter ran; every source record is implicitly visible.
    pub(crate) all_visible: bool,
    /// The host recomputed this task's results.
    pub(crate) fallback_used: bool,
    pub(crate) timings: StageTimings,
    pub(crate) error: Option<ScanError>,
}

impl ScanTask {
    pub(crate) fn new(id: u64, src: SharedChunk, dst: Option<ChunkStore>) -> Self {
        Self {
            id,
            state: TaskState::Created,
            src,
            dst,
            reservation: None,
            result_offsets: Vec::new(),
            all_visible: false,
            fallback_used: false,
            timings: StageTimings::default(),
            error: None,
        }
    }

    /// Task identifier, unique within one pipeline.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current pipeline position.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Advance the state machine.
    pub(crate) fn advance(&mut self, next: TaskState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal task transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Mark the task failed with its error, from any stage.
    pub(crate) fn fail(&mut self, error: ScanError) {
        self.error = Some(error);
        self.state = TaskState::Failed;
    }

    /// Take the device ownership record for release. Returns `None` if the
    /// other exit path already released it.
    pub(crate) fn take_reservation(&mut self) -> Option<DeviceReservation> {
        self.reservation.take()
    }

    /// Stage timings reported by the device backend.
    pub fn timings(&self) -> StageTimings {
        self.timings
    }
}

impl std::fmt::Debug for ScanTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanTask")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("src_records", &self.src.record_count())
            .field("has_dst", &self.dst.is_some())
            .field("reserved", &self.reservation.is_some())
            .field("all_visible", &self.all_visible)
            .field("fallback_used", &self.fallback_used)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
