//! The asynchronous scan pipeline: submit a sealed chunk, drive it through
//! device memory reservation, upload, kernel launches and download, then
//! reconcile the completion on the consumer side.
//!
//! Concurrency model: the submitting worker calls [`ScanPipeline::submit`]
//! and drains completions; the device backend delivers each completion on
//! its own thread. The callback touches exactly two pieces of shared state
//! -- the liveness flag and the task queues -- and checks liveness *first*,
//! because by the time it runs the scan may already be gone. Aborting the
//! scan releases every reservation from the abort path itself, so resource
//! cleanup never depends on callbacks still being delivered.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::chunk::{ChunkFormat, ChunkStore, RecordData, RecordDescriptor, SharedChunk};
use crate::device::protocol::{
    self, FAULT_BAD_BATCH, FAULT_CORRUPT_RESULT, RESULT_OFFSET, STATUS_SUCCESS,
};
use crate::device::{
    CommandBatch, CompletionNotice, DeviceRuntime, Download, DownloadTag, Launch, Regions,
    RuntimeStatus, StageTimings, Upload, UploadData,
};
use crate::error::{PipelineStage, Result, ScanError};

use super::fallback;
use super::predicate::{ProjectionOutput, ScanKernels};
use super::queue::TaskQueues;
use super::task::{ScanTask, TaskState};

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Recompute recoverable device conditions on the host. When disabled
    /// they surface to the consumer as errors instead.
    pub cpu_fallback: bool,
    /// Extra destination bytes reserved per source record for Row
    /// projections, on top of the source chunk length.
    pub row_extra_per_record: usize,
    /// Side-buffer bytes reserved per source record for Slot projections.
    pub slot_side_per_record: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cpu_fallback: true,
            row_extra_per_record: 64,
            slot_side_per_record: 64,
        }
    }
}

/// What [`ScanPipeline::submit`] did with the chunk.
pub enum SubmitOutcome {
    /// Task created and in flight; the id shows up again on the completed
    /// side.
    Accepted(u64),
    /// Device memory pressure: nothing was submitted, the chunk comes back
    /// to the caller to resubmit after draining a completion.
    RetryLater(SharedChunk),
}

/// Asynchronous filter/projection pipeline over one device.
pub struct ScanPipeline {
    device: Arc<dyn DeviceRuntime>,
    desc: RecordDescriptor,
    kernels: ScanKernels,
    config: PipelineConfig,
    queues: Arc<TaskQueues>,
    /// Cleared by abort; checked by every completion callback before it
    /// touches anything else.
    live: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl ScanPipeline {
    /// Create a pipeline for one scan. The kernel specs are validated
    /// against the source descriptor once, here, so the per-chunk paths can
    /// trust them.
    pub fn new(
        device: Arc<dyn DeviceRuntime>,
        desc: RecordDescriptor,
        kernels: ScanKernels,
        config: PipelineConfig,
    ) -> Result<Self> {
        if let Err(column) = kernels.validate(&desc) {
            return Err(ScanError::OutOfRange { index: column, count: desc.ncols() });
        }
        Ok(Self {
            device,
            desc,
            kernels,
            config,
            queues: Arc::new(TaskQueues::new()),
            live: Arc::new(AtomicBool::new(true)),
            next_id: AtomicU64::new(1),
        })
    }

    /// Submit one sealed Row chunk.
    ///
    /// Reservation failure under device memory pressure is not an error:
    /// the chunk is handed back as [`SubmitOutcome::RetryLater`] and the
    /// caller resubmits after draining a completion.
    pub fn submit(&self, src: SharedChunk) -> Result<SubmitOutcome> {
        if !self.live.load(Ordering::Acquire) {
            return Err(ScanError::Aborted);
        }
        if src.format() != ChunkFormat::Row {
            return Err(ScanError::FormatMisuse { operation: "submit", format: src.format() });
        }

        let nitems = src.record_count();
        let dst = self.create_destination(&src, nitems)?;

        let all_visible = self.kernels.filter.is_none();
        let nrooms = if all_visible { 0 } else { nitems as u32 };
        let meta = protocol::encode_meta(&self.kernels.task_params(), nrooms, all_visible);

        let meta_len = meta.len();
        let src_len = src.as_bytes().len();
        let src_off = protocol::device_align(meta_len);
        let dst_off = src_off + protocol::device_align(src_len);
        let dst_len = dst.as_ref().map(|d| d.as_bytes().len()).unwrap_or(0);
        let total = dst_off + protocol::device_align(dst_len);

        let reservation = match self.device.reserve(total) {
            Ok(reservation) => reservation,
            Err(err @ ScanError::DeviceResourceExhausted { .. }) => {
                log::debug!("task deferred, device memory pressure: {err}");
                return Ok(SubmitOutcome::RetryLater(src));
            }
            Err(err) => return Err(err),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let regions = Regions {
            meta: (0, meta_len),
            src: (src_off, src_len),
            dst: dst.as_ref().map(|d| (dst_off, d.as_bytes().len())),
        };

        let mut uploads = vec![
            Upload { offset: 0, data: UploadData::Bytes(meta) },
            Upload { offset: src_off, data: UploadData::Chunk(Arc::clone(&src)) },
        ];
        if let Some(dst) = &dst {
            uploads.push(Upload {
                offset: dst_off,
                data: UploadData::Bytes(dst.as_bytes().to_vec()),
            });
        }

        // Filter only when a predicate exists; projection only when a
        // destination does. No kernels at all is a legal (pure copy) task.
        let mut launches = Vec::with_capacity(2);
        if let Some(filter) = &self.kernels.filter {
            launches.push(Launch { kernel: filter.symbol.clone(), threads: nitems as u32 });
        }
        if let Some(projection) = &self.kernels.projection {
            launches.push(Launch { kernel: projection.symbol.clone(), threads: nitems as u32 });
        }

        let mut downloads = vec![Download {
            offset: RESULT_OFFSET,
            len: meta_len - RESULT_OFFSET,
            tag: DownloadTag::ResultBuf,
        }];
        if let Some((off, len)) = regions.dst {
            downloads.push(Download { offset: off, len, tag: DownloadTag::DstChunk });
        }

        let batch = CommandBatch {
            reservation: reservation.id(),
            regions,
            uploads,
            launches,
            downloads,
        };

        let mut task = ScanTask::new(id, src, dst);
        task.advance(TaskState::MemoryReserved);
        task.reservation = Some(reservation);
        task.all_visible = all_visible;
        task.advance(TaskState::Uploading);
        // Enqueue before submitting: the callback may fire immediately.
        self.queues.push_running(task);

        let queues = Arc::clone(&self.queues);
        let live = Arc::clone(&self.live);
        let device = Arc::clone(&self.device);
        let on_complete = Box::new(move |notice: CompletionNotice| {
            complete_task(&queues, &live, device.as_ref(), id, notice);
        });

        if let Err(err) = self.device.submit(batch, on_complete) {
            // Submission never left the host; unwind the enqueue.
            if let Some(mut task) = self.queues.cancel_running(id) {
                if let Some(reservation) = task.take_reservation() {
                    self.device.free(reservation);
                }
            }
            return Err(err);
        }
        log::debug!("task {id} submitted: {nitems} records, {total} device bytes");
        Ok(SubmitOutcome::Accepted(id))
    }

    fn create_destination(&self, src: &SharedChunk, nitems: usize) -> Result<Option<ChunkStore>> {
        let Some(projection) = &self.kernels.projection else {
            return Ok(None);
        };
        let out_desc = projection
            .spec
            .output_descriptor(&self.desc)
            .expect("projection validated at pipeline creation");
        let dst = match projection.spec.output {
            ProjectionOutput::Row => {
                let hint = src.length() + self.config.row_extra_per_record * nitems;
                ChunkStore::create_row(&out_desc, hint)?
            }
            ProjectionOutput::Slot => {
                let side = self.config.slot_side_per_record * nitems;
                ChunkStore::create_slot(&out_desc, nitems, side)?
            }
        };
        Ok(Some(dst))
    }

    /// Non-blocking: the next finished task, fallback already resolved, or
    /// `None` when nothing is ready (or the scan was aborted).
    pub fn drain_completed(&self) -> Option<Result<TaskOutput>> {
        if !self.live.load(Ordering::Acquire) {
            return None;
        }
        let task = self.queues.pop_completed()?;
        Some(self.finish(task))
    }

    /// Blocking form of [`drain_completed`](Self::drain_completed): waits
    /// until a task finishes. `None` when nothing is in flight or the scan
    /// was aborted.
    pub fn wait_completed(&self) -> Option<Result<TaskOutput>> {
        let task = self.queues.wait_completed(&self.live)?;
        if !self.live.load(Ordering::Acquire) {
            return None;
        }
        Some(self.finish(task))
    }

    /// Tasks submitted and not yet drained.
    pub fn in_flight(&self) -> usize {
        self.queues.in_flight()
    }

    /// Resolve the terminal disposition for the consumer: fallback tasks
    /// are recomputed here, transparently; failures surface verbatim.
    fn finish(&self, mut task: ScanTask) -> Result<TaskOutput> {
        match task.state() {
            TaskState::Completed => Ok(TaskOutput { task }),
            TaskState::FallbackRequired => {
                if !self.config.cpu_fallback {
                    let err = task
                        .error
                        .take()
                        .unwrap_or(ScanError::DeviceRecoverable { code: 0 });
                    log::error!("task {} recoverable but fallback disabled: {err}", task.id());
                    return Err(err);
                }
                log::warn!(
                    "task {} falling back to host recomputation ({} records)",
                    task.id(),
                    task.src.record_count()
                );
                fallback::recompute(&mut task, &self.kernels, &self.desc)?;
                Ok(TaskOutput { task })
            }
            TaskState::Failed => {
                let err = task.error.take().unwrap_or(ScanError::Aborted);
                if err.should_log() {
                    log::error!("task {} failed: {err}", task.id());
                }
                Err(err)
            }
            state => unreachable!("non-terminal task {:?} on the completed queue", state),
        }
    }

    /// Abort the scan: stop waiting for outstanding tasks and release their
    /// device memory here, whether or not their callbacks ever arrive.
    /// Idempotent.
    pub fn abort(&self) {
        self.live.store(false, Ordering::Release);
        let tasks = self.queues.drain_all();
        let discarded = tasks.len();
        for mut task in tasks {
            if let Some(reservation) = task.take_reservation() {
                self.device.free(reservation);
            }
        }
        if discarded > 0 {
            log::debug!("scan aborted, {discarded} outstanding tasks discarded");
        }
    }
}

impl Drop for ScanPipeline {
    fn drop(&mut self) {
        // Resource release must not depend on the consumer having drained.
        self.abort();
    }
}

/// Completion handler, invoked on the device's thread. Touches only the
/// liveness flag and the task queues; the queue lock is held for splices
/// only.
fn complete_task(
    queues: &TaskQueues,
    live: &AtomicBool,
    device: &dyn DeviceRuntime,
    id: u64,
    notice: CompletionNotice,
) {
    // The owning scan may be gone; its abort path released our resources.
    if !live.load(Ordering::Acquire) {
        return;
    }
    let Some(mut task) = queues.remove_running(id) else {
        return;
    };
    task.advance(TaskState::Executing);
    task.timings = notice.timings;
    task.advance(TaskState::Downloading);

    triage(&mut task, notice);

    // The one deterministic release point of the callback path.
    if let Some(reservation) = task.take_reservation() {
        device.free(reservation);
    }
    let priority = task.state() == TaskState::Failed;
    queues.push_completed(task, priority);
}

/// Decide the terminal disposition from the runtime status and the
/// downloaded result buffer.
fn triage(task: &mut ScanTask, notice: CompletionNotice) {
    if let RuntimeStatus::Fault(code) = notice.status {
        let stage = if code == FAULT_BAD_BATCH {
            PipelineStage::Upload
        } else {
            PipelineStage::Execute
        };
        task.fail(ScanError::DeviceFatal { stage, code });
        return;
    }

    let mut result = None;
    let mut dst_image = None;
    for (tag, bytes) in notice.downloads {
        match tag {
            DownloadTag::ResultBuf => result = Some(bytes),
            DownloadTag::DstChunk => dst_image = Some(bytes),
        }
    }
    let Some(result) = result else {
        task.fail(ScanError::DeviceFatal {
            stage: PipelineStage::Download,
            code: FAULT_CORRUPT_RESULT,
        });
        return;
    };

    let header = protocol::decode_result_header(&result);
    if protocol::status_is_recoverable(header.status) {
        task.advance(TaskState::FallbackRequired);
        // Kept only for the fallback-disabled path; host recomputation
        // clears it when it resolves the rows.
        task.error = Some(ScanError::DeviceRecoverable { code: header.status });
        return;
    }
    if header.status != STATUS_SUCCESS {
        task.fail(ScanError::DeviceFatal {
            stage: PipelineStage::Execute,
            code: header.status,
        });
        return;
    }

    if !task.all_visible {
        task.result_offsets = protocol::decode_result_offsets(&result);
    }
    if let Some(image) = dst_image {
        let applied = task.dst.as_mut().map(|d| d.apply_image(&image)).unwrap_or(false);
        if !applied {
            task.fail(ScanError::DeviceFatal {
                stage: PipelineStage::Download,
                code: FAULT_CORRUPT_RESULT,
            });
            return;
        }
    }
    task.advance(TaskState::Completed);
}

// ============================================================================
// TaskOutput
// ============================================================================

/// A finished task as handed to the consumer: either a materialized
/// destination chunk or a set of visible records in the source chunk.
pub struct TaskOutput {
    task: ScanTask,
}

impl TaskOutput {
    /// Task identifier, matching [`SubmitOutcome::Accepted`].
    pub fn task_id(&self) -> u64 {
        self.task.id()
    }

    /// Number of result records.
    pub fn row_count(&self) -> usize {
        match &self.task.dst {
            Some(dst) => dst.record_count(),
            None if self.task.all_visible => self.task.src.record_count(),
            None => self.task.result_offsets.len(),
        }
    }

    /// Fetch the `index`-th result record: from the destination chunk when
    /// the task projected, otherwise from the source chunk.
    pub fn fetch(&self, index: usize) -> Result<RecordData<'_>> {
        match &self.task.dst {
            Some(dst) => dst.fetch(index),
            None if self.task.all_visible => self.task.src.fetch(index),
            None => {
                let count = self.task.result_offsets.len();
                let offset = *self
                    .task
                    .result_offsets
                    .get(index)
                    .ok_or(ScanError::OutOfRange { index, count })?;
                Ok(RecordData::View(self.task.src.record_at_offset(offset)?))
            }
        }
    }

    /// The source chunk this task scanned.
    pub fn source(&self) -> &SharedChunk {
        &self.task.src
    }

    /// Stage timings reported by the device backend. Zero when the task
    /// was recomputed on the host before the device path finished.
    pub fn timings(&self) -> StageTimings {
        self.task.timings()
    }

    /// Whether the host recomputed this task's results.
    pub fn used_fallback(&self) -> bool {
        self.task.fallback_used
    }
}

impl std::fmt::Debug for TaskOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOutput")
            .field("task_id", &self.task.id())
            .field("rows", &self.row_count())
            .field("fallback", &self.task.fallback_used)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
