//! gpu-scan: chunked data store + asynchronous accelerator pipeline for
//! offloaded table scans.
//!
//! Two tightly coupled subsystems:
//!
//! - [`chunk`]: a self-describing, relocatable binary chunk format that packs
//!   variable-length records into fixed-size buffers. Offsets only, no
//!   embedded pointers, so the same bytes are readable on the host and on an
//!   attached accelerator without fix-up. Four formats: Row (scan input and
//!   row materialization), Hash (join build side with an in-chunk open-hash
//!   index), Slot (fixed columnar projection output), Block (raw storage
//!   pages, records resolved lazily).
//! - [`exec`]: an asynchronous task pipeline that moves a chunk to the
//!   device, launches filter/projection kernels over it, retrieves results,
//!   and reconciles failures -- including transparent CPU fallback
//!   recomputation for conditions the device reports as recoverable.
//!
//! The accelerator itself is behind the [`device::DeviceRuntime`] trait
//! (reserve/free memory, submit command batches, get notified on a foreign
//! thread). [`device::HostDevice`] is a process-local reference backend used
//! by the tests and as the fallback execution model.
//!
//! Typical drive loop:
//!
//! ```no_run
//! use std::sync::Arc;
//! use gpu_scan::chunk::{RecordDescriptor, TypeTag};
//! use gpu_scan::device::HostDevice;
//! use gpu_scan::exec::{PipelineConfig, ScanKernels, ScanPipeline, SubmitOutcome, TableScan};
//! # use gpu_scan::chunk::StoragePage;
//! # use gpu_scan::exec::RecordSource;
//! # struct Drained;
//! # impl RecordSource for Drained {
//! #     fn next_page(&mut self) -> Option<StoragePage> { None }
//! # }
//!
//! let desc = RecordDescriptor::new(vec![
//!     ("id", TypeTag::Int64),
//!     ("payload", TypeTag::Bytes),
//! ]);
//! let device = Arc::new(HostDevice::with_default_kernels(Default::default()));
//! let pipeline = ScanPipeline::new(device, desc.clone(), ScanKernels::passthrough(),
//!                                  PipelineConfig::default()).unwrap();
//! let mut scan = TableScan::new(Drained, desc, 1);
//!
//! while let Some(chunk) = scan.next_chunk(1 << 20).unwrap() {
//!     match pipeline.submit(Arc::new(chunk)).unwrap() {
//!         SubmitOutcome::Accepted(_) => {}
//!         SubmitOutcome::RetryLater(chunk) => {
//!             // device memory pressure: drain one task, then resubmit
//!             let _ = pipeline.wait_completed();
//!             pipeline.submit(chunk).unwrap();
//!         }
//!     }
//!     while let Some(done) = pipeline.drain_completed() {
//!         let out = done.unwrap();
//!         for i in 0..out.row_count() {
//!             let _record = out.fetch(i).unwrap();
//!         }
//!     }
//! }
//! ```

pub mod chunk;
pub mod device;
pub mod error;
pub mod exec;

pub use error::{RecoveryAction, Result, ScanError};
