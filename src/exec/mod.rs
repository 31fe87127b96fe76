//! Asynchronous task pipeline over the chunked data store.
//!
//! The flow, end to end: [`TableScan`] materializes Row chunks from a
//! [`RecordSource`]; [`ScanPipeline::submit`] binds each sealed chunk to a
//! [`ScanTask`], reserves device memory, and fires one command batch
//! (upload, filter/projection launches, download); the device's completion
//! notice -- delivered on a thread this crate does not control -- triages
//! the task onto the completed queue; the consumer drains finished tasks,
//! with recoverable device conditions recomputed on the host before they
//! are handed out.

mod fallback;
mod queue;

pub mod pipeline;
pub mod predicate;
pub mod scan;
pub mod task;

pub use pipeline::{PipelineConfig, ScanPipeline, SubmitOutcome, TaskOutput};
pub use predicate::{
    CompareOp, FilterKernel, FilterSpec, FilterValue, Projection, ProjectionKernel,
    ProjectionOutput, ScanKernels,
};
pub use scan::{RecordSource, TableScan};
pub use task::{ScanTask, TaskState};
