//! Centralized error types and recovery strategies for gpu-scan.
//!
//! Every failure mode in the chunk store and device pipeline has a defined
//! recovery action:
//!
//! | Error                    | Recovery                                   |
//! |--------------------------|--------------------------------------------|
//! | ChunkFull                | Start a new chunk, retry the insert        |
//! | OutOfRange               | Fatal: caller indexed past record_count    |
//! | FormatMisuse             | Fatal: operation invalid for chunk format  |
//! | DeviceResourceExhausted  | Back off, resubmit when memory frees up    |
//! | DeviceRecoverable        | Recompute filter/projection on the host    |
//! | DeviceFatal              | Fatal: surface stage + status code upward  |
//! | Aborted                  | Discard results, no error to the consumer  |

use std::fmt;

use crate::chunk::ChunkFormat;

/// Pipeline stage names used in device error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Device memory reservation.
    Reserve,
    /// Host-to-device copy of task metadata and chunks.
    Upload,
    /// Filter/projection kernel execution.
    Execute,
    /// Device-to-host copy of results.
    Download,
    /// Completion handling after download.
    Complete,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Reserve => "reserve",
            PipelineStage::Upload => "upload",
            PipelineStage::Execute => "execute",
            PipelineStage::Download => "download",
            PipelineStage::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Central error type for all gpu-scan operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// A chunk cannot hold the requested data. Non-fatal backpressure:
    /// the caller starts a fresh chunk and retries.
    ChunkFull {
        /// Bytes the operation would have needed.
        needed: usize,
        /// Chunk length actually available.
        available: usize,
    },

    /// Fetch index at or beyond the record count. Caller bug.
    OutOfRange {
        index: usize,
        count: usize,
    },

    /// An operation was applied to a chunk format that does not support it
    /// (hash insert on a Row chunk, second hash-index build, ...). Caller bug.
    FormatMisuse {
        operation: &'static str,
        format: ChunkFormat,
    },

    /// Device memory reservation failed under pressure. Transient: back off
    /// and resubmit, this is not a task failure.
    DeviceResourceExhausted {
        requested: usize,
        in_use: usize,
        capacity: usize,
    },

    /// The device reported a condition it cannot finish (predicate outside
    /// device support, destination chunk out of space). Resolved internally
    /// by host recomputation; only surfaces when CPU fallback is disabled.
    DeviceRecoverable {
        code: u32,
    },

    /// Driver/runtime or kernel failure. Surfaced verbatim with the stage
    /// that produced it.
    DeviceFatal {
        stage: PipelineStage,
        code: u32,
    },

    /// The scan was aborted; outstanding tasks were discarded.
    Aborted,
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::ChunkFull { needed, available } => {
                write!(f, "chunk full: {} bytes needed, {} available", needed, available)
            }
            ScanError::OutOfRange { index, count } => {
                write!(f, "record index {} out of range (record count {})", index, count)
            }
            ScanError::FormatMisuse { operation, format } => {
                write!(f, "operation '{}' is not valid on a {} chunk", operation, format)
            }
            ScanError::DeviceResourceExhausted { requested, in_use, capacity } => {
                write!(
                    f,
                    "device memory exhausted: {} bytes requested, {}/{} in use",
                    requested, in_use, capacity
                )
            }
            ScanError::DeviceRecoverable { code } => {
                write!(f, "device reported recoverable condition (code {})", code)
            }
            ScanError::DeviceFatal { stage, code } => {
                write!(f, "device failure in {} stage (code {})", stage, code)
            }
            ScanError::Aborted => f.write_str("scan aborted"),
        }
    }
}

impl std::error::Error for ScanError {}

/// Type alias for Results using ScanError.
pub type Result<T> = std::result::Result<T, ScanError>;

// ============================================================================
// Recovery actions
// ============================================================================

/// Describes how the system should recover from a given error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Fatal error -- propagate to the caller, cannot continue.
    Fatal,
    /// Start a fresh chunk and retry the insert.
    NewChunk,
    /// Transient device pressure -- back off and resubmit the same work.
    RetryLater,
    /// Re-evaluate filter/projection on the host from the source chunk.
    FallbackToCpu,
    /// Silently discard -- not a real error (scan was aborted).
    Discard,
}

impl ScanError {
    /// Determine the appropriate recovery action for this error.
    pub fn recovery_action(&self) -> RecoveryAction {
        match self {
            ScanError::ChunkFull { .. } => RecoveryAction::NewChunk,
            ScanError::OutOfRange { .. } => RecoveryAction::Fatal,
            ScanError::FormatMisuse { .. } => RecoveryAction::Fatal,
            ScanError::DeviceResourceExhausted { .. } => RecoveryAction::RetryLater,
            ScanError::DeviceRecoverable { .. } => RecoveryAction::FallbackToCpu,
            ScanError::DeviceFatal { .. } => RecoveryAction::Fatal,
            ScanError::Aborted => RecoveryAction::Discard,
        }
    }

    /// Whether this error should be logged (vs silently handled).
    pub fn should_log(&self) -> bool {
        !matches!(self, ScanError::Aborted)
    }

    /// Whether this error is fatal (no recovery possible).
    pub fn is_fatal(&self) -> bool {
        matches!(self.recovery_action(), RecoveryAction::Fatal)
    }

    /// Whether the failed work should be retried after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self.recovery_action(), RecoveryAction::RetryLater)
    }
}

// ============================================================================
// Tests
// ============================================================================
