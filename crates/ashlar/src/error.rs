//! Error values crossing the [`DeviceContext`](crate::DeviceContext) boundary.
//!
//! These exist so device backends can report *why* a native call failed.
//! Inside this crate no error is recoverable: every `Err` reaching the core
//! is routed through the fatal diagnostic channel and terminates the
//! process.

use thiserror::Error;

/// Result type alias for device-boundary operations.
pub type Result<T> = std::result::Result<T, GpuError>;

/// Failure of a native graphics-API call, reported by a device backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Buffer or memory allocation failed.
    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    /// Mapping device memory into host address space failed.
    #[error("memory mapping failed: {0}")]
    Map(String),

    /// Command buffer allocation failed.
    #[error("command buffer allocation failed: {0}")]
    CommandBufferAllocation(String),

    /// Resetting, beginning, or ending command recording failed.
    #[error("command recording failed: {0}")]
    Recording(String),

    /// Queue submission or the wait for its completion failed.
    #[error("queue submission failed: {0}")]
    Submission(String),
}
