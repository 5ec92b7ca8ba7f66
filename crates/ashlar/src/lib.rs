//! `ashlar` — buffer memory and host↔device transfer for a thin GPU
//! resource layer.
//!
//! This crate owns device-memory buffer objects and moves bytes between host
//! and device memory, staging through an intermediate host-visible buffer
//! whenever the destination is not directly mappable:
//!
//! - **Buffer management** — [`Buffer`] owns one device allocation, an
//!   optional persistent host mapping, and an optional shared staging
//!   reference with an offset and direction capability
//! - **Transfer engine** — [`TransferEngine`] records and submits all GPU
//!   copy work through one reusable command buffer, choosing between a
//!   caller-supplied staging buffer, an inline command-embedded update, or a
//!   one-shot temporary staging buffer per call
//! - **Device seam** — [`DeviceContext`] is the boundary to the backing
//!   graphics API; [`testing::MockDevice`] is a byte-accurate in-memory
//!   implementation for GPU-free tests
//!
//! Every transfer call is synchronous: it returns only after the queue has
//! drained. Contract violations and native-API failures are both fatal — the
//! process logs a diagnostic and panics, with no recoverable error path.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use ashlar::testing::MockDevice;
//! use ashlar::{Buffer, BufferCreateInfo, BufferUsage, DeviceContext, MemoryResidency, TransferEngine};
//!
//! let device = Arc::new(MockDevice::new());
//! let ctx: Arc<dyn DeviceContext> = device.clone();
//! let engine = TransferEngine::new(ctx.clone(), device.queue());
//!
//! let mut buf = Buffer::create(ctx, &BufferCreateInfo {
//!     size: 64,
//!     usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
//!     residency: MemoryResidency::DeviceLocal,
//!     name: "example",
//! });
//!
//! let payload = [7u8; 64];
//! buf.upload_once(&engine, &payload);
//!
//! let mut readback = [0u8; 64];
//! buf.download_once(&engine, &mut readback);
//! assert_eq!(payload, readback);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod device;
pub mod error;
pub(crate) mod fail;
pub mod testing;
pub mod transfer;

pub use buffer::{Buffer, SharedBuffer, StagingDirection};
pub use device::{
    BufferCreateInfo, BufferHandle, BufferUsage, CommandBufferHandle, CopyRegion, DeviceContext,
    MemoryResidency, QueueHandle,
};
pub use error::{GpuError, Result};
pub use transfer::{TransferEngine, INLINE_UPDATE_LIMIT};
