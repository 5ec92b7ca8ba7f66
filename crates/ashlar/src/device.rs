//! The external device seam: everything this crate asks of the backing
//! graphics API.
//!
//! Device, instance, and queue creation live outside this crate. A backend
//! implements [`DeviceContext`] over its native handles; the core only ever
//! talks to that trait. Handles are opaque `u64` newtypes so the seam stays
//! object-safe and backend-neutral.

use std::fmt;
use std::ptr::NonNull;

use crate::error::Result;

bitflags::bitflags! {
    /// Capability flags describing the legal GPU operations on a buffer.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Shader storage buffer.
        const STORAGE = 1 << 0;
        /// Shader uniform buffer.
        const UNIFORM = 1 << 1;
        /// Source of a transfer command.
        const TRANSFER_SRC = 1 << 2;
        /// Destination of a transfer command.
        const TRANSFER_DST = 1 << 3;
    }
}

/// Where a buffer's backing memory lives, and whether the host can map it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryResidency {
    /// Device-local memory; not mappable, reachable only via copy commands.
    DeviceLocal,
    /// Host-visible memory; mappable, flushes may be required by the backend.
    HostVisible,
    /// Host-visible and coherent memory; mappable, no explicit flushes.
    HostCoherent,
}

impl MemoryResidency {
    /// Whether direct mapping into host address space is legal.
    #[must_use]
    pub const fn is_host_visible(self) -> bool {
        matches!(self, Self::HostVisible | Self::HostCoherent)
    }
}

/// Parameters for allocating a buffer through [`DeviceContext::create_buffer`].
#[derive(Debug, Clone)]
pub struct BufferCreateInfo<'a> {
    /// Byte length, fixed for the lifetime of the buffer.
    pub size: usize,
    /// Legal GPU operations.
    pub usage: BufferUsage,
    /// Memory residency class.
    pub residency: MemoryResidency,
    /// Diagnostic name, passed through to the backend's naming facility.
    pub name: &'a str,
}

/// One region of a buffer-to-buffer copy command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    /// Byte offset into the source buffer.
    pub src_offset: usize,
    /// Byte offset into the destination buffer.
    pub dst_offset: usize,
    /// Number of bytes to copy.
    pub size: usize,
}

/// Opaque backend handle for a buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Opaque backend handle for a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle(pub u64);

/// Opaque backend handle for a submission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u64);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// The allocator / command / queue provider behind this crate.
///
/// Implementations must be internally synchronized (`Send + Sync`); the
/// transfer engine itself is documented as single-threaded, but buffers may
/// be created and destroyed from any thread.
pub trait DeviceContext: Send + Sync {
    /// Allocate a buffer and bind its device memory.
    fn create_buffer(&self, info: &BufferCreateInfo<'_>) -> Result<BufferHandle>;

    /// Destroy a buffer and release its memory. The handle must not be used
    /// afterwards.
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Map a host-visible buffer, returning a pointer valid until
    /// [`unmap_buffer`](Self::unmap_buffer).
    fn map_buffer(&self, buffer: BufferHandle) -> Result<NonNull<u8>>;

    /// Unmap a previously mapped buffer.
    fn unmap_buffer(&self, buffer: BufferHandle);

    /// Tag a buffer with a diagnostic name. Carries no semantics.
    fn set_debug_name(&self, buffer: BufferHandle, name: &str);

    /// Allocate a command buffer from the backend's pool.
    fn create_command_buffer(&self) -> Result<CommandBufferHandle>;

    /// Return a command buffer to the backend's pool.
    fn free_command_buffer(&self, cmd: CommandBufferHandle);

    /// Reset a command buffer for re-recording.
    fn reset_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()>;

    /// Begin recording with a one-time-submit hint.
    fn begin_commands(&self, cmd: CommandBufferHandle) -> Result<()>;

    /// End recording.
    fn end_commands(&self, cmd: CommandBufferHandle) -> Result<()>;

    /// Record a buffer-to-buffer copy over the given regions.
    fn cmd_copy_buffer(
        &self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[CopyRegion],
    );

    /// Record an inline update that embeds `data` in the command stream.
    ///
    /// Callers never pass more than
    /// [`INLINE_UPDATE_LIMIT`](crate::INLINE_UPDATE_LIMIT) bytes, and
    /// `dst_offset` and `data.len()` are always multiples of 4.
    fn cmd_update_buffer(
        &self,
        cmd: CommandBufferHandle,
        dst: BufferHandle,
        dst_offset: usize,
        data: &[u8],
    );

    /// Submit a recorded command buffer and block until the queue is idle.
    fn submit_and_wait(&self, queue: QueueHandle, cmd: CommandBufferHandle) -> Result<()>;
}
