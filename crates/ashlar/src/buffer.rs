//! Device-memory buffer objects with optional persistent mappings and
//! staging references.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::device::{BufferCreateInfo, BufferHandle, BufferUsage, DeviceContext, MemoryResidency};
use crate::fail::{ensure_or_die, fatal};
use crate::transfer::TransferEngine;

/// Transfer directions a staging buffer may serve.
///
/// Gates which staging-mediated operations are legal through an attached
/// staging reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagingDirection {
    /// No transfers permitted.
    None,
    /// Host-to-device transfers only.
    Upload,
    /// Device-to-host transfers only.
    Download,
    /// Transfers in both directions.
    Both,
}

impl StagingDirection {
    /// Whether host-to-device transfers are permitted.
    #[must_use]
    pub const fn allows_upload(self) -> bool {
        matches!(self, Self::Upload | Self::Both)
    }

    /// Whether device-to-host transfers are permitted.
    #[must_use]
    pub const fn allows_download(self) -> bool {
        matches!(self, Self::Download | Self::Both)
    }
}

/// Shared-ownership handle to a buffer, used for staging buffers that serve
/// several destinations. The buffer is destroyed when the last holder
/// releases it.
pub type SharedBuffer = Arc<Mutex<Buffer>>;

/// A staging association: shared ownership of a staging buffer plus the
/// offset range and direction capability this holder may use.
#[derive(Clone)]
pub(crate) struct StagingRef {
    pub(crate) buffer: SharedBuffer,
    pub(crate) offset: usize,
    pub(crate) direction: StagingDirection,
}

/// One device-memory allocation and its native handle.
///
/// Move-only: moving transfers exclusive ownership of the allocation;
/// dropping (or [`reset`](Buffer::reset)) releases it. An optional staging
/// reference lets [`upload`](Buffer::upload) and
/// [`download`](Buffer::download) reuse one host-visible buffer across many
/// transfers instead of allocating per call.
pub struct Buffer {
    device: Arc<dyn DeviceContext>,
    raw: Option<BufferHandle>,
    size: usize,
    usage: BufferUsage,
    residency: MemoryResidency,
    mapped: Option<NonNull<u8>>,
    staging: Option<StagingRef>,
    name: String,
}

// SAFETY: the mapped pointer is exclusively owned by this buffer and only
// dereferenced behind &mut self or by the transfer engine while it holds a
// reference; device handles are plain ids.
unsafe impl Send for Buffer {}

pub(crate) fn lock_shared(buffer: &SharedBuffer) -> MutexGuard<'_, Buffer> {
    match buffer.lock() {
        Ok(guard) => guard,
        Err(_) => fatal!("staging buffer lock poisoned"),
    }
}

impl Buffer {
    /// Allocate a buffer through the device context.
    ///
    /// Fatal if the allocator cannot satisfy the request.
    #[must_use]
    pub fn create(device: Arc<dyn DeviceContext>, info: &BufferCreateInfo<'_>) -> Self {
        let raw = match device.create_buffer(info) {
            Ok(handle) => handle,
            Err(e) => fatal!("allocating buffer '{}' ({} bytes): {e}", info.name, info.size),
        };
        device.set_debug_name(raw, info.name);
        debug!(
            name = info.name,
            size = info.size,
            usage = ?info.usage,
            residency = ?info.residency,
            "allocated buffer"
        );
        Self {
            device,
            raw: Some(raw),
            size: info.size,
            usage: info.usage,
            residency: info.residency,
            mapped: None,
            staging: None,
            name: info.name.to_string(),
        }
    }

    /// Byte length, fixed at creation.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Capability flags, fixed at creation.
    #[must_use]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Memory residency class, fixed at creation.
    #[must_use]
    pub fn residency(&self) -> MemoryResidency {
        self.residency
    }

    /// Diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The native handle, or `None` after [`reset`](Buffer::reset).
    #[must_use]
    pub fn raw(&self) -> Option<BufferHandle> {
        self.raw
    }

    /// Whether the buffer is currently mapped.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// The current host mapping, if any. No side effects.
    #[must_use]
    pub fn data(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    pub(crate) fn handle(&self) -> BufferHandle {
        match self.raw {
            Some(handle) => handle,
            None => fatal!("buffer '{}' used after reset", self.name),
        }
    }

    /// Map the buffer, returning a host pointer valid until
    /// [`unmap`](Buffer::unmap).
    ///
    /// Fatal if the buffer is not host-visible or is already mapped.
    pub fn map(&mut self) -> NonNull<u8> {
        ensure_or_die!(
            self.residency.is_host_visible(),
            "buffer '{}' is device-local and cannot be mapped",
            self.name
        );
        ensure_or_die!(self.mapped.is_none(), "buffer '{}' is already mapped", self.name);
        let ptr = match self.device.map_buffer(self.handle()) {
            Ok(ptr) => ptr,
            Err(e) => fatal!("mapping buffer '{}': {e}", self.name),
        };
        self.mapped = Some(ptr);
        ptr
    }

    /// Invalidate the host pointer returned by [`map`](Buffer::map).
    ///
    /// Fatal if the buffer is not currently mapped.
    pub fn unmap(&mut self) {
        ensure_or_die!(self.mapped.is_some(), "buffer '{}' is not mapped", self.name);
        self.device.unmap_buffer(self.handle());
        self.mapped = None;
    }

    /// Record a shared staging reference for subsequent [`upload`](Buffer::upload)
    /// / [`download`](Buffer::download) calls.
    ///
    /// `offset` is the byte position of this buffer's window inside the
    /// staging buffer. Fatal unless `offset + self.size <= staging.size`.
    pub fn attach_staging(
        &mut self,
        staging: SharedBuffer,
        offset: usize,
        direction: StagingDirection,
    ) {
        let staging_size = lock_shared(&staging).size;
        ensure_or_die!(
            offset <= staging_size && self.size <= staging_size - offset,
            "staging window [{offset}, {offset} + {}) exceeds staging buffer of {staging_size} bytes",
            self.size
        );
        self.staging = Some(StagingRef { buffer: staging, offset, direction });
    }

    /// Allocate a dedicated host-visible staging buffer of this buffer's
    /// size, map it, and attach it at offset 0.
    pub fn create_dedicated_staging(&mut self, engine: &TransferEngine, direction: StagingDirection) {
        let name = format!("{}.staging", self.name);
        let mut staging = engine.create_staging_buffer(self.size, direction, &name);
        staging.map();
        self.staging = Some(StagingRef {
            buffer: Arc::new(Mutex::new(staging)),
            offset: 0,
            direction,
        });
    }

    /// The attached staging buffer, if any.
    #[must_use]
    pub fn staging_buffer(&self) -> Option<SharedBuffer> {
        self.staging.as_ref().map(|s| Arc::clone(&s.buffer))
    }

    /// Upload `src` through the attached staging buffer.
    ///
    /// Fatal unless `src.len() == self.size` and a staging reference with
    /// upload capability is attached. Blocks until the GPU copy completes.
    pub fn upload(&mut self, engine: &TransferEngine, src: &[u8]) {
        ensure_or_die!(
            src.len() == self.size,
            "upload of {} bytes into buffer '{}' of {} bytes",
            src.len(),
            self.name,
            self.size
        );
        let Some(staging) = self.staging.clone() else {
            fatal!("buffer '{}' has no staging buffer attached for upload", self.name);
        };
        ensure_or_die!(
            staging.direction.allows_upload(),
            "staging buffer attached to '{}' does not permit uploads",
            self.name
        );
        let mut guard = lock_shared(&staging.buffer);
        engine.update_buffer(self, 0, src, Some(&mut guard), staging.offset);
    }

    /// Upload `src` without requiring an attached staging buffer; the engine
    /// picks the transfer strategy.
    ///
    /// Fatal unless `src.len() == self.size`. Blocks until the GPU work
    /// completes.
    pub fn upload_once(&mut self, engine: &TransferEngine, src: &[u8]) {
        ensure_or_die!(
            src.len() == self.size,
            "upload of {} bytes into buffer '{}' of {} bytes",
            src.len(),
            self.name,
            self.size
        );
        engine.update_buffer(self, 0, src, None, 0);
    }

    /// Download the buffer contents into `dst` through the attached staging
    /// buffer.
    ///
    /// Fatal unless `dst.len() == self.size` and a staging reference with
    /// download capability is attached. Blocks until the GPU copy completes.
    pub fn download(&self, engine: &TransferEngine, dst: &mut [u8]) {
        ensure_or_die!(
            dst.len() == self.size,
            "download of {} bytes from buffer '{}' of {} bytes",
            dst.len(),
            self.name,
            self.size
        );
        let Some(staging) = self.staging.clone() else {
            fatal!("buffer '{}' has no staging buffer attached for download", self.name);
        };
        ensure_or_die!(
            staging.direction.allows_download(),
            "staging buffer attached to '{}' does not permit downloads",
            self.name
        );
        let mut guard = lock_shared(&staging.buffer);
        engine.read_buffer(self, 0, dst, Some(&mut guard), staging.offset);
    }

    /// Download the buffer contents into `dst` with an engine-chosen
    /// temporary staging buffer.
    ///
    /// Fatal unless `dst.len() == self.size`. Blocks until the GPU work
    /// completes.
    pub fn download_once(&self, engine: &TransferEngine, dst: &mut [u8]) {
        ensure_or_die!(
            dst.len() == self.size,
            "download of {} bytes from buffer '{}' of {} bytes",
            dst.len(),
            self.name,
            self.size
        );
        engine.read_buffer(self, 0, dst, None, 0);
    }

    /// Idempotent teardown: unmap if mapped, destroy the allocation, clear
    /// the staging reference. Called by `Drop`.
    pub fn reset(&mut self) {
        self.staging = None;
        let Some(raw) = self.raw.take() else {
            return;
        };
        if self.mapped.take().is_some() {
            self.device.unmap_buffer(raw);
        }
        self.device.destroy_buffer(raw);
        debug!(name = %self.name, "destroyed buffer");
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    fn device() -> (Arc<MockDevice>, Arc<dyn DeviceContext>) {
        let device = Arc::new(MockDevice::new());
        let ctx: Arc<dyn DeviceContext> = device.clone();
        (device, ctx)
    }

    fn host_buffer(ctx: &Arc<dyn DeviceContext>, size: usize, name: &str) -> Buffer {
        Buffer::create(
            Arc::clone(ctx),
            &BufferCreateInfo {
                size,
                usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
                residency: MemoryResidency::HostCoherent,
                name,
            },
        )
    }

    #[test]
    fn direction_capabilities() {
        assert!(StagingDirection::Upload.allows_upload());
        assert!(!StagingDirection::Upload.allows_download());
        assert!(StagingDirection::Download.allows_download());
        assert!(!StagingDirection::Download.allows_upload());
        assert!(StagingDirection::Both.allows_upload());
        assert!(StagingDirection::Both.allows_download());
        assert!(!StagingDirection::None.allows_upload());
        assert!(!StagingDirection::None.allows_download());
    }

    #[test]
    fn create_records_metadata() {
        let (_, ctx) = device();
        let buf = host_buffer(&ctx, 128, "meta");
        assert_eq!(buf.size(), 128);
        assert_eq!(buf.name(), "meta");
        assert_eq!(buf.residency(), MemoryResidency::HostCoherent);
        assert!(buf.raw().is_some());
        assert!(!buf.is_mapped());
    }

    #[test]
    fn map_unmap_cycle() {
        let (_, ctx) = device();
        let mut buf = host_buffer(&ctx, 64, "mapped");
        let ptr = buf.map();
        assert!(buf.is_mapped());
        assert_eq!(buf.data(), Some(ptr));
        buf.unmap();
        assert!(!buf.is_mapped());
        assert!(buf.data().is_none());
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn double_map_is_fatal() {
        let (_, ctx) = device();
        let mut buf = host_buffer(&ctx, 64, "twice");
        buf.map();
        buf.map();
    }

    #[test]
    #[should_panic(expected = "is not mapped")]
    fn unmap_unmapped_is_fatal() {
        let (_, ctx) = device();
        let mut buf = host_buffer(&ctx, 64, "never-mapped");
        buf.unmap();
    }

    #[test]
    #[should_panic(expected = "cannot be mapped")]
    fn mapping_device_local_is_fatal() {
        let (_, ctx) = device();
        let mut buf = Buffer::create(
            ctx,
            &BufferCreateInfo {
                size: 64,
                usage: BufferUsage::STORAGE,
                residency: MemoryResidency::DeviceLocal,
                name: "vram-only",
            },
        );
        buf.map();
    }

    #[test]
    fn reset_is_idempotent() {
        let (device, ctx) = device();
        let mut buf = host_buffer(&ctx, 64, "reset-me");
        buf.map();
        buf.reset();
        assert!(buf.raw().is_none());
        assert!(!buf.is_mapped());
        buf.reset();
        drop(buf);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn move_transfers_ownership() {
        let (device, ctx) = device();
        let buf = host_buffer(&ctx, 64, "moved");
        let moved = buf;
        assert_eq!(device.live_buffers(), 1);
        drop(moved);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn attach_staging_within_bounds() {
        let (_, ctx) = device();
        let staging = Arc::new(Mutex::new(host_buffer(&ctx, 1024, "staging")));
        let mut dst = host_buffer(&ctx, 256, "dst");
        dst.attach_staging(Arc::clone(&staging), 768, StagingDirection::Both);
        assert!(dst.staging_buffer().is_some());
    }

    #[test]
    #[should_panic(expected = "exceeds staging buffer")]
    fn attach_staging_out_of_range_is_fatal() {
        let (_, ctx) = device();
        let staging = Arc::new(Mutex::new(host_buffer(&ctx, 1024, "staging")));
        let mut dst = host_buffer(&ctx, 256, "dst");
        dst.attach_staging(staging, 769, StagingDirection::Both);
    }

    #[test]
    fn shared_staging_outlives_first_holder() {
        let (device, ctx) = device();
        let staging = Arc::new(Mutex::new(host_buffer(&ctx, 512, "shared")));
        let mut a = host_buffer(&ctx, 256, "a");
        let mut b = host_buffer(&ctx, 256, "b");
        a.attach_staging(Arc::clone(&staging), 0, StagingDirection::Upload);
        b.attach_staging(Arc::clone(&staging), 256, StagingDirection::Upload);
        drop(staging);
        drop(a);
        // b still holds the staging buffer alive
        assert_eq!(device.live_buffers(), 2);
        drop(b);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    #[should_panic(expected = "allocating buffer")]
    fn allocation_failure_is_fatal() {
        let (device, ctx) = device();
        device.fail_next_allocation();
        let _ = host_buffer(&ctx, 64, "doomed");
    }
}
