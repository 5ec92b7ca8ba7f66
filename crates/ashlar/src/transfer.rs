//! The transfer engine: records and synchronously executes all GPU copy
//! work through one reusable command buffer.
//!
//! Not safe for concurrent use — the engine reuses a single command buffer
//! and blocks the calling thread until the queue drains. Run one engine per
//! thread if concurrent transfers are needed; that composition is the
//! caller's responsibility.

use std::ptr;
use std::sync::Arc;

use tracing::trace;

use crate::buffer::{Buffer, StagingDirection};
use crate::device::{
    BufferCreateInfo, BufferUsage, CommandBufferHandle, CopyRegion, DeviceContext,
    MemoryResidency, QueueHandle,
};
use crate::fail::{ensure_or_die, fatal};

/// Largest payload the inline update command may embed in the command
/// stream, in bytes. Part of the stable contract: updates above this size
/// are forced through a staging buffer.
pub const INLINE_UPDATE_LIMIT: usize = 65_535;

/// Owns one reusable one-shot command buffer and a device queue; every
/// operation records, submits, and waits for completion before returning.
pub struct TransferEngine {
    device: Arc<dyn DeviceContext>,
    queue: QueueHandle,
    cmd: CommandBufferHandle,
}

impl TransferEngine {
    /// Acquire the reusable command buffer from the device.
    ///
    /// Fatal if the backend cannot allocate one.
    #[must_use]
    pub fn new(device: Arc<dyn DeviceContext>, queue: QueueHandle) -> Self {
        let cmd = match device.create_command_buffer() {
            Ok(cmd) => cmd,
            Err(e) => fatal!("allocating transfer command buffer: {e}"),
        };
        Self { device, queue, cmd }
    }

    /// Allocate a host-visible staging buffer of exactly `size` bytes, with
    /// transfer usage derived from `direction`.
    #[must_use]
    pub fn create_staging_buffer(
        &self,
        size: usize,
        direction: StagingDirection,
        name: &str,
    ) -> Buffer {
        let mut usage = BufferUsage::empty();
        if direction.allows_upload() {
            usage |= BufferUsage::TRANSFER_SRC;
        }
        if direction.allows_download() {
            usage |= BufferUsage::TRANSFER_DST;
        }
        Buffer::create(
            Arc::clone(&self.device),
            &BufferCreateInfo {
                size,
                usage,
                residency: MemoryResidency::HostCoherent,
                name,
            },
        )
    }

    /// Record and synchronously execute buffer-to-buffer copies over
    /// `regions`.
    pub fn copy_buffer_to_buffer(&self, dst: &Buffer, src: &Buffer, regions: &[CopyRegion]) {
        let src_handle = src.handle();
        let dst_handle = dst.handle();
        self.execute_commands(|device, cmd| {
            device.cmd_copy_buffer(cmd, src_handle, dst_handle, regions);
        });
    }

    /// Write `src` into `dst` at `dst_offset`, choosing a transfer strategy:
    ///
    /// 1. `staging` supplied — host-copy into the staging buffer at
    ///    `staging_offset` (mapping it on demand), then one device copy.
    ///    Best for repeated updates of the same destination.
    /// 2. No staging and `src.len() <= INLINE_UPDATE_LIMIT` — embed the
    ///    payload directly in the command stream, no staging allocation.
    /// 3. Otherwise — a temporary staging buffer sized to the payload,
    ///    destroyed when the call returns.
    ///
    /// `dst_offset`, `staging_offset`, and `src.len()` must be multiples of
    /// 4, and the write must fit both the destination and the staging
    /// window; violations are fatal. Blocks until the GPU work completes.
    pub fn update_buffer(
        &self,
        dst: &Buffer,
        dst_offset: usize,
        src: &[u8],
        staging: Option<&mut Buffer>,
        staging_offset: usize,
    ) {
        let size = src.len();
        ensure_or_die!(dst_offset % 4 == 0, "update offset {dst_offset} is not 4-byte aligned");
        ensure_or_die!(
            staging_offset % 4 == 0,
            "staging offset {staging_offset} is not 4-byte aligned"
        );
        ensure_or_die!(size % 4 == 0, "update size {size} is not 4-byte aligned");
        ensure_or_die!(
            dst_offset <= dst.size() && size <= dst.size() - dst_offset,
            "update of {size} bytes at offset {dst_offset} overruns buffer '{}' of {} bytes",
            dst.name(),
            dst.size()
        );

        if let Some(staging) = staging {
            ensure_or_die!(
                staging_offset <= staging.size() && size <= staging.size() - staging_offset,
                "update of {size} bytes at staging offset {staging_offset} overruns staging \
                 buffer '{}' of {} bytes",
                staging.name(),
                staging.size()
            );
            let base = match staging.data() {
                Some(ptr) => ptr,
                None => staging.map(),
            };
            // SAFETY: the staging window was bounds-checked above and the
            // mapping stays valid until unmap.
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr(), base.as_ptr().add(staging_offset), size);
            }
            trace!(size, dst = dst.name(), staging = staging.name(), "staged update");
            self.copy_buffer_to_buffer(
                dst,
                staging,
                &[CopyRegion { src_offset: staging_offset, dst_offset, size }],
            );
        } else if size <= INLINE_UPDATE_LIMIT {
            trace!(size, dst = dst.name(), "inline update");
            let dst_handle = dst.handle();
            self.execute_commands(|device, cmd| {
                device.cmd_update_buffer(cmd, dst_handle, dst_offset, src);
            });
        } else {
            trace!(size, dst = dst.name(), "one-shot staged update");
            let mut tmp = self.create_staging_buffer(size, StagingDirection::Upload, "tmp_staging_buffer");
            let base = tmp.map();
            // SAFETY: the temporary buffer is exactly `size` bytes.
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr(), base.as_ptr(), size);
            }
            self.copy_buffer_to_buffer(dst, &tmp, &[CopyRegion { src_offset: 0, dst_offset, size }]);
        }
    }

    /// Read `dst.len()` bytes from `src` at `src_offset` into `dst`.
    ///
    /// Mirror of [`update_buffer`](Self::update_buffer) in the download
    /// direction. There is no inline-read command, so without a supplied
    /// staging buffer a temporary download-capable one is always created.
    /// Same alignment and bounds contract; violations are fatal. Blocks
    /// until the GPU work completes.
    pub fn read_buffer(
        &self,
        src: &Buffer,
        src_offset: usize,
        dst: &mut [u8],
        staging: Option<&mut Buffer>,
        staging_offset: usize,
    ) {
        let size = dst.len();
        ensure_or_die!(src_offset % 4 == 0, "read offset {src_offset} is not 4-byte aligned");
        ensure_or_die!(
            staging_offset % 4 == 0,
            "staging offset {staging_offset} is not 4-byte aligned"
        );
        ensure_or_die!(size % 4 == 0, "read size {size} is not 4-byte aligned");
        ensure_or_die!(
            src_offset <= src.size() && size <= src.size() - src_offset,
            "read of {size} bytes at offset {src_offset} overruns buffer '{}' of {} bytes",
            src.name(),
            src.size()
        );

        if let Some(staging) = staging {
            ensure_or_die!(
                staging_offset <= staging.size() && size <= staging.size() - staging_offset,
                "read of {size} bytes at staging offset {staging_offset} overruns staging \
                 buffer '{}' of {} bytes",
                staging.name(),
                staging.size()
            );
            let base = match staging.data() {
                Some(ptr) => ptr,
                None => staging.map(),
            };
            trace!(size, src = src.name(), staging = staging.name(), "staged read");
            self.copy_buffer_to_buffer(
                staging,
                src,
                &[CopyRegion { src_offset, dst_offset: staging_offset, size }],
            );
            // SAFETY: the staging window was bounds-checked above and the
            // device copy has fully completed.
            unsafe {
                ptr::copy_nonoverlapping(
                    base.as_ptr().add(staging_offset) as *const u8,
                    dst.as_mut_ptr(),
                    size,
                );
            }
        } else {
            trace!(size, src = src.name(), "one-shot staged read");
            let mut tmp =
                self.create_staging_buffer(size, StagingDirection::Download, "tmp_staging_buffer");
            self.copy_buffer_to_buffer(&tmp, src, &[CopyRegion { src_offset, dst_offset: 0, size }]);
            let base = tmp.map();
            // SAFETY: the temporary buffer is exactly `size` bytes and the
            // device copy has fully completed.
            unsafe {
                ptr::copy_nonoverlapping(base.as_ptr() as *const u8, dst.as_mut_ptr(), size);
            }
        }
    }

    /// Whether updating `buffer` in full exceeds the inline-update ceiling,
    /// so callers can pre-attach a dedicated staging buffer instead of
    /// paying for a temporary allocation on every
    /// [`upload_once`](Buffer::upload_once).
    #[must_use]
    pub fn buffer_needs_staging_to_update(&self, buffer: &Buffer) -> bool {
        buffer.size() > INLINE_UPDATE_LIMIT
    }

    /// The sole synchronization point: reset the command buffer, record with
    /// a one-time-submit hint, submit, and block until the queue is idle.
    fn execute_commands<F>(&self, record: F)
    where
        F: FnOnce(&dyn DeviceContext, CommandBufferHandle),
    {
        let device = self.device.as_ref();
        if let Err(e) = device.reset_command_buffer(self.cmd) {
            fatal!("resetting transfer command buffer: {e}");
        }
        if let Err(e) = device.begin_commands(self.cmd) {
            fatal!("beginning transfer command recording: {e}");
        }
        record(device, self.cmd);
        if let Err(e) = device.end_commands(self.cmd) {
            fatal!("ending transfer command recording: {e}");
        }
        if let Err(e) = device.submit_and_wait(self.queue, self.cmd) {
            fatal!("submitting transfer commands: {e}");
        }
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.device.free_command_buffer(self.cmd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    fn setup() -> (Arc<MockDevice>, TransferEngine) {
        let device = Arc::new(MockDevice::new());
        let ctx: Arc<dyn DeviceContext> = device.clone();
        let engine = TransferEngine::new(ctx, device.queue());
        (device, engine)
    }

    fn device_local(device: &Arc<MockDevice>, size: usize) -> Buffer {
        let ctx: Arc<dyn DeviceContext> = device.clone();
        Buffer::create(
            ctx,
            &BufferCreateInfo {
                size,
                usage: BufferUsage::STORAGE
                    | BufferUsage::TRANSFER_SRC
                    | BufferUsage::TRANSFER_DST,
                residency: MemoryResidency::DeviceLocal,
                name: "dst",
            },
        )
    }

    #[test]
    fn staging_buffer_usage_follows_direction() {
        let (_, engine) = setup();
        let up = engine.create_staging_buffer(64, StagingDirection::Upload, "up");
        assert_eq!(up.usage(), BufferUsage::TRANSFER_SRC);
        let down = engine.create_staging_buffer(64, StagingDirection::Download, "down");
        assert_eq!(down.usage(), BufferUsage::TRANSFER_DST);
        let both = engine.create_staging_buffer(64, StagingDirection::Both, "both");
        assert_eq!(both.usage(), BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST);
    }

    #[test]
    fn needs_staging_exactly_above_inline_limit() {
        let (device, engine) = setup();
        let at_limit = device_local(&device, INLINE_UPDATE_LIMIT);
        assert!(!engine.buffer_needs_staging_to_update(&at_limit));
        let above = device_local(&device, INLINE_UPDATE_LIMIT + 1);
        assert!(engine.buffer_needs_staging_to_update(&above));
    }

    #[test]
    fn small_update_takes_inline_path() {
        let (device, engine) = setup();
        let dst = device_local(&device, 64);
        let created_before = device.buffers_created();
        engine.update_buffer(&dst, 0, &[9u8; 64], None, 0);
        assert_eq!(device.inline_updates_recorded(), 1);
        assert_eq!(device.copy_commands_recorded(), 0);
        assert_eq!(device.buffers_created(), created_before, "no staging allocation");
    }

    #[test]
    fn large_update_takes_one_shot_staging_path() {
        let (device, engine) = setup();
        let size = INLINE_UPDATE_LIMIT + 1; // 65536
        let dst = device_local(&device, size);
        let created_before = device.buffers_created();
        engine.update_buffer(&dst, 0, &vec![3u8; size], None, 0);
        assert_eq!(device.inline_updates_recorded(), 0);
        assert_eq!(device.copy_commands_recorded(), 1);
        assert_eq!(device.buffers_created(), created_before + 1, "one temporary staging buffer");
        // The temporary staging buffer is gone once the call returns.
        assert_eq!(device.live_buffers(), 1);
    }

    #[test]
    fn largest_aligned_inline_payload_stays_inline() {
        let (device, engine) = setup();
        let dst = device_local(&device, 65_532);
        engine.update_buffer(&dst, 0, &vec![1u8; 65_532], None, 0);
        assert_eq!(device.inline_updates_recorded(), 1);
        assert_eq!(device.copy_commands_recorded(), 0);
    }

    #[test]
    fn supplied_staging_is_mapped_on_demand() {
        let (device, engine) = setup();
        let dst = device_local(&device, 64);
        let mut staging = engine.create_staging_buffer(64, StagingDirection::Upload, "cold");
        assert!(!staging.is_mapped());
        engine.update_buffer(&dst, 0, &[5u8; 64], Some(&mut staging), 0);
        assert!(staging.is_mapped());
        assert_eq!(device.copy_commands_recorded(), 1);
    }

    #[test]
    fn update_writes_only_the_target_range() {
        let (device, engine) = setup();
        let dst = device_local(&device, 256);
        engine.update_buffer(&dst, 0, &[0xAAu8; 256], None, 0);
        engine.update_buffer(&dst, 64, &[0xBBu8; 32], None, 0);

        let bytes = device.buffer_bytes(dst.raw().unwrap());
        assert!(bytes[..64].iter().all(|&b| b == 0xAA));
        assert!(bytes[64..96].iter().all(|&b| b == 0xBB));
        assert!(bytes[96..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn multi_region_copy() {
        let (device, engine) = setup();
        let ctx: Arc<dyn DeviceContext> = device.clone();
        let mut src = Buffer::create(
            ctx,
            &BufferCreateInfo {
                size: 128,
                usage: BufferUsage::TRANSFER_SRC,
                residency: MemoryResidency::HostCoherent,
                name: "src",
            },
        );
        let base = src.map();
        // SAFETY: the buffer is 128 bytes and mapped.
        unsafe {
            for i in 0..128 {
                base.as_ptr().add(i).write(i as u8);
            }
        }
        let dst = device_local(&device, 128);
        engine.copy_buffer_to_buffer(
            &dst,
            &src,
            &[
                CopyRegion { src_offset: 0, dst_offset: 64, size: 64 },
                CopyRegion { src_offset: 64, dst_offset: 0, size: 64 },
            ],
        );
        let bytes = device.buffer_bytes(dst.raw().unwrap());
        assert_eq!(bytes[64], 0);
        assert_eq!(bytes[0], 64);
        assert_eq!(bytes[127], 63);
    }

    #[test]
    #[should_panic(expected = "not 4-byte aligned")]
    fn misaligned_offset_is_fatal() {
        let (device, engine) = setup();
        let dst = device_local(&device, 64);
        engine.update_buffer(&dst, 2, &[0u8; 4], None, 0);
    }

    #[test]
    #[should_panic(expected = "not 4-byte aligned")]
    fn misaligned_size_is_fatal() {
        let (device, engine) = setup();
        let dst = device_local(&device, 64);
        engine.update_buffer(&dst, 0, &[0u8; 3], None, 0);
    }

    #[test]
    #[should_panic(expected = "overruns buffer")]
    fn update_past_end_is_fatal() {
        let (device, engine) = setup();
        let dst = device_local(&device, 64);
        engine.update_buffer(&dst, 32, &[0u8; 64], None, 0);
    }

    #[test]
    #[should_panic(expected = "overruns buffer")]
    fn offset_beyond_buffer_is_fatal() {
        // Catches the unsigned-underflow shape of this check: a huge offset
        // must not wrap into an accepted range.
        let (device, engine) = setup();
        let dst = device_local(&device, 64);
        engine.update_buffer(&dst, 128, &[0u8; 4], None, 0);
    }

    #[test]
    #[should_panic(expected = "overruns staging buffer")]
    fn staging_window_overrun_is_fatal() {
        let (device, engine) = setup();
        let dst = device_local(&device, 64);
        let mut staging = engine.create_staging_buffer(32, StagingDirection::Upload, "small");
        engine.update_buffer(&dst, 0, &[0u8; 64], Some(&mut staging), 0);
    }

    #[test]
    #[should_panic(expected = "submitting transfer commands")]
    fn submission_failure_is_fatal() {
        let (device, engine) = setup();
        let dst = device_local(&device, 64);
        device.fail_next_submission();
        engine.update_buffer(&dst, 0, &[0u8; 64], None, 0);
    }

    #[test]
    fn engine_frees_its_command_buffer() {
        let (device, engine) = setup();
        assert_eq!(device.live_command_buffers(), 1);
        drop(engine);
        assert_eq!(device.live_command_buffers(), 0);
    }
}
