//! GPU-free test support: a byte-accurate in-memory device.
//!
//! [`MockDevice`] implements [`DeviceContext`] over plain host memory.
//! Command recording is replayed synchronously at submit time, so the
//! observable transfer semantics match a real backend: nothing lands in a
//! destination buffer until the submission "completes". Instrumentation
//! counters expose which transfer strategy the engine chose, and one-shot
//! fault injection arms allocation or submission failures for fatal-path
//! tests.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::device::{
    BufferCreateInfo, BufferHandle, CommandBufferHandle, CopyRegion, DeviceContext, QueueHandle,
};
use crate::error::{GpuError, Result};
use crate::transfer::INLINE_UPDATE_LIMIT;

struct MockBuffer {
    bytes: Box<[u8]>,
    host_visible: bool,
    mapped: bool,
    name: String,
}

enum RecordedCommand {
    Copy {
        src: BufferHandle,
        dst: BufferHandle,
        regions: Vec<CopyRegion>,
    },
    Update {
        dst: BufferHandle,
        dst_offset: usize,
        data: Vec<u8>,
    },
}

#[derive(Default)]
struct CommandState {
    recording: bool,
    commands: Vec<RecordedCommand>,
}

/// In-memory [`DeviceContext`] implementation for tests and demos.
#[derive(Default)]
pub struct MockDevice {
    buffers: Mutex<HashMap<u64, MockBuffer>>,
    command_buffers: Mutex<HashMap<u64, CommandState>>,
    next_buffer: AtomicU64,
    next_command_buffer: AtomicU64,
    buffers_created: AtomicUsize,
    inline_updates: AtomicUsize,
    copy_commands: AtomicUsize,
    submissions: AtomicUsize,
    fail_allocation: AtomicBool,
    fail_submission: AtomicBool,
}

impl MockDevice {
    /// Create an empty device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The device's sole submission queue.
    #[must_use]
    pub fn queue(&self) -> QueueHandle {
        QueueHandle(0)
    }

    /// Arm a one-shot failure for the next buffer allocation.
    pub fn fail_next_allocation(&self) {
        self.fail_allocation.store(true, Ordering::SeqCst);
    }

    /// Arm a one-shot failure for the next queue submission.
    pub fn fail_next_submission(&self) {
        self.fail_submission.store(true, Ordering::SeqCst);
    }

    /// Total buffers ever created, including temporary staging buffers.
    #[must_use]
    pub fn buffers_created(&self) -> usize {
        self.buffers_created.load(Ordering::SeqCst)
    }

    /// Buffers currently alive (created minus destroyed).
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().expect("mock device poisoned").len()
    }

    /// Command buffers currently alive.
    #[must_use]
    pub fn live_command_buffers(&self) -> usize {
        self.command_buffers.lock().expect("mock device poisoned").len()
    }

    /// Inline (command-embedded) updates recorded so far.
    #[must_use]
    pub fn inline_updates_recorded(&self) -> usize {
        self.inline_updates.load(Ordering::SeqCst)
    }

    /// Buffer-to-buffer copy commands recorded so far.
    #[must_use]
    pub fn copy_commands_recorded(&self) -> usize {
        self.copy_commands.load(Ordering::SeqCst)
    }

    /// Completed queue submissions.
    #[must_use]
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Snapshot of a live buffer's contents.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live buffer.
    #[must_use]
    pub fn buffer_bytes(&self, buffer: BufferHandle) -> Vec<u8> {
        let buffers = self.buffers.lock().expect("mock device poisoned");
        buffers
            .get(&buffer.0)
            .unwrap_or_else(|| panic!("{buffer} is not alive"))
            .bytes
            .to_vec()
    }

    /// Diagnostic name of a live buffer.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live buffer.
    #[must_use]
    pub fn buffer_name(&self, buffer: BufferHandle) -> String {
        let buffers = self.buffers.lock().expect("mock device poisoned");
        buffers
            .get(&buffer.0)
            .unwrap_or_else(|| panic!("{buffer} is not alive"))
            .name
            .clone()
    }

    fn replay(&self, commands: Vec<RecordedCommand>) {
        let mut buffers = self.buffers.lock().expect("mock device poisoned");
        for command in commands {
            match command {
                RecordedCommand::Copy { src, dst, regions } => {
                    for region in regions {
                        let src_buf = buffers
                            .get(&src.0)
                            .unwrap_or_else(|| panic!("copy source {src} is not alive"));
                        assert!(
                            region.src_offset + region.size <= src_buf.bytes.len(),
                            "copy region reads past the end of {src}"
                        );
                        let chunk =
                            src_buf.bytes[region.src_offset..region.src_offset + region.size]
                                .to_vec();
                        let dst_buf = buffers
                            .get_mut(&dst.0)
                            .unwrap_or_else(|| panic!("copy destination {dst} is not alive"));
                        assert!(
                            region.dst_offset + region.size <= dst_buf.bytes.len(),
                            "copy region writes past the end of {dst}"
                        );
                        dst_buf.bytes[region.dst_offset..region.dst_offset + region.size]
                            .copy_from_slice(&chunk);
                    }
                }
                RecordedCommand::Update { dst, dst_offset, data } => {
                    let dst_buf = buffers
                        .get_mut(&dst.0)
                        .unwrap_or_else(|| panic!("update destination {dst} is not alive"));
                    assert!(
                        dst_offset + data.len() <= dst_buf.bytes.len(),
                        "inline update writes past the end of {dst}"
                    );
                    dst_buf.bytes[dst_offset..dst_offset + data.len()].copy_from_slice(&data);
                }
            }
        }
    }
}

impl DeviceContext for MockDevice {
    fn create_buffer(&self, info: &BufferCreateInfo<'_>) -> Result<BufferHandle> {
        if self.fail_allocation.swap(false, Ordering::SeqCst) {
            return Err(GpuError::Allocation("injected allocation failure".to_string()));
        }
        let id = self.next_buffer.fetch_add(1, Ordering::SeqCst);
        let buffer = MockBuffer {
            bytes: vec![0u8; info.size].into_boxed_slice(),
            host_visible: info.residency.is_host_visible(),
            mapped: false,
            name: info.name.to_string(),
        };
        self.buffers.lock().expect("mock device poisoned").insert(id, buffer);
        self.buffers_created.fetch_add(1, Ordering::SeqCst);
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let removed = self.buffers.lock().expect("mock device poisoned").remove(&buffer.0);
        assert!(removed.is_some(), "double destroy of {buffer}");
    }

    fn map_buffer(&self, buffer: BufferHandle) -> Result<NonNull<u8>> {
        let mut buffers = self.buffers.lock().expect("mock device poisoned");
        let buf = buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| GpuError::Map(format!("{buffer} is not alive")))?;
        if !buf.host_visible {
            return Err(GpuError::Map(format!("{buffer} is not host-visible")));
        }
        if buf.mapped {
            return Err(GpuError::Map(format!("{buffer} is already mapped")));
        }
        buf.mapped = true;
        // The boxed slice never reallocates, so the pointer stays stable
        // until the buffer is destroyed.
        NonNull::new(buf.bytes.as_mut_ptr())
            .ok_or_else(|| GpuError::Map(format!("{buffer} has a null backing pointer")))
    }

    fn unmap_buffer(&self, buffer: BufferHandle) {
        let mut buffers = self.buffers.lock().expect("mock device poisoned");
        let buf = buffers
            .get_mut(&buffer.0)
            .unwrap_or_else(|| panic!("unmap of dead {buffer}"));
        assert!(buf.mapped, "unmap of unmapped {buffer}");
        buf.mapped = false;
    }

    fn set_debug_name(&self, buffer: BufferHandle, name: &str) {
        if let Some(buf) = self.buffers.lock().expect("mock device poisoned").get_mut(&buffer.0) {
            buf.name = name.to_string();
        }
    }

    fn create_command_buffer(&self) -> Result<CommandBufferHandle> {
        let id = self.next_command_buffer.fetch_add(1, Ordering::SeqCst);
        self.command_buffers
            .lock()
            .expect("mock device poisoned")
            .insert(id, CommandState::default());
        Ok(CommandBufferHandle(id))
    }

    fn free_command_buffer(&self, cmd: CommandBufferHandle) {
        let removed =
            self.command_buffers.lock().expect("mock device poisoned").remove(&cmd.0);
        assert!(removed.is_some(), "double free of command buffer #{}", cmd.0);
    }

    fn reset_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        let mut commands = self.command_buffers.lock().expect("mock device poisoned");
        let state = commands
            .get_mut(&cmd.0)
            .ok_or_else(|| GpuError::Recording(format!("command buffer #{} is not alive", cmd.0)))?;
        state.recording = false;
        state.commands.clear();
        Ok(())
    }

    fn begin_commands(&self, cmd: CommandBufferHandle) -> Result<()> {
        let mut commands = self.command_buffers.lock().expect("mock device poisoned");
        let state = commands
            .get_mut(&cmd.0)
            .ok_or_else(|| GpuError::Recording(format!("command buffer #{} is not alive", cmd.0)))?;
        if state.recording {
            return Err(GpuError::Recording(format!(
                "command buffer #{} is already recording",
                cmd.0
            )));
        }
        state.recording = true;
        Ok(())
    }

    fn end_commands(&self, cmd: CommandBufferHandle) -> Result<()> {
        let mut commands = self.command_buffers.lock().expect("mock device poisoned");
        let state = commands
            .get_mut(&cmd.0)
            .ok_or_else(|| GpuError::Recording(format!("command buffer #{} is not alive", cmd.0)))?;
        if !state.recording {
            return Err(GpuError::Recording(format!(
                "command buffer #{} is not recording",
                cmd.0
            )));
        }
        state.recording = false;
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[CopyRegion],
    ) {
        let mut commands = self.command_buffers.lock().expect("mock device poisoned");
        let state = commands
            .get_mut(&cmd.0)
            .unwrap_or_else(|| panic!("recording into dead command buffer #{}", cmd.0));
        assert!(state.recording, "copy recorded outside begin/end");
        state.commands.push(RecordedCommand::Copy {
            src,
            dst,
            regions: regions.to_vec(),
        });
        self.copy_commands.fetch_add(1, Ordering::SeqCst);
    }

    fn cmd_update_buffer(
        &self,
        cmd: CommandBufferHandle,
        dst: BufferHandle,
        dst_offset: usize,
        data: &[u8],
    ) {
        assert!(
            data.len() <= INLINE_UPDATE_LIMIT,
            "inline update of {} bytes exceeds the embedding limit",
            data.len()
        );
        let mut commands = self.command_buffers.lock().expect("mock device poisoned");
        let state = commands
            .get_mut(&cmd.0)
            .unwrap_or_else(|| panic!("recording into dead command buffer #{}", cmd.0));
        assert!(state.recording, "update recorded outside begin/end");
        state.commands.push(RecordedCommand::Update {
            dst,
            dst_offset,
            data: data.to_vec(),
        });
        self.inline_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn submit_and_wait(&self, _queue: QueueHandle, cmd: CommandBufferHandle) -> Result<()> {
        if self.fail_submission.swap(false, Ordering::SeqCst) {
            return Err(GpuError::Submission("injected submission failure".to_string()));
        }
        let commands = {
            let mut command_buffers =
                self.command_buffers.lock().expect("mock device poisoned");
            let state = command_buffers.get_mut(&cmd.0).ok_or_else(|| {
                GpuError::Submission(format!("command buffer #{} is not alive", cmd.0))
            })?;
            if state.recording {
                return Err(GpuError::Submission(format!(
                    "command buffer #{} submitted while recording",
                    cmd.0
                )));
            }
            std::mem::take(&mut state.commands)
        };
        self.replay(commands);
        self.submissions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
