//! Walk the three transfer strategies over the in-memory reference device.
//!
//! Run with `RUST_LOG=trace cargo run --example staged_upload` to watch the
//! engine pick a path per call.

use std::sync::Arc;

use ashlar::testing::MockDevice;
use ashlar::{
    Buffer, BufferCreateInfo, BufferUsage, DeviceContext, MemoryResidency, StagingDirection,
    TransferEngine, INLINE_UPDATE_LIMIT,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    let device = Arc::new(MockDevice::new());
    let ctx: Arc<dyn DeviceContext> = device.clone();
    let engine = TransferEngine::new(ctx.clone(), device.queue());

    // Small one-off payload: embedded directly in the command stream.
    let mut small = Buffer::create(
        ctx.clone(),
        &BufferCreateInfo {
            size: 256,
            usage: BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST,
            residency: MemoryResidency::DeviceLocal,
            name: "per_frame_constants",
        },
    );
    small.upload_once(&engine, &[0x40; 256]);

    // Large one-off payload: one temporary staging buffer.
    let large_size = INLINE_UPDATE_LIMIT + 1;
    let mut large = Buffer::create(
        ctx.clone(),
        &BufferCreateInfo {
            size: large_size,
            usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            residency: MemoryResidency::DeviceLocal,
            name: "mesh_data",
        },
    );
    large.upload_once(&engine, &vec![0x7F; large_size]);

    // Repeatedly updated buffer: one dedicated staging buffer, reused.
    let mut streamed = Buffer::create(
        ctx,
        &BufferCreateInfo {
            size: 4096,
            usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            residency: MemoryResidency::DeviceLocal,
            name: "particle_state",
        },
    );
    streamed.create_dedicated_staging(&engine, StagingDirection::Both);
    for frame in 0..3u8 {
        streamed.upload(&engine, &vec![frame; 4096]);
    }

    let mut readback = vec![0u8; 4096];
    streamed.download(&engine, &mut readback);
    assert!(readback.iter().all(|&b| b == 2));

    println!(
        "created {} buffers, {} inline updates, {} copy commands, {} submissions",
        device.buffers_created(),
        device.inline_updates_recorded(),
        device.copy_commands_recorded(),
        device.submissions(),
    );
}
