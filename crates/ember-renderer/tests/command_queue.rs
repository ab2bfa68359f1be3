//! Command context and queue scenarios

use ember_core::DeviceConfig;
use ember_renderer::{
    CommandContext, CommandQueue, ContextState, GpuBuffer, GraphicsDevice, QueueKind, ResourceState,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn device() -> GraphicsDevice {
    GraphicsDevice::new(DeviceConfig::default()).expect("device")
}

#[test]
fn test_closed_context_rejects_recording() {
    let device = device();
    let dst = GpuBuffer::create(&device, "dst", 4, 16).unwrap();
    let src = GpuBuffer::create(&device, "src", 4, 16).unwrap();

    let mut ctx = CommandContext::new(&device, "closed");
    ctx.copy_buffer(&dst, &src).unwrap();
    ctx.close().unwrap();
    let recorded = ctx.command_count();

    assert!(ctx.copy_buffer(&dst, &src).unwrap_err().is_contract_violation());
    assert!(ctx
        .transition_resource(&dst, ResourceState::GenericRead)
        .unwrap_err()
        .is_contract_violation());
    assert!(ctx.draw(3, 0).unwrap_err().is_contract_violation());
    assert_eq!(ctx.command_count(), recorded);
}

#[test]
fn test_wait_for_gpu_observes_signaled_value() {
    let device = GraphicsDevice::new(DeviceConfig {
        simulated_gpu_latency_us: 2_000,
        ..DeviceConfig::default()
    })
    .unwrap();
    let mut queue = CommandQueue::new(&device, QueueKind::Direct).unwrap();

    for i in 0..3 {
        let dst = GpuBuffer::create(&device, "dst", 4, 4).unwrap();
        let src = GpuBuffer::create(&device, "src", 4, 4).unwrap();
        let mut ctx = CommandContext::new(&device, &format!("copy{}", i));
        ctx.copy_buffer(&dst, &src).unwrap();
        ctx.close().unwrap();
        queue.execute(&mut ctx).unwrap();
    }

    let signaled = queue.signal().unwrap();
    queue.wait_for_gpu().unwrap();
    assert!(queue.completed_fence_value() >= signaled);
    assert!(queue.is_fence_complete(signaled));
}

#[test]
fn test_redundant_transitions_emit_no_barrier() {
    let device = device();
    let buffer = GpuBuffer::create(&device, "buffer", 16, 4).unwrap();
    let mut ctx = CommandContext::new(&device, "transitions");

    ctx.transition_resource(&buffer, ResourceState::CopyDest).unwrap();
    assert_eq!(ctx.barrier_count(), 1);
    ctx.transition_resource(&buffer, ResourceState::CopyDest).unwrap();
    assert_eq!(ctx.barrier_count(), 1);
    ctx.transition_resource(&buffer, ResourceState::GenericRead).unwrap();
    assert_eq!(ctx.barrier_count(), 2);
}

#[test]
fn test_submitted_context_resets_after_fence() {
    let device = device();
    let mut queue = CommandQueue::new(&device, QueueKind::Direct).unwrap();
    let mut ctx = CommandContext::new(&device, "reuse");
    ctx.close().unwrap();
    queue.execute(&mut ctx).unwrap();
    assert!(ctx.state().is_submitted());

    queue.wait_for_idle().unwrap();
    ctx.reset().unwrap();
    assert!(matches!(ctx.state(), ContextState::Recording));
}

#[test]
fn test_copy_queue_feeds_direct_queue() {
    let device = GraphicsDevice::new(DeviceConfig {
        simulated_gpu_latency_us: 1_000,
        ..DeviceConfig::default()
    })
    .unwrap();
    let mut copy = CommandQueue::new(&device, QueueKind::Copy).unwrap();
    let mut direct = CommandQueue::new(&device, QueueKind::Direct).unwrap();

    let src = GpuBuffer::create(&device, "src", 1, 8).unwrap();
    src.copy(&[7; 8]).unwrap();
    let staged = GpuBuffer::create(&device, "staged", 1, 8).unwrap();
    let dst = GpuBuffer::create(&device, "dst", 1, 8).unwrap();

    let mut upload = CommandContext::new(&device, "upload");
    upload.copy_buffer(&staged, &src).unwrap();
    upload.close().unwrap();
    copy.execute(&mut upload).unwrap();
    let uploaded = copy.signal().unwrap();

    direct.gpu_wait(copy.fence(), uploaded).unwrap();
    let mut consume = CommandContext::new(&device, "consume");
    consume.copy_buffer(&dst, &staged).unwrap();
    consume.close().unwrap();
    direct.execute(&mut consume).unwrap();
    direct.wait_for_idle().unwrap();

    assert_eq!(dst.read_back(), vec![7; 8]);
}

#[test]
fn test_device_removal_wakes_waiters() {
    let device = GraphicsDevice::new(DeviceConfig {
        simulated_gpu_latency_us: 50_000,
        ..DeviceConfig::default()
    })
    .unwrap();
    let mut queue = CommandQueue::new(&device, QueueKind::Direct).unwrap();
    let mut ctx = CommandContext::new(&device, "slow");
    ctx.close().unwrap();
    queue.execute(&mut ctx).unwrap();
    let value = queue.signal().unwrap();

    device.mark_removed("driver reset");
    assert!(queue.fence().wait_timeout(value, Duration::from_secs(5)));
    let err = queue.wait_for_fence(value).unwrap_err();
    assert!(err.is_fatal());
    assert!(queue.signal().is_err());
}
