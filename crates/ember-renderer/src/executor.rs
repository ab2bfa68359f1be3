//! GPU timeline worker
//!
//! Runs on the queue's thread. Command lists execute in the order they were
//! submitted; a signal completes its fence value only after everything
//! submitted before it has executed.

use crossbeam::channel::Receiver;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;

use crate::command::Command;
use crate::device::{ClearValue, GraphicsDevice};
use crate::queue::Fence;
use crate::resource::GpuResource;

pub(crate) enum QueueMessage {
    Execute(Vec<Command>),
    Signal(u64),
    Wait { fence: Arc<Fence>, value: u64 },
}

pub(crate) fn run(
    device: GraphicsDevice,
    fence: Arc<Fence>,
    receiver: Receiver<QueueMessage>,
    latency: Duration,
) {
    for message in receiver.iter() {
        match message {
            QueueMessage::Execute(commands) => {
                if !device.is_lost() {
                    if !latency.is_zero() {
                        std::thread::sleep(latency);
                    }
                    execute_list(&device, &commands);
                }
                device.recycle_command_list(commands);
            }
            QueueMessage::Signal(value) => fence.complete(value),
            QueueMessage::Wait { fence: other, value } => other.wait(value),
        }
    }
    tracing::trace!("GPU timeline drained");
}

fn execute_list(device: &GraphicsDevice, commands: &[Command]) {
    let mut targets: SmallVec<[&GpuResource; 9]> = SmallVec::new();

    for command in commands {
        match command {
            Command::Barriers(batch) => device.count_barriers(batch.len()),
            Command::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => device.apply_buffer_copy(dst, *dst_offset, src, *src_offset, *size),
            Command::CopyBufferToTexture { dst, src, size } => {
                device.apply_texture_upload(dst, src, *size)
            }
            Command::ClearRenderTarget { target, color } => {
                device.apply_clear(target, ClearValue::Color(*color))
            }
            Command::ClearDepth { target, depth } => {
                device.apply_clear(target, ClearValue::Depth(*depth))
            }
            Command::SetRenderTargets {
                targets: colors,
                depth,
            } => {
                targets.clear();
                targets.extend(colors.iter().map(|t| t.as_ref()));
                targets.extend(depth.as_deref());
            }
            Command::Draw { .. } | Command::DrawIndexed { .. } => device.count_draw(&targets),
            Command::SetViewport(_)
            | Command::SetRootSignature(_)
            | Command::SetPipelineState(_)
            | Command::SetConstantBuffer { .. }
            | Command::SetDescriptorTable { .. }
            | Command::SetVertexBuffer { .. }
            | Command::SetIndexBuffer { .. } => {}
        }
    }

    device.count_command_list(commands.len());
}
