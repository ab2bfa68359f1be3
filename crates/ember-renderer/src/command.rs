//! Command recording
//!
//! A [`CommandContext`] records into a command list taken from the device
//! pool. Its lifecycle is an explicit state machine:
//!
//! ```text
//! Recording --close--> Closed --execute--> Submitted(fence, value)
//!     ^                                          |
//!     +------------- reset (fence done) ---------+
//! ```
//!
//! Every command keeps the resources it touches alive (`Arc`) until the
//! GPU timeline has executed the list and returned it to the pool.

use ember_core::{ember_trace, EmberError, ErrorContext, LogCategory, Result};
use smallvec::SmallVec;
use std::sync::Arc;
use wgpu::{IndexFormat, TextureFormat};

use crate::buffer::{GpuBuffer, IndexBuffer, VertexBuffer, CONSTANT_BUFFER_ALIGNMENT};
use crate::descriptor::{Descriptor, DescriptorHeapKind};
use crate::device::GraphicsDevice;
use crate::pipeline::{
    DescriptorRangeKind, PipelineState, RootParameter, RootSignature, MAX_RENDER_TARGETS,
};
use crate::queue::Fence;
use crate::resource::{AsResource, GpuResource, ResourceDimension, ResourceState, ShaderResource};
use crate::texture::{ColorBuffer, DepthBuffer};

/// Lifecycle of a command context
#[derive(Debug, Clone)]
pub enum ContextState {
    Recording,
    Closed,
    /// Submitted to a queue; may be reset once `fence` reaches `value`
    Submitted { fence: Arc<Fence>, value: u64 },
}

impl ContextState {
    pub fn is_recording(&self) -> bool {
        matches!(self, ContextState::Recording)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ContextState::Closed)
    }

    pub fn is_submitted(&self) -> bool {
        matches!(self, ContextState::Submitted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ResourceBarrier {
    pub resource: Arc<GpuResource>,
    pub before: ResourceState,
    pub after: ResourceState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One recorded GPU command
#[derive(Debug, Clone)]
pub enum Command {
    Barriers(SmallVec<[ResourceBarrier; 4]>),
    CopyBuffer {
        dst: Arc<GpuResource>,
        dst_offset: u64,
        src: Arc<GpuResource>,
        src_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        dst: Arc<GpuResource>,
        src: Arc<GpuResource>,
        size: u64,
    },
    ClearRenderTarget {
        target: Arc<GpuResource>,
        color: [f32; 4],
    },
    ClearDepth {
        target: Arc<GpuResource>,
        depth: f32,
    },
    SetRenderTargets {
        targets: SmallVec<[Arc<GpuResource>; MAX_RENDER_TARGETS]>,
        depth: Option<Arc<GpuResource>>,
    },
    SetViewport(Viewport),
    SetRootSignature(Arc<RootSignature>),
    SetPipelineState(Arc<PipelineState>),
    SetConstantBuffer {
        root_index: u32,
        buffer: Arc<GpuResource>,
        offset: u64,
    },
    SetDescriptorTable {
        root_index: u32,
        descriptors: SmallVec<[Descriptor; 8]>,
        resources: Vec<Arc<GpuResource>>,
    },
    SetVertexBuffer {
        buffer: Arc<GpuResource>,
        stride: u32,
    },
    SetIndexBuffer {
        buffer: Arc<GpuResource>,
        format: IndexFormat,
    },
    Draw {
        vertex_count: u32,
        start_vertex: u32,
    },
    DrawIndexed {
        index_count: u32,
        start_index: u32,
        base_vertex: i32,
    },
}

#[derive(Debug, Default)]
struct BoundTargets {
    formats: SmallVec<[TextureFormat; MAX_RENDER_TARGETS]>,
    depth: Option<(TextureFormat, Arc<GpuResource>)>,
}

/// Records commands for one queue submission
#[derive(Debug)]
pub struct CommandContext {
    device: GraphicsDevice,
    name: String,
    state: ContextState,
    commands: Vec<Command>,
    pending_barriers: SmallVec<[ResourceBarrier; 4]>,
    /// State each transitioned resource had before this recording touched it
    original_states: Vec<(Arc<GpuResource>, ResourceState)>,
    root_signature: Option<Arc<RootSignature>>,
    pipeline: Option<Arc<PipelineState>>,
    targets: BoundTargets,
    index_buffer_bound: bool,
    barrier_count: usize,
    draw_count: usize,
}

impl CommandContext {
    pub fn new(device: &GraphicsDevice, name: &str) -> Self {
        Self {
            device: device.clone(),
            name: name.to_string(),
            state: ContextState::Recording,
            commands: device.acquire_command_list(),
            pending_barriers: SmallVec::new(),
            original_states: Vec::new(),
            root_signature: None,
            pipeline: None,
            targets: BoundTargets::default(),
            index_buffer_bound: false,
            barrier_count: 0,
            draw_count: 0,
        }
    }

    pub fn device(&self) -> &GraphicsDevice {
        &self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &ContextState {
        &self.state
    }

    /// Fail unless the context accepts commands
    pub fn ensure_recording(&self) -> Result<()> {
        if self.state.is_recording() {
            return Ok(());
        }
        Err(EmberError::contract(format!(
            "Command context '{}' is not recording ({})",
            self.name,
            self.state_name()
        ))
        .with_context(
            ErrorContext::new("record", "CommandContext").with_metadata("context", &self.name),
        ))
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            ContextState::Recording => "recording",
            ContextState::Closed => "closed",
            ContextState::Submitted { .. } => "submitted",
        }
    }

    fn push(&mut self, command: Command) {
        self.flush_resource_barriers();
        self.commands.push(command);
    }

    /// Queue a transition of `resource` to `state`. A transition to the state
    /// the resource is already in records nothing.
    pub fn transition_resource<R: AsResource + ?Sized>(
        &mut self,
        resource: &R,
        state: ResourceState,
    ) -> Result<()> {
        self.ensure_recording()?;
        let resource = resource.gpu_resource();
        let before = resource.swap_state(state);
        if before == state {
            return Ok(());
        }
        if !self
            .original_states
            .iter()
            .any(|(tracked, _)| Arc::ptr_eq(tracked, resource))
        {
            self.original_states.push((resource.clone(), before));
        }

        ember_trace!(
            LogCategory::Command,
            "'{}': {:?} -> {:?}",
            resource.name(),
            before,
            state
        );
        self.pending_barriers.push(ResourceBarrier {
            resource: resource.clone(),
            before,
            after: state,
        });
        self.barrier_count += 1;
        Ok(())
    }

    /// Emit the queued transitions as one barrier batch
    pub fn flush_resource_barriers(&mut self) {
        if self.pending_barriers.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending_barriers);
        self.commands.push(Command::Barriers(batch));
    }

    fn require_state(resource: &GpuResource, expected: &[ResourceState], action: &str) -> Result<()> {
        let current = resource.state();
        if expected.contains(&current) {
            return Ok(());
        }
        Err(EmberError::contract(format!(
            "Cannot {} '{}' in state {:?} (expected {:?})",
            action,
            resource.name(),
            current,
            expected
        )))
    }

    /// Copy the whole of `src` into `dst`
    pub fn copy_buffer(&mut self, dst: &GpuBuffer, src: &GpuBuffer) -> Result<()> {
        self.copy_buffer_region(dst, 0, src, 0, src.buffer_size())
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: &GpuBuffer,
        dst_offset: u64,
        src: &GpuBuffer,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.ensure_recording()?;
        let fits = |offset: u64, total: u64| offset.checked_add(size).map_or(false, |end| end <= total);
        if !fits(src_offset, src.buffer_size()) || !fits(dst_offset, dst.buffer_size()) {
            return Err(EmberError::contract(format!(
                "Copy of {} bytes from '{}'@{} to '{}'@{} is out of range",
                size,
                src.gpu_resource().name(),
                src_offset,
                dst.gpu_resource().name(),
                dst_offset
            )));
        }

        self.push(Command::CopyBuffer {
            dst: dst.gpu_resource().clone(),
            dst_offset,
            src: src.gpu_resource().clone(),
            src_offset,
            size,
        });
        Ok(())
    }

    /// Upload tightly packed texels from `src` into the 2D image `dst`
    pub fn copy_buffer_to_texture(&mut self, dst: &Arc<GpuResource>, src: &GpuBuffer) -> Result<()> {
        self.ensure_recording()?;
        if !matches!(dst.dimension(), ResourceDimension::Texture2D { .. }) {
            return Err(EmberError::contract(format!(
                "Copy destination '{}' is not a texture",
                dst.name()
            )));
        }
        let size = dst.size_in_bytes();
        if src.buffer_size() < size {
            return Err(EmberError::contract(format!(
                "Staging buffer '{}' holds {} bytes, texture '{}' needs {}",
                src.gpu_resource().name(),
                src.buffer_size(),
                dst.name(),
                size
            )));
        }
        Self::require_state(dst, &[ResourceState::CopyDest], "copy into")?;

        self.push(Command::CopyBufferToTexture {
            dst: dst.clone(),
            src: src.gpu_resource().clone(),
            size,
        });
        Ok(())
    }

    /// Clear to the buffer's own clear color
    pub fn clear_color(&mut self, target: &ColorBuffer) -> Result<()> {
        self.clear_color_with(target, target.clear_color())
    }

    pub fn clear_color_with(&mut self, target: &ColorBuffer, color: [f32; 4]) -> Result<()> {
        self.ensure_recording()?;
        Self::require_state(target.gpu_resource(), &[ResourceState::RenderTarget], "clear")?;
        self.push(Command::ClearRenderTarget {
            target: target.gpu_resource().clone(),
            color,
        });
        Ok(())
    }

    pub fn clear_depth(&mut self, target: &DepthBuffer) -> Result<()> {
        self.ensure_recording()?;
        Self::require_state(target.gpu_resource(), &[ResourceState::DepthWrite], "clear")?;
        self.push(Command::ClearDepth {
            target: target.gpu_resource().clone(),
            depth: target.clear_depth(),
        });
        Ok(())
    }

    /// Bind up to eight color targets and an optional depth buffer
    pub fn set_render_targets(
        &mut self,
        targets: &[&ColorBuffer],
        depth: Option<&DepthBuffer>,
    ) -> Result<()> {
        self.ensure_recording()?;
        if targets.len() > MAX_RENDER_TARGETS {
            return Err(EmberError::contract(format!(
                "{} render targets bound (max {})",
                targets.len(),
                MAX_RENDER_TARGETS
            )));
        }
        for target in targets {
            Self::require_state(target.gpu_resource(), &[ResourceState::RenderTarget], "render to")?;
        }
        if let Some(depth) = depth {
            Self::require_state(
                depth.gpu_resource(),
                &[ResourceState::DepthWrite, ResourceState::DepthRead],
                "depth-test against",
            )?;
        }

        self.targets = BoundTargets {
            formats: targets.iter().map(|t| t.format()).collect(),
            depth: depth.map(|d| (d.format(), d.gpu_resource().clone())),
        };
        self.push(Command::SetRenderTargets {
            targets: targets.iter().map(|t| t.gpu_resource().clone()).collect(),
            depth: depth.map(|d| d.gpu_resource().clone()),
        });
        Ok(())
    }

    pub fn set_viewport_and_scissor(&mut self, x: u32, y: u32, width: u32, height: u32) -> Result<()> {
        self.ensure_recording()?;
        self.push(Command::SetViewport(Viewport {
            x: x as f32,
            y: y as f32,
            width: width as f32,
            height: height as f32,
        }));
        Ok(())
    }

    pub fn set_root_signature(&mut self, root_signature: &Arc<RootSignature>) -> Result<()> {
        self.ensure_recording()?;
        if self
            .root_signature
            .as_ref()
            .map_or(false, |bound| Arc::ptr_eq(bound, root_signature))
        {
            return Ok(());
        }
        self.root_signature = Some(root_signature.clone());
        self.push(Command::SetRootSignature(root_signature.clone()));
        Ok(())
    }

    pub fn set_pipeline_state(&mut self, pipeline: &Arc<PipelineState>) -> Result<()> {
        self.ensure_recording()?;
        self.pipeline = Some(pipeline.clone());
        self.push(Command::SetPipelineState(pipeline.clone()));
        Ok(())
    }

    fn root_parameter(&self, root_index: u32) -> Result<&RootParameter> {
        let root = self.root_signature.as_ref().ok_or_else(|| {
            EmberError::contract(format!(
                "'{}': root parameter {} bound without a root signature",
                self.name, root_index
            ))
        })?;
        root.parameter(root_index).ok_or_else(|| {
            EmberError::contract(format!(
                "Root signature '{}' has no parameter {}",
                root.name(),
                root_index
            ))
        })
    }

    /// Bind a constant buffer range to a root CBV parameter
    pub fn set_constant_buffer(&mut self, root_index: u32, buffer: &GpuBuffer, offset: u64) -> Result<()> {
        self.ensure_recording()?;
        if !matches!(
            self.root_parameter(root_index)?,
            RootParameter::ConstantBufferView { .. }
        ) {
            return Err(EmberError::contract(format!(
                "Root parameter {} is not a constant buffer view",
                root_index
            )));
        }
        if offset % CONSTANT_BUFFER_ALIGNMENT != 0 || offset >= buffer.buffer_size() {
            return Err(EmberError::contract(format!(
                "Constant buffer offset {} is invalid for '{}' ({} bytes)",
                offset,
                buffer.gpu_resource().name(),
                buffer.buffer_size()
            )));
        }

        self.push(Command::SetConstantBuffer {
            root_index,
            buffer: buffer.gpu_resource().clone(),
            offset,
        });
        Ok(())
    }

    /// Bind shader resource views to a descriptor table parameter.
    ///
    /// Every resource must already be in a shader-readable state.
    pub fn set_descriptor_table(
        &mut self,
        root_index: u32,
        resources: &[&dyn ShaderResource],
    ) -> Result<()> {
        self.ensure_recording()?;
        self.check_table(root_index, resources.len(), DescriptorHeapKind::CbvSrvUav)?;

        for resource in resources {
            let gpu = resource.gpu_resource();
            if !gpu.state().is_shader_readable() {
                return Err(EmberError::contract(format!(
                    "'{}' is bound as a shader resource in state {:?}",
                    gpu.name(),
                    gpu.state()
                ))
                .with_context(
                    ErrorContext::new("set_descriptor_table", "CommandContext")
                        .with_metadata("context", &self.name)
                        .with_metadata("root_index", root_index),
                ));
            }
        }

        self.push(Command::SetDescriptorTable {
            root_index,
            descriptors: resources.iter().map(|r| r.srv()).collect(),
            resources: resources.iter().map(|r| r.gpu_resource().clone()).collect(),
        });
        Ok(())
    }

    /// Bind sampler descriptors to a sampler table parameter
    pub fn set_sampler_table(&mut self, root_index: u32, samplers: &[Descriptor]) -> Result<()> {
        self.ensure_recording()?;
        self.check_table(root_index, samplers.len(), DescriptorHeapKind::Sampler)?;
        if let Some(bad) = samplers.iter().find(|d| d.kind != DescriptorHeapKind::Sampler) {
            return Err(EmberError::contract(format!(
                "Descriptor {}[{}] bound in a sampler table",
                bad.kind, bad.index
            )));
        }

        self.push(Command::SetDescriptorTable {
            root_index,
            descriptors: samplers.iter().copied().collect(),
            resources: Vec::new(),
        });
        Ok(())
    }

    fn check_table(&self, root_index: u32, len: usize, heap: DescriptorHeapKind) -> Result<()> {
        match self.root_parameter(root_index)? {
            RootParameter::DescriptorTable { kind, count, .. } => {
                let srv_table = *kind == DescriptorRangeKind::Srv;
                let sampler_table = *kind == DescriptorRangeKind::Sampler;
                let accepted = match heap {
                    DescriptorHeapKind::Sampler => sampler_table,
                    _ => srv_table,
                };
                if !accepted {
                    return Err(EmberError::contract(format!(
                        "Root parameter {} holds {:?} descriptors",
                        root_index, kind
                    )));
                }
                if let Some(count) = count {
                    if len > *count as usize {
                        return Err(EmberError::contract(format!(
                            "{} descriptors bound to a table of {}",
                            len, count
                        )));
                    }
                }
                Ok(())
            }
            RootParameter::ConstantBufferView { .. } => Err(EmberError::contract(format!(
                "Root parameter {} is not a descriptor table",
                root_index
            ))),
        }
    }

    pub fn set_vertex_buffer(&mut self, buffer: &VertexBuffer) -> Result<()> {
        self.ensure_recording()?;
        self.push(Command::SetVertexBuffer {
            buffer: buffer.gpu_resource().clone(),
            stride: buffer.stride(),
        });
        Ok(())
    }

    pub fn set_index_buffer(&mut self, buffer: &IndexBuffer) -> Result<()> {
        self.ensure_recording()?;
        self.index_buffer_bound = true;
        self.push(Command::SetIndexBuffer {
            buffer: buffer.gpu_resource().clone(),
            format: buffer.format(),
        });
        Ok(())
    }

    /// Pipeline and target checks run before every draw
    fn validate_draw(&self) -> Result<()> {
        let pipeline = self.pipeline.as_ref().ok_or_else(|| {
            EmberError::contract(format!("'{}': draw without a pipeline state", self.name))
        })?;
        let root = self.root_signature.as_ref().ok_or_else(|| {
            EmberError::contract(format!("'{}': draw without a root signature", self.name))
        })?;

        if !self.device.validation_enabled() {
            return Ok(());
        }

        if !Arc::ptr_eq(pipeline.root_signature(), root) {
            return Err(EmberError::contract(format!(
                "Pipeline '{}' was built for root signature '{}', '{}' is bound",
                pipeline.name(),
                pipeline.root_signature().name(),
                root.name()
            )));
        }
        if pipeline.render_target_formats() != self.targets.formats.as_slice() {
            return Err(EmberError::contract(format!(
                "Pipeline '{}' expects targets {:?}, bound {:?}",
                pipeline.name(),
                pipeline.render_target_formats(),
                self.targets.formats
            )));
        }
        if let Some(depth_state) = pipeline.depth() {
            match &self.targets.depth {
                Some((format, resource)) if *format == depth_state.format => {
                    if depth_state.write_enabled && resource.state() != ResourceState::DepthWrite {
                        return Err(EmberError::contract(format!(
                            "Pipeline '{}' writes depth but '{}' is {:?}",
                            pipeline.name(),
                            resource.name(),
                            resource.state()
                        )));
                    }
                }
                _ => {
                    return Err(EmberError::contract(format!(
                        "Pipeline '{}' needs a {:?} depth buffer",
                        pipeline.name(),
                        depth_state.format
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn draw(&mut self, vertex_count: u32, start_vertex: u32) -> Result<()> {
        self.ensure_recording()?;
        self.validate_draw()?;
        self.push(Command::Draw {
            vertex_count,
            start_vertex,
        });
        self.draw_count += 1;
        Ok(())
    }

    pub fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) -> Result<()> {
        self.ensure_recording()?;
        self.validate_draw()?;
        if !self.index_buffer_bound {
            return Err(EmberError::contract(format!(
                "'{}': indexed draw without an index buffer",
                self.name
            )));
        }
        self.push(Command::DrawIndexed {
            index_count,
            start_index,
            base_vertex,
        });
        self.draw_count += 1;
        Ok(())
    }

    /// Finish recording. Pending barriers are flushed.
    pub fn close(&mut self) -> Result<()> {
        self.ensure_recording()?;
        self.flush_resource_barriers();
        self.state = ContextState::Closed;
        ember_trace!(
            LogCategory::Command,
            "Closed '{}' with {} commands",
            self.name,
            self.commands.len()
        );
        Ok(())
    }

    /// Start a new recording. A submitted context can only be reset once the
    /// GPU has finished with it.
    pub fn reset(&mut self) -> Result<()> {
        if let ContextState::Submitted { fence, value } = &self.state {
            if !fence.is_complete(*value) {
                return Err(EmberError::contract(format!(
                    "Command context '{}' is still in flight (fence {} at {})",
                    self.name,
                    value,
                    fence.completed_value()
                )));
            }
        }

        // Discards anything recorded but never submitted
        self.restore_states();
        self.commands.clear();
        self.pending_barriers.clear();
        if self.commands.capacity() == 0 {
            self.commands = self.device.acquire_command_list();
        }
        self.root_signature = None;
        self.pipeline = None;
        self.targets = BoundTargets::default();
        self.index_buffer_bound = false;
        self.barrier_count = 0;
        self.draw_count = 0;
        self.state = ContextState::Recording;
        Ok(())
    }

    /// Hand the recorded list to a queue; the context must be closed
    pub(crate) fn take_for_submission(&mut self) -> Result<Vec<Command>> {
        if !self.state.is_closed() {
            return Err(EmberError::contract(format!(
                "Only a closed context can be executed; '{}' is {}",
                self.name,
                self.state_name()
            )));
        }
        Ok(std::mem::take(&mut self.commands))
    }

    pub(crate) fn mark_submitted(&mut self, fence: Arc<Fence>, value: u64) {
        // The queue now owns the transitions recorded so far
        self.original_states.clear();
        self.state = ContextState::Submitted { fence, value };
    }

    /// Undo the tracked transitions of a recording that never reached a queue
    fn restore_states(&mut self) {
        for (resource, state) in self.original_states.drain(..).rev() {
            resource.swap_state(state);
        }
    }

    /// Commands recorded so far, excluding barriers not yet flushed
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    /// Transitions recorded since the last reset; elided ones are not counted
    pub fn barrier_count(&self) -> usize {
        self.barrier_count
    }

    pub fn draw_count(&self) -> usize {
        self.draw_count
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        self.restore_states();
        let commands = std::mem::take(&mut self.commands);
        if commands.capacity() > 0 {
            self.device.recycle_command_list(commands);
        }
    }
}
