//! Tone mapping onto the back buffer

use bytemuck::{Pod, Zeroable};
use ember_core::{EmberError, Result};
use std::sync::Arc;
use wgpu::TextureFormat;

use super::{FrameConstantRing, LightingRenderingPass, PassState};
use crate::command::CommandContext;
use crate::device::GraphicsDevice;
use crate::pipeline::{
    DescriptorRangeKind, PipelineState, PipelineStateBuilder, RasterizerState, RootSignature,
    RootSignatureBuilder, ShaderVisibility,
};
use crate::resource::ResourceState;
use crate::sampler::SamplerKind;
use crate::texture::ColorBuffer;

pub mod root_index {
    pub const PARAMETERS: u32 = 0;
    pub const SOURCE: u32 = 1;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ToneMapParameters {
    pub exposure: f32,
    pub gamma: f32,
    pub _pad: [f32; 2],
}

#[derive(Debug)]
struct CompositeResources {
    root_signature: Arc<RootSignature>,
    pipeline: Arc<PipelineState>,
    parameters: FrameConstantRing,
    target_format: TextureFormat,
}

#[derive(Debug)]
pub struct CompositePass {
    device: GraphicsDevice,
    state: PassState,
    frames_in_flight: u32,
    exposure: f32,
    resources: Option<CompositeResources>,
}

impl CompositePass {
    const NAME: &'static str = "CompositePass";

    pub fn new(device: &GraphicsDevice, frames_in_flight: u32) -> Self {
        Self {
            device: device.clone(),
            state: PassState::Uninitialized,
            frames_in_flight,
            exposure: 1.0,
            resources: None,
        }
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    /// Build the pipeline for back buffers of `target_format`
    pub fn initialize(&mut self, target_format: TextureFormat) -> Result<()> {
        self.state.ensure_uninitialized(Self::NAME)?;

        let root_signature = RootSignatureBuilder::new("composite")
            .constant_buffer(0, ShaderVisibility::Pixel)
            .descriptor_table(DescriptorRangeKind::Srv, 0, Some(1), ShaderVisibility::Pixel)
            .static_sampler(0, SamplerKind::LinearClamp.desc(), ShaderVisibility::Pixel)
            .build()?;
        let pipeline = PipelineStateBuilder::new("composite", &root_signature)
            .shaders("ScreenQuadVS", "ToneMappingPS")
            .rasterizer(RasterizerState {
                cull_mode: None,
                wireframe: false,
            })
            .render_target_formats(&[target_format])
            .build()?;
        let parameters =
            FrameConstantRing::new(&self.device, "composite.parameters", self.frames_in_flight, 1)?;

        self.resources = Some(CompositeResources {
            root_signature,
            pipeline,
            parameters,
            target_format,
        });
        self.state = PassState::Initialized;
        Ok(())
    }

    pub fn set_exposure(&mut self, exposure: f32) {
        self.exposure = exposure;
    }

    pub fn exposure(&self) -> f32 {
        self.exposure
    }

    /// Tone-map the lighting result into `target`
    pub fn render(
        &mut self,
        ctx: &mut CommandContext,
        frame_index: u64,
        lighting: &LightingRenderingPass,
        target: &ColorBuffer,
    ) -> Result<()> {
        self.state.ensure_initialized(Self::NAME)?;
        let Some(res) = self.resources.as_mut() else {
            return Err(EmberError::contract("Composite pass has no resources"));
        };
        let source = lighting.result().ok_or_else(|| {
            EmberError::contract("Composite pass input missing: no lighting result")
        })?;
        if target.format() != res.target_format {
            return Err(EmberError::contract(format!(
                "Composite pass built for {:?}, target '{}' is {:?}",
                res.target_format,
                target.name(),
                target.format()
            )));
        }

        res.parameters.begin_frame(frame_index);
        let offset = res.parameters.push(&ToneMapParameters {
            exposure: self.exposure,
            gamma: 2.2,
            _pad: [0.0; 2],
        })?;

        ctx.transition_resource(source, ResourceState::PixelShaderResource)?;
        ctx.transition_resource(target, ResourceState::RenderTarget)?;
        ctx.clear_color(target)?;
        ctx.set_render_targets(&[target], None)?;
        ctx.set_viewport_and_scissor(0, 0, target.width(), target.height())?;
        ctx.set_root_signature(&res.root_signature)?;
        ctx.set_pipeline_state(&res.pipeline)?;
        ctx.set_constant_buffer(root_index::PARAMETERS, res.parameters.buffer(), offset)?;
        ctx.set_descriptor_table(root_index::SOURCE, &[source])?;
        ctx.draw(3, 0)
    }

    pub fn finalize(&mut self) {
        self.resources = None;
        self.state = PassState::Finalized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::DeviceConfig;

    #[test]
    fn test_target_format_must_match() {
        let device = GraphicsDevice::new(DeviceConfig::default()).unwrap();
        let mut lighting = LightingRenderingPass::new(&device, 2);
        lighting.initialize(16, 16).unwrap();
        let mut composite = CompositePass::new(&device, 2);
        composite.initialize(TextureFormat::Bgra8Unorm).unwrap();

        let target =
            ColorBuffer::create(&device, "target", 16, 16, TextureFormat::Rgba8Unorm, [0.0; 4])
                .unwrap();
        let mut ctx = CommandContext::new(&device, "frame");
        let err = composite.render(&mut ctx, 0, &lighting, &target).unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_composite_draws_once() {
        let device = GraphicsDevice::new(DeviceConfig::default()).unwrap();
        let mut lighting = LightingRenderingPass::new(&device, 2);
        lighting.initialize(16, 16).unwrap();
        let mut composite = CompositePass::new(&device, 2);
        composite.initialize(TextureFormat::Rgba8UnormSrgb).unwrap();

        let target =
            ColorBuffer::create(&device, "target", 16, 16, TextureFormat::Rgba8UnormSrgb, [0.0; 4])
                .unwrap();
        let mut ctx = CommandContext::new(&device, "frame");
        composite.render(&mut ctx, 0, &lighting, &target).unwrap();
        assert_eq!(ctx.draw_count(), 1);
    }
}
