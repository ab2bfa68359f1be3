//! Deferred lighting resolve
//!
//! Reads the four G-buffer targets and writes lit HDR color with a single
//! full-screen triangle. No depth test.

use ember_core::{ember_debug, EmberError, ErrorContext, LogCategory, Result};
use std::sync::Arc;
use wgpu::TextureFormat;

use super::{FrameConstantRing, GeometryRenderingPass, PassState, SceneConstants};
use crate::camera::{Camera, DirectionalLight};
use crate::command::CommandContext;
use crate::device::GraphicsDevice;
use crate::pipeline::{
    DescriptorRangeKind, PipelineState, PipelineStateBuilder, RasterizerState, RootSignature,
    RootSignatureBuilder, ShaderVisibility,
};
use crate::resource::ResourceState;
use crate::sampler::SamplerKind;
use crate::texture::ColorBuffer;

pub const RESULT_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

pub mod root_index {
    pub const SCENE: u32 = 0;
    pub const ALBEDO: u32 = 1;
    pub const METALLIC_ROUGHNESS: u32 = 2;
    pub const NORMAL: u32 = 3;
    pub const DEPTH: u32 = 4;
}

#[derive(Debug)]
struct LightingResources {
    root_signature: Arc<RootSignature>,
    pipeline: Arc<PipelineState>,
    result: ColorBuffer,
    scene_constants: FrameConstantRing,
}

#[derive(Debug)]
pub struct LightingRenderingPass {
    device: GraphicsDevice,
    state: PassState,
    frames_in_flight: u32,
    resources: Option<LightingResources>,
}

impl LightingRenderingPass {
    const NAME: &'static str = "LightingRenderingPass";

    pub fn new(device: &GraphicsDevice, frames_in_flight: u32) -> Self {
        Self {
            device: device.clone(),
            state: PassState::Uninitialized,
            frames_in_flight,
            resources: None,
        }
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    #[tracing::instrument(skip(self))]
    pub fn initialize(&mut self, width: u32, height: u32) -> Result<()> {
        self.state.ensure_uninitialized(Self::NAME)?;

        let root_signature = RootSignatureBuilder::new("lighting")
            .constant_buffer(0, ShaderVisibility::Pixel)
            .descriptor_table(DescriptorRangeKind::Srv, 0, Some(1), ShaderVisibility::Pixel)
            .descriptor_table(DescriptorRangeKind::Srv, 1, Some(1), ShaderVisibility::Pixel)
            .descriptor_table(DescriptorRangeKind::Srv, 2, Some(1), ShaderVisibility::Pixel)
            .descriptor_table(DescriptorRangeKind::Srv, 3, Some(1), ShaderVisibility::Pixel)
            .static_sampler(0, SamplerKind::PointClamp.desc(), ShaderVisibility::Pixel)
            .build()?;

        let pipeline = PipelineStateBuilder::new("lighting", &root_signature)
            .shaders("ScreenQuadVS", "LightingPS")
            .rasterizer(RasterizerState {
                cull_mode: None,
                wireframe: false,
            })
            .render_target_formats(&[RESULT_FORMAT])
            .build()?;

        let result =
            ColorBuffer::create(&self.device, "lighting.result", width, height, RESULT_FORMAT, [0.0; 4])?;
        let scene_constants =
            FrameConstantRing::new(&self.device, "lighting.scene", self.frames_in_flight, 1)?;

        self.resources = Some(LightingResources {
            root_signature,
            pipeline,
            result,
            scene_constants,
        });
        self.state = PassState::Initialized;
        ember_debug!(LogCategory::Pass, "Lighting pass initialized at {}x{}", width, height);
        Ok(())
    }

    /// Resolve the G-buffer of `geometry` into the lighting result
    pub fn render(
        &mut self,
        ctx: &mut CommandContext,
        frame_index: u64,
        geometry: &GeometryRenderingPass,
        camera: &Camera,
        light: &DirectionalLight,
    ) -> Result<()> {
        self.state.ensure_initialized(Self::NAME)?;
        let Some(res) = self.resources.as_mut() else {
            return Err(EmberError::contract("Lighting pass has no resources"));
        };

        let gbuffer = geometry.gbuffer().ok_or_else(|| {
            EmberError::contract("Lighting pass input missing: the geometry pass has no G-buffer")
                .with_context(ErrorContext::new("render", Self::NAME))
        })?;
        if (gbuffer.width(), gbuffer.height()) != (res.result.width(), res.result.height()) {
            return Err(EmberError::contract(format!(
                "G-buffer is {}x{} but the lighting result is {}x{}",
                gbuffer.width(),
                gbuffer.height(),
                res.result.width(),
                res.result.height()
            )));
        }

        res.scene_constants.begin_frame(frame_index);

        ctx.transition_resource(&gbuffer.albedo, ResourceState::PixelShaderResource)?;
        ctx.transition_resource(&gbuffer.metallic_roughness, ResourceState::PixelShaderResource)?;
        ctx.transition_resource(&gbuffer.normal, ResourceState::PixelShaderResource)?;
        ctx.transition_resource(&gbuffer.depth, ResourceState::PixelShaderResource)?;
        ctx.transition_resource(&res.result, ResourceState::RenderTarget)?;

        ctx.clear_color(&res.result)?;
        ctx.set_render_targets(&[&res.result], None)?;
        ctx.set_viewport_and_scissor(0, 0, res.result.width(), res.result.height())?;
        ctx.set_root_signature(&res.root_signature)?;
        ctx.set_pipeline_state(&res.pipeline)?;

        let offset = res.scene_constants.push(&SceneConstants::new(camera, light))?;
        ctx.set_constant_buffer(root_index::SCENE, res.scene_constants.buffer(), offset)?;
        ctx.set_descriptor_table(root_index::ALBEDO, &[&gbuffer.albedo])?;
        ctx.set_descriptor_table(root_index::METALLIC_ROUGHNESS, &[&gbuffer.metallic_roughness])?;
        ctx.set_descriptor_table(root_index::NORMAL, &[&gbuffer.normal])?;
        ctx.set_descriptor_table(root_index::DEPTH, &[&gbuffer.depth])?;
        ctx.draw(3, 0)?;
        Ok(())
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.state.ensure_initialized(Self::NAME)?;
        match self.resources.as_mut() {
            Some(res) => res.result.resize(width, height),
            None => Ok(()),
        }
    }

    pub fn finalize(&mut self) {
        self.resources = None;
        self.state = PassState::Finalized;
    }

    /// Lit HDR color, present while initialized
    pub fn result(&self) -> Option<&ColorBuffer> {
        self.resources.as_ref().map(|res| &res.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::SamplerManager;
    use ember_core::DeviceConfig;

    #[test]
    fn test_missing_geometry_input_is_rejected() {
        let device = GraphicsDevice::new(DeviceConfig::default()).unwrap();
        let geometry = GeometryRenderingPass::new(&device, 2, 4);
        let mut lighting = LightingRenderingPass::new(&device, 2);
        lighting.initialize(32, 32).unwrap();

        let mut ctx = CommandContext::new(&device, "frame");
        let err = lighting
            .render(&mut ctx, 0, &geometry, &Camera::new(), &DirectionalLight::default())
            .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let device = GraphicsDevice::new(DeviceConfig::default()).unwrap();
        let samplers = SamplerManager::new(&device).unwrap();
        let mut geometry = GeometryRenderingPass::new(&device, 2, 4);
        geometry.initialize(64, 64).unwrap();
        let mut lighting = LightingRenderingPass::new(&device, 2);
        lighting.initialize(32, 32).unwrap();

        let mut ctx = CommandContext::new(&device, "frame");
        let camera = Camera::new();
        let light = DirectionalLight::default();
        geometry.render(&mut ctx, 0, &camera, &light, &[], &samplers).unwrap();
        assert!(lighting.render(&mut ctx, 0, &geometry, &camera, &light).is_err());
    }
}
