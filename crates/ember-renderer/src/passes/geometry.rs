//! G-buffer pass
//!
//! Rasterizes every draw item into albedo, metallic-roughness, normal and
//! depth targets that the lighting pass resolves.

use ember_core::{ember_debug, EmberError, LogCategory, Result};
use std::sync::Arc;
use wgpu::{CompareFunction, TextureFormat};

use super::{FrameConstantRing, InstanceConstants, PassState, SceneConstants};
use crate::camera::{Camera, DirectionalLight};
use crate::command::CommandContext;
use crate::device::GraphicsDevice;
use crate::model::Vertex;
use crate::pipeline::{
    DepthState, DescriptorRangeKind, PipelineState, PipelineStateBuilder, RootSignature,
    RootSignatureBuilder, ShaderVisibility,
};
use crate::resource::ResourceState;
use crate::sampler::SamplerManager;
use crate::scene::DrawItem;
use crate::texture::{ColorBuffer, DepthBuffer, Texture};

pub const ALBEDO_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
pub const METALLIC_ROUGHNESS_FORMAT: TextureFormat = TextureFormat::Rg16Float;
pub const NORMAL_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// Root parameter slots of the geometry root signature
pub mod root_index {
    pub const SCENE: u32 = 0;
    pub const INSTANCE: u32 = 1;
    pub const MATERIAL: u32 = 2;
    pub const TEXTURES: u32 = 3;
    pub const SAMPLERS: u32 = 4;
}

/// Outputs of the geometry pass
#[derive(Debug)]
pub struct GBuffer {
    pub albedo: ColorBuffer,
    pub metallic_roughness: ColorBuffer,
    pub normal: ColorBuffer,
    pub depth: DepthBuffer,
}

impl GBuffer {
    fn create(device: &GraphicsDevice, width: u32, height: u32) -> Result<Self> {
        Ok(Self {
            albedo: ColorBuffer::create(device, "gbuffer.albedo", width, height, ALBEDO_FORMAT, [0.0; 4])?,
            metallic_roughness: ColorBuffer::create(
                device,
                "gbuffer.metallic_roughness",
                width,
                height,
                METALLIC_ROUGHNESS_FORMAT,
                [0.0; 4],
            )?,
            normal: ColorBuffer::create(device, "gbuffer.normal", width, height, NORMAL_FORMAT, [0.0; 4])?,
            depth: DepthBuffer::create(device, "gbuffer.depth", width, height, DEPTH_FORMAT)?,
        })
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.albedo.resize(width, height)?;
        self.metallic_roughness.resize(width, height)?;
        self.normal.resize(width, height)?;
        self.depth.resize(width, height)
    }

    pub fn width(&self) -> u32 {
        self.albedo.width()
    }

    pub fn height(&self) -> u32 {
        self.albedo.height()
    }
}

#[derive(Debug)]
struct GeometryResources {
    root_signature: Arc<RootSignature>,
    pipeline: Arc<PipelineState>,
    gbuffer: GBuffer,
    scene_constants: FrameConstantRing,
    instance_constants: FrameConstantRing,
}

#[derive(Debug)]
pub struct GeometryRenderingPass {
    device: GraphicsDevice,
    state: PassState,
    frames_in_flight: u32,
    max_draws: u32,
    resources: Option<GeometryResources>,
}

impl GeometryRenderingPass {
    const NAME: &'static str = "GeometryRenderingPass";

    pub fn new(device: &GraphicsDevice, frames_in_flight: u32, max_draws: u32) -> Self {
        Self {
            device: device.clone(),
            state: PassState::Uninitialized,
            frames_in_flight,
            max_draws,
            resources: None,
        }
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    #[tracing::instrument(skip(self))]
    pub fn initialize(&mut self, width: u32, height: u32) -> Result<()> {
        self.state.ensure_uninitialized(Self::NAME)?;

        let root_signature = RootSignatureBuilder::new("geometry")
            .constant_buffer(0, ShaderVisibility::All)
            .constant_buffer(1, ShaderVisibility::Vertex)
            .constant_buffer(2, ShaderVisibility::Pixel)
            .descriptor_table(DescriptorRangeKind::Srv, 0, None, ShaderVisibility::Pixel)
            .descriptor_table(DescriptorRangeKind::Sampler, 0, None, ShaderVisibility::Pixel)
            .build()?;

        let pipeline = PipelineStateBuilder::new("geometry", &root_signature)
            .shaders("GeometryPassVS", "GeometryPassPS")
            .input_layout(Vertex::layout())
            .render_target_formats(&[ALBEDO_FORMAT, METALLIC_ROUGHNESS_FORMAT, NORMAL_FORMAT])
            .depth(DepthState {
                format: DEPTH_FORMAT,
                write_enabled: true,
                compare: CompareFunction::Less,
            })
            .build()?;

        let gbuffer = GBuffer::create(&self.device, width, height)?;
        let scene_constants =
            FrameConstantRing::new(&self.device, "geometry.scene", self.frames_in_flight, 1)?;
        let instance_constants = FrameConstantRing::new(
            &self.device,
            "geometry.instances",
            self.frames_in_flight,
            self.max_draws,
        )?;

        self.resources = Some(GeometryResources {
            root_signature,
            pipeline,
            gbuffer,
            scene_constants,
            instance_constants,
        });
        self.state = PassState::Initialized;
        ember_debug!(LogCategory::Pass, "Geometry pass initialized at {}x{}", width, height);
        Ok(())
    }

    /// Record the G-buffer fill for `items`
    pub fn render(
        &mut self,
        ctx: &mut CommandContext,
        frame_index: u64,
        camera: &Camera,
        light: &DirectionalLight,
        items: &[DrawItem],
        samplers: &SamplerManager,
    ) -> Result<()> {
        self.state.ensure_initialized(Self::NAME)?;
        if items.len() > self.max_draws as usize {
            return Err(EmberError::capacity(format!(
                "{} draw items exceed the per-frame budget of {}",
                items.len(),
                self.max_draws
            )));
        }
        let meshes = items
            .iter()
            .map(|item| {
                item.mesh().ok_or_else(|| {
                    EmberError::contract(format!(
                        "Draw item of model '{}' references mesh {} but the model has {}",
                        item.model.name(),
                        item.mesh_index,
                        item.model.meshes().len()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let Some(res) = self.resources.as_mut() else {
            return Err(EmberError::contract("Geometry pass has no resources"));
        };

        res.scene_constants.begin_frame(frame_index);
        res.instance_constants.begin_frame(frame_index);

        let gbuffer = &res.gbuffer;
        ctx.transition_resource(&gbuffer.albedo, ResourceState::RenderTarget)?;
        ctx.transition_resource(&gbuffer.metallic_roughness, ResourceState::RenderTarget)?;
        ctx.transition_resource(&gbuffer.normal, ResourceState::RenderTarget)?;
        ctx.transition_resource(&gbuffer.depth, ResourceState::DepthWrite)?;

        ctx.clear_color(&gbuffer.albedo)?;
        ctx.clear_color(&gbuffer.metallic_roughness)?;
        ctx.clear_color(&gbuffer.normal)?;
        ctx.clear_depth(&gbuffer.depth)?;

        ctx.set_render_targets(
            &[&gbuffer.albedo, &gbuffer.metallic_roughness, &gbuffer.normal],
            Some(&gbuffer.depth),
        )?;
        ctx.set_viewport_and_scissor(0, 0, gbuffer.width(), gbuffer.height())?;
        ctx.set_root_signature(&res.root_signature)?;
        ctx.set_pipeline_state(&res.pipeline)?;

        let scene_offset = res.scene_constants.push(&SceneConstants::new(camera, light))?;
        ctx.set_constant_buffer(root_index::SCENE, res.scene_constants.buffer(), scene_offset)?;
        ctx.set_sampler_table(root_index::SAMPLERS, &samplers.table())?;

        for (item, mesh) in items.iter().zip(meshes) {
            let material = mesh.material();

            let offset = res.instance_constants.push(&InstanceConstants::new(item.world))?;
            ctx.set_constant_buffer(root_index::INSTANCE, res.instance_constants.buffer(), offset)?;
            ctx.set_constant_buffer(root_index::MATERIAL, material.constant_buffer(), 0)?;
            let texture: &Texture = material.texture();
            ctx.set_descriptor_table(root_index::TEXTURES, &[texture])?;
            ctx.set_vertex_buffer(mesh.vertex_buffer())?;
            ctx.set_index_buffer(mesh.index_buffer())?;
            ctx.draw_indexed(mesh.index_count(), 0, 0)?;
        }

        Ok(())
    }

    /// Recreate the G-buffer at a new size
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.state.ensure_initialized(Self::NAME)?;
        match self.resources.as_mut() {
            Some(res) => res.gbuffer.resize(width, height),
            None => Ok(()),
        }
    }

    /// Release the outputs and pipeline
    pub fn finalize(&mut self) {
        self.resources = None;
        self.state = PassState::Finalized;
    }

    /// G-buffer targets, present while initialized
    pub fn gbuffer(&self) -> Option<&GBuffer> {
        self.resources.as_ref().map(|res| &res.gbuffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::AsResource;
    use ember_core::DeviceConfig;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_before_initialize_is_rejected() {
        let device = GraphicsDevice::new(DeviceConfig::default()).unwrap();
        let samplers = SamplerManager::new(&device).unwrap();
        let mut pass = GeometryRenderingPass::new(&device, 2, 16);
        let mut ctx = CommandContext::new(&device, "frame");

        let err = pass
            .render(&mut ctx, 0, &Camera::new(), &DirectionalLight::default(), &[], &samplers)
            .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_initialize_exactly_once() {
        let device = GraphicsDevice::new(DeviceConfig::default()).unwrap();
        let mut pass = GeometryRenderingPass::new(&device, 2, 16);
        pass.initialize(64, 64).unwrap();
        assert!(pass.initialize(64, 64).is_err());

        let gbuffer = pass.gbuffer().unwrap();
        assert_eq!(gbuffer.albedo.format(), ALBEDO_FORMAT);
        assert_eq!(gbuffer.metallic_roughness.format(), METALLIC_ROUGHNESS_FORMAT);
        assert_eq!(gbuffer.normal.format(), NORMAL_FORMAT);
        assert_eq!(gbuffer.depth.format(), DEPTH_FORMAT);

        pass.finalize();
        assert!(pass.gbuffer().is_none());
        assert_eq!(pass.state(), PassState::Finalized);
    }

    #[test]
    fn test_empty_frame_clears_targets() {
        let device = GraphicsDevice::new(DeviceConfig::default()).unwrap();
        let samplers = SamplerManager::new(&device).unwrap();
        let mut pass = GeometryRenderingPass::new(&device, 2, 16);
        pass.initialize(32, 32).unwrap();

        let mut ctx = CommandContext::new(&device, "frame");
        pass.render(&mut ctx, 0, &Camera::new(), &DirectionalLight::default(), &[], &samplers)
            .unwrap();

        assert_eq!(ctx.draw_count(), 0);
        let gbuffer = pass.gbuffer().unwrap();
        assert_eq!(gbuffer.albedo.gpu_resource().state(), ResourceState::RenderTarget);
        assert_eq!(gbuffer.depth.gpu_resource().state(), ResourceState::DepthWrite);
    }

    #[test]
    fn test_missing_mesh_is_rejected_before_recording() {
        use crate::model::{quad_model_data, Model};
        use crate::queue::{CommandQueue, QueueKind};
        use crate::texture::DefaultTextures;
        use glam::Mat4;

        let device = GraphicsDevice::new(DeviceConfig::default()).unwrap();
        let mut queue = CommandQueue::new(&device, QueueKind::Direct).unwrap();
        let samplers = SamplerManager::new(&device).unwrap();
        let mut setup = CommandContext::new(&device, "defaults");
        let defaults = DefaultTextures::create(&mut setup).unwrap();
        setup.close().unwrap();
        queue.execute(&mut setup).unwrap();
        let model = Model::create(&device, &mut queue, &defaults, &quad_model_data("quad")).unwrap();
        assert_eq!(model.meshes().len(), 1);

        let mut pass = GeometryRenderingPass::new(&device, 2, 16);
        pass.initialize(32, 32).unwrap();
        let items = [
            DrawItem { model: model.clone(), mesh_index: 0, world: Mat4::IDENTITY },
            DrawItem { model, mesh_index: 5, world: Mat4::IDENTITY },
        ];

        let mut ctx = CommandContext::new(&device, "frame");
        let err = pass
            .render(&mut ctx, 0, &Camera::new(), &DirectionalLight::default(), &items, &samplers)
            .unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(ctx.command_count(), 0);
        assert_eq!(ctx.barrier_count(), 0);
        assert_eq!(
            pass.gbuffer().unwrap().albedo.gpu_resource().state(),
            ResourceState::Common
        );
    }
}
