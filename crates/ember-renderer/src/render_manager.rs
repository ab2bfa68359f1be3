//! Frame orchestration
//!
//! The render manager owns the direct queue, the swap chain and the three
//! passes. Each frame records geometry, lighting, composite and the optional
//! overlay into one command context, submits it and presents.
//!
//! The CPU may run at most `frames_in_flight` frames ahead of the GPU: frame
//! `n` waits for the fence signaled by frame `n - frames_in_flight` before
//! reusing that slot's constant regions.

use ember_core::{
    ember_debug, ember_info, ember_warn_rate_limited, EmberError, ErrorContext, LogCategory,
    RendererConfig, Result,
};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

use crate::camera::{Camera, DirectionalLight};
use crate::command::CommandContext;
use crate::device::GraphicsDevice;
use crate::model::{Model, ModelData};
use crate::overlay::{OverlayRenderer, OverlaySetup};
use crate::passes::{CompositePass, GeometryRenderingPass, LightingRenderingPass};
use crate::queue::{CommandQueue, QueueKind};
use crate::resource::{parse_texture_format, ResourceState};
use crate::sampler::SamplerManager;
use crate::scene::DrawItem;
use crate::swap_chain::SwapChain;
use crate::texture::DefaultTextures;

/// Summary of one rendered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub frame_index: u64,
    /// Back buffer the frame was composited into
    pub back_buffer_index: u32,
    pub draw_count: usize,
    pub barrier_count: usize,
    /// Fence value that completes when the GPU finished the frame
    pub fence_value: u64,
}

pub struct RenderManager {
    device: GraphicsDevice,
    queue: CommandQueue,
    swap_chain: SwapChain,
    samplers: SamplerManager,
    defaults: DefaultTextures,
    geometry: GeometryRenderingPass,
    lighting: LightingRenderingPass,
    composite: CompositePass,
    camera: Weak<RwLock<Camera>>,
    sun_light: Weak<RwLock<DirectionalLight>>,
    fallback_camera: Camera,
    overlay: Option<Box<dyn OverlayRenderer>>,
    frame_fences: Vec<u64>,
    frame_count: u64,
    config: RendererConfig,
    shut_down: bool,
}

impl std::fmt::Debug for RenderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderManager")
            .field("frame_count", &self.frame_count)
            .field("width", &self.swap_chain.width())
            .field("height", &self.swap_chain.height())
            .field("queue", &self.queue)
            .field("overlay", &self.overlay.as_ref().map(|overlay| overlay.name().to_string()))
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

impl RenderManager {
    #[tracing::instrument(skip_all, fields(width = config.width, height = config.height))]
    pub fn new(device: &GraphicsDevice, config: &RendererConfig) -> Result<Self> {
        if config.frames_in_flight == 0 {
            return Err(EmberError::configuration("frames_in_flight must be at least 1"));
        }
        let format = parse_texture_format(&config.back_buffer_format)?;

        let mut queue = CommandQueue::new(device, QueueKind::Direct)?;
        let swap_chain = SwapChain::new(
            device,
            config.width,
            config.height,
            config.swap_chain_buffer_count,
            format,
            config.clear_color,
        )?;
        let samplers = SamplerManager::new(device)?;

        let mut ctx = CommandContext::new(device, "render_manager.init");
        let defaults = DefaultTextures::create(&mut ctx)?;
        ctx.close()?;
        queue.execute(&mut ctx)?;
        queue.wait_for_idle()?;

        let mut geometry =
            GeometryRenderingPass::new(device, config.frames_in_flight, config.max_draws_per_frame);
        geometry.initialize(config.width, config.height)?;
        let mut lighting = LightingRenderingPass::new(device, config.frames_in_flight);
        lighting.initialize(config.width, config.height)?;
        let mut composite = CompositePass::new(device, config.frames_in_flight);
        composite.initialize(format)?;

        let mut fallback_camera = Camera::new();
        fallback_camera.set_aspect_ratio(config.width as f32 / config.height as f32);
        fallback_camera.update_matrices();

        ember_info!(
            LogCategory::Frame,
            "Render manager ready: {}x{}, {} back buffers, {} frames in flight",
            config.width,
            config.height,
            config.swap_chain_buffer_count,
            config.frames_in_flight
        );

        Ok(Self {
            device: device.clone(),
            queue,
            swap_chain,
            samplers,
            defaults,
            geometry,
            lighting,
            composite,
            camera: Weak::new(),
            sun_light: Weak::new(),
            fallback_camera,
            overlay: None,
            frame_fences: vec![0; config.frames_in_flight as usize],
            frame_count: 0,
            config: config.clone(),
            shut_down: false,
        })
    }

    /// Track `camera` without owning it
    pub fn set_camera(&mut self, camera: &Arc<RwLock<Camera>>) {
        self.camera = Arc::downgrade(camera);
    }

    pub fn set_sun_light(&mut self, light: &Arc<RwLock<DirectionalLight>>) {
        self.sun_light = Arc::downgrade(light);
    }

    /// Attach an overlay, finalizing the previous one
    pub fn set_overlay(&mut self, mut overlay: Box<dyn OverlayRenderer>) -> Result<()> {
        self.ensure_running()?;
        overlay.initialize(&OverlaySetup {
            device: self.device.clone(),
            buffer_count: self.swap_chain.buffer_count(),
            render_target_format: self.swap_chain.format(),
            width: self.swap_chain.width(),
            height: self.swap_chain.height(),
        })?;

        if let Some(mut previous) = self.overlay.take() {
            self.queue.wait_for_idle()?;
            previous.finalize();
        }
        ember_debug!(LogCategory::Overlay, "Overlay '{}' attached", overlay.name());
        self.overlay = Some(overlay);
        Ok(())
    }

    /// Upload a model on the direct queue and wait for it
    pub fn create_model(&mut self, data: &ModelData) -> Result<Arc<Model>> {
        self.ensure_running()?;
        Model::create(&self.device, &mut self.queue, &self.defaults, data)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down {
            return Err(EmberError::contract("Render manager used after shutdown"));
        }
        Ok(())
    }

    fn frame_camera(&self) -> Camera {
        match self.camera.upgrade() {
            Some(camera) => camera.read().clone(),
            None => {
                ember_warn_rate_limited!(LogCategory::Frame, "No camera attached, using the default view");
                self.fallback_camera.clone()
            }
        }
    }

    fn frame_light(&self) -> DirectionalLight {
        self.sun_light
            .upgrade()
            .map(|light| *light.read())
            .unwrap_or_default()
    }

    /// Record, submit and present one frame of `items`
    #[tracing::instrument(skip_all, fields(frame = self.frame_count))]
    pub fn render_frame(&mut self, items: &[DrawItem]) -> Result<FrameReport> {
        self.ensure_running()?;
        self.device.check_alive()?;

        let frame_index = self.frame_count;
        let slot = (frame_index % self.frame_fences.len() as u64) as usize;
        self.queue.wait_for_fence(self.frame_fences[slot])?;

        let camera = self.frame_camera();
        let light = self.frame_light();
        let back_buffer_index = self.swap_chain.current_back_buffer_index();

        let mut ctx = CommandContext::new(&self.device, &format!("frame{}", frame_index));
        self.geometry
            .render(&mut ctx, frame_index, &camera, &light, items, &self.samplers)?;
        self.lighting
            .render(&mut ctx, frame_index, &self.geometry, &camera, &light)?;

        let back_buffer = self.swap_chain.current_back_buffer();
        self.composite
            .render(&mut ctx, frame_index, &self.lighting, back_buffer)?;
        if let Some(overlay) = self.overlay.as_mut() {
            overlay.render(&mut ctx, back_buffer).map_err(|e| {
                e.with_context(
                    ErrorContext::new("render", "OverlayRenderer")
                        .with_metadata("overlay", overlay.name()),
                )
            })?;
        }
        ctx.transition_resource(back_buffer, ResourceState::Present)?;
        ctx.close()?;

        let draw_count = ctx.draw_count();
        let barrier_count = ctx.barrier_count();

        self.queue.execute(&mut ctx)?;
        let fence_value = self.queue.signal()?;
        self.frame_fences[slot] = fence_value;

        self.swap_chain.present()?;
        self.device
            .reclaim_descriptors(self.queue.completed_fence_value());
        self.frame_count += 1;

        ember_debug!(
            LogCategory::Frame,
            "Frame {} submitted: {} draws, {} barriers, fence {}",
            frame_index,
            draw_count,
            barrier_count,
            fence_value
        );
        Ok(FrameReport {
            frame_index,
            back_buffer_index,
            draw_count,
            barrier_count,
            fence_value,
        })
    }

    /// Recreate every size-dependent target
    #[tracing::instrument(skip(self))]
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.ensure_running()?;
        if width == 0 || height == 0 {
            return Err(EmberError::configuration(format!(
                "Invalid render size {}x{}",
                width, height
            )));
        }
        self.flush()?;

        self.swap_chain.resize(width, height)?;
        self.geometry.resize(width, height)?;
        self.lighting.resize(width, height)?;
        if let Some(overlay) = self.overlay.as_mut() {
            overlay.resize(width, height)?;
        }
        self.fallback_camera.set_aspect_ratio(width as f32 / height as f32);
        self.fallback_camera.update_matrices();
        self.config.width = width;
        self.config.height = height;
        Ok(())
    }

    /// Block until the GPU finished everything submitted so far
    pub fn flush(&mut self) -> Result<()> {
        self.queue.wait_for_idle()?;
        self.device
            .reclaim_descriptors(self.queue.completed_fence_value());
        Ok(())
    }

    /// Drain the GPU and release the passes and overlay. Safe to call twice.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        // Release everything even when the device is gone
        let drained = if self.device.is_lost() {
            Ok(())
        } else {
            self.queue.wait_for_idle()
        };

        if let Some(mut overlay) = self.overlay.take() {
            overlay.finalize();
        }
        self.composite.finalize();
        self.lighting.finalize();
        self.geometry.finalize();

        ember_info!(
            LogCategory::Frame,
            "Render manager shut down after {} frames",
            self.frame_count
        );
        drained
    }

    pub fn device(&self) -> &GraphicsDevice {
        &self.device
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn swap_chain(&self) -> &SwapChain {
        &self.swap_chain
    }

    pub fn geometry_pass(&self) -> &GeometryRenderingPass {
        &self.geometry
    }

    pub fn lighting_pass(&self) -> &LightingRenderingPass {
        &self.lighting
    }

    pub fn composite_pass_mut(&mut self) -> &mut CompositePass {
        &mut self.composite
    }

    pub fn default_textures(&self) -> &DefaultTextures {
        &self.defaults
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl Drop for RenderManager {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Render manager shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::quad_model_data;
    use crate::overlay::tests::CountingOverlay;
    use crate::passes::PassState;
    use crate::scene::{InstanceRegistry, ModelInstance};
    use ember_core::DeviceConfig;
    use glam::Mat4;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    fn small_config() -> RendererConfig {
        RendererConfig {
            width: 64,
            height: 48,
            max_draws_per_frame: 8,
            ..RendererConfig::default()
        }
    }

    fn manager() -> RenderManager {
        let device = GraphicsDevice::new(DeviceConfig::default()).unwrap();
        RenderManager::new(&device, &small_config()).unwrap()
    }

    #[test]
    fn test_empty_frame_presents() {
        let mut manager = manager();
        let report = manager.render_frame(&[]).unwrap();

        assert_eq!(report.frame_index, 0);
        assert_eq!(report.back_buffer_index, 0);
        // Lighting and composite each draw a full-screen triangle
        assert_eq!(report.draw_count, 2);
        assert_eq!(manager.swap_chain().current_back_buffer_index(), 1);
        assert_eq!(manager.frame_count(), 1);
    }

    #[test]
    fn test_frames_draw_registered_instances() {
        let mut manager = manager();
        let model = manager.create_model(&quad_model_data("quad")).unwrap();
        let mut registry = InstanceRegistry::new();
        registry.insert(ModelInstance::new(model.clone(), Mat4::IDENTITY));
        registry.insert(ModelInstance::new(model, Mat4::from_translation(glam::Vec3::Y)));

        let items = registry.draw_items();
        for _ in 0..4 {
            let report = manager.render_frame(&items).unwrap();
            assert_eq!(report.draw_count, 4);
        }
        manager.flush().unwrap();
        assert_eq!(manager.device().stats().draws, 16);
    }

    #[test]
    fn test_cpu_lead_is_bounded() {
        let mut manager = manager();
        let mut last = 0;
        for _ in 0..6 {
            last = manager.render_frame(&[]).unwrap().fence_value;
            let frames_in_flight = manager.config().frames_in_flight as u64;
            // Frame n waited for frame n - frames_in_flight before recording
            assert!(manager.queue().completed_fence_value() + frames_in_flight >= last);
        }
        manager.flush().unwrap();
        assert!(manager.queue().completed_fence_value() >= last);
    }

    #[test]
    fn test_dropped_camera_falls_back_to_default() {
        let mut manager = manager();
        {
            let camera = Arc::new(RwLock::new(Camera::new()));
            manager.set_camera(&camera);
        }
        assert!(manager.render_frame(&[]).is_ok());
    }

    #[test]
    fn test_overlay_runs_after_composite() {
        let mut manager = manager();
        let overlay = CountingOverlay::default();
        let calls = overlay.calls.clone();
        manager.set_overlay(Box::new(overlay)).unwrap();

        manager.render_frame(&[]).unwrap();
        manager.render_frame(&[]).unwrap();
        assert_eq!(calls.initialize.load(Ordering::SeqCst), 1);
        assert_eq!(calls.render.load(Ordering::SeqCst), 2);

        manager.shutdown().unwrap();
        assert_eq!(calls.finalize.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resize_recreates_targets() {
        let mut manager = manager();
        manager.render_frame(&[]).unwrap();
        manager.resize(128, 96).unwrap();

        assert_eq!(manager.swap_chain().width(), 128);
        let gbuffer = manager.geometry_pass().gbuffer().unwrap();
        assert_eq!((gbuffer.width(), gbuffer.height()), (128, 96));
        let result = manager.lighting_pass().result().unwrap();
        assert_eq!((result.width(), result.height()), (128, 96));
        assert!(manager.render_frame(&[]).is_ok());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut manager = manager();
        manager.render_frame(&[]).unwrap();
        manager.shutdown().unwrap();
        manager.shutdown().unwrap();

        assert_eq!(manager.geometry_pass().state(), PassState::Finalized);
        assert!(manager.render_frame(&[]).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_device_removal_fails_the_frame() {
        let mut manager = manager();
        manager.device().mark_removed("test");
        let err = manager.render_frame(&[]).unwrap_err();
        assert!(err.is_fatal());
        assert!(manager.shutdown().is_ok());
    }
}
