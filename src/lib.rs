//! Ember Engine - deferred rendering core for real-time 3D
//!
//! `Engine` is the composition root: it builds the graphics device, the
//! render manager and the instance registry from an [`EngineConfig`] and
//! owns the scene camera and sun light the renderer tracks weakly.
//!
//! ```no_run
//! use ember_engine::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut engine = Engine::new(EngineConfig::default())?;
//!     let quad = engine.create_model(&quad_model_data("quad"))?;
//!     engine.add_instance(quad, Mat4::IDENTITY);
//!     engine.render_frame()?;
//!     engine.shutdown()
//! }
//! ```

pub use ember_core;
pub use ember_renderer;

use anyhow::Context;
use glam::Mat4;
use parking_lot::RwLock;
use std::sync::Arc;

use ember_core::EngineConfig;
use ember_renderer::{
    Camera, DirectionalLight, FrameReport, GraphicsDevice, InstanceKey, InstanceRegistry, Model,
    ModelData, ModelInstance, OverlayRenderer, RenderManager,
};

/// Commonly used types
pub mod prelude {
    pub use crate::Engine;
    pub use ember_core::{EmberError, EngineConfig, RendererConfig};
    pub use ember_renderer::model::quad_model_data;
    pub use ember_renderer::{
        Camera, DirectionalLight, FrameReport, InstanceKey, ModelData, ModelInstance,
        OverlayRenderer,
    };
    pub use glam::{Mat4, Quat, Vec3};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Engine {
    device: GraphicsDevice,
    renderer: RenderManager,
    instances: InstanceRegistry,
    camera: Arc<RwLock<Camera>>,
    sun_light: Arc<RwLock<DirectionalLight>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("renderer", &self.renderer)
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        ember_core::init(&config).context("Invalid engine configuration")?;

        let device = GraphicsDevice::new(config.device.clone())
            .context("Failed to create the graphics device")?;
        let mut renderer = RenderManager::new(&device, &config.renderer)
            .context("Failed to create the render manager")?;

        let mut camera = Camera::new();
        camera.set_aspect_ratio(config.renderer.width as f32 / config.renderer.height as f32);
        camera.update_matrices();
        let camera = Arc::new(RwLock::new(camera));
        let sun_light = Arc::new(RwLock::new(DirectionalLight::default()));
        renderer.set_camera(&camera);
        renderer.set_sun_light(&sun_light);

        tracing::info!(
            "Ember Engine v{} ready at {}x{}",
            VERSION,
            config.renderer.width,
            config.renderer.height
        );
        Ok(Self {
            device,
            renderer,
            instances: InstanceRegistry::new(),
            camera,
            sun_light,
        })
    }

    /// Render every visible instance
    pub fn render_frame(&mut self) -> anyhow::Result<FrameReport> {
        let frame = self.renderer.frame_count();
        let items = self.instances.draw_items();
        self.renderer
            .render_frame(&items)
            .with_context(|| format!("Failed to render frame {}", frame))
    }

    pub fn create_model(&mut self, data: &ModelData) -> anyhow::Result<Arc<Model>> {
        self.renderer
            .create_model(data)
            .with_context(|| format!("Failed to create model '{}'", data.name))
    }

    pub fn add_instance(&mut self, model: Arc<Model>, world: Mat4) -> InstanceKey {
        self.instances.insert(ModelInstance::new(model, world))
    }

    pub fn set_overlay(&mut self, overlay: Box<dyn OverlayRenderer>) -> anyhow::Result<()> {
        self.renderer
            .set_overlay(overlay)
            .context("Failed to attach the overlay")
    }

    pub fn resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.renderer
            .resize(width, height)
            .with_context(|| format!("Failed to resize to {}x{}", width, height))?;
        let mut camera = self.camera.write();
        camera.set_aspect_ratio(width as f32 / height as f32);
        camera.update_matrices();
        Ok(())
    }

    /// Wait for the GPU and release the renderer
    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        self.instances = InstanceRegistry::new();
        self.renderer.shutdown().context("Renderer shutdown failed")
    }

    pub fn instances(&self) -> &InstanceRegistry {
        &self.instances
    }

    pub fn instances_mut(&mut self) -> &mut InstanceRegistry {
        &mut self.instances
    }

    pub fn camera(&self) -> &Arc<RwLock<Camera>> {
        &self.camera
    }

    pub fn sun_light(&self) -> &Arc<RwLock<DirectionalLight>> {
        &self.sun_light
    }

    pub fn device(&self) -> &GraphicsDevice {
        &self.device
    }

    pub fn renderer(&self) -> &RenderManager {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut RenderManager {
        &mut self.renderer
    }
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use super::VERSION;
    use pretty_assertions::assert_eq;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.renderer.width = 64;
        config.renderer.height = 64;
        config
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_engine_renders_instances() {
        let mut engine = Engine::new(config()).unwrap();
        let quad = engine.create_model(&quad_model_data("quad")).unwrap();
        engine.add_instance(quad.clone(), Mat4::IDENTITY);
        let hidden = engine.add_instance(quad, Mat4::from_translation(Vec3::X));
        engine.instances_mut().get_mut(hidden).unwrap().visible = false;

        let report = engine.render_frame().unwrap();
        // One geometry draw plus lighting and composite
        assert_eq!(report.draw_count, 3);
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.renderer.swap_chain_buffer_count = 1;
        assert!(Engine::new(config).is_err());
    }

    #[test]
    fn test_frame_errors_name_the_frame() {
        let mut engine = Engine::new(config()).unwrap();
        engine.render_frame().unwrap();
        engine.device().mark_removed("test");

        let err = engine.render_frame().unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to render frame 1"));
        let root = err.downcast_ref::<EmberError>().unwrap();
        assert!(root.is_fatal());
    }
}
