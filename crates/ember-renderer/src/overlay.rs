//! Editor overlay hook
//!
//! An overlay draws on top of the composited frame, after tone mapping and
//! before the back buffer is transitioned for presentation. It owns its own
//! shader-visible descriptor, allocated during `initialize`.

use ember_core::Result;
use wgpu::TextureFormat;

use crate::command::CommandContext;
use crate::device::GraphicsDevice;
use crate::texture::ColorBuffer;

/// What an overlay needs to know about the frames it draws into
#[derive(Debug, Clone)]
pub struct OverlaySetup {
    pub device: GraphicsDevice,
    pub buffer_count: u32,
    pub render_target_format: TextureFormat,
    pub width: u32,
    pub height: u32,
}

/// Renderer plugged in after the composite pass
pub trait OverlayRenderer: Send {
    /// Overlay name used in logs
    fn name(&self) -> &str {
        "overlay"
    }

    /// Called once when the overlay is attached
    fn initialize(&mut self, setup: &OverlaySetup) -> Result<()>;

    /// Record overlay draws into `target`, which is in the render-target state
    fn render(&mut self, ctx: &mut CommandContext, target: &ColorBuffer) -> Result<()>;

    /// Called when the back buffers are recreated
    fn resize(&mut self, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }

    /// Release everything allocated in `initialize`. The GPU is idle.
    fn finalize(&mut self);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::descriptor::{Descriptor, DescriptorHeapKind, DescriptorView};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Overlay that clears nothing and counts its calls
    #[derive(Debug, Default)]
    pub(crate) struct CountingOverlay {
        pub calls: Arc<OverlayCalls>,
        descriptor: Option<(GraphicsDevice, Descriptor)>,
    }

    #[derive(Debug, Default)]
    pub(crate) struct OverlayCalls {
        pub initialize: AtomicU32,
        pub render: AtomicU32,
        pub finalize: AtomicU32,
    }

    impl OverlayRenderer for CountingOverlay {
        fn name(&self) -> &str {
            "counting"
        }

        fn initialize(&mut self, setup: &OverlaySetup) -> Result<()> {
            let descriptor = setup.device.allocate_descriptor(DescriptorView::External {
                label: "counting.font".to_string(),
            })?;
            self.descriptor = Some((setup.device.clone(), descriptor));
            self.calls.initialize.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn render(&mut self, ctx: &mut CommandContext, target: &ColorBuffer) -> Result<()> {
            ctx.set_render_targets(&[target], None)?;
            self.calls.render.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finalize(&mut self) {
            if let Some((device, descriptor)) = self.descriptor.take() {
                let _ = device.free_descriptor(descriptor);
            }
            self.calls.finalize.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_overlay_owns_its_descriptor() {
        let device = GraphicsDevice::new(ember_core::DeviceConfig::default()).unwrap();
        let before = device.descriptor_heap_usage(DescriptorHeapKind::CbvSrvUav).live;

        let mut overlay = CountingOverlay::default();
        overlay
            .initialize(&OverlaySetup {
                device: device.clone(),
                buffer_count: 2,
                render_target_format: TextureFormat::Rgba8UnormSrgb,
                width: 64,
                height: 64,
            })
            .unwrap();
        assert_eq!(
            device.descriptor_heap_usage(DescriptorHeapKind::CbvSrvUav).live,
            before + 1
        );

        overlay.finalize();
        assert_eq!(device.descriptor_heap_usage(DescriptorHeapKind::CbvSrvUav).live, before);
        assert_eq!(overlay.calls.finalize.load(Ordering::SeqCst), 1);
    }
}
