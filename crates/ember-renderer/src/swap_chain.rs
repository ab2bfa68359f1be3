//! Presentation ring of back buffers

use ember_core::{EmberError, Result};
use wgpu::TextureFormat;

use crate::device::GraphicsDevice;
use crate::resource::{AsResource, ResourceState};
use crate::texture::ColorBuffer;

/// A swap chain needs at least double buffering
pub const MIN_BUFFER_COUNT: u32 = 2;

#[derive(Debug)]
pub struct SwapChain {
    device: GraphicsDevice,
    buffers: Vec<ColorBuffer>,
    format: TextureFormat,
    width: u32,
    height: u32,
    current: u32,
    present_count: u64,
    clear_color: [f32; 4],
}

impl SwapChain {
    #[tracing::instrument(skip(device, clear_color))]
    pub fn new(
        device: &GraphicsDevice,
        width: u32,
        height: u32,
        buffer_count: u32,
        format: TextureFormat,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        if buffer_count < MIN_BUFFER_COUNT {
            return Err(EmberError::configuration(format!(
                "Swap chain needs at least {} buffers, got {}",
                MIN_BUFFER_COUNT, buffer_count
            )));
        }

        let buffers = Self::create_buffers(device, width, height, buffer_count, format, clear_color)
            .map_err(|e| match e {
                // Failing to create presentable images is fatal
                EmberError::ContractViolation { message, context } => {
                    EmberError::Allocation { message, context }
                }
                other => other,
            })?;

        tracing::info!(
            "Swap chain created: {}x{} {:?}, {} buffers",
            width,
            height,
            format,
            buffer_count
        );
        Ok(Self {
            device: device.clone(),
            buffers,
            format,
            width,
            height,
            current: 0,
            present_count: 0,
            clear_color,
        })
    }

    fn create_buffers(
        device: &GraphicsDevice,
        width: u32,
        height: u32,
        count: u32,
        format: TextureFormat,
        clear_color: [f32; 4],
    ) -> Result<Vec<ColorBuffer>> {
        (0..count)
            .map(|i| {
                ColorBuffer::create_presentable(
                    device,
                    &format!("swap_chain.{}", i),
                    width,
                    height,
                    format,
                    clear_color,
                )
            })
            .collect()
    }

    /// Back buffer the current frame renders into
    pub fn current_back_buffer(&self) -> &ColorBuffer {
        &self.buffers[self.current as usize]
    }

    pub fn current_back_buffer_index(&self) -> u32 {
        self.current
    }

    pub fn buffer(&self, index: u32) -> Option<&ColorBuffer> {
        self.buffers.get(index as usize)
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffers.len() as u32
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn present_count(&self) -> u64 {
        self.present_count
    }

    /// Flip to the next buffer. The current one must have been transitioned
    /// to the present state by the frame's command list.
    pub fn present(&mut self) -> Result<()> {
        self.device.check_alive()?;
        let back_buffer = self.current_back_buffer();
        let state = back_buffer.gpu_resource().state();
        if state != ResourceState::Present {
            return Err(EmberError::contract(format!(
                "Back buffer '{}' presented in state {:?}",
                back_buffer.name(),
                state
            )));
        }

        self.current = (self.current + 1) % self.buffer_count();
        self.present_count += 1;
        Ok(())
    }

    /// Recreate the buffers at a new size; the GPU must be idle.
    /// On failure the old buffers stay in place.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == self.width && height == self.height {
            return Ok(());
        }
        let buffers = Self::create_buffers(
            &self.device,
            width,
            height,
            self.buffer_count(),
            self.format,
            self.clear_color,
        )?;
        self.buffers = buffers;
        self.width = width;
        self.height = height;
        self.current = 0;
        tracing::info!("Swap chain resized to {}x{}", width, height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::DeviceConfig;
    use pretty_assertions::assert_eq;

    fn device() -> GraphicsDevice {
        GraphicsDevice::new(DeviceConfig::default()).unwrap()
    }

    #[test]
    fn test_two_presents_return_to_first_buffer() {
        let device = device();
        let mut chain =
            SwapChain::new(&device, 64, 64, 2, TextureFormat::Rgba8UnormSrgb, [0.0; 4]).unwrap();

        let first = chain.current_back_buffer_index();
        chain.present().unwrap();
        assert_ne!(chain.current_back_buffer_index(), first);
        chain.present().unwrap();
        assert_eq!(chain.current_back_buffer_index(), first);
        assert_eq!(chain.present_count(), 2);
    }

    #[test]
    fn test_single_buffer_is_rejected() {
        let device = device();
        let err = SwapChain::new(&device, 64, 64, 1, TextureFormat::Rgba8UnormSrgb, [0.0; 4])
            .unwrap_err();
        assert!(matches!(err, EmberError::Configuration { .. }));
    }

    #[test]
    fn test_failed_creation_is_fatal() {
        let device = GraphicsDevice::new(DeviceConfig {
            memory_budget_bytes: 1024,
            ..DeviceConfig::default()
        })
        .unwrap();
        let err = SwapChain::new(&device, 64, 64, 2, TextureFormat::Rgba8UnormSrgb, [0.0; 4])
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_resize_keeps_buffer_count() {
        let device = device();
        let mut chain =
            SwapChain::new(&device, 64, 64, 3, TextureFormat::Bgra8Unorm, [0.0; 4]).unwrap();
        chain.present().unwrap();

        chain.resize(128, 96).unwrap();
        assert_eq!(chain.buffer_count(), 3);
        assert_eq!((chain.width(), chain.height()), (128, 96));
        assert_eq!(chain.current_back_buffer_index(), 0);
        assert_eq!(device.live_resource_count(), 3);
    }

    #[test]
    fn test_failed_resize_keeps_old_buffers() {
        // Room for two 64x64 BGRA buffers and little else
        let device = GraphicsDevice::new(DeviceConfig {
            memory_budget_bytes: 33 * 1024,
            ..DeviceConfig::default()
        })
        .unwrap();
        let mut chain =
            SwapChain::new(&device, 64, 64, 2, TextureFormat::Bgra8Unorm, [0.0; 4]).unwrap();
        chain.present().unwrap();

        let err = chain.resize(4096, 4096).unwrap_err();
        assert!(matches!(err, EmberError::Allocation { .. }));
        assert_eq!((chain.width(), chain.height()), (64, 64));
        assert_eq!(chain.buffer_count(), 2);
        assert_eq!(chain.current_back_buffer_index(), 1);
        assert_eq!(chain.current_back_buffer().width(), 64);
        assert_eq!(device.live_resource_count(), 2);
        assert!(!format!("{:?}", chain).is_empty());

        chain.present().unwrap();
        assert_eq!(chain.current_back_buffer_index(), 0);
    }
}
