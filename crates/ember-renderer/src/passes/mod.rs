//! Rendering passes
//!
//! Every pass follows the same lifecycle: `initialize` exactly once,
//! `render` any number of times while initialized, `finalize` to release
//! its outputs. Per-frame constants live in fixed rings sized at
//! initialization, so recording a frame never allocates GPU memory.

pub mod composite;
pub mod geometry;
pub mod lighting;

pub use composite::CompositePass;
pub use geometry::{GBuffer, GeometryRenderingPass};
pub use lighting::LightingRenderingPass;

use bytemuck::{Pod, Zeroable};
use ember_core::{EmberError, ErrorContext, Result};
use glam::Mat4;

use crate::buffer::{GpuBuffer, CONSTANT_BUFFER_ALIGNMENT};
use crate::camera::{Camera, DirectionalLight};
use crate::device::GraphicsDevice;
use crate::resource::AsResource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Uninitialized,
    Initialized,
    Finalized,
}

impl PassState {
    pub(crate) fn ensure_uninitialized(self, pass: &str) -> Result<()> {
        match self {
            PassState::Uninitialized => Ok(()),
            other => Err(EmberError::contract(format!(
                "{} initialized twice (state {:?})",
                pass, other
            ))),
        }
    }

    pub(crate) fn ensure_initialized(self, pass: &str) -> Result<()> {
        match self {
            PassState::Initialized => Ok(()),
            other => Err(EmberError::contract(format!(
                "{} used while {:?}",
                pass, other
            ))
            .with_context(ErrorContext::new("render", pass))),
        }
    }
}

/// Per-frame constants shared by the geometry and lighting passes
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneConstants {
    pub view_projection: [[f32; 4]; 4],
    pub inverse_view_projection: [[f32; 4]; 4],
    pub camera_position: [f32; 3],
    pub near_clip: f32,
    pub light_direction: [f32; 3],
    pub light_intensity: f32,
    pub light_color: [f32; 3],
    pub far_clip: f32,
}

impl SceneConstants {
    pub fn new(camera: &Camera, light: &DirectionalLight) -> Self {
        let view_projection = camera.view_projection();
        Self {
            view_projection: view_projection.to_cols_array_2d(),
            inverse_view_projection: view_projection.inverse().to_cols_array_2d(),
            camera_position: camera.position().to_array(),
            near_clip: camera.near_clip(),
            light_direction: light.direction.to_array(),
            light_intensity: light.intensity,
            light_color: light.color.to_array(),
            far_clip: camera.far_clip(),
        }
    }
}

/// Per-draw transform constants
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceConstants {
    pub world: [[f32; 4]; 4],
    pub world_inverse_transpose: [[f32; 4]; 4],
}

impl InstanceConstants {
    pub fn new(world: Mat4) -> Self {
        Self {
            world: world.to_cols_array_2d(),
            world_inverse_transpose: world.inverse().transpose().to_cols_array_2d(),
        }
    }
}

/// Constant buffer split into `frames` regions of `slots` 256-byte slots.
///
/// Region `frame % frames` is rewritten each frame; the render manager's
/// frame fence guarantees the GPU is done with it.
#[derive(Debug)]
pub struct FrameConstantRing {
    buffer: GpuBuffer,
    frames: u32,
    slots: u32,
    region: u32,
    cursor: u32,
}

impl FrameConstantRing {
    pub fn new(device: &GraphicsDevice, name: &str, frames: u32, slots: u32) -> Result<Self> {
        if frames == 0 || slots == 0 {
            return Err(EmberError::contract(format!(
                "Constant ring '{}' needs at least one frame and slot",
                name
            )));
        }
        let size = frames as u64 * slots as u64 * CONSTANT_BUFFER_ALIGNMENT;
        let buffer = GpuBuffer::create_constant_buffer(device, name, size)?;
        Ok(Self {
            buffer,
            frames,
            slots,
            region: 0,
            cursor: 0,
        })
    }

    /// Start writing the region of `frame_index`
    pub fn begin_frame(&mut self, frame_index: u64) {
        self.region = (frame_index % self.frames as u64) as u32;
        self.cursor = 0;
    }

    /// Write `value` into the next slot and return its byte offset
    pub fn push<T: Pod>(&mut self, value: &T) -> Result<u64> {
        let size = std::mem::size_of::<T>() as u64;
        if size > CONSTANT_BUFFER_ALIGNMENT {
            return Err(EmberError::contract(format!(
                "{} byte constants do not fit a {} byte slot",
                size, CONSTANT_BUFFER_ALIGNMENT
            )));
        }
        if self.cursor >= self.slots {
            return Err(EmberError::capacity(format!(
                "Constant ring '{}' is out of slots ({} per frame)",
                self.buffer.gpu_resource().name(),
                self.slots
            )));
        }

        let slot = self.region as u64 * self.slots as u64 + self.cursor as u64;
        let offset = slot * CONSTANT_BUFFER_ALIGNMENT;
        self.buffer.copy_at(offset, bytemuck::bytes_of(value))?;
        self.cursor += 1;
        Ok(offset)
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    pub fn slots_per_frame(&self) -> u32 {
        self.slots
    }

    pub fn used_slots(&self) -> u32 {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::DeviceConfig;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_constant_sizes_fit_slots() {
        assert_eq!(std::mem::size_of::<SceneConstants>(), 176);
        assert_eq!(std::mem::size_of::<InstanceConstants>(), 128);
    }

    #[test]
    fn test_ring_regions_do_not_overlap() {
        let device = GraphicsDevice::new(DeviceConfig::default()).unwrap();
        let mut ring = FrameConstantRing::new(&device, "ring", 2, 2).unwrap();
        assert_eq!(ring.buffer().buffer_size(), 4 * 256);

        ring.begin_frame(0);
        assert_eq!(ring.push(&1u32).unwrap(), 0);
        assert_eq!(ring.push(&2u32).unwrap(), 256);
        let err = ring.push(&3u32).unwrap_err();
        assert!(matches!(err, EmberError::CapacityExceeded { .. }));

        ring.begin_frame(1);
        assert_eq!(ring.push(&4u32).unwrap(), 512);

        ring.begin_frame(2);
        assert_eq!(ring.push(&5u32).unwrap(), 0);
        assert_eq!(ring.used_slots(), 1);
    }

    #[test]
    fn test_pass_state_guards() {
        assert!(PassState::Uninitialized.ensure_uninitialized("pass").is_ok());
        assert!(PassState::Initialized.ensure_uninitialized("pass").is_err());
        assert!(PassState::Uninitialized
            .ensure_initialized("pass")
            .unwrap_err()
            .is_contract_violation());
        assert!(PassState::Finalized.ensure_initialized("pass").is_err());
    }
}
