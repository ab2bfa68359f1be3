//! GPU resource objects and their usage states
//!
//! Every buffer and image the renderer owns is backed by one [`GpuResource`].
//! Resources are shared through `Arc`: command lists that reference a
//! resource keep it alive until the GPU timeline has executed them, so the
//! last holder to let go is the one that frees the storage, the memory
//! budget and the view descriptors.

use ember_core::{EmberError, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use wgpu::{BufferUsages, TextureFormat, TextureUsages};

use crate::descriptor::Descriptor;
use crate::device::DeviceShared;

slotmap::new_key_type! {
    /// Key of a resource in the device storage arena
    pub struct ResourceId;
}

/// Usage state of a resource, mirrors the states a barrier transitions between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    VertexAndConstantBuffer,
    IndexBuffer,
    RenderTarget,
    DepthWrite,
    DepthRead,
    PixelShaderResource,
    CopyDest,
    CopySource,
    GenericRead,
    Present,
}

impl ResourceState {
    /// States in which a shader may sample the resource
    pub fn is_shader_readable(self) -> bool {
        matches!(
            self,
            ResourceState::PixelShaderResource | ResourceState::DepthRead | ResourceState::GenericRead
        )
    }
}

/// Shape of a resource
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceDimension {
    Buffer {
        size: u64,
        usage: BufferUsages,
    },
    Texture2D {
        width: u32,
        height: u32,
        format: TextureFormat,
        usage: TextureUsages,
    },
}

impl ResourceDimension {
    /// Bytes the resource occupies in device memory
    pub fn size_in_bytes(&self) -> Result<u64> {
        match *self {
            ResourceDimension::Buffer { size, .. } => Ok(size),
            ResourceDimension::Texture2D {
                width,
                height,
                format,
                ..
            } => {
                let texel = texel_size(format).ok_or_else(|| {
                    EmberError::contract(format!("Unsupported texture format {:?}", format))
                })?;
                Ok(width as u64 * height as u64 * texel as u64)
            }
        }
    }

    /// Texture extent, `None` for buffers
    pub fn extent(&self) -> Option<(u32, u32)> {
        match *self {
            ResourceDimension::Texture2D { width, height, .. } => Some((width, height)),
            ResourceDimension::Buffer { .. } => None,
        }
    }

    pub fn format(&self) -> Option<TextureFormat> {
        match *self {
            ResourceDimension::Texture2D { format, .. } => Some(format),
            ResourceDimension::Buffer { .. } => None,
        }
    }
}

/// Size in bytes of one texel of the formats the renderer allocates
pub fn texel_size(format: TextureFormat) -> Option<u32> {
    use TextureFormat::*;
    match format {
        R8Unorm => Some(1),
        Rg8Unorm | Depth16Unorm => Some(2),
        Rgba8Unorm | Rgba8UnormSrgb | Bgra8Unorm | Bgra8UnormSrgb | Rgb10a2Unorm | Rg16Float
        | R32Float | Depth32Float | Depth24PlusStencil8 => Some(4),
        Rgba16Float | Rg32Float => Some(8),
        Rgba32Float => Some(16),
        _ => None,
    }
}

/// Whether the format can back a depth-stencil view
pub fn is_depth_format(format: TextureFormat) -> bool {
    matches!(
        format,
        TextureFormat::Depth16Unorm
            | TextureFormat::Depth24Plus
            | TextureFormat::Depth24PlusStencil8
            | TextureFormat::Depth32Float
            | TextureFormat::Depth32FloatStencil8
    )
}

/// Parse the swap-chain format names accepted in configuration files
pub fn parse_texture_format(name: &str) -> Result<TextureFormat> {
    match name {
        "Rgba8Unorm" => Ok(TextureFormat::Rgba8Unorm),
        "Rgba8UnormSrgb" => Ok(TextureFormat::Rgba8UnormSrgb),
        "Bgra8Unorm" => Ok(TextureFormat::Bgra8Unorm),
        "Bgra8UnormSrgb" => Ok(TextureFormat::Bgra8UnormSrgb),
        "Rgb10a2Unorm" => Ok(TextureFormat::Rgb10a2Unorm),
        "Rgba16Float" => Ok(TextureFormat::Rgba16Float),
        other => Err(EmberError::configuration(format!(
            "Unsupported back buffer format '{}'",
            other
        ))),
    }
}

/// A device allocation: buffer or 2D image
pub struct GpuResource {
    id: ResourceId,
    name: String,
    dimension: ResourceDimension,
    size_in_bytes: u64,
    state: Mutex<ResourceState>,
    views: Mutex<SmallVec<[Descriptor; 3]>>,
    device: Arc<DeviceShared>,
}

impl GpuResource {
    pub(crate) fn new(
        id: ResourceId,
        name: String,
        dimension: ResourceDimension,
        size_in_bytes: u64,
        initial_state: ResourceState,
        device: Arc<DeviceShared>,
    ) -> Self {
        Self {
            id,
            name,
            dimension,
            size_in_bytes,
            state: Mutex::new(initial_state),
            views: Mutex::new(SmallVec::new()),
            device,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> &ResourceDimension {
        &self.dimension
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    /// Last state recorded for this resource by any command context
    pub fn state(&self) -> ResourceState {
        *self.state.lock()
    }

    /// Replace the tracked state, returning the previous one
    pub(crate) fn swap_state(&self, next: ResourceState) -> ResourceState {
        std::mem::replace(&mut *self.state.lock(), next)
    }

    /// Tie a view descriptor to this resource; it is freed with the resource
    pub(crate) fn attach_view(&self, descriptor: Descriptor) {
        self.views.lock().push(descriptor);
    }

    /// View descriptors created for this resource
    pub fn views(&self) -> SmallVec<[Descriptor; 3]> {
        self.views.lock().clone()
    }
}

impl fmt::Debug for GpuResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuResource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dimension", &self.dimension)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for GpuResource {
    fn drop(&mut self) {
        let views = std::mem::take(&mut *self.views.lock());
        self.device
            .release_resource(self.id, self.size_in_bytes, &self.name, &views);
    }
}

/// Anything that wraps a [`GpuResource`]
pub trait AsResource {
    fn gpu_resource(&self) -> &Arc<GpuResource>;
}

impl AsResource for Arc<GpuResource> {
    fn gpu_resource(&self) -> &Arc<GpuResource> {
        self
    }
}

/// Resources that expose a shader resource view
pub trait ShaderResource: AsResource {
    fn srv(&self) -> Descriptor;
}
