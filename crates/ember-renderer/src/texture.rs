//! Render targets, depth buffers and sampled textures

use ember_core::{EmberError, ErrorContext, Result};
use std::path::Path;
use std::sync::Arc;
use wgpu::{TextureFormat, TextureUsages};

use crate::buffer::GpuBuffer;
use crate::command::CommandContext;
use crate::descriptor::{Descriptor, DescriptorView};
use crate::device::GraphicsDevice;
use crate::resource::{
    is_depth_format, texel_size, AsResource, GpuResource, ResourceDimension, ResourceState,
    ShaderResource,
};

fn check_extent(name: &str, width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(EmberError::contract(format!(
            "Texture '{}' must have a non-zero extent (got {}x{})",
            name, width, height
        )));
    }
    Ok(())
}

/// Color image with a render target view and a shader resource view
#[derive(Debug)]
pub struct ColorBuffer {
    name: String,
    device: GraphicsDevice,
    resource: Arc<GpuResource>,
    rtv: Descriptor,
    srv: Descriptor,
    format: TextureFormat,
    width: u32,
    height: u32,
    clear_color: [f32; 4],
}

impl ColorBuffer {
    pub fn create(
        device: &GraphicsDevice,
        name: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        Self::create_in_state(device, name, width, height, format, clear_color, ResourceState::Common)
    }

    /// Swap-chain images start out presentable
    pub(crate) fn create_presentable(
        device: &GraphicsDevice,
        name: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        Self::create_in_state(device, name, width, height, format, clear_color, ResourceState::Present)
    }

    fn create_in_state(
        device: &GraphicsDevice,
        name: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
        clear_color: [f32; 4],
        initial_state: ResourceState,
    ) -> Result<Self> {
        check_extent(name, width, height)?;
        if is_depth_format(format) {
            return Err(EmberError::contract(format!(
                "Color buffer '{}' cannot use depth format {:?}",
                name, format
            )));
        }

        let (resource, rtv, srv) =
            Self::allocate(device, name, width, height, format, initial_state)?;

        Ok(Self {
            name: name.to_string(),
            device: device.clone(),
            resource,
            rtv,
            srv,
            format,
            width,
            height,
            clear_color,
        })
    }

    fn allocate(
        device: &GraphicsDevice,
        name: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
        initial_state: ResourceState,
    ) -> Result<(Arc<GpuResource>, Descriptor, Descriptor)> {
        let resource = device.create_resource(
            name,
            ResourceDimension::Texture2D {
                width,
                height,
                format,
                usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING,
            },
            initial_state,
        )?;
        let rtv = device.create_view(
            &resource,
            DescriptorView::RenderTarget {
                resource: resource.id(),
            },
        )?;
        let srv = device.create_view(
            &resource,
            DescriptorView::ShaderResource {
                resource: resource.id(),
            },
        )?;
        Ok((resource, rtv, srv))
    }

    /// Recreate the image at a new size. Command lists still holding the old
    /// image keep it alive until they have executed.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        check_extent(&self.name, width, height)?;
        if width == self.width && height == self.height {
            return Ok(());
        }

        let initial_state = self.resource.state();
        let (resource, rtv, srv) = Self::allocate(
            &self.device,
            &self.name,
            width,
            height,
            self.format,
            initial_state,
        )?;
        self.resource = resource;
        self.rtv = rtv;
        self.srv = srv;
        self.width = width;
        self.height = height;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rtv(&self) -> Descriptor {
        self.rtv
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

    pub fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }
}

impl AsResource for ColorBuffer {
    fn gpu_resource(&self) -> &Arc<GpuResource> {
        &self.resource
    }
}

impl ShaderResource for ColorBuffer {
    fn srv(&self) -> Descriptor {
        self.srv
    }
}

/// Depth image with a depth-stencil view and a shader resource view
#[derive(Debug)]
pub struct DepthBuffer {
    name: String,
    device: GraphicsDevice,
    resource: Arc<GpuResource>,
    dsv: Descriptor,
    srv: Descriptor,
    format: TextureFormat,
    width: u32,
    height: u32,
    clear_depth: f32,
}

impl DepthBuffer {
    pub fn create(
        device: &GraphicsDevice,
        name: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<Self> {
        check_extent(name, width, height)?;
        if !is_depth_format(format) {
            return Err(EmberError::contract(format!(
                "Depth buffer '{}' needs a depth format, got {:?}",
                name, format
            )));
        }

        let (resource, dsv, srv) = Self::allocate(device, name, width, height, format)?;
        Ok(Self {
            name: name.to_string(),
            device: device.clone(),
            resource,
            dsv,
            srv,
            format,
            width,
            height,
            clear_depth: 1.0,
        })
    }

    fn allocate(
        device: &GraphicsDevice,
        name: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<(Arc<GpuResource>, Descriptor, Descriptor)> {
        let resource = device.create_resource(
            name,
            ResourceDimension::Texture2D {
                width,
                height,
                format,
                usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING,
            },
            ResourceState::DepthWrite,
        )?;
        let dsv = device.create_view(
            &resource,
            DescriptorView::DepthStencil {
                resource: resource.id(),
            },
        )?;
        let srv = device.create_view(
            &resource,
            DescriptorView::ShaderResource {
                resource: resource.id(),
            },
        )?;
        Ok((resource, dsv, srv))
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        check_extent(&self.name, width, height)?;
        if width == self.width && height == self.height {
            return Ok(());
        }

        let (resource, dsv, srv) =
            Self::allocate(&self.device, &self.name, width, height, self.format)?;
        self.resource = resource;
        self.dsv = dsv;
        self.srv = srv;
        self.width = width;
        self.height = height;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dsv(&self) -> Descriptor {
        self.dsv
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

    pub fn clear_depth(&self) -> f32 {
        self.clear_depth
    }
}

impl AsResource for DepthBuffer {
    fn gpu_resource(&self) -> &Arc<GpuResource> {
        &self.resource
    }
}

impl ShaderResource for DepthBuffer {
    fn srv(&self) -> Descriptor {
        self.srv
    }
}

/// Read-only sampled texture uploaded through a command context
#[derive(Debug)]
pub struct Texture {
    resource: Arc<GpuResource>,
    srv: Descriptor,
    width: u32,
    height: u32,
}

impl Texture {
    /// Decode an image file and record its upload on `ctx`.
    ///
    /// The context must be open; the caller closes and submits it.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn create_from_file(ctx: &mut CommandContext, path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        ctx.ensure_recording()?;

        let image = image::open(path).map_err(|e| match e {
            image::ImageError::IoError(io) => EmberError::Io(io),
            other => EmberError::image(other.to_string()).with_context(
                ErrorContext::new("create_from_file", "Texture")
                    .with_metadata("path", path.display()),
            ),
        })?;
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "texture".to_string());
        Self::create_from_rgba8(ctx, &name, width, height, rgba.as_raw())
    }

    /// Record the upload of tightly packed RGBA8 pixels on `ctx`
    pub fn create_from_rgba8(
        ctx: &mut CommandContext,
        name: &str,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Arc<Self>> {
        ctx.ensure_recording()?;
        check_extent(name, width, height)?;

        let format = TextureFormat::Rgba8Unorm;
        let expected = width as usize * height as usize * texel_size(format).unwrap_or(4) as usize;
        if pixels.len() != expected {
            return Err(EmberError::contract(format!(
                "Texture '{}' expects {} bytes of RGBA8 data, got {}",
                name,
                expected,
                pixels.len()
            )));
        }

        let device = ctx.device().clone();
        let resource = device.create_resource(
            name,
            ResourceDimension::Texture2D {
                width,
                height,
                format,
                usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            },
            ResourceState::CopyDest,
        )?;

        // The command list keeps the staging buffer alive until the copy ran
        let staging = GpuBuffer::create(&device, &format!("{}.staging", name), 4, width * height)?;
        staging.copy(pixels)?;
        ctx.copy_buffer_to_texture(&resource, &staging)?;
        ctx.transition_resource(&resource, ResourceState::PixelShaderResource)?;

        let srv = device.create_view(
            &resource,
            DescriptorView::ShaderResource {
                resource: resource.id(),
            },
        )?;

        Ok(Arc::new(Self {
            resource,
            srv,
            width,
            height,
        }))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn name(&self) -> &str {
        self.resource.name()
    }
}

impl AsResource for Texture {
    fn gpu_resource(&self) -> &Arc<GpuResource> {
        &self.resource
    }
}

impl ShaderResource for Texture {
    fn srv(&self) -> Descriptor {
        self.srv
    }
}

/// 1x1 fallback textures for materials without an image
#[derive(Debug, Clone)]
pub struct DefaultTextures {
    pub white: Arc<Texture>,
    pub black: Arc<Texture>,
    pub flat_normal: Arc<Texture>,
}

impl DefaultTextures {
    pub fn create(ctx: &mut CommandContext) -> Result<Self> {
        Ok(Self {
            white: Texture::create_from_rgba8(ctx, "default.white", 1, 1, &[255, 255, 255, 255])?,
            black: Texture::create_from_rgba8(ctx, "default.black", 1, 1, &[0, 0, 0, 255])?,
            flat_normal: Texture::create_from_rgba8(
                ctx,
                "default.flat_normal",
                1,
                1,
                &[128, 128, 255, 255],
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorHeapKind;
    use ember_core::DeviceConfig;
    use pretty_assertions::assert_eq;

    fn device() -> GraphicsDevice {
        GraphicsDevice::new(DeviceConfig::default()).unwrap()
    }

    #[test]
    fn test_color_buffer_views() {
        let device = device();
        let buffer = ColorBuffer::create(
            &device,
            "albedo",
            64,
            32,
            TextureFormat::Rgba8Unorm,
            [0.0; 4],
        )
        .unwrap();

        assert_eq!(buffer.rtv().kind, DescriptorHeapKind::Rtv);
        assert_eq!(buffer.srv().kind, DescriptorHeapKind::CbvSrvUav);
        assert_eq!(buffer.gpu_resource().size_in_bytes(), 64 * 32 * 4);
        assert_eq!(buffer.gpu_resource().state(), ResourceState::Common);
    }

    #[test]
    fn test_resize_replaces_resource() {
        let device = device();
        let mut buffer = ColorBuffer::create(
            &device,
            "lit",
            64,
            64,
            TextureFormat::Rgba16Float,
            [0.0; 4],
        )
        .unwrap();
        let old = buffer.gpu_resource().id();

        buffer.resize(128, 32).unwrap();
        assert_ne!(buffer.gpu_resource().id(), old);
        assert_eq!((buffer.width(), buffer.height()), (128, 32));
        assert_eq!(device.live_resource_count(), 1);
        assert_eq!(device.descriptor_heap_usage(DescriptorHeapKind::Rtv).live, 1);
    }

    #[test]
    fn test_format_kind_is_checked() {
        let device = device();
        assert!(ColorBuffer::create(&device, "c", 4, 4, TextureFormat::Depth32Float, [0.0; 4])
            .is_err());
        assert!(DepthBuffer::create(&device, "d", 4, 4, TextureFormat::Rgba8Unorm).is_err());
        assert!(DepthBuffer::create(&device, "d", 0, 4, TextureFormat::Depth32Float).is_err());
    }

    #[test]
    fn test_texture_upload_is_recorded() {
        let device = device();
        let mut ctx = CommandContext::new(&device, "upload");
        let texture = Texture::create_from_rgba8(&mut ctx, "checker", 2, 1, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();

        assert_eq!(texture.gpu_resource().state(), ResourceState::PixelShaderResource);
        assert_eq!(ctx.barrier_count(), 1);
        assert!(Texture::create_from_rgba8(&mut ctx, "bad", 2, 2, &[0; 4]).is_err());
    }

    #[test]
    fn test_texture_upload_requires_open_context() {
        let device = device();
        let mut ctx = CommandContext::new(&device, "upload");
        ctx.close().unwrap();
        let err = Texture::create_from_rgba8(&mut ctx, "late", 1, 1, &[0; 4]).unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let device = device();
        let mut ctx = CommandContext::new(&device, "upload");
        let err = Texture::create_from_file(&mut ctx, "/nonexistent/ember.png").unwrap_err();
        assert!(matches!(err, EmberError::Io(_)));
    }
}
