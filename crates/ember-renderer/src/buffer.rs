//! GPU buffers
//!
//! Buffers live in CPU-visible upload memory: `copy*` writes the bytes
//! immediately, and the GPU timeline reads them when a command list that
//! references the buffer executes.

use bytemuck::Pod;
use ember_core::{EmberError, ErrorContext, Result};
use std::sync::Arc;
use wgpu::{BufferUsages, IndexFormat};

use crate::descriptor::{Descriptor, DescriptorView};
use crate::device::GraphicsDevice;
use crate::resource::{AsResource, GpuResource, ResourceDimension, ResourceState};

/// Constant buffer views must start and end on this boundary
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

pub fn align_to(size: u64, alignment: u64) -> u64 {
    (size + alignment - 1) & !(alignment - 1)
}

/// A linear GPU allocation of `element_count` elements of `element_stride` bytes
#[derive(Debug, Clone)]
pub struct GpuBuffer {
    resource: Arc<GpuResource>,
    device: GraphicsDevice,
    element_stride: u32,
    element_count: u32,
    cbv: Option<Descriptor>,
}

impl GpuBuffer {
    /// Allocate exactly `stride * count` bytes
    pub fn create(device: &GraphicsDevice, name: &str, stride: u32, count: u32) -> Result<Self> {
        Self::create_with_usage(
            device,
            name,
            stride,
            count,
            BufferUsages::VERTEX | BufferUsages::INDEX | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
        )
    }

    fn create_with_usage(
        device: &GraphicsDevice,
        name: &str,
        stride: u32,
        count: u32,
        usage: BufferUsages,
    ) -> Result<Self> {
        if stride == 0 || count == 0 {
            return Err(EmberError::contract(format!(
                "Buffer '{}' needs a non-zero stride and count (got {} x {})",
                name, stride, count
            )));
        }

        let size = stride as u64 * count as u64;
        let resource = device.create_resource(
            name,
            ResourceDimension::Buffer { size, usage },
            ResourceState::GenericRead,
        )?;

        Ok(Self {
            resource,
            device: device.clone(),
            element_stride: stride,
            element_count: count,
            cbv: None,
        })
    }

    /// Constant buffer of at least `size` bytes, rounded up to 256, with a CBV
    pub fn create_constant_buffer(device: &GraphicsDevice, name: &str, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(EmberError::contract(format!(
                "Constant buffer '{}' has zero size",
                name
            )));
        }
        let aligned = align_to(size, CONSTANT_BUFFER_ALIGNMENT);
        let count = u32::try_from(aligned / CONSTANT_BUFFER_ALIGNMENT).map_err(|_| {
            EmberError::contract(format!("Constant buffer '{}' is too large", name))
        })?;

        let mut buffer = Self::create_with_usage(
            device,
            name,
            CONSTANT_BUFFER_ALIGNMENT as u32,
            count,
            BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        )?;
        let cbv = device.create_view(
            &buffer.resource,
            DescriptorView::ConstantBuffer {
                resource: buffer.resource.id(),
                offset: 0,
                size: aligned,
            },
        )?;
        buffer.cbv = Some(cbv);
        Ok(buffer)
    }

    /// Write `data` at the start of the buffer
    pub fn copy(&self, data: &[u8]) -> Result<()> {
        self.copy_at(0, data)
    }

    /// Write `data` at `offset`; fails when it would run past the allocation
    pub fn copy_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > self.buffer_size()) {
            return Err(EmberError::contract(format!(
                "Copy of {} bytes at offset {} exceeds buffer '{}' of {} bytes",
                data.len(),
                offset,
                self.resource.name(),
                self.buffer_size()
            ))
            .with_context(
                ErrorContext::new("copy", "GpuBuffer")
                    .with_metadata("buffer", self.resource.name())
                    .with_metadata("size", self.buffer_size()),
            ));
        }
        self.device.write_buffer(&self.resource, offset, data)
    }

    pub fn copy_pod<T: Pod>(&self, value: &T) -> Result<()> {
        self.copy(bytemuck::bytes_of(value))
    }

    pub fn copy_slice<T: Pod>(&self, values: &[T]) -> Result<()> {
        self.copy(bytemuck::cast_slice(values))
    }

    /// Total allocation in bytes
    pub fn buffer_size(&self) -> u64 {
        self.resource.size_in_bytes()
    }

    pub fn element_stride(&self) -> u32 {
        self.element_stride
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    /// Constant buffer view, present for buffers made by `create_constant_buffer`
    pub fn cbv(&self) -> Option<Descriptor> {
        self.cbv
    }

    /// Snapshot of the buffer contents as seen by the GPU timeline
    pub fn read_back(&self) -> Vec<u8> {
        self.device.read_resource(&self.resource)
    }
}

impl AsResource for GpuBuffer {
    fn gpu_resource(&self) -> &Arc<GpuResource> {
        &self.resource
    }
}

/// Vertex data uploaded once at creation
#[derive(Debug, Clone)]
pub struct VertexBuffer {
    buffer: GpuBuffer,
}

impl VertexBuffer {
    pub fn create<V: Pod>(device: &GraphicsDevice, name: &str, vertices: &[V]) -> Result<Self> {
        let count = u32::try_from(vertices.len())
            .map_err(|_| EmberError::contract(format!("Too many vertices in '{}'", name)))?;
        let buffer = GpuBuffer::create(device, name, std::mem::size_of::<V>() as u32, count)?;
        buffer.copy_slice(vertices)?;
        Ok(Self { buffer })
    }

    pub fn stride(&self) -> u32 {
        self.buffer.element_stride()
    }

    pub fn vertex_count(&self) -> u32 {
        self.buffer.element_count()
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }
}

impl AsResource for VertexBuffer {
    fn gpu_resource(&self) -> &Arc<GpuResource> {
        self.buffer.gpu_resource()
    }
}

/// Index data uploaded once at creation
#[derive(Debug, Clone)]
pub struct IndexBuffer {
    buffer: GpuBuffer,
    format: IndexFormat,
}

impl IndexBuffer {
    pub fn create_u16(device: &GraphicsDevice, name: &str, indices: &[u16]) -> Result<Self> {
        Self::create(device, name, indices, IndexFormat::Uint16)
    }

    pub fn create_u32(device: &GraphicsDevice, name: &str, indices: &[u32]) -> Result<Self> {
        Self::create(device, name, indices, IndexFormat::Uint32)
    }

    fn create<I: Pod>(
        device: &GraphicsDevice,
        name: &str,
        indices: &[I],
        format: IndexFormat,
    ) -> Result<Self> {
        let count = u32::try_from(indices.len())
            .map_err(|_| EmberError::contract(format!("Too many indices in '{}'", name)))?;
        let buffer = GpuBuffer::create(device, name, std::mem::size_of::<I>() as u32, count)?;
        buffer.copy_slice(indices)?;
        Ok(Self { buffer, format })
    }

    pub fn format(&self) -> IndexFormat {
        self.format
    }

    pub fn index_count(&self) -> u32 {
        self.buffer.element_count()
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }
}

impl AsResource for IndexBuffer {
    fn gpu_resource(&self) -> &Arc<GpuResource> {
        self.buffer.gpu_resource()
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
    fn test_buffer_size_is_stride_times_count() {
        let device = device();
        let buffer = GpuBuffer::create(&device, "verts", 32, 100).unwrap();
        assert_eq!(buffer.buffer_size(), 3200);
        assert_eq!(buffer.element_stride(), 32);
        assert_eq!(buffer.element_count(), 100);

        assert!(buffer.copy(&[1u8; 3200]).is_ok());
        let err = buffer.copy(&[1u8; 3201]).unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_copy_at_checks_offset() {
        let device = device();
        let buffer = GpuBuffer::create(&device, "small", 4, 4).unwrap();
        buffer.copy_at(8, &[7u8; 8]).unwrap();
        assert!(buffer.copy_at(9, &[7u8; 8]).is_err());
        assert!(buffer.copy_at(u64::MAX, &[7u8; 1]).is_err());

        let bytes = buffer.read_back();
        assert_eq!(&bytes[..8], &[0u8; 8]);
        assert_eq!(&bytes[8..], &[7u8; 8]);
    }

    #[test]
    fn test_constant_buffer_alignment() {
        let device = device();
        let cb = GpuBuffer::create_constant_buffer(&device, "material", 48).unwrap();
        assert_eq!(cb.buffer_size(), 256);
        assert!(cb.cbv().is_some());

        let cb = GpuBuffer::create_constant_buffer(&device, "scene", 300).unwrap();
        assert_eq!(cb.buffer_size(), 512);

        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(1, 256), 256);
    }

    #[test]
    fn test_zero_sized_buffer_is_rejected() {
        let device = device();
        assert!(GpuBuffer::create(&device, "empty", 0, 10).is_err());
        assert!(GpuBuffer::create_constant_buffer(&device, "empty", 0).is_err());
    }

    #[test]
    fn test_typed_buffers() {
        let device = device();
        let vertices = [[0.0f32; 3]; 3];
        let vb = VertexBuffer::create(&device, "tri", &vertices).unwrap();
        assert_eq!(vb.stride(), 12);
        assert_eq!(vb.vertex_count(), 3);

        let ib = IndexBuffer::create_u16(&device, "tri-idx", &[0, 1, 2]).unwrap();
        assert_eq!(ib.format(), IndexFormat::Uint16);
        assert_eq!(ib.index_count(), 3);
        assert_eq!(ib.buffer().buffer_size(), 6);
    }
}
