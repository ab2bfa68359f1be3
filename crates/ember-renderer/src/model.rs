//! Models, meshes and materials

use bytemuck::{Pod, Zeroable};
use ember_core::{ember_info, EmberError, ErrorContext, LogCategory, Result};
use glam::Vec3;
use std::path::PathBuf;
use std::sync::Arc;
use wgpu::VertexFormat;

use crate::buffer::{GpuBuffer, IndexBuffer, VertexBuffer};
use crate::command::CommandContext;
use crate::device::GraphicsDevice;
use crate::pipeline::VertexAttribute;
use crate::queue::CommandQueue;
use crate::resource::ShaderResource;
use crate::sampler::SamplerKind;
use crate::texture::{DefaultTextures, Texture};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub texcoord: [f32; 2],
}

impl Vertex {
    pub fn new(position: [f32; 3], normal: [f32; 3], texcoord: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            texcoord,
        }
    }

    pub fn layout() -> Vec<VertexAttribute> {
        vec![
            VertexAttribute {
                semantic: "POSITION",
                format: VertexFormat::Float32x3,
                offset: 0,
            },
            VertexAttribute {
                semantic: "NORMAL",
                format: VertexFormat::Float32x3,
                offset: 12,
            },
            VertexAttribute {
                semantic: "TEXCOORD",
                format: VertexFormat::Float32x2,
                offset: 24,
            },
        ]
    }
}

/// Material constant buffer layout
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialConstants {
    pub diffuse: [f32; 3],
    pub metallic: f32,
    pub specular: [f32; 3],
    pub roughness: f32,
    /// Index of the texture's SRV in the shader-visible heap
    pub texture_index: u32,
    pub sampler_index: u32,
    pub _pad: [u32; 2],
}

/// Shading inputs of one material
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialDesc {
    pub diffuse: Vec3,
    pub specular: Vec3,
    pub metallic: f32,
    pub roughness: f32,
}

impl Default for MaterialDesc {
    fn default() -> Self {
        Self {
            diffuse: Vec3::ONE,
            specular: Vec3::splat(0.5),
            metallic: 0.0,
            roughness: 0.5,
        }
    }
}

/// Constant buffer plus texture, shared by every mesh that uses it
#[derive(Debug)]
pub struct Material {
    constant_buffer: GpuBuffer,
    texture: Arc<Texture>,
    constants: MaterialConstants,
}

impl Material {
    pub fn create(
        device: &GraphicsDevice,
        name: &str,
        desc: &MaterialDesc,
        texture: Arc<Texture>,
        sampler: SamplerKind,
    ) -> Result<Arc<Self>> {
        let constants = MaterialConstants {
            diffuse: desc.diffuse.to_array(),
            metallic: desc.metallic,
            specular: desc.specular.to_array(),
            roughness: desc.roughness,
            texture_index: texture.srv().index,
            sampler_index: sampler.table_index(),
            _pad: [0; 2],
        };

        let constant_buffer = GpuBuffer::create_constant_buffer(
            device,
            name,
            std::mem::size_of::<MaterialConstants>() as u64,
        )?;
        constant_buffer.copy_pod(&constants)?;

        Ok(Arc::new(Self {
            constant_buffer,
            texture,
            constants,
        }))
    }

    pub fn constant_buffer(&self) -> &GpuBuffer {
        &self.constant_buffer
    }

    pub fn texture(&self) -> &Arc<Texture> {
        &self.texture
    }

    pub fn constants(&self) -> &MaterialConstants {
        &self.constants
    }
}

#[derive(Debug)]
pub struct Mesh {
    vertex_buffer: VertexBuffer,
    index_buffer: IndexBuffer,
    material: Arc<Material>,
}

impl Mesh {
    pub fn vertex_buffer(&self) -> &VertexBuffer {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &IndexBuffer {
        &self.index_buffer
    }

    pub fn index_count(&self) -> u32 {
        self.index_buffer.index_count()
    }

    pub fn material(&self) -> &Arc<Material> {
        &self.material
    }
}

/// Where a model texture comes from
#[derive(Debug, Clone)]
pub enum TextureSource {
    File(PathBuf),
    Rgba8 {
        name: String,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    },
    /// Placeholder slot; materials pointing here use the default texture
    None,
}

#[derive(Debug, Clone)]
pub struct MaterialData {
    pub desc: MaterialDesc,
    pub texture_index: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub material_index: usize,
}

/// CPU-side model as produced by an asset loader
#[derive(Debug, Clone, Default)]
pub struct ModelData {
    pub name: String,
    pub textures: Vec<TextureSource>,
    pub materials: Vec<MaterialData>,
    pub meshes: Vec<MeshData>,
}

#[derive(Debug)]
pub struct Model {
    name: String,
    meshes: Vec<Mesh>,
}

impl Model {
    /// Build every texture, material and mesh of `data`.
    ///
    /// Texture uploads are recorded on one context that is submitted and
    /// waited on before returning, so the model is ready to draw.
    #[tracing::instrument(skip_all, fields(model = %data.name))]
    pub fn create(
        device: &GraphicsDevice,
        queue: &mut CommandQueue,
        defaults: &DefaultTextures,
        data: &ModelData,
    ) -> Result<Arc<Self>> {
        if let Some((i, mesh)) = data
            .meshes
            .iter()
            .enumerate()
            .find(|(_, mesh)| mesh.material_index >= data.materials.len())
        {
            return Err(EmberError::contract(format!(
                "Mesh {} of '{}' uses material {} but only {} exist",
                i,
                data.name,
                mesh.material_index,
                data.materials.len()
            ))
            .with_context(ErrorContext::new("create", "Model").with_metadata("model", &data.name)));
        }

        let mut ctx = CommandContext::new(device, &format!("{}.upload", data.name));

        let mut textures = Vec::with_capacity(data.textures.len());
        for source in &data.textures {
            let texture = match source {
                TextureSource::File(path) => Some(Texture::create_from_file(&mut ctx, path)?),
                TextureSource::Rgba8 {
                    name,
                    width,
                    height,
                    pixels,
                } => Some(Texture::create_from_rgba8(&mut ctx, name, *width, *height, pixels)?),
                TextureSource::None => None,
            };
            textures.push(texture);
        }

        let mut materials = Vec::with_capacity(data.materials.len());
        for (i, source) in data.materials.iter().enumerate() {
            let texture = source
                .texture_index
                .and_then(|index| textures.get(index).cloned().flatten())
                .unwrap_or_else(|| defaults.white.clone());
            materials.push(Material::create(
                device,
                &format!("{}.material{}", data.name, i),
                &source.desc,
                texture,
                SamplerKind::AnisotropicWrap,
            )?);
        }

        let mut meshes = Vec::with_capacity(data.meshes.len());
        for (i, source) in data.meshes.iter().enumerate() {
            meshes.push(Mesh {
                vertex_buffer: VertexBuffer::create(
                    device,
                    &format!("{}.mesh{}.vertices", data.name, i),
                    &source.vertices,
                )?,
                index_buffer: IndexBuffer::create_u32(
                    device,
                    &format!("{}.mesh{}.indices", data.name, i),
                    &source.indices,
                )?,
                material: materials[source.material_index].clone(),
            });
        }

        ctx.close()?;
        queue.execute(&mut ctx)?;
        queue.wait_for_idle()?;

        ember_info!(
            LogCategory::Resource,
            "Model '{}' created: {} meshes, {} materials, {} textures",
            data.name,
            meshes.len(),
            materials.len(),
            textures.len()
        );
        Ok(Arc::new(Self {
            name: data.name.clone(),
            meshes,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meshes(&self) -> &[Mesh] {
        &self.meshes
    }
}

/// Unit quad in the XY plane facing -Z
pub fn quad_model_data(name: &str) -> ModelData {
    let normal = [0.0, 0.0, -1.0];
    ModelData {
        name: name.to_string(),
        textures: Vec::new(),
        materials: vec![MaterialData {
            desc: MaterialDesc::default(),
            texture_index: None,
        }],
        meshes: vec![MeshData {
            vertices: vec![
                Vertex::new([-0.5, -0.5, 0.0], normal, [0.0, 1.0]),
                Vertex::new([-0.5, 0.5, 0.0], normal, [0.0, 0.0]),
                Vertex::new([0.5, 0.5, 0.0], normal, [1.0, 0.0]),
                Vertex::new([0.5, -0.5, 0.0], normal, [1.0, 1.0]),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
            material_index: 0,
        }],
    }
}
