//! Root signatures and pipeline state objects
//!
//! Both are immutable once built and shared as `Arc` by every frame that
//! binds them.

use ember_core::{EmberError, Result};
use smallvec::SmallVec;
use std::sync::Arc;
use wgpu::{BlendState, CompareFunction, Face, PrimitiveTopology, TextureFormat, VertexFormat};

use crate::descriptor::DescriptorHeapKind;
use crate::resource::is_depth_format;
use crate::sampler::SamplerDesc;

/// Root signatures may not cost more than 64 DWORDs
pub const MAX_ROOT_SIGNATURE_COST: u32 = 64;
pub const MAX_RENDER_TARGETS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderVisibility {
    All,
    Vertex,
    Pixel,
}

/// Kind of descriptors a table range holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorRangeKind {
    Srv,
    Cbv,
    Uav,
    Sampler,
}

impl DescriptorRangeKind {
    pub fn heap_kind(self) -> DescriptorHeapKind {
        match self {
            DescriptorRangeKind::Sampler => DescriptorHeapKind::Sampler,
            _ => DescriptorHeapKind::CbvSrvUav,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RootParameter {
    /// Root constant buffer view at register `b{register}`
    ConstantBufferView {
        register: u32,
        visibility: ShaderVisibility,
    },
    /// Table of `count` descriptors starting at `base_register`; `None` is unbounded
    DescriptorTable {
        kind: DescriptorRangeKind,
        base_register: u32,
        count: Option<u32>,
        visibility: ShaderVisibility,
    },
}

impl RootParameter {
    /// Cost in DWORDs
    fn cost(&self) -> u32 {
        match self {
            RootParameter::ConstantBufferView { .. } => 2,
            RootParameter::DescriptorTable { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaticSampler {
    pub register: u32,
    pub desc: SamplerDesc,
    pub visibility: ShaderVisibility,
}

#[derive(Debug)]
pub struct RootSignature {
    name: String,
    parameters: Vec<RootParameter>,
    static_samplers: Vec<StaticSampler>,
}

impl RootSignature {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[RootParameter] {
        &self.parameters
    }

    pub fn parameter(&self, index: u32) -> Option<&RootParameter> {
        self.parameters.get(index as usize)
    }

    pub fn static_samplers(&self) -> &[StaticSampler] {
        &self.static_samplers
    }
}

#[derive(Debug, Default)]
pub struct RootSignatureBuilder {
    name: String,
    parameters: Vec<RootParameter>,
    static_samplers: Vec<StaticSampler>,
}

impl RootSignatureBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn constant_buffer(mut self, register: u32, visibility: ShaderVisibility) -> Self {
        self.parameters.push(RootParameter::ConstantBufferView {
            register,
            visibility,
        });
        self
    }

    pub fn descriptor_table(
        mut self,
        kind: DescriptorRangeKind,
        base_register: u32,
        count: Option<u32>,
        visibility: ShaderVisibility,
    ) -> Self {
        self.parameters.push(RootParameter::DescriptorTable {
            kind,
            base_register,
            count,
            visibility,
        });
        self
    }

    pub fn static_sampler(
        mut self,
        register: u32,
        desc: SamplerDesc,
        visibility: ShaderVisibility,
    ) -> Self {
        self.static_samplers.push(StaticSampler {
            register,
            desc,
            visibility,
        });
        self
    }

    pub fn build(self) -> Result<Arc<RootSignature>> {
        let cost: u32 = self.parameters.iter().map(RootParameter::cost).sum();
        if cost > MAX_ROOT_SIGNATURE_COST {
            return Err(EmberError::contract(format!(
                "Root signature '{}' costs {} DWORDs (max {})",
                self.name, cost, MAX_ROOT_SIGNATURE_COST
            )));
        }

        let mut registers: SmallVec<[u32; 8]> = SmallVec::new();
        for parameter in &self.parameters {
            match parameter {
                RootParameter::ConstantBufferView { register, .. } => {
                    if registers.contains(register) {
                        return Err(EmberError::contract(format!(
                            "Root signature '{}' binds b{} twice",
                            self.name, register
                        )));
                    }
                    registers.push(*register);
                }
                RootParameter::DescriptorTable { count: Some(0), .. } => {
                    return Err(EmberError::contract(format!(
                        "Root signature '{}' has an empty descriptor table",
                        self.name
                    )));
                }
                RootParameter::DescriptorTable { .. } => {}
            }
        }

        tracing::debug!(
            "Built root signature '{}' with {} parameters",
            self.name,
            self.parameters.len()
        );
        Ok(Arc::new(RootSignature {
            name: self.name,
            parameters: self.parameters,
            static_samplers: self.static_samplers,
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexAttribute {
    pub semantic: &'static str,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthState {
    pub format: TextureFormat,
    pub write_enabled: bool,
    pub compare: CompareFunction,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerState {
    pub cull_mode: Option<Face>,
    pub wireframe: bool,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            cull_mode: Some(Face::Back),
            wireframe: false,
        }
    }
}

#[derive(Debug)]
pub struct PipelineState {
    name: String,
    root_signature: Arc<RootSignature>,
    vertex_shader: String,
    pixel_shader: String,
    input_layout: Vec<VertexAttribute>,
    blend: Option<BlendState>,
    rasterizer: RasterizerState,
    depth: Option<DepthState>,
    render_target_formats: SmallVec<[TextureFormat; MAX_RENDER_TARGETS]>,
    topology: PrimitiveTopology,
}

impl PipelineState {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_signature(&self) -> &Arc<RootSignature> {
        &self.root_signature
    }

    pub fn vertex_shader(&self) -> &str {
        &self.vertex_shader
    }

    pub fn pixel_shader(&self) -> &str {
        &self.pixel_shader
    }

    pub fn input_layout(&self) -> &[VertexAttribute] {
        &self.input_layout
    }

    pub fn blend(&self) -> Option<BlendState> {
        self.blend
    }

    pub fn rasterizer(&self) -> RasterizerState {
        self.rasterizer
    }

    pub fn depth(&self) -> Option<DepthState> {
        self.depth
    }

    pub fn render_target_formats(&self) -> &[TextureFormat] {
        &self.render_target_formats
    }

    pub fn topology(&self) -> PrimitiveTopology {
        self.topology
    }
}

pub struct PipelineStateBuilder {
    name: String,
    root_signature: Arc<RootSignature>,
    vertex_shader: String,
    pixel_shader: String,
    input_layout: Vec<VertexAttribute>,
    blend: Option<BlendState>,
    rasterizer: RasterizerState,
    depth: Option<DepthState>,
    render_target_formats: SmallVec<[TextureFormat; MAX_RENDER_TARGETS]>,
    topology: PrimitiveTopology,
}

impl PipelineStateBuilder {
    pub fn new(name: &str, root_signature: &Arc<RootSignature>) -> Self {
        Self {
            name: name.to_string(),
            root_signature: root_signature.clone(),
            vertex_shader: String::new(),
            pixel_shader: String::new(),
            input_layout: Vec::new(),
            blend: None,
            rasterizer: RasterizerState::default(),
            depth: None,
            render_target_formats: SmallVec::new(),
            topology: PrimitiveTopology::TriangleList,
        }
    }

    pub fn shaders(mut self, vertex: &str, pixel: &str) -> Self {
        self.vertex_shader = vertex.to_string();
        self.pixel_shader = pixel.to_string();
        self
    }

    pub fn input_layout(mut self, layout: Vec<VertexAttribute>) -> Self {
        self.input_layout = layout;
        self
    }

    pub fn blend(mut self, blend: BlendState) -> Self {
        self.blend = Some(blend);
        self
    }

    pub fn rasterizer(mut self, rasterizer: RasterizerState) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    pub fn depth(mut self, depth: DepthState) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn render_target_formats(mut self, formats: &[TextureFormat]) -> Self {
        self.render_target_formats = formats.iter().copied().collect();
        self
    }

    pub fn topology(mut self, topology: PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn build(self) -> Result<Arc<PipelineState>> {
        if self.vertex_shader.is_empty() || self.pixel_shader.is_empty() {
            return Err(EmberError::contract(format!(
                "Pipeline '{}' is missing a shader",
                self.name
            )));
        }
        if self.render_target_formats.len() > MAX_RENDER_TARGETS {
            return Err(EmberError::contract(format!(
                "Pipeline '{}' declares {} render targets (max {})",
                self.name,
                self.render_target_formats.len(),
                MAX_RENDER_TARGETS
            )));
        }
        if let Some(format) = self
            .render_target_formats
            .iter()
            .find(|format| is_depth_format(**format))
        {
            return Err(EmberError::contract(format!(
                "Pipeline '{}' uses depth format {:?} as a render target",
                self.name, format
            )));
        }
        if let Some(depth) = &self.depth {
            if !is_depth_format(depth.format) {
                return Err(EmberError::contract(format!(
                    "Pipeline '{}' uses {:?} as its depth format",
                    self.name, depth.format
                )));
            }
        }

        Ok(Arc::new(PipelineState {
            name: self.name,
            root_signature: self.root_signature,
            vertex_shader: self.vertex_shader,
            pixel_shader: self.pixel_shader,
            input_layout: self.input_layout,
            blend: self.blend,
            rasterizer: self.rasterizer,
            depth: self.depth,
            render_target_formats: self.render_target_formats,
            topology: self.topology,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Arc<RootSignature> {
        RootSignatureBuilder::new("test")
            .constant_buffer(0, ShaderVisibility::All)
            .descriptor_table(DescriptorRangeKind::Srv, 0, None, ShaderVisibility::Pixel)
            .build()
            .unwrap()
    }

    #[test]
    fn test_root_signature_rejects_duplicate_registers() {
        let err = RootSignatureBuilder::new("dup")
            .constant_buffer(0, ShaderVisibility::All)
            .constant_buffer(0, ShaderVisibility::Pixel)
            .build()
            .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_root_signature_cost_limit() {
        let mut builder = RootSignatureBuilder::new("huge");
        for register in 0..33 {
            builder = builder.constant_buffer(register, ShaderVisibility::All);
        }
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_pipeline_validation() {
        let root = root();
        let pipeline = PipelineStateBuilder::new("ok", &root)
            .shaders("vs", "ps")
            .render_target_formats(&[TextureFormat::Rgba8Unorm, TextureFormat::Rgba16Float])
            .depth(DepthState {
                format: TextureFormat::Depth32Float,
                write_enabled: true,
                compare: CompareFunction::Less,
            })
            .build()
            .unwrap();
        assert_eq!(pipeline.render_target_formats().len(), 2);
        assert!(Arc::ptr_eq(pipeline.root_signature(), &root));

        assert!(PipelineStateBuilder::new("no-shaders", &root).build().is_err());
        assert!(PipelineStateBuilder::new("depth-rt", &root)
            .shaders("vs", "ps")
            .render_target_formats(&[TextureFormat::Depth32Float])
            .build()
            .is_err());
        assert!(PipelineStateBuilder::new("too-many", &root)
            .shaders("vs", "ps")
            .render_target_formats(&[TextureFormat::Rgba8Unorm; 9])
            .build()
            .is_err());
    }
}
