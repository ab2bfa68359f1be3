//! Ember Renderer
//!
//! The deferred rendering core of the Ember engine.
//!
//! ## Features
//! - GPU resources with tracked states, memory budgets and view descriptors
//! - Fixed-capacity descriptor heaps with fence-deferred reclamation
//! - Command contexts with batched barriers and binding validation
//! - Command queues with fences running on a per-queue GPU timeline
//! - Geometry, lighting and composite passes over a G-buffer
//! - Swap-chain presentation, frame pacing and an overlay hook

pub mod buffer;
pub mod camera;
pub mod command;
pub mod descriptor;
pub mod device;
mod executor;
pub mod model;
pub mod overlay;
pub mod passes;
pub mod pipeline;
pub mod queue;
pub mod render_manager;
pub mod resource;
pub mod sampler;
pub mod scene;
pub mod swap_chain;
pub mod texture;

// Re-export commonly used types
pub use buffer::{GpuBuffer, IndexBuffer, VertexBuffer, CONSTANT_BUFFER_ALIGNMENT};
pub use camera::{Camera, DirectionalLight};
pub use command::{Command, CommandContext, ContextState};
pub use descriptor::{Descriptor, DescriptorAllocator, DescriptorHeap, DescriptorHeapKind, DescriptorView};
pub use device::{ExecutionStats, GraphicsDevice, MemoryUsage};
pub use model::{Material, MaterialDesc, Mesh, Model, ModelData, Vertex};
pub use overlay::{OverlayRenderer, OverlaySetup};
pub use passes::{CompositePass, GBuffer, GeometryRenderingPass, LightingRenderingPass, PassState};
pub use pipeline::{PipelineState, PipelineStateBuilder, RootSignature, RootSignatureBuilder};
pub use queue::{CommandQueue, Fence, QueueKind};
pub use render_manager::{FrameReport, RenderManager};
pub use resource::{AsResource, GpuResource, ResourceState, ShaderResource};
pub use sampler::{SamplerKind, SamplerManager};
pub use scene::{DrawItem, InstanceKey, InstanceRegistry, ModelInstance};
pub use swap_chain::SwapChain;
pub use texture::{ColorBuffer, DefaultTextures, DepthBuffer, Texture};
