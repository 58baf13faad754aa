//! Aurora - a frame-graph renderer on Vulkan
//!
//! Rendering work is expressed as passes connected through image ports. The
//! graph bakes a producers-first order once and then drives every pass each
//! frame through an explicit backend handle.
//!
//! # Features
//! - Render graph with typed ports, cycle detection and generation-tagged outputs
//! - Vulkan backend via ash with two frames in flight and tracked image layouts
//! - Bindless image and sampler heaps
//! - Deferred geometry, FXAA and final blit passes
//! - Dummy backend for GPU-free testing

pub mod backend;
pub mod camera;
pub mod descriptor_heap;
pub mod error;
pub mod frustum;
pub mod passes;
pub mod render_graph;
pub mod renderer;
pub mod window;

use std::path::PathBuf;

pub use backend::dummy::DummyBackend;
pub use backend::vulkan::VulkanBackend;
pub use backend::{BackendError, BackendResult, RenderBackend};
pub use camera::Camera;
pub use error::{GraphError, GraphResult};
pub use render_graph::{ContextLimits, ExecutionContext, NodeId, PortId, RenderGraph, RenderPass};
pub use renderer::{DeferredNodes, Renderer};

/// Number of frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Maximum number of input or output ports on one node.
pub const MAX_NODE_PORTS: u32 = 32;

/// Configuration for initializing the renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Enable vsync (FIFO presentation)
    pub vsync: bool,
    /// Enable the Khronos validation layer
    pub validation: bool,
    pub image_heap_capacity: u32,
    pub sampler_heap_capacity: u32,
    pub max_lights: usize,
    pub max_drawables: usize,
    /// Directory precompiled SPIR-V binaries are loaded from
    pub shader_dir: PathBuf,
    /// Equirectangular HDR environment map for the geometry pass
    pub environment_map: Option<PathBuf>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        let limits = ContextLimits::default();
        Self {
            title: "Aurora".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            validation: false,
            image_heap_capacity: limits.image_heap_capacity,
            sampler_heap_capacity: limits.sampler_heap_capacity,
            max_lights: limits.max_lights,
            max_drawables: limits.max_drawables,
            shader_dir: PathBuf::from("shaders"),
            environment_map: None,
        }
    }
}

impl RendererConfig {
    pub fn limits(&self) -> ContextLimits {
        ContextLimits {
            image_heap_capacity: self.image_heap_capacity,
            sampler_heap_capacity: self.sampler_heap_capacity,
            max_lights: self.max_lights,
            max_drawables: self.max_drawables,
        }
    }
}

/// Initialize `env_logger`, honouring `RUST_LOG` and defaulting to `info`.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
