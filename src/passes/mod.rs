//! Built-in render passes
//!
//! - [`GeometryPass`]: deferred G-buffer fill and lighting, optional environment cubemap
//! - [`FxaaPass`]: fast approximate anti-aliasing over one colour input
//! - [`FinalBlitPass`]: copies its input onto the swapchain image for presentation

pub mod final_blit;
pub mod fxaa;
pub mod geometry;

pub use final_blit::FinalBlitPass;
pub use fxaa::FxaaPass;
pub use geometry::{GeometryParams, GeometryPass};

use ash::vk;

use crate::backend::{BackendResult, Buffer, BufferDesc, BufferKind, RenderBackend};

/// Vertex layout of the fullscreen quad: position then uv.
pub(crate) const QUAD_ATTRIBUTES: [vk::Format; 2] =
    [vk::Format::R32G32B32_SFLOAT, vk::Format::R32G32_SFLOAT];

pub(crate) const QUAD_VERTEX_COUNT: u32 = 4;

/// Triangle strip covering clip space.
#[rustfmt::skip]
const QUAD_VERTICES: [f32; 20] = [
    -1.0, -1.0, 0.0, 0.0, 0.0,
     1.0, -1.0, 0.0, 1.0, 0.0,
    -1.0,  1.0, 0.0, 0.0, 1.0,
     1.0,  1.0, 0.0, 1.0, 1.0,
];

/// Allocate and fill the fullscreen quad vertex buffer.
pub(crate) fn create_fullscreen_quad<B: RenderBackend>(backend: &mut B) -> BackendResult<Buffer> {
    let bytes: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
    let buffer = backend.allocate_buffer(
        &BufferDesc::new(bytes.len() as u64, BufferKind::Vertex).with_label("fullscreen quad"),
    )?;
    backend.upload_buffer(buffer.handle(), bytes)?;
    Ok(buffer)
}
