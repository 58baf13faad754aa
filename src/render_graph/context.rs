//! Execution context shared by every pass.
//!
//! Holds the frame extent, camera and frustum, the light and drawable lists,
//! both bindless heaps, and the uniform buffers mirroring camera and lights.
//! The uniform buffers and their descriptor sets exist once per frame slot so
//! the CPU never writes a buffer the GPU may still be reading.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::backend::{
    BackendResult, Buffer, BufferDesc, BufferKind, DescriptorKind, DescriptorSetHandle,
    DescriptorSetLayoutDesc, DescriptorSetLayoutHandle, DescriptorWrite, HeapKind, RenderBackend,
};
use crate::camera::Camera;
use crate::descriptor_heap::{DescriptorHeap, DEFAULT_HEAP_CAPACITY};
use crate::error::{GraphError, GraphResult};
use crate::frustum::Frustum;
use crate::FRAMES_IN_FLIGHT;

/// Binding of the camera uniform in its set layout.
pub const CAMERA_BINDING: u32 = 1;
/// Binding of the light uniform in its set layout.
pub const LIGHT_BINDING: u32 = 2;

pub const DEFAULT_MAX_LIGHTS: usize = 512;
pub const DEFAULT_MAX_DRAWABLES: usize = 512;

/// Camera data as laid out for shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    pub projection: Mat4,
    pub view: Mat4,
    pub position: Vec4,
    pub frustum: [Vec4; 6],
}

impl Default for CameraUniform {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            position: Vec4::W,
            frustum: Frustum::default().planes,
        }
    }
}

/// Point light as laid out for shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PointLight {
    pub position: Vec3,
    _pad0: f32,
    pub color: Vec3,
    _pad1: f32,
}

impl PointLight {
    pub fn new(position: Vec3, color: Vec3) -> Self {
        Self {
            position,
            _pad0: 0.0,
            color,
            _pad1: 0.0,
        }
    }
}

/// Size of the light count header, padded to a vec4.
const LIGHT_HEADER_SIZE: usize = 16;

/// A drawable piece of a mesh: meshlets plus the sets describing them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Primitive {
    pub geometry_set: DescriptorSetHandle,
    pub material_set: DescriptorSetHandle,
    pub meshlet_count: u32,
}

/// Mesh data produced by an importer.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub primitives: Vec<Primitive>,
    /// Bounding sphere in model space.
    pub bounds_center: Vec3,
    pub bounds_radius: f32,
}

/// A mesh placed in the world
#[derive(Debug, Clone)]
pub struct Drawable {
    pub mesh: Arc<Mesh>,
    pub transform: Mat4,
}

impl Drawable {
    pub fn new(mesh: Arc<Mesh>, transform: Mat4) -> Self {
        Self { mesh, transform }
    }

    /// World-space bounding sphere.
    pub fn world_bounds(&self) -> (Vec3, f32) {
        let (scale, _, _) = self.transform.to_scale_rotation_translation();
        let center = self.transform.transform_point3(self.mesh.bounds_center);
        (center, self.mesh.bounds_radius * scale.abs().max_element())
    }
}

/// Capacities of the context's fixed-size tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    pub image_heap_capacity: u32,
    pub sampler_heap_capacity: u32,
    pub max_lights: usize,
    pub max_drawables: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            image_heap_capacity: DEFAULT_HEAP_CAPACITY,
            sampler_heap_capacity: DEFAULT_HEAP_CAPACITY,
            max_lights: DEFAULT_MAX_LIGHTS,
            max_drawables: DEFAULT_MAX_DRAWABLES,
        }
    }
}

#[derive(Debug)]
struct FrameUniforms {
    camera_buffer: Buffer,
    light_buffer: Buffer,
    camera_set: DescriptorSetHandle,
    light_set: DescriptorSetHandle,
}

#[derive(Debug)]
pub struct ExecutionContext {
    width: u32,
    height: u32,
    limits: ContextLimits,

    camera: CameraUniform,
    /// Keep the last frustum instead of recomputing it every frame.
    pub freeze_frustum: bool,
    lights: Vec<PointLight>,
    lights_dirty: bool,
    drawables: Vec<Drawable>,

    pub image_heap: DescriptorHeap,
    pub sampler_heap: DescriptorHeap,

    camera_layout: DescriptorSetLayoutHandle,
    light_layout: DescriptorSetLayoutHandle,
    frames: Vec<FrameUniforms>,
    frame_index: usize,
}

impl ExecutionContext {
    pub fn new<B: RenderBackend>(
        backend: &mut B,
        width: u32,
        height: u32,
        limits: ContextLimits,
    ) -> BackendResult<Self> {
        let image_heap = DescriptorHeap::new(backend, HeapKind::Image, limits.image_heap_capacity)?;
        let sampler_heap =
            DescriptorHeap::new(backend, HeapKind::Sampler, limits.sampler_heap_capacity)?;

        let camera_layout = backend.create_descriptor_set_layout(&DescriptorSetLayoutDesc::new(
            CAMERA_BINDING,
            &[DescriptorKind::UniformBuffer],
        ))?;
        let light_layout = backend.create_descriptor_set_layout(&DescriptorSetLayoutDesc::new(
            LIGHT_BINDING,
            &[DescriptorKind::UniformBuffer],
        ))?;

        let camera_size = std::mem::size_of::<CameraUniform>() as u64;
        let light_size = light_buffer_size(limits.max_lights) as u64;

        let mut frames = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for slot in 0..FRAMES_IN_FLIGHT {
            let camera_buffer = backend.allocate_buffer(
                &BufferDesc::new(camera_size, BufferKind::Uniform)
                    .with_label(format!("camera uniform {}", slot)),
            )?;
            let light_buffer = backend.allocate_buffer(
                &BufferDesc::new(light_size, BufferKind::Uniform)
                    .with_label(format!("light uniform {}", slot)),
            )?;

            let camera_set = backend.create_descriptor_set(camera_layout)?;
            backend.write_descriptor(
                camera_set,
                0,
                0,
                &DescriptorWrite::UniformBuffer {
                    buffer: camera_buffer.handle(),
                    range: camera_size,
                },
            )?;
            let light_set = backend.create_descriptor_set(light_layout)?;
            backend.write_descriptor(
                light_set,
                0,
                0,
                &DescriptorWrite::UniformBuffer {
                    buffer: light_buffer.handle(),
                    range: light_size,
                },
            )?;

            frames.push(FrameUniforms {
                camera_buffer,
                light_buffer,
                camera_set,
                light_set,
            });
        }

        Ok(Self {
            width,
            height,
            limits,
            camera: CameraUniform::default(),
            freeze_frustum: false,
            lights: Vec::with_capacity(limits.max_lights),
            lights_dirty: true,
            drawables: Vec::with_capacity(limits.max_drawables),
            image_heap,
            sampler_heap,
            camera_layout,
            light_layout,
            frames,
            frame_index: 0,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn limits(&self) -> ContextLimits {
        self.limits
    }

    pub(crate) fn set_extent(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    /// Copy view, projection and position from `camera`.
    pub fn set_camera(&mut self, camera: &Camera) {
        self.set_view_projection(
            camera.view_matrix(),
            camera.projection_matrix(),
            camera.position,
        );
    }

    pub fn set_view_projection(&mut self, view: Mat4, projection: Mat4, position: Vec3) {
        self.camera.view = view;
        self.camera.projection = projection;
        self.camera.position = position.extend(1.0);
    }

    pub fn camera(&self) -> &CameraUniform {
        &self.camera
    }

    pub fn frustum(&self) -> Frustum {
        Frustum {
            planes: self.camera.frustum,
        }
    }

    pub fn push_light(&mut self, light: PointLight) -> GraphResult<usize> {
        if self.lights.len() >= self.limits.max_lights {
            return Err(GraphError::CapacityExceeded {
                what: "lights",
                capacity: self.limits.max_lights,
            });
        }
        self.lights.push(light);
        self.lights_dirty = true;
        Ok(self.lights.len() - 1)
    }

    pub fn clear_lights(&mut self) {
        self.lights.clear();
        self.lights_dirty = true;
    }

    pub fn lights(&self) -> &[PointLight] {
        &self.lights
    }

    pub fn push_drawable(&mut self, drawable: Drawable) -> GraphResult<usize> {
        if self.drawables.len() >= self.limits.max_drawables {
            return Err(GraphError::CapacityExceeded {
                what: "drawables",
                capacity: self.limits.max_drawables,
            });
        }
        self.drawables.push(drawable);
        Ok(self.drawables.len() - 1)
    }

    pub fn clear_drawables(&mut self) {
        self.drawables.clear();
    }

    pub fn drawables(&self) -> &[Drawable] {
        &self.drawables
    }

    pub fn camera_layout(&self) -> DescriptorSetLayoutHandle {
        self.camera_layout
    }

    pub fn light_layout(&self) -> DescriptorSetLayoutHandle {
        self.light_layout
    }

    /// Camera set of the frame slot last uploaded.
    pub fn camera_set(&self) -> DescriptorSetHandle {
        self.frames[self.frame_index].camera_set
    }

    /// Light set of the frame slot last uploaded.
    pub fn light_set(&self) -> DescriptorSetHandle {
        self.frames[self.frame_index].light_set
    }

    /// Recompute the frustum and write camera and light data into the
    /// current frame slot's uniform buffers.
    pub fn upload<B: RenderBackend>(&mut self, backend: &mut B) -> BackendResult<()> {
        self.frame_index = backend.frame_index() % self.frames.len();

        if !self.freeze_frustum {
            let view_proj = self.camera.projection * self.camera.view;
            self.camera.frustum = Frustum::from_matrix(view_proj).planes;
        }

        if self.lights_dirty {
            log::debug!("Uploading {} lights", self.lights.len());
            self.lights_dirty = false;
        }

        let frame = &self.frames[self.frame_index];
        backend.upload_buffer(frame.camera_buffer.handle(), bytemuck::bytes_of(&self.camera))?;
        backend.upload_buffer(
            frame.light_buffer.handle(),
            &light_bytes(&self.lights, self.limits.max_lights),
        )
    }

    /// Free every GPU object owned by the context, heaps included.
    pub fn destroy<B: RenderBackend>(self, backend: &mut B) -> BackendResult<()> {
        for frame in self.frames {
            backend.free_descriptor_set(frame.camera_set)?;
            backend.free_descriptor_set(frame.light_set)?;
            backend.free_buffer(frame.camera_buffer)?;
            backend.free_buffer(frame.light_buffer)?;
        }
        backend.free_descriptor_set_layout(self.camera_layout)?;
        backend.free_descriptor_set_layout(self.light_layout)?;
        self.image_heap.destroy(backend)?;
        self.sampler_heap.destroy(backend)
    }
}

fn light_buffer_size(max_lights: usize) -> usize {
    LIGHT_HEADER_SIZE + max_lights * std::mem::size_of::<PointLight>()
}

/// Light count padded to a vec4, followed by `max_lights` entries.
fn light_bytes(lights: &[PointLight], max_lights: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; light_buffer_size(max_lights)];
    let header = [lights.len() as u32, 0, 0, 0];
    bytes[..LIGHT_HEADER_SIZE].copy_from_slice(bytemuck::cast_slice(&header));
    let body: &[u8] = bytemuck::cast_slice(lights);
    bytes[LIGHT_HEADER_SIZE..LIGHT_HEADER_SIZE + body.len()].copy_from_slice(body);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    fn small_limits() -> ContextLimits {
        ContextLimits {
            image_heap_capacity: 8,
            sampler_heap_capacity: 4,
            max_lights: 2,
            max_drawables: 1,
        }
    }

    fn mesh() -> Arc<Mesh> {
        Arc::new(Mesh {
            primitives: Vec::new(),
            bounds_center: Vec3::ZERO,
            bounds_radius: 1.0,
        })
    }

    #[test]
    fn test_light_capacity() {
        let mut backend = DummyBackend::default();
        let mut ctx = ExecutionContext::new(&mut backend, 64, 64, small_limits()).unwrap();
        assert_eq!(ctx.push_light(PointLight::new(Vec3::ZERO, Vec3::ONE)).unwrap(), 0);
        assert_eq!(ctx.push_light(PointLight::new(Vec3::X, Vec3::ONE)).unwrap(), 1);
        let err = ctx
            .push_light(PointLight::new(Vec3::Y, Vec3::ONE))
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::CapacityExceeded {
                what: "lights",
                capacity: 2
            }
        ));
        assert_eq!(ctx.lights().len(), 2);

        ctx.clear_lights();
        assert!(ctx.push_light(PointLight::new(Vec3::Y, Vec3::ONE)).is_ok());
    }

    #[test]
    fn test_drawable_capacity() {
        let mut backend = DummyBackend::default();
        let mut ctx = ExecutionContext::new(&mut backend, 64, 64, small_limits()).unwrap();
        ctx.push_drawable(Drawable::new(mesh(), Mat4::IDENTITY))
            .unwrap();
        assert!(matches!(
            ctx.push_drawable(Drawable::new(mesh(), Mat4::IDENTITY)),
            Err(GraphError::CapacityExceeded {
                what: "drawables",
                ..
            })
        ));
        assert_eq!(ctx.drawables().len(), 1);
    }

    #[test]
    fn test_upload_writes_current_slot() {
        let mut backend = DummyBackend::default();
        let mut ctx = ExecutionContext::new(&mut backend, 64, 64, small_limits()).unwrap();
        ctx.push_light(PointLight::new(Vec3::new(1.0, 2.0, 3.0), Vec3::ONE))
            .unwrap();
        ctx.upload(&mut backend).unwrap();

        let light_buffer = ctx.frames[0].light_buffer.handle();
        let bytes = backend.buffer_contents(light_buffer).unwrap();
        assert_eq!(bytes.len(), 16 + 2 * 32);
        assert_eq!(&bytes[..4], &1u32.to_le_bytes());
        let position: [f32; 3] = bytemuck::pod_read_unaligned(&bytes[16..28]);
        assert_eq!(position, [1.0, 2.0, 3.0]);

        // the other slot is untouched
        let other = ctx.frames[1].light_buffer.handle();
        assert!(backend.buffer_contents(other).unwrap().iter().all(|&b| b == 0));
        assert_eq!(ctx.camera_set(), ctx.frames[0].camera_set);
    }

    #[test]
    fn test_frozen_frustum_is_kept() {
        let mut backend = DummyBackend::default();
        let mut ctx = ExecutionContext::new(&mut backend, 64, 64, small_limits()).unwrap();
        let camera = Camera::default();
        ctx.set_camera(&camera);
        ctx.upload(&mut backend).unwrap();
        let before = ctx.frustum();

        ctx.freeze_frustum = true;
        let mut moved = camera.clone();
        moved.position += Vec3::new(0.0, 0.0, 50.0);
        ctx.set_camera(&moved);
        ctx.upload(&mut backend).unwrap();
        assert_eq!(ctx.frustum(), before);
        assert_eq!(ctx.camera().position, moved.position.extend(1.0));

        ctx.freeze_frustum = false;
        ctx.upload(&mut backend).unwrap();
        assert_ne!(ctx.frustum(), before);
    }

    #[test]
    fn test_destroy_releases_everything() {
        let mut backend = DummyBackend::default();
        let ctx = ExecutionContext::new(&mut backend, 64, 64, ContextLimits::default()).unwrap();
        assert_eq!(backend.live_buffers(), 2 * FRAMES_IN_FLIGHT);
        ctx.destroy(&mut backend).unwrap();
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.live_descriptor_sets(), 0);
        assert_eq!(backend.live_descriptor_set_layouts(), 0);
    }

    #[test]
    fn test_world_bounds_scale() {
        let drawable = Drawable::new(
            mesh(),
            Mat4::from_scale_rotation_translation(
                Vec3::new(1.0, 3.0, 2.0),
                glam::Quat::IDENTITY,
                Vec3::new(5.0, 0.0, 0.0),
            ),
        );
        let (center, radius) = drawable.world_bounds();
        assert_eq!(center, Vec3::new(5.0, 0.0, 0.0));
        assert!((radius - 3.0).abs() < 1e-5);
    }
}
