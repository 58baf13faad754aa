//! Deferred geometry pass
//!
//! Fills a G-buffer (position, normal, albedo, metallic-roughness) with
//! frustum-culled meshlet draws, then resolves it into a lit HDR image with a
//! fullscreen lighting draw. An optional equirectangular environment map is
//! converted into a cubemap once at init and exposed through the image heap.

use std::path::{Path, PathBuf};

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::backend::{
    Buffer, BufferDesc, BufferKind, CommandBufferHandle, ComputePipelineDesc, DescriptorKind,
    DescriptorSetHandle, DescriptorSetLayoutDesc, DescriptorSetLayoutHandle, DescriptorWrite,
    GraphicsPipelineDesc, Image, ImageBarrier, ImageDesc, ImageLayout, ImageUsage, PipelineHandle,
    QueueKind, RenderBackend, RenderBegin, SamplerDesc, SamplerHandle, ShaderHandle, ShaderStages,
};
use crate::descriptor_heap::HeapSlot;
use crate::error::{GraphError, GraphResult};
use crate::passes::{create_fullscreen_quad, QUAD_ATTRIBUTES, QUAD_VERTEX_COUNT};
use crate::render_graph::{ExecutionContext, PassContext, PortId, RenderPass};
use crate::FRAMES_IN_FLIGHT;

pub const LIT_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

const GBUFFER_FORMATS: [vk::Format; 4] = [
    vk::Format::R16G16B16A16_SFLOAT,
    vk::Format::R16G16B16A16_SFLOAT,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
];
const GBUFFER_LABELS: [&str; 4] = [
    "gbuffer position",
    "gbuffer normal",
    "gbuffer albedo",
    "gbuffer metallic roughness",
];

const ENVIRONMENT_SIZE: u32 = 1024;
const ENVIRONMENT_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
const ENVIRONMENT_WORKGROUP: u32 = 32;

/// Storage buffers bound per primitive: meshlets, vertices, indices, primitives.
const GEOMETRY_STORAGE_BINDINGS: usize = 4;

/// No environment map bound.
pub const NO_ENVIRONMENT: u32 = u32::MAX;

/// Per-frame shading toggles as laid out for shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GeometryParams {
    pub show_meshlets: u32,
    pub shade_meshlets: u32,
    /// Image heap slot of the environment cubemap.
    pub environment_index: u32,
    _pad: u32,
}

impl Default for GeometryParams {
    fn default() -> Self {
        Self {
            show_meshlets: 0,
            shade_meshlets: 1,
            environment_index: NO_ENVIRONMENT,
            _pad: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct DrawPush {
    transform: Mat4,
    meshlet_count: u32,
    _pad: [u32; 3],
}

#[derive(Debug)]
struct Environment {
    cube: Image,
    sampler: Option<SamplerHandle>,
    image_slot: Option<HeapSlot>,
    sampler_slot: Option<HeapSlot>,
}

impl Environment {
    fn release<B: RenderBackend>(
        self,
        backend: &mut B,
        exec: &mut ExecutionContext,
    ) -> GraphResult<()> {
        if let Some(slot) = self.image_slot {
            exec.image_heap.free(slot)?;
        }
        if let Some(slot) = self.sampler_slot {
            exec.sampler_heap.free(slot)?;
        }
        if let Some(sampler) = self.sampler {
            backend.destroy_sampler(sampler)?;
        }
        backend.free_image(self.cube)?;
        Ok(())
    }
}

/// Everything `init` creates. Filled in step by step, so a build that fails
/// part way is released by the same code as a complete one.
#[derive(Debug, Default)]
struct GeometryResources {
    samplers: Vec<SamplerHandle>,
    sampler_slots: Vec<HeapSlot>,

    gbuffer: Vec<Image>,

    material_layout: Option<DescriptorSetLayoutHandle>,
    geometry_layout: Option<DescriptorSetLayoutHandle>,
    params_layout: Option<DescriptorSetLayoutHandle>,
    deferred_layout: Option<DescriptorSetLayoutHandle>,
    deferred_set: Option<DescriptorSetHandle>,
    // one of each per frame slot
    params_buffers: Vec<Buffer>,
    params_sets: Vec<DescriptorSetHandle>,

    shaders: Vec<ShaderHandle>,
    gbuffer_pipeline: Option<PipelineHandle>,
    deferred_pipeline: Option<PipelineHandle>,
    quad: Option<Buffer>,

    environment: Option<Environment>,
}

impl GeometryResources {
    /// Release in reverse creation order. Steps that never ran are skipped.
    fn release<B: RenderBackend>(
        self,
        backend: &mut B,
        exec: &mut ExecutionContext,
    ) -> GraphResult<()> {
        if let Some(environment) = self.environment {
            environment.release(backend, exec)?;
        }

        if let Some(quad) = self.quad {
            backend.free_buffer(quad)?;
        }
        for pipeline in [self.gbuffer_pipeline, self.deferred_pipeline]
            .into_iter()
            .flatten()
        {
            backend.free_pipeline(pipeline)?;
        }
        for shader in self.shaders {
            backend.free_shader(shader)?;
        }

        for set in self.params_sets {
            backend.free_descriptor_set(set)?;
        }
        for buffer in self.params_buffers {
            backend.free_buffer(buffer)?;
        }
        if let Some(set) = self.deferred_set {
            backend.free_descriptor_set(set)?;
        }
        for layout in [
            self.material_layout,
            self.geometry_layout,
            self.params_layout,
            self.deferred_layout,
        ]
        .into_iter()
        .flatten()
        {
            backend.free_descriptor_set_layout(layout)?;
        }

        for image in self.gbuffer {
            backend.free_image(image)?;
        }
        for slot in self.sampler_slots {
            exec.sampler_heap.free(slot)?;
        }
        for sampler in self.samplers {
            backend.destroy_sampler(sampler)?;
        }
        Ok(())
    }
}

/// Deferred G-buffer fill and lighting.
#[derive(Debug, Default)]
pub struct GeometryPass {
    environment_map: Option<PathBuf>,
    params: GeometryParams,
    resources: Option<GeometryResources>,
    visible_drawables: usize,
}

impl GeometryPass {
    /// Lit HDR colour.
    pub const LIT: PortId = PortId::output(0);
    pub const DEPTH: PortId = PortId::output(1);

    pub fn new() -> Self {
        Self::default()
    }

    /// Convert this equirectangular HDR image into the environment cubemap at init.
    pub fn with_environment(mut self, path: impl Into<PathBuf>) -> Self {
        self.environment_map = Some(path.into());
        self
    }

    pub fn set_show_meshlets(&mut self, show: bool) {
        self.params.show_meshlets = show as u32;
    }

    pub fn set_shade_meshlets(&mut self, shade: bool) {
        self.params.shade_meshlets = shade as u32;
    }

    pub fn params(&self) -> GeometryParams {
        self.params
    }

    /// Drawables that survived culling in the last frame.
    pub fn visible_drawables(&self) -> usize {
        self.visible_drawables
    }

    /// Layout material sets of drawn primitives must be created from.
    pub fn material_layout(&self) -> Option<DescriptorSetLayoutHandle> {
        self.resources.as_ref().and_then(|r| r.material_layout)
    }

    /// Layout geometry sets of drawn primitives must be created from.
    pub fn geometry_layout(&self) -> Option<DescriptorSetLayoutHandle> {
        self.resources.as_ref().and_then(|r| r.geometry_layout)
    }

    fn write_deferred_set<B: RenderBackend>(
        backend: &mut B,
        resources: &GeometryResources,
    ) -> GraphResult<()> {
        let set = resources.deferred_set.ok_or(GraphError::NotBaked)?;
        for (binding, image) in resources.gbuffer.iter().enumerate() {
            backend.write_descriptor(
                set,
                binding as u32,
                0,
                &DescriptorWrite::SampledImage(image.handle()),
            )?;
        }
        Ok(())
    }

    /// Create samplers, G-buffer, sets, pipelines and the environment into
    /// `resources`, recording each object as soon as it exists.
    fn build<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        exec: &mut ExecutionContext,
        (width, height): (u32, u32),
        resources: &mut GeometryResources,
    ) -> GraphResult<()> {
        for desc in [SamplerDesc::nearest(), SamplerDesc::linear()] {
            let sampler = backend.create_sampler(&desc)?;
            resources.samplers.push(sampler);
            resources
                .sampler_slots
                .push(exec.sampler_heap.push_sampler(backend, sampler)?);
        }

        for (format, label) in GBUFFER_FORMATS.iter().zip(GBUFFER_LABELS) {
            resources.gbuffer.push(backend.allocate_image(
                &ImageDesc::new_2d(width, height, *format, ImageUsage::GBUFFER).with_label(label),
            )?);
        }

        let material_layout = backend.create_descriptor_set_layout(&DescriptorSetLayoutDesc::new(
            0,
            &[DescriptorKind::UniformBuffer],
        ))?;
        resources.material_layout = Some(material_layout);
        let geometry_layout = backend.create_descriptor_set_layout(&DescriptorSetLayoutDesc::new(
            0,
            &[DescriptorKind::StorageBuffer; GEOMETRY_STORAGE_BINDINGS],
        ))?;
        resources.geometry_layout = Some(geometry_layout);
        let params_layout = backend.create_descriptor_set_layout(&DescriptorSetLayoutDesc::new(
            0,
            &[DescriptorKind::UniformBuffer],
        ))?;
        resources.params_layout = Some(params_layout);
        let deferred_layout = backend.create_descriptor_set_layout(&DescriptorSetLayoutDesc::new(
            0,
            &[DescriptorKind::SampledImage; 4],
        ))?;
        resources.deferred_layout = Some(deferred_layout);
        resources.deferred_set = Some(backend.create_descriptor_set(deferred_layout)?);

        let params_size = std::mem::size_of::<GeometryParams>() as u64;
        for slot in 0..FRAMES_IN_FLIGHT {
            let buffer = backend.allocate_buffer(
                &BufferDesc::new(params_size, BufferKind::Uniform)
                    .with_label(format!("geometry params {}", slot)),
            )?;
            let handle = buffer.handle();
            resources.params_buffers.push(buffer);
            let set = backend.create_descriptor_set(params_layout)?;
            resources.params_sets.push(set);
            backend.write_descriptor(
                set,
                0,
                0,
                &DescriptorWrite::UniformBuffer {
                    buffer: handle,
                    range: params_size,
                },
            )?;
        }

        let mut load_shader = |name: &str| -> GraphResult<ShaderHandle> {
            let shader = backend.load_shader(Path::new(name))?;
            resources.shaders.push(shader);
            Ok(shader)
        };
        let task = load_shader("gbuffer.task.spv")?;
        let mesh = load_shader("gbuffer.mesh.spv")?;
        let gbuffer_fragment = load_shader("gbuffer.frag.spv")?;
        let deferred_vertex = load_shader("deferred.vert.spv")?;
        let deferred_fragment = load_shader("deferred.frag.spv")?;

        let mut desc = GraphicsPipelineDesc::new(ShaderStages::Mesh {
            task: Some(task),
            mesh,
            fragment: gbuffer_fragment,
        });
        desc.label = Some("gbuffer".to_string());
        desc.color_formats = GBUFFER_FORMATS.to_vec();
        desc.depth_format = Some(DEPTH_FORMAT);
        desc.push_constant_size = std::mem::size_of::<DrawPush>() as u32;
        desc.set_layouts = vec![
            exec.camera_layout(),
            exec.image_heap.layout(),
            exec.sampler_heap.layout(),
            material_layout,
            geometry_layout,
            params_layout,
        ];
        resources.gbuffer_pipeline = Some(backend.create_graphics_pipeline(&desc)?);

        let mut desc = GraphicsPipelineDesc::new(ShaderStages::Vertex {
            vertex: deferred_vertex,
            fragment: deferred_fragment,
        });
        desc.label = Some("deferred lighting".to_string());
        desc.vertex_attributes = QUAD_ATTRIBUTES.to_vec();
        desc.color_formats = vec![LIT_FORMAT];
        desc.cull_mode = vk::CullModeFlags::NONE;
        desc.topology = vk::PrimitiveTopology::TRIANGLE_STRIP;
        desc.push_constant_size = std::mem::size_of::<glam::Vec4>() as u32;
        desc.set_layouts = vec![
            deferred_layout,
            exec.sampler_heap.layout(),
            exec.light_layout(),
            params_layout,
            exec.image_heap.layout(),
        ];
        resources.deferred_pipeline = Some(backend.create_graphics_pipeline(&desc)?);

        resources.quad = Some(create_fullscreen_quad(backend)?);

        if let Some(path) = &self.environment_map {
            let environment = resources.environment.insert(Environment {
                cube: bake_environment(backend, path)?,
                sampler: None,
                image_slot: None,
                sampler_slot: None,
            });
            let cube = environment.cube.handle();
            let image_slot = exec.image_heap.push_image(backend, cube)?;
            environment.image_slot = Some(image_slot);
            let sampler = backend.create_sampler(&SamplerDesc::linear())?;
            environment.sampler = Some(sampler);
            environment.sampler_slot = Some(exec.sampler_heap.push_sampler(backend, sampler)?);
            self.params.environment_index = image_slot.index;
        }

        Self::write_deferred_set(backend, resources)
    }
}

/// Temporaries of the environment bake. Released whether or not it succeeds.
#[derive(Debug, Default)]
struct EnvironmentBake {
    equirect: Option<Image>,
    shader: Option<ShaderHandle>,
    layout: Option<DescriptorSetLayoutHandle>,
    set: Option<DescriptorSetHandle>,
    sampler: Option<SamplerHandle>,
    pipeline: Option<PipelineHandle>,
    cmd: Option<CommandBufferHandle>,
}

impl EnvironmentBake {
    fn record<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        path: &Path,
        cube: &Image,
    ) -> GraphResult<()> {
        let equirect = self.equirect.insert(backend.load_hdr_image(path)?).handle();
        let shader = *self
            .shader
            .insert(backend.load_shader("equirect_to_cube.comp.spv".as_ref())?);
        let layout = *self.layout.insert(backend.create_descriptor_set_layout(
            &DescriptorSetLayoutDesc::new(
                0,
                &[DescriptorKind::CombinedImageSampler, DescriptorKind::StorageImage],
            ),
        )?);
        let set = *self.set.insert(backend.create_descriptor_set(layout)?);
        let sampler = *self.sampler.insert(backend.create_sampler(&SamplerDesc::linear())?);
        backend.write_descriptor(
            set,
            0,
            0,
            &DescriptorWrite::CombinedImageSampler {
                image: equirect,
                sampler,
            },
        )?;
        backend.write_descriptor(set, 1, 0, &DescriptorWrite::StorageImage(cube.handle()))?;
        let pipeline = backend.create_compute_pipeline(&ComputePipelineDesc {
            label: Some("equirect to cube".to_string()),
            shader,
            push_constant_size: 0,
            set_layouts: vec![layout],
        })?;
        self.pipeline = Some(pipeline);

        let cmd = *self
            .cmd
            .insert(backend.create_command_buffer(QueueKind::Compute)?);
        backend.begin_command_buffer(cmd)?;
        backend.cmd_transition_image(
            cmd,
            cube.handle(),
            &ImageBarrier::new(ImageLayout::Undefined, ImageLayout::General).with_layers(0, 6),
        )?;
        backend.cmd_bind_pipeline(cmd, pipeline)?;
        backend.cmd_bind_descriptor_set(cmd, pipeline, set, 0)?;
        backend.cmd_dispatch(
            cmd,
            ENVIRONMENT_SIZE / ENVIRONMENT_WORKGROUP,
            ENVIRONMENT_SIZE / ENVIRONMENT_WORKGROUP,
            6,
        )?;
        backend.cmd_transition_image(
            cmd,
            cube.handle(),
            &ImageBarrier::new(ImageLayout::General, ImageLayout::ShaderReadOnly).with_layers(0, 6),
        )?;
        backend.submit_command_buffer_and_wait(cmd)?;
        Ok(())
    }

    fn release<B: RenderBackend>(self, backend: &mut B) -> GraphResult<()> {
        if let Some(cmd) = self.cmd {
            backend.free_command_buffer(cmd)?;
        }
        if let Some(pipeline) = self.pipeline {
            backend.free_pipeline(pipeline)?;
        }
        if let Some(set) = self.set {
            backend.free_descriptor_set(set)?;
        }
        if let Some(layout) = self.layout {
            backend.free_descriptor_set_layout(layout)?;
        }
        if let Some(sampler) = self.sampler {
            backend.destroy_sampler(sampler)?;
        }
        if let Some(shader) = self.shader {
            backend.free_shader(shader)?;
        }
        if let Some(equirect) = self.equirect {
            backend.free_image(equirect)?;
        }
        Ok(())
    }
}

/// Render `path` into a freshly allocated cubemap on a one-time compute
/// command buffer. Every temporary is released before returning.
fn bake_environment<B: RenderBackend>(backend: &mut B, path: &Path) -> GraphResult<Image> {
    log::info!("Baking environment cubemap from {}", path.display());
    let cube = backend.allocate_image(
        &ImageDesc::cube(ENVIRONMENT_SIZE, ENVIRONMENT_FORMAT, ImageUsage::STORAGE_SAMPLED)
            .with_label("environment cube"),
    )?;

    let mut bake = EnvironmentBake::default();
    let recorded = bake.record(backend, path, &cube);
    bake.release(backend)?;
    match recorded {
        Ok(()) => Ok(cube),
        Err(e) => {
            backend.free_image(cube)?;
            Err(e)
        }
    }
}

impl<B: RenderBackend> RenderPass<B> for GeometryPass {
    fn name(&self) -> &str {
        "geometry"
    }

    fn output_count(&self) -> u32 {
        2
    }

    fn init(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        let (width, height) = ctx.extent();
        ctx.outputs.allocate(
            ctx.backend,
            Self::LIT.index(),
            &ImageDesc::new_2d(width, height, LIT_FORMAT, ImageUsage::RENDER_TARGET)
                .with_label("lit"),
        )?;
        ctx.outputs.allocate(
            ctx.backend,
            Self::DEPTH.index(),
            &ImageDesc::new_2d(width, height, DEPTH_FORMAT, ImageUsage::DEPTH).with_label("depth"),
        )?;

        let backend = &mut *ctx.backend;
        let exec = &mut *ctx.exec;
        let mut resources = GeometryResources::default();
        if let Err(e) = self.build(backend, exec, (width, height), &mut resources) {
            log::warn!("Geometry pass init failed, releasing what was created: {}", e);
            self.params.environment_index = NO_ENVIRONMENT;
            resources.release(backend, exec)?;
            return Err(e);
        }
        self.resources = Some(resources);
        Ok(())
    }

    fn update(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        let resources = self.resources.as_ref().ok_or(GraphError::NotBaked)?;
        let lit = ctx.outputs.image_ref(Self::LIT.index())?;
        let depth = ctx.outputs.image_ref(Self::DEPTH.index())?;
        let cmd = ctx.cmd();
        let backend = &mut *ctx.backend;
        let exec = &*ctx.exec;

        let slot = backend.frame_index() % FRAMES_IN_FLIGHT;
        let (
            Some(gbuffer_pipeline),
            Some(deferred_pipeline),
            Some(deferred_set),
            Some(quad),
            Some(params_buffer),
            Some(&params_set),
        ) = (
            resources.gbuffer_pipeline,
            resources.deferred_pipeline,
            resources.deferred_set,
            resources.quad.as_ref(),
            resources.params_buffers.get(slot),
            resources.params_sets.get(slot),
        )
        else {
            return Err(GraphError::NotBaked);
        };
        backend.upload_buffer(params_buffer.handle(), bytemuck::bytes_of(&self.params))?;

        // G-buffer contents from the previous frame are discarded
        for image in &resources.gbuffer {
            backend.cmd_transition_image(
                cmd,
                image.handle(),
                &ImageBarrier::new(ImageLayout::Undefined, ImageLayout::ColorAttachment),
            )?;
        }
        backend.cmd_transition_image(
            cmd,
            depth.handle,
            &ImageBarrier::new(ImageLayout::Undefined, ImageLayout::DepthAttachment),
        )?;

        let mut begin = RenderBegin::new(depth.width, depth.height).depth(depth.handle);
        for image in &resources.gbuffer {
            begin = begin.color(image.handle());
        }
        backend.cmd_begin_rendering(cmd, &begin)?;
        backend.cmd_set_viewport(cmd, depth.width, depth.height)?;
        let pipeline = gbuffer_pipeline;
        backend.cmd_bind_pipeline(cmd, pipeline)?;
        backend.cmd_bind_descriptor_set(cmd, pipeline, exec.camera_set(), 0)?;
        backend.cmd_bind_descriptor_set(cmd, pipeline, exec.image_heap.set(), 1)?;
        backend.cmd_bind_descriptor_set(cmd, pipeline, exec.sampler_heap.set(), 2)?;
        backend.cmd_bind_descriptor_set(cmd, pipeline, params_set, 5)?;

        let frustum = exec.frustum();
        let mut visible = 0;
        for drawable in exec.drawables() {
            let (center, radius) = drawable.world_bounds();
            if !frustum.intersects_sphere(center, radius) {
                continue;
            }
            visible += 1;
            for primitive in &drawable.mesh.primitives {
                let push = DrawPush {
                    transform: drawable.transform,
                    meshlet_count: primitive.meshlet_count,
                    _pad: [0; 3],
                };
                backend.cmd_bind_descriptor_set(cmd, pipeline, primitive.material_set, 3)?;
                backend.cmd_bind_descriptor_set(cmd, pipeline, primitive.geometry_set, 4)?;
                backend.cmd_push_constants(cmd, pipeline, bytemuck::bytes_of(&push))?;
                backend.cmd_draw_meshlets(cmd, primitive.meshlet_count)?;
            }
        }
        backend.cmd_end_rendering(cmd)?;
        log::trace!(
            "Geometry pass drew {} of {} drawables",
            visible,
            exec.drawables().len()
        );

        for image in &resources.gbuffer {
            backend.cmd_transition_image(
                cmd,
                image.handle(),
                &ImageBarrier::new(ImageLayout::ColorAttachment, ImageLayout::ShaderReadOnly),
            )?;
        }

        backend.cmd_transition_image(
            cmd,
            lit.handle,
            &ImageBarrier::new(ImageLayout::Undefined, ImageLayout::ColorAttachment),
        )?;
        backend.cmd_begin_rendering(cmd, &RenderBegin::new(lit.width, lit.height).color(lit.handle))?;
        backend.cmd_set_viewport(cmd, lit.width, lit.height)?;
        let pipeline = deferred_pipeline;
        backend.cmd_bind_pipeline(cmd, pipeline)?;
        backend.cmd_bind_descriptor_set(cmd, pipeline, deferred_set, 0)?;
        backend.cmd_bind_descriptor_set(cmd, pipeline, exec.sampler_heap.set(), 1)?;
        backend.cmd_bind_descriptor_set(cmd, pipeline, exec.light_set(), 2)?;
        backend.cmd_bind_descriptor_set(cmd, pipeline, params_set, 3)?;
        backend.cmd_bind_descriptor_set(cmd, pipeline, exec.image_heap.set(), 4)?;
        backend.cmd_push_constants(cmd, pipeline, bytemuck::bytes_of(&exec.camera().position))?;
        backend.cmd_bind_vertex_buffer(cmd, quad.handle())?;
        backend.cmd_draw(cmd, QUAD_VERTEX_COUNT)?;
        backend.cmd_end_rendering(cmd)?;
        backend.cmd_transition_image(
            cmd,
            lit.handle,
            &ImageBarrier::new(ImageLayout::ColorAttachment, ImageLayout::ShaderReadOnly),
        )?;

        self.visible_drawables = visible;
        Ok(())
    }

    fn resize(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        let (width, height) = ctx.extent();
        ctx.outputs
            .resize(ctx.backend, Self::LIT.index(), width, height)?;
        ctx.outputs
            .resize(ctx.backend, Self::DEPTH.index(), width, height)?;

        let Some(resources) = self.resources.as_mut() else {
            return Err(GraphError::NotBaked);
        };
        for image in &mut resources.gbuffer {
            ctx.backend.resize_image(image, width, height)?;
        }
        Self::write_deferred_set(ctx.backend, resources)
    }

    fn free(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        let Some(resources) = self.resources.take() else {
            return Ok(());
        };
        self.params.environment_index = NO_ENVIRONMENT;
        resources.release(ctx.backend, ctx.exec)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::Vec3;

    use super::*;
    use crate::backend::dummy::{Command, DummyBackend};
    use crate::camera::Camera;
    use crate::render_graph::{
        ContextLimits, Drawable, ExecutionContext, Mesh, NodeId, Primitive, RenderGraph,
    };

    type Fixture = (
        DummyBackend,
        ExecutionContext,
        RenderGraph<DummyBackend>,
        NodeId,
    );

    fn setup(pass: GeometryPass) -> Fixture {
        setup_with_limits(pass, ContextLimits::default())
    }

    fn setup_with_limits(pass: GeometryPass, limits: ContextLimits) -> Fixture {
        let mut backend = DummyBackend::new(64, 48);
        let exec = ExecutionContext::new(&mut backend, 64, 48, limits).unwrap();
        let mut graph = RenderGraph::new();
        let node = graph.add_node(pass).unwrap();
        (backend, exec, graph, node)
    }

    fn mesh(
        backend: &mut DummyBackend,
        material_layout: DescriptorSetLayoutHandle,
        geometry_layout: DescriptorSetLayoutHandle,
    ) -> Arc<Mesh> {
        let material_set = backend.create_descriptor_set(material_layout).unwrap();
        let geometry_set = backend.create_descriptor_set(geometry_layout).unwrap();
        Arc::new(Mesh {
            primitives: vec![Primitive {
                geometry_set,
                material_set,
                meshlet_count: 7,
            }],
            bounds_center: Vec3::ZERO,
            bounds_radius: 0.5,
        })
    }

    #[test]
    fn test_init_claims_sampler_slots() {
        let (mut backend, mut exec, mut graph, node) = setup(GeometryPass::new());
        graph.bake(node, &mut backend, &mut exec).unwrap();

        assert_eq!(exec.sampler_heap.used_count(), 2);
        assert_eq!(exec.image_heap.used_count(), 0);
        let lit = graph.output_image(node, 0).unwrap();
        assert_eq!((lit.width, lit.height, lit.format), (64, 48, LIT_FORMAT));
        assert_eq!(graph.output_image(node, 1).unwrap().format, DEPTH_FORMAT);
    }

    #[test]
    fn test_culls_drawables_outside_frustum() {
        let (mut backend, mut exec, mut graph, node) = setup(GeometryPass::new());
        graph.bake(node, &mut backend, &mut exec).unwrap();

        let mut camera = Camera::default();
        camera.position = Vec3::new(0.0, 0.0, 5.0);
        exec.set_camera(&camera);

        // the dummy only checks that bound sets are alive
        let layout = exec.camera_layout();
        let mesh = mesh(&mut backend, layout, layout);
        exec.push_drawable(Drawable::new(mesh.clone(), Mat4::IDENTITY))
            .unwrap();
        exec.push_drawable(Drawable::new(
            mesh,
            Mat4::from_translation(Vec3::new(0.0, 0.0, 100.0)),
        ))
        .unwrap();

        backend.begin_frame().unwrap();
        graph.update(&mut backend, &mut exec).unwrap();

        let draws: Vec<_> = backend
            .frame_commands()
            .iter()
            .filter(|c| matches!(c, Command::DrawMeshlets { .. }))
            .collect();
        assert_eq!(draws, vec![&Command::DrawMeshlets { meshlet_count: 7 }]);
        assert!(backend
            .frame_commands()
            .contains(&Command::Draw { vertex_count: 4 }));

        let lit = graph.output_image(node, 0).unwrap();
        assert_eq!(
            backend.image_layout(lit.handle).unwrap(),
            ImageLayout::ShaderReadOnly
        );
    }

    #[test]
    fn test_params_uploaded_per_frame_slot() {
        let mut pass = GeometryPass::new();
        pass.set_show_meshlets(true);
        assert_eq!(pass.params().show_meshlets, 1);
        assert_eq!(pass.params().environment_index, NO_ENVIRONMENT);

        let (mut backend, mut exec, mut graph, node) = setup(pass);
        graph.bake(node, &mut backend, &mut exec).unwrap();
        backend.begin_frame().unwrap();
        graph.update(&mut backend, &mut exec).unwrap();
        backend.end_frame().unwrap();
        backend.present().unwrap();
        assert_eq!(backend.frames_presented(), 1);
    }

    #[test]
    fn test_environment_is_baked_once() {
        let (mut backend, mut exec, mut graph, node) =
            setup(GeometryPass::new().with_environment("sky.hdr"));
        graph.bake(node, &mut backend, &mut exec).unwrap();

        // the equirect image is freed again, the cube stays
        assert_eq!(exec.image_heap.used_count(), 1);
        assert_eq!(exec.sampler_heap.used_count(), 3);
        assert_eq!(backend.live_images(), 2 + 4 + 1);

        graph.free(&mut backend, &mut exec).unwrap();
        assert_eq!(exec.image_heap.used_count(), 0);
        assert_eq!(exec.sampler_heap.used_count(), 0);
        assert_eq!(backend.live_images(), 0);
    }

    #[test]
    fn test_resize_rewrites_deferred_inputs() {
        let (mut backend, mut exec, mut graph, node) = setup(GeometryPass::new());
        graph.bake(node, &mut backend, &mut exec).unwrap();
        let allocations = backend.total_image_allocations();

        exec.set_extent(32, 32);
        graph.resize(&mut backend, &mut exec).unwrap();
        // lit, depth and four G-buffer images
        assert_eq!(backend.total_image_allocations(), allocations + 6);
        assert_eq!(backend.live_images(), 6);
        assert_eq!(graph.output_image(node, 0).unwrap().width, 32);
        assert_eq!(graph.output_generation(node, 0).unwrap(), 2);

        graph.free(&mut backend, &mut exec).unwrap();
        assert_eq!(backend.live_images(), 0);
        assert_eq!(backend.live_pipelines(), 0);
        assert_eq!(backend.live_shaders(), 0);
        assert_eq!(backend.live_samplers(), 0);
    }

    #[test]
    fn test_full_sampler_heap_releases_partial_init() {
        let limits = ContextLimits {
            sampler_heap_capacity: 1,
            ..Default::default()
        };
        let (mut backend, mut exec, mut graph, node) =
            setup_with_limits(GeometryPass::new(), limits);
        let buffers = backend.live_buffers();
        let sets = backend.live_descriptor_sets();
        let layouts = backend.live_descriptor_set_layouts();

        assert!(graph.bake(node, &mut backend, &mut exec).is_err());
        assert_eq!(exec.sampler_heap.used_count(), 0);
        assert_eq!(backend.live_images(), 0);
        assert_eq!(backend.live_samplers(), 0);
        assert_eq!(backend.live_buffers(), buffers);
        assert_eq!(backend.live_descriptor_sets(), sets);
        assert_eq!(backend.live_descriptor_set_layouts(), layouts);
    }

    #[test]
    fn test_environment_released_when_its_sampler_does_not_fit() {
        // room for the two G-buffer samplers only
        let limits = ContextLimits {
            sampler_heap_capacity: 2,
            ..Default::default()
        };
        let (mut backend, mut exec, mut graph, node) =
            setup_with_limits(GeometryPass::new().with_environment("sky.hdr"), limits);
        let buffers = backend.live_buffers();
        let sets = backend.live_descriptor_sets();

        assert!(graph.bake(node, &mut backend, &mut exec).is_err());
        assert_eq!(exec.image_heap.used_count(), 0);
        assert_eq!(exec.sampler_heap.used_count(), 0);
        assert_eq!(backend.live_images(), 0);
        assert_eq!(backend.live_samplers(), 0);
        assert_eq!(backend.live_shaders(), 0);
        assert_eq!(backend.live_pipelines(), 0);
        assert_eq!(backend.live_buffers(), buffers);
        assert_eq!(backend.live_descriptor_sets(), sets);
    }
}
