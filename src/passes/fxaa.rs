//! FXAA post-process pass

use std::path::Path;

use ash::vk;

use crate::backend::{
    Buffer, DescriptorKind, DescriptorSetHandle, DescriptorSetLayoutDesc,
    DescriptorSetLayoutHandle, DescriptorWrite, GraphicsPipelineDesc, ImageDesc, ImageHandle,
    ImageLayout, ImageUsage, PipelineHandle, RenderBackend, RenderBegin, SamplerDesc,
    SamplerHandle, ShaderHandle, ShaderStages,
};
use crate::error::{GraphError, GraphResult};
use crate::passes::{create_fullscreen_quad, QUAD_ATTRIBUTES, QUAD_VERTEX_COUNT};
use crate::render_graph::{PassContext, PortId, RenderPass};

pub const OUTPUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Filled in as `init` creates each object.
#[derive(Debug, Default)]
struct FxaaResources {
    shaders: Vec<ShaderHandle>,
    set_layout: Option<DescriptorSetLayoutHandle>,
    set: Option<DescriptorSetHandle>,
    sampler: Option<SamplerHandle>,
    quad: Option<Buffer>,
    pipeline: Option<PipelineHandle>,
    /// Generation of the input the set was last written with.
    input_generation: u32,
}

impl FxaaResources {
    fn release<B: RenderBackend>(self, backend: &mut B) -> GraphResult<()> {
        if let Some(pipeline) = self.pipeline {
            backend.free_pipeline(pipeline)?;
        }
        if let Some(quad) = self.quad {
            backend.free_buffer(quad)?;
        }
        if let Some(sampler) = self.sampler {
            backend.destroy_sampler(sampler)?;
        }
        if let Some(set) = self.set {
            backend.free_descriptor_set(set)?;
        }
        if let Some(layout) = self.set_layout {
            backend.free_descriptor_set_layout(layout)?;
        }
        for shader in self.shaders {
            backend.free_shader(shader)?;
        }
        Ok(())
    }
}

/// Fast approximate anti-aliasing over one colour input.
///
/// The output is left in `TransferSrc` after every frame so a blit can read
/// it directly.
#[derive(Debug, Default)]
pub struct FxaaPass {
    resources: Option<FxaaResources>,
    /// The output holds no rendered frame yet.
    first_render: bool,
}

impl FxaaPass {
    pub const COLOR: PortId = PortId::input(0);
    pub const ANTI_ALIASED: PortId = PortId::output(0);

    pub fn new() -> Self {
        Self::default()
    }

    fn write_input<B: RenderBackend>(
        backend: &mut B,
        resources: &FxaaResources,
        input: ImageHandle,
    ) -> GraphResult<()> {
        let (Some(set), Some(sampler)) = (resources.set, resources.sampler) else {
            return Err(GraphError::NotBaked);
        };
        backend.write_descriptor(
            set,
            0,
            0,
            &DescriptorWrite::CombinedImageSampler {
                image: input,
                sampler,
            },
        )?;
        Ok(())
    }

    fn build<B: RenderBackend>(
        backend: &mut B,
        input: ImageHandle,
        resources: &mut FxaaResources,
    ) -> GraphResult<()> {
        let vertex_shader = backend.load_shader(Path::new("fxaa.vert.spv"))?;
        resources.shaders.push(vertex_shader);
        let fragment_shader = backend.load_shader(Path::new("fxaa.frag.spv"))?;
        resources.shaders.push(fragment_shader);
        let set_layout = backend.create_descriptor_set_layout(&DescriptorSetLayoutDesc::new(
            0,
            &[DescriptorKind::CombinedImageSampler],
        ))?;
        resources.set_layout = Some(set_layout);
        resources.set = Some(backend.create_descriptor_set(set_layout)?);
        resources.sampler = Some(backend.create_sampler(&SamplerDesc::linear())?);
        resources.quad = Some(create_fullscreen_quad(backend)?);

        let mut desc = GraphicsPipelineDesc::new(ShaderStages::Vertex {
            vertex: vertex_shader,
            fragment: fragment_shader,
        });
        desc.label = Some("fxaa".to_string());
        desc.vertex_attributes = QUAD_ATTRIBUTES.to_vec();
        desc.color_formats = vec![OUTPUT_FORMAT];
        desc.cull_mode = vk::CullModeFlags::NONE;
        desc.topology = vk::PrimitiveTopology::TRIANGLE_STRIP;
        desc.push_constant_size = std::mem::size_of::<[f32; 2]>() as u32;
        desc.set_layouts = vec![set_layout];
        resources.pipeline = Some(backend.create_graphics_pipeline(&desc)?);

        Self::write_input(backend, resources, input)
    }
}

impl<B: RenderBackend> RenderPass<B> for FxaaPass {
    fn name(&self) -> &str {
        "fxaa"
    }

    fn input_count(&self) -> u32 {
        1
    }

    fn output_count(&self) -> u32 {
        1
    }

    fn init(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        let (width, height) = ctx.extent();
        let input = ctx.input(Self::COLOR.index())?;
        let input_generation = ctx.input_generation(Self::COLOR.index())?;

        ctx.outputs.allocate(
            ctx.backend,
            Self::ANTI_ALIASED.index(),
            &ImageDesc::new_2d(width, height, OUTPUT_FORMAT, ImageUsage::RENDER_TARGET)
                .with_label("fxaa output"),
        )?;

        let backend = &mut *ctx.backend;
        let mut resources = FxaaResources {
            input_generation,
            ..Default::default()
        };
        if let Err(e) = Self::build(backend, input.handle, &mut resources) {
            log::warn!("FXAA init failed, releasing what was created: {}", e);
            resources.release(backend)?;
            return Err(e);
        }
        self.resources = Some(resources);
        self.first_render = true;
        Ok(())
    }

    fn update(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        let input = ctx.input(Self::COLOR.index())?;
        let input_generation = ctx.input_generation(Self::COLOR.index())?;
        if let Some(resources) = self.resources.as_mut() {
            if resources.input_generation != input_generation {
                Self::write_input(ctx.backend, resources, input.handle)?;
                resources.input_generation = input_generation;
            }
        }
        let Some(FxaaResources {
            set: Some(set),
            quad: Some(quad),
            pipeline: Some(pipeline),
            ..
        }) = self.resources.as_ref()
        else {
            return Err(GraphError::NotBaked);
        };
        let (set, pipeline, quad) = (*set, *pipeline, quad.handle());
        let output = ctx.outputs.image_ref(Self::ANTI_ALIASED.index())?;

        ctx.transition_to(input.handle, ImageLayout::ShaderReadOnly)?;
        let from = if self.first_render {
            ImageLayout::Undefined
        } else {
            ImageLayout::TransferSrc
        };
        ctx.transition(output.handle, from, ImageLayout::ColorAttachment)?;

        let cmd = ctx.cmd();
        let backend = &mut *ctx.backend;
        backend.cmd_begin_rendering(
            cmd,
            &RenderBegin::new(output.width, output.height).color(output.handle),
        )?;
        backend.cmd_set_viewport(cmd, output.width, output.height)?;
        backend.cmd_bind_pipeline(cmd, pipeline)?;
        backend.cmd_bind_descriptor_set(cmd, pipeline, set, 0)?;
        let screen_size = [output.width as f32, output.height as f32];
        backend.cmd_push_constants(cmd, pipeline, bytemuck::cast_slice(&screen_size))?;
        backend.cmd_bind_vertex_buffer(cmd, quad)?;
        backend.cmd_draw(cmd, QUAD_VERTEX_COUNT)?;
        backend.cmd_end_rendering(cmd)?;

        ctx.transition(
            output.handle,
            ImageLayout::ColorAttachment,
            ImageLayout::TransferSrc,
        )?;
        self.first_render = false;
        Ok(())
    }

    fn resize(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        let (width, height) = ctx.extent();
        ctx.outputs
            .resize(ctx.backend, Self::ANTI_ALIASED.index(), width, height)?;
        self.first_render = true;

        let input = ctx.input(Self::COLOR.index())?;
        let input_generation = ctx.input_generation(Self::COLOR.index())?;
        if let Some(resources) = self.resources.as_mut() {
            if resources.input_generation != input_generation {
                Self::write_input(ctx.backend, resources, input.handle)?;
                resources.input_generation = input_generation;
            }
        }
        Ok(())
    }

    fn free(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        match self.resources.take() {
            Some(resources) => resources.release(ctx.backend),
            None => Ok(()),
        }
    }
}
