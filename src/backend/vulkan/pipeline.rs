//! Shader modules and pipelines.

use std::io::{Cursor, ErrorKind};
use std::path::Path;

use ash::vk;

use super::conversion::map_vk_error;
use super::VulkanBackend;
use crate::backend::{
    format_size, vertex_stride, BackendError, BackendResult, ComputePipelineDesc,
    DescriptorSetLayoutHandle, GraphicsPipelineDesc, PipelineHandle, ShaderHandle, ShaderStages,
};

const ENTRY_POINT: &std::ffi::CStr = c"main";

pub struct VulkanPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    /// Stages the push constant range was declared for.
    pub push_stages: vk::ShaderStageFlags,
}

impl VulkanBackend {
    /// Read a SPIR-V binary relative to the shader directory.
    pub(super) fn create_shader_module(&mut self, path: &Path) -> BackendResult<ShaderHandle> {
        let full_path = self.shader_dir.join(path);
        let bytes = std::fs::read(&full_path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => BackendError::ShaderNotFound {
                path: full_path.clone(),
            },
            _ => BackendError::ShaderCreationFailed(format!("{}: {}", full_path.display(), e)),
        })?;
        // read_spv rejects sizes that are not a whole number of words
        let code = ash::util::read_spv(&mut Cursor::new(&bytes)).map_err(|e| {
            BackendError::ShaderCreationFailed(format!("{}: {}", full_path.display(), e))
        })?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|e| map_vk_error(e, BackendError::ShaderCreationFailed))?;

        let handle = ShaderHandle(self.next_id());
        self.shaders.insert(handle, module);
        log::debug!("Loaded shader {}", full_path.display());
        Ok(handle)
    }

    fn shader_module(&self, shader: ShaderHandle) -> BackendResult<vk::ShaderModule> {
        self.shaders
            .get(&shader)
            .copied()
            .ok_or(BackendError::UnknownHandle {
                kind: "shader",
                id: shader.raw(),
            })
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[DescriptorSetLayoutHandle],
        push_constant_size: u32,
        push_stages: vk::ShaderStageFlags,
    ) -> BackendResult<vk::PipelineLayout> {
        let set_layouts = set_layouts
            .iter()
            .map(|handle| {
                self.set_layouts
                    .get(handle)
                    .map(|layout| layout.layout)
                    .ok_or(BackendError::UnknownHandle {
                        kind: "descriptor set layout",
                        id: handle.raw(),
                    })
            })
            .collect::<BackendResult<Vec<_>>>()?;
        let push_ranges: Vec<_> = (push_constant_size > 0)
            .then(|| vk::PushConstantRange {
                stage_flags: push_stages,
                offset: 0,
                size: push_constant_size,
            })
            .into_iter()
            .collect();

        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        unsafe { self.device.create_pipeline_layout(&create_info, None) }
            .map_err(|e| map_vk_error(e, BackendError::PipelineCreationFailed))
    }

    pub(super) fn build_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc,
    ) -> BackendResult<PipelineHandle> {
        let (stages, push_stages) = match desc.stages {
            ShaderStages::Vertex { vertex, fragment } => (
                vec![
                    (vk::ShaderStageFlags::VERTEX, vertex),
                    (vk::ShaderStageFlags::FRAGMENT, fragment),
                ],
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            ),
            ShaderStages::Mesh {
                task,
                mesh,
                fragment,
            } => {
                if self.mesh_shader_fn.is_none() {
                    return Err(BackendError::PipelineCreationFailed(
                        "mesh shading is not supported by this device".to_string(),
                    ));
                }
                let mut stages = Vec::with_capacity(3);
                if let Some(task) = task {
                    stages.push((vk::ShaderStageFlags::TASK_EXT, task));
                }
                stages.push((vk::ShaderStageFlags::MESH_EXT, mesh));
                stages.push((vk::ShaderStageFlags::FRAGMENT, fragment));
                (
                    stages,
                    vk::ShaderStageFlags::TASK_EXT
                        | vk::ShaderStageFlags::MESH_EXT
                        | vk::ShaderStageFlags::FRAGMENT,
                )
            }
        };
        let stage_infos = stages
            .iter()
            .map(|&(stage, shader)| -> BackendResult<_> {
                Ok(vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(self.shader_module(shader)?)
                    .name(ENTRY_POINT))
            })
            .collect::<BackendResult<Vec<_>>>()?;

        let stride = vertex_stride(&desc.vertex_attributes)?;
        let mut offset = 0;
        let attributes: Vec<_> = desc
            .vertex_attributes
            .iter()
            .enumerate()
            .map(|(location, &format)| {
                let attribute = vk::VertexInputAttributeDescription {
                    location: location as u32,
                    binding: 0,
                    format,
                    offset,
                };
                offset += format_size(format).unwrap_or(0);
                attribute
            })
            .collect();
        let bindings: Vec<_> = (!attributes.is_empty())
            .then(|| vk::VertexInputBindingDescription {
                binding: 0,
                stride,
                input_rate: vk::VertexInputRate::VERTEX,
            })
            .into_iter()
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(desc.topology);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let mut rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1.0);
        if desc.depth_bias {
            rasterization = rasterization
                .depth_bias_enable(true)
                .depth_bias_constant_factor(1.25)
                .depth_bias_slope_factor(1.75);
        }

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let has_depth = desc.depth_format.is_some();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(has_depth)
            .depth_write_enable(has_depth && desc.depth_write)
            .depth_compare_op(desc.depth_compare);

        let blend_attachments: Vec<_> = desc
            .color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(false)
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&desc.color_formats)
            .depth_attachment_format(desc.depth_format.unwrap_or(vk::Format::UNDEFINED));

        let layout =
            self.create_pipeline_layout(&desc.set_layouts, desc.push_constant_size, push_stages)?;

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .push_next(&mut rendering);

        let pipeline = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
        };
        let pipeline = match pipeline {
            Ok(pipelines) => pipelines.first().copied(),
            Err((_, e)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(map_vk_error(e, BackendError::PipelineCreationFailed));
            }
        };
        let Some(pipeline) = pipeline else {
            unsafe { self.device.destroy_pipeline_layout(layout, None) };
            return Err(BackendError::PipelineCreationFailed(
                "no pipeline returned".to_string(),
            ));
        };

        log::debug!("Created graphics pipeline {:?}", desc.label);
        Ok(self.register_pipeline(VulkanPipeline {
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            push_stages,
        }))
    }

    pub(super) fn build_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDesc,
    ) -> BackendResult<PipelineHandle> {
        let module = self.shader_module(desc.shader)?;
        let push_stages = vk::ShaderStageFlags::COMPUTE;
        let layout =
            self.create_pipeline_layout(&desc.set_layouts, desc.push_constant_size, push_stages)?;

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(ENTRY_POINT);
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let pipeline = match unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        } {
            Ok(pipelines) => pipelines.first().copied(),
            Err((_, e)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(map_vk_error(e, BackendError::PipelineCreationFailed));
            }
        };
        let Some(pipeline) = pipeline else {
            unsafe { self.device.destroy_pipeline_layout(layout, None) };
            return Err(BackendError::PipelineCreationFailed(
                "no pipeline returned".to_string(),
            ));
        };

        log::debug!("Created compute pipeline {:?}", desc.label);
        Ok(self.register_pipeline(VulkanPipeline {
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            push_stages,
        }))
    }

    fn register_pipeline(&mut self, pipeline: VulkanPipeline) -> PipelineHandle {
        let handle = PipelineHandle(self.next_id());
        self.pipelines.insert(handle, pipeline);
        handle
    }

    pub(super) fn release_pipeline(&self, pipeline: VulkanPipeline) {
        unsafe {
            self.device.destroy_pipeline(pipeline.pipeline, None);
            self.device.destroy_pipeline_layout(pipeline.layout, None);
        }
    }
}
