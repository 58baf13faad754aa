//! Vulkan backend implementation using ash
//!
//! Two frame slots are cycled: each owns a command buffer, an image-available
//! and a render-finished semaphore, and an in-flight fence. `begin_frame`
//! waits on the slot's fence before acquiring, so at most
//! [`FRAMES_IN_FLIGHT`](crate::FRAMES_IN_FLIGHT) submissions are ever
//! outstanding. Memory comes from gpu-allocator; image layouts are tracked in
//! the shared [`LayoutTable`].

mod conversion;
mod descriptors;
mod device;
mod instance;
mod pipeline;
mod resources;
mod swapchain;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::backend::layout::{ImageBarrier, ImageLayout, LayoutTable};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::{RendererConfig, FRAMES_IN_FLIGHT};

use conversion::map_vk_error;
use descriptors::{VulkanSet, VulkanSetLayout};
use device::DeviceSelection;
use instance::DebugMessenger;
use pipeline::VulkanPipeline;
use resources::{VulkanBuffer, VulkanImage};
use swapchain::{FrameSync, SurfaceInfo, Swapchain};

#[derive(Debug, Clone, Copy)]
struct FrameSlot {
    command_buffer: CommandBufferHandle,
    sync: FrameSync,
}

/// Vulkan backend implementation
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    surface_fn: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    selection: DeviceSelection,
    device: ash::Device,
    mesh_shader_fn: Option<ash::ext::mesh_shader::Device>,
    queue: vk::Queue,
    allocator: Option<Mutex<Allocator>>,

    swapchain: Swapchain,
    swapchain_images: Vec<ImageHandle>,
    image_index: u32,
    vsync: bool,

    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    frames: Vec<FrameSlot>,
    frame_index: usize,
    recording: bool,

    layouts: LayoutTable,
    images: HashMap<ImageHandle, VulkanImage>,
    buffers: HashMap<BufferHandle, VulkanBuffer>,
    samplers: HashMap<SamplerHandle, vk::Sampler>,
    shaders: HashMap<ShaderHandle, vk::ShaderModule>,
    pipelines: HashMap<PipelineHandle, VulkanPipeline>,
    set_layouts: HashMap<DescriptorSetLayoutHandle, VulkanSetLayout>,
    sets: HashMap<DescriptorSetHandle, VulkanSet>,
    command_buffers: HashMap<CommandBufferHandle, vk::CommandBuffer>,

    shader_dir: PathBuf,
    next_id: u64,
}

impl VulkanBackend {
    /// Create a Vulkan backend rendering into `window`.
    ///
    /// The swapchain starts at `config.width`x`config.height` unless the
    /// surface dictates its own extent.
    pub fn new<W>(window: &W, config: &RendererConfig) -> BackendResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?
            .as_raw();

        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            BackendError::InitializationFailed(format!("Failed to load Vulkan: {}", e))
        })?;
        let (instance, debug) = instance::create_instance(&entry, display, config.validation)?;

        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display, window_handle, None)
        }
        .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;
        let surface_fn = ash::khr::surface::Instance::new(&entry, &instance);

        let selection = device::select_physical_device(&instance, &surface_fn, surface)?;
        let device = device::create_logical_device(&instance, &selection)?;
        let queue = unsafe { device.get_device_queue(selection.queue_family, 0) };
        let mesh_shader_fn = selection
            .mesh_shading
            .then(|| ash::ext::mesh_shader::Device::new(&instance, &device));

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device: selection.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| {
            BackendError::InitializationFailed(format!("Failed to create allocator: {}", e))
        })?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(selection.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| map_vk_error(e, BackendError::InitializationFailed))?;
        let descriptor_pool = descriptors::create_descriptor_pool(&device)?;

        let swapchain = Swapchain::new(
            ash::khr::swapchain::Device::new(&instance, &device),
            &device,
            &SurfaceInfo {
                surface_fn: &surface_fn,
                surface,
                physical_device: selection.physical_device,
            },
            (config.width, config.height),
            config.vsync,
            vk::SwapchainKHR::null(),
        )?;

        let mut backend = Self {
            _entry: entry,
            instance,
            debug,
            surface_fn,
            surface,
            selection,
            device,
            mesh_shader_fn,
            queue,
            allocator: Some(Mutex::new(allocator)),
            swapchain,
            swapchain_images: Vec::new(),
            image_index: 0,
            vsync: config.vsync,
            command_pool,
            descriptor_pool,
            frames: Vec::with_capacity(FRAMES_IN_FLIGHT),
            frame_index: 0,
            recording: false,
            layouts: LayoutTable::new(),
            images: HashMap::new(),
            buffers: HashMap::new(),
            samplers: HashMap::new(),
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
            set_layouts: HashMap::new(),
            sets: HashMap::new(),
            command_buffers: HashMap::new(),
            shader_dir: config.shader_dir.clone(),
            next_id: 0,
        };
        backend.register_swapchain_images();
        for _ in 0..FRAMES_IN_FLIGHT {
            let command_buffer = backend.create_command_buffer(QueueKind::Graphics)?;
            let sync = FrameSync::new(&backend.device)?;
            backend.frames.push(FrameSlot {
                command_buffer,
                sync,
            });
        }

        log::info!(
            "Vulkan backend ready ({} frames in flight, mesh shading: {})",
            FRAMES_IN_FLIGHT,
            backend.selection.mesh_shading
        );
        Ok(backend)
    }

    pub fn supports_mesh_shading(&self) -> bool {
        self.mesh_shader_fn.is_some()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn allocator(&self) -> BackendResult<MutexGuard<'_, Allocator>> {
        self.allocator
            .as_ref()
            .map(|allocator| allocator.lock())
            .ok_or_else(|| BackendError::InitializationFailed("allocator destroyed".to_string()))
    }

    fn vk_image(&self, image: ImageHandle) -> BackendResult<&VulkanImage> {
        self.images.get(&image).ok_or(BackendError::UnknownHandle {
            kind: "image",
            id: image.raw(),
        })
    }

    fn vk_buffer(&self, buffer: BufferHandle) -> BackendResult<vk::Buffer> {
        self.buffers
            .get(&buffer)
            .map(|b| b.buffer)
            .ok_or(BackendError::UnknownHandle {
                kind: "buffer",
                id: buffer.raw(),
            })
    }

    fn vk_sampler(&self, sampler: SamplerHandle) -> BackendResult<vk::Sampler> {
        self.samplers
            .get(&sampler)
            .copied()
            .ok_or(BackendError::UnknownHandle {
                kind: "sampler",
                id: sampler.raw(),
            })
    }

    fn vk_pipeline(&self, pipeline: PipelineHandle) -> BackendResult<&VulkanPipeline> {
        self.pipelines
            .get(&pipeline)
            .ok_or(BackendError::UnknownHandle {
                kind: "pipeline",
                id: pipeline.raw(),
            })
    }

    fn vk_command_buffer(&self, cmd: CommandBufferHandle) -> BackendResult<vk::CommandBuffer> {
        self.command_buffers
            .get(&cmd)
            .copied()
            .ok_or(BackendError::UnknownHandle {
                kind: "command buffer",
                id: cmd.raw(),
            })
    }

    /// Give every swapchain image a handle in the shared layout table.
    fn register_swapchain_images(&mut self) {
        let extent = self.swapchain.extent;
        let format = self.swapchain.format;
        for i in 0..self.swapchain.images.len() {
            let handle = ImageHandle(self.next_id());
            self.images.insert(
                handle,
                VulkanImage {
                    image: self.swapchain.images[i],
                    view: self.swapchain.views[i],
                    allocation: None,
                    desc: ImageDesc::new_2d(
                        extent.width,
                        extent.height,
                        format,
                        ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_DST,
                    )
                    .with_label("swapchain"),
                },
            );
            self.layouts.insert(handle, ImageLayout::Undefined);
            self.swapchain_images.push(handle);
        }
    }

    fn unregister_swapchain_images(&mut self) {
        for handle in std::mem::take(&mut self.swapchain_images) {
            self.images.remove(&handle);
            self.layouts.remove(handle);
        }
    }

    fn submit_and_wait(&self, command_buffer: vk::CommandBuffer) -> BackendResult<()> {
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        }
        .map_err(|e| map_vk_error(e, BackendError::SubmitFailed))?;
        let result = unsafe {
            self.device
                .queue_submit(self.queue, &[submit], fence)
                .and_then(|()| self.device.wait_for_fences(&[fence], true, u64::MAX))
        };
        unsafe { self.device.destroy_fence(fence, None) };
        result.map_err(|e| map_vk_error(e, BackendError::SubmitFailed))
    }
}

impl RenderBackend for VulkanBackend {
    fn begin_frame(&mut self) -> BackendResult<()> {
        let slot = self.frames[self.frame_index];
        unsafe {
            self.device
                .wait_for_fences(&[slot.sync.in_flight], true, u64::MAX)
        }
        .map_err(|e| map_vk_error(e, BackendError::SubmitFailed))?;

        let acquired = unsafe {
            self.swapchain.loader.acquire_next_image(
                self.swapchain.handle,
                u64::MAX,
                slot.sync.image_available,
                vk::Fence::null(),
            )
        };
        let (index, suboptimal) = match acquired {
            Ok(acquired) => acquired,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain out of date on acquire");
                return Err(BackendError::SurfaceLost);
            }
            Err(e) => return Err(map_vk_error(e, BackendError::AcquireImageFailed)),
        };
        if suboptimal {
            log::warn!("Swapchain is suboptimal");
        }
        self.image_index = index;

        let command_buffer = self.vk_command_buffer(slot.command_buffer)?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .and_then(|()| {
                    self.device
                        .begin_command_buffer(command_buffer, &begin_info)
                })
        }
        .map_err(|e| map_vk_error(e, BackendError::CommandRecordingFailed))?;

        self.recording = true;
        log::trace!(
            "Begin frame slot {} (swapchain image {})",
            self.frame_index,
            index
        );
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if !self.recording {
            return Err(BackendError::NotRecording);
        }
        let slot = self.frames[self.frame_index];
        let command_buffer = self.vk_command_buffer(slot.command_buffer)?;
        unsafe { self.device.end_command_buffer(command_buffer) }
            .map_err(|e| map_vk_error(e, BackendError::CommandRecordingFailed))?;

        let wait_semaphores = [slot.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::TRANSFER];
        let signal_semaphores = [slot.sync.render_finished];
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        // reset only once work is certain to be submitted, an abandoned frame
        // must leave the fence signalled
        unsafe {
            self.device
                .reset_fences(&[slot.sync.in_flight])
                .and_then(|()| {
                    self.device
                        .queue_submit(self.queue, &[submit], slot.sync.in_flight)
                })
        }
        .map_err(|e| map_vk_error(e, BackendError::SubmitFailed))?;

        self.recording = false;
        Ok(())
    }

    fn present(&mut self) -> BackendResult<()> {
        if self.recording {
            return Err(BackendError::PresentFailed(
                "frame still recording".to_string(),
            ));
        }
        let slot = self.frames[self.frame_index];
        let wait_semaphores = [slot.sync.render_finished];
        let swapchains = [self.swapchain.handle];
        let image_indices = [self.image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain.loader.queue_present(self.queue, &present_info) } {
            Ok(false) => {}
            Ok(true) => log::warn!("Swapchain is suboptimal"),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain out of date on present")
            }
            Err(e) => return Err(map_vk_error(e, BackendError::PresentFailed)),
        }

        self.frame_index = (self.frame_index + 1) % FRAMES_IN_FLIGHT;
        Ok(())
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| map_vk_error(e, BackendError::SubmitFailed))
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        self.wait_idle()?;
        let swapchain = Swapchain::new(
            self.swapchain.loader.clone(),
            &self.device,
            &SurfaceInfo {
                surface_fn: &self.surface_fn,
                surface: self.surface,
                physical_device: self.selection.physical_device,
            },
            (width, height),
            self.vsync,
            self.swapchain.handle,
        )?;
        self.unregister_swapchain_images();
        let mut old = std::mem::replace(&mut self.swapchain, swapchain);
        unsafe { old.destroy(&self.device) };
        self.register_swapchain_images();
        self.image_index = 0;
        Ok(())
    }

    fn frame_index(&self) -> usize {
        self.frame_index
    }

    fn frame_command_buffer(&self) -> CommandBufferHandle {
        self.frames[self.frame_index].command_buffer
    }

    fn swapchain_image(&self) -> ImageRef {
        ImageRef {
            handle: self.swapchain_images[self.image_index as usize],
            width: self.swapchain.extent.width,
            height: self.swapchain.extent.height,
            format: self.swapchain.format,
        }
    }

    fn swapchain_extent(&self) -> (u32, u32) {
        (self.swapchain.extent.width, self.swapchain.extent.height)
    }

    fn allocate_image(&mut self, desc: &ImageDesc) -> BackendResult<Image> {
        self.create_image(desc)
    }

    fn free_image(&mut self, image: Image) -> BackendResult<()> {
        self.destroy_image(image.handle())
    }

    fn load_image(&mut self, path: &Path) -> BackendResult<Image> {
        self.load_rgba8(path)
    }

    fn load_hdr_image(&mut self, path: &Path) -> BackendResult<Image> {
        self.load_rgba32f(path)
    }

    fn image_layout(&self, image: ImageHandle) -> BackendResult<ImageLayout> {
        self.layouts.get(image)
    }

    fn allocate_buffer(&mut self, desc: &BufferDesc) -> BackendResult<Buffer> {
        self.create_buffer(desc)
    }

    fn free_buffer(&mut self, buffer: Buffer) -> BackendResult<()> {
        self.destroy_buffer(buffer.handle())
    }

    fn upload_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> BackendResult<()> {
        self.write_buffer(buffer, data)
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> BackendResult<SamplerHandle> {
        self.create_vk_sampler(desc)
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> BackendResult<()> {
        let vk_sampler = self
            .samplers
            .remove(&sampler)
            .ok_or(BackendError::UnknownHandle {
                kind: "sampler",
                id: sampler.raw(),
            })?;
        unsafe { self.device.destroy_sampler(vk_sampler, None) };
        Ok(())
    }

    fn load_shader(&mut self, path: &Path) -> BackendResult<ShaderHandle> {
        self.create_shader_module(path)
    }

    fn free_shader(&mut self, shader: ShaderHandle) -> BackendResult<()> {
        let module = self
            .shaders
            .remove(&shader)
            .ok_or(BackendError::UnknownHandle {
                kind: "shader",
                id: shader.raw(),
            })?;
        unsafe { self.device.destroy_shader_module(module, None) };
        Ok(())
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc,
    ) -> BackendResult<PipelineHandle> {
        self.build_graphics_pipeline(desc)
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDesc,
    ) -> BackendResult<PipelineHandle> {
        self.build_compute_pipeline(desc)
    }

    fn free_pipeline(&mut self, pipeline: PipelineHandle) -> BackendResult<()> {
        let pipeline = self
            .pipelines
            .remove(&pipeline)
            .ok_or(BackendError::UnknownHandle {
                kind: "pipeline",
                id: pipeline.raw(),
            })?;
        self.release_pipeline(pipeline);
        Ok(())
    }

    fn create_descriptor_set_layout(
        &mut self,
        desc: &DescriptorSetLayoutDesc,
    ) -> BackendResult<DescriptorSetLayoutHandle> {
        self.create_set_layout(desc)
    }

    fn free_descriptor_set_layout(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<()> {
        self.destroy_set_layout(layout)
    }

    fn create_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle> {
        self.allocate_set(layout)
    }

    fn free_descriptor_set(&mut self, set: DescriptorSetHandle) -> BackendResult<()> {
        self.release_set(set)
    }

    fn write_descriptor(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        array_element: u32,
        write: &DescriptorWrite,
    ) -> BackendResult<()> {
        self.update_set(set, binding, array_element, write)
    }

    fn create_heap_set(
        &mut self,
        kind: HeapKind,
        capacity: u32,
    ) -> BackendResult<(DescriptorSetLayoutHandle, DescriptorSetHandle)> {
        self.create_heap(kind, capacity)
    }

    fn create_command_buffer(&mut self, queue: QueueKind) -> BackendResult<CommandBufferHandle> {
        // the selected family carries both graphics and compute
        log::trace!("Allocating {:?} command buffer", queue);
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&allocate_info) }
            .map_err(|e| map_vk_error(e, BackendError::CommandRecordingFailed))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                BackendError::CommandRecordingFailed("no command buffer allocated".to_string())
            })?;
        let handle = CommandBufferHandle(self.next_id());
        self.command_buffers.insert(handle, command_buffer);
        Ok(handle)
    }

    fn begin_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
        }
        .map_err(|e| map_vk_error(e, BackendError::CommandRecordingFailed))
    }

    fn submit_command_buffer_and_wait(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        unsafe { self.device.end_command_buffer(command_buffer) }
            .map_err(|e| map_vk_error(e, BackendError::CommandRecordingFailed))?;
        self.submit_and_wait(command_buffer)
    }

    fn free_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        if self.frames.iter().any(|slot| slot.command_buffer == cmd) {
            return Err(BackendError::CommandRecordingFailed(
                "frame command buffers are owned by the backend".to_string(),
            ));
        }
        let command_buffer = self
            .command_buffers
            .remove(&cmd)
            .ok_or(BackendError::UnknownHandle {
                kind: "command buffer",
                id: cmd.raw(),
            })?;
        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &[command_buffer])
        };
        Ok(())
    }

    fn cmd_transition_image(
        &mut self,
        cmd: CommandBufferHandle,
        image: ImageHandle,
        barrier: &ImageBarrier,
    ) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        let target = self.vk_image(image)?;
        let vk_image = target.image;
        let aspect_mask = image_aspect(target.desc.format);

        self.layouts.transition(image, barrier)?;

        let image_barrier = vk::ImageMemoryBarrier::default()
            .old_layout(barrier.from.to_vk())
            .new_layout(barrier.to.to_vk())
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(vk_image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: barrier.base_layer,
                layer_count: barrier.layer_count.unwrap_or(vk::REMAINING_ARRAY_LAYERS),
            });
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier],
            );
        }
        Ok(())
    }

    fn cmd_begin_rendering(
        &mut self,
        cmd: CommandBufferHandle,
        begin: &RenderBegin,
    ) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;

        let mut color_attachments = Vec::with_capacity(begin.color_images.len());
        for &image in &begin.color_images {
            let layout = self.layouts.get(image)?;
            if layout != ImageLayout::ColorAttachment {
                return Err(BackendError::LayoutMismatch {
                    claimed: ImageLayout::ColorAttachment,
                    actual: layout,
                });
            }
            color_attachments.push(
                vk::RenderingAttachmentInfo::default()
                    .image_view(self.vk_image(image)?.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(if begin.load_color {
                        vk::AttachmentLoadOp::LOAD
                    } else {
                        vk::AttachmentLoadOp::CLEAR
                    })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: begin.clear_color,
                        },
                    }),
            );
        }

        let depth_attachment = match begin.depth_image {
            Some(image) => {
                let layout = self.layouts.get(image)?;
                if !layout.is_depth() {
                    return Err(BackendError::LayoutMismatch {
                        claimed: ImageLayout::DepthAttachment,
                        actual: layout,
                    });
                }
                Some(
                    vk::RenderingAttachmentInfo::default()
                        .image_view(self.vk_image(image)?.view)
                        .image_layout(layout.to_vk())
                        .load_op(if begin.load_depth {
                            vk::AttachmentLoadOp::LOAD
                        } else {
                            vk::AttachmentLoadOp::CLEAR
                        })
                        .store_op(vk::AttachmentStoreOp::STORE)
                        .clear_value(vk::ClearValue {
                            depth_stencil: vk::ClearDepthStencilValue {
                                depth: 1.0,
                                stencil: 0,
                            },
                        }),
                )
            }
            None => None,
        };

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: begin.width,
                    height: begin.height,
                },
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        unsafe {
            self.device
                .cmd_begin_rendering(command_buffer, &rendering_info)
        };
        Ok(())
    }

    fn cmd_end_rendering(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        unsafe { self.device.cmd_end_rendering(command_buffer) };
        Ok(())
    }

    fn cmd_set_viewport(
        &mut self,
        cmd: CommandBufferHandle,
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        };
        unsafe {
            self.device
                .cmd_set_viewport(command_buffer, 0, &[viewport]);
            self.device.cmd_set_scissor(command_buffer, 0, &[scissor]);
        }
        Ok(())
    }

    fn cmd_set_depth_bounds(
        &mut self,
        cmd: CommandBufferHandle,
        min: f32,
        max: f32,
    ) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        if !self.selection.depth_bounds {
            log::warn!("Depth bounds requested but not supported by the device");
            return Ok(());
        }
        unsafe { self.device.cmd_set_depth_bounds(command_buffer, min, max) };
        Ok(())
    }

    fn cmd_bind_pipeline(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
    ) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        let pipeline = self.vk_pipeline(pipeline)?;
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, pipeline.bind_point, pipeline.pipeline)
        };
        Ok(())
    }

    fn cmd_bind_vertex_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
    ) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        let buffer = self.vk_buffer(buffer)?;
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(command_buffer, 0, &[buffer], &[0])
        };
        Ok(())
    }

    fn cmd_bind_index_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
    ) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        let buffer = self.vk_buffer(buffer)?;
        unsafe {
            self.device
                .cmd_bind_index_buffer(command_buffer, buffer, 0, vk::IndexType::UINT32)
        };
        Ok(())
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        set: DescriptorSetHandle,
        index: u32,
    ) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        let pipeline = self.vk_pipeline(pipeline)?;
        let set = self
            .sets
            .get(&set)
            .ok_or(BackendError::UnknownHandle {
                kind: "descriptor set",
                id: set.raw(),
            })?
            .set;
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                pipeline.bind_point,
                pipeline.layout,
                index,
                &[set],
                &[],
            )
        };
        Ok(())
    }

    fn cmd_push_constants(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        data: &[u8],
    ) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        let pipeline = self.vk_pipeline(pipeline)?;
        unsafe {
            self.device.cmd_push_constants(
                command_buffer,
                pipeline.layout,
                pipeline.push_stages,
                0,
                data,
            )
        };
        Ok(())
    }

    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        unsafe { self.device.cmd_draw(command_buffer, vertex_count, 1, 0, 0) };
        Ok(())
    }

    fn cmd_draw_indexed(
        &mut self,
        cmd: CommandBufferHandle,
        index_count: u32,
    ) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        unsafe {
            self.device
                .cmd_draw_indexed(command_buffer, index_count, 1, 0, 0, 0)
        };
        Ok(())
    }

    fn cmd_draw_meshlets(
        &mut self,
        cmd: CommandBufferHandle,
        meshlet_count: u32,
    ) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        let mesh_shader_fn = self.mesh_shader_fn.as_ref().ok_or_else(|| {
            BackendError::CommandRecordingFailed(
                "mesh shading is not supported by this device".to_string(),
            )
        })?;
        unsafe { mesh_shader_fn.cmd_draw_mesh_tasks(command_buffer, meshlet_count, 1, 1) };
        Ok(())
    }

    fn cmd_dispatch(
        &mut self,
        cmd: CommandBufferHandle,
        x: u32,
        y: u32,
        z: u32,
    ) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        unsafe { self.device.cmd_dispatch(command_buffer, x, y, z) };
        Ok(())
    }

    fn cmd_blit_image(
        &mut self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
    ) -> BackendResult<()> {
        let command_buffer = self.vk_command_buffer(cmd)?;
        for (image, expected) in [(src, ImageLayout::TransferSrc), (dst, ImageLayout::TransferDst)] {
            let layout = self.layouts.get(image)?;
            if layout != expected {
                return Err(BackendError::LayoutMismatch {
                    claimed: expected,
                    actual: layout,
                });
            }
        }
        let src = self.vk_image(src)?;
        let dst = self.vk_image(dst)?;

        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let corner = |width: u32, height: u32| vk::Offset3D {
            x: width as i32,
            y: height as i32,
            z: 1,
        };
        let region = vk::ImageBlit {
            src_subresource: subresource,
            src_offsets: [
                vk::Offset3D::default(),
                corner(src.desc.width, src.desc.height),
            ],
            dst_subresource: subresource,
            dst_offsets: [
                vk::Offset3D::default(),
                corner(dst.desc.width, dst.desc.height),
            ],
        };
        unsafe {
            self.device.cmd_blit_image(
                command_buffer,
                src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::LINEAR,
            )
        };
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("Failed to wait for device idle during teardown: {}", e);
            }
        }

        self.unregister_swapchain_images();
        for (_, pipeline) in std::mem::take(&mut self.pipelines) {
            self.release_pipeline(pipeline);
        }
        for (_, image) in std::mem::take(&mut self.images) {
            self.release_image(image);
        }
        for (_, buffer) in std::mem::take(&mut self.buffers) {
            self.release_buffer(buffer);
        }

        unsafe {
            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, module) in self.shaders.drain() {
                self.device.destroy_shader_module(module, None);
            }
            // sets go with the pool
            self.sets.clear();
            self.device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            for (_, layout) in self.set_layouts.drain() {
                self.device
                    .destroy_descriptor_set_layout(layout.layout, None);
            }
            for slot in &self.frames {
                slot.sync.destroy(&self.device);
            }
            self.command_buffers.clear();
            self.device.destroy_command_pool(self.command_pool, None);
            self.swapchain.destroy(&self.device);
        }

        // the allocator must go before the device
        self.allocator.take();

        unsafe {
            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            if let Some(debug) = self.debug.take() {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
        log::info!("Vulkan backend destroyed");
    }
}
