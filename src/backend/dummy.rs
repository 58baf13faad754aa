//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't perform actual GPU operations. It keeps the same
//! bookkeeping a real backend would: handles, image layouts, descriptor
//! contents, buffer contents, and a simulated fence per frame slot. Every
//! recorded command is kept so tests can inspect what a frame did.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use ash::vk;

use crate::backend::layout::{ImageBarrier, ImageLayout, LayoutTable};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::FRAMES_IN_FLIGHT;

const SWAPCHAIN_IMAGE_COUNT: usize = 3;

/// A command recorded into a dummy command buffer
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Transition {
        image: ImageHandle,
        from: ImageLayout,
        to: ImageLayout,
    },
    BeginRendering {
        color_images: Vec<ImageHandle>,
        depth_image: Option<ImageHandle>,
        width: u32,
        height: u32,
    },
    EndRendering,
    SetViewport {
        width: u32,
        height: u32,
    },
    SetDepthBounds {
        min: f32,
        max: f32,
    },
    BindPipeline(PipelineHandle),
    BindVertexBuffer(BufferHandle),
    BindIndexBuffer(BufferHandle),
    BindDescriptorSet {
        set: DescriptorSetHandle,
        index: u32,
    },
    PushConstants {
        size: usize,
    },
    Draw {
        vertex_count: u32,
    },
    DrawIndexed {
        index_count: u32,
    },
    DrawMeshlets {
        meshlet_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    Blit {
        src: ImageHandle,
        dst: ImageHandle,
    },
}

#[derive(Debug)]
struct DummyLayout {
    kinds: Vec<DescriptorKind>,
    heap_capacity: Option<u32>,
}

#[derive(Debug)]
struct DummySet {
    layout: DescriptorSetLayoutHandle,
    writes: HashMap<(u32, u32), DescriptorWrite>,
}

#[derive(Debug, Default)]
struct DummyCommandBuffer {
    recording: bool,
    commands: Vec<Command>,
}

#[derive(Debug, Default, Clone, Copy)]
struct FrameSlot {
    /// Submitted and not yet waited on.
    in_flight: bool,
    submissions: u64,
}

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    next_id: u64,
    layouts: LayoutTable,
    images: HashMap<ImageHandle, ImageDesc>,
    buffers: HashMap<BufferHandle, (BufferDesc, Vec<u8>)>,
    samplers: HashSet<SamplerHandle>,
    shaders: HashMap<ShaderHandle, PathBuf>,
    pipelines: HashSet<PipelineHandle>,
    set_layouts: HashMap<DescriptorSetLayoutHandle, DummyLayout>,
    sets: HashMap<DescriptorSetHandle, DummySet>,
    command_buffers: HashMap<CommandBufferHandle, DummyCommandBuffer>,

    swapchain_images: Vec<ImageHandle>,
    swapchain_index: usize,
    extent: (u32, u32),

    frame_commands: [CommandBufferHandle; FRAMES_IN_FLIGHT],
    slots: [FrameSlot; FRAMES_IN_FLIGHT],
    frame_index: usize,
    recording: bool,
    fence_waits: u64,
    frames_presented: u64,

    total_image_allocations: u64,
    total_buffer_allocations: u64,
}

impl DummyBackend {
    /// Create a new dummy backend with a swapchain of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        let mut backend = Self {
            next_id: 1,
            layouts: LayoutTable::new(),
            images: HashMap::new(),
            buffers: HashMap::new(),
            samplers: HashSet::new(),
            shaders: HashMap::new(),
            pipelines: HashSet::new(),
            set_layouts: HashMap::new(),
            sets: HashMap::new(),
            command_buffers: HashMap::new(),
            swapchain_images: Vec::new(),
            swapchain_index: 0,
            extent: (width, height),
            frame_commands: [CommandBufferHandle(0); FRAMES_IN_FLIGHT],
            slots: [FrameSlot::default(); FRAMES_IN_FLIGHT],
            frame_index: 0,
            recording: false,
            fence_waits: 0,
            frames_presented: 0,
            total_image_allocations: 0,
            total_buffer_allocations: 0,
        };
        for slot in 0..FRAMES_IN_FLIGHT {
            let cmd = CommandBufferHandle(backend.next_id());
            backend
                .command_buffers
                .insert(cmd, DummyCommandBuffer::default());
            backend.frame_commands[slot] = cmd;
        }
        backend.create_swapchain_images();
        backend
    }

    /// Get the backend name.
    pub fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create_swapchain_images(&mut self) {
        for _ in 0..SWAPCHAIN_IMAGE_COUNT {
            let handle = ImageHandle(self.next_id());
            self.layouts.insert(handle, ImageLayout::Undefined);
            self.swapchain_images.push(handle);
        }
    }

    fn destroy_swapchain_images(&mut self) {
        for handle in self.swapchain_images.drain(..) {
            self.layouts.remove(handle);
        }
    }

    fn record(&mut self, cmd: CommandBufferHandle, command: Command) -> BackendResult<()> {
        log::trace!("DummyBackend: {:?} on command buffer {}", command, cmd.0);
        let buffer = self
            .command_buffers
            .get_mut(&cmd)
            .ok_or(BackendError::UnknownHandle {
                kind: "command buffer",
                id: cmd.0,
            })?;
        if !buffer.recording {
            return Err(BackendError::CommandRecordingFailed(format!(
                "command buffer {} is not recording",
                cmd.0
            )));
        }
        buffer.commands.push(command);
        Ok(())
    }

    fn check_image(&self, image: ImageHandle) -> BackendResult<()> {
        self.layouts.get(image).map(|_| ())
    }

    fn check_buffer(&self, buffer: BufferHandle) -> BackendResult<()> {
        if self.buffers.contains_key(&buffer) {
            Ok(())
        } else {
            Err(BackendError::UnknownHandle {
                kind: "buffer",
                id: buffer.0,
            })
        }
    }

    fn check_pipeline(&self, pipeline: PipelineHandle) -> BackendResult<()> {
        if self.pipelines.contains(&pipeline) {
            Ok(())
        } else {
            Err(BackendError::UnknownHandle {
                kind: "pipeline",
                id: pipeline.0,
            })
        }
    }

    fn check_write(&self, write: &DescriptorWrite) -> BackendResult<()> {
        match *write {
            DescriptorWrite::UniformBuffer { buffer, .. }
            | DescriptorWrite::StorageBuffer { buffer, .. } => self.check_buffer(buffer),
            DescriptorWrite::SampledImage(image) | DescriptorWrite::StorageImage(image) => {
                self.check_image(image)
            }
            DescriptorWrite::CombinedImageSampler { image, sampler } => {
                self.check_image(image)?;
                self.check_sampler(sampler)
            }
            DescriptorWrite::Sampler(sampler) => self.check_sampler(sampler),
        }
    }

    fn check_sampler(&self, sampler: SamplerHandle) -> BackendResult<()> {
        if self.samplers.contains(&sampler) {
            Ok(())
        } else {
            Err(BackendError::UnknownHandle {
                kind: "sampler",
                id: sampler.0,
            })
        }
    }

    fn register_image(&mut self, desc: &ImageDesc) -> Image {
        let handle = ImageHandle(self.next_id());
        self.layouts.insert(handle, ImageLayout::Undefined);
        self.images.insert(handle, desc.clone());
        self.total_image_allocations += 1;
        Image::new(handle, desc.clone())
    }

    // Inspection helpers for tests

    /// Number of images currently allocated, swapchain images excluded.
    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_samplers(&self) -> usize {
        self.samplers.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    pub fn live_shaders(&self) -> usize {
        self.shaders.len()
    }

    pub fn live_descriptor_sets(&self) -> usize {
        self.sets.len()
    }

    pub fn live_descriptor_set_layouts(&self) -> usize {
        self.set_layouts.len()
    }

    pub fn total_image_allocations(&self) -> u64 {
        self.total_image_allocations
    }

    pub fn total_buffer_allocations(&self) -> u64 {
        self.total_buffer_allocations
    }

    /// Submissions that have not been waited on yet, over all frame slots.
    pub fn outstanding_submissions(&self) -> usize {
        self.slots.iter().filter(|slot| slot.in_flight).count()
    }

    /// Number of submissions made from a frame slot.
    pub fn slot_submissions(&self, slot: usize) -> u64 {
        self.slots.get(slot).map_or(0, |s| s.submissions)
    }

    /// How many times `begin_frame` had to wait on a pending fence.
    pub fn fence_waits(&self) -> u64 {
        self.fence_waits
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Commands recorded into the current frame slot's command buffer.
    pub fn frame_commands(&self) -> &[Command] {
        self.commands(self.frame_commands[self.frame_index])
    }

    pub fn commands(&self, cmd: CommandBufferHandle) -> &[Command] {
        self.command_buffers
            .get(&cmd)
            .map(|buffer| buffer.commands.as_slice())
            .unwrap_or(&[])
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|(_, data)| data.as_slice())
    }

    pub fn descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        array_element: u32,
    ) -> Option<DescriptorWrite> {
        self.sets
            .get(&set)
            .and_then(|s| s.writes.get(&(binding, array_element)).copied())
    }

    pub fn image_desc(&self, image: ImageHandle) -> Option<&ImageDesc> {
        self.images.get(&image)
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl RenderBackend for DummyBackend {
    fn begin_frame(&mut self) -> BackendResult<()> {
        let slot = &mut self.slots[self.frame_index];
        if slot.in_flight {
            // fence wait
            slot.in_flight = false;
            self.fence_waits += 1;
        }

        self.swapchain_index = (self.swapchain_index + 1) % self.swapchain_images.len();

        let cmd = self.frame_commands[self.frame_index];
        if let Some(buffer) = self.command_buffers.get_mut(&cmd) {
            buffer.commands.clear();
            buffer.recording = true;
        }
        self.recording = true;
        log::trace!(
            "DummyBackend: begin frame slot {} (swapchain image {})",
            self.frame_index,
            self.swapchain_index
        );
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if !self.recording {
            return Err(BackendError::NotRecording);
        }
        let slot = &mut self.slots[self.frame_index];
        if slot.in_flight {
            return Err(BackendError::FrameSlotBusy(self.frame_index));
        }
        slot.in_flight = true;
        slot.submissions += 1;

        let cmd = self.frame_commands[self.frame_index];
        if let Some(buffer) = self.command_buffers.get_mut(&cmd) {
            buffer.recording = false;
        }
        self.recording = false;
        log::trace!("DummyBackend: submit frame slot {}", self.frame_index);
        Ok(())
    }

    fn present(&mut self) -> BackendResult<()> {
        if self.recording {
            return Err(BackendError::PresentFailed(
                "frame still recording".to_string(),
            ));
        }
        self.frames_presented += 1;
        self.frame_index = (self.frame_index + 1) % FRAMES_IN_FLIGHT;
        Ok(())
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        for slot in &mut self.slots {
            slot.in_flight = false;
        }
        Ok(())
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        log::trace!("DummyBackend: resize swapchain to {}x{}", width, height);
        self.destroy_swapchain_images();
        self.extent = (width, height);
        self.create_swapchain_images();
        self.swapchain_index = 0;
        Ok(())
    }

    fn frame_index(&self) -> usize {
        self.frame_index
    }

    fn frame_command_buffer(&self) -> CommandBufferHandle {
        self.frame_commands[self.frame_index]
    }

    fn swapchain_image(&self) -> ImageRef {
        ImageRef {
            handle: self.swapchain_images[self.swapchain_index],
            width: self.extent.0,
            height: self.extent.1,
            format: vk::Format::B8G8R8A8_UNORM,
        }
    }

    fn swapchain_extent(&self) -> (u32, u32) {
        self.extent
    }

    fn allocate_image(&mut self, desc: &ImageDesc) -> BackendResult<Image> {
        log::trace!(
            "DummyBackend: creating image {:?} ({}x{}, {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::ImageCreationFailed(
                "zero-sized image".to_string(),
            ));
        }
        Ok(self.register_image(desc))
    }

    fn free_image(&mut self, image: Image) -> BackendResult<()> {
        let handle = image.handle();
        if self.images.remove(&handle).is_none() {
            return Err(BackendError::UnknownHandle {
                kind: "image",
                id: handle.0,
            });
        }
        self.layouts.remove(handle);
        log::trace!("DummyBackend: freed image {}", handle.0);
        Ok(())
    }

    fn load_image(&mut self, path: &Path) -> BackendResult<Image> {
        log::trace!("DummyBackend: loading image {}", path.display());
        let desc = ImageDesc::new_2d(1, 1, vk::Format::R8G8B8A8_UNORM, ImageUsage::TEXTURE)
            .with_label(path.display().to_string());
        let image = self.register_image(&desc);
        self.layouts.insert(image.handle(), ImageLayout::ShaderReadOnly);
        Ok(image)
    }

    fn load_hdr_image(&mut self, path: &Path) -> BackendResult<Image> {
        log::trace!("DummyBackend: loading hdr image {}", path.display());
        let desc = ImageDesc::new_2d(2, 1, vk::Format::R32G32B32A32_SFLOAT, ImageUsage::TEXTURE)
            .with_label(path.display().to_string());
        let image = self.register_image(&desc);
        self.layouts.insert(image.handle(), ImageLayout::ShaderReadOnly);
        Ok(image)
    }

    fn image_layout(&self, image: ImageHandle) -> BackendResult<ImageLayout> {
        self.layouts.get(image)
    }

    fn allocate_buffer(&mut self, desc: &BufferDesc) -> BackendResult<Buffer> {
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed(
                "zero-sized buffer".to_string(),
            ));
        }
        let handle = BufferHandle(self.next_id());
        self.buffers
            .insert(handle, (desc.clone(), vec![0; desc.size as usize]));
        self.total_buffer_allocations += 1;
        Ok(Buffer::new(handle, desc.clone()))
    }

    fn free_buffer(&mut self, buffer: Buffer) -> BackendResult<()> {
        self.buffers
            .remove(&buffer.handle())
            .map(|_| ())
            .ok_or(BackendError::UnknownHandle {
                kind: "buffer",
                id: buffer.handle().0,
            })
    }

    fn upload_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> BackendResult<()> {
        let (desc, contents) =
            self.buffers
                .get_mut(&buffer)
                .ok_or(BackendError::UnknownHandle {
                    kind: "buffer",
                    id: buffer.0,
                })?;
        if !desc.kind.memory_usage().is_host_visible() {
            return Err(BackendError::BufferNotHostVisible(buffer.0));
        }
        if data.len() as u64 > desc.size {
            return Err(BackendError::BufferOverflow {
                size: data.len() as u64,
                capacity: desc.size,
            });
        }
        contents[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> BackendResult<SamplerHandle> {
        log::trace!("DummyBackend: creating sampler {:?}", desc);
        let handle = SamplerHandle(self.next_id());
        self.samplers.insert(handle);
        Ok(handle)
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> BackendResult<()> {
        self.check_sampler(sampler)?;
        self.samplers.remove(&sampler);
        Ok(())
    }

    fn load_shader(&mut self, path: &Path) -> BackendResult<ShaderHandle> {
        log::trace!("DummyBackend: loading shader {}", path.display());
        let handle = ShaderHandle(self.next_id());
        self.shaders.insert(handle, path.to_path_buf());
        Ok(handle)
    }

    fn free_shader(&mut self, shader: ShaderHandle) -> BackendResult<()> {
        self.shaders
            .remove(&shader)
            .map(|_| ())
            .ok_or(BackendError::UnknownHandle {
                kind: "shader",
                id: shader.0,
            })
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc,
    ) -> BackendResult<PipelineHandle> {
        log::trace!("DummyBackend: creating graphics pipeline {:?}", desc.label);
        vertex_stride(&desc.vertex_attributes)?;
        let shaders = match desc.stages {
            ShaderStages::Vertex { vertex, fragment } => vec![vertex, fragment],
            ShaderStages::Mesh {
                task,
                mesh,
                fragment,
            } => task.into_iter().chain([mesh, fragment]).collect(),
        };
        for shader in shaders {
            if !self.shaders.contains_key(&shader) {
                return Err(BackendError::UnknownHandle {
                    kind: "shader",
                    id: shader.0,
                });
            }
        }
        let handle = PipelineHandle(self.next_id());
        self.pipelines.insert(handle);
        Ok(handle)
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDesc,
    ) -> BackendResult<PipelineHandle> {
        log::trace!("DummyBackend: creating compute pipeline {:?}", desc.label);
        if !self.shaders.contains_key(&desc.shader) {
            return Err(BackendError::UnknownHandle {
                kind: "shader",
                id: desc.shader.0,
            });
        }
        let handle = PipelineHandle(self.next_id());
        self.pipelines.insert(handle);
        Ok(handle)
    }

    fn free_pipeline(&mut self, pipeline: PipelineHandle) -> BackendResult<()> {
        self.check_pipeline(pipeline)?;
        self.pipelines.remove(&pipeline);
        Ok(())
    }

    fn create_descriptor_set_layout(
        &mut self,
        desc: &DescriptorSetLayoutDesc,
    ) -> BackendResult<DescriptorSetLayoutHandle> {
        let handle = DescriptorSetLayoutHandle(self.next_id());
        self.set_layouts.insert(
            handle,
            DummyLayout {
                kinds: desc.kinds.clone(),
                heap_capacity: None,
            },
        );
        Ok(handle)
    }

    fn free_descriptor_set_layout(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<()> {
        self.set_layouts
            .remove(&layout)
            .map(|_| ())
            .ok_or(BackendError::UnknownHandle {
                kind: "descriptor set layout",
                id: layout.0,
            })
    }

    fn create_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle> {
        if !self.set_layouts.contains_key(&layout) {
            return Err(BackendError::UnknownHandle {
                kind: "descriptor set layout",
                id: layout.0,
            });
        }
        let handle = DescriptorSetHandle(self.next_id());
        self.sets.insert(
            handle,
            DummySet {
                layout,
                writes: HashMap::new(),
            },
        );
        Ok(handle)
    }

    fn free_descriptor_set(&mut self, set: DescriptorSetHandle) -> BackendResult<()> {
        self.sets
            .remove(&set)
            .map(|_| ())
            .ok_or(BackendError::UnknownHandle {
                kind: "descriptor set",
                id: set.0,
            })
    }

    fn write_descriptor(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        array_element: u32,
        write: &DescriptorWrite,
    ) -> BackendResult<()> {
        self.check_write(write)?;
        let layout_handle = self
            .sets
            .get(&set)
            .map(|s| s.layout)
            .ok_or(BackendError::UnknownHandle {
                kind: "descriptor set",
                id: set.0,
            })?;
        let layout = self
            .set_layouts
            .get(&layout_handle)
            .ok_or(BackendError::UnknownHandle {
                kind: "descriptor set layout",
                id: layout_handle.0,
            })?;

        let expected = layout.kinds.get(binding as usize).copied().ok_or_else(|| {
            BackendError::DescriptorCreationFailed(format!(
                "binding {} out of range for set {}",
                binding, set.0
            ))
        })?;
        if expected != write.kind() {
            return Err(BackendError::DescriptorCreationFailed(format!(
                "binding {} expects {:?}, got {:?}",
                binding,
                expected,
                write.kind()
            )));
        }
        let capacity = layout.heap_capacity.unwrap_or(1);
        if array_element >= capacity {
            return Err(BackendError::DescriptorCreationFailed(format!(
                "array element {} out of range (capacity {})",
                array_element, capacity
            )));
        }

        if let Some(s) = self.sets.get_mut(&set) {
            s.writes.insert((binding, array_element), *write);
        }
        Ok(())
    }

    fn create_heap_set(
        &mut self,
        kind: HeapKind,
        capacity: u32,
    ) -> BackendResult<(DescriptorSetLayoutHandle, DescriptorSetHandle)> {
        log::trace!("DummyBackend: creating {} heap ({} slots)", kind, capacity);
        let layout = DescriptorSetLayoutHandle(self.next_id());
        self.set_layouts.insert(
            layout,
            DummyLayout {
                kinds: vec![kind.descriptor_kind()],
                heap_capacity: Some(capacity),
            },
        );
        let set = self.create_descriptor_set(layout)?;
        Ok((layout, set))
    }

    fn create_command_buffer(&mut self, queue: QueueKind) -> BackendResult<CommandBufferHandle> {
        log::trace!("DummyBackend: creating {:?} command buffer", queue);
        let handle = CommandBufferHandle(self.next_id());
        self.command_buffers
            .insert(handle, DummyCommandBuffer::default());
        Ok(handle)
    }

    fn begin_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let buffer = self
            .command_buffers
            .get_mut(&cmd)
            .ok_or(BackendError::UnknownHandle {
                kind: "command buffer",
                id: cmd.0,
            })?;
        buffer.commands.clear();
        buffer.recording = true;
        Ok(())
    }

    fn submit_command_buffer_and_wait(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let buffer = self
            .command_buffers
            .get_mut(&cmd)
            .ok_or(BackendError::UnknownHandle {
                kind: "command buffer",
                id: cmd.0,
            })?;
        if !buffer.recording {
            return Err(BackendError::SubmitFailed(format!(
                "command buffer {} was not begun",
                cmd.0
            )));
        }
        buffer.recording = false;
        Ok(())
    }

    fn free_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        if self.frame_commands.contains(&cmd) {
            return Err(BackendError::CommandRecordingFailed(
                "frame command buffers are owned by the backend".to_string(),
            ));
        }
        self.command_buffers
            .remove(&cmd)
            .map(|_| ())
            .ok_or(BackendError::UnknownHandle {
                kind: "command buffer",
                id: cmd.0,
            })
    }

    fn cmd_transition_image(
        &mut self,
        cmd: CommandBufferHandle,
        image: ImageHandle,
        barrier: &ImageBarrier,
    ) -> BackendResult<()> {
        if !self.command_buffers.contains_key(&cmd) {
            return Err(BackendError::UnknownHandle {
                kind: "command buffer",
                id: cmd.0,
            });
        }
        self.layouts.transition(image, barrier)?;
        self.record(
            cmd,
            Command::Transition {
                image,
                from: barrier.from,
                to: barrier.to,
            },
        )
    }

    fn cmd_begin_rendering(
        &mut self,
        cmd: CommandBufferHandle,
        begin: &RenderBegin,
    ) -> BackendResult<()> {
        for &image in &begin.color_images {
            let layout = self.layouts.get(image)?;
            if layout != ImageLayout::ColorAttachment {
                return Err(BackendError::LayoutMismatch {
                    claimed: ImageLayout::ColorAttachment,
                    actual: layout,
                });
            }
        }
        if let Some(depth) = begin.depth_image {
            let layout = self.layouts.get(depth)?;
            if !layout.is_depth() {
                return Err(BackendError::LayoutMismatch {
                    claimed: ImageLayout::DepthAttachment,
                    actual: layout,
                });
            }
        }
        self.record(
            cmd,
            Command::BeginRendering {
                color_images: begin.color_images.clone(),
                depth_image: begin.depth_image,
                width: begin.width,
                height: begin.height,
            },
        )
    }

    fn cmd_end_rendering(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        self.record(cmd, Command::EndRendering)
    }

    fn cmd_set_viewport(
        &mut self,
        cmd: CommandBufferHandle,
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        self.record(cmd, Command::SetViewport { width, height })
    }

    fn cmd_set_depth_bounds(
        &mut self,
        cmd: CommandBufferHandle,
        min: f32,
        max: f32,
    ) -> BackendResult<()> {
        self.record(cmd, Command::SetDepthBounds { min, max })
    }

    fn cmd_bind_pipeline(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
    ) -> BackendResult<()> {
        self.check_pipeline(pipeline)?;
        self.record(cmd, Command::BindPipeline(pipeline))
    }

    fn cmd_bind_vertex_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
    ) -> BackendResult<()> {
        self.check_buffer(buffer)?;
        self.record(cmd, Command::BindVertexBuffer(buffer))
    }

    fn cmd_bind_index_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
    ) -> BackendResult<()> {
        self.check_buffer(buffer)?;
        self.record(cmd, Command::BindIndexBuffer(buffer))
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        set: DescriptorSetHandle,
        index: u32,
    ) -> BackendResult<()> {
        self.check_pipeline(pipeline)?;
        if !self.sets.contains_key(&set) {
            return Err(BackendError::UnknownHandle {
                kind: "descriptor set",
                id: set.0,
            });
        }
        self.record(cmd, Command::BindDescriptorSet { set, index })
    }

    fn cmd_push_constants(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        data: &[u8],
    ) -> BackendResult<()> {
        self.check_pipeline(pipeline)?;
        self.record(cmd, Command::PushConstants { size: data.len() })
    }

    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32) -> BackendResult<()> {
        self.record(cmd, Command::Draw { vertex_count })
    }

    fn cmd_draw_indexed(
        &mut self,
        cmd: CommandBufferHandle,
        index_count: u32,
    ) -> BackendResult<()> {
        self.record(cmd, Command::DrawIndexed { index_count })
    }

    fn cmd_draw_meshlets(
        &mut self,
        cmd: CommandBufferHandle,
        meshlet_count: u32,
    ) -> BackendResult<()> {
        self.record(cmd, Command::DrawMeshlets { meshlet_count })
    }

    fn cmd_dispatch(
        &mut self,
        cmd: CommandBufferHandle,
        x: u32,
        y: u32,
        z: u32,
    ) -> BackendResult<()> {
        self.record(cmd, Command::Dispatch { x, y, z })
    }

    fn cmd_blit_image(
        &mut self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
    ) -> BackendResult<()> {
        let src_layout = self.layouts.get(src)?;
        if src_layout != ImageLayout::TransferSrc {
            return Err(BackendError::LayoutMismatch {
                claimed: ImageLayout::TransferSrc,
                actual: src_layout,
            });
        }
        let dst_layout = self.layouts.get(dst)?;
        if dst_layout != ImageLayout::TransferDst {
            return Err(BackendError::LayoutMismatch {
                claimed: ImageLayout::TransferDst,
                actual: dst_layout,
            });
        }
        self.record(cmd, Command::Blit { src, dst })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_slots_alternate() {
        let mut backend = DummyBackend::new(64, 64);
        for frame in 0..6 {
            assert_eq!(backend.frame_index(), frame % FRAMES_IN_FLIGHT);
            backend.begin_frame().unwrap();
            backend.end_frame().unwrap();
            backend.present().unwrap();
            assert!(backend.outstanding_submissions() <= FRAMES_IN_FLIGHT);
        }
        // first two frames never wait
        assert_eq!(backend.fence_waits(), 4);
        assert_eq!(backend.slot_submissions(0), 3);
        assert_eq!(backend.slot_submissions(1), 3);
    }

    #[test]
    fn test_end_without_begin() {
        let mut backend = DummyBackend::default();
        assert!(matches!(
            backend.end_frame(),
            Err(BackendError::NotRecording)
        ));
    }

    #[test]
    fn test_blit_requires_transfer_layouts() {
        let mut backend = DummyBackend::new(32, 32);
        backend.begin_frame().unwrap();
        let cmd = backend.frame_command_buffer();
        let image = backend
            .allocate_image(&ImageDesc::new_2d(
                32,
                32,
                vk::Format::R8G8B8A8_UNORM,
                ImageUsage::RENDER_TARGET,
            ))
            .unwrap();
        let swapchain = backend.swapchain_image().handle;

        let err = backend.cmd_blit_image(cmd, image.handle(), swapchain);
        assert!(matches!(err, Err(BackendError::LayoutMismatch { .. })));

        backend
            .cmd_transition_image(
                cmd,
                image.handle(),
                &ImageBarrier::new(ImageLayout::Undefined, ImageLayout::TransferSrc),
            )
            .unwrap();
        backend
            .cmd_transition_image(
                cmd,
                swapchain,
                &ImageBarrier::new(ImageLayout::Undefined, ImageLayout::TransferDst),
            )
            .unwrap();
        backend.cmd_blit_image(cmd, image.handle(), swapchain).unwrap();
        assert_eq!(
            backend.frame_commands().last(),
            Some(&Command::Blit {
                src: image.handle(),
                dst: swapchain
            })
        );
    }

    #[test]
    fn test_allocation_counters() {
        let mut backend = DummyBackend::default();
        let desc = ImageDesc::new_2d(8, 8, vk::Format::R8G8B8A8_UNORM, ImageUsage::GBUFFER);
        let mut image = backend.allocate_image(&desc).unwrap();
        backend.resize_image(&mut image, 16, 4).unwrap();
        assert_eq!(image.width(), 16);
        assert_eq!(image.height(), 4);
        assert_eq!(backend.live_images(), 1);
        assert_eq!(backend.total_image_allocations(), 2);
        assert_eq!(backend.image_layout(image.handle()).unwrap(), ImageLayout::Undefined);

        backend.free_image(image).unwrap();
        assert_eq!(backend.live_images(), 0);
    }

    #[test]
    fn test_upload_rules() {
        let mut backend = DummyBackend::default();
        let uniform = backend
            .allocate_buffer(&BufferDesc::new(8, BufferKind::Uniform))
            .unwrap();
        let storage = backend
            .allocate_buffer(&BufferDesc::new(8, BufferKind::Storage))
            .unwrap();

        backend.upload_buffer(uniform.handle(), &[1, 2, 3]).unwrap();
        assert_eq!(
            backend.buffer_contents(uniform.handle()).unwrap(),
            &[1, 2, 3, 0, 0, 0, 0, 0]
        );
        assert!(matches!(
            backend.upload_buffer(uniform.handle(), &[0; 9]),
            Err(BackendError::BufferOverflow { size: 9, capacity: 8 })
        ));
        assert!(matches!(
            backend.upload_buffer(storage.handle(), &[0; 4]),
            Err(BackendError::BufferNotHostVisible(_))
        ));
    }

    #[test]
    fn test_descriptor_kind_checked() {
        let mut backend = DummyBackend::default();
        let buffer = backend
            .allocate_buffer(&BufferDesc::new(64, BufferKind::Uniform))
            .unwrap();
        let layout = backend
            .create_descriptor_set_layout(&DescriptorSetLayoutDesc::new(
                1,
                &[DescriptorKind::UniformBuffer],
            ))
            .unwrap();
        let set = backend.create_descriptor_set(layout).unwrap();
        let write = DescriptorWrite::UniformBuffer {
            buffer: buffer.handle(),
            range: 64,
        };
        backend.write_descriptor(set, 0, 0, &write).unwrap();
        assert_eq!(backend.descriptor(set, 0, 0), Some(write));

        let sampler = backend.create_sampler(&SamplerDesc::default()).unwrap();
        assert!(backend
            .write_descriptor(set, 0, 0, &DescriptorWrite::Sampler(sampler))
            .is_err());
        assert!(backend.write_descriptor(set, 1, 0, &write).is_err());
    }
}
