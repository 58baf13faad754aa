//! Core backend abstraction
//!
//! `RenderBackend` is the whole surface the render graph and its passes see.
//! Both the Vulkan backend and the dummy backend implement it, so every pass
//! can be exercised without a GPU.

use crate::backend::layout::{ImageBarrier, ImageLayout};
use crate::backend::types::*;
use ash::vk;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to submit work: {0}")]
    SubmitFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create image: {0}")]
    ImageCreationFailed(String),
    #[error("Failed to create sampler: {0}")]
    SamplerCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Failed to create descriptor: {0}")]
    DescriptorCreationFailed(String),
    #[error("Failed to record commands: {0}")]
    CommandRecordingFailed(String),
    #[error("Shader binary not found: {}", path.display())]
    ShaderNotFound { path: PathBuf },
    #[error("Failed to load image {}: {reason}", path.display())]
    ImageLoadFailed { path: PathBuf, reason: String },
    #[error("Unsupported format: {0:?}")]
    UnsupportedFormat(vk::Format),
    #[error("Image layout mismatch: barrier claims {claimed:?} but image is in {actual:?}")]
    LayoutMismatch {
        claimed: ImageLayout,
        actual: ImageLayout,
    },
    #[error("Unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },
    #[error("Buffer {0} is not host visible")]
    BufferNotHostVisible(u64),
    #[error("Upload of {size} bytes exceeds buffer capacity {capacity}")]
    BufferOverflow { size: u64, capacity: u64 },
    #[error("Frame slot {0} is still in flight")]
    FrameSlotBusy(usize),
    #[error("No frame is being recorded")]
    NotRecording,
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Raw id, unique for the lifetime of the backend
            pub fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

handle_type!(
    /// Handle to a GPU image
    ImageHandle
);
handle_type!(
    /// Handle to a GPU buffer
    BufferHandle
);
handle_type!(
    /// Handle to a sampler
    SamplerHandle
);
handle_type!(
    /// Handle to a loaded shader module
    ShaderHandle
);
handle_type!(
    /// Handle to a graphics or compute pipeline
    PipelineHandle
);
handle_type!(
    /// Handle to a descriptor set layout
    DescriptorSetLayoutHandle
);
handle_type!(
    /// Handle to a descriptor set
    DescriptorSetHandle
);
handle_type!(
    /// Handle to a command buffer
    CommandBufferHandle
);

/// Main backend trait
///
/// Handles are never reused, so a stale handle is always reported as
/// [`BackendError::UnknownHandle`] rather than aliasing a newer object.
pub trait RenderBackend {
    // Frame lifecycle

    /// Wait for the current frame slot's fence, acquire the next swapchain
    /// image, reset the slot's command buffer and open recording.
    fn begin_frame(&mut self) -> BackendResult<()>;

    /// Close recording and submit the frame slot's command buffer.
    fn end_frame(&mut self) -> BackendResult<()>;

    /// Present the acquired swapchain image and advance to the next slot.
    fn present(&mut self) -> BackendResult<()>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&mut self) -> BackendResult<()>;

    /// Recreate the swapchain at the given size.
    fn resize_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()>;

    /// Index of the frame slot currently being recorded, `0..FRAMES_IN_FLIGHT`.
    fn frame_index(&self) -> usize;

    /// Command buffer of the current frame slot.
    fn frame_command_buffer(&self) -> CommandBufferHandle;

    /// The swapchain image acquired by the last `begin_frame`.
    fn swapchain_image(&self) -> ImageRef;

    /// Current swapchain extent.
    fn swapchain_extent(&self) -> (u32, u32);

    // Images

    fn allocate_image(&mut self, desc: &ImageDesc) -> BackendResult<Image>;

    fn free_image(&mut self, image: Image) -> BackendResult<()>;

    /// Destroy and recreate `image` at a new size, keeping format and usage.
    /// The recreated image starts in `ImageLayout::Undefined`.
    fn resize_image(&mut self, image: &mut Image, width: u32, height: u32) -> BackendResult<()> {
        let desc = image.desc().clone().with_extent(width, height);
        let old = std::mem::replace(image, self.allocate_image(&desc)?);
        self.free_image(old)
    }

    /// Load an 8-bit RGBA texture from disk.
    fn load_image(&mut self, path: &Path) -> BackendResult<Image>;

    /// Load a 32-bit float RGBA texture (e.g. an equirectangular HDR map).
    fn load_hdr_image(&mut self, path: &Path) -> BackendResult<Image>;

    /// Current tracked layout of an image.
    fn image_layout(&self, image: ImageHandle) -> BackendResult<ImageLayout>;

    // Buffers

    fn allocate_buffer(&mut self, desc: &BufferDesc) -> BackendResult<Buffer>;

    fn free_buffer(&mut self, buffer: Buffer) -> BackendResult<()>;

    /// Copy `data` into a host-visible buffer starting at offset 0.
    fn upload_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> BackendResult<()>;

    // Samplers and shaders

    fn create_sampler(&mut self, desc: &SamplerDesc) -> BackendResult<SamplerHandle>;

    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> BackendResult<()>;

    /// Load a precompiled SPIR-V binary relative to the shader directory.
    fn load_shader(&mut self, path: &Path) -> BackendResult<ShaderHandle>;

    fn free_shader(&mut self, shader: ShaderHandle) -> BackendResult<()>;

    // Pipelines

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc,
    ) -> BackendResult<PipelineHandle>;

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDesc,
    ) -> BackendResult<PipelineHandle>;

    fn free_pipeline(&mut self, pipeline: PipelineHandle) -> BackendResult<()>;

    // Descriptors

    fn create_descriptor_set_layout(
        &mut self,
        desc: &DescriptorSetLayoutDesc,
    ) -> BackendResult<DescriptorSetLayoutHandle>;

    fn free_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle)
        -> BackendResult<()>;

    fn create_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle>;

    fn free_descriptor_set(&mut self, set: DescriptorSetHandle) -> BackendResult<()>;

    /// Write one descriptor. `binding` is relative to the layout's first
    /// binding; `array_element` selects the slot inside a heap binding.
    fn write_descriptor(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        array_element: u32,
        write: &DescriptorWrite,
    ) -> BackendResult<()>;

    /// Create the layout and set backing a bindless heap with `capacity` slots.
    fn create_heap_set(
        &mut self,
        kind: HeapKind,
        capacity: u32,
    ) -> BackendResult<(DescriptorSetLayoutHandle, DescriptorSetHandle)>;

    // One-time command buffers

    fn create_command_buffer(&mut self, queue: QueueKind) -> BackendResult<CommandBufferHandle>;

    fn begin_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()>;

    /// End, submit and block until the GPU has executed the command buffer.
    fn submit_command_buffer_and_wait(&mut self, cmd: CommandBufferHandle) -> BackendResult<()>;

    fn free_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()>;

    // Recording

    /// Record an image layout transition.
    ///
    /// This is the only operation that changes an image's tracked layout.
    /// Fails with [`BackendError::LayoutMismatch`] when `barrier.from` is
    /// neither the tracked layout nor `Undefined`; nothing is recorded then.
    fn cmd_transition_image(
        &mut self,
        cmd: CommandBufferHandle,
        image: ImageHandle,
        barrier: &ImageBarrier,
    ) -> BackendResult<()>;

    fn cmd_begin_rendering(&mut self, cmd: CommandBufferHandle, begin: &RenderBegin)
        -> BackendResult<()>;

    fn cmd_end_rendering(&mut self, cmd: CommandBufferHandle) -> BackendResult<()>;

    /// Set a full-target viewport and matching scissor.
    fn cmd_set_viewport(&mut self, cmd: CommandBufferHandle, width: u32, height: u32)
        -> BackendResult<()>;

    fn cmd_set_depth_bounds(&mut self, cmd: CommandBufferHandle, min: f32, max: f32)
        -> BackendResult<()>;

    fn cmd_bind_pipeline(&mut self, cmd: CommandBufferHandle, pipeline: PipelineHandle)
        -> BackendResult<()>;

    fn cmd_bind_vertex_buffer(&mut self, cmd: CommandBufferHandle, buffer: BufferHandle)
        -> BackendResult<()>;

    fn cmd_bind_index_buffer(&mut self, cmd: CommandBufferHandle, buffer: BufferHandle)
        -> BackendResult<()>;

    fn cmd_bind_descriptor_set(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        set: DescriptorSetHandle,
        index: u32,
    ) -> BackendResult<()>;

    fn cmd_push_constants(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        data: &[u8],
    ) -> BackendResult<()>;

    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32) -> BackendResult<()>;

    fn cmd_draw_indexed(&mut self, cmd: CommandBufferHandle, index_count: u32)
        -> BackendResult<()>;

    /// Dispatch `meshlet_count` task/mesh shader workgroups.
    fn cmd_draw_meshlets(&mut self, cmd: CommandBufferHandle, meshlet_count: u32)
        -> BackendResult<()>;

    fn cmd_dispatch(&mut self, cmd: CommandBufferHandle, x: u32, y: u32, z: u32)
        -> BackendResult<()>;

    /// Blit `src` (in `TransferSrc`) onto `dst` (in `TransferDst`), scaling
    /// to the destination extent with linear filtering.
    fn cmd_blit_image(
        &mut self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
    ) -> BackendResult<()>;
}
