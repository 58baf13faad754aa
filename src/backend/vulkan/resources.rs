//! Images, buffers and samplers backed by gpu-allocator.

use std::path::Path;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::{AllocationError, MemoryLocation};

use super::conversion::{
    convert_address_mode, convert_filter, convert_memory_usage, convert_mipmap_mode, map_vk_error,
};
use super::VulkanBackend;
use crate::backend::{
    image_aspect, BackendError, BackendResult, Buffer, BufferDesc, BufferHandle, Image,
    ImageBarrier, ImageDesc, ImageHandle, ImageKind, ImageLayout, ImageUsage, QueueKind,
    RenderBackend, SamplerDesc, SamplerHandle,
};

pub struct VulkanImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    /// `None` for swapchain images, which the swapchain owns.
    pub allocation: Option<Allocation>,
    pub desc: ImageDesc,
}

pub struct VulkanBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Allocation,
    pub desc: BufferDesc,
}

impl VulkanBackend {
    fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
        wrap: fn(String) -> BackendError,
    ) -> BackendResult<Allocation> {
        let mut allocator = self.allocator()?;
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| match e {
                AllocationError::OutOfMemory => BackendError::OutOfMemory,
                other => wrap(other.to_string()),
            })
    }

    fn free_memory(&self, allocation: Allocation) {
        match self.allocator() {
            Ok(mut allocator) => {
                if let Err(e) = allocator.free(allocation) {
                    log::error!("Failed to free allocation: {}", e);
                }
            }
            Err(e) => log::error!("Failed to free allocation: {}", e),
        }
    }

    pub(super) fn create_image(&mut self, desc: &ImageDesc) -> BackendResult<Image> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::ImageCreationFailed(
                "zero-sized image".to_string(),
            ));
        }
        let layers = desc.kind.layer_count();
        let (flags, view_type) = match desc.kind {
            ImageKind::Texture2D => (vk::ImageCreateFlags::empty(), vk::ImageViewType::TYPE_2D),
            ImageKind::Cube => (vk::ImageCreateFlags::CUBE_COMPATIBLE, vk::ImageViewType::CUBE),
        };

        let create_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&create_info, None) }
            .map_err(|e| map_vk_error(e, BackendError::ImageCreationFailed))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = match self.allocate_memory(
            desc.label.as_deref().unwrap_or("image"),
            requirements,
            MemoryLocation::GpuOnly,
            false,
            BackendError::ImageCreationFailed,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .and_then(|()| {
                    let view_info = vk::ImageViewCreateInfo::default()
                        .image(image)
                        .view_type(view_type)
                        .format(desc.format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: image_aspect(desc.format),
                            base_mip_level: 0,
                            level_count: desc.mip_levels,
                            base_array_layer: 0,
                            layer_count: layers,
                        });
                    self.device.create_image_view(&view_info, None)
                })
        };
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                self.free_memory(allocation);
                return Err(map_vk_error(e, BackendError::ImageCreationFailed));
            }
        };

        let handle = ImageHandle(self.next_id());
        self.images.insert(
            handle,
            VulkanImage {
                image,
                view,
                allocation: Some(allocation),
                desc: desc.clone(),
            },
        );
        self.layouts.insert(handle, ImageLayout::Undefined);
        log::debug!(
            "Created image {:?} ({}x{}, {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        Ok(Image::new(handle, desc.clone()))
    }

    pub(super) fn destroy_image(&mut self, handle: ImageHandle) -> BackendResult<()> {
        if self.swapchain_images.contains(&handle) {
            return Err(BackendError::UnknownHandle {
                kind: "image",
                id: handle.raw(),
            });
        }
        let image = self
            .images
            .remove(&handle)
            .ok_or(BackendError::UnknownHandle {
                kind: "image",
                id: handle.raw(),
            })?;
        self.layouts.remove(handle);
        self.release_image(image);
        Ok(())
    }

    pub(super) fn release_image(&self, image: VulkanImage) {
        unsafe {
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.image, None);
        }
        if let Some(allocation) = image.allocation {
            self.free_memory(allocation);
        }
    }

    fn create_raw_buffer(
        &self,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> BackendResult<(vk::Buffer, Allocation)> {
        if size == 0 {
            return Err(BackendError::BufferCreationFailed(
                "zero-sized buffer".to_string(),
            ));
        }
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&create_info, None) }
            .map_err(|e| map_vk_error(e, BackendError::BufferCreationFailed))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate_memory(
            name,
            requirements,
            location,
            true,
            BackendError::BufferCreationFailed,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free_memory(allocation);
            return Err(map_vk_error(e, BackendError::BufferCreationFailed));
        }
        Ok((buffer, allocation))
    }

    pub(super) fn create_buffer(&mut self, desc: &BufferDesc) -> BackendResult<Buffer> {
        let (buffer, allocation) = self.create_raw_buffer(
            desc.label.as_deref().unwrap_or("buffer"),
            desc.size,
            desc.kind.to_vk(),
            convert_memory_usage(desc.kind.memory_usage()),
        )?;
        let handle = BufferHandle(self.next_id());
        self.buffers.insert(
            handle,
            VulkanBuffer {
                buffer,
                allocation,
                desc: desc.clone(),
            },
        );
        log::debug!("Created buffer {:?} (size: {})", desc.label, desc.size);
        Ok(Buffer::new(handle, desc.clone()))
    }

    pub(super) fn destroy_buffer(&mut self, handle: BufferHandle) -> BackendResult<()> {
        let buffer = self
            .buffers
            .remove(&handle)
            .ok_or(BackendError::UnknownHandle {
                kind: "buffer",
                id: handle.raw(),
            })?;
        self.release_buffer(buffer);
        Ok(())
    }

    pub(super) fn release_buffer(&self, buffer: VulkanBuffer) {
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        self.free_memory(buffer.allocation);
    }

    pub(super) fn write_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> BackendResult<()> {
        let buffer = self
            .buffers
            .get_mut(&handle)
            .ok_or(BackendError::UnknownHandle {
                kind: "buffer",
                id: handle.raw(),
            })?;
        if !buffer.desc.kind.memory_usage().is_host_visible() {
            return Err(BackendError::BufferNotHostVisible(handle.raw()));
        }
        if data.len() as u64 > buffer.desc.size {
            return Err(BackendError::BufferOverflow {
                size: data.len() as u64,
                capacity: buffer.desc.size,
            });
        }
        let mapped = buffer
            .allocation
            .mapped_slice_mut()
            .ok_or(BackendError::BufferNotHostVisible(handle.raw()))?;
        mapped[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub(super) fn create_vk_sampler(&mut self, desc: &SamplerDesc) -> BackendResult<SamplerHandle> {
        let filter = convert_filter(desc.filter);
        let address_mode = convert_address_mode(desc.address_mode);
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(convert_mipmap_mode(desc.filter))
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .min_lod(0.0)
            .max_lod(desc.mip_levels as f32)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
        let sampler = unsafe { self.device.create_sampler(&create_info, None) }
            .map_err(|e| map_vk_error(e, BackendError::SamplerCreationFailed))?;
        let handle = SamplerHandle(self.next_id());
        self.samplers.insert(handle, sampler);
        Ok(handle)
    }

    /// Decode `path` as 8-bit RGBA and upload it.
    pub(super) fn load_rgba8(&mut self, path: &Path) -> BackendResult<Image> {
        let decoded = image::open(path)
            .map_err(|e| BackendError::ImageLoadFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        let desc = ImageDesc::new_2d(width, height, vk::Format::R8G8B8A8_UNORM, ImageUsage::TEXTURE)
            .with_label(path.display().to_string());
        self.upload_image(&desc, decoded.as_raw())
    }

    /// Decode `path` as 32-bit float RGBA and upload it.
    pub(super) fn load_rgba32f(&mut self, path: &Path) -> BackendResult<Image> {
        let decoded = image::open(path)
            .map_err(|e| BackendError::ImageLoadFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
            .to_rgba32f();
        let (width, height) = decoded.dimensions();
        let desc = ImageDesc::new_2d(
            width,
            height,
            vk::Format::R32G32B32A32_SFLOAT,
            ImageUsage::TEXTURE,
        )
        .with_label(path.display().to_string());
        self.upload_image(&desc, bytemuck::cast_slice(decoded.as_raw()))
    }

    /// Create an image and fill it through a staging buffer. The image ends
    /// in `ShaderReadOnly`.
    fn upload_image(&mut self, desc: &ImageDesc, texels: &[u8]) -> BackendResult<Image> {
        let image = self.create_image(desc)?;
        let (staging, mut allocation) = match self.create_raw_buffer(
            "staging",
            texels.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        ) {
            Ok(staging) => staging,
            Err(e) => {
                self.destroy_image(image.handle())?;
                return Err(e);
            }
        };

        let result = match allocation.mapped_slice_mut() {
            Some(mapped) => {
                mapped[..texels.len()].copy_from_slice(texels);
                self.copy_staging_to_image(staging, &image)
            }
            None => Err(BackendError::BufferCreationFailed(
                "staging buffer is not mapped".to_string(),
            )),
        };

        unsafe { self.device.destroy_buffer(staging, None) };
        self.free_memory(allocation);
        match result {
            Ok(()) => Ok(image),
            Err(e) => {
                self.destroy_image(image.handle())?;
                Err(e)
            }
        }
    }

    fn copy_staging_to_image(&mut self, staging: vk::Buffer, image: &Image) -> BackendResult<()> {
        let vk_image = self.vk_image(image.handle())?.image;
        let cmd = self.create_command_buffer(QueueKind::Graphics)?;
        self.begin_command_buffer(cmd)?;
        self.cmd_transition_image(
            cmd,
            image.handle(),
            &ImageBarrier::new(ImageLayout::Undefined, ImageLayout::TransferDst),
        )?;

        let region = vk::BufferImageCopy::default()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: image.width(),
                height: image.height(),
                depth: 1,
            });
        let command_buffer = self.vk_command_buffer(cmd)?;
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                command_buffer,
                staging,
                vk_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        self.cmd_transition_image(
            cmd,
            image.handle(),
            &ImageBarrier::new(ImageLayout::TransferDst, ImageLayout::ShaderReadOnly),
        )?;
        self.submit_command_buffer_and_wait(cmd)?;
        self.free_command_buffer(cmd)
    }
}
