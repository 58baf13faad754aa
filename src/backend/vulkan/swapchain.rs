//! Swapchain and per-frame synchronization.

use ash::vk;

use crate::backend::{BackendError, BackendResult};

/// Presentable images of a surface.
pub struct Swapchain {
    pub loader: ash::khr::swapchain::Device,
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Surface state needed to (re)create a swapchain.
pub struct SurfaceInfo<'a> {
    pub surface_fn: &'a ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
}

impl Swapchain {
    /// Create a swapchain of `width`x`height`, replacing `old` when it is
    /// not null. The caller destroys `old` afterwards.
    pub fn new(
        loader: ash::khr::swapchain::Device,
        device: &ash::Device,
        surface: &SurfaceInfo<'_>,
        (width, height): (u32, u32),
        vsync: bool,
        old: vk::SwapchainKHR,
    ) -> BackendResult<Self> {
        let capabilities = unsafe {
            surface
                .surface_fn
                .get_physical_device_surface_capabilities(surface.physical_device, surface.surface)
        }
        .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;
        let formats = unsafe {
            surface
                .surface_fn
                .get_physical_device_surface_formats(surface.physical_device, surface.surface)
        }
        .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;
        let present_modes = unsafe {
            surface
                .surface_fn
                .get_physical_device_surface_present_modes(surface.physical_device, surface.surface)
        }
        .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

        let surface_format = choose_surface_format(&formats).ok_or_else(|| {
            BackendError::SwapchainCreationFailed("Surface reports no formats".to_string())
        })?;
        let present_mode = choose_present_mode(&present_modes, vsync);
        let extent = choose_extent(&capabilities, width, height);
        let image_count = choose_image_count(&capabilities);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;
        let images = unsafe { loader.get_swapchain_images(handle) }
            .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

        let views = images
            .iter()
            .map(|&image| create_view(device, image, surface_format.format))
            .collect::<BackendResult<Vec<_>>>()?;

        log::info!(
            "Swapchain created: {}x{}, {:?}, {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            images.len()
        );

        Ok(Self {
            loader,
            handle,
            images,
            views,
            format: surface_format.format,
            extent,
        })
    }

    /// Destroy the views and, unless it was retired into a new swapchain,
    /// the swapchain itself.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for view in self.views.drain(..) {
            device.destroy_image_view(view, None);
        }
        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            self.loader.destroy_swapchain(self.handle, None);
            self.handle = vk::SwapchainKHR::null();
        }
    }
}

fn create_view(device: &ash::Device, image: vk::Image, format: vk::Format) -> BackendResult<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe { device.create_image_view(&create_info, None) }
        .map_err(|e| BackendError::SwapchainCreationFailed(format!("image view: {}", e)))
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// FIFO is always available; without vsync take MAILBOX when offered.
fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync && modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

/// Synchronization objects of one frame slot.
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    /// Signalled when the slot's last submission finished. Created signalled.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> BackendResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        unsafe {
            let image_available = device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let render_finished = device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let in_flight = device
                .create_fence(&fence_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            Ok(Self {
                image_available,
                render_finished,
                in_flight,
            })
        }
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_finished, None);
        device.destroy_fence(self.in_flight, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(current: (u32, u32), min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            min_image_count: min_count,
            max_image_count: max_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_present_mode_follows_vsync() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_extent_clamped_when_surface_undecided() {
        let caps = capabilities((u32::MAX, u32::MAX), 2, 3);
        let extent = choose_extent(&caps, 10_000, 600);
        assert_eq!((extent.width, extent.height), (4096, 600));

        let fixed = capabilities((800, 600), 2, 3);
        let extent = choose_extent(&fixed, 10, 10);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_image_count() {
        assert_eq!(choose_image_count(&capabilities((1, 1), 2, 0)), 3);
        assert_eq!(choose_image_count(&capabilities((1, 1), 2, 2)), 2);
    }

    #[test]
    fn test_prefers_srgb_bgra() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
        assert!(choose_surface_format(&[]).is_none());
    }
}
