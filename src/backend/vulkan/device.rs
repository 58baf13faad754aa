//! Physical device selection and logical device creation.

use std::ffi::CStr;

use ash::vk;

use crate::backend::{BackendError, BackendResult};

/// The GPU chosen for rendering and what it offers.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSelection {
    pub physical_device: vk::PhysicalDevice,
    /// Family with graphics, compute and present support.
    pub queue_family: u32,
    /// `VK_EXT_mesh_shader` is available.
    pub mesh_shading: bool,
    pub depth_bounds: bool,
}

/// Pick the highest scoring GPU that can render to `surface`.
///
/// Discrete GPUs are preferred over integrated ones. Devices below Vulkan
/// 1.3 or without a suitable queue family are skipped.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface_fn: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> BackendResult<DeviceSelection> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        BackendError::DeviceCreationFailed(format!("Failed to enumerate physical devices: {}", e))
    })?;
    if devices.is_empty() {
        return Err(BackendError::DeviceCreationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(u32, DeviceSelection)> = None;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if properties.api_version < vk::API_VERSION_1_3 {
            continue;
        }
        let Some(queue_family) = find_queue_family(instance, surface_fn, surface, device) else {
            continue;
        };

        let mut score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 0,
        };
        score += properties.limits.max_image_dimension2_d / 1024;

        let mesh_shading = supports_extension(instance, device, ash::ext::mesh_shader::NAME);
        let features = unsafe { instance.get_physical_device_features(device) };

        // SAFETY: device_name is a null-terminated array filled by the driver
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {}, mesh shading: {})",
            name,
            properties.device_type,
            score,
            mesh_shading
        );

        if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
            best = Some((
                score,
                DeviceSelection {
                    physical_device: device,
                    queue_family,
                    mesh_shading,
                    depth_bounds: features.depth_bounds == vk::TRUE,
                },
            ));
        }
    }

    best.map(|(_, selection)| selection)
        .ok_or_else(|| BackendError::DeviceCreationFailed("No suitable GPU found".to_string()))
}

fn find_queue_family(
    instance: &ash::Instance,
    surface_fn: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        let flags = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        let present = unsafe {
            surface_fn.get_physical_device_surface_support(device, index, surface)
        }
        .unwrap_or(false);
        (family.queue_flags.contains(flags) && present).then_some(index)
    })
}

fn supports_extension(instance: &ash::Instance, device: vk::PhysicalDevice, name: &CStr) -> bool {
    let Ok(extensions) = (unsafe { instance.enumerate_device_extension_properties(device) }) else {
        return false;
    };
    has_extension(&extensions, name)
}

fn has_extension(extensions: &[vk::ExtensionProperties], name: &CStr) -> bool {
    extensions.iter().any(|ext| {
        // SAFETY: extension_name is a null-terminated array filled by the driver
        (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == name
    })
}

/// Create the logical device with dynamic rendering and descriptor
/// indexing enabled, plus mesh shading when the GPU has it.
pub fn create_logical_device(
    instance: &ash::Instance,
    selection: &DeviceSelection,
) -> BackendResult<ash::Device> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(selection.queue_family)
        .queue_priorities(&queue_priorities)];

    let mut extensions = vec![ash::khr::swapchain::NAME.as_ptr()];
    if selection.mesh_shading {
        extensions.push(ash::ext::mesh_shader::NAME.as_ptr());
    }

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(true)
        .depth_bounds(selection.depth_bounds);

    // Bindless heaps: partially bound runtime arrays updated after bind
    let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_update_unused_while_pending(true)
        .shader_sampled_image_array_non_uniform_indexing(true);

    let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let mut mesh_shader_features = vk::PhysicalDeviceMeshShaderFeaturesEXT::default()
        .task_shader(true)
        .mesh_shader(true);

    let mut create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .push_next(&mut vulkan_12_features)
        .push_next(&mut vulkan_13_features);
    if selection.mesh_shading {
        create_info = create_info.push_next(&mut mesh_shader_features);
    }

    unsafe { instance.create_device(selection.physical_device, &create_info, None) }.map_err(|e| {
        BackendError::DeviceCreationFailed(format!("Failed to create logical device: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut properties = vk::ExtensionProperties::default();
        for (dst, &src) in properties
            .extension_name
            .iter_mut()
            .zip(name.to_bytes_with_nul())
        {
            *dst = src as std::ffi::c_char;
        }
        properties
    }

    #[test]
    fn test_has_extension_matches_whole_name() {
        let extensions = [
            extension(ash::khr::swapchain::NAME),
            extension(ash::ext::mesh_shader::NAME),
        ];
        assert!(has_extension(&extensions, ash::ext::mesh_shader::NAME));
        assert!(!has_extension(&extensions[..1], ash::ext::mesh_shader::NAME));
        assert!(!has_extension(&extensions, c"VK_EXT_mesh"));
        assert!(!has_extension(&[], ash::khr::swapchain::NAME));
    }
}
