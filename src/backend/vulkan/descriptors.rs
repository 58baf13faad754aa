//! Descriptor pool, set layouts, sets and bindless heaps.

use ash::vk;

use super::conversion::{convert_descriptor_kind, map_vk_error};
use super::VulkanBackend;
use crate::backend::{
    BackendError, BackendResult, DescriptorKind, DescriptorSetHandle,
    DescriptorSetLayoutDesc, DescriptorSetLayoutHandle, DescriptorWrite, HeapKind,
};

const POOL_DESCRIPTORS_PER_TYPE: u32 = 4096;
const POOL_MAX_SETS: u32 = 1024;

pub struct VulkanSetLayout {
    pub layout: vk::DescriptorSetLayout,
    pub first_binding: u32,
    pub kinds: Vec<DescriptorKind>,
    /// Slot count of a heap layout's single binding.
    pub heap_capacity: Option<u32>,
}

pub struct VulkanSet {
    pub set: vk::DescriptorSet,
    pub layout: DescriptorSetLayoutHandle,
}

/// One pool for every set. Heap sets need `UPDATE_AFTER_BIND`, the rest are
/// freed one by one.
pub fn create_descriptor_pool(device: &ash::Device) -> BackendResult<vk::DescriptorPool> {
    let pool_sizes = [
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::STORAGE_BUFFER,
        vk::DescriptorType::SAMPLED_IMAGE,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::DescriptorType::SAMPLER,
        vk::DescriptorType::STORAGE_IMAGE,
    ]
    .map(|ty| vk::DescriptorPoolSize {
        ty,
        descriptor_count: POOL_DESCRIPTORS_PER_TYPE,
    });

    let create_info = vk::DescriptorPoolCreateInfo::default()
        .flags(
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
                | vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND,
        )
        .max_sets(POOL_MAX_SETS)
        .pool_sizes(&pool_sizes);

    unsafe { device.create_descriptor_pool(&create_info, None) }
        .map_err(|e| map_vk_error(e, BackendError::InitializationFailed))
}

impl VulkanBackend {
    pub(super) fn create_set_layout(
        &mut self,
        desc: &DescriptorSetLayoutDesc,
    ) -> BackendResult<DescriptorSetLayoutHandle> {
        let bindings: Vec<_> = desc
            .kinds
            .iter()
            .enumerate()
            .map(|(i, &kind)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(desc.binding + i as u32)
                    .descriptor_type(convert_descriptor_kind(kind))
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
            .map_err(|e| map_vk_error(e, BackendError::DescriptorCreationFailed))?;

        let handle = DescriptorSetLayoutHandle(self.next_id());
        self.set_layouts.insert(
            handle,
            VulkanSetLayout {
                layout,
                first_binding: desc.binding,
                kinds: desc.kinds.clone(),
                heap_capacity: None,
            },
        );
        Ok(handle)
    }

    pub(super) fn destroy_set_layout(
        &mut self,
        handle: DescriptorSetLayoutHandle,
    ) -> BackendResult<()> {
        let layout = self
            .set_layouts
            .remove(&handle)
            .ok_or(BackendError::UnknownHandle {
                kind: "descriptor set layout",
                id: handle.raw(),
            })?;
        unsafe {
            self.device
                .destroy_descriptor_set_layout(layout.layout, None)
        };
        Ok(())
    }

    pub(super) fn allocate_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle> {
        let vk_layout = self
            .set_layouts
            .get(&layout)
            .ok_or(BackendError::UnknownHandle {
                kind: "descriptor set layout",
                id: layout.raw(),
            })?
            .layout;
        let set_layouts = [vk_layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        let set = unsafe { self.device.allocate_descriptor_sets(&allocate_info) }
            .map_err(|e| map_vk_error(e, BackendError::DescriptorCreationFailed))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                BackendError::DescriptorCreationFailed("no descriptor set allocated".to_string())
            })?;

        let handle = DescriptorSetHandle(self.next_id());
        self.sets.insert(handle, VulkanSet { set, layout });
        Ok(handle)
    }

    pub(super) fn release_set(&mut self, handle: DescriptorSetHandle) -> BackendResult<()> {
        let set = self
            .sets
            .remove(&handle)
            .ok_or(BackendError::UnknownHandle {
                kind: "descriptor set",
                id: handle.raw(),
            })?;
        unsafe {
            self.device
                .free_descriptor_sets(self.descriptor_pool, &[set.set])
        }
        .map_err(|e| map_vk_error(e, BackendError::DescriptorCreationFailed))
    }

    /// A single partially bound array binding at 0 that may be rewritten
    /// while the set is bound.
    pub(super) fn create_heap(
        &mut self,
        kind: HeapKind,
        capacity: u32,
    ) -> BackendResult<(DescriptorSetLayoutHandle, DescriptorSetHandle)> {
        let descriptor_kind = kind.descriptor_kind();
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(convert_descriptor_kind(descriptor_kind))
            .descriptor_count(capacity)
            .stage_flags(vk::ShaderStageFlags::ALL)];
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);
        let layout = unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
            .map_err(|e| map_vk_error(e, BackendError::DescriptorCreationFailed))?;

        let handle = DescriptorSetLayoutHandle(self.next_id());
        self.set_layouts.insert(
            handle,
            VulkanSetLayout {
                layout,
                first_binding: 0,
                kinds: vec![descriptor_kind],
                heap_capacity: Some(capacity),
            },
        );
        log::debug!("Created {} heap with {} slots", kind, capacity);

        let set = self.allocate_set(handle)?;
        Ok((handle, set))
    }

    pub(super) fn update_set(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        array_element: u32,
        write: &DescriptorWrite,
    ) -> BackendResult<()> {
        let target = self.sets.get(&set).ok_or(BackendError::UnknownHandle {
            kind: "descriptor set",
            id: set.raw(),
        })?;
        let layout = self
            .set_layouts
            .get(&target.layout)
            .ok_or(BackendError::UnknownHandle {
                kind: "descriptor set layout",
                id: target.layout.raw(),
            })?;

        let expected = layout.kinds.get(binding as usize).copied().ok_or_else(|| {
            BackendError::DescriptorCreationFailed(format!(
                "binding {} out of range for set {}",
                binding,
                set.raw()
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

        let base = vk::WriteDescriptorSet::default()
            .dst_set(target.set)
            .dst_binding(layout.first_binding + binding)
            .dst_array_element(array_element)
            .descriptor_type(convert_descriptor_kind(expected));

        match *write {
            DescriptorWrite::UniformBuffer { buffer, range }
            | DescriptorWrite::StorageBuffer { buffer, range } => {
                let info = [vk::DescriptorBufferInfo {
                    buffer: self.vk_buffer(buffer)?,
                    offset: 0,
                    range,
                }];
                unsafe {
                    self.device
                        .update_descriptor_sets(&[base.buffer_info(&info)], &[])
                };
            }
            DescriptorWrite::SampledImage(image) => {
                let image = self.vk_image(image)?;
                let info = [vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: image.view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }];
                unsafe {
                    self.device
                        .update_descriptor_sets(&[base.image_info(&info)], &[])
                };
            }
            DescriptorWrite::CombinedImageSampler { image, sampler } => {
                let image = self.vk_image(image)?;
                let info = [vk::DescriptorImageInfo {
                    sampler: self.vk_sampler(sampler)?,
                    image_view: image.view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }];
                unsafe {
                    self.device
                        .update_descriptor_sets(&[base.image_info(&info)], &[])
                };
            }
            DescriptorWrite::Sampler(sampler) => {
                let info = [vk::DescriptorImageInfo {
                    sampler: self.vk_sampler(sampler)?,
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                }];
                unsafe {
                    self.device
                        .update_descriptor_sets(&[base.image_info(&info)], &[])
                };
            }
            DescriptorWrite::StorageImage(image) => {
                let info = [vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: self.vk_image(image)?.view,
                    image_layout: vk::ImageLayout::GENERAL,
                }];
                unsafe {
                    self.device
                        .update_descriptor_sets(&[base.image_info(&info)], &[])
                };
            }
        }
        Ok(())
    }
}
