//! Image layout tracking.
//!
//! Every image owned by a backend has exactly one tracked layout, stored in a
//! [`LayoutTable`]. The table is only ever changed through
//! [`LayoutTable::transition`], which checks the layout a barrier claims to
//! start from against the tracked one. Swapchain images and pass-owned images
//! share the same table, so there is one source of truth per image.

use std::collections::HashMap;

use ash::vk;

use crate::backend::traits::{BackendError, BackendResult, ImageHandle};

/// Image layout states an image can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    /// Contents undefined. Used as the `from` of a barrier it means "discard".
    #[default]
    Undefined,
    /// Storage image access or anything else.
    General,
    ColorAttachment,
    DepthAttachment,
    /// Sampling plus depth testing without writes.
    DepthReadOnly,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

impl ImageLayout {
    /// Convert to Vulkan image layout.
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::General => vk::ImageLayout::GENERAL,
            Self::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::DepthAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Self::DepthReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            Self::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Access mask of work using an image in this layout.
    pub fn access_mask(self) -> vk::AccessFlags {
        match self {
            Self::Undefined | Self::PresentSrc => vk::AccessFlags::empty(),
            Self::General => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            Self::ColorAttachment => {
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            }
            Self::DepthAttachment => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            Self::DepthReadOnly => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            Self::ShaderReadOnly => vk::AccessFlags::SHADER_READ,
            Self::TransferSrc => vk::AccessFlags::TRANSFER_READ,
            Self::TransferDst => vk::AccessFlags::TRANSFER_WRITE,
        }
    }

    /// Pipeline stage of work using an image in this layout, as a barrier source.
    pub fn src_stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            Self::General => vk::PipelineStageFlags::COMPUTE_SHADER,
            Self::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            Self::DepthAttachment => vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            Self::DepthReadOnly => vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            Self::ShaderReadOnly => vk::PipelineStageFlags::FRAGMENT_SHADER,
            Self::TransferSrc | Self::TransferDst => vk::PipelineStageFlags::TRANSFER,
            Self::PresentSrc => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        }
    }

    /// Pipeline stage of work using an image in this layout, as a barrier destination.
    pub fn dst_stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            Self::General => vk::PipelineStageFlags::COMPUTE_SHADER,
            Self::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            Self::DepthAttachment | Self::DepthReadOnly => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            }
            Self::ShaderReadOnly => vk::PipelineStageFlags::FRAGMENT_SHADER,
            Self::TransferSrc | Self::TransferDst => vk::PipelineStageFlags::TRANSFER,
            Self::PresentSrc => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Self::DepthAttachment | Self::DepthReadOnly)
    }
}

/// Parameters of a single image layout transition.
///
/// [`ImageBarrier::new`] derives access and stage masks from the two layouts;
/// the builder methods override them when a pass knows better.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub from: ImageLayout,
    pub to: ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub base_layer: u32,
    /// `None` covers every remaining layer.
    pub layer_count: Option<u32>,
}

impl ImageBarrier {
    pub fn new(from: ImageLayout, to: ImageLayout) -> Self {
        Self {
            from,
            to,
            src_access: from.access_mask(),
            dst_access: to.access_mask(),
            src_stage: from.src_stage(),
            dst_stage: to.dst_stage(),
            base_layer: 0,
            layer_count: None,
        }
    }

    pub fn with_access(mut self, src: vk::AccessFlags, dst: vk::AccessFlags) -> Self {
        self.src_access = src;
        self.dst_access = dst;
        self
    }

    pub fn with_stages(mut self, src: vk::PipelineStageFlags, dst: vk::PipelineStageFlags) -> Self {
        self.src_stage = src;
        self.dst_stage = dst;
        self
    }

    pub fn with_layers(mut self, base_layer: u32, layer_count: u32) -> Self {
        self.base_layer = base_layer;
        self.layer_count = Some(layer_count);
        self
    }
}

/// Current layout of every live image of a backend.
#[derive(Debug, Default)]
pub struct LayoutTable {
    layouts: HashMap<ImageHandle, ImageLayout>,
}

impl LayoutTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly created image.
    pub fn insert(&mut self, image: ImageHandle, layout: ImageLayout) {
        self.layouts.insert(image, layout);
    }

    /// Stop tracking a destroyed image.
    pub fn remove(&mut self, image: ImageHandle) -> Option<ImageLayout> {
        self.layouts.remove(&image)
    }

    pub fn get(&self, image: ImageHandle) -> BackendResult<ImageLayout> {
        self.layouts
            .get(&image)
            .copied()
            .ok_or(BackendError::UnknownHandle {
                kind: "image",
                id: image.raw(),
            })
    }

    /// Validate `barrier` against the tracked layout and apply it.
    ///
    /// Returns the layout the image was actually in. The table is left
    /// untouched on error.
    pub fn transition(
        &mut self,
        image: ImageHandle,
        barrier: &ImageBarrier,
    ) -> BackendResult<ImageLayout> {
        let current = self
            .layouts
            .get_mut(&image)
            .ok_or(BackendError::UnknownHandle {
                kind: "image",
                id: image.raw(),
            })?;

        if barrier.from != ImageLayout::Undefined && barrier.from != *current {
            return Err(BackendError::LayoutMismatch {
                claimed: barrier.from,
                actual: *current,
            });
        }

        let previous = *current;
        *current = barrier.to;
        Ok(previous)
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_layout_to_vk() {
        assert_eq!(ImageLayout::Undefined.to_vk(), vk::ImageLayout::UNDEFINED);
        assert_eq!(
            ImageLayout::ColorAttachment.to_vk(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            ImageLayout::DepthAttachment.to_vk(),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            ImageLayout::PresentSrc.to_vk(),
            vk::ImageLayout::PRESENT_SRC_KHR
        );
    }

    #[test]
    fn test_barrier_masks_follow_layouts() {
        let barrier = ImageBarrier::new(ImageLayout::ColorAttachment, ImageLayout::TransferSrc);
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(barrier.dst_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(barrier.dst_access, vk::AccessFlags::TRANSFER_READ);
        assert_eq!(barrier.layer_count, None);

        let cube = barrier.with_layers(0, 6);
        assert_eq!(cube.layer_count, Some(6));
    }

    #[test]
    fn test_transition_updates_table() {
        let mut table = LayoutTable::new();
        let image = ImageHandle(7);
        table.insert(image, ImageLayout::Undefined);

        let previous = table
            .transition(
                image,
                &ImageBarrier::new(ImageLayout::Undefined, ImageLayout::ColorAttachment),
            )
            .unwrap();
        assert_eq!(previous, ImageLayout::Undefined);
        assert_eq!(table.get(image).unwrap(), ImageLayout::ColorAttachment);
    }

    #[test]
    fn test_transition_rejects_wrong_from() {
        let mut table = LayoutTable::new();
        let image = ImageHandle(1);
        table.insert(image, ImageLayout::ShaderReadOnly);

        let err = table
            .transition(
                image,
                &ImageBarrier::new(ImageLayout::TransferSrc, ImageLayout::ColorAttachment),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            BackendError::LayoutMismatch {
                claimed: ImageLayout::TransferSrc,
                actual: ImageLayout::ShaderReadOnly,
            }
        ));
        // unchanged
        assert_eq!(table.get(image).unwrap(), ImageLayout::ShaderReadOnly);
    }

    #[test]
    fn test_undefined_from_discards() {
        let mut table = LayoutTable::new();
        let image = ImageHandle(3);
        table.insert(image, ImageLayout::PresentSrc);

        let previous = table
            .transition(
                image,
                &ImageBarrier::new(ImageLayout::Undefined, ImageLayout::TransferDst),
            )
            .unwrap();
        assert_eq!(previous, ImageLayout::PresentSrc);
        assert_eq!(table.get(image).unwrap(), ImageLayout::TransferDst);
    }

    #[test]
    fn test_unknown_image() {
        let mut table = LayoutTable::new();
        let image = ImageHandle(42);
        assert!(table.get(image).is_err());
        assert!(table
            .transition(
                image,
                &ImageBarrier::new(ImageLayout::Undefined, ImageLayout::General)
            )
            .is_err());

        table.insert(image, ImageLayout::General);
        assert_eq!(table.remove(image), Some(ImageLayout::General));
        assert!(table.is_empty());
    }
}
