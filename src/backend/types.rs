//! Common types shared between backends

use std::fmt;

use ash::vk;

use crate::backend::traits::{
    BackendError, BackendResult, BufferHandle, DescriptorSetLayoutHandle, ImageHandle,
    SamplerHandle, ShaderHandle,
};

/// Image usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageUsage(u32);

impl ImageUsage {
    pub const TRANSFER_SRC: Self = Self(1 << 0);
    pub const TRANSFER_DST: Self = Self(1 << 1);
    pub const SAMPLED: Self = Self(1 << 2);
    pub const STORAGE: Self = Self(1 << 3);
    pub const COLOR_ATTACHMENT: Self = Self(1 << 4);
    pub const DEPTH_ATTACHMENT: Self = Self(1 << 5);

    /// Colour target that later passes sample or blit from.
    pub const RENDER_TARGET: Self =
        Self(Self::COLOR_ATTACHMENT.0 | Self::SAMPLED.0 | Self::TRANSFER_SRC.0);
    /// Intermediate colour target only ever sampled.
    pub const GBUFFER: Self = Self(Self::COLOR_ATTACHMENT.0 | Self::SAMPLED.0);
    pub const DEPTH: Self = Self(Self::DEPTH_ATTACHMENT.0 | Self::SAMPLED.0);
    /// Compute-written image that is sampled afterwards.
    pub const STORAGE_SAMPLED: Self = Self(Self::STORAGE.0 | Self::SAMPLED.0);
    /// Texture filled by a staging copy.
    pub const TEXTURE: Self = Self(Self::TRANSFER_DST.0 | Self::SAMPLED.0);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn to_vk(self) -> vk::ImageUsageFlags {
        let mut flags = vk::ImageUsageFlags::empty();
        if self.contains(Self::TRANSFER_SRC) {
            flags |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if self.contains(Self::TRANSFER_DST) {
            flags |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        if self.contains(Self::SAMPLED) {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.contains(Self::STORAGE) {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
        if self.contains(Self::COLOR_ATTACHMENT) {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if self.contains(Self::DEPTH_ATTACHMENT) {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        flags
    }
}

impl std::ops::BitOr for ImageUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageKind {
    #[default]
    Texture2D,
    /// Six array layers viewed as a cube.
    Cube,
}

impl ImageKind {
    pub fn layer_count(self) -> u32 {
        match self {
            ImageKind::Texture2D => 1,
            ImageKind::Cube => 6,
        }
    }
}

/// Image descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDesc {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: vk::Format,
    pub usage: ImageUsage,
    pub kind: ImageKind,
}

impl ImageDesc {
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: ImageUsage) -> Self {
        Self {
            label: None,
            width,
            height,
            mip_levels: 1,
            format,
            usage,
            kind: ImageKind::Texture2D,
        }
    }

    pub fn cube(size: u32, format: vk::Format, usage: ImageUsage) -> Self {
        Self {
            kind: ImageKind::Cube,
            ..Self::new_2d(size, size, format, usage)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// An image owned by whoever allocated it.
///
/// Not `Clone`: exactly one owner frees it. Other parties hold an [`ImageRef`].
#[derive(Debug, PartialEq)]
pub struct Image {
    handle: ImageHandle,
    desc: ImageDesc,
}

impl Image {
    pub(crate) fn new(handle: ImageHandle, desc: ImageDesc) -> Self {
        Self { handle, desc }
    }

    pub fn handle(&self) -> ImageHandle {
        self.handle
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn image_ref(&self) -> ImageRef {
        ImageRef {
            handle: self.handle,
            width: self.desc.width,
            height: self.desc.height,
            format: self.desc.format,
        }
    }
}

/// Non-owning view of an image, as handed to downstream passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub handle: ImageHandle,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
    Uniform,
    Storage,
}

/// Where a buffer's memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Host-writable, device-local when the device offers it.
    CpuToGpu,
    /// Host-visible only.
    CpuOnly,
    GpuOnly,
}

impl MemoryUsage {
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryUsage::GpuOnly)
    }
}

impl BufferKind {
    pub fn memory_usage(self) -> MemoryUsage {
        match self {
            BufferKind::Vertex | BufferKind::Index => MemoryUsage::CpuToGpu,
            BufferKind::Uniform => MemoryUsage::CpuOnly,
            BufferKind::Storage => MemoryUsage::GpuOnly,
        }
    }

    pub fn to_vk(self) -> vk::BufferUsageFlags {
        match self {
            BufferKind::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferKind::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            BufferKind::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferKind::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
        }
    }
}

/// Buffer descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct BufferDesc {
    pub label: Option<String>,
    pub size: u64,
    pub kind: BufferKind,
}

impl BufferDesc {
    pub fn new(size: u64, kind: BufferKind) -> Self {
        Self {
            label: None,
            size,
            kind,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A buffer owned by whoever allocated it.
#[derive(Debug, PartialEq)]
pub struct Buffer {
    handle: BufferHandle,
    desc: BufferDesc,
}

impl Buffer {
    pub(crate) fn new(handle: BufferHandle, desc: BufferDesc) -> Self {
        Self { handle, desc }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.desc.size
    }

    pub fn kind(&self) -> BufferKind {
        self.desc.kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

/// Sampler descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub filter: FilterMode,
    pub address_mode: AddressMode,
    pub mip_levels: u32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: FilterMode::Linear,
            address_mode: AddressMode::Repeat,
            mip_levels: 1,
        }
    }
}

impl SamplerDesc {
    pub fn nearest() -> Self {
        Self {
            filter: FilterMode::Nearest,
            ..Self::default()
        }
    }

    pub fn linear() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    CombinedImageSampler,
    Sampler,
    StorageImage,
}

/// Descriptor set layout with consecutive bindings starting at `binding`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSetLayoutDesc {
    pub binding: u32,
    pub kinds: Vec<DescriptorKind>,
}

impl DescriptorSetLayoutDesc {
    pub fn new(binding: u32, kinds: &[DescriptorKind]) -> Self {
        Self {
            binding,
            kinds: kinds.to_vec(),
        }
    }
}

/// A single descriptor update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorWrite {
    UniformBuffer { buffer: BufferHandle, range: u64 },
    StorageBuffer { buffer: BufferHandle, range: u64 },
    SampledImage(ImageHandle),
    CombinedImageSampler {
        image: ImageHandle,
        sampler: SamplerHandle,
    },
    Sampler(SamplerHandle),
    StorageImage(ImageHandle),
}

impl DescriptorWrite {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            DescriptorWrite::UniformBuffer { .. } => DescriptorKind::UniformBuffer,
            DescriptorWrite::StorageBuffer { .. } => DescriptorKind::StorageBuffer,
            DescriptorWrite::SampledImage(_) => DescriptorKind::SampledImage,
            DescriptorWrite::CombinedImageSampler { .. } => DescriptorKind::CombinedImageSampler,
            DescriptorWrite::Sampler(_) => DescriptorKind::Sampler,
            DescriptorWrite::StorageImage(_) => DescriptorKind::StorageImage,
        }
    }
}

/// What a bindless heap stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    Image,
    Sampler,
}

impl HeapKind {
    pub fn descriptor_kind(self) -> DescriptorKind {
        match self {
            HeapKind::Image => DescriptorKind::SampledImage,
            HeapKind::Sampler => DescriptorKind::Sampler,
        }
    }
}

impl fmt::Display for HeapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapKind::Image => write!(f, "image"),
            HeapKind::Sampler => write!(f, "sampler"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStages {
    Vertex {
        vertex: ShaderHandle,
        fragment: ShaderHandle,
    },
    Mesh {
        task: Option<ShaderHandle>,
        mesh: ShaderHandle,
        fragment: ShaderHandle,
    },
}

/// Graphics pipeline descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDesc {
    pub label: Option<String>,
    pub stages: ShaderStages,
    /// Vertex attribute formats in location order, tightly packed.
    pub vertex_attributes: Vec<vk::Format>,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub depth_compare: vk::CompareOp,
    pub depth_write: bool,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub polygon_mode: vk::PolygonMode,
    pub topology: vk::PrimitiveTopology,
    pub depth_bias: bool,
    pub push_constant_size: u32,
    pub set_layouts: Vec<DescriptorSetLayoutHandle>,
}

impl GraphicsPipelineDesc {
    pub fn new(stages: ShaderStages) -> Self {
        Self {
            label: None,
            stages,
            vertex_attributes: Vec::new(),
            color_formats: Vec::new(),
            depth_format: None,
            depth_compare: vk::CompareOp::LESS,
            depth_write: true,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            polygon_mode: vk::PolygonMode::FILL,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            depth_bias: false,
            push_constant_size: 0,
            set_layouts: Vec::new(),
        }
    }
}

/// Compute pipeline descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct ComputePipelineDesc {
    pub label: Option<String>,
    pub shader: ShaderHandle,
    pub push_constant_size: u32,
    pub set_layouts: Vec<DescriptorSetLayoutHandle>,
}

/// Arguments of a dynamic rendering scope
#[derive(Debug, Clone, PartialEq)]
pub struct RenderBegin {
    pub color_images: Vec<ImageHandle>,
    pub depth_image: Option<ImageHandle>,
    pub width: u32,
    pub height: u32,
    pub clear_color: [f32; 4],
    /// Keep existing colour contents instead of clearing.
    pub load_color: bool,
    /// Keep existing depth instead of clearing to 1.0.
    pub load_depth: bool,
}

impl RenderBegin {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            color_images: Vec::new(),
            depth_image: None,
            width,
            height,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            load_color: false,
            load_depth: false,
        }
    }

    pub fn color(mut self, image: ImageHandle) -> Self {
        self.color_images.push(image);
        self
    }

    pub fn depth(mut self, image: ImageHandle) -> Self {
        self.depth_image = Some(image);
        self
    }
}

/// Size in bytes of one texel or vertex attribute of `format`.
pub fn format_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::R8_SINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::R16_UINT => 2,
        vk::Format::R8G8B8_UNORM => 3,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::R32_SINT
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT => 4,
        vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R32G32_SFLOAT
        | vk::Format::R32G32_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => 8,
        vk::Format::R32G32B32_SFLOAT | vk::Format::R32G32B32_UINT => 12,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => return None,
    };
    Some(size)
}

/// Stride of a tightly packed vertex made of `attributes`.
pub fn vertex_stride(attributes: &[vk::Format]) -> BackendResult<u32> {
    attributes.iter().try_fold(0, |stride, &format| {
        format_size(format)
            .map(|size| stride + size)
            .ok_or(BackendError::UnsupportedFormat(format))
    })
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn image_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        f if is_depth_format(f) => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}
