//! Render pass contract and per-node state.

use crate::backend::{
    CommandBufferHandle, Image, ImageBarrier, ImageDesc, ImageHandle, ImageLayout, ImageRef,
    RenderBackend,
};
use crate::error::{GraphError, GraphResult};
use crate::render_graph::context::ExecutionContext;
use crate::render_graph::NodeId;

/// Lifecycle of a node: `Unbaked -> Initialized -> Resized* -> Freed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Unbaked,
    Initialized,
    /// Initialized, then resized at least once.
    Resized,
    Freed,
}

impl NodeState {
    /// Initialized and not yet freed: `update`, `resize` and `free` may run.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Initialized | Self::Resized)
    }
}

/// A unit of GPU work in the render graph.
///
/// `init` runs once, after every upstream producer has run its own `init`, and
/// allocates this node's outputs. `update` records the node's commands for the
/// current frame. `resize` reallocates anything sized from the frame extent.
/// `free` releases every object the pass created itself; output images are
/// released by the graph right after.
pub trait RenderPass<B: RenderBackend> {
    fn name(&self) -> &str;

    /// Number of input ports.
    fn input_count(&self) -> u32 {
        0
    }

    /// Number of output ports.
    fn output_count(&self) -> u32 {
        0
    }

    fn init(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()>;

    fn update(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()>;

    fn resize(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()>;

    fn free(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()>;
}

/// An input resolved against its producer's output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedInput {
    pub image: ImageRef,
    pub generation: u32,
}

#[derive(Debug, Default)]
struct OutputSlot {
    image: Option<Image>,
    generation: u32,
}

/// Output images owned by one node.
///
/// Every time a slot's image is replaced or resized its generation is bumped,
/// so consumers can tell a stale view from the current one.
#[derive(Debug)]
pub struct NodeOutputs {
    node: NodeId,
    slots: Vec<OutputSlot>,
}

impl NodeOutputs {
    pub(crate) fn new(node: NodeId, count: u32) -> Self {
        Self {
            node,
            slots: (0..count).map(|_| OutputSlot::default()).collect(),
        }
    }

    fn slot_mut(&mut self, index: u32) -> GraphResult<&mut OutputSlot> {
        let node = self.node;
        self.slots
            .get_mut(index as usize)
            .ok_or(GraphError::MissingOutput { node, index })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Allocate an image into slot `index`, freeing whatever was there.
    pub fn allocate<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        index: u32,
        desc: &ImageDesc,
    ) -> GraphResult<ImageRef> {
        self.slot_mut(index)?;
        let image = backend.allocate_image(desc)?;
        let image_ref = image.image_ref();
        let slot = self.slot_mut(index)?;
        let previous = slot.image.replace(image);
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(previous) = previous {
            backend.free_image(previous)?;
        }
        Ok(image_ref)
    }

    /// Recreate the image in slot `index` at a new extent.
    pub fn resize<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        index: u32,
        width: u32,
        height: u32,
    ) -> GraphResult<ImageRef> {
        let node = self.node;
        let slot = self.slot_mut(index)?;
        let image = slot
            .image
            .as_mut()
            .ok_or(GraphError::MissingOutput { node, index })?;
        backend.resize_image(image, width, height)?;
        let image_ref = image.image_ref();
        slot.generation = slot.generation.wrapping_add(1);
        Ok(image_ref)
    }

    pub fn get(&self, index: u32) -> Option<&Image> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.image.as_ref())
    }

    pub fn image_ref(&self, index: u32) -> GraphResult<ImageRef> {
        self.get(index)
            .map(Image::image_ref)
            .ok_or(GraphError::MissingOutput {
                node: self.node,
                index,
            })
    }

    pub fn handle(&self, index: u32) -> GraphResult<ImageHandle> {
        self.image_ref(index).map(|image| image.handle)
    }

    pub fn generation(&self, index: u32) -> Option<u32> {
        self.slots.get(index as usize).map(|slot| slot.generation)
    }

    pub(crate) fn resolve(&self, index: u32) -> GraphResult<ResolvedInput> {
        let image = self.image_ref(index)?;
        let generation = self.generation(index).unwrap_or(0);
        Ok(ResolvedInput { image, generation })
    }

    /// Free every output image.
    pub(crate) fn free_all<B: RenderBackend>(&mut self, backend: &mut B) -> GraphResult<()> {
        for slot in &mut self.slots {
            if let Some(image) = slot.image.take() {
                slot.generation = slot.generation.wrapping_add(1);
                backend.free_image(image)?;
            }
        }
        Ok(())
    }
}

/// Everything a pass callback may touch.
pub struct PassContext<'a, B: RenderBackend> {
    pub backend: &'a mut B,
    pub exec: &'a mut ExecutionContext,
    pub outputs: &'a mut NodeOutputs,
    pub(crate) node: NodeId,
    pub(crate) inputs: &'a [Option<ResolvedInput>],
}

impl<'a, B: RenderBackend> PassContext<'a, B> {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The image connected to input `index`.
    pub fn input(&self, index: u32) -> GraphResult<ImageRef> {
        self.resolved(index).map(|input| input.image)
    }

    /// Generation of the producer's output slot behind input `index`.
    pub fn input_generation(&self, index: u32) -> GraphResult<u32> {
        self.resolved(index).map(|input| input.generation)
    }

    fn resolved(&self, index: u32) -> GraphResult<ResolvedInput> {
        self.inputs
            .get(index as usize)
            .copied()
            .flatten()
            .ok_or(GraphError::UnconnectedInput {
                node: self.node,
                index,
            })
    }

    /// Current frame extent.
    pub fn extent(&self) -> (u32, u32) {
        (self.exec.width(), self.exec.height())
    }

    /// Command buffer of the frame being recorded.
    pub fn cmd(&self) -> CommandBufferHandle {
        self.backend.frame_command_buffer()
    }

    /// Move an image this pass does not own into `to`, starting from whatever
    /// layout its producer left it in. No barrier is recorded when it is
    /// already there.
    pub fn transition_to(&mut self, image: ImageHandle, to: ImageLayout) -> GraphResult<()> {
        let from = self.backend.image_layout(image)?;
        if from != to {
            let cmd = self.cmd();
            self.backend
                .cmd_transition_image(cmd, image, &ImageBarrier::new(from, to))?;
        }
        Ok(())
    }

    /// Record a transition whose starting layout the pass knows.
    pub fn transition(
        &mut self,
        image: ImageHandle,
        from: ImageLayout,
        to: ImageLayout,
    ) -> GraphResult<()> {
        let cmd = self.cmd();
        self.backend
            .cmd_transition_image(cmd, image, &ImageBarrier::new(from, to))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::ImageUsage;
    use ash::vk;

    fn desc(width: u32, height: u32) -> ImageDesc {
        ImageDesc::new_2d(width, height, vk::Format::R8G8B8A8_UNORM, ImageUsage::RENDER_TARGET)
    }

    #[test]
    fn test_allocate_bumps_generation_and_frees_previous() {
        let mut backend = DummyBackend::default();
        let mut outputs = NodeOutputs::new(NodeId(0), 2);
        assert_eq!(outputs.generation(0), Some(0));

        let first = outputs.allocate(&mut backend, 0, &desc(4, 4)).unwrap();
        let second = outputs.allocate(&mut backend, 0, &desc(8, 8)).unwrap();
        assert_ne!(first.handle, second.handle);
        assert_eq!(outputs.generation(0), Some(2));
        assert_eq!(backend.live_images(), 1);
        assert!(outputs.allocate(&mut backend, 2, &desc(4, 4)).is_err());
    }

    #[test]
    fn test_resize_missing_output() {
        let mut backend = DummyBackend::default();
        let mut outputs = NodeOutputs::new(NodeId(3), 1);
        let err = outputs.resize(&mut backend, 0, 16, 16).unwrap_err();
        assert!(matches!(
            err,
            GraphError::MissingOutput {
                node: NodeId(3),
                index: 0
            }
        ));
    }

    #[test]
    fn test_free_all() {
        let mut backend = DummyBackend::default();
        let mut outputs = NodeOutputs::new(NodeId(0), 2);
        outputs.allocate(&mut backend, 0, &desc(4, 4)).unwrap();
        outputs.allocate(&mut backend, 1, &desc(4, 4)).unwrap();
        outputs.resize(&mut backend, 1, 2, 2).unwrap();
        assert_eq!(outputs.image_ref(1).unwrap().width, 2);

        outputs.free_all(&mut backend).unwrap();
        assert_eq!(backend.live_images(), 0);
        assert!(outputs.get(0).is_none());
        // calling again is a no-op
        outputs.free_all(&mut backend).unwrap();
    }
}
