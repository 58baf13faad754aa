//! Final blit onto the swapchain

use crate::backend::{ImageLayout, RenderBackend};
use crate::error::GraphResult;
use crate::render_graph::{PassContext, PortId, RenderPass};

/// Copies its input onto the acquired swapchain image and leaves the
/// swapchain image ready for presentation. Typically the terminal node.
#[derive(Debug, Default)]
pub struct FinalBlitPass;

impl FinalBlitPass {
    pub const IMAGE: PortId = PortId::input(0);

    pub fn new() -> Self {
        Self
    }
}

impl<B: RenderBackend> RenderPass<B> for FinalBlitPass {
    fn name(&self) -> &str {
        "final_blit"
    }

    fn input_count(&self) -> u32 {
        1
    }

    fn init(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        ctx.input(Self::IMAGE.index())?;
        Ok(())
    }

    fn update(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        let input = ctx.input(Self::IMAGE.index())?;
        let swapchain = ctx.backend.swapchain_image();

        // previous contents of the swapchain image are discarded
        ctx.transition(
            swapchain.handle,
            ImageLayout::Undefined,
            ImageLayout::TransferDst,
        )?;
        ctx.transition_to(input.handle, ImageLayout::TransferSrc)?;

        let cmd = ctx.cmd();
        ctx.backend.cmd_blit_image(cmd, input.handle, swapchain.handle)?;

        ctx.transition(
            swapchain.handle,
            ImageLayout::TransferDst,
            ImageLayout::PresentSrc,
        )
    }

    fn resize(&mut self, _ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        Ok(())
    }

    fn free(&mut self, _ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        Ok(())
    }
}
