//! Renderer facade
//!
//! Owns the backend, the render graph and the execution context and passes
//! them to each other explicitly. There is no global state.

use std::path::PathBuf;

use crate::backend::{BackendError, RenderBackend};
use crate::error::GraphResult;
use crate::passes::{FinalBlitPass, FxaaPass, GeometryPass};
use crate::render_graph::{ExecutionContext, NodeId, PortId, RenderGraph, RenderPass};
use crate::RendererConfig;

/// Node ids of the built-in deferred pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredNodes {
    pub geometry: NodeId,
    pub fxaa: NodeId,
    pub final_blit: NodeId,
}

pub struct Renderer<B: RenderBackend> {
    backend: B,
    graph: RenderGraph<B>,
    context: ExecutionContext,
    frames_rendered: u64,
}

impl<B: RenderBackend> Renderer<B> {
    /// Wrap `backend`, sizing the execution context to its swapchain.
    pub fn new(mut backend: B, config: &RendererConfig) -> GraphResult<Self> {
        let (width, height) = backend.swapchain_extent();
        let context = ExecutionContext::new(&mut backend, width, height, config.limits())?;
        log::info!("Renderer created at {}x{}", width, height);
        Ok(Self {
            backend,
            graph: RenderGraph::new(),
            context,
            frames_rendered: 0,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn graph(&self) -> &RenderGraph<B> {
        &self.graph
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn add_node<P: RenderPass<B> + 'static>(&mut self, pass: P) -> GraphResult<NodeId> {
        self.graph.add_node(pass)
    }

    pub fn connect(
        &mut self,
        src_port: PortId,
        dst_port: PortId,
        src: NodeId,
        dst: NodeId,
    ) -> GraphResult<()> {
        self.graph.connect(src_port, dst_port, src, dst)
    }

    pub fn bake(&mut self, terminal: NodeId) -> GraphResult<()> {
        self.graph
            .bake(terminal, &mut self.backend, &mut self.context)
    }

    /// Add Geometry -> FXAA -> Final Blit and bake with the blit as terminal.
    pub fn bake_deferred(&mut self, environment_map: Option<PathBuf>) -> GraphResult<DeferredNodes> {
        let geometry = match environment_map {
            Some(path) => GeometryPass::new().with_environment(path),
            None => GeometryPass::new(),
        };
        let geometry = self.graph.add_node(geometry)?;
        let fxaa = self.graph.add_node(FxaaPass::new())?;
        let final_blit = self.graph.add_node(FinalBlitPass::new())?;

        self.graph
            .connect(GeometryPass::LIT, FxaaPass::COLOR, geometry, fxaa)?;
        self.graph
            .connect(FxaaPass::ANTI_ALIASED, FinalBlitPass::IMAGE, fxaa, final_blit)?;
        self.bake(final_blit)?;

        Ok(DeferredNodes {
            geometry,
            fxaa,
            final_blit,
        })
    }

    /// Begin a frame, record every node, submit and present.
    ///
    /// A swapchain that went out of date is recreated at the surface's
    /// current size and the frame is skipped.
    pub fn render_frame(&mut self) -> GraphResult<()> {
        match self.backend.begin_frame() {
            Ok(()) => {}
            Err(BackendError::SurfaceLost) => {
                let (width, height) = self.backend.swapchain_extent();
                log::warn!("Surface lost, recreating swapchain");
                return self.handle_resize(width, height);
            }
            Err(e) => return Err(e.into()),
        }
        self.graph.update(&mut self.backend, &mut self.context)?;
        self.backend.end_frame()?;
        self.backend.present()?;
        self.frames_rendered += 1;
        Ok(())
    }

    /// Recreate the swapchain and let every node reallocate.
    ///
    /// Zero-sized requests (a minimized window) are ignored.
    pub fn handle_resize(&mut self, width: u32, height: u32) -> GraphResult<()> {
        if width == 0 || height == 0 {
            log::debug!("Ignoring resize to {}x{}", width, height);
            return Ok(());
        }
        self.backend.wait_idle()?;
        self.backend.resize_swapchain(width, height)?;

        let (width, height) = self.backend.swapchain_extent();
        self.context.set_extent(width, height);
        if self.graph.is_baked() {
            self.graph.resize(&mut self.backend, &mut self.context)?;
        }
        Ok(())
    }

    /// Free every node and the context, then hand the backend back so it is
    /// dropped last.
    pub fn shutdown(mut self) -> GraphResult<B> {
        self.backend.wait_idle()?;
        self.graph.free(&mut self.backend, &mut self.context)?;
        self.context.destroy(&mut self.backend)?;
        log::info!("Renderer shut down after {} frames", self.frames_rendered);
        Ok(self.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{Command, DummyBackend};
    use crate::backend::ImageLayout;

    fn renderer() -> Renderer<DummyBackend> {
        Renderer::new(DummyBackend::new(64, 48), &RendererConfig::default()).unwrap()
    }

    #[test]
    fn test_context_matches_swapchain() {
        let renderer = renderer();
        assert_eq!(renderer.context().width(), 64);
        assert_eq!(renderer.context().height(), 48);
    }

    #[test]
    fn test_render_frames_presents_each() {
        let mut renderer = renderer();
        let nodes = renderer.bake_deferred(None).unwrap();
        for _ in 0..5 {
            renderer.render_frame().unwrap();
        }
        assert_eq!(renderer.frames_rendered(), 5);
        assert_eq!(renderer.backend().frames_presented(), 5);
        assert!(renderer.backend().outstanding_submissions() <= crate::FRAMES_IN_FLIGHT);

        let swapchain = renderer.backend().swapchain_image();
        assert_eq!(
            renderer.backend().image_layout(swapchain.handle).unwrap(),
            ImageLayout::PresentSrc
        );
        let commands = renderer.backend().frame_commands();
        assert!(matches!(commands.last(), Some(Command::Transition { to: ImageLayout::PresentSrc, .. })));
        assert_eq!(renderer.graph().order(), &[nodes.geometry, nodes.fxaa, nodes.final_blit]);
    }

    #[test]
    fn test_zero_resize_is_ignored() {
        let mut renderer = renderer();
        renderer.bake_deferred(None).unwrap();
        let allocations = renderer.backend().total_image_allocations();

        renderer.handle_resize(0, 300).unwrap();
        renderer.handle_resize(300, 0).unwrap();
        assert_eq!(renderer.backend().swapchain_extent(), (64, 48));
        assert_eq!(renderer.backend().total_image_allocations(), allocations);
    }

    #[test]
    fn test_resize_reaches_every_node() {
        let mut renderer = renderer();
        let nodes = renderer.bake_deferred(None).unwrap();
        renderer.render_frame().unwrap();

        renderer.handle_resize(128, 96).unwrap();
        assert_eq!(renderer.backend().swapchain_extent(), (128, 96));
        assert_eq!(renderer.context().width(), 128);
        let lit = renderer.graph().output_image(nodes.geometry, 0).unwrap();
        let anti_aliased = renderer.graph().output_image(nodes.fxaa, 0).unwrap();
        assert_eq!((lit.width, lit.height), (128, 96));
        assert_eq!((anti_aliased.width, anti_aliased.height), (128, 96));

        renderer.render_frame().unwrap();
    }

    #[test]
    fn test_resize_before_bake() {
        let mut renderer = renderer();
        renderer.handle_resize(32, 32).unwrap();
        assert_eq!(renderer.context().width(), 32);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut renderer = renderer();
        renderer.bake_deferred(None).unwrap();
        renderer.render_frame().unwrap();
        renderer.handle_resize(80, 60).unwrap();
        renderer.render_frame().unwrap();

        let backend = renderer.shutdown().unwrap();
        assert_eq!(backend.live_images(), 0);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.live_samplers(), 0);
        assert_eq!(backend.live_pipelines(), 0);
        assert_eq!(backend.live_shaders(), 0);
        assert_eq!(backend.live_descriptor_sets(), 0);
        assert_eq!(backend.live_descriptor_set_layouts(), 0);
    }

    #[test]
    fn test_failed_bake_still_shuts_down_clean() {
        let config = RendererConfig {
            sampler_heap_capacity: 1,
            ..Default::default()
        };
        let mut renderer = Renderer::new(DummyBackend::new(64, 48), &config).unwrap();
        assert!(renderer.bake_deferred(None).is_err());
        assert_eq!(renderer.context().sampler_heap.used_count(), 0);

        let backend = renderer.shutdown().unwrap();
        assert_eq!(backend.live_images(), 0);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.live_samplers(), 0);
        assert_eq!(backend.live_pipelines(), 0);
        assert_eq!(backend.live_shaders(), 0);
        assert_eq!(backend.live_descriptor_sets(), 0);
        assert_eq!(backend.live_descriptor_set_layouts(), 0);
    }
}
