//! Shared fixtures for the render graph integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use ash::vk;

use aurora_render::backend::{BackendError, ImageDesc, ImageLayout, ImageUsage, RenderBegin};
use aurora_render::render_graph::{PassContext, RenderPass};
use aurora_render::{
    ContextLimits, DummyBackend, ExecutionContext, GraphResult, RenderBackend, Renderer,
    RendererConfig,
};

/// Lifecycle calls recorded by [`RecordingPass`], e.g. `"init blur"`.
pub type CallLog = Rc<RefCell<Vec<String>>>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn call_log() -> CallLog {
    Rc::new(RefCell::new(Vec::new()))
}

/// A pass that samples every input and renders into every output.
///
/// Outputs are sized from the frame extent and reallocated on resize.
pub struct RecordingPass {
    name: &'static str,
    inputs: u32,
    outputs: u32,
    log: CallLog,
}

impl RecordingPass {
    pub fn new(name: &'static str, inputs: u32, outputs: u32, log: &CallLog) -> Self {
        Self {
            name,
            inputs,
            outputs,
            log: log.clone(),
        }
    }

    fn record(&self, call: &str) {
        self.log.borrow_mut().push(format!("{} {}", call, self.name));
    }
}

impl<B: RenderBackend> RenderPass<B> for RecordingPass {
    fn name(&self) -> &str {
        self.name
    }

    fn input_count(&self) -> u32 {
        self.inputs
    }

    fn output_count(&self) -> u32 {
        self.outputs
    }

    fn init(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        for i in 0..self.inputs {
            ctx.input(i)?;
        }
        let (width, height) = ctx.extent();
        for i in 0..self.outputs {
            let desc = ImageDesc::new_2d(
                width,
                height,
                vk::Format::R8G8B8A8_UNORM,
                ImageUsage::RENDER_TARGET,
            )
            .with_label(format!("{} output {}", self.name, i));
            ctx.outputs.allocate(ctx.backend, i, &desc)?;
        }
        self.record("init");
        Ok(())
    }

    fn update(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        for i in 0..self.inputs {
            let input = ctx.input(i)?;
            ctx.transition_to(input.handle, ImageLayout::ShaderReadOnly)?;
        }
        for i in 0..self.outputs {
            let output = ctx.outputs.image_ref(i)?;
            ctx.transition(output.handle, ImageLayout::Undefined, ImageLayout::ColorAttachment)?;

            let cmd = ctx.cmd();
            ctx.backend
                .cmd_begin_rendering(cmd, &RenderBegin::new(output.width, output.height).color(output.handle))?;
            ctx.backend.cmd_set_viewport(cmd, output.width, output.height)?;
            ctx.backend.cmd_draw(cmd, 3)?;
            ctx.backend.cmd_end_rendering(cmd)?;

            ctx.transition(output.handle, ImageLayout::ColorAttachment, ImageLayout::ShaderReadOnly)?;
        }
        self.record("update");
        Ok(())
    }

    fn resize(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        let (width, height) = ctx.extent();
        for i in 0..self.outputs {
            ctx.outputs.resize(ctx.backend, i, width, height)?;
        }
        self.record("resize");
        Ok(())
    }

    fn free(&mut self, _ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        self.record("free");
        Ok(())
    }
}

/// A pass whose `init` allocates its outputs and then runs out of memory.
pub struct FailingPass {
    inputs: u32,
    outputs: u32,
}

impl FailingPass {
    pub fn new(inputs: u32, outputs: u32) -> Self {
        Self { inputs, outputs }
    }
}

impl<B: RenderBackend> RenderPass<B> for FailingPass {
    fn name(&self) -> &str {
        "failing"
    }

    fn input_count(&self) -> u32 {
        self.inputs
    }

    fn output_count(&self) -> u32 {
        self.outputs
    }

    fn init(&mut self, ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        let (width, height) = ctx.extent();
        for i in 0..self.outputs {
            let desc = ImageDesc::new_2d(
                width,
                height,
                vk::Format::R8G8B8A8_UNORM,
                ImageUsage::RENDER_TARGET,
            );
            ctx.outputs.allocate(ctx.backend, i, &desc)?;
        }
        Err(BackendError::OutOfMemory.into())
    }

    fn update(&mut self, _ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        Ok(())
    }

    fn resize(&mut self, _ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        Ok(())
    }

    fn free(&mut self, _ctx: &mut PassContext<'_, B>) -> GraphResult<()> {
        Ok(())
    }
}

pub fn small_limits() -> ContextLimits {
    ContextLimits {
        image_heap_capacity: 16,
        sampler_heap_capacity: 8,
        max_lights: 4,
        max_drawables: 4,
    }
}

/// A dummy backend plus an execution context sized to its swapchain.
pub fn dummy_setup(width: u32, height: u32) -> (DummyBackend, ExecutionContext) {
    let mut backend = DummyBackend::new(width, height);
    let exec = ExecutionContext::new(&mut backend, width, height, small_limits())
        .expect("execution context");
    (backend, exec)
}

pub fn dummy_renderer(width: u32, height: u32) -> Renderer<DummyBackend> {
    let config = RendererConfig {
        width,
        height,
        image_heap_capacity: 16,
        sampler_heap_capacity: 8,
        max_lights: 4,
        max_drawables: 4,
        ..Default::default()
    };
    Renderer::new(DummyBackend::new(width, height), &config).expect("renderer")
}

/// Number of GPU objects the dummy backend still tracks, swapchain excluded.
pub fn live_objects(backend: &DummyBackend) -> usize {
    backend.live_images()
        + backend.live_buffers()
        + backend.live_samplers()
        + backend.live_pipelines()
        + backend.live_shaders()
        + backend.live_descriptor_sets()
        + backend.live_descriptor_set_layouts()
}
