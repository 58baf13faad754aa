//! # Deferred Demo
//!
//! Opens a window and renders Geometry -> FXAA -> Final Blit on the Vulkan
//! backend, orbiting the camera around the origin.
//!
//! ```bash
//! cargo run --example deferred -- --shader-dir shaders --environment sky.hdr
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use glam::Vec3;
use winit::window::Window;

use aurora_render::render_graph::PointLight;
use aurora_render::window::{self, Flow, FrameEvent};
use aurora_render::{Camera, GraphResult, Renderer, RendererConfig, VulkanBackend};

/// Deferred rendering demo.
#[derive(Parser, Debug)]
#[command(name = "deferred", about = "Frame graph deferred rendering demo", version)]
struct Args {
    /// Initial window width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Initial window height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Disable vertical sync (may cause tearing).
    #[arg(long)]
    no_vsync: bool,

    /// Enable GPU validation layers.
    #[arg(long)]
    validation: bool,

    /// Directory holding the precompiled SPIR-V shaders.
    #[arg(long, default_value = "shaders")]
    shader_dir: PathBuf,

    /// Equirectangular HDR environment map.
    #[arg(long)]
    environment: Option<PathBuf>,

    /// Exit after rendering N frames.
    #[arg(long)]
    max_frames: Option<u64>,
}

impl From<Args> for RendererConfig {
    fn from(args: Args) -> Self {
        Self {
            title: "Aurora Deferred".to_string(),
            width: args.width,
            height: args.height,
            vsync: !args.no_vsync,
            validation: args.validation,
            shader_dir: args.shader_dir,
            environment_map: args.environment,
            ..Default::default()
        }
    }
}

struct Demo {
    renderer: Renderer<VulkanBackend>,
    camera: Camera,
    start: Instant,
    max_frames: Option<u64>,
    // declared last so the surface goes before the window
    _window: Arc<Window>,
}

impl Demo {
    fn new(window: Arc<Window>, config: &RendererConfig, max_frames: Option<u64>) -> GraphResult<Self> {
        let backend = VulkanBackend::new(window.as_ref(), config)?;
        let mut renderer = Renderer::new(backend, config)?;
        renderer.bake_deferred(config.environment_map.clone())?;

        let context = renderer.context_mut();
        context.push_light(PointLight::new(Vec3::new(4.0, 6.0, 4.0), Vec3::new(1.0, 0.9, 0.8)))?;
        context.push_light(PointLight::new(Vec3::new(-5.0, 3.0, -2.0), Vec3::new(0.3, 0.4, 1.0)))?;

        let size = window.inner_size();
        let mut camera = Camera::new(Vec3::new(0.0, 2.0, 8.0), 0.0, -10f32.to_radians());
        camera.set_aspect(size.width, size.height);

        Ok(Self {
            renderer,
            camera,
            start: Instant::now(),
            max_frames,
            _window: window,
        })
    }

    fn frame(&mut self, event: FrameEvent) -> GraphResult<Flow> {
        match event {
            FrameEvent::Resized { width, height } => {
                self.camera.set_aspect(width, height);
                self.renderer.handle_resize(width, height)?;
            }
            FrameEvent::Redraw => {
                if self
                    .max_frames
                    .is_some_and(|max| self.renderer.frames_rendered() >= max)
                {
                    log::info!("Rendered {} frames, exiting", self.renderer.frames_rendered());
                    return Ok(Flow::Exit);
                }

                // orbit the origin, always facing it
                let t = self.start.elapsed().as_secs_f32() * 0.3;
                self.camera.position = Vec3::new(8.0 * t.cos(), 2.0, 8.0 * t.sin());
                self.camera.yaw = std::f32::consts::FRAC_PI_2 - t;
                self.renderer.context_mut().set_camera(&self.camera);
                self.renderer.render_frame()?;
            }
        }
        Ok(Flow::Continue)
    }
}

fn main() {
    aurora_render::init_logging();

    let args = Args::parse();
    let max_frames = args.max_frames;
    let config = RendererConfig::from(args);
    log::info!("Starting deferred demo at {}x{}", config.width, config.height);

    let result = window::run(
        &config,
        |window| Demo::new(window, &config, max_frames),
        |demo, event| demo.frame(event),
    );

    let demo = match result {
        Ok(demo) => demo,
        Err(e) => {
            log::error!("Demo failed: {}", e);
            std::process::exit(1);
        }
    };

    let Demo {
        renderer, _window, ..
    } = demo;
    match renderer.shutdown() {
        Ok(backend) => drop(backend),
        Err(e) => log::error!("Shutdown failed: {}", e),
    }
    drop(_window);
}
