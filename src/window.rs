//! Window and event loop glue using winit

use std::sync::Arc;

use thiserror::Error;
use winit::{
    dpi::PhysicalSize,
    error::{EventLoopError, OsError},
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    window::{Window, WindowBuilder},
};

use crate::error::GraphError;
use crate::RendererConfig;

#[derive(Error, Debug)]
pub enum WindowError {
    #[error("event loop failed: {0}")]
    EventLoop(#[from] EventLoopError),
    #[error("failed to create window: {0}")]
    Os(#[from] OsError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// What the frame callback is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    /// The window changed size since the last callback.
    Resized { width: u32, height: u32 },
    /// Record and present one frame.
    Redraw,
}

/// Returned by the frame callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Open a window described by `config` and drive `frame` until it is closed.
///
/// `setup` receives the window and builds the application state, which
/// should keep the window alive for as long as it holds a surface. Resize
/// events are coalesced and delivered before the next redraw. A minimized
/// window gets no redraws. Returning [`Flow::Exit`] ends the loop as if the
/// window were closed. The first error stops the loop and is returned.
///
/// On a clean exit the state is handed back so the caller can shut it down
/// explicitly.
pub fn run<S, Setup, Frame>(
    config: &RendererConfig,
    setup: Setup,
    mut frame: Frame,
) -> Result<S, WindowError>
where
    Setup: FnOnce(Arc<Window>) -> Result<S, GraphError>,
    Frame: FnMut(&mut S, FrameEvent) -> Result<Flow, GraphError>,
{
    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        WindowBuilder::new()
            .with_title(config.title.as_str())
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .build(&event_loop)?,
    );
    let mut state = setup(Arc::clone(&window))?;

    let mut pending_resize: Option<PhysicalSize<u32>> = None;
    let mut failure: Option<GraphError> = None;

    event_loop.run(|event, elwt: &EventLoopWindowTarget<()>| {
        elwt.set_control_flow(ControlFlow::Poll);

        match event {
            Event::WindowEvent {
                event: WindowEvent::Resized(size),
                ..
            } => {
                pending_resize = Some(size);
            }
            Event::WindowEvent {
                event: WindowEvent::CloseRequested,
                ..
            } => {
                log::info!("Close requested");
                elwt.exit();
            }
            Event::AboutToWait => {
                let mut result = Ok(Flow::Continue);
                if let Some(size) = pending_resize.take() {
                    result = frame(
                        &mut state,
                        FrameEvent::Resized {
                            width: size.width,
                            height: size.height,
                        },
                    );
                }

                let size = window.inner_size();
                if matches!(result, Ok(Flow::Continue)) && size.width > 0 && size.height > 0 {
                    result = frame(&mut state, FrameEvent::Redraw);
                }

                match result {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Exit) => elwt.exit(),
                    Err(e) => {
                        log::error!("Frame failed: {}", e);
                        failure = Some(e);
                        elwt.exit();
                    }
                }
            }
            _ => {}
        }
    })?;

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(state),
    }
}
