// =============================================================================
// FRAME CORE - double-buffered Vulkan frame lifecycle
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, window, quit/suspend signals)           │
// │    └── Engine (init / tick / cleanup, global deletion queue)    │
// │          └── FrameLoop (frame number, suspend, rebuild)         │
// │                ├── FrameSlot x2 (command buffer, sync, queue)   │
// │                ├── Swapchain (acquire, present, rebuild)        │
// │                └── Draw image (cleared, blitted to swapchain)   │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait on the slot's fence, flush its deletion queue, reset
// 2. Acquire a swapchain image
// 3. Record: clear draw image, blit into swapchain image
// 4. Submit (wait acquire semaphore, signal render semaphore + fence)
// 5. Present, advance the frame number
//
// =============================================================================

mod backend;
mod config;
mod engine;
mod error;
mod frame_loop;

use anyhow::Result;
use config::Config;
use engine::Engine;
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting frame core");
    log::info!(
        "Window: {}x{}, present mode: {}, {} frames in flight",
        config.window.width,
        config.window.height,
        config.graphics.present_mode,
        config.frames_in_flight()
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging. RUST_LOG overrides the configured level.
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};

    let mut builder = Builder::new();
    builder.filter_level(config.log_level());
    builder.parse_default_env();

    if config.debug.log_to_file {
        match File::create(&config.debug.log_file) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the engine must go before the window
/// its surface was created from.
struct App {
    config: Config,
    engine: Option<Engine>,
    window: Option<Arc<Window>>,

    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            engine: None,
            window: None,
            frame_count: 0,
            last_fps_update: Instant::now(),
        }
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut engine) = self.engine.take() {
            engine.cleanup();
        }
        event_loop.exit();
    }

    fn update_fps(&mut self) {
        self.frame_count += 1;

        let elapsed = self.last_fps_update.elapsed().as_secs_f32();
        if elapsed >= 1.0 {
            log::debug!("{:.0} FPS", self.frame_count as f32 / elapsed);
            self.frame_count = 0;
            self.last_fps_update = Instant::now();
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match Engine::init(&window, &self.config) {
            Ok(engine) => self.engine = Some(engine),
            Err(e) => {
                log::error!("Failed to initialize engine: {:?}", e);
                event_loop.exit();
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(engine) = self.engine.as_mut() {
                    engine.resize(size.width, size.height);
                }
            }

            // Hidden or restored without a size change
            WindowEvent::Occluded(occluded) => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.set_occluded(occluded);
                }
            }

            WindowEvent::RedrawRequested => {
                let Some(engine) = self.engine.as_mut() else {
                    return;
                };

                match engine.tick() {
                    Ok(frame_loop::FrameOutcome::Presented { .. }) => self.update_fps(),
                    Ok(frame_loop::FrameOutcome::Suspended) => {}
                    Err(e) if e.is_fatal() => {
                        log::error!(
                            "Frame {} failed: {}; shutting down",
                            engine.frame_number(),
                            e
                        );
                        self.shutdown(event_loop);
                    }
                    Err(e) => log::warn!("Frame skipped: {}", e),
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown(event_loop);
                }
            }

            _ => {}
        }
    }

    /// Spin while rendering; poll slowly while suspended.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(engine) = self.engine.as_ref() else {
            return;
        };

        if engine.is_suspended() {
            event_loop.set_control_flow(ControlFlow::WaitUntil(
                Instant::now() + self.config.idle_poll_interval(),
            ));
        } else {
            event_loop.set_control_flow(ControlFlow::Poll);
            if let Some(ref window) = self.window {
                window.request_redraw();
            }
        }
    }
}
