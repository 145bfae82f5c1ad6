// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use strata_core::init_tracing;
use strata_math::Vec3;
use strata_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{Key, NamedKey},
    window::{Window, WindowId},
};
use strata_platform::{camera_action_for, create_window, CameraAction, DEFAULT_TITLE};
use strata_render::{FrameOutcome, RenderSize, Renderer, Viewport};
use strata_render_vk::VkRenderer;
use tracing::{error, info};

mod config;
mod demo;

use config::{load_cfg, AppCfg, DEFAULT_CONFIG};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Force the Vulkan validation layer on
    #[arg(long)]
    validation: bool,
    /// Override `render.show_grid`
    #[arg(long)]
    grid: Option<bool>,
}

struct App {
    cfg: AppCfg,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    viewport: Viewport,
    render_size: RenderSize,

    exiting: bool,
    fatal: Option<anyhow::Error>,
    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn new(cfg: AppCfg) -> Self {
        let centre = Vec3::new(
            cfg.terrain.width as f32 / 2.0,
            0.0,
            cfg.terrain.height as f32 / 2.0,
        );
        Self {
            viewport: Viewport::looking_at(centre, cfg.camera.zoom),
            cfg,
            window: None,
            renderer: None,
            render_size: RenderSize::new(1, 1),
            exiting: false,
            fatal: None,
            frames: 0,
            last_fps_instant: Instant::now(),
        }
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = create_window(event_loop, DEFAULT_TITLE, 1280, 720)?;
        let size = window.inner_size();
        self.render_size = RenderSize::new(size.width, size.height);

        let mut renderer =
            VkRenderer::new(&window, &window, self.render_size, self.cfg.render.to_options())?;
        info!("renderer on '{}'", renderer.device_name());

        let terrain = demo::heightmap(&self.cfg.terrain)?;
        renderer.upload_terrain(&terrain)?;

        window.request_redraw();
        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    /// Drops the renderer before the window it presents to.
    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        if let Some(r) = self.renderer.take() {
            info!(
                "presented {} frames, {} swapchain rebuilds",
                r.frames_presented(),
                r.rebuilds()
            );
        }
        self.window = None;
        event_loop.exit();
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("fatal: {e:#}");
        self.fatal = Some(e);
        self.shutdown(event_loop);
    }

    fn apply(&mut self, action: CameraAction) {
        match action {
            CameraAction::Pan { dx, dz } => {
                let step = self.cfg.camera.pan_step;
                self.viewport.pan(dx as f32 * step, dz as f32 * step);
            }
            CameraAction::ZoomIn => self.viewport.zoom_in(),
            CameraAction::ZoomOut => self.viewport.zoom_out(),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.start(event_loop) {
                self.fail(event_loop, e);
                return;
            }
        }
        event_loop.set_control_flow(ControlFlow::Wait);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize::new(new_size.width, new_size.height);
                info!(
                    "Resized → {}x{}",
                    self.render_size.width, self.render_size.height
                );
                if let Some(r) = &mut self.renderer {
                    if let Err(e) = r.resize(self.render_size) {
                        self.fail(event_loop, e);
                        return;
                    }
                }
                if let Some(w) = &self.window {
                    w.request_redraw();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.logical_key == Key::Named(NamedKey::Escape) {
                    self.shutdown(event_loop);
                    return;
                }
                if let Some(action) = camera_action_for(&event) {
                    self.apply(action);
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting {
                    return;
                }
                let Some(r) = &mut self.renderer else {
                    return;
                };
                match r.render(&self.viewport) {
                    Ok(FrameOutcome::Presented) => {
                        self.frames = self.frames.saturating_add(1);
                    }
                    Ok(FrameOutcome::Dropped | FrameOutcome::Deferred) => {}
                    Err(e) => self.fail(event_loop, e),
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        // Keep drawing while minimised; the renderer drains events and
        // defers the frame itself when the surface has no extent.
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = load_cfg(&args.config);
    if args.validation {
        cfg.render.validation = true;
    }
    if let Some(grid) = args.grid {
        cfg.render.show_grid = grid;
    }

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
