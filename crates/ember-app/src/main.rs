// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ember_core::{init_tracing, LogConfig};
use ember_platform::render_size;
use ember_render::{RenderConfig, RenderSize, Renderer};
use ember_render_vk::{
    PresentStatus, RenderpassKind, SamplerKind, Texture, VkError, VkRenderer, WarpParams,
    FRAMES_IN_FLIGHT,
};
use tracing::{debug, error, info, warn};

use ember_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    raw_window_handle::{HasDisplayHandle, HasWindowHandle},
    window::{Window, WindowId},
};

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file; a missing file means defaults.
    #[arg(long, default_value = "ember.toml")]
    config: PathBuf,
    /// World-pass sample count (1, 2, 4, 8, 16)
    #[arg(long)]
    msaa: Option<u32>,
    /// Enable VK_LAYER_KHRONOS_validation when installed
    #[arg(long)]
    validation: bool,
    /// Preferred physical device index
    #[arg(long)]
    device: Option<usize>,
    /// Directory with compiled SPIR-V shaders
    #[arg(long)]
    shaders: Option<PathBuf>,
    /// Mirror the log into <data_dir>/vk.log
    #[arg(long)]
    log_file: bool,
    /// Strength of the world warp effect, 0 disables it
    #[arg(long, default_value_t = 0.0)]
    warp: f32,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct AppCfg {
    render: RenderConfig,
    log: LogConfig,
}

fn load_cfg(path: &Path) -> Result<AppCfg> {
    match fs::read_to_string(path) {
        Ok(s) => toml::from_str::<AppCfg>(&s)
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppCfg::default()),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Command-line flags win over the config file.
fn apply_args(cfg: &mut AppCfg, args: &Args) {
    if let Some(msaa) = args.msaa {
        cfg.render.msaa = msaa;
    }
    if args.validation {
        cfg.render.validation = true;
    }
    if args.device.is_some() {
        cfg.render.device_index = args.device;
    }
    if args.shaders.is_some() {
        cfg.render.shader_dir = args.shaders.clone();
    }
    if args.log_file {
        cfg.log.file = true;
    }
}

/// Two-tone RGBA checkerboard with 8-texel cells.
fn checker_texels(size: u32, a: [u8; 4], b: [u8; 4]) -> Vec<u8> {
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            if (x / 8 + y / 8) % 2 == 0 {
                a
            } else {
                b
            }
        })
        .collect()
}

/// Quad uniform: scale.xy, offset.xy, color.rgba.
fn quad_ubo(scale: [f32; 2], offset: [f32; 2], color: [f32; 4]) -> [f32; 8] {
    [
        scale[0], scale[1], offset[0], offset[1], color[0], color[1], color[2], color[3],
    ]
}

struct App {
    cfg: AppCfg,
    warp: f32,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    checker: Option<Texture>,
    render_size: RenderSize,

    started: Instant,
    frames: u32,
    last_fps_instant: Instant,
    paused: bool,
    exiting: bool,
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(cfg: AppCfg, warp: f32) -> Self {
        let now = Instant::now();
        Self {
            cfg,
            warp,
            window: None,
            renderer: None,
            checker: None,
            render_size: RenderSize {
                width: 1,
                height: 1,
            },
            started: now,
            frames: 0,
            last_fps_instant: now,
            paused: false,
            exiting: false,
            fatal: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = event_loop.create_window(Window::default_attributes().with_title("ember"))?;
        self.render_size = render_size(window.inner_size());

        let wh = window.window_handle()?;
        let dh = window.display_handle()?;
        let mut renderer = <VkRenderer as Renderer>::new(&wh, &dh, self.render_size, &self.cfg.render)?;

        let texels = checker_texels(64, [230, 230, 230, 255], [40, 40, 48, 255]);
        self.checker = Some(renderer.create_texture(64, 64, &texels, SamplerKind::Nearest)?);

        info!(
            "backend = vk, frames in flight = {}, msaa = {:?}",
            FRAMES_IN_FLIGHT,
            renderer.msaa()
        );
        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        if let (Some(r), Some(tex)) = (self.renderer.as_mut(), self.checker.take()) {
            if let Err((e, _)) = r.destroy_texture(tex) {
                warn!("checker texture not destroyed: {e}");
            }
        }
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("fatal: {err:#}");
        self.fatal = Some(err);
        self.shutdown(event_loop);
    }

    fn draw_frame(&mut self) -> Result<(), VkError> {
        let Some(r) = self.renderer.as_mut() else {
            return Ok(());
        };
        match r.begin_frame() {
            Err(VkError::SwapchainOutOfDate) => return Ok(()),
            other => other?,
        }
        let t = self.started.elapsed().as_secs_f32();
        let recorded = record_scene(r, t, self.warp, self.checker.as_ref());
        // a half-recorded frame still has to be closed out
        let status = r.end_frame(recorded.is_err())?;
        recorded?;
        if status != PresentStatus::Optimal {
            debug!("present: {status:?}");
        }
        Ok(())
    }
}

/// World quad, warp, then a UI quad and the checker texture on top.
fn record_scene(
    r: &mut VkRenderer,
    t: f32,
    warp: f32,
    checker: Option<&Texture>,
) -> Result<(), VkError> {
    r.begin_renderpass(RenderpassKind::World)?;
    let pulse = 0.5 + 0.5 * t.sin();
    r.draw_colored_rect(
        &quad_ubo([0.5, 0.5], [0.0, 0.0], [0.2, pulse, 0.8, 1.0]),
        RenderpassKind::World,
    )?;
    r.end_world_renderpass(WarpParams {
        time: t,
        intensity: warp,
    })?;

    r.draw_colored_rect(
        &quad_ubo([0.2, 0.05], [-0.75, -0.9], [0.0, 0.0, 0.0, 0.6]),
        RenderpassKind::Ui,
    )?;
    if let Some(tex) = checker {
        r.draw_textured_rect(&quad_ubo([0.15, 0.15], [0.8, 0.8], [1.0; 4]), tex)?;
    }
    Ok(())
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.init(event_loop) {
                self.fail(event_loop, e);
                return;
            }
        }

        event_loop.set_control_flow(if self.cfg.render.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });
        self.paused = self.render_size.is_empty();
        info!("resumed → paused={}", self.paused);
        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
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
                self.render_size = render_size(new_size);
                self.paused = self.render_size.is_empty();
                info!(
                    "Resized → {}x{} (paused={})",
                    self.render_size.width, self.render_size.height, self.paused
                );
                let resized = match self.renderer.as_mut() {
                    Some(r) => r.resize(self.render_size),
                    None => Ok(()),
                };
                if let Err(e) = resized {
                    self.fail(event_loop, e);
                    return;
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::Occluded(occluded) => {
                self.paused = occluded || self.render_size.is_empty();
                info!("Occluded={} → paused={}", occluded, self.paused);
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                match self.draw_frame() {
                    Ok(()) => self.frames = self.frames.saturating_add(1),
                    Err(e) if e.is_fatal() => self.fail(event_loop, anyhow!(e)),
                    Err(e) => warn!("frame skipped: {e}"),
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if self.paused {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            if let Some(r) = &self.renderer {
                let s = r.stats();
                info!(
                    "fps ~ {} vbo {}/{} ubo {}/{}",
                    self.frames,
                    s.vertex.peak,
                    s.vertex.capacity,
                    s.uniform.peak,
                    s.uniform.capacity
                );
            }
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = load_cfg(&args.config)?;
    apply_args(&mut cfg, &args);
    if let Some(path) = init_tracing(&cfg.log) {
        info!("logging to {}", path.display());
    }

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg, args.warp);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
