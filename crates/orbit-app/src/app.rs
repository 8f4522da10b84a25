// SPDX-License-Identifier: CEPL-1.0
use crate::config::{AppCfg, AssetsCfg};
use anyhow::{Context, Result};
use orbit_core::FpsCounter;
use orbit_platform::winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow},
    window::{Window, WindowId},
};
use orbit_platform::{render_size, WindowProbe};
use orbit_render::{FrameLoop, FrameOutcome, MeshData, TextureData};
use orbit_render_vk::{RendererDesc, ShaderStages, VkRenderer};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// CPU-side inputs, loaded before the event loop starts.
pub struct Assets {
    pub mesh: MeshData,
    pub texture: TextureData,
    pub shaders: ShaderStages,
}

impl Assets {
    pub fn load(cfg: &AssetsCfg) -> Result<Self> {
        let mesh = MeshData::load_obj(&cfg.model).context("load model")?;
        let texture = TextureData::load(&cfg.texture).context("load texture")?;
        let shaders = load_shaders(cfg).context("load shaders")?;
        info!(
            model = %cfg.model.display(),
            vertices = mesh.vertices().len(),
            indices = mesh.index_count(),
            texture = %cfg.texture.display(),
            "assets loaded"
        );
        Ok(Self {
            mesh,
            texture,
            shaders,
        })
    }
}

fn load_shaders(cfg: &AssetsCfg) -> Result<ShaderStages> {
    if let Some(builtin) = builtin_fallback(cfg) {
        return builtin;
    }
    ShaderStages::from_spirv_file(&cfg.shader, &cfg.vertex_entry, &cfg.fragment_entry)
}

#[cfg(feature = "builtin-shaders")]
fn builtin_fallback(cfg: &AssetsCfg) -> Option<Result<ShaderStages>> {
    if cfg.shader.exists() {
        return None;
    }
    info!(shader = %cfg.shader.display(), "shader not found, using built-in GLSL");
    Some(ShaderStages::builtin())
}

#[cfg(not(feature = "builtin-shaders"))]
fn builtin_fallback(_cfg: &AssetsCfg) -> Option<Result<ShaderStages>> {
    None
}

pub struct App {
    cfg: AppCfg,
    assets: Option<Assets>,
    // dropped before the window: the surface borrows it
    frame_loop: Option<FrameLoop<VkRenderer>>,
    window: Option<Window>,
    paused: bool,
    fps: FpsCounter,
    error: Option<anyhow::Error>,
}

impl App {
    pub fn new(cfg: AppCfg, assets: Assets) -> Self {
        Self {
            cfg,
            assets: Some(assets),
            frame_loop: None,
            window: None,
            paused: false,
            fps: FpsCounter::new(Duration::from_secs(1)),
            error: None,
        }
    }

    /// Hands back the error that stopped the event loop, if any.
    pub fn finish(self) -> Result<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let assets = self
            .assets
            .take()
            .context("renderer already initialised")?;
        let attrs = Window::default_attributes()
            .with_title(self.cfg.window.title.clone())
            .with_inner_size(LogicalSize::new(self.cfg.window.width, self.cfg.window.height));
        let window = event_loop.create_window(attrs).context("create window")?;
        let size = render_size(window.inner_size());

        let renderer = VkRenderer::new(
            &window,
            &window,
            RendererDesc {
                size,
                app_name: &self.cfg.window.title,
                validation: self.cfg.render.validation,
                force_render_pass: self.cfg.render.force_render_pass,
                present: self.cfg.render.present_mode.into(),
                clear_color: self.cfg.render.clear_color,
                shaders: assets.shaders,
                mesh: &assets.mesh,
                texture: &assets.texture,
            },
        )?;

        self.paused = size.is_zero();
        self.frame_loop = Some(FrameLoop::new(renderer));
        self.window = Some(window);
        info!(width = size.width, height = size.height, paused = self.paused, "resumed");
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(mut frame_loop) = self.frame_loop.take() {
            frame_loop.shutdown()?;
        }
        self.window = None;
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:#}");
        if let Err(e) = self.shutdown() {
            error!("shutdown after failure: {e:#}");
        }
        self.error.get_or_insert(err);
        event_loop.exit();
    }

    fn redraw(&mut self) -> Result<()> {
        let (Some(window), Some(frame_loop)) = (&self.window, &mut self.frame_loop) else {
            return Ok(());
        };
        let mut probe = WindowProbe::new(window);
        match frame_loop.draw_frame(&mut probe)? {
            FrameOutcome::Presented { .. } => self.fps.frame(),
            FrameOutcome::Dropped => debug!("frame dropped"),
        }
        Ok(())
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() && self.assets.is_some() {
            if let Err(e) = self.init(event_loop) {
                self.fail(event_loop, e);
                return;
            }
        }
        if let Some(w) = &self.window {
            if !self.paused {
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
                if let Err(e) = self.shutdown() {
                    self.fail(event_loop, e);
                    return;
                }
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                let size = render_size(new_size);
                let now_paused = size.is_zero();
                if self.paused != now_paused {
                    info!(width = size.width, height = size.height, paused = now_paused, "resized");
                }
                self.paused = now_paused;
                if let Some(frame_loop) = &mut self.frame_loop {
                    frame_loop.notify_resized();
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.paused {
                    return;
                }
                if let Err(e) = self.redraw() {
                    self.fail(event_loop, e);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let now = Instant::now();
        if self.paused || self.frame_loop.is_none() {
            // minimized: sleep until the window system wakes us
            event_loop.set_control_flow(ControlFlow::Wait);
            self.fps.reset(now);
            return;
        }

        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        if let Some(frames) = self.fps.tick(now) {
            debug!(fps = frames, "frame rate");
        }
    }
}
