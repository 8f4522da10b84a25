// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod app;
mod config;

use anyhow::Result;
use app::{App, Assets};
use clap::Parser;
use config::{load_cfg, AppCfg, DEFAULT_CONFIG};
use orbit_core::init_tracing;
use orbit_platform::winit::event_loop::EventLoop;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config; a missing file means defaults
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Wavefront OBJ model
    #[arg(long)]
    model: Option<PathBuf>,
    /// Texture image (any format the image crate decodes)
    #[arg(long)]
    texture: Option<PathBuf>,
    /// SPIR-V module exposing the vertex and fragment entry points
    #[arg(long)]
    shader: Option<PathBuf>,
    /// Enable the Khronos validation layer
    #[arg(long, action = clap::ArgAction::Set)]
    validation: Option<bool>,
}

impl Args {
    /// Command-line values win over the file.
    fn apply(&self, cfg: &mut AppCfg) {
        if let Some(p) = &self.model {
            cfg.assets.model = p.clone();
        }
        if let Some(p) = &self.texture {
            cfg.assets.texture = p.clone();
        }
        if let Some(p) = &self.shader {
            cfg.assets.shader = p.clone();
        }
        if let Some(v) = self.validation {
            cfg.render.validation = v;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = load_cfg(&args.config)?;
    args.apply(&mut cfg);
    info!(config = %args.config.display(), validation = cfg.render.validation, "starting");

    let assets = Assets::load(&cfg.assets)?;
    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg, assets);
    event_loop.run_app(&mut app)?;
    app.finish()
}
