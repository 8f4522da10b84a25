// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use orbit_render_vk::PresentPreference;
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG: &str = "orbit.toml";

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct AppCfg {
    #[serde(default)]
    pub window: WindowCfg,
    #[serde(default)]
    pub assets: AssetsCfg,
    #[serde(default)]
    pub render: RenderCfg,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WindowCfg {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_title")]
    pub title: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AssetsCfg {
    #[serde(default = "default_model")]
    pub model: PathBuf,
    #[serde(default = "default_texture")]
    pub texture: PathBuf,
    #[serde(default = "default_shader")]
    pub shader: PathBuf,
    #[serde(default = "default_vertex_entry")]
    pub vertex_entry: String,
    #[serde(default = "default_fragment_entry")]
    pub fragment_entry: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RenderCfg {
    #[serde(default = "default_validation")]
    pub validation: bool,
    #[serde(default)]
    pub present_mode: PresentModeCfg,
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    #[serde(default)]
    pub force_render_pass: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeCfg {
    #[default]
    Mailbox,
    Fifo,
}

impl From<PresentModeCfg> for PresentPreference {
    fn from(m: PresentModeCfg) -> Self {
        match m {
            PresentModeCfg::Mailbox => PresentPreference::Mailbox,
            PresentModeCfg::Fifo => PresentPreference::Fifo,
        }
    }
}

impl Default for WindowCfg {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            title: default_title(),
        }
    }
}

impl Default for AssetsCfg {
    fn default() -> Self {
        Self {
            model: default_model(),
            texture: default_texture(),
            shader: default_shader(),
            vertex_entry: default_vertex_entry(),
            fragment_entry: default_fragment_entry(),
        }
    }
}

impl Default for RenderCfg {
    fn default() -> Self {
        Self {
            validation: default_validation(),
            present_mode: PresentModeCfg::default(),
            clear_color: default_clear(),
            force_render_pass: false,
        }
    }
}

fn default_width() -> u32 {
    800
}
fn default_height() -> u32 {
    600
}
fn default_title() -> String {
    "orbit".into()
}
fn default_model() -> PathBuf {
    "models/viking_room.obj".into()
}
fn default_texture() -> PathBuf {
    "textures/viking_room.png".into()
}
fn default_shader() -> PathBuf {
    "shaders/slang.spv".into()
}
fn default_vertex_entry() -> String {
    "vertMain".into()
}
fn default_fragment_entry() -> String {
    "fragMain".into()
}
fn default_validation() -> bool {
    cfg!(debug_assertions)
}
fn default_clear() -> [f32; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

/// A missing file yields defaults; a file that exists but does not parse is an error.
pub fn load_cfg(path: &Path) -> Result<AppCfg> {
    match fs::read_to_string(path) {
        Ok(s) => toml::from_str::<AppCfg>(&s).with_context(|| format!("parse {}", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(AppCfg::default()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}
