// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend built on `ash`.

pub mod buffer;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod image;
pub mod mesh;
pub mod pipeline;
pub mod renderer;
pub mod swapchain;
pub mod sync;
pub mod targets;
pub mod texture;

pub use buffer::GpuBuffer;
pub use command::CommandRecorder;
pub use context::{ContextDesc, DeviceFeatures, GraphicsContext, RenderPath};
pub use image::{GpuImage, ImageDesc, Sampler};
pub use mesh::Mesh;
pub use pipeline::{AttachmentTarget, PipelineState, ShaderStages};
pub use renderer::{RendererDesc, VkRenderer};
pub use swapchain::{ChainImages, ChainState, PresentPreference, SurfaceChain};
pub use sync::FrameSync;
pub use targets::RenderTargets;
pub use texture::Texture;
