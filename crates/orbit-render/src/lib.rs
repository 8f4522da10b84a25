// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic half of the renderer: the frame protocol, the error
//! taxonomy and CPU-side asset data.

pub mod error;
pub mod frame;
pub mod mesh;
pub mod status;
pub mod texture;

pub use error::RenderError;
pub use frame::{
    wait_for_nonzero_extent, Acquired, FrameBackend, FrameLoop, FrameOutcome, SlotLedger,
    SlotState, SurfaceProbe,
};
pub use mesh::MeshData;
pub use status::ChainStatus;
pub use texture::TextureData;

/// Number of frame slots recorded ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports a zero-sized framebuffer.
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}
