// SPDX-License-Identifier: CEPL-1.0
//! Window-system glue.

pub use winit;

use orbit_render::{RenderSize, SurfaceProbe};
use std::time::Duration;
use winit::window::Window;

const MINIMIZED_POLL: Duration = Duration::from_millis(16);

pub fn render_size(size: winit::dpi::PhysicalSize<u32>) -> RenderSize {
    RenderSize::new(size.width, size.height)
}

/// Reads the live framebuffer size of a window while the swapchain is rebuilt.
///
/// Inside a winit callback the event loop cannot be pumped re-entrantly, so
/// `wait_events` parks the thread for one poll interval instead.
pub struct WindowProbe<'w> {
    window: &'w Window,
}

impl<'w> WindowProbe<'w> {
    pub fn new(window: &'w Window) -> Self {
        Self { window }
    }
}

impl SurfaceProbe for WindowProbe<'_> {
    fn framebuffer_size(&self) -> RenderSize {
        render_size(self.window.inner_size())
    }

    fn wait_events(&mut self) {
        tracing::trace!("framebuffer is zero-sized, waiting");
        std::thread::sleep(MINIMIZED_POLL);
    }
}
