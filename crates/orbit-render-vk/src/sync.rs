// SPDX-License-Identifier: CEPL-1.0
//! Fences and semaphores for frames in flight.

use anyhow::Result;
use ash::prelude::VkResult;
use ash::vk;
use orbit_render::RenderError;
use tracing::trace;

/// One bounded wait; callers loop on `TIMEOUT`.
pub const FENCE_WAIT_SLICE_NS: u64 = 100_000_000;

/// Re-issues `wait` until it stops timing out. Returns the number of timeouts seen.
pub fn wait_retrying(mut wait: impl FnMut() -> VkResult<()>) -> VkResult<u32> {
    let mut timeouts = 0;
    loop {
        match wait() {
            Ok(()) => return Ok(timeouts),
            Err(vk::Result::TIMEOUT) => {
                timeouts += 1;
                trace!(timeouts, "fence wait timed out, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Per-slot fences and acquire semaphores, plus one render-finished semaphore
/// per swapchain image.
///
/// Present waits on the image's semaphore rather than the slot's: the
/// presentation engine may still hold a slot's previous image when the slot
/// comes round again.
pub struct FrameSync {
    device: ash::Device,
    in_flight: Vec<vk::Fence>,
    image_available: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
}

impl FrameSync {
    pub fn new(device: &ash::Device, frames: usize, images: usize) -> Result<Self> {
        let mut sync = Self {
            device: device.clone(),
            in_flight: Vec::with_capacity(frames),
            image_available: Vec::with_capacity(frames),
            render_finished: Vec::with_capacity(images),
        };

        let fence_info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        for _ in 0..frames {
            let sem = sync.semaphore()?;
            sync.image_available.push(sem);
            let fence = unsafe { device.create_fence(&fence_info, None) }
                .map_err(|e| RenderError::driver("vkCreateFence", e))?;
            sync.in_flight.push(fence);
        }
        sync.resize_images(images)?;
        Ok(sync)
    }

    fn semaphore(&self) -> Result<vk::Semaphore, RenderError> {
        let info = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        unsafe { self.device.create_semaphore(&info, None) }
            .map_err(|e| RenderError::driver("vkCreateSemaphore", e))
    }

    /// Blocks until the GPU has finished the slot's last submission.
    pub fn wait_for_fence(&self, slot: usize) -> Result<(), RenderError> {
        let fences = [self.in_flight[slot]];
        wait_retrying(|| unsafe {
            self.device
                .wait_for_fences(&fences, true, FENCE_WAIT_SLICE_NS)
        })
        .map(|_| ())
        .map_err(|e| RenderError::driver("vkWaitForFences", e))
    }

    pub fn reset_fence(&self, slot: usize) -> Result<(), RenderError> {
        unsafe { self.device.reset_fences(&[self.in_flight[slot]]) }
            .map_err(|e| RenderError::driver("vkResetFences", e))
    }

    /// Matches the render-finished semaphores to a new swapchain image count.
    /// The device must be idle.
    pub fn resize_images(&mut self, images: usize) -> Result<(), RenderError> {
        while self.render_finished.len() > images {
            if let Some(sem) = self.render_finished.pop() {
                unsafe { self.device.destroy_semaphore(sem, None) };
            }
        }
        while self.render_finished.len() < images {
            let sem = self.semaphore()?;
            self.render_finished.push(sem);
        }
        Ok(())
    }

    pub fn in_flight(&self, slot: usize) -> vk::Fence {
        self.in_flight[slot]
    }

    pub fn image_available(&self, slot: usize) -> vk::Semaphore {
        self.image_available[slot]
    }

    pub fn render_finished(&self, image: u32) -> vk::Semaphore {
        self.render_finished[image as usize]
    }

    pub fn frames(&self) -> usize {
        self.in_flight.len()
    }

    pub fn images(&self) -> usize {
        self.render_finished.len()
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            for &sem in self.render_finished.iter().chain(&self.image_available) {
                self.device.destroy_semaphore(sem, None);
            }
            for &fence in &self.in_flight {
                self.device.destroy_fence(fence, None);
            }
        }
    }
}
