// SPDX-License-Identifier: CEPL-1.0
//! Presentable images for the window surface.

use crate::context::GraphicsContext;
use anyhow::{bail, Context, Result};
use ash::khr::swapchain;
use ash::prelude::VkResult;
use ash::vk;
use orbit_render::{ChainStatus, RenderError, RenderSize};
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainState {
    Uninitialized,
    Ready,
    /// The surface changed under us; the next acquire must not be attempted.
    Stale,
    /// Terminal: set by [`SurfaceChain::destroy`].
    Destroyed,
}

impl ChainState {
    pub fn can_rebuild(self) -> bool {
        self != Self::Destroyed
    }
}

/// The chain's images and one view per image, replaced as a unit.
#[derive(Debug, Default)]
pub struct ChainImages {
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
}

impl ChainImages {
    /// Drops the current views, then views every image in `images`. If a view
    /// fails, the views made so far are destroyed and the set is left empty.
    pub fn rebuild(
        &mut self,
        images: Vec<vk::Image>,
        mut create: impl FnMut(vk::Image) -> Result<vk::ImageView, RenderError>,
        mut destroy: impl FnMut(vk::ImageView),
    ) -> Result<(), RenderError> {
        self.clear(&mut destroy);
        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            match create(image) {
                Ok(view) => views.push(view),
                Err(e) => {
                    views.into_iter().for_each(&mut destroy);
                    return Err(e);
                }
            }
        }
        self.images = images;
        self.views = views;
        Ok(())
    }

    pub fn clear(&mut self, destroy: impl FnMut(vk::ImageView)) {
        self.views.drain(..).for_each(destroy);
        self.images.clear();
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PresentPreference {
    /// Low latency without tearing when the platform has it.
    #[default]
    Mailbox,
    /// Strict vsync.
    Fifo,
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// FIFO is always available, so it is the fallback either way.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preference: PresentPreference,
) -> vk::PresentModeKHR {
    match preference {
        PresentPreference::Mailbox if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        _ => vk::PresentModeKHR::FIFO,
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, size: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: size
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: size
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// Triple buffering when allowed; `max_image_count == 0` means unbounded.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count.max(3);
    if caps.max_image_count != 0 {
        want.min(caps.max_image_count)
    } else {
        want
    }
}

fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&a| supported.contains(a))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

pub fn classify_acquire(res: VkResult<(u32, bool)>) -> Result<(u32, ChainStatus), RenderError> {
    match res {
        Ok((index, suboptimal)) => Ok((index, ChainStatus::from_suboptimal(suboptimal))),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok((0, ChainStatus::Stale)),
        Err(e) => Err(RenderError::driver("vkAcquireNextImageKHR", e)),
    }
}

pub fn classify_present(res: VkResult<bool>) -> Result<ChainStatus, RenderError> {
    match res {
        Ok(suboptimal) => Ok(ChainStatus::from_suboptimal(suboptimal)),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(ChainStatus::Stale),
        Err(e) => Err(RenderError::driver("vkQueuePresentKHR", e)),
    }
}

pub struct SurfaceChain {
    device: ash::Device,
    loader: swapchain::Device,
    chain: vk::SwapchainKHR,
    images: ChainImages,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    preference: PresentPreference,
    state: ChainState,
}

impl SurfaceChain {
    pub fn new(ctx: &GraphicsContext, preference: PresentPreference) -> Self {
        Self {
            device: ctx.device().clone(),
            loader: swapchain::Device::new(ctx.instance(), ctx.device()),
            chain: vk::SwapchainKHR::null(),
            images: ChainImages::default(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            preference,
            state: ChainState::Uninitialized,
        }
    }

    pub fn create(&mut self, ctx: &GraphicsContext, size: RenderSize) -> Result<()> {
        if !self.state.can_rebuild() {
            bail!("swapchain used after destroy");
        }
        let phys = ctx.physical_device();
        let surface = ctx.surface();
        let loader = ctx.surface_loader();

        let caps = unsafe { loader.get_physical_device_surface_capabilities(phys, surface) }
            .map_err(|e| RenderError::driver("vkGetPhysicalDeviceSurfaceCapabilitiesKHR", e))?;
        let formats = unsafe { loader.get_physical_device_surface_formats(phys, surface) }
            .map_err(|e| RenderError::driver("vkGetPhysicalDeviceSurfaceFormatsKHR", e))?;
        let modes = unsafe { loader.get_physical_device_surface_present_modes(phys, surface) }
            .map_err(|e| RenderError::driver("vkGetPhysicalDeviceSurfacePresentModesKHR", e))?;

        let format = choose_surface_format(&formats).ok_or(RenderError::NoSupportedFormat {
            what: "surface color",
        })?;
        let present_mode = choose_present_mode(&modes, self.preference);
        let extent = choose_extent(&caps, size);
        let image_count = choose_image_count(&caps);

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface,
            min_image_count: image_count,
            image_format: format.format,
            image_color_space: format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform,
            composite_alpha: choose_composite_alpha(caps.supported_composite_alpha),
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };

        let chain = unsafe { self.loader.create_swapchain(&info, None) }
            .map_err(|e| RenderError::driver("vkCreateSwapchainKHR", e))?;
        let device = &self.device;
        let built = unsafe { self.loader.get_swapchain_images(chain) }
            .map_err(|e| RenderError::driver("vkGetSwapchainImagesKHR", e))
            .and_then(|images| {
                self.images.rebuild(
                    images,
                    |image| create_color_view(device, image, format.format),
                    |view| unsafe { device.destroy_image_view(view, None) },
                )
            });
        if let Err(e) = built {
            unsafe { self.loader.destroy_swapchain(chain, None) };
            return Err(anyhow::Error::from(e).context("swapchain images"));
        }
        self.chain = chain;
        self.format = format;
        self.extent = extent;
        self.present_mode = present_mode;
        self.state = ChainState::Ready;

        info!(
            format = ?format.format,
            color_space = ?format.color_space,
            ?present_mode,
            width = extent.width,
            height = extent.height,
            images = self.images.len(),
            "vk: swapchain ready"
        );
        Ok(())
    }

    pub fn recreate(&mut self, ctx: &GraphicsContext, size: RenderSize) -> Result<()> {
        // STRICT ORDER:
        // 1) GPU idle: nothing may still read the old images
        // 2) views, then the chain
        // 3) rebuild against the current surface capabilities
        ctx.wait_idle()?;
        self.destroy_chain();
        self.create(ctx, size).context("recreate swapchain")?;
        debug!(state = ?self.state, "swapchain recreated");
        Ok(())
    }

    /// `timeout` in nanoseconds; `signal` is signaled once the image is free.
    pub fn acquire_next_image(
        &mut self,
        timeout: u64,
        signal: vk::Semaphore,
    ) -> Result<(u32, ChainStatus), RenderError> {
        if self.state != ChainState::Ready {
            return Ok((0, ChainStatus::Stale));
        }
        let res = unsafe {
            self.loader
                .acquire_next_image(self.chain, timeout, signal, vk::Fence::null())
        };
        let out = classify_acquire(res)?;
        if out.1 == ChainStatus::Stale {
            self.state = ChainState::Stale;
        }
        Ok(out)
    }

    pub fn present(
        &mut self,
        queue: vk::Queue,
        wait: vk::Semaphore,
        index: u32,
    ) -> Result<ChainStatus, RenderError> {
        let wait_semaphores = [wait];
        let chains = [self.chain];
        let indices = [index];
        let info = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: wait_semaphores.as_ptr(),
            swapchain_count: 1,
            p_swapchains: chains.as_ptr(),
            p_image_indices: indices.as_ptr(),
            ..Default::default()
        };
        let status = classify_present(unsafe { self.loader.queue_present(queue, &info) })?;
        if status == ChainStatus::Stale {
            self.state = ChainState::Stale;
        }
        Ok(status)
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn images(&self) -> &[vk::Image] {
        self.images.images()
    }

    pub fn views(&self) -> &[vk::ImageView] {
        self.images.views()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn render_size(&self) -> RenderSize {
        RenderSize::new(self.extent.width, self.extent.height)
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Releases views and chain for good; later `create`/`recreate` fail.
    /// The caller must make sure the GPU no longer uses the images.
    pub fn destroy(&mut self) {
        self.destroy_chain();
        self.state = ChainState::Destroyed;
    }

    fn destroy_chain(&mut self) {
        let device = &self.device;
        self.images
            .clear(|view| unsafe { device.destroy_image_view(view, None) });
        if self.chain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.chain, None) };
        }
        self.chain = vk::SwapchainKHR::null();
        if self.state.can_rebuild() {
            self.state = ChainState::Uninitialized;
        }
    }
}

impl Drop for SurfaceChain {
    fn drop(&mut self) {
        self.destroy();
    }
}

pub(crate) fn create_color_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView, RenderError> {
    create_view(device, image, format, vk::ImageAspectFlags::COLOR)
}

pub(crate) fn create_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> Result<vk::ImageView, RenderError> {
    let info = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        components: vk::ComponentMapping::default(),
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    unsafe { device.create_image_view(&info, None) }
        .map_err(|e| RenderError::driver("vkCreateImageView", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn caps(current: (u32, u32), min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn srgb_bgra_is_preferred() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[unorm, srgb]), Some(srgb));
        assert_eq!(choose_surface_format(&[unorm]), Some(unorm));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let both = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&both, PresentPreference::Mailbox),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&both, PresentPreference::Fifo),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], PresentPreference::Mailbox),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_uses_current_unless_undefined() {
        let fixed = caps((1024, 768), 2, 8);
        assert_eq!(
            choose_extent(&fixed, RenderSize::new(10, 10)),
            vk::Extent2D {
                width: 1024,
                height: 768
            }
        );

        let open = caps((u32::MAX, u32::MAX), 2, 8);
        assert_eq!(
            choose_extent(&open, RenderSize::new(800, 600)),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
        assert_eq!(
            choose_extent(&open, RenderSize::new(10, 9000)),
            vk::Extent2D {
                width: 64,
                height: 2048
            }
        );
    }

    #[test]
    fn image_count_is_triple_within_bounds() {
        assert_eq!(choose_image_count(&caps((1, 1), 2, 8)), 3);
        assert_eq!(choose_image_count(&caps((1, 1), 2, 2)), 2);
        assert_eq!(choose_image_count(&caps((1, 1), 4, 0)), 4);
        assert_eq!(choose_image_count(&caps((1, 1), 1, 0)), 3);
    }

    #[test]
    fn out_of_date_is_stale_not_error() {
        assert_eq!(classify_acquire(Ok((2, false))).unwrap(), (2, ChainStatus::Optimal));
        assert_eq!(
            classify_acquire(Ok((1, true))).unwrap(),
            (1, ChainStatus::Suboptimal)
        );
        assert_eq!(
            classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR))
                .unwrap()
                .1,
            ChainStatus::Stale
        );
        assert!(matches!(
            classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(RenderError::Driver { .. })
        ));

        assert_eq!(classify_present(Ok(true)).unwrap(), ChainStatus::Suboptimal);
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            ChainStatus::Stale
        );
        assert!(classify_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR)).is_err());
    }

    fn fake_images(n: u64, base: u64) -> Vec<vk::Image> {
        (0..n).map(|i| vk::Image::from_raw(base + i)).collect()
    }

    #[test]
    fn views_track_images_across_rebuilds() {
        let mut set = ChainImages::default();
        let mut next_view = 100;
        let mut live: Vec<vk::ImageView> = Vec::new();

        for (count, base) in [(3, 0), (2, 10), (4, 20), (3, 30)] {
            let created = std::cell::RefCell::new(Vec::new());
            set.rebuild(
                fake_images(count, base),
                |_| {
                    next_view += 1;
                    let v = vk::ImageView::from_raw(next_view);
                    created.borrow_mut().push(v);
                    Ok(v)
                },
                |v| live.retain(|&l| l != v),
            )
            .unwrap();
            live.extend(created.into_inner());

            assert_eq!(set.len(), count as usize);
            assert_eq!(set.images().len(), set.views().len());
            assert_eq!(set.images()[0], vk::Image::from_raw(base));
            // old views went away with the old images
            assert_eq!(live.len(), set.views().len());
        }
    }

    #[test]
    fn failed_view_leaves_nothing_behind() {
        let mut set = ChainImages::default();
        let mut destroyed = Vec::new();
        set.rebuild(fake_images(2, 0), |i| Ok(vk::ImageView::from_raw(i.as_raw() + 50)), |_| {})
            .unwrap();

        let err = set
            .rebuild(
                fake_images(4, 10),
                |i| {
                    if i.as_raw() == 12 {
                        Err(RenderError::driver("vkCreateImageView", vk::Result::ERROR_OUT_OF_HOST_MEMORY))
                    } else {
                        Ok(vk::ImageView::from_raw(i.as_raw() + 50))
                    }
                },
                |v| destroyed.push(v.as_raw()),
            )
            .unwrap_err();
        assert!(matches!(err, RenderError::Driver { op: "vkCreateImageView", .. }));

        // the two old views, then the two made before the failure
        assert_eq!(destroyed, [50, 51, 60, 61]);
        assert!(set.is_empty());
        assert_eq!(set.images().len(), set.views().len());

        set.rebuild(fake_images(3, 20), |i| Ok(vk::ImageView::from_raw(i.as_raw() + 50)), |_| {})
            .unwrap();
        assert_eq!((set.images().len(), set.views().len()), (3, 3));
    }

    #[test]
    fn destroyed_chain_is_terminal() {
        assert!(ChainState::Uninitialized.can_rebuild());
        assert!(ChainState::Ready.can_rebuild());
        assert!(ChainState::Stale.can_rebuild());
        assert!(!ChainState::Destroyed.can_rebuild());
    }

    #[test]
    fn opaque_alpha_first() {
        let all = vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::INHERIT;
        assert_eq!(choose_composite_alpha(all), vk::CompositeAlphaFlagsKHR::OPAQUE);
        assert_eq!(
            choose_composite_alpha(vk::CompositeAlphaFlagsKHR::INHERIT),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
    }
}
