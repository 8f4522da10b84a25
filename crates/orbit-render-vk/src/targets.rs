// SPDX-License-Identifier: CEPL-1.0
//! Depth buffer and the attachment setup for whichever render path is active.

use crate::context::{GraphicsContext, RenderPath};
use crate::image::{depth_aspect, GpuImage, ImageDesc};
use crate::pipeline::AttachmentTarget;
use crate::swapchain::SurfaceChain;
use anyhow::Result;
use ash::vk;
use orbit_render::RenderError;
use tracing::debug;

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Swapchain image UNDEFINED -> COLOR_ATTACHMENT, ordered after the acquire
/// semaphore wait at color-attachment output.
pub fn color_to_attachment(image: vk::Image) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        old_layout: vk::ImageLayout::UNDEFINED,
        new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: COLOR_RANGE,
        ..Default::default()
    }
}

pub fn color_to_present(image: vk::Image) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        dst_access_mask: vk::AccessFlags::empty(),
        old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: COLOR_RANGE,
        ..Default::default()
    }
}

/// Depth contents are discarded each frame, so the old layout is UNDEFINED.
/// The source access covers the previous frame's depth writes.
pub fn depth_to_attachment(image: vk::Image, format: vk::Format) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dst_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        old_layout: vk::ImageLayout::UNDEFINED,
        new_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: depth_aspect(format),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    }
}

pub fn clear_values(color: [f32; 4]) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

/// Everything sized to the swapchain besides the chain itself.
pub struct RenderTargets {
    device: ash::Device,
    path: RenderPath,
    depth: GpuImage,
    color_format: vk::Format,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
}

impl RenderTargets {
    pub fn new(ctx: &GraphicsContext, chain: &SurfaceChain) -> Result<Self> {
        let depth = create_depth(ctx, chain)?;
        let mut targets = Self {
            device: ctx.device().clone(),
            path: ctx.render_path(),
            depth,
            color_format: chain.format(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
        };
        if !targets.path.is_dynamic() {
            targets.render_pass = unsafe {
                create_render_pass(&targets.device, chain.format(), targets.depth.format())
            }?;
            targets.create_framebuffers(chain)?;
        }
        Ok(targets)
    }

    /// Rebuilds the depth image and, on the render-pass path, the framebuffers.
    /// Returns `true` when the color format changed, in which case the render
    /// pass was rebuilt as well and the pipeline must follow. The device must be
    /// idle.
    pub fn rebuild(&mut self, ctx: &GraphicsContext, chain: &SurfaceChain) -> Result<bool> {
        // STRICT ORDER:
        // 1) framebuffers (they reference the old depth view and the old render pass)
        // 2) depth image
        // 3) render pass, only if the color format changed
        // 4) framebuffers against the new chain views
        self.destroy_framebuffers();
        self.depth = create_depth(ctx, chain)?;

        let format_changed = chain.format() != self.color_format;
        self.color_format = chain.format();
        if !self.path.is_dynamic() {
            if format_changed {
                unsafe { self.device.destroy_render_pass(self.render_pass, None) };
                self.render_pass = vk::RenderPass::null();
                self.render_pass = unsafe {
                    create_render_pass(&self.device, self.color_format, self.depth.format())
                }?;
            }
            self.create_framebuffers(chain)?;
        }
        debug!(
            format_changed,
            framebuffers = self.framebuffers.len(),
            "render targets rebuilt"
        );
        Ok(format_changed)
    }

    pub fn attachment_target(&self) -> AttachmentTarget {
        if self.path.is_dynamic() {
            AttachmentTarget::Dynamic {
                color: self.color_format,
                depth: self.depth.format(),
            }
        } else {
            AttachmentTarget::RenderPass(self.render_pass)
        }
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth.format()
    }

    /// Opens the attachment scope for `image` with both attachments cleared.
    pub fn begin(
        &mut self,
        ctx: &GraphicsContext,
        cb: vk::CommandBuffer,
        chain: &SurfaceChain,
        image: u32,
        clear: [f32; 4],
    ) -> Result<(), RenderError> {
        let index = image as usize;
        let (Some(&color_image), Some(&color_view)) =
            (chain.images().get(index), chain.views().get(index))
        else {
            return Err(RenderError::driver("begin rendering", format!("image {image} out of range")));
        };
        let extent = chain.extent();
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let clears = clear_values(clear);

        if self.path.is_dynamic() {
            let color_barrier = color_to_attachment(color_image);
            let depth_barrier = depth_to_attachment(self.depth.handle(), self.depth.format());
            unsafe {
                self.device.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[color_barrier],
                );
                self.device.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[depth_barrier],
                );
            }

            let color_att = vk::RenderingAttachmentInfo {
                s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
                image_view: color_view,
                image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                clear_value: clears[0],
                ..Default::default()
            };
            let depth_att = vk::RenderingAttachmentInfo {
                s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
                image_view: self.depth.view(),
                image_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::DONT_CARE,
                clear_value: clears[1],
                ..Default::default()
            };
            let rendering_info = vk::RenderingInfo {
                s_type: vk::StructureType::RENDERING_INFO,
                render_area,
                layer_count: 1,
                color_attachment_count: 1,
                p_color_attachments: &color_att,
                p_depth_attachment: &depth_att,
                ..Default::default()
            };
            unsafe { ctx.cmd_begin_rendering(cb, &rendering_info) };
        } else {
            let Some(&framebuffer) = self.framebuffers.get(index) else {
                return Err(RenderError::driver("begin render pass", format!("no framebuffer for image {image}")));
            };
            let rp_begin = vk::RenderPassBeginInfo {
                s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
                render_pass: self.render_pass,
                framebuffer,
                render_area,
                clear_value_count: clears.len() as u32,
                p_clear_values: clears.as_ptr(),
                ..Default::default()
            };
            unsafe {
                self.device
                    .cmd_begin_render_pass(cb, &rp_begin, vk::SubpassContents::INLINE)
            };
        }
        self.depth
            .assume_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        Ok(())
    }

    /// Closes the scope and leaves `image` in `PRESENT_SRC_KHR`.
    pub fn end(&self, ctx: &GraphicsContext, cb: vk::CommandBuffer, chain: &SurfaceChain, image: u32) {
        if self.path.is_dynamic() {
            unsafe { ctx.cmd_end_rendering(cb) };
            if let Some(&color_image) = chain.images().get(image as usize) {
                unsafe {
                    self.device.cmd_pipeline_barrier(
                        cb,
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[color_to_present(color_image)],
                    );
                }
            }
        } else {
            // final_layout of the color attachment is PRESENT_SRC_KHR
            unsafe { self.device.cmd_end_render_pass(cb) };
        }
    }

    fn create_framebuffers(&mut self, chain: &SurfaceChain) -> Result<(), RenderError> {
        let extent = chain.extent();
        for &view in chain.views() {
            let attachments = [view, self.depth.view()];
            let fb_info = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass: self.render_pass,
                attachment_count: attachments.len() as u32,
                p_attachments: attachments.as_ptr(),
                width: extent.width,
                height: extent.height,
                layers: 1,
                ..Default::default()
            };
            let fb = unsafe { self.device.create_framebuffer(&fb_info, None) }
                .map_err(|e| RenderError::driver("vkCreateFramebuffer", e))?;
            self.framebuffers.push(fb);
        }
        Ok(())
    }

    fn destroy_framebuffers(&mut self) {
        for fb in self.framebuffers.drain(..) {
            unsafe { self.device.destroy_framebuffer(fb, None) };
        }
    }
}

impl Drop for RenderTargets {
    fn drop(&mut self) {
        self.destroy_framebuffers();
        if self.render_pass != vk::RenderPass::null() {
            unsafe { self.device.destroy_render_pass(self.render_pass, None) };
        }
        // depth image drops with the struct
    }
}

fn create_depth(ctx: &GraphicsContext, chain: &SurfaceChain) -> Result<GpuImage> {
    let format = ctx.find_depth_format()?;
    let extent = chain.extent();
    GpuImage::create(
        ctx,
        &ImageDesc {
            what: "depth",
            width: extent.width,
            height: extent.height,
            format,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            aspect: depth_aspect(format),
        },
    )
}

unsafe fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::RenderPass, RenderError> {
    // Render pass: color -> present, depth discarded after the pass
    let attachments = [
        vk::AttachmentDescription {
            format: color_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        },
        vk::AttachmentDescription {
            format: depth_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        },
    ];
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        p_depth_stencil_attachment: &depth_ref,
        ..Default::default()
    };
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dependency_flags: vk::DependencyFlags::empty(),
    };

    let rp_info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: attachments.len() as u32,
        p_attachments: attachments.as_ptr(),
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    unsafe { device.create_render_pass(&rp_info, None) }
        .map_err(|e| RenderError::driver("vkCreateRenderPass", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_barriers_bracket_the_frame() {
        let img = vk::Image::null();
        let pre = color_to_attachment(img);
        assert_eq!(pre.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(pre.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(pre.dst_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

        let post = color_to_present(img);
        assert_eq!(post.old_layout, pre.new_layout);
        assert_eq!(post.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(post.src_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
    }

    #[test]
    fn depth_barrier_names_stencil_when_present() {
        let plain = depth_to_attachment(vk::Image::null(), vk::Format::D32_SFLOAT);
        assert_eq!(plain.subresource_range.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            plain.new_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );

        let packed = depth_to_attachment(vk::Image::null(), vk::Format::D32_SFLOAT_S8_UINT);
        assert!(packed
            .subresource_range
            .aspect_mask
            .contains(vk::ImageAspectFlags::STENCIL));
    }

    #[test]
    fn clears_color_then_far_depth() {
        let [color, depth] = clear_values([0.1, 0.2, 0.3, 1.0]);
        unsafe {
            assert_eq!(color.color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(depth.depth_stencil.depth, 1.0);
            assert_eq!(depth.depth_stencil.stencil, 0);
        }
    }
}
