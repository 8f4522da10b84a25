// SPDX-License-Identifier: CEPL-1.0
use crate::buffer::GpuBuffer;
use crate::context::GraphicsContext;
use crate::swapchain::create_view;
use anyhow::Result;
use ash::vk;
use orbit_render::RenderError;
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Access and stage masks for the upload transitions; anything else is refused.
pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<TransitionMasks, RenderError> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => {
            Ok(TransitionMasks {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
            })
        }
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Ok(TransitionMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            })
        }
        _ => Err(RenderError::UnsupportedTransition {
            from: format!("{old:?}"),
            to: format!("{new:?}"),
        }),
    }
}

/// `old` must be the layout the image is tracked in.
pub fn check_transition(
    current: vk::ImageLayout,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<TransitionMasks, RenderError> {
    if current != old {
        return Err(RenderError::LayoutMismatch {
            expected: format!("{old:?}"),
            actual: format!("{current:?}"),
        });
    }
    transition_masks(old, new)
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT
    )
}

/// Aspect bits a depth view or barrier must name for `format`.
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if has_stencil(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub what: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    /// Properties the backing memory type must have.
    pub memory: vk::MemoryPropertyFlags,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageDesc {
    pub fn create_info(&self) -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: self.format,
            extent: vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: self.tiling,
            usage: self.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        }
    }
}

/// 2D image with one mip level, its view, and the layout it was
/// last transitioned to.
pub struct GpuImage {
    device: ash::Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    format: vk::Format,
    extent: vk::Extent2D,
    aspect: vk::ImageAspectFlags,
    layout: vk::ImageLayout,
}

impl GpuImage {
    pub fn create(ctx: &GraphicsContext, desc: &ImageDesc) -> Result<Self> {
        let device = ctx.device();
        let info = desc.create_info();
        let image = unsafe { device.create_image(&info, None) }
            .map_err(|e| RenderError::driver("vkCreateImage", e))?;

        let req = unsafe { device.get_image_memory_requirements(image) };
        let memory = ctx
            .find_memory_type(req.memory_type_bits, desc.memory)
            .map_err(|_| RenderError::Allocation {
                what: desc.what,
                size: req.size,
            })
            .and_then(|memory_type_index| {
                let alloc = vk::MemoryAllocateInfo {
                    s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
                    allocation_size: req.size,
                    memory_type_index,
                    ..Default::default()
                };
                unsafe { device.allocate_memory(&alloc, None) }
                    .map_err(|e| RenderError::driver("vkAllocateMemory", e))
            });
        let memory = match memory {
            Ok(m) => m,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e.into());
            }
        };

        let view = unsafe { device.bind_image_memory(image, memory, 0) }
            .map_err(|e| RenderError::driver("vkBindImageMemory", e))
            .and_then(|()| create_view(device, image, desc.format, desc.aspect));
        let view = match view {
            Ok(v) => v,
            Err(e) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(e.into());
            }
        };

        trace!(what = desc.what, width = desc.width, height = desc.height, format = ?desc.format, "image created");
        Ok(Self {
            device: device.clone(),
            image,
            memory,
            view,
            format: desc.format,
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            aspect: desc.aspect,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    /// Records a layout barrier. Nothing is recorded when the transition is
    /// refused.
    pub fn transition_layout(
        &mut self,
        cb: vk::CommandBuffer,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<(), RenderError> {
        let masks = check_transition(self.layout, old, new)?;
        let barrier = vk::ImageMemoryBarrier {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
            src_access_mask: masks.src_access,
            dst_access_mask: masks.dst_access,
            old_layout: old,
            new_layout: new,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: self.image,
            subresource_range: self.full_range(),
            ..Default::default()
        };
        unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        self.layout = new;
        Ok(())
    }

    /// The image must already be in `TRANSFER_DST_OPTIMAL`.
    pub fn copy_from_buffer(&self, cb: vk::CommandBuffer, src: &GpuBuffer) -> Result<(), RenderError> {
        if self.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            return Err(RenderError::LayoutMismatch {
                expected: format!("{:?}", vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                actual: format!("{:?}", self.layout),
            });
        }
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: self.aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cb,
                src.handle(),
                self.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        Ok(())
    }

    /// For barriers recorded elsewhere (render attachments, render-pass
    /// final layouts).
    pub fn assume_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

pub fn sampler_info(
    mag: vk::Filter,
    min: vk::Filter,
    address: vk::SamplerAddressMode,
    anisotropy: Option<f32>,
) -> vk::SamplerCreateInfo<'static> {
    vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: mag,
        min_filter: min,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_mode_u: address,
        address_mode_v: address,
        address_mode_w: address,
        mip_lod_bias: 0.0,
        anisotropy_enable: vk::Bool32::from(anisotropy.is_some()),
        max_anisotropy: anisotropy.unwrap_or(1.0),
        compare_enable: vk::FALSE,
        compare_op: vk::CompareOp::ALWAYS,
        min_lod: 0.0,
        max_lod: 0.0,
        border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        unnormalized_coordinates: vk::FALSE,
        ..Default::default()
    }
}

pub struct Sampler {
    device: ash::Device,
    sampler: vk::Sampler,
}

impl Sampler {
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.device.destroy_sampler(self.sampler, None) };
    }
}

/// Anisotropy follows the device limit when the feature was enabled.
pub fn create_sampler(
    ctx: &GraphicsContext,
    mag: vk::Filter,
    min: vk::Filter,
    address: vk::SamplerAddressMode,
) -> Result<Sampler, RenderError> {
    let info = sampler_info(mag, min, address, ctx.max_sampler_anisotropy());
    let sampler = unsafe { ctx.device().create_sampler(&info, None) }
        .map_err(|e| RenderError::driver("vkCreateSampler", e))?;
    Ok(Sampler {
        device: ctx.device().clone(),
        sampler,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::ImageLayout as L;

    #[test]
    fn create_info_follows_desc() {
        let desc = ImageDesc {
            what: "readback",
            width: 64,
            height: 32,
            format: vk::Format::R8G8B8A8_UNORM,
            tiling: vk::ImageTiling::LINEAR,
            usage: vk::ImageUsageFlags::TRANSFER_DST,
            memory: vk::MemoryPropertyFlags::HOST_VISIBLE,
            aspect: vk::ImageAspectFlags::COLOR,
        };
        let info = desc.create_info();
        assert_eq!(info.tiling, vk::ImageTiling::LINEAR);
        assert_eq!(info.usage, vk::ImageUsageFlags::TRANSFER_DST);
        assert_eq!(info.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!((info.extent.width, info.extent.height, info.extent.depth), (64, 32, 1));
        assert_eq!((info.mip_levels, info.array_layers), (1, 1));
        assert_eq!(info.initial_layout, vk::ImageLayout::UNDEFINED);

        let optimal = ImageDesc {
            tiling: vk::ImageTiling::OPTIMAL,
            ..desc
        };
        assert_eq!(optimal.create_info().tiling, vk::ImageTiling::OPTIMAL);
    }

    #[test]
    fn upload_transitions_are_supported() {
        let a = transition_masks(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(a.src_access, vk::AccessFlags::empty());
        assert_eq!(a.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(a.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(a.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let b = transition_masks(L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(b.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(b.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(b.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn other_transitions_are_refused() {
        for (old, new) in [
            (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL),
            (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
            (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL),
            (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
        ] {
            assert!(matches!(
                transition_masks(old, new),
                Err(RenderError::UnsupportedTransition { .. })
            ));
        }
    }

    #[test]
    fn tracked_layout_must_match_old() {
        assert!(check_transition(L::UNDEFINED, L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).is_ok());
        let err = check_transition(
            L::SHADER_READ_ONLY_OPTIMAL,
            L::TRANSFER_DST_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::LayoutMismatch { .. }));
    }

    #[test]
    fn stencil_formats_carry_both_aspects() {
        assert!(!has_stencil(vk::Format::D32_SFLOAT));
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            depth_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn sampler_anisotropy_is_optional() {
        let with = sampler_info(
            vk::Filter::LINEAR,
            vk::Filter::LINEAR,
            vk::SamplerAddressMode::REPEAT,
            Some(16.0),
        );
        assert_eq!(with.anisotropy_enable, vk::TRUE);
        assert_eq!(with.max_anisotropy, 16.0);
        assert_eq!(with.address_mode_w, vk::SamplerAddressMode::REPEAT);
        assert_eq!((with.min_lod, with.max_lod), (0.0, 0.0));

        let without = sampler_info(
            vk::Filter::NEAREST,
            vk::Filter::LINEAR,
            vk::SamplerAddressMode::CLAMP_TO_EDGE,
            None,
        );
        assert_eq!(without.anisotropy_enable, vk::FALSE);
        assert_eq!(without.max_anisotropy, 1.0);
        assert_eq!(without.mag_filter, vk::Filter::NEAREST);
    }
}
