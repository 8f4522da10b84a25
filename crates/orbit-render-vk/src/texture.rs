// SPDX-License-Identifier: CEPL-1.0
use crate::buffer::staging_buffer;
use crate::command::CommandRecorder;
use crate::context::GraphicsContext;
use crate::image::{create_sampler, GpuImage, ImageDesc, Sampler};
use anyhow::{Context, Result};
use ash::vk;
use orbit_render::TextureData;
use tracing::debug;

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Sampled color texture: image in `SHADER_READ_ONLY_OPTIMAL` plus its sampler.
pub struct Texture {
    image: GpuImage,
    sampler: Sampler,
}

impl Texture {
    pub fn upload(ctx: &GraphicsContext, recorder: &CommandRecorder, data: &TextureData) -> Result<Self> {
        let staging = staging_buffer(ctx, data.pixels()).context("stage texture")?;
        let mut image = GpuImage::create(
            ctx,
            &ImageDesc {
                what: "texture",
                width: data.width(),
                height: data.height(),
                format: TEXTURE_FORMAT,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )?;

        // STRICT ORDER, one submission:
        // 1) UNDEFINED -> TRANSFER_DST
        // 2) buffer -> image copy
        // 3) TRANSFER_DST -> SHADER_READ_ONLY
        recorder
            .one_shot(|cb| {
                image.transition_layout(
                    cb,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )?;
                image.copy_from_buffer(cb, &staging)?;
                image.transition_layout(
                    cb,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )?;
                Ok(())
            })
            .context("upload texture")?;

        let sampler = create_sampler(
            ctx,
            vk::Filter::LINEAR,
            vk::Filter::LINEAR,
            vk::SamplerAddressMode::REPEAT,
        )?;
        debug!(
            width = data.width(),
            height = data.height(),
            anisotropy = ?ctx.max_sampler_anisotropy(),
            "texture uploaded"
        );
        Ok(Self { image, sampler })
    }

    pub fn view(&self) -> vk::ImageView {
        self.image.view()
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler.handle()
    }
}
