// SPDX-License-Identifier: CEPL-1.0
use crate::buffer::GpuBuffer;
use crate::context::GraphicsContext;
use anyhow::Result;
use ash::vk;
use orbit_math::SceneUniforms;
use orbit_render::RenderError;
use std::mem::size_of;

pub const UNIFORM_SIZE: vk::DeviceSize = size_of::<SceneUniforms>() as vk::DeviceSize;

/// One host-visible uniform buffer per frame slot, mapped for their whole life.
pub struct FrameUniforms {
    buffers: Vec<GpuBuffer>,
}

impl FrameUniforms {
    pub fn new(ctx: &GraphicsContext, frames: usize) -> Result<Self> {
        let mut buffers = Vec::with_capacity(frames);
        for _ in 0..frames {
            let mut ubo = GpuBuffer::create(
                ctx,
                "scene uniforms",
                UNIFORM_SIZE,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            ubo.map()?;
            buffers.push(ubo);
        }
        Ok(Self { buffers })
    }

    /// The slot's fence must have been waited on.
    pub fn write(&mut self, slot: usize, uniforms: &SceneUniforms) -> Result<(), RenderError> {
        self.buffers[slot].write_pod(uniforms)
    }

    pub fn buffer(&self, slot: usize) -> vk::Buffer {
        self.buffers[slot].handle()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

pub fn pool_sizes(frames: u32) -> [vk::DescriptorPoolSize; 2] {
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: frames,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: frames,
        },
    ]
}

/// One descriptor set per frame slot: the slot's uniform buffer and the
/// shared texture.
pub struct FrameDescriptors {
    device: ash::Device,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
}

impl FrameDescriptors {
    pub fn new(
        device: &ash::Device,
        set_layout: vk::DescriptorSetLayout,
        uniforms: &FrameUniforms,
        texture_view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> Result<Self> {
        let frames = uniforms.len();

        // 1) Pool
        let sizes = pool_sizes(frames as u32);
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: frames as u32,
            pool_size_count: sizes.len() as u32,
            p_pool_sizes: sizes.as_ptr(),
            ..Default::default()
        };
        let pool = unsafe { device.create_descriptor_pool(&pool_ci, None) }
            .map_err(|e| RenderError::driver("vkCreateDescriptorPool", e))?;

        // 2) Allocate sets
        let layouts = vec![set_layout; frames];
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: pool,
            descriptor_set_count: frames as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let sets = match unsafe { device.allocate_descriptor_sets(&alloc) } {
            Ok(s) => s,
            Err(e) => {
                unsafe { device.destroy_descriptor_pool(pool, None) };
                return Err(RenderError::driver("vkAllocateDescriptorSets", e).into());
            }
        };

        // 3) Write bindings; the info arrays must outlive update_descriptor_sets
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = (0..frames)
            .map(|slot| vk::DescriptorBufferInfo {
                buffer: uniforms.buffer(slot),
                offset: 0,
                range: UNIFORM_SIZE,
            })
            .collect();
        let image_info = vk::DescriptorImageInfo {
            sampler,
            image_view: texture_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let mut writes = Vec::with_capacity(frames * 2);
        for (slot, &set) in sets.iter().enumerate() {
            writes.push(vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: set,
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: &buffer_infos[slot],
                ..Default::default()
            });
            writes.push(vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: set,
                dst_binding: 1,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                p_image_info: &image_info,
                ..Default::default()
            });
        }
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        Ok(Self {
            device: device.clone(),
            pool,
            sets,
        })
    }

    pub fn bind(&self, cb: vk::CommandBuffer, layout: vk::PipelineLayout, slot: usize) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cb,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                std::slice::from_ref(&self.sets[slot]),
                &[],
            );
        }
    }
}

impl Drop for FrameDescriptors {
    fn drop(&mut self) {
        // sets are freed with the pool
        unsafe { self.device.destroy_descriptor_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_size_is_three_matrices() {
        assert_eq!(UNIFORM_SIZE, 3 * 64);
    }

    #[test]
    fn pool_holds_one_of_each_per_frame() {
        let [ubo, tex] = pool_sizes(2);
        assert_eq!(ubo.ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(tex.ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!((ubo.descriptor_count, tex.descriptor_count), (2, 2));
    }
}
