// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use ash::vk;
use orbit_render::RenderError;

/// Command pool plus one primary buffer per frame slot.
pub struct CommandRecorder {
    device: ash::Device,
    queue: vk::Queue,
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
}

impl CommandRecorder {
    pub fn new(device: &ash::Device, queue: vk::Queue, family: u32, frames: usize) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: family,
            ..Default::default()
        };
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| RenderError::driver("vkCreateCommandPool", e))?;

        let alloc = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: frames as u32,
            ..Default::default()
        };
        let buffers = match unsafe { device.allocate_command_buffers(&alloc) } {
            Ok(b) => b,
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(RenderError::driver("vkAllocateCommandBuffers", e).into());
            }
        };

        Ok(Self {
            device: device.clone(),
            queue,
            pool,
            buffers,
        })
    }

    pub fn buffer(&self, slot: usize) -> vk::CommandBuffer {
        self.buffers[slot]
    }

    /// Resets the slot's buffer and opens it for recording.
    /// The slot's fence must have been waited on.
    pub fn begin_frame(&self, slot: usize) -> Result<vk::CommandBuffer, RenderError> {
        let cb = self.buffers[slot];
        unsafe {
            self.device
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .map_err(|e| RenderError::driver("vkResetCommandBuffer", e))?;
            let begin = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                ..Default::default()
            };
            self.device
                .begin_command_buffer(cb, &begin)
                .map_err(|e| RenderError::driver("vkBeginCommandBuffer", e))?;
        }
        Ok(cb)
    }

    pub fn end_frame(&self, slot: usize) -> Result<(), RenderError> {
        unsafe { self.device.end_command_buffer(self.buffers[slot]) }
            .map_err(|e| RenderError::driver("vkEndCommandBuffer", e))
    }

    pub fn begin_single_time(&self) -> Result<vk::CommandBuffer, RenderError> {
        let alloc = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cb = unsafe { self.device.allocate_command_buffers(&alloc) }
            .map_err(|e| RenderError::driver("vkAllocateCommandBuffers", e))?[0];

        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        if let Err(e) = unsafe { self.device.begin_command_buffer(cb, &begin) } {
            self.free(cb);
            return Err(RenderError::driver("vkBeginCommandBuffer", e));
        }
        Ok(cb)
    }

    /// Submits without sync primitives and blocks until the queue drains.
    /// The buffer is freed whether or not submission succeeds.
    pub fn end_single_time(&self, cb: vk::CommandBuffer) -> Result<(), RenderError> {
        let res = self.submit_and_wait(cb);
        self.free(cb);
        res
    }

    fn submit_and_wait(&self, cb: vk::CommandBuffer) -> Result<(), RenderError> {
        unsafe {
            self.device
                .end_command_buffer(cb)
                .map_err(|e| RenderError::driver("vkEndCommandBuffer", e))?;
            let cbs = [cb];
            let submit = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                command_buffer_count: 1,
                p_command_buffers: cbs.as_ptr(),
                ..Default::default()
            };
            self.device
                .queue_submit(self.queue, &[submit], vk::Fence::null())
                .map_err(|e| RenderError::driver("vkQueueSubmit", e))?;
            self.device
                .queue_wait_idle(self.queue)
                .map_err(|e| RenderError::driver("vkQueueWaitIdle", e))
        }
    }

    /// Records `f` into a fresh one-time buffer and runs it to completion.
    pub fn one_shot<T>(&self, f: impl FnOnce(vk::CommandBuffer) -> Result<T>) -> Result<T> {
        let cb = self.begin_single_time()?;
        match f(cb) {
            Ok(v) => {
                self.end_single_time(cb)?;
                Ok(v)
            }
            Err(e) => {
                unsafe { self.device.end_command_buffer(cb).ok() };
                self.free(cb);
                Err(e)
            }
        }
    }

    fn free(&self, cb: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(self.pool, &[cb]) };
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        unsafe {
            // buffers go with the pool
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}
