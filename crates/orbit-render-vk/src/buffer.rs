// SPDX-License-Identifier: CEPL-1.0
use crate::command::CommandRecorder;
use crate::context::GraphicsContext;
use anyhow::{Context, Result};
use ash::vk;
use orbit_render::RenderError;
use std::ffi::c_void;
use std::ptr::NonNull;
use tracing::trace;

/// Copies `src` to the start of `dst`.
pub fn write_mapped(dst: &mut [u8], src: &[u8]) -> Result<(), RenderError> {
    if src.len() > dst.len() {
        return Err(RenderError::Overflow {
            len: src.len(),
            capacity: dst.len() as u64,
        });
    }
    dst[..src.len()].copy_from_slice(src);
    Ok(())
}

/// Host view of mapped memory: where it starts and how long it is.
#[derive(Debug, Default)]
pub struct Mapping {
    ptr: Option<NonNull<u8>>,
    len: usize,
}

impl Mapping {
    /// Maps through `map`, which must hand back `len` writable bytes.
    ///
    /// # Safety
    /// The pointer `map` returns must stay valid for `len` bytes until [`Mapping::end`].
    pub unsafe fn begin(
        &mut self,
        len: usize,
        map: impl FnOnce() -> Result<*mut c_void, RenderError>,
    ) -> Result<(), RenderError> {
        if self.ptr.is_some() {
            return Err(RenderError::AlreadyMapped);
        }
        let ptr = NonNull::new(map()?.cast::<u8>())
            .ok_or_else(|| RenderError::driver("vkMapMemory", "null pointer"))?;
        self.ptr = Some(ptr);
        self.len = len;
        Ok(())
    }

    /// True when something was mapped and the caller must unmap it.
    pub fn end(&mut self) -> bool {
        self.len = 0;
        self.ptr.take().is_some()
    }

    pub fn is_mapped(&self) -> bool {
        self.ptr.is_some()
    }

    pub fn bytes(&mut self) -> Result<&mut [u8], RenderError> {
        let ptr = self.ptr.ok_or(RenderError::NotMapped)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) })
    }

    pub fn copy(&mut self, src: &[u8]) -> Result<(), RenderError> {
        write_mapped(self.bytes()?, src)
    }
}

/// A buffer and the memory bound to it. Host-visible buffers can be mapped.
pub struct GpuBuffer {
    device: ash::Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    mapping: Mapping,
}

impl GpuBuffer {
    pub fn create(
        ctx: &GraphicsContext,
        what: &'static str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let device = ctx.device();
        let info = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = unsafe { device.create_buffer(&info, None) }
            .map_err(|e| RenderError::driver("vkCreateBuffer", e))?;

        let req = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory = ctx
            .find_memory_type(req.memory_type_bits, props)
            .map_err(|_| RenderError::Allocation { what, size })
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
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };
        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(RenderError::driver("vkBindBufferMemory", e).into());
        }

        trace!(what, size, ?usage, "buffer created");
        Ok(Self {
            device: device.clone(),
            buffer,
            memory,
            size,
            mapping: Mapping::default(),
        })
    }

    /// Maps the whole buffer. Requires host-visible memory.
    pub fn map(&mut self) -> Result<(), RenderError> {
        let (device, memory, size) = (&self.device, self.memory, self.size);
        unsafe {
            self.mapping.begin(size as usize, || {
                device
                    .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
                    .map_err(|e| RenderError::driver("vkMapMemory", e))
            })
        }
    }

    pub fn unmap(&mut self) {
        if self.mapping.end() {
            unsafe { self.device.unmap_memory(self.memory) };
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_mapped()
    }

    pub fn mapped_bytes(&mut self) -> Result<&mut [u8], RenderError> {
        self.mapping.bytes()
    }

    pub fn copy_data(&mut self, bytes: &[u8]) -> Result<(), RenderError> {
        self.mapping.copy(bytes)
    }

    pub fn write_pod<T: bytemuck::Pod>(&mut self, value: &T) -> Result<(), RenderError> {
        self.copy_data(bytemuck::bytes_of(value))
    }

    /// Records a whole-buffer copy from `src`.
    pub fn copy_from(&self, src: &GpuBuffer, cb: vk::CommandBuffer) -> Result<(), RenderError> {
        if src.size > self.size {
            return Err(RenderError::Overflow {
                len: src.size as usize,
                capacity: self.size,
            });
        }
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(cb, src.buffer, self.buffer, &[region])
        };
        Ok(())
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.unmap();
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Host-visible + coherent staging buffer already holding `bytes`.
pub fn staging_buffer(ctx: &GraphicsContext, bytes: &[u8]) -> Result<GpuBuffer> {
    let mut staging = GpuBuffer::create(
        ctx,
        "staging",
        bytes.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    staging.map()?;
    staging.copy_data(bytes)?;
    staging.unmap();
    Ok(staging)
}

/// Uploads `bytes` into a new device-local buffer through a staging copy and
/// waits for the transfer.
pub fn upload_device_local(
    ctx: &GraphicsContext,
    recorder: &CommandRecorder,
    what: &'static str,
    bytes: &[u8],
    usage: vk::BufferUsageFlags,
) -> Result<GpuBuffer> {
    let staging = staging_buffer(ctx, bytes).with_context(|| format!("stage {what}"))?;
    let dst = GpuBuffer::create(
        ctx,
        what,
        bytes.len() as vk::DeviceSize,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    recorder
        .one_shot(|cb| Ok(dst.copy_from(&staging, cb)?))
        .with_context(|| format!("upload {what}"))?;
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_math::SceneUniforms;

    #[test]
    fn uniform_bytes_round_trip_through_mapping() {
        let ubo = SceneUniforms::spinning(0.5, 4.0 / 3.0);
        let mut mapped = vec![0u8; std::mem::size_of::<SceneUniforms>()];
        write_mapped(&mut mapped, ubo.as_bytes()).unwrap();

        let back: SceneUniforms = bytemuck::pod_read_unaligned(&mapped);
        assert_eq!(back, ubo);
    }

    #[test]
    fn smaller_writes_leave_the_tail() {
        let mut mapped = vec![7u8; 8];
        write_mapped(&mut mapped, &[1, 2, 3]).unwrap();
        assert_eq!(mapped, [1, 2, 3, 7, 7, 7, 7, 7]);
    }

    #[test]
    fn oversized_write_is_rejected_untouched() {
        let mut mapped = vec![0u8; 4];
        let err = write_mapped(&mut mapped, &[1; 5]).unwrap_err();
        assert!(matches!(
            err,
            RenderError::Overflow {
                len: 5,
                capacity: 4
            }
        ));
        assert_eq!(mapped, [0; 4]);
    }

    #[test]
    fn copy_before_map_fails() {
        let mut mapping = Mapping::default();
        assert!(!mapping.is_mapped());
        assert!(matches!(mapping.copy(&[1, 2]), Err(RenderError::NotMapped)));
        assert!(matches!(mapping.bytes(), Err(RenderError::NotMapped)));
        assert!(!mapping.end());
    }

    #[test]
    fn second_map_is_rejected() {
        let mut memory = vec![0u8; 16];
        let ptr = memory.as_mut_ptr();
        let mut mapping = Mapping::default();
        unsafe { mapping.begin(16, || Ok(ptr.cast())) }.unwrap();

        let mut called = false;
        let again = unsafe {
            mapping.begin(16, || {
                called = true;
                Ok(ptr.cast())
            })
        };
        assert!(matches!(again, Err(RenderError::AlreadyMapped)));
        assert!(!called, "a second map must not reach the driver");
        assert!(mapping.is_mapped());
        assert!(mapping.end());
    }

    #[test]
    fn unmap_then_remap_writes_again() {
        let mut memory = vec![0u8; 8];
        let ptr = memory.as_mut_ptr();
        let mut mapping = Mapping::default();

        unsafe { mapping.begin(8, || Ok(ptr.cast())) }.unwrap();
        mapping.copy(&[1, 2, 3]).unwrap();
        assert!(mapping.end());
        assert!(matches!(mapping.copy(&[9]), Err(RenderError::NotMapped)));

        unsafe { mapping.begin(8, || Ok(ptr.cast())) }.unwrap();
        assert!(matches!(mapping.copy(&[0; 9]), Err(RenderError::Overflow { len: 9, capacity: 8 })));
        mapping.bytes().unwrap()[7] = 4;
        assert!(mapping.end());

        assert_eq!(memory, [1, 2, 3, 0, 0, 0, 0, 4]);
    }

    #[test]
    fn failed_map_stays_unmapped() {
        let mut mapping = Mapping::default();
        let err = unsafe {
            mapping.begin(4, || {
                Err(RenderError::driver("vkMapMemory", vk::Result::ERROR_MEMORY_MAP_FAILED))
            })
        };
        assert!(matches!(err, Err(RenderError::Driver { op: "vkMapMemory", .. })));
        assert!(!mapping.is_mapped());

        let err = unsafe { mapping.begin(4, || Ok(std::ptr::null_mut())) };
        assert!(err.is_err());
        assert!(!mapping.is_mapped());
    }
}
