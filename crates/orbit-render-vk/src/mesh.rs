// SPDX-License-Identifier: CEPL-1.0
use crate::buffer::{upload_device_local, GpuBuffer};
use crate::command::CommandRecorder;
use crate::context::GraphicsContext;
use anyhow::Result;
use ash::vk;
use orbit_render::{MeshData, RenderError};
use tracing::debug;

/// Device-local vertex and index buffers for one indexed triangle list.
#[derive(Default)]
pub struct Mesh {
    vertices: Option<GpuBuffer>,
    indices: Option<GpuBuffer>,
    index_count: u32,
}

impl Mesh {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Two synchronous staging round trips: vertices, then indices.
    pub fn upload(ctx: &GraphicsContext, recorder: &CommandRecorder, data: &MeshData) -> Result<Self> {
        if data.is_empty() {
            return Err(RenderError::EmptyMesh.into());
        }
        let vertices = upload_device_local(
            ctx,
            recorder,
            "vertex buffer",
            bytemuck::cast_slice(data.vertices()),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let indices = upload_device_local(
            ctx,
            recorder,
            "index buffer",
            bytemuck::cast_slice(data.indices()),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        debug!(
            vertices = data.vertices().len(),
            indices = data.index_count(),
            "mesh uploaded"
        );
        Ok(Self {
            vertices: Some(vertices),
            indices: Some(indices),
            index_count: data.index_count(),
        })
    }

    fn buffers(&self) -> Result<(&GpuBuffer, &GpuBuffer), RenderError> {
        match (&self.vertices, &self.indices) {
            (Some(v), Some(i)) if self.index_count > 0 => Ok((v, i)),
            _ => Err(RenderError::EmptyMesh),
        }
    }

    pub fn bind(&self, device: &ash::Device, cb: vk::CommandBuffer) -> Result<(), RenderError> {
        let (vertices, indices) = self.buffers()?;
        unsafe {
            device.cmd_bind_vertex_buffers(cb, 0, &[vertices.handle()], &[0]);
            device.cmd_bind_index_buffer(cb, indices.handle(), 0, vk::IndexType::UINT32);
        }
        Ok(())
    }

    pub fn draw(&self, device: &ash::Device, cb: vk::CommandBuffer) -> Result<(), RenderError> {
        self.buffers()?;
        unsafe { device.cmd_draw_indexed(cb, self.index_count, 1, 0, 0, 0) };
        Ok(())
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn is_empty(&self) -> bool {
        self.buffers().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mesh_refuses_to_bind() {
        let mesh = Mesh::empty();
        assert!(mesh.is_empty());
        assert_eq!(mesh.index_count(), 0);
        assert!(matches!(mesh.buffers(), Err(RenderError::EmptyMesh)));
    }
}
