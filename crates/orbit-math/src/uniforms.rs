// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

pub const SPIN_DEGREES_PER_SEC: f32 = 90.0;

const FOV_Y_DEGREES: f32 = 45.0;
const Z_NEAR: f32 = 0.1;
const Z_FAR: f32 = 10.0;

/// Uniform block bound at set 0, binding 0.
///
/// Matches the shader's std140 block: three column-major 4x4 matrices at
/// offsets 0, 64 and 128.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct SceneUniforms {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl SceneUniforms {
    pub const fn identity() -> Self {
        Self {
            model: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
        }
    }

    /// The frame transform `elapsed_secs` after start for a target of the
    /// given aspect ratio.
    pub fn spinning(elapsed_secs: f32, aspect: f32) -> Self {
        Self {
            model: spin_model(elapsed_secs),
            view: camera_view(),
            proj: projection(aspect),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Rotation about +Z (the camera's up axis) at a fixed rate.
pub fn spin_model(elapsed_secs: f32) -> Mat4 {
    Mat4::from_rotation_z(elapsed_secs * SPIN_DEGREES_PER_SEC.to_radians())
}

pub fn camera_view() -> Mat4 {
    Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z)
}

/// Right-handed perspective with 0..1 depth and Y flipped for Vulkan clip space.
pub fn projection(aspect: f32) -> Mat4 {
    let mut proj = Mat4::perspective_rh(FOV_Y_DEGREES.to_radians(), aspect, Z_NEAR, Z_FAR);
    proj.y_axis.y *= -1.0;
    proj
}
