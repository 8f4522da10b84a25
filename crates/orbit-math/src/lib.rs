// SPDX-License-Identifier: CEPL-1.0
//! Plain data shared between the CPU side and the shaders.

mod uniforms;
mod vertex;

pub use glam::{Mat4, Vec2, Vec3};
pub use uniforms::{camera_view, projection, spin_model, SceneUniforms, SPIN_DEGREES_PER_SEC};
pub use vertex::Vertex;
