// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use std::hash::{Hash, Hasher};

/// Interleaved vertex as consumed by the pipeline's vertex input state:
/// position at location 0, color at 1, texture coordinate at 2.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub const WHITE: [f32; 3] = [1.0, 1.0, 1.0];

    pub const fn new(pos: [f32; 3], color: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self {
            pos,
            color,
            tex_coord,
        }
    }

    fn bits(&self) -> [u32; 8] {
        [
            self.pos[0].to_bits(),
            self.pos[1].to_bits(),
            self.pos[2].to_bits(),
            self.color[0].to_bits(),
            self.color[1].to_bits(),
            self.color[2].to_bits(),
            self.tex_coord[0].to_bits(),
            self.tex_coord[1].to_bits(),
        ]
    }
}

// Equality is bitwise so it agrees with Hash: vertices that differ only by
// float rounding (or by the sign of zero) stay distinct.
impl PartialEq for Vertex {
    fn eq(&self, other: &Self) -> bool {
        self.bits() == other.bits()
    }
}

impl Eq for Vertex {}

impl Hash for Vertex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::mem::{offset_of, size_of};

    #[test]
    fn layout_is_packed() {
        assert_eq!(size_of::<Vertex>(), 32);
        assert_eq!(offset_of!(Vertex, pos), 0);
        assert_eq!(offset_of!(Vertex, color), 12);
        assert_eq!(offset_of!(Vertex, tex_coord), 24);
    }

    #[test]
    fn equality_is_exact() {
        let a = Vertex::new([0.1, 0.2, 0.3], Vertex::WHITE, [0.0, 1.0]);
        let mut b = a;
        assert_eq!(a, b);
        b.pos[0] = f32::from_bits(a.pos[0].to_bits() + 1);
        assert_ne!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        set.insert(a);
        assert_eq!(set.len(), 2);
    }
}
