// SPDX-License-Identifier: CEPL-1.0
use crate::RenderError;
use anyhow::{Context, Result};
use orbit_math::Vertex;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Indexed triangle list held on the CPU before upload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
}

/// Compacts a vertex stream: each distinct vertex is stored once, in order of
/// first appearance.
#[derive(Default)]
struct Dedup {
    seen: HashMap<Vertex, u32>,
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
}

impl Dedup {
    fn push(&mut self, v: Vertex) {
        let next = self.vertices.len() as u32;
        let idx = *self.seen.entry(v).or_insert_with(|| {
            self.vertices.push(v);
            next
        });
        self.indices.push(idx);
    }

    fn finish(self) -> MeshData {
        MeshData {
            vertices: self.vertices,
            indices: self.indices,
        }
    }
}

impl MeshData {
    /// Takes vertex and index data as given; every index must address a vertex
    /// and the index count must describe whole triangles.
    pub fn from_parts(vertices: Vec<Vertex>, indices: Vec<u32>) -> Result<Self, RenderError> {
        if indices.len() % 3 != 0 {
            return Err(RenderError::InvalidMesh(format!(
                "{} indices is not a triangle list",
                indices.len()
            )));
        }
        if let Some(bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(RenderError::InvalidMesh(format!(
                "index {bad} out of range for {} vertices",
                vertices.len()
            )));
        }
        Ok(Self { vertices, indices })
    }

    /// Builds an indexed mesh from one vertex per triangle corner.
    pub fn from_triangle_soup(soup: impl IntoIterator<Item = Vertex>) -> Self {
        let mut dedup = Dedup::default();
        for v in soup {
            dedup.push(v);
        }
        dedup.finish()
    }

    /// Loads every model in a Wavefront OBJ file into one mesh.
    ///
    /// Faces are triangulated, V is flipped to top-left origin, color is white
    /// and corners without a texture coordinate get `(0, 0)`.
    pub fn load_obj(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let opts = tobj::LoadOptions {
            triangulate: true,
            single_index: false,
            ..Default::default()
        };
        let (models, _materials) =
            tobj::load_obj(path, &opts).map_err(|e| RenderError::asset(path, e))?;

        let mut dedup = Dedup::default();
        for model in &models {
            let m = &model.mesh;
            for (corner, &pi) in m.indices.iter().enumerate() {
                let vertex = obj_corner(m, corner, pi as usize)
                    .with_context(|| format!("model '{}' in {}", model.name, path.display()))?;
                dedup.push(vertex);
            }
        }

        let mesh = dedup.finish();
        debug!(
            path = %path.display(),
            models = models.len(),
            vertices = mesh.vertices.len(),
            indices = mesh.indices.len(),
            "obj loaded"
        );
        Ok(mesh)
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }

    /// Expands the index buffer back into a flat vertex sequence.
    pub fn unindexed(&self) -> Vec<Vertex> {
        self.indices
            .iter()
            .map(|&i| self.vertices[i as usize])
            .collect()
    }
}

fn obj_corner(m: &tobj::Mesh, corner: usize, pi: usize) -> Result<Vertex, RenderError> {
    let pos = m
        .positions
        .get(3 * pi..3 * pi + 3)
        .ok_or_else(|| RenderError::InvalidMesh(format!("position index {pi} out of range")))?;

    let tex_coord = if m.texcoords.is_empty() {
        [0.0, 0.0]
    } else {
        let ti = match m.texcoord_indices.get(corner) {
            Some(&ti) => ti as usize,
            None => pi,
        };
        let uv = m
            .texcoords
            .get(2 * ti..2 * ti + 2)
            .ok_or_else(|| RenderError::InvalidMesh(format!("texcoord index {ti} out of range")))?;
        [uv[0], 1.0 - uv[1]]
    };

    Ok(Vertex::new([pos[0], pos[1], pos[2]], Vertex::WHITE, tex_coord))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn v(x: f32, y: f32) -> Vertex {
        Vertex::new([x, y, 0.0], Vertex::WHITE, [x, y])
    }

    #[test]
    fn soup_dedup_reconstructs_input() {
        let soup = vec![
            v(0.0, 0.0),
            v(1.0, 0.0),
            v(1.0, 1.0),
            v(0.0, 0.0),
            v(1.0, 1.0),
            v(0.0, 1.0),
        ];
        let mesh = MeshData::from_triangle_soup(soup.clone());
        assert_eq!(mesh.vertices().len(), 4);
        assert_eq!(mesh.indices(), &[0, 1, 2, 0, 2, 3]);
        assert_eq!(mesh.unindexed(), soup);
    }

    #[test]
    fn near_equal_vertices_stay_distinct() {
        let a = v(0.1, 0.2);
        let mut b = a;
        b.tex_coord[1] = f32::from_bits(a.tex_coord[1].to_bits() + 1);
        let mesh = MeshData::from_triangle_soup([a, b, a]);
        assert_eq!(mesh.vertices(), &[a, b]);
        assert_eq!(mesh.indices(), &[0, 1, 0]);
    }

    #[test]
    fn from_parts_validates_indices() {
        let verts = vec![v(0.0, 0.0), v(1.0, 0.0), v(0.0, 1.0)];
        assert!(MeshData::from_parts(verts.clone(), vec![0, 1, 2]).is_ok());
        assert!(matches!(
            MeshData::from_parts(verts.clone(), vec![0, 1, 3]),
            Err(RenderError::InvalidMesh(_))
        ));
        assert!(matches!(
            MeshData::from_parts(verts, vec![0, 1]),
            Err(RenderError::InvalidMesh(_))
        ));
        assert!(MeshData::from_parts(Vec::new(), Vec::new())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn obj_quad_is_deduplicated_and_v_flipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quad.obj");
        fs::write(
            &path,
            "o quad\n\
             v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\n\
             vt 0 0\nvt 1 0\nvt 1 1\nvt 0 1\n\
             f 1/1 2/2 3/3\nf 1/1 3/3 4/4\n",
        )
        .unwrap();

        let mesh = MeshData::load_obj(&path).unwrap();
        assert_eq!(mesh.index_count(), 6);
        assert_eq!(mesh.vertices().len(), 4);
        assert_eq!(mesh.indices(), &[0, 1, 2, 0, 2, 3]);

        let first = mesh.vertices()[0];
        assert_eq!(first.pos, [0.0, 0.0, 0.0]);
        assert_eq!(first.tex_coord, [0.0, 1.0]);
        assert_eq!(first.color, Vertex::WHITE);
        assert_eq!(mesh.vertices()[2].tex_coord, [1.0, 0.0]);
    }

    #[test]
    fn obj_without_texcoords_uses_origin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tri.obj");
        fs::write(&path, "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n").unwrap();

        let mesh = MeshData::load_obj(&path).unwrap();
        assert_eq!(mesh.index_count(), 3);
        assert!(mesh.vertices().iter().all(|v| v.tex_coord == [0.0, 0.0]));
    }

    #[test]
    fn missing_obj_is_asset_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MeshData::load_obj(dir.path().join("nope.obj")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::Asset { .. })
        ));
    }
}
