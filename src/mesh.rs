use anyhow::{anyhow, Result};
use itertools::Itertools;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;

use crate::config::DecimationConfig;
use crate::engine::{decimate, DecimationReport, IndexBuffer, Operation, VertexBuffer};
use crate::format::ScalarFormat;

/// Bytes per vertex and per face in the buffers handed to the engine.
const POINT_STRIDE: usize = std::mem::size_of::<Point3<f64>>();
const FACE_STRIDE: usize = 3 * std::mem::size_of::<u64>();

#[derive(Default, Debug, Clone, PartialEq)]
pub struct Trimesh {
    pub vertices: Vec<Point3<f64>>,
    pub faces: Vec<(usize, usize, usize)>,
}

impl Trimesh {
    pub fn new(vertices: Vec<Point3<f64>>, faces: Vec<(usize, usize, usize)>) -> Self {
        Self { vertices, faces }
    }

    /// Create a Trimesh from flat slices of vertices and faces.
    pub fn from_slice(vertices: &[f64], faces: &[usize]) -> Result<Self> {
        if vertices.len() % 3 != 0 {
            return Err(anyhow!("Vertices must be a multiple of 3"));
        }
        if faces.len() % 3 != 0 {
            return Err(anyhow!("Faces must be a multiple of 3"));
        }

        let v = vertices
            .chunks_exact(3)
            .map(|chunk| Point3::new(chunk[0], chunk[1], chunk[2]))
            .collect::<Vec<_>>();

        let f: Vec<(usize, usize, usize)> = faces.iter().copied().tuples().collect();

        Ok(Self::new(v, f))
    }

    /// Calculate the normals for each face of the mesh.
    pub fn face_normals(&self) -> Vec<Vector3<f64>> {
        let vertices = &self.vertices;
        self.faces
            .par_iter()
            .map(|face| {
                let v0 = vertices[face.0];
                let v1 = vertices[face.1];
                let v2 = vertices[face.2];
                ((v1 - v0).cross(&(v2 - v0))).normalize()
            })
            .collect()
    }

    /// Calculate an axis-aligned bounding box (AABB) for the mesh.
    pub fn bounds(&self) -> Result<(Point3<f64>, Point3<f64>)> {
        let Some(first) = self.vertices.first() else {
            return Err(anyhow!("Mesh has no vertices"));
        };

        // start with bounds from the first vertex
        let (mut lower, mut upper) = (*first, *first);
        for vertex in self.vertices.iter().skip(1) {
            // use componentwise min/max
            lower = lower.inf(vertex);
            upper = upper.sup(vertex);
        }

        if lower == upper {
            return Err(anyhow!("All vertices are the same"));
        }

        Ok((lower, upper))
    }

    /// Decimate a copy of this mesh.
    ///
    /// Parameters
    /// ------------
    /// strength
    ///   Aggressiveness in `[0, 1]`, mapped to the collapse cost ceiling.
    /// config
    ///   Advanced tunables, `DecimationConfig::default()` fits most meshes.
    ///
    /// Returns
    /// ------------
    /// mesh
    ///   The decimated mesh with unused vertices packed away.
    /// report
    ///   Counts and timing of the run.
    pub fn decimate(
        &self,
        strength: f64,
        config: DecimationConfig,
    ) -> Result<(Trimesh, DecimationReport)> {
        if self.faces.is_empty() {
            return Err(anyhow!("Mesh has no faces"));
        }
        let mut vertices = self.vertices.clone();
        let mut indices: Vec<u64> = self
            .faces
            .iter()
            .flat_map(|f| [f.0 as u64, f.1 as u64, f.2 as u64])
            .collect();

        let vertex_count = vertices.len();
        let op = Operation::new(
            VertexBuffer::new(
                bytemuck::cast_slice_mut(&mut vertices),
                ScalarFormat::F64,
                POINT_STRIDE,
                vertex_count,
            ),
            IndexBuffer::new(
                bytemuck::cast_slice_mut(&mut indices),
                ScalarFormat::U64,
                FACE_STRIDE,
                self.faces.len(),
            ),
        )
        .with_strength(strength)
        .with_config(config);
        let report = decimate(op)?;

        vertices.truncate(report.vertex_count);
        let faces = indices
            .into_iter()
            .map(|i| i as usize)
            .tuples()
            .take(report.triangle_count)
            .collect();
        Ok((Trimesh::new(vertices, faces), report))
    }
}

/// An axis aligned box centered on the origin with outward facing
/// counter clockwise triangles.
pub fn create_box(extents: &[f64; 3]) -> Trimesh {
    let half_extents = [extents[0] / 2.0, extents[1] / 2.0, extents[2] / 2.0];
    let vertices = vec![
        Point3::new(-half_extents[0], -half_extents[1], -half_extents[2]),
        Point3::new(half_extents[0], -half_extents[1], -half_extents[2]),
        Point3::new(half_extents[0], half_extents[1], -half_extents[2]),
        Point3::new(-half_extents[0], half_extents[1], -half_extents[2]),
        Point3::new(-half_extents[0], -half_extents[1], half_extents[2]),
        Point3::new(half_extents[0], -half_extents[1], half_extents[2]),
        Point3::new(half_extents[0], half_extents[1], half_extents[2]),
        Point3::new(-half_extents[0], half_extents[1], half_extents[2]),
    ];

    let faces = vec![
        (0, 2, 1),
        (0, 3, 2),
        (4, 5, 6),
        (4, 6, 7),
        (0, 1, 5),
        (0, 5, 4),
        (2, 3, 7),
        (2, 7, 6),
        (1, 2, 6),
        (1, 6, 5),
        (3, 0, 4),
        (3, 4, 7),
    ];

    Trimesh::new(vertices, faces)
}

#[cfg(test)]
mod tests {

    use super::*;
    use approx::relative_eq;

    /// A flat `n` by `n` grid of unit squares in the z = 0 plane.
    fn grid(n: usize) -> Trimesh {
        let mut vertices = Vec::new();
        for y in 0..=n {
            for x in 0..=n {
                vertices.push(Point3::new(x as f64, y as f64, 0.0));
            }
        }
        let index = |x: usize, y: usize| y * (n + 1) + x;
        let mut faces = Vec::new();
        for y in 0..n {
            for x in 0..n {
                faces.push((index(x, y), index(x + 1, y), index(x + 1, y + 1)));
                faces.push((index(x, y), index(x + 1, y + 1), index(x, y + 1)));
            }
        }
        Trimesh::new(vertices, faces)
    }

    #[test]
    fn test_mesh_normals() {
        let m = Trimesh::from_slice(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0], &[0, 1, 2])
            .unwrap();
        let normals = m.face_normals();
        assert_eq!(normals.len(), 1);
        assert!(relative_eq!(
            normals[0],
            Vector3::new(0.0, 0.0, 1.0),
            epsilon = 1e-6
        ));
    }

    #[test]
    fn test_from_slice_rejects_partial() {
        assert!(Trimesh::from_slice(&[0.0, 1.0], &[]).is_err());
        assert!(Trimesh::from_slice(&[0.0; 9], &[0, 1]).is_err());
    }

    #[test]
    fn test_mesh_box() {
        let box_mesh = create_box(&[1.0, 1.0, 1.0]);
        assert_eq!(box_mesh.vertices.len(), 8);
        assert_eq!(box_mesh.faces.len(), 12);

        let bounds = box_mesh.bounds().unwrap();
        assert_eq!(bounds.0, Point3::new(-0.5, -0.5, -0.5));
        assert_eq!(bounds.1, Point3::new(0.5, 0.5, 0.5));

        // every face points away from the center
        let normals = box_mesh.face_normals();
        for (face, normal) in box_mesh.faces.iter().zip(normals) {
            let center = (box_mesh.vertices[face.0].coords
                + box_mesh.vertices[face.1].coords
                + box_mesh.vertices[face.2].coords)
                / 3.0;
            assert!(center.dot(&normal) > 0.0);
        }
    }

    #[test]
    fn test_box_survives_decimation() {
        let box_mesh = create_box(&[1.0, 1.0, 1.0]);
        let (result, report) = box_mesh
            .decimate(1.0, DecimationConfig::default())
            .unwrap();
        assert_eq!(report.decimation_count, 0);
        assert_eq!(report.collision_count, 0);
        assert_eq!(result, box_mesh);
    }

    #[test]
    fn test_grid_decimation() {
        let mesh = grid(8);
        let (result, report) = mesh.decimate(1.0, DecimationConfig::default()).unwrap();
        assert!(report.decimation_count > 0);
        assert!(result.faces.len() < mesh.faces.len());
        assert_eq!(result.faces.len(), report.triangle_count);
        assert_eq!(result.vertices.len(), report.vertex_count);
        for v in &result.vertices {
            assert!(relative_eq!(v.z, 0.0, epsilon = 1e-9));
        }
        for face in &result.faces {
            assert!(face.0 < result.vertices.len());
            assert!(face.1 < result.vertices.len());
            assert!(face.2 < result.vertices.len());
        }
    }

    #[test]
    fn test_decimate_empty() {
        assert!(Trimesh::default()
            .decimate(0.5, DecimationConfig::default())
            .is_err());
    }
}
