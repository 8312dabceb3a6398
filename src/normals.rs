//! Vertex normal reconstruction for the decimated mesh.

use nalgebra::Vector3;
use rayon::prelude::*;
use tracing::{debug, error};

use crate::engine::VertexAttributes;
use crate::topology::{pivot, Snapshot};

/// Fans larger than this get a normal but are never split.
const MAX_SPLIT_FAN: usize = 256;

/// Unit normal of a triangle and the weight each corner gives it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TriNormal {
    pub normal: Vector3<f64>,
    pub factor: [f64; 3],
}

/// Corner angle from the cosine between its two edges.
fn angle_factor(dot: f64) -> f64 {
    if dot >= 1.0 {
        0.0
    } else if dot <= -1.0 {
        0.5 * std::f64::consts::PI
    } else {
        let angle = dot.acos();
        if angle.is_nan() {
            0.0
        } else {
            angle
        }
    }
}

/// Normals of every live triangle, indexed like the triangles.
pub(crate) fn triangle_normals(snapshot: &Snapshot, ccw: bool) -> Vec<Option<TriNormal>> {
    let sign = if ccw { -1.0 } else { 1.0 };
    let points = &snapshot.vertices;
    snapshot
        .triangles
        .par_iter()
        .map(|tri| {
            let v = (*tri)?;
            let (p0, p1, p2) = (
                points[v[0] as usize].point,
                points[v[1] as usize].point,
                points[v[2] as usize].point,
            );
            let vecta = p1 - p0;
            let vectb = p2 - p0;
            let vectc = p2 - p1;
            let mut normal = vectb.cross(&vecta);
            let norm = normal.norm();
            if norm > 0.0 {
                normal *= sign / norm;
            }
            let (ma, mb, mc) = (vecta.norm(), vectb.norm(), vectc.norm());
            Some(TriNormal {
                normal,
                factor: [
                    norm * angle_factor(vecta.dot(&vectb) / (ma * mb)),
                    norm * angle_factor(-vecta.dot(&vectc) / (ma * mc)),
                    norm * angle_factor(vectb.dot(&vectc) / (mb * mc)),
                ],
            })
        })
        .collect()
}

/// Builds per vertex normals, cloning vertices whose fan folds sharply when
/// splitting is enabled.
pub(crate) struct NormalBuilder<'m> {
    snapshot: &'m mut Snapshot,
    triangles: Vec<Option<TriNormal>>,
    /// One normal per vertex slot, including clones.
    pub normals: Vec<Vector3<f64>>,
    search_cos: f64,
    split: bool,
    clone_search: usize,
    attributes: Option<&'m dyn VertexAttributes>,
    pub clones: usize,
}

impl<'m> NormalBuilder<'m> {
    pub fn new(
        snapshot: &'m mut Snapshot,
        ccw: bool,
        search_cos: f64,
        split: bool,
        attributes: Option<&'m dyn VertexAttributes>,
    ) -> Self {
        let triangles = triangle_normals(snapshot, ccw);
        let normals = vec![Vector3::zeros(); snapshot.vertices.len()];
        NormalBuilder {
            snapshot,
            triangles,
            normals,
            search_cos,
            split,
            clone_search: 0,
            attributes,
            clones: 0,
        }
    }

    /// Compute the normal of every referenced vertex. Vertices whose
    /// triangles are all gone lose their references.
    pub fn build_all(&mut self) {
        for vertex in 0..self.snapshot.vertex_count {
            if self.snapshot.vertices[vertex].triref_count <= 0 {
                continue;
            }
            let refs = self.snapshot.refs(vertex).to_vec();
            if !self.build(vertex, refs) {
                self.snapshot.vertices[vertex].triref_count = 0;
            }
        }
        debug!(clones = self.clones, "built vertex normals");
    }

    fn compute(&self, vertex: usize, refs: &[i32]) -> Option<Vector3<f64>> {
        let mut sum = Vector3::zeros();
        let mut valid = false;
        for &tri in refs {
            if tri < 0 {
                continue;
            }
            let (Some(v), Some(tn)) = (
                self.snapshot.triangles[tri as usize],
                self.triangles[tri as usize],
            ) else {
                continue;
            };
            let Some(k) = pivot(&v, vertex as i32) else {
                error!(tri, vertex, "triangle reference without its vertex");
                continue;
            };
            sum += tn.normal * tn.factor[k];
            valid = true;
        }
        if !valid {
            return None;
        }
        let norm = sum.norm();
        if norm > 0.0 {
            sum /= norm;
        }
        Some(sum)
    }

    fn live_normal(&self, tri: i32) -> Option<Vector3<f64>> {
        if tri < 0 {
            return None;
        }
        self.triangles[tri as usize].map(|tn| tn.normal)
    }

    /// The most diverging pair of triangle normals below the search cosine.
    fn find_target(&self, refs: &[i32]) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let mut best = self.search_cos;
        let mut target = None;
        for (i, &t0) in refs.iter().enumerate() {
            let Some(n0) = self.live_normal(t0) else {
                continue;
            };
            for &t1 in &refs[i + 1..] {
                let Some(n1) = self.live_normal(t1) else {
                    continue;
                };
                let dot = n0.dot(&n1);
                if dot < best {
                    best = dot;
                    target = Some((n0, n1));
                }
            }
        }
        target
    }

    /// Take a slot that holds no referenced vertex and copy `source` into it.
    fn clone_vertex(&mut self, source: usize) -> Option<usize> {
        let snapshot = &mut *self.snapshot;
        let start = self.clone_search;
        let found = (start..snapshot.vertices.len())
            .find(|&i| i >= snapshot.vertex_count || snapshot.vertices[i].triref_count == 0);
        let Some(index) = found else {
            self.clone_search = snapshot.vertices.len();
            return None;
        };
        self.clone_search = index + 1;

        let point = snapshot.vertices[source].point;
        let slot = &mut snapshot.vertices[index];
        slot.point = point;
        slot.triref_count = -1;
        slot.redirect = -1;
        if index >= snapshot.vertex_count {
            snapshot.vertex_count = index + 1;
        }
        if let Some(attributes) = self.attributes {
            attributes.copy(index, source);
        }
        self.clones += 1;
        Some(index)
    }

    /// Normal of `vertex` over `refs`, splitting off clones as needed.
    ///
    /// Returns false when none of the referenced triangles is alive.
    fn build(&mut self, vertex: usize, refs: Vec<i32>) -> bool {
        let mut work = vec![(vertex, refs)];
        let mut root = true;
        let mut alive = true;
        while let Some((vertex, mut refs)) = work.pop() {
            let split = self.split && refs.len() <= MAX_SPLIT_FAN;
            loop {
                let Some(normal) = self.compute(vertex, &refs) else {
                    if root {
                        alive = false;
                    }
                    break;
                };
                self.normals[vertex] = normal;
                if !split {
                    break;
                }
                let Some((target0, target1)) = self.find_target(&refs) else {
                    break;
                };

                let mut moved = Vec::new();
                for slot in refs.iter_mut() {
                    let Some(n) = self.live_normal(*slot) else {
                        continue;
                    };
                    let dot1 = target1.dot(&n);
                    if dot1 < self.search_cos || target0.dot(&n) > dot1 {
                        continue;
                    }
                    moved.push(*slot);
                    *slot = -1;
                }
                if moved.is_empty() {
                    break;
                }
                let Some(clone) = self.clone_vertex(vertex) else {
                    break;
                };
                for &tri in &moved {
                    if let Some(v) = self.snapshot.triangles[tri as usize].as_mut() {
                        if let Some(k) = pivot(v, vertex as i32) {
                            v[k] = clone as i32;
                        }
                    }
                }
                work.push((clone, moved));
            }
            root = false;
        }
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::PlainVertex;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn snapshot(points: &[[f64; 3]], triangles: &[[i32; 3]], alloc: usize) -> Snapshot {
        let mut fans = vec![Vec::new(); alloc];
        for (t, tri) in triangles.iter().enumerate() {
            for v in tri {
                fans[*v as usize].push(t as i32);
            }
        }
        let mut trirefs = Vec::new();
        let mut vertices = Vec::new();
        for i in 0..alloc {
            let point = points.get(i).copied().unwrap_or([0.0; 3]);
            vertices.push(PlainVertex {
                point: Point3::from(point),
                triref_base: trirefs.len(),
                triref_count: fans[i].len() as i32,
                redirect: -1,
            });
            trirefs.extend_from_slice(&fans[i]);
        }
        Snapshot {
            vertices,
            vertex_count: points.len(),
            triangles: triangles.iter().map(|t| Some(*t)).collect(),
            trirefs,
        }
    }

    #[test]
    fn test_angle_factor() {
        assert_relative_eq!(angle_factor(1.5), 0.0);
        assert_relative_eq!(angle_factor(-2.0), std::f64::consts::FRAC_PI_2);
        assert_relative_eq!(angle_factor(0.0), std::f64::consts::FRAC_PI_2);
        assert_relative_eq!(angle_factor(f64::NAN), 0.0);
    }

    #[test]
    fn test_flat_fan_normal() {
        let points = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]];
        let mut snap = snapshot(&points, &[[0, 1, 2], [0, 2, 3]], 4);
        let mut builder = NormalBuilder::new(&mut snap, true, 0.7, false, None);
        builder.build_all();
        for n in &builder.normals {
            // counter clockwise winding seen from +z
            assert_relative_eq!(*n, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_sharp_edge_splits() {
        // two triangles folded at a right angle along the edge 0-1
        let points = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let mut snap = snapshot(&points, &[[0, 1, 2], [1, 0, 3]], 6);
        let mut builder = NormalBuilder::new(&mut snap, true, 0.7, true, None);
        builder.build_all();
        assert_eq!(builder.clones, 2);
        let normals = builder.normals.clone();
        drop(builder);
        assert_eq!(snap.vertex_count, 6);
        let moved = snap.triangles[1].unwrap();
        assert!(moved[0] >= 4 && moved[1] >= 4);
        // each copy now carries the normal of its own side
        assert_relative_eq!(normals[0].dot(&normals[moved[1] as usize]), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_dead_fan_drops_vertex() {
        let points = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let mut snap = snapshot(&points, &[[0, 1, 2]], 3);
        snap.triangles[0] = None;
        let mut builder = NormalBuilder::new(&mut snap, false, 0.7, false, None);
        builder.build_all();
        drop(builder);
        assert!(snap.vertices.iter().all(|v| v.triref_count == 0));
    }
}
