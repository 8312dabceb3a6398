//! Shared vertex, triangle and triangle reference arenas.
//!
//! Every field mutated while workers run is an atomic. Vertex ownership is
//! what serializes writers, so plain data uses relaxed ordering and the
//! owner token carries acquire/release.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use nalgebra::Point3;

use crate::quadric::{Quadric, QUADRIC_WORDS};

/// Owner token of an unlocked vertex.
pub(crate) const FREE: i32 = -1;
/// Redirect of a vertex that was not merged away.
pub(crate) const CANONICAL: i32 = -1;

/// Per edge slot bits of a triangle, edge `k` runs from `v[k]` to
/// `v[(k + 1) % 3]`.
pub(crate) const BOUNDARY: [u32; 3] = [0x1, 0x2, 0x4];
pub(crate) const FORBIDDEN: [u32; 3] = [0x10, 0x20, 0x40];

const RELAXED: Ordering = Ordering::Relaxed;

#[derive(Debug, Default)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(RELAXED))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), RELAXED);
    }
}

#[derive(Debug)]
pub(crate) struct Vertex {
    pub owner: AtomicI32,
    point: [AtomicF64; 3],
    quadric: [AtomicF64; QUADRIC_WORDS],
    triref_base: AtomicUsize,
    triref_count: AtomicI32,
    redirect: AtomicI32,
}

impl Default for Vertex {
    fn default() -> Self {
        Vertex {
            owner: AtomicI32::new(FREE),
            point: Default::default(),
            quadric: Default::default(),
            triref_base: AtomicUsize::new(0),
            triref_count: AtomicI32::new(0),
            redirect: AtomicI32::new(CANONICAL),
        }
    }
}

impl Vertex {
    pub fn point(&self) -> Point3<f64> {
        Point3::new(
            self.point[0].load(),
            self.point[1].load(),
            self.point[2].load(),
        )
    }

    pub fn set_point(&self, p: &Point3<f64>) {
        for (slot, v) in self.point.iter().zip(p.iter()) {
            slot.store(*v);
        }
    }

    pub fn quadric(&self) -> Quadric {
        let mut words = [0.0; QUADRIC_WORDS];
        for (w, slot) in words.iter_mut().zip(self.quadric.iter()) {
            *w = slot.load();
        }
        Quadric::from_words(&words)
    }

    pub fn set_quadric(&self, q: &Quadric) {
        for (slot, w) in self.quadric.iter().zip(q.to_words()) {
            slot.store(w);
        }
    }

    pub fn triref_base(&self) -> usize {
        self.triref_base.load(RELAXED)
    }

    pub fn set_triref_base(&self, base: usize) {
        self.triref_base.store(base, RELAXED);
    }

    pub fn triref_count(&self) -> usize {
        self.triref_count.load(RELAXED).max(0) as usize
    }

    pub fn set_triref_count(&self, count: usize) {
        self.triref_count.store(count as i32, RELAXED);
    }

    pub fn redirect(&self) -> i32 {
        self.redirect.load(RELAXED)
    }

    pub fn set_redirect(&self, target: i32) {
        self.redirect.store(target, RELAXED);
    }

    /// Spin until this thread owns the vertex. Only used by the build
    /// stages, which never hold more than one vertex at a time.
    pub fn spin_acquire(&self, thread: i32) {
        while self
            .owner
            .compare_exchange_weak(FREE, thread, Ordering::Acquire, RELAXED)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    pub fn spin_release(&self) {
        self.owner.store(FREE, Ordering::Release);
    }
}

#[derive(Debug)]
pub(crate) struct Triangle {
    v: [AtomicI32; 3],
    flags: AtomicU32,
}

impl Default for Triangle {
    fn default() -> Self {
        Triangle {
            v: [AtomicI32::new(-1), AtomicI32::new(-1), AtomicI32::new(-1)],
            flags: AtomicU32::new(0),
        }
    }
}

impl Triangle {
    pub fn vertices(&self) -> [i32; 3] {
        [
            self.v[0].load(RELAXED),
            self.v[1].load(RELAXED),
            self.v[2].load(RELAXED),
        ]
    }

    pub fn set_vertices(&self, v: [i32; 3]) {
        for (slot, value) in self.v.iter().zip(v) {
            slot.store(value, RELAXED);
        }
    }

    pub fn set_vertex(&self, k: usize, vertex: i32) {
        self.v[k].store(vertex, RELAXED);
    }

    pub fn is_dead(&self) -> bool {
        self.v[0].load(RELAXED) == -1
    }

    pub fn kill(&self) {
        self.v[0].store(-1, RELAXED);
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(RELAXED)
    }

    pub fn add_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, RELAXED);
    }
}

/// Slot of `vertex` inside a triangle.
pub(crate) fn pivot(v: &[i32; 3], vertex: i32) -> Option<usize> {
    v.iter().position(|x| *x == vertex)
}

/// Slot of the directed edge `a -> b` inside a triangle.
pub(crate) fn edge_slot(v: &[i32; 3], a: i32, b: i32) -> Option<usize> {
    (0..3).find(|&k| v[k] == a && v[(k + 1) % 3] == b)
}

/// Triangle references per triangle in the shared arena, the initial lists
/// take three and merged fans are bump allocated from the rest.
const TRIREF_ARENA_FACTOR: usize = 12;

#[derive(Debug)]
pub(crate) struct Mesh {
    pub vertices: Vec<Vertex>,
    pub vertex_count: usize,
    pub triangles: Vec<Triangle>,
    trirefs: Vec<AtomicI32>,
    triref_next: AtomicUsize,
}

impl Mesh {
    /// Arrays for `vertex_count` input vertices, with room for
    /// `vertex_alloc` once normal splitting clones vertices.
    pub fn new(vertex_count: usize, vertex_alloc: usize, triangle_count: usize) -> Self {
        let vertex_alloc = vertex_alloc.max(vertex_count);
        Mesh {
            vertices: (0..vertex_alloc).map(|_| Vertex::default()).collect(),
            vertex_count,
            triangles: (0..triangle_count).map(|_| Triangle::default()).collect(),
            trirefs: (0..TRIREF_ARENA_FACTOR * triangle_count)
                .map(|_| AtomicI32::new(-1))
                .collect(),
            triref_next: AtomicUsize::new(0),
        }
    }

    /// Bytes held by the arrays, used when budgeting the edge index.
    pub fn estimate_bytes(vertex_alloc: usize, triangle_count: usize) -> usize {
        vertex_alloc * std::mem::size_of::<Vertex>()
            + triangle_count * std::mem::size_of::<Triangle>()
            + TRIREF_ARENA_FACTOR * triangle_count * std::mem::size_of::<AtomicI32>()
    }

    pub fn vertex(&self, index: i32) -> &Vertex {
        &self.vertices[index as usize]
    }

    pub fn triangle(&self, index: i32) -> &Triangle {
        &self.triangles[index as usize]
    }

    pub fn triref(&self, slot: usize) -> i32 {
        self.trirefs[slot].load(RELAXED)
    }

    pub fn set_triref(&self, slot: usize, tri: i32) {
        self.trirefs[slot].store(tri, RELAXED);
    }

    /// Triangle references currently listed for `vertex`.
    pub fn fan(&self, vertex: i32) -> impl Iterator<Item = i32> + '_ {
        let v = self.vertex(vertex);
        let base = v.triref_base();
        (base..base + v.triref_count()).map(move |slot| self.triref(slot))
    }

    /// Mark the start of free arena space once the initial lists are laid out.
    pub fn set_triref_next(&self, next: usize) {
        self.triref_next.store(next, RELAXED);
    }

    /// Reserve `count` contiguous references, `None` once the arena is spent.
    pub fn reserve_trirefs(&self, count: usize) -> Option<usize> {
        let capacity = self.trirefs.len();
        self.triref_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                next.checked_add(count).filter(|end| *end <= capacity)
            })
            .ok()
    }

    /// Drop `tri` from the reference list of `vertex`, order is not kept.
    pub fn remove_triref(&self, vertex: i32, tri: i32) -> bool {
        let v = self.vertex(vertex);
        let base = v.triref_base();
        let count = v.triref_count();
        for slot in base..base + count {
            if self.triref(slot) == tri {
                let last = base + count - 1;
                self.set_triref(slot, self.triref(last));
                v.set_triref_count(count - 1);
                return true;
            }
        }
        false
    }

    /// Plain copy for the single threaded output stages.
    pub fn into_snapshot(self) -> Snapshot {
        let vertices = self
            .vertices
            .iter()
            .map(|v| PlainVertex {
                point: v.point(),
                triref_base: v.triref_base(),
                triref_count: v.triref_count.load(RELAXED),
                redirect: v.redirect(),
            })
            .collect();
        let triangles = self
            .triangles
            .iter()
            .map(|t| if t.is_dead() { None } else { Some(t.vertices()) })
            .collect();
        let trirefs = self.trirefs.into_iter().map(AtomicI32::into_inner).collect();
        Snapshot {
            vertices,
            vertex_count: self.vertex_count,
            triangles,
            trirefs,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PlainVertex {
    pub point: Point3<f64>,
    pub triref_base: usize,
    /// `-1` marks a clone created while splitting normals.
    pub triref_count: i32,
    pub redirect: i32,
}

#[derive(Debug)]
pub(crate) struct Snapshot {
    pub vertices: Vec<PlainVertex>,
    pub vertex_count: usize,
    pub triangles: Vec<Option<[i32; 3]>>,
    pub trirefs: Vec<i32>,
}

impl Snapshot {
    pub fn refs(&self, vertex: usize) -> &[i32] {
        let v = &self.vertices[vertex];
        let count = v.triref_count.max(0) as usize;
        &self.trirefs[v.triref_base..v.triref_base + count]
    }

    pub fn in_use(&self, vertex: usize) -> bool {
        self.refs(vertex).iter().any(|&tri| {
            tri >= 0
                && self.triangles[tri as usize]
                    .map(|v| pivot(&v, vertex as i32).is_some())
                    .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_fields() {
        let v = Vertex::default();
        assert_eq!(v.redirect(), CANONICAL);
        v.set_point(&Point3::new(1.0, 2.0, 3.0));
        assert_eq!(v.point(), Point3::new(1.0, 2.0, 3.0));

        let q = Quadric::from_plane(0.0, 0.0, 1.0, -2.0, 1.5);
        v.set_quadric(&q);
        assert_eq!(v.quadric(), q);

        v.spin_acquire(3);
        assert_eq!(v.owner.load(Ordering::Relaxed), 3);
        v.spin_release();
        assert_eq!(v.owner.load(Ordering::Relaxed), FREE);
    }

    #[test]
    fn test_edge_helpers() {
        let v = [4, 7, 9];
        assert_eq!(pivot(&v, 9), Some(2));
        assert_eq!(pivot(&v, 1), None);
        assert_eq!(edge_slot(&v, 9, 4), Some(2));
        assert_eq!(edge_slot(&v, 4, 9), None);
    }

    #[test]
    fn test_triref_arena() {
        let mesh = Mesh::new(3, 3, 1);
        mesh.set_triref_next(3);
        assert_eq!(mesh.reserve_trirefs(4), Some(3));
        assert_eq!(mesh.reserve_trirefs(5), Some(7));
        assert_eq!(mesh.reserve_trirefs(1), None);
    }

    #[test]
    fn test_remove_triref() {
        let mesh = Mesh::new(1, 1, 3);
        let v = mesh.vertex(0);
        v.set_triref_base(0);
        v.set_triref_count(3);
        for (slot, tri) in [5, 6, 7].into_iter().enumerate() {
            mesh.set_triref(slot, tri);
        }
        assert!(mesh.remove_triref(0, 5));
        assert!(!mesh.remove_triref(0, 5));
        let mut fan: Vec<i32> = mesh.fan(0).collect();
        fan.sort();
        assert_eq!(fan, vec![6, 7]);
    }
}
