//! Parallel construction of the shared mesh.
//!
//! Each stage splits its items evenly across workers, the barriers in
//! `Worker::run` separate the stages.

use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::edge_hash::InsertError;
use crate::quadric::Quadric;
use crate::topology::{pivot, Mesh, Vertex, BOUNDARY, FORBIDDEN};
use crate::worker::Worker;

/// Run `f` on `vertex` while holding its owner token.
fn with_vertex(vertex: &Vertex, thread: i32, f: impl FnOnce(&Vertex)) {
    vertex.spin_acquire(thread);
    f(vertex);
    vertex.spin_release();
}

fn accumulate(vertex: &Vertex, thread: i32, q: &Quadric) {
    with_vertex(vertex, thread, |v| v.set_quadric(&(v.quadric() + *q)));
}

/// Lay out the reference lists back to back once every vertex knows its
/// triangle count. Runs on the coordinator between two barriers.
pub(crate) fn assign_triref_bases(mesh: &Mesh) {
    let mut next = 0;
    for vertex in &mesh.vertices {
        vertex.set_triref_base(next);
        next += vertex.triref_count();
        vertex.set_triref_count(0);
    }
    mesh.set_triref_next(next);
    debug!(trirefs = next, "assigned triangle reference bases");
}

impl Worker<'_, '_> {
    fn thread(&self) -> i32 {
        self.id as i32
    }

    pub(crate) fn init_vertices(&mut self) {
        let shared = self.shared;
        let input = &shared.input;
        let range = shared.partition(self.id, shared.mesh.vertex_count);
        for (done, index) in range.enumerate() {
            let point = input.vertex_codec.read(input.vertices, index);
            shared.mesh.vertices[index].set_point(&point);
            self.progress().vertices.store(done + 1, Ordering::Relaxed);
        }
    }

    pub(crate) fn init_triangles(&mut self) {
        let shared = self.shared;
        let mesh = &shared.mesh;
        let input = &shared.input;
        let thread = self.thread();
        let range = shared.partition(self.id, mesh.triangles.len());
        for (done, index) in range.enumerate() {
            let v = input
                .index_codec
                .read(input.indices, index)
                .map(|i| i as i32);
            let tri = &mesh.triangles[index];
            tri.set_vertices(v);

            let q = Quadric::from_triangle(
                &mesh.vertex(v[0]).point(),
                &mesh.vertex(v[1]).point(),
                &mesh.vertex(v[2]).point(),
            );
            for vertex in v {
                with_vertex(mesh.vertex(vertex), thread, |vx| {
                    vx.set_quadric(&(vx.quadric() + q));
                    vx.set_triref_count(vx.triref_count() + 1);
                });
            }

            if let Some(hash) = shared.hash.as_ref() {
                for k in 0..3 {
                    let (a, b) = (v[k], v[(k + 1) % 3]);
                    match hash.insert(a, b, index as u32, None) {
                        Ok(()) => {}
                        Err(InsertError::Exists) => {
                            tri.add_flags(FORBIDDEN[k]);
                            self.forbid_edge(a, b);
                            self.forbid_edge(b, a);
                            self.totals.collisions += 1;
                        }
                        Err(InsertError::Full) => {
                            warn!(a, b, "edge index page full, edge will not collapse");
                            tri.add_flags(FORBIDDEN[k]);
                        }
                    }
                }
            }
            self.progress().triangles.store(done + 1, Ordering::Relaxed);
        }
    }

    /// Mark the triangle slot holding the directed edge `a -> b` as
    /// not collapsible.
    fn forbid_edge(&self, a: i32, b: i32) {
        let shared = self.shared;
        let Some(hash) = shared.hash.as_ref() else {
            return;
        };
        let Some(tri) = hash.with_edge(a, b, |edge| edge.tri) else {
            return;
        };
        let t = &shared.mesh.triangles[tri as usize];
        let v = t.vertices();
        if let Some(k) = pivot(&v, a) {
            let slot = if v[(k + 1) % 3] == b { k } else { (k + 2) % 3 };
            t.add_flags(FORBIDDEN[slot]);
        }
    }

    pub(crate) fn build_trirefs(&mut self) {
        let shared = self.shared;
        let mesh = &shared.mesh;
        let thread = self.thread();
        let range = shared.partition(self.id, mesh.triangles.len());
        for (done, index) in range.enumerate() {
            let v = mesh.triangles[index].vertices();
            for vertex in v {
                with_vertex(mesh.vertex(vertex), thread, |vx| {
                    let count = vx.triref_count();
                    mesh.set_triref(vx.triref_base() + count, index as i32);
                    vx.set_triref_count(count + 1);
                });
            }
            if shared.hash.is_some() {
                self.accumulate_boundary(index);
            }
            self.progress().trirefs.store(done + 1, Ordering::Relaxed);
        }
    }

    /// Add side plane quadrics along open edges, or along interior edges
    /// the caller weights through its callback.
    fn accumulate_boundary(&self, index: usize) {
        let shared = self.shared;
        let Some(hash) = shared.hash.as_ref() else {
            return;
        };
        let mesh = &shared.mesh;
        let tri = &mesh.triangles[index];
        let v = tri.vertices();
        for k in 0..3 {
            let (a, b, c) = (v[k], v[(k + 1) % 3], v[(k + 2) % 3]);
            let twin = hash.with_edge(b, a, |edge| edge.tri);
            let weight = match (twin, shared.edge_weight) {
                (None, _) if tri.flags() & FORBIDDEN[k] == 0 => {
                    tri.add_flags(BOUNDARY[k]);
                    shared.settings.boundary_weight
                }
                (Some(other), Some(callback)) => callback(
                    shared.input.payload(index as u32),
                    shared.input.payload(other),
                ),
                _ => continue,
            };
            if !(weight > 0.0) {
                continue;
            }
            let (pa, pb, pc) = (
                mesh.vertex(a).point(),
                mesh.vertex(b).point(),
                mesh.vertex(c).point(),
            );
            if let Some(q) = Quadric::boundary(&pa, &pb, &pc, weight) {
                accumulate(mesh.vertex(a), self.thread(), &q);
                accumulate(mesh.vertex(b), self.thread(), &q);
            }
        }
    }

    /// Create the initial candidates, one per undirected edge plus one per
    /// open boundary edge.
    ///
    /// Open edges are queued first. Buckets pop their newest item, so at
    /// equal cost an interior edge removing two triangles comes out ahead
    /// of a boundary edge removing one.
    pub(crate) fn populate_queue(&mut self) {
        let shared = self.shared;
        let mesh = &shared.mesh;
        let range = shared.partition(self.id, mesh.triangles.len());
        for open_pass in [true, false] {
            for (done, index) in range.clone().enumerate() {
                let tri = &mesh.triangles[index];
                let v = tri.vertices();
                let flags = tri.flags();
                for k in 0..3 {
                    let (a, b) = (v[k], v[(k + 1) % 3]);
                    if a == b || flags & FORBIDDEN[k] != 0 {
                        continue;
                    }
                    let open = flags & BOUNDARY[k] != 0;
                    if open != open_pass {
                        continue;
                    }
                    if open || a < b {
                        self.add_op(a, b);
                    }
                }
                if !open_pass {
                    self.progress().populated.store(done + 1, Ordering::Relaxed);
                }
            }
        }
        debug!(
            thread = self.id,
            queued = self.queue.len(),
            ops = self.ops.len(),
            "populated queue"
        );
    }
}
