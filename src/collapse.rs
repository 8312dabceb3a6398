//! The edge collapse transaction.
//!
//! Everything here runs with both endpoints and their whole fans locked by
//! the calling worker.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use nalgebra::Point3;
use tracing::{error, warn};

use crate::edge_hash::{EdgeHash, InsertError};
use crate::op::Op;
use crate::quadric::edge_solve;
use crate::topology::{edge_slot, pivot, Mesh, BOUNDARY, FORBIDDEN};
use crate::worker::Worker;

type Hash = EdgeHash<Arc<Op>>;

/// A triangle removed by a collapse.
#[derive(Debug, Clone, Copy)]
struct Removed {
    /// Corner opposite the collapsed edge.
    outer: i32,
    /// 0x1 when the edge leaving the second endpoint was open,
    /// 0x2 when the edge entering the first endpoint was.
    open: u32,
}

impl Worker<'_, '_> {
    /// Check that merging `v0` and `v1` does not fold the surface onto an
    /// edge that already exists.
    pub(crate) fn collision_free(&self, v0: i32, v1: i32) -> bool {
        let shared = self.shared;
        let Some(hash) = shared.hash.as_ref() else {
            return false;
        };
        let mesh = &shared.mesh;
        let (src, dst) = if mesh.vertex(v0).triref_count() < mesh.vertex(v1).triref_count() {
            (v0, v1)
        } else {
            (v1, v0)
        };
        let left = hash.with_edge(v0, v1, |edge| edge.tri as i32);
        let right = hash.with_edge(v1, v0, |edge| edge.tri as i32);
        let collides = |a: i32, b: i32| {
            hash.with_edge(a, b, |edge| edge.tri as i32)
                .is_some_and(|tri| Some(tri) != left && Some(tri) != right)
        };

        for tri in mesh.fan(src) {
            if Some(tri) == left || Some(tri) == right {
                continue;
            }
            let t = mesh.triangle(tri);
            if t.is_dead() {
                continue;
            }
            let v = t.vertices();
            let Some(k) = pivot(&v, src) else {
                error!(tri, vertex = src, "triangle reference without its vertex");
                continue;
            };
            if collides(dst, v[(k + 1) % 3]) || collides(v[(k + 2) % 3], dst) {
                return false;
            }
        }
        true
    }

    /// Merge `v1` into `v0` at `point`.
    ///
    /// Returns false, leaving the mesh untouched, when no storage is left
    /// for the merged triangle references.
    pub(crate) fn collapse(&mut self, v0: i32, v1: i32, point: &Point3<f64>) -> bool {
        let shared = self.shared;
        let Some(hash) = shared.hash.as_ref() else {
            return false;
        };
        let mesh = &shared.mesh;
        let (vertex0, vertex1) = (mesh.vertex(v0), mesh.vertex(v1));

        let left = hash.with_edge(v0, v1, |edge| edge.tri as i32);
        let right = hash.with_edge(v1, v0, |edge| edge.tri as i32);
        let live = |vertex: i32| {
            mesh.fan(vertex)
                .filter(|&tri| {
                    Some(tri) != left && Some(tri) != right && !mesh.triangle(tri).is_dead()
                })
                .count()
        };
        let needed = live(v0) + live(v1);
        let base = if needed <= vertex0.triref_count() {
            vertex0.triref_base()
        } else if needed <= vertex1.triref_count() {
            vertex1.triref_base()
        } else {
            match mesh.reserve_trirefs(needed) {
                Some(base) => base,
                None => {
                    warn!(v0, v1, needed, "triangle reference arena exhausted");
                    return false;
                }
            }
        };

        if let Some(attributes) = shared.attributes {
            let (p0, p1) = (vertex0.point(), vertex1.point());
            let mut w0 = (point - p1).norm() * vertex0.quadric().area();
            let mut w1 = (point - p0).norm() * vertex1.quadric().area();
            let sum = w0 + w1;
            if sum > 0.0 {
                w0 /= sum;
                w1 /= sum;
            } else {
                (w0, w1) = (0.5, 0.5);
            }
            attributes.merge(v0 as usize, v1 as usize, w0, w1);
        }

        let removed = [
            self.delete_triangle(hash, v0, v1),
            self.delete_triangle(hash, v1, v0),
        ];
        let deleted = removed.iter().flatten().count();
        self.progress().deleted.fetch_add(deleted, Ordering::Relaxed);

        vertex0.set_point(point);
        vertex0.set_quadric(&(vertex0.quadric() + vertex1.quadric()));
        vertex1.set_redirect(v0);

        let mut fan = std::mem::take(&mut self.fan);
        fan.clear();
        for vertex in [v0, v1] {
            for tri in mesh.fan(vertex) {
                let t = mesh.triangle(tri);
                if t.is_dead() {
                    continue;
                }
                let Some(k) = pivot(&t.vertices(), vertex) else {
                    error!(tri, vertex, "triangle reference without its vertex");
                    continue;
                };
                fan.push(tri);
                self.update_triangle(hash, tri, k, v0);
            }
        }

        // edges around the removed triangles only get their final keys above
        for r in removed.iter().flatten() {
            if r.open & 0x1 != 0 {
                Self::propagate_boundary(hash, mesh, v0, r.outer);
            }
            if r.open & 0x2 != 0 {
                Self::propagate_boundary(hash, mesh, r.outer, v0);
            }
        }

        for (i, tri) in fan.iter().enumerate() {
            mesh.set_triref(base + i, *tri);
        }
        vertex0.set_triref_base(base);
        vertex0.set_triref_count(fan.len());
        vertex1.set_triref_count(0);

        self.invalidate_fan(hash, &fan, v0);
        self.fan = fan;

        for r in removed.iter().flatten() {
            self.link_outer(hash, v0, r.outer);
        }
        true
    }

    /// Remove the triangle holding the directed edge `a -> b` along with
    /// its edges, flagging their candidates for deletion.
    fn delete_triangle(&self, hash: &Hash, a: i32, b: i32) -> Option<Removed> {
        let mesh = &self.shared.mesh;
        let edge = hash.remove(a, b)?;
        if let Some(op) = &edge.op {
            self.queue_update(op, Op::DELETION_PENDING);
        }
        let tri = edge.tri as i32;
        let t = mesh.triangle(tri);
        let v = t.vertices();
        for k in 0..3 {
            if v[k] == a {
                continue;
            }
            if let Some(op) = hash.remove(v[k], v[(k + 1) % 3]).and_then(|e| e.op) {
                self.queue_update(&op, Op::DELETION_PENDING);
            }
        }

        let Some(k) = pivot(&v, a) else {
            error!(tri, a, b, "indexed edge missing from its triangle");
            t.kill();
            return None;
        };
        let flags = t.flags();
        let mut open = 0;
        if flags & BOUNDARY[(k + 1) % 3] != 0 {
            open |= 0x1;
        }
        if flags & BOUNDARY[(k + 2) % 3] != 0 {
            open |= 0x2;
        }
        let outer = v[(k + 2) % 3];
        t.kill();
        if outer != a && outer != b {
            mesh.remove_triref(outer, tri);
        }
        Some(Removed { outer, open })
    }

    /// Move the corner `k` of `tri` to `newv`, re-keying its two edges and
    /// refreshing their candidates.
    fn update_triangle(&self, hash: &Hash, tri: i32, k: usize, newv: i32) {
        let t = self.shared.mesh.triangle(tri);
        let v = t.vertices();
        let (corner, right, left) = (v[k], v[(k + 1) % 3], v[(k + 2) % 3]);

        if let Some(op) = self.rekey(hash, (corner, right), (newv, right)) {
            op.set_v0(newv);
            self.refresh_op(&op, newv, right);
        }
        if let Some(op) = self.rekey(hash, (left, corner), (left, newv)) {
            op.set_v1(newv);
            self.refresh_op(&op, left, newv);
        }
        t.set_vertex(k, newv);
    }

    /// Move an edge entry to a new key, returning its candidate.
    fn rekey(&self, hash: &Hash, from: (i32, i32), to: (i32, i32)) -> Option<Arc<Op>> {
        if from == to {
            return hash.with_edge(from.0, from.1, |edge| edge.op.clone()).flatten();
        }
        let edge = hash.remove(from.0, from.1)?;
        match hash.insert(to.0, to.1, edge.tri, edge.op.clone()) {
            Ok(()) => edge.op,
            Err(err) => {
                match err {
                    InsertError::Exists => error!(?from, ?to, "collapse produced a duplicate edge"),
                    InsertError::Full => warn!(?from, ?to, "edge index page full"),
                }
                if let Some(op) = &edge.op {
                    self.queue_update(op, Op::DELETION_PENDING);
                }
                None
            }
        }
    }

    /// New target and quadric value for a candidate whose edge moved.
    fn refresh_op(&self, op: &Arc<Op>, a: i32, b: i32) {
        let mesh = &self.shared.mesh;
        let (va, vb) = (mesh.vertex(a), mesh.vertex(b));
        let (point, value) = edge_solve(&va.quadric(), &va.point(), &vb.quadric(), &vb.point());
        {
            let mut state = op.state();
            state.point = point;
            state.value = value;
        }
        self.queue_update(op, 0);
    }

    /// Mark `a -> b` as open once its twin disappeared.
    fn propagate_boundary(hash: &Hash, mesh: &Mesh, a: i32, b: i32) {
        if hash.contains(b, a) {
            return;
        }
        let Some(tri) = hash.with_edge(a, b, |edge| edge.tri as i32) else {
            return;
        };
        let t = mesh.triangle(tri);
        match pivot(&t.vertices(), a) {
            Some(k) => t.add_flags(BOUNDARY[k]),
            None => error!(tri, a, b, "indexed edge missing from its triangle"),
        }
    }

    /// Flag every candidate within two rings of `pivot_vertex`.
    fn invalidate_fan(&self, hash: &Hash, fan: &[i32], pivot_vertex: i32) {
        let mesh = &self.shared.mesh;
        for &tri in fan {
            let t = mesh.triangle(tri);
            if t.is_dead() {
                continue;
            }
            let v = t.vertices();
            let Some(k) = pivot(&v, pivot_vertex) else {
                continue;
            };
            self.invalidate_vertex(hash, v[(k + 1) % 3]);
            self.invalidate_vertex(hash, v[(k + 2) % 3]);
        }
    }

    fn invalidate_vertex(&self, hash: &Hash, vertex: i32) {
        let mesh = &self.shared.mesh;
        for tri in mesh.fan(vertex) {
            let t = mesh.triangle(tri);
            if t.is_dead() {
                continue;
            }
            let v = t.vertices();
            let Some(k) = pivot(&v, vertex) else {
                error!(tri, vertex, "triangle reference without its vertex");
                continue;
            };
            for (a, b) in [(vertex, v[(k + 1) % 3]), (v[(k + 2) % 3], vertex)] {
                if let Some(op) = hash.with_edge(a, b, |edge| edge.op.clone()).flatten() {
                    self.queue_update(&op, 0);
                }
            }
        }
    }

    /// Leave exactly one candidate on the edge between `newv` and a removed
    /// triangle's outer corner.
    ///
    /// The two half edges merged into it may each bring a candidate, the
    /// one on the reverse of the preferred direction is then dropped. An
    /// edge left without any gets a new one.
    fn link_outer(&mut self, hash: &Hash, newv: i32, outer: i32) {
        if outer == newv {
            return;
        }
        let forward = hash.with_edge(newv, outer, |edge| (edge.tri, edge.op.is_some()));
        let backward = hash.with_edge(outer, newv, |edge| (edge.tri, edge.op.is_some()));
        match (forward, backward) {
            (Some((_, true)), Some((_, true))) => {
                let (a, b) = if newv < outer {
                    (outer, newv)
                } else {
                    (newv, outer)
                };
                if let Some(op) = hash.with_edge(a, b, |edge| edge.op.take()).flatten() {
                    self.queue_update(&op, Op::DELETION_PENDING);
                }
                return;
            }
            (Some((_, true)), _) | (_, Some((_, true))) => return,
            _ => {}
        }
        let (a, b, tri) = match (forward, backward) {
            (Some((tri, _)), _) if newv < outer => (newv, outer, tri),
            (_, Some((tri, _))) => (outer, newv, tri),
            _ => return,
        };
        let t = &self.shared.mesh.triangles[tri as usize];
        if let Some(slot) = edge_slot(&t.vertices(), a, b) {
            if t.flags() & FORBIDDEN[slot] != 0 {
                return;
            }
        }
        self.add_op(a, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::assign_triref_bases;
    use crate::config::{DecimationConfig, Flags};
    use crate::engine::testing;
    use crate::topology::CANONICAL;
    use crate::worker::Shared;

    /// Check the triangles, the reference lists and the edge index agree.
    fn check_consistent(shared: &Shared<'_>) {
        let mesh = &shared.mesh;
        let hash = shared.hash.as_ref().unwrap();

        let mut incidence = vec![0usize; mesh.vertices.len()];
        for (index, t) in mesh.triangles.iter().enumerate() {
            if t.is_dead() {
                continue;
            }
            let v = t.vertices();
            for k in 0..3 {
                assert_eq!(
                    mesh.vertex(v[k]).redirect(),
                    CANONICAL,
                    "triangle {index} uses merged vertex {}",
                    v[k]
                );
                incidence[v[k] as usize] += 1;
                let indexed = hash.with_edge(v[k], v[(k + 1) % 3], |edge| edge.tri);
                assert_eq!(indexed, Some(index as u32));
            }
        }
        for (index, vertex) in mesh.vertices.iter().enumerate() {
            assert_eq!(vertex.triref_count(), incidence[index], "vertex {index}");
            for tri in mesh.fan(index as i32) {
                let t = mesh.triangle(tri);
                assert!(!t.is_dead());
                assert!(pivot(&t.vertices(), index as i32).is_some());
            }
        }

        for ((a, b), edge) in hash.entries() {
            let t = mesh.triangle(edge.tri as i32);
            assert!(!t.is_dead());
            assert!(edge_slot(&t.vertices(), a, b).is_some());
            let Some(op) = edge.op else {
                continue;
            };
            assert_eq!(op.endpoints(), (a, b));
            assert_eq!(op.flags() & (Op::DELETED | Op::DELETION_PENDING), 0);
            // a single candidate per undirected edge
            assert_ne!(hash.with_edge(b, a, |twin| twin.op.is_some()), Some(true));
        }
    }

    #[test]
    fn test_concurrent_runs_stay_consistent() {
        for flags in [Flags::NONE, Flags::CONTINUOUS_UPDATE] {
            let n = 48;
            let (mut vertices, mut indices) = testing::grid(n, 1e-3);
            let config = DecimationConfig::default()
                .with_thread_count(4)
                .with_sync_step_count(8)
                .with_flags(flags);
            let op = testing::operation(&mut vertices, &mut indices)
                .with_strength(1.0)
                .with_config(config);
            let shared = testing::prepare(&op);
            assert_eq!(shared.threads, 4);
            let totals = testing::run(&shared);
            assert!(totals.decimations > 0);
            assert_eq!(totals.collisions, 0);

            let live = shared.mesh.triangles.iter().filter(|t| !t.is_dead()).count();
            assert!(live < 2 * n * n);
            check_consistent(&shared);
        }
    }

    #[test]
    fn test_collapse_retires_old_candidates() {
        let n = 4;
        let (mut vertices, mut indices) = testing::grid(n, 1e-3);
        let op = testing::operation(&mut vertices, &mut indices)
            .with_strength(1.0)
            .with_config(DecimationConfig::default().with_thread_count(1));
        let shared = testing::prepare(&op);
        let mesh = &shared.mesh;
        let hash = shared.hash.as_ref().unwrap();

        let mut worker = Worker::new(0, &shared);
        worker.init_vertices();
        worker.init_triangles();
        assign_triref_bases(mesh);
        worker.build_trirefs();
        worker.populate_queue();
        check_consistent(&shared);

        // the diagonal from (2, 2) to (3, 3)
        let (a, b) = (12, 18);
        let candidate = hash.with_edge(a, b, |edge| edge.op.clone()).flatten().unwrap();
        let (v0, v1) = worker
            .locks
            .resolve(mesh, &shared.global_lock, &candidate, true);
        assert_eq!((v0, v1), (a, b));
        assert!(worker.collision_free(v0, v1));
        let point = candidate.state().point;
        assert!(worker.collapse(v0, v1, &point));
        worker.locks.unlock_all(mesh);
        worker.flush_updates();

        assert_eq!(mesh.vertex(b).redirect(), a);
        assert_eq!(mesh.vertex(b).triref_count(), 0);
        assert_eq!(mesh.triangles.iter().filter(|t| !t.is_dead()).count(), 2 * n * n - 2);
        assert_ne!(candidate.flags() & Op::DELETED, 0);
        assert!(!worker.queue.contains(candidate.slot));

        // every older candidate is either gone or indexed under live endpoints
        for op in &worker.ops {
            if op.flags() & Op::DELETED != 0 {
                continue;
            }
            let (v0, v1) = op.endpoints();
            assert_eq!(mesh.vertex(v0).redirect(), CANONICAL);
            assert_eq!(mesh.vertex(v1).redirect(), CANONICAL);
            let indexed = hash.with_edge(v0, v1, |edge| edge.op.clone()).flatten();
            assert!(indexed.is_some_and(|other| Arc::ptr_eq(&other, op)));
        }
        check_consistent(&shared);
    }
}
