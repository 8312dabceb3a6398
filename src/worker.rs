//! Worker threads and the state they share.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::barrier::Barrier;
use crate::binsort::BinSort;
use crate::config::Settings;
use crate::edge_hash::EdgeHash;
use crate::engine::VertexAttributes;
use crate::format::{IndexCodec, VertexCodec};
use crate::lock::LockBuffer;
use crate::op::{Op, UpdateBuffers};
use crate::penalty::collapse_penalty;
use crate::quadric::edge_solve;
use crate::status::Stage;
use crate::topology::Mesh;

/// Weight callback for an interior edge, called with the payloads of the
/// two triangles sharing it.
pub type EdgeWeightFn<'a> = &'a (dyn Fn(&[u8], &[u8]) -> f64 + Sync);

/// Caller buffers read while building the mesh.
pub(crate) struct Input<'a> {
    pub vertices: &'a [u8],
    pub vertex_codec: VertexCodec,
    pub indices: &'a [u8],
    pub index_codec: IndexCodec,
    pub triangle_data: Option<(&'a [u8], usize)>,
}

impl Input<'_> {
    pub fn payload(&self, tri: u32) -> &[u8] {
        match self.triangle_data {
            Some((data, size)) => {
                let start = tri as usize * size;
                &data[start..start + size]
            }
            None => &[],
        }
    }
}

/// Counters the coordinator polls for status reports.
#[derive(Debug, Default)]
pub(crate) struct ThreadProgress {
    pub vertices: AtomicUsize,
    pub triangles: AtomicUsize,
    pub trirefs: AtomicUsize,
    pub populated: AtomicUsize,
    pub deleted: AtomicUsize,
}

pub(crate) struct Shared<'a> {
    pub mesh: Mesh,
    pub hash: Option<EdgeHash<Arc<Op>>>,
    pub settings: Settings,
    pub threads: usize,
    pub input: Input<'a>,
    pub edge_weight: Option<EdgeWeightFn<'a>>,
    pub attributes: Option<&'a dyn VertexAttributes>,
    pub updates: UpdateBuffers,
    pub work_barrier: Barrier,
    pub global_barrier: Barrier,
    pub global_lock: Mutex<()>,
    pub progress: Vec<ThreadProgress>,
    pub stage: AtomicU8,
    pub report_status: bool,
    pub queue_enabled: bool,
}

impl Shared<'_> {
    pub fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::Relaxed))
    }

    /// Sum of one progress counter over all workers.
    pub fn total(&self, counter: impl Fn(&ThreadProgress) -> &AtomicUsize) -> usize {
        self.progress
            .iter()
            .map(|p| counter(p).load(Ordering::Relaxed))
            .sum()
    }

    /// Half open range of `count` items handled by worker `id`.
    pub fn partition(&self, id: usize, count: usize) -> std::ops::Range<usize> {
        let per = count / self.threads + 1;
        let start = (id * per).min(count);
        start..(start + per).min(count)
    }
}

/// Totals a worker reports when it exits.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WorkerTotals {
    pub decimations: usize,
    pub collisions: usize,
}

pub(crate) struct Worker<'s, 'a> {
    pub id: usize,
    pub shared: &'s Shared<'a>,
    pub queue: BinSort,
    /// Every candidate this worker owns, indexed by queue handle.
    pub ops: Vec<Arc<Op>>,
    pub locks: LockBuffer,
    pending: Vec<Arc<Op>>,
    /// Triangles gathered while merging two fans.
    pub fan: Vec<i32>,
    pub totals: WorkerTotals,
}

impl<'s, 'a> Worker<'s, 'a> {
    pub fn new(id: usize, shared: &'s Shared<'a>) -> Self {
        Worker {
            id,
            shared,
            queue: BinSort::new(shared.settings.max_cost, shared.mesh.triangles.len()),
            ops: Vec::new(),
            locks: LockBuffer::new(id),
            pending: Vec::new(),
            fan: Vec::new(),
            totals: WorkerTotals::default(),
        }
    }

    pub fn progress(&self) -> &ThreadProgress {
        &self.shared.progress[self.id]
    }

    fn enter(&self, stage: Stage) {
        if self.id == 0 {
            self.shared.stage.store(stage as u8, Ordering::Relaxed);
        }
    }

    /// Thread body, every worker passes the same barriers in the same order.
    pub fn run(mut self) -> WorkerTotals {
        let shared = self.shared;
        if shared.report_status {
            shared.global_barrier.wait();
        }

        self.enter(Stage::BuildVertices);
        self.init_vertices();
        shared.work_barrier.wait();

        self.enter(Stage::BuildTriangles);
        self.init_triangles();
        shared.global_barrier.wait();
        // reference bases are laid out by the coordinator in between
        shared.global_barrier.wait();

        self.enter(Stage::BuildTrirefs);
        self.build_trirefs();
        shared.work_barrier.wait();

        if shared.queue_enabled {
            self.enter(Stage::BuildQueue);
            self.populate_queue();
            shared.work_barrier.wait();

            self.enter(Stage::Decimation);
            self.process_queue();
        }
        debug!(
            thread = self.id,
            decimations = self.totals.decimations,
            ops = self.ops.len(),
            "worker finished"
        );
        shared.global_barrier.wait();
        self.totals
    }

    pub(crate) fn queue_update(&self, op: &Arc<Op>, extra: u32) {
        self.shared.updates.queue(self.id, op, extra);
    }

    /// Create the candidate for the edge `v0 -> v1` and index it.
    pub(crate) fn add_op(&mut self, v0: i32, v1: i32) {
        let shared = self.shared;
        let Some(hash) = shared.hash.as_ref() else {
            return;
        };
        let mesh = &shared.mesh;
        let slot = self.ops.len() as u32;
        let op = Arc::new(Op::new(self.id, slot, v0, v1));

        let (a, b) = (mesh.vertex(v0), mesh.vertex(v1));
        let (point, value) = edge_solve(&a.quadric(), &a.point(), &b.quadric(), &b.point());
        let penalty = collapse_penalty(mesh, v0, v1, &point, &shared.settings);
        let cost = value + penalty.unwrap_or(0.0);
        {
            let mut state = op.state();
            state.point = point;
            state.value = value;
            state.penalty = penalty.unwrap_or(0.0);
            state.cost = cost;
        }
        if penalty.is_some() && cost <= shared.settings.max_cost {
            self.queue.add(slot, cost);
        } else {
            op.set_flags(Op::DETACHED);
        }

        if !hash.set_op(v0, v1, Arc::clone(&op)) {
            error!(v0, v1, "candidate created for an edge that is not indexed");
            self.queue.remove(slot);
            op.set_flags(Op::DETACHED | Op::DELETED);
        }
        self.ops.push(op);
    }

    /// Move `op` in or out of the queue after its cost changed.
    fn sort_op(&mut self, op: &Op, deny: bool) {
        let max_cost = self.shared.settings.max_cost;
        let mut state = op.state();
        let cost = state.value + state.penalty;
        let detached = op.flags() & Op::DETACHED != 0;
        // NaN costs never enter the queue
        if deny || !(cost <= max_cost) {
            if !detached {
                self.queue.remove(op.slot);
                op.set_flags(Op::DETACHED);
            }
        } else if detached {
            self.queue.add(op.slot, cost);
            op.mask_flags(!Op::DETACHED);
        } else if state.cost != cost {
            self.queue.update(op.slot, cost);
        }
        state.cost = cost;
    }

    fn retire_op(&mut self, op: &Op, flags: u32) {
        if flags & Op::DETACHED == 0 {
            self.queue.remove(op.slot);
        }
        op.set_flags(Op::DELETED | Op::DETACHED);
    }

    /// Recompute an owned candidate flagged by a neighboring collapse.
    ///
    /// Its endpoints have to be locked unless it is about to be deleted.
    pub(crate) fn update_op(&mut self, op: &Op, mask: u32) {
        let flags = op.mask_flags(mask);
        if flags & Op::UPDATE_NEEDED == 0 || flags & Op::DELETED != 0 {
            return;
        }
        let (v0, v1) = op.endpoints();
        if flags & Op::DELETION_PENDING != 0 || v0 == v1 {
            self.retire_op(op, flags);
            return;
        }
        let shared = self.shared;
        let point = op.state().point;
        let penalty = collapse_penalty(&shared.mesh, v0, v1, &point, &shared.settings);
        op.state().penalty = penalty.unwrap_or(0.0);
        self.sort_op(op, penalty.is_none());
    }

    /// Recompute every candidate other workers flagged for this one.
    pub(crate) fn flush_updates(&mut self) {
        let shared = self.shared;
        let mut pending = std::mem::take(&mut self.pending);
        shared.updates.drain(self.id, &mut pending);
        let mask = !(Op::UPDATE_QUEUED | Op::UPDATE_NEEDED);
        for op in pending.drain(..) {
            if op.flags() & (Op::DELETION_PENDING | Op::DELETED) != 0 {
                self.update_op(&op, mask);
                continue;
            }
            self.locks
                .resolve(&shared.mesh, &shared.global_lock, &op, false);
            self.update_op(&op, mask);
            self.locks.unlock_all(&shared.mesh);
        }
        self.pending = pending;
    }

    /// Collapse queued candidates under a rising cost ceiling.
    pub(crate) fn process_queue(&mut self) {
        let shared = self.shared;
        let settings = shared.settings;
        let steps = settings.sync_steps;
        let mut step = 1;
        let mut ceiling = settings.max_cost * step as f64 / steps as f64;
        loop {
            if settings.continuous() {
                self.flush_updates();
            }
            let Some(slot) = self.queue.first(ceiling) else {
                if step >= steps {
                    break;
                }
                step += 1;
                ceiling = settings.max_cost * step as f64 / steps as f64;
                shared.work_barrier.wait();
                if !settings.continuous() {
                    self.flush_updates();
                }
                continue;
            };
            let op = Arc::clone(&self.ops[slot as usize]);
            let (v0, v1) = self
                .locks
                .resolve(&shared.mesh, &shared.global_lock, &op, true);

            let flags = op.flags();
            if flags & Op::UPDATE_NEEDED != 0 || v0 == v1 {
                self.update_op(&op, !Op::UPDATE_NEEDED);
                if v0 == v1 && op.flags() & Op::DELETED == 0 {
                    self.retire_op(&op, op.flags());
                }
            } else if !self.collision_free(v0, v1) {
                self.queue.remove(op.slot);
                op.set_flags(Op::DETACHED);
            } else {
                let point = op.state().point;
                if self.collapse(v0, v1, &point) {
                    self.totals.decimations += 1;
                } else {
                    self.queue.remove(op.slot);
                    op.set_flags(Op::DETACHED);
                }
            }
            self.locks.unlock_all(&shared.mesh);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::assign_triref_bases;
    use crate::config::DecimationConfig;
    use crate::engine::testing;

    fn build(worker: &mut Worker<'_, '_>) {
        worker.init_vertices();
        worker.init_triangles();
        assign_triref_bases(&worker.shared.mesh);
        worker.build_trirefs();
    }

    #[test]
    fn test_partition_covers_items() {
        // large enough for three workers
        let (mut vertices, mut indices) = testing::grid(40, 0.0);
        let op = testing::operation(&mut vertices, &mut indices)
            .with_config(DecimationConfig::default().with_thread_count(3));
        let shared = testing::prepare(&op);
        assert_eq!(shared.threads, 3);
        for count in [0, 1, 8, 10] {
            let mut next = 0;
            for id in 0..shared.threads {
                let range = shared.partition(id, count);
                assert_eq!(range.start, next);
                next = range.end;
            }
            assert_eq!(next, count);
        }
    }

    #[test]
    fn test_quad_collapses_once() {
        let (mut vertices, mut indices) = testing::grid(1, 0.0);
        let op = testing::operation(&mut vertices, &mut indices)
            .with_strength(1.0)
            .with_config(
                DecimationConfig::default()
                    .with_thread_count(1)
                    .with_boundary_weight(0.0),
            );
        let shared = testing::prepare(&op);
        let mut worker = Worker::new(0, &shared);
        build(&mut worker);
        worker.populate_queue();
        worker.process_queue();

        // the diagonal takes both triangles, the sides are retired after
        assert_eq!(worker.totals.decimations, 1);
        assert!(shared.mesh.triangles.iter().all(|t| t.is_dead()));
        assert_eq!(worker.queue.len(), 0);
        assert!(worker
            .ops
            .iter()
            .all(|op| op.flags() & (Op::DELETED | Op::DETACHED) != 0));
        assert_eq!(shared.total(|p| &p.deleted), 2);
    }

    #[test]
    fn test_ceiling_detaches_costly_candidates() {
        let (mut vertices, mut indices) = testing::grid(2, 0.0);
        let op = testing::operation(&mut vertices, &mut indices)
            .with_max_cost(1e-3)
            .with_config(DecimationConfig::default().with_thread_count(1));
        let shared = testing::prepare(&op);
        let mut worker = Worker::new(0, &shared);
        build(&mut worker);
        worker.add_op(0, 1);
        let candidate = Arc::clone(&worker.ops[0]);

        candidate.state().value = 1.0;
        worker.sort_op(&candidate, false);
        assert_ne!(candidate.flags() & Op::DETACHED, 0);
        assert!(!worker.queue.contains(candidate.slot));

        candidate.state().value = 0.0;
        worker.sort_op(&candidate, false);
        assert_eq!(candidate.flags() & Op::DETACHED, 0);
        assert!(worker.queue.contains(candidate.slot));

        // a denied move leaves the queue whatever it costs
        worker.sort_op(&candidate, true);
        assert_ne!(candidate.flags() & Op::DETACHED, 0);
        assert!(!worker.queue.contains(candidate.slot));
    }
}
