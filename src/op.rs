//! Collapse candidates and the buffers that defer their recomputation.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nalgebra::Point3;

/// Most buffers any owner splits its incoming updates across.
const MAX_BUFFERS_PER_OWNER: usize = 8;

/// Cost and target of a candidate, rewritten whenever a neighbor changes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpState {
    pub point: Point3<f64>,
    pub value: f64,
    pub penalty: f64,
    pub cost: f64,
}

impl Default for OpState {
    fn default() -> Self {
        OpState {
            point: Point3::origin(),
            value: 0.0,
            penalty: 0.0,
            cost: 0.0,
        }
    }
}

/// A candidate edge collapse.
///
/// Endpoints may be stale: a vertex merged away since the candidate was
/// queued has to be followed through its redirect before use.
#[derive(Debug)]
pub(crate) struct Op {
    flags: AtomicU32,
    v0: AtomicI32,
    v1: AtomicI32,
    /// Worker whose queue holds this candidate.
    pub owner: usize,
    /// Handle of the candidate in its owner's queue.
    pub slot: u32,
    state: Mutex<OpState>,
}

impl Op {
    /// Not in the queue, either denied or above the cost ceiling.
    pub const DETACHED: u32 = 0x1;
    /// One of the triangles of the edge was removed.
    pub const DELETION_PENDING: u32 = 0x2;
    /// Sitting in an update buffer.
    pub const UPDATE_QUEUED: u32 = 0x4;
    /// Cost has to be recomputed before the candidate can be trusted.
    pub const UPDATE_NEEDED: u32 = 0x8;
    /// Terminal.
    pub const DELETED: u32 = 0x10;

    pub fn new(owner: usize, slot: u32, v0: i32, v1: i32) -> Self {
        Op {
            flags: AtomicU32::new(0),
            v0: AtomicI32::new(v0),
            v1: AtomicI32::new(v1),
            owner,
            slot,
            state: Mutex::new(OpState::default()),
        }
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn set_flags(&self, bits: u32) -> u32 {
        self.flags.fetch_or(bits, Ordering::AcqRel)
    }

    /// Keep only the bits of `mask`, returning the previous flags.
    pub fn mask_flags(&self, mask: u32) -> u32 {
        self.flags.fetch_and(mask, Ordering::AcqRel)
    }

    pub fn endpoints(&self) -> (i32, i32) {
        (
            self.v0.load(Ordering::Relaxed),
            self.v1.load(Ordering::Relaxed),
        )
    }

    pub fn set_v0(&self, v: i32) {
        self.v0.store(v, Ordering::Relaxed);
    }

    pub fn set_v1(&self, v: i32) {
        self.v1.store(v, Ordering::Relaxed);
    }

    pub fn state(&self) -> MutexGuard<'_, OpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Candidates waiting for their owner to recompute them.
///
/// Every owner has a few buffers so producers on different threads rarely
/// share one.
pub(crate) struct UpdateBuffers {
    owners: Vec<Vec<Mutex<Vec<Arc<Op>>>>>,
    shift: u32,
}

impl UpdateBuffers {
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let mut shift = 0;
        while (threads >> shift) > MAX_BUFFERS_PER_OWNER {
            shift += 1;
        }
        let per_owner = ((threads - 1) >> shift) + 1;
        UpdateBuffers {
            owners: (0..threads)
                .map(|_| (0..per_owner).map(|_| Mutex::new(Vec::new())).collect())
                .collect(),
            shift,
        }
    }

    #[cfg(test)]
    pub fn buffers_per_owner(&self) -> usize {
        self.owners.first().map(Vec::len).unwrap_or(0)
    }

    /// Flag `op` for recomputation and hand it to its owner.
    ///
    /// An op already waiting in a buffer only gets its flags extended.
    pub fn queue(&self, caller: usize, op: &Arc<Op>, extra: u32) {
        let wanted = extra | Op::UPDATE_NEEDED;
        let mut flags = op.flags();
        loop {
            if flags & Op::DELETED != 0 {
                return;
            }
            let next = if flags & Op::UPDATE_QUEUED != 0 {
                if flags & wanted == wanted {
                    return;
                }
                flags | wanted
            } else {
                flags | wanted | Op::UPDATE_QUEUED
            };
            match op
                .flags
                .compare_exchange_weak(flags, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if flags & Op::UPDATE_QUEUED != 0 => return,
                Ok(_) => break,
                Err(actual) => flags = actual,
            }
        }
        let buffer = &self.owners[op.owner][caller >> self.shift];
        buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(op));
    }

    /// Move every pending op of `owner` into `into`.
    pub fn drain(&self, owner: usize, into: &mut Vec<Arc<Op>>) {
        for buffer in &self.owners[owner] {
            let mut pending = buffer.lock().unwrap_or_else(PoisonError::into_inner);
            into.append(&mut pending);
        }
    }
}
