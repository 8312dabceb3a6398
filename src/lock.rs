//! Per vertex ownership and the lock protocols of the collapse loop.

use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::op::Op;
use crate::topology::{pivot, Mesh, CANONICAL, FREE};

/// Locks a buffer is expected to hold for a typical collapse.
pub(crate) const LOCK_BUFFER_CAPACITY: usize = 512;
/// Failed attempts before a worker takes the global lock.
const ESCALATION_FAILURES: u32 = 16;
/// Busy spins before yielding while waiting on a contended vertex.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Vertices held by one worker.
#[derive(Debug)]
pub(crate) struct LockBuffer {
    thread: i32,
    held: Vec<i32>,
}

impl LockBuffer {
    pub fn new(thread: usize) -> Self {
        LockBuffer {
            thread: thread as i32,
            held: Vec::with_capacity(LOCK_BUFFER_CAPACITY),
        }
    }

    #[cfg(test)]
    pub fn held(&self) -> &[i32] {
        &self.held
    }

    fn acquire(&mut self, mesh: &Mesh, vertex: i32) -> bool {
        let owner = &mesh.vertex(vertex).owner;
        if owner.load(Ordering::Relaxed) == self.thread {
            return true;
        }
        if owner
            .compare_exchange(FREE, self.thread, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.held.push(vertex);
            return true;
        }
        false
    }

    /// Lock `vertex` without waiting, everything held is released on failure.
    pub fn try_lock(&mut self, mesh: &Mesh, vertex: i32) -> bool {
        if self.acquire(mesh, vertex) {
            return true;
        }
        self.unlock_all(mesh);
        false
    }

    /// Lock `vertex`. On contention everything held is released and the call
    /// returns false once the vertex looks free again, so the caller can
    /// retry its whole lock set.
    pub fn lock(&mut self, mesh: &Mesh, vertex: i32) -> bool {
        if self.try_lock(mesh, vertex) {
            return true;
        }
        let owner = &mesh.vertex(vertex).owner;
        let mut spins = 0;
        while owner.load(Ordering::Relaxed) != FREE {
            if spins < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
        false
    }

    pub fn unlock_all(&mut self, mesh: &Mesh) {
        for vertex in self.held.drain(..) {
            let _ = mesh.vertex(vertex).owner.compare_exchange(
                self.thread,
                FREE,
                Ordering::Release,
                Ordering::Relaxed,
            );
        }
    }

    /// Lock the other two vertices of every live triangle around `vertex`.
    fn lock_fan(&mut self, mesh: &Mesh, vertex: i32) -> bool {
        for tri in mesh.fan(vertex) {
            let t = mesh.triangle(tri);
            if t.is_dead() {
                continue;
            }
            let v = t.vertices();
            let Some(k) = pivot(&v, vertex) else {
                continue;
            };
            if !self.lock(mesh, v[(k + 1) % 3]) || !self.lock(mesh, v[(k + 2) % 3]) {
                return false;
            }
        }
        true
    }

    /// Lock the current endpoints of `op`, following redirects.
    ///
    /// With `full` the fans of both endpoints are locked as well, which is
    /// what a collapse needs. Returns the resolved endpoints.
    pub fn resolve(&mut self, mesh: &Mesh, global: &Mutex<()>, op: &Op, full: bool) -> (i32, i32) {
        let mut failures = 0;
        let mut escalated: Option<MutexGuard<'_, ()>> = None;
        loop {
            if failures > ESCALATION_FAILURES && escalated.is_none() {
                self.unlock_all(mesh);
                escalated = Some(global.lock().unwrap_or_else(PoisonError::into_inner));
            }
            let (v0, v1) = op.endpoints();
            if !self.lock(mesh, v0) || !self.lock(mesh, v1) {
                failures += 1;
                continue;
            }
            let redirect = mesh.vertex(v0).redirect();
            if redirect != CANONICAL {
                op.set_v0(redirect);
                continue;
            }
            let redirect = mesh.vertex(v1).redirect();
            if redirect != CANONICAL {
                op.set_v1(redirect);
                continue;
            }
            if full && (!self.lock_fan(mesh, v0) || !self.lock_fan(mesh, v1)) {
                failures += 1;
                continue;
            }
            return (v0, v1);
        }
    }
}
