//! Two phase reusable barrier with a timed wait for the coordinator.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug)]
struct Phase {
    index: usize,
    count: [usize; 2],
}

/// Reusable barrier with two alternating counters.
///
/// A late waiter of one round still sees its own counter at zero while the
/// next round counts down the other one.
#[derive(Debug)]
pub(crate) struct Barrier {
    parties: usize,
    phase: Mutex<Phase>,
    cond: Condvar,
}

impl Barrier {
    pub fn new(parties: usize) -> Self {
        Barrier {
            parties,
            phase: Mutex::new(Phase {
                index: 0,
                count: [parties, parties],
            }),
            cond: Condvar::new(),
        }
    }

    fn enter(&self) -> (MutexGuard<'_, Phase>, usize, bool) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        let index = phase.index;
        phase.count[index] -= 1;
        if phase.count[index] == 0 {
            phase.index ^= 1;
            let next = phase.index;
            phase.count[next] = self.parties;
            self.cond.notify_all();
            return (phase, index, true);
        }
        (phase, index, false)
    }

    /// Block until every party arrived, true for the last one in.
    pub fn wait(&self) -> bool {
        let (mut phase, index, last) = self.enter();
        if last {
            return true;
        }
        while phase.count[index] != 0 {
            phase = self.cond.wait(phase).unwrap_or_else(PoisonError::into_inner);
        }
        false
    }

    /// Wait at most `timeout`. On timeout the arrival is withdrawn and false
    /// is returned, the caller is expected to come back later.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (phase, index, last) = self.enter();
        if last {
            return true;
        }
        let (mut phase, _) = self
            .cond
            .wait_timeout_while(phase, timeout, |p| p.count[index] != 0)
            .unwrap_or_else(PoisonError::into_inner);
        if phase.count[index] == 0 {
            return true;
        }
        phase.count[index] += 1;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_barrier_rounds() {
        let barrier = Barrier::new(4);
        let counter = AtomicUsize::new(0);
        let leaders = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for round in 0..50 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if barrier.wait() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                        // everyone finished the round before anyone moves on
                        assert!(counter.load(Ordering::SeqCst) >= (round + 1) * 4);
                        barrier.wait();
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), 200);
        assert_eq!(leaders.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_barrier_timeout_withdraws() {
        let barrier = Barrier::new(2);
        assert!(!barrier.wait_timeout(Duration::from_millis(5)));
        std::thread::scope(|s| {
            s.spawn(|| barrier.wait());
            let mut polls = 0;
            while !barrier.wait_timeout(Duration::from_millis(5)) {
                polls += 1;
                assert!(polls < 10_000);
            }
        });
    }
}
