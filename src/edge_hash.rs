//! Paged open addressing index from directed edges to their triangle and
//! collapse candidate.

use std::sync::{Mutex, MutexGuard, PoisonError};

use ahash::RandomState;
use tracing::debug;

use crate::error::{DecimateError, DecimateResult};

/// Extra bits over `log2(edge_count)` for the preferred table size.
const HASH_EXTRA_BITS: f64 = 2.0;
const MIN_HASH_BITS: u32 = 12;
const DEFAULT_PAGE_SHIFT: u32 = 7;

/// Payload stored for one directed edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge<V> {
    pub tri: u32,
    pub op: Option<V>,
}

#[derive(Debug, Clone)]
struct Slot<V> {
    key: (i32, i32),
    home: u32,
    edge: Edge<V>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// The directed edge is already indexed.
    Exists,
    /// The page the edge hashes to has no free slot left.
    Full,
}

/// Fixed capacity edge index.
///
/// The table is split into pages of `1 << page_shift` slots. A key only ever
/// lives in the page picked by the high bits of its hash, so each page is an
/// independent linear probing table behind its own lock.
pub struct EdgeHash<V> {
    pages: Vec<Mutex<Vec<Option<Slot<V>>>>>,
    page_mask: usize,
    slot_mask: usize,
    hasher: RandomState,
}

/// Chosen table geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashLayout {
    pub hash_bits: u32,
    pub page_shift: u32,
}

impl HashLayout {
    pub fn entries(&self) -> usize {
        1usize << self.hash_bits
    }

    pub fn pages(&self) -> usize {
        1usize << (self.hash_bits - self.page_shift)
    }

    /// Rough memory footprint of a table of `V` payloads.
    pub fn bytes<V>(&self) -> usize {
        self.entries() * std::mem::size_of::<Option<Slot<V>>>()
            + self.pages() * std::mem::size_of::<Mutex<Vec<Option<Slot<V>>>>>()
    }

    /// Pick the hash table size for a mesh.
    ///
    /// Parameters
    /// ------------
    /// triangle_count
    ///   Triangles in the mesh, three directed edges each.
    /// mesh_bytes
    ///   Memory already committed to vertices, triangles and trirefs.
    /// max_memory
    ///   Optional ceiling for the table plus the mesh.
    ///
    /// Returns
    /// ------------
    /// layout
    ///   The largest table in the allowed range that fits the budget.
    pub fn for_mesh<V>(
        triangle_count: usize,
        mesh_bytes: usize,
        max_memory: Option<usize>,
    ) -> DecimateResult<Self> {
        let edge_count = (3 * triangle_count).max(1) as f64;
        let log = edge_count.log2();
        let bits_min = log.floor() as u32 + 1;
        let bits_max = bits_min + 4;
        let mut hash_bits = ((log + HASH_EXTRA_BITS).round() as u32)
            .clamp(bits_min, bits_max)
            .max(MIN_HASH_BITS);
        let page_shift = DEFAULT_PAGE_SHIFT.clamp(3, 16);

        loop {
            if hash_bits < bits_min {
                let layout = HashLayout {
                    hash_bits: bits_min,
                    page_shift: page_shift.min(bits_min),
                };
                return Err(DecimateError::MemoryBudget {
                    required: required_bytes(layout.bytes::<V>(), mesh_bytes),
                    budget: max_memory.unwrap_or(usize::MAX),
                });
            }
            let layout = HashLayout {
                hash_bits,
                page_shift: page_shift.min(hash_bits),
            };
            let required = required_bytes(layout.bytes::<V>(), mesh_bytes);
            match max_memory {
                Some(budget) if required > budget => hash_bits -= 1,
                _ => {
                    debug!(
                        hash_bits,
                        page_shift = layout.page_shift,
                        required,
                        "sized edge index"
                    );
                    return Ok(layout);
                }
            }
        }
    }
}

fn required_bytes(hash_bytes: usize, mesh_bytes: usize) -> usize {
    let total = hash_bytes.saturating_add(mesh_bytes);
    total.saturating_add(total / 4)
}

fn lock_page<T>(page: &Mutex<T>) -> MutexGuard<'_, T> {
    page.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<V: Clone> EdgeHash<V> {
    pub fn new(layout: HashLayout) -> Self {
        let page_size = 1usize << layout.page_shift;
        let pages = (0..layout.pages())
            .map(|_| Mutex::new(vec![None; page_size]))
            .collect();
        EdgeHash {
            pages,
            page_mask: layout.pages() - 1,
            slot_mask: page_size - 1,
            // fixed seeds keep runs reproducible
            hasher: RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        }
    }

    fn locate(&self, v0: i32, v1: i32) -> (&Mutex<Vec<Option<Slot<V>>>>, usize) {
        let hash = self.hasher.hash_one((v0, v1));
        let page = ((hash >> 32) as usize) & self.page_mask;
        (&self.pages[page], (hash as usize) & self.slot_mask)
    }

    /// Probe position of `key`, or `Err` with the first free slot.
    fn probe(
        slots: &[Option<Slot<V>>],
        home: usize,
        mask: usize,
        key: (i32, i32),
    ) -> Result<usize, Option<usize>> {
        let mut index = home;
        for _ in 0..slots.len() {
            match &slots[index] {
                Some(slot) if slot.key == key => return Ok(index),
                Some(_) => index = (index + 1) & mask,
                None => return Err(Some(index)),
            }
        }
        Err(None)
    }

    /// Index a new directed edge.
    pub fn insert(&self, v0: i32, v1: i32, tri: u32, op: Option<V>) -> Result<(), InsertError> {
        let (page, home) = self.locate(v0, v1);
        let mut slots = lock_page(page);
        match Self::probe(&slots, home, self.slot_mask, (v0, v1)) {
            Ok(_) => Err(InsertError::Exists),
            Err(None) => Err(InsertError::Full),
            Err(Some(free)) => {
                slots[free] = Some(Slot {
                    key: (v0, v1),
                    home: home as u32,
                    edge: Edge { tri, op },
                });
                Ok(())
            }
        }
    }

    /// Remove a directed edge, returning what it held.
    pub fn remove(&self, v0: i32, v1: i32) -> Option<Edge<V>> {
        let (page, home) = self.locate(v0, v1);
        let mut slots = lock_page(page);
        let mask = self.slot_mask;
        let mut hole = Self::probe(&slots, home, mask, (v0, v1)).ok()?;
        let removed = slots[hole].take().map(|slot| slot.edge);

        // backward shift so later probes never stop at the hole
        let mut index = (hole + 1) & mask;
        while let Some(slot) = &slots[index] {
            let home = slot.home as usize;
            let distance_hole = hole.wrapping_sub(home) & mask;
            let distance_index = index.wrapping_sub(home) & mask;
            if distance_hole < distance_index {
                slots[hole] = slots[index].take();
                hole = index;
            }
            index = (index + 1) & mask;
        }
        removed
    }

    /// Copy of the payload of a directed edge.
    #[cfg(test)]
    pub fn get(&self, v0: i32, v1: i32) -> Option<Edge<V>> {
        self.with_edge(v0, v1, |edge| edge.clone())
    }

    pub fn contains(&self, v0: i32, v1: i32) -> bool {
        self.with_edge(v0, v1, |_| ()).is_some()
    }

    /// Run `f` on the entry of a directed edge while its page is locked.
    pub fn with_edge<R>(&self, v0: i32, v1: i32, f: impl FnOnce(&mut Edge<V>) -> R) -> Option<R> {
        let (page, home) = self.locate(v0, v1);
        let mut slots = lock_page(page);
        let index = Self::probe(&slots, home, self.slot_mask, (v0, v1)).ok()?;
        slots[index].as_mut().map(|slot| f(&mut slot.edge))
    }

    /// Attach a candidate to an indexed edge, false if the edge is missing.
    pub fn set_op(&self, v0: i32, v1: i32, op: V) -> bool {
        self.with_edge(v0, v1, |edge| edge.op = Some(op)).is_some()
    }

    /// Copy of every indexed edge.
    #[cfg(test)]
    pub fn entries(&self) -> Vec<((i32, i32), Edge<V>)> {
        self.pages
            .iter()
            .flat_map(|page| {
                lock_page(page)
                    .iter()
                    .flatten()
                    .map(|slot| (slot.key, slot.edge.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of occupied slots, walks every page.
    pub fn len(&self) -> usize {
        self.pages
            .iter()
            .map(|page| lock_page(page).iter().filter(|s| s.is_some()).count())
            .sum()
    }
}
