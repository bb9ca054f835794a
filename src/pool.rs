// Size-classed memory pools over hugepage-backed heaps.
//
// A heap carves one hugepage into equal slots tracked by a bitmap; a
// pool is the set of heaps for one power-of-two size class. Heaps live
// in a pool-owned slot vector and are referenced by stable indices;
// the in-use and full lists hold indices, never pointers. All pool
// mutation happens under the pool mutex.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::crit;
use crate::error::{NvmeError, Result};
use crate::hugepage::{Hugepage, HugepageMgr};
use crate::translate::{Pagemap, PhysAddr};

/// Smallest size class: 2^7 = 128 bytes.
pub const POOL_SIZE_BITS_MIN: u32 = 7;

/// Largest size class: 2^21 = 2 MiB.
pub const POOL_SIZE_BITS_MAX: u32 = 21;

/// Number of size classes, one pool each.
pub const POOL_COUNT: usize = (POOL_SIZE_BITS_MAX - POOL_SIZE_BITS_MIN + 1) as usize;

/// Slot allocation bitmap: one bit per slot, 0 = free, 1 = allocated.
#[derive(Debug)]
pub(crate) struct Bitmap {
    words: Vec<u64>,
    nbits: usize,
}

impl Bitmap {
    pub fn new(nbits: usize) -> Self {
        Self {
            words: vec![0; nbits.div_ceil(64)],
            nbits,
        }
    }

    /// Index of the lowest clear bit, if any.
    pub fn first_zero(&self) -> Option<usize> {
        for (wi, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                let bit = wi * 64 + (!word).trailing_zeros() as usize;
                if bit < self.nbits {
                    return Some(bit);
                }
            }
        }
        None
    }

    pub fn set(&mut self, bit: usize) {
        debug_assert!(bit < self.nbits);
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    pub fn clear(&mut self, bit: usize) {
        debug_assert!(bit < self.nbits);
        self.words[bit / 64] &= !(1 << (bit % 64));
    }

    pub fn test(&self, bit: usize) -> bool {
        debug_assert!(bit < self.nbits);
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Slot allocator over exactly one hugepage.
#[derive(Debug)]
pub(crate) struct Heap {
    hp: Arc<Hugepage>,
    nr_objs: usize,
    nr_free_objs: usize,
    bitmap: Bitmap,
}

impl Heap {
    fn is_empty(&self) -> bool {
        self.nr_free_objs == self.nr_objs
    }

    fn is_full(&self) -> bool {
        self.nr_free_objs == 0
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    nr_objs: usize,
    nr_free_objs: usize,
    // Stable heap storage; freed slots are recycled through free_slots.
    heaps: Vec<Option<Heap>>,
    free_slots: Vec<usize>,
    // Heaps in use but not full, most recently grown first.
    use_list: VecDeque<usize>,
    // Full heaps.
    full_list: Vec<usize>,
}

/// Memory pool for one object size.
pub struct Mempool {
    size: usize,
    size_bits: u32,
    inner: Mutex<PoolInner>,
}

impl Mempool {
    pub fn new(size_bits: u32) -> Self {
        Self {
            size: 1 << size_bits,
            size_bits,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn size_bits(&self) -> u32 {
        self.size_bits
    }

    /// Total and free object counts, per-pool consistent.
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.nr_objs, inner.nr_free_objs)
    }

    /// Allocate one slot, growing the pool by a hugepage on `node_id`
    /// when no heap has room.
    pub fn alloc(
        &self,
        pool_idx: usize,
        node_id: u32,
        mgr: &HugepageMgr,
        pagemap: &Pagemap,
    ) -> Result<(usize, PhysAddr)> {
        let mut inner = self.inner.lock();

        let heap_id = match inner.use_list.front().copied() {
            Some(id) => id,
            None => self.grow(&mut inner, pool_idx, node_id, mgr, pagemap)?,
        };

        let heap = inner.heaps[heap_id]
            .as_mut()
            .expect("in-use list references a vacant heap slot");
        let bit = match heap.bitmap.first_zero() {
            Some(bit) => bit,
            None => {
                crit!(
                    "no free slot in heap of pool {} B ({} / {})",
                    self.size,
                    heap.nr_free_objs,
                    heap.nr_objs
                );
                return Err(NvmeError::oom("pool heap bitmap exhausted"));
            }
        };

        heap.bitmap.set(bit);
        heap.nr_free_objs -= 1;
        let ofst = bit << self.size_bits;
        let vaddr = heap.hp.vaddr() + ofst;
        let paddr = heap.hp.paddr().offset(ofst);
        let full = heap.is_full();

        inner.nr_free_objs -= 1;
        if full {
            inner.use_list.pop_front();
            inner.full_list.push(heap_id);
        }

        debug!(
            "pool {} B: allocated slot {:#x} (heap {} bit {}), {} / {} in use",
            self.size,
            vaddr,
            heap_id,
            bit,
            inner.nr_objs - inner.nr_free_objs,
            inner.nr_objs
        );

        Ok((vaddr, paddr))
    }

    /// Return the slot at `vaddr` to the heap recorded on its
    /// hugepage. Usage violations are logged critically and leave the
    /// pool untouched.
    pub fn free(&self, mgr: &HugepageMgr, hp: &Arc<Hugepage>, heap_id: usize, vaddr: usize) {
        let mut inner = self.inner.lock();

        let heap_matches = inner.heaps.get(heap_id).map_or(false, |slot| {
            slot.as_ref().is_some_and(|heap| Arc::ptr_eq(&heap.hp, hp))
        });
        if !heap_matches {
            crit!(
                "free of {:#x} against a heap that no longer exists",
                vaddr
            );
            return;
        }

        if !hp.contains(vaddr) {
            crit!(
                "slot {:#x} does not belong to hugepage {:#x} + {}",
                vaddr,
                hp.vaddr(),
                hp.size()
            );
            return;
        }

        let heap = inner.heaps[heap_id].as_mut().expect("checked above");
        let bit = (vaddr - hp.vaddr()) >> self.size_bits;
        if heap.is_empty() || !heap.bitmap.test(bit) {
            crit!(
                "double free on slot {:#x} in pool {} B ({} / {})",
                vaddr,
                self.size,
                heap.nr_free_objs,
                heap.nr_objs
            );
            return;
        }

        heap.bitmap.clear(bit);
        let was_full = heap.is_full();
        heap.nr_free_objs += 1;
        let now_empty = heap.is_empty();
        inner.nr_free_objs += 1;

        if was_full {
            inner.full_list.retain(|&id| id != heap_id);
            inner.use_list.push_front(heap_id);
        }

        debug!(
            "pool {} B: freed slot {:#x} (heap {} bit {}), {} / {} in use",
            self.size,
            vaddr,
            heap_id,
            bit,
            inner.nr_objs - inner.nr_free_objs,
            inner.nr_objs
        );

        if now_empty {
            self.shrink(&mut inner, mgr, false);
        }
    }

    /// Force-release everything, including the cached empty heap.
    pub fn cleanup(&self, mgr: &HugepageMgr) {
        let mut inner = self.inner.lock();
        while let Some(id) = inner.full_list.pop() {
            inner.use_list.push_front(id);
        }
        self.shrink(&mut inner, mgr, true);
    }

    /// Add a heap backed by a fresh hugepage on `node_id`; the heap
    /// lands at the head of the in-use list.
    fn grow(
        &self,
        inner: &mut PoolInner,
        pool_idx: usize,
        node_id: u32,
        mgr: &HugepageMgr,
        pagemap: &Pagemap,
    ) -> Result<usize> {
        let hp = mgr.alloc(node_id, pagemap)?;
        let nr_objs = hp.size() >> self.size_bits;
        let heap = Heap {
            hp: Arc::clone(&hp),
            nr_objs,
            nr_free_objs: nr_objs,
            bitmap: Bitmap::new(nr_objs),
        };

        let heap_id = match inner.free_slots.pop() {
            Some(id) => {
                inner.heaps[id] = Some(heap);
                id
            }
            None => {
                inner.heaps.push(Some(heap));
                inner.heaps.len() - 1
            }
        };
        hp.set_owner(pool_idx, heap_id);

        inner.use_list.push_front(heap_id);
        inner.nr_objs += nr_objs;
        inner.nr_free_objs += nr_objs;

        debug!(
            "pool {} B: created heap {} with {} slots ({} heaps)",
            self.size,
            heap_id,
            nr_objs,
            inner.use_list.len() + inner.full_list.len()
        );

        Ok(heap_id)
    }

    /// Free empty heaps from the in-use list, keeping the first empty
    /// one as a cache against churn. `force` frees every heap and
    /// warns when one still has outstanding slots.
    fn shrink(&self, inner: &mut PoolInner, mgr: &HugepageMgr, force: bool) {
        let candidates: Vec<usize> = inner.use_list.iter().copied().collect();
        let mut empties_seen = 0;

        for heap_id in candidates {
            let (empty, outstanding) = {
                let heap = inner.heaps[heap_id].as_ref().expect("listed heap exists");
                (heap.is_empty(), heap.nr_objs - heap.nr_free_objs)
            };

            if !force {
                if empty {
                    empties_seen += 1;
                }
                if !empty || empties_seen == 1 {
                    continue;
                }
            }

            if !empty {
                warn!(
                    "pool {} B: freeing heap {} with {} slots still in use",
                    self.size, heap_id, outstanding
                );
            }

            let heap = inner.heaps[heap_id].take().expect("listed heap exists");
            inner.use_list.retain(|&id| id != heap_id);
            inner.free_slots.push(heap_id);
            inner.nr_objs -= heap.nr_objs;
            inner.nr_free_objs -= heap.nr_free_objs;

            heap.hp.clear_owner();
            mgr.free(&heap.hp);

            debug!(
                "pool {} B: freed heap {} ({} heaps left)",
                self.size,
                heap_id,
                inner.use_list.len() + inner.full_list.len()
            );
        }
    }
}
