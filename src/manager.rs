// Process-wide memory subsystem: lifecycle, the size-classed public
// allocator and the statistics surface.
//
// There is one DMA allocator per process. `init` builds the singleton
// (page map, hugepage manager, 15 pools) and `cleanup` tears it down;
// both are guarded so the lifecycle cannot run twice concurrently.
// Every other operation runs on the caller's thread against shared
// state.

use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use serde::Serialize;

use crate::crit;
use crate::error::{NvmeError, Result};
use crate::hugepage::{HugepageMgr, NODE_ID_ANY};
use crate::logging;
use crate::pool::{Mempool, POOL_COUNT, POOL_SIZE_BITS_MAX, POOL_SIZE_BITS_MIN};
use crate::topology::{self, SOCKET_MAX};
use crate::translate::{Pagemap, PhysAddr};

/// Kernel interface locations and probing overrides.
///
/// The defaults describe a stock Linux system. The overrides let the
/// allocator run against an arbitrary directory (any filesystem) with
/// a chosen page granule, which is how the test suite exercises the
/// full allocation paths without a hugetlbfs mount.
#[derive(Debug, Clone)]
pub struct MemConfig {
    /// Mount table scanned for the hugepage filesystem.
    pub mounts_file: PathBuf,
    /// Memory-info file carrying the hugepage size.
    pub meminfo_file: PathBuf,
    /// Kernel page map used for physical address translation.
    pub pagemap_file: PathBuf,
    /// Filesystem type selected from the mount table.
    pub hugetlbfs_type: String,
    /// Use this directory instead of scanning the mount table.
    pub mount_override: Option<PathBuf>,
    /// Use this hugepage size instead of reading the memory-info file.
    pub hugepage_size: Option<usize>,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            mounts_file: PathBuf::from("/proc/mounts"),
            meminfo_file: PathBuf::from("/proc/meminfo"),
            pagemap_file: PathBuf::from("/proc/self/pagemap"),
            hugetlbfs_type: "hugetlbfs".to_string(),
            mount_override: None,
            hugepage_size: None,
        }
    }
}

/// Memory usage snapshot. Consistent per pool, not across pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemStats {
    /// Hugepages currently allocated.
    pub nr_hugepages: u32,
    /// Bytes managed across all pools.
    pub total_bytes: u64,
    /// Bytes currently free across all pools.
    pub free_bytes: u64,
}

/// One allocated slot: virtual pointer, bus address and slot length.
///
/// The caller owns the slot contents until `free`; the slot's physical
/// address never changes while it is allocated.
#[derive(Debug)]
pub struct DmaBuffer {
    virt: NonNull<u8>,
    phys: PhysAddr,
    len: usize,
}

// A slot is plain memory handed to the caller; nothing in it is tied
// to the allocating thread.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    pub fn virt(&self) -> NonNull<u8> {
        self.virt
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Slot length: the size class, not the requested size.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the slot as bytes.
    ///
    /// # Safety
    ///
    /// The slot must not have been freed, and the caller must uphold
    /// aliasing for the lifetime of the slice.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.virt.as_ptr(), self.len)
    }

    /// View the slot as mutable bytes.
    ///
    /// # Safety
    ///
    /// Same as [`DmaBuffer::as_slice`], plus exclusive access.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.virt.as_ptr(), self.len)
    }
}

/// Pool index for a request, after rounding to a power of two.
///
/// Classes below the minimum clamp up to the 128-byte pool; requests
/// above the maximum have no pool and fail.
fn size_class(size: usize, align: usize) -> Result<usize> {
    if size == 0 {
        return Err(NvmeError::invalid("zero-size allocation"));
    }
    if align != 0 && !align.is_power_of_two() {
        return Err(NvmeError::invalid(format!(
            "alignment {} is not a power of two",
            align
        )));
    }

    let effective = size.max(align);
    if effective > 1 << POOL_SIZE_BITS_MAX {
        return Err(NvmeError::invalid(format!(
            "no pool for {} B (align {} B)",
            size, align
        )));
    }
    let bits = effective
        .next_power_of_two()
        .trailing_zeros()
        .max(POOL_SIZE_BITS_MIN);
    Ok((bits - POOL_SIZE_BITS_MIN) as usize)
}

/// The memory subsystem singleton.
pub struct MemState {
    pagemap: Pagemap,
    hp: HugepageMgr,
    pools: Vec<Mempool>,
}

impl MemState {
    fn new(cfg: &MemConfig) -> Result<Self> {
        let pagemap = Pagemap::open(&cfg.pagemap_file)?;
        debug!(
            "system page size: {} B (order {})",
            pagemap.page_size(),
            pagemap.page_bits()
        );

        let hp = HugepageMgr::new(cfg)?;
        let pools: Vec<Mempool> = (POOL_SIZE_BITS_MIN..=POOL_SIZE_BITS_MAX)
            .map(Mempool::new)
            .collect();
        debug_assert_eq!(pools.len(), POOL_COUNT);

        Ok(Self { pagemap, hp, pools })
    }

    /// Allocate a DMA-capable slot of at least `size` bytes aligned to
    /// `align`, preferentially on NUMA node `node_id`.
    pub fn alloc(&self, size: usize, align: usize, node_id: u32) -> Result<DmaBuffer> {
        let class = size_class(size, align)?;

        let node_id = if node_id == NODE_ID_ANY || node_id >= topology::socket_count() {
            topology::current_socket_id()
        } else {
            node_id
        };

        debug!(
            "allocate {} B align {} B => pool {} B, node {}",
            size,
            align,
            self.pools[class].size(),
            node_id
        );

        let (vaddr, paddr) = self.pools[class].alloc(class, node_id, &self.hp, &self.pagemap)?;
        let virt = NonNull::new(vaddr as *mut u8)
            .ok_or_else(|| NvmeError::oom("pool returned a null slot"))?;
        Ok(DmaBuffer {
            virt,
            phys: paddr,
            len: self.pools[class].size(),
        })
    }

    /// Allocate and zero a slot.
    pub fn zalloc(&self, size: usize, align: usize, node_id: u32) -> Result<DmaBuffer> {
        let buf = self.alloc(size, align, node_id)?;
        unsafe {
            std::ptr::write_bytes(buf.virt.as_ptr(), 0, buf.len);
        }
        Ok(buf)
    }

    /// Return a slot obtained from `alloc`.
    ///
    /// Unknown addresses and double frees are logged critically and
    /// otherwise ignored.
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let vaddr = ptr as usize;

        let hp = match self.hp.lookup(vaddr) {
            Some(hp) => hp,
            None => {
                crit!("invalid address {:#x} for free", vaddr);
                return;
            }
        };
        let (pool_idx, heap_id) = match hp.owner() {
            Some(owner) => owner,
            None => {
                crit!("free of {:#x} on a hugepage with no heap", vaddr);
                return;
            }
        };

        self.pools[pool_idx].free(&self.hp, &hp, heap_id, vaddr);
    }

    /// Physical address of `vaddr`, fast-pathing hugepage hits.
    pub fn vtophys(&self, vaddr: usize) -> Result<PhysAddr> {
        if let Some(hp) = self.hp.lookup(vaddr) {
            return Ok(hp.paddr().offset(vaddr - hp.vaddr()));
        }
        self.pagemap.translate(vaddr)
    }

    /// Usage statistics. The node argument is validated against the
    /// supported range; pools are not segregated by node, so the sums
    /// cover the whole subsystem.
    pub fn memstat(&self, node_id: u32) -> Result<MemStats> {
        if node_id != NODE_ID_ANY && node_id > SOCKET_MAX as u32 {
            return Err(NvmeError::invalid(format!("unknown node {}", node_id)));
        }

        let mut stats = MemStats {
            nr_hugepages: self.hp.nr_hugepages(),
            total_bytes: 0,
            free_bytes: 0,
        };
        for pool in &self.pools {
            let (nr_objs, nr_free) = pool.stats();
            stats.total_bytes += (nr_objs << pool.size_bits()) as u64;
            stats.free_bytes += (nr_free << pool.size_bits()) as u64;
        }
        Ok(stats)
    }

    fn teardown(&self) {
        for pool in &self.pools {
            pool.cleanup(&self.hp);
        }
        self.hp.cleanup();
    }
}

static MEM: Mutex<Option<Arc<MemState>>> = Mutex::new(None);

/// Initialize the memory subsystem from the default configuration.
pub fn init() -> Result<()> {
    init_with_config(MemConfig::default())
}

/// Initialize the memory subsystem.
///
/// Installs the log sink, establishes the CPU topology and builds the
/// allocator state. Fails without side effects when already
/// initialized.
pub fn init_with_config(cfg: MemConfig) -> Result<()> {
    logging::install();
    let _ = topology::topology();

    let mut slot = MEM.lock();
    if slot.is_some() {
        return Err(NvmeError::AlreadyInitialized);
    }
    let state = MemState::new(&cfg)?;
    *slot = Some(Arc::new(state));
    Ok(())
}

/// Tear the memory subsystem down.
///
/// All user threads must have quiesced: outstanding slots are released
/// (with warnings) and their memory unmapped. A no-op when the
/// subsystem is not initialized.
pub fn cleanup() {
    let state = MEM.lock().take();
    if let Some(state) = state {
        state.teardown();
    }
}

fn instance() -> Result<Arc<MemState>> {
    MEM.lock().clone().ok_or(NvmeError::NotInitialized)
}

/// See [`MemState::alloc`].
pub fn alloc(size: usize, align: usize, node_id: u32) -> Result<DmaBuffer> {
    instance()?.alloc(size, align, node_id)
}

/// Allocate without reporting the physical address.
pub fn malloc(size: usize, align: usize, node_id: u32) -> Result<NonNull<u8>> {
    Ok(instance()?.alloc(size, align, node_id)?.virt())
}

/// Allocate a zeroed slot.
pub fn zalloc(size: usize, align: usize, node_id: u32) -> Result<NonNull<u8>> {
    Ok(instance()?.zalloc(size, align, node_id)?.virt())
}

/// See [`MemState::free`].
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    match instance() {
        Ok(state) => state.free(ptr),
        Err(_) => crit!("free of {:#x} before initialization", ptr as usize),
    }
}

/// See [`MemState::vtophys`].
pub fn vtophys(vaddr: usize) -> Result<PhysAddr> {
    instance()?.vtophys(vaddr)
}

/// See [`MemState::memstat`].
pub fn memstat(node_id: u32) -> Result<MemStats> {
    instance()?.memstat(node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_selection() {
        // Small requests clamp to the 128-byte pool.
        assert_eq!(size_class(1, 0).unwrap(), 0);
        assert_eq!(size_class(64, 0).unwrap(), 0);
        assert_eq!(size_class(128, 0).unwrap(), 0);
        // Power-of-two boundaries.
        assert_eq!(size_class(129, 0).unwrap(), 1);
        assert_eq!(size_class(256, 0).unwrap(), 1);
        assert_eq!(size_class(4096, 0).unwrap(), 5);
        // Alignment dominates when larger than the size.
        assert_eq!(size_class(16, 4096).unwrap(), 5);
        assert_eq!(size_class(1 << 20, 1 << 20).unwrap(), 13);
        // Largest class.
        assert_eq!(size_class(2 * 1024 * 1024, 0).unwrap(), 14);
    }

    #[test]
    fn test_size_class_rejections() {
        assert!(size_class(0, 0).is_err());
        assert!(size_class(64, 3).is_err());
        assert!(size_class(4 * 1024 * 1024, 0).is_err());
        assert!(size_class(2 * 1024 * 1024 + 1, 0).is_err());
    }

    #[test]
    fn test_default_config_paths() {
        let cfg = MemConfig::default();
        assert_eq!(cfg.mounts_file, PathBuf::from("/proc/mounts"));
        assert_eq!(cfg.hugetlbfs_type, "hugetlbfs");
        assert!(cfg.mount_override.is_none());
        assert!(cfg.hugepage_size.is_none());
    }

    #[test]
    fn test_ops_before_init_fail() {
        // The singleton may be live if another test initialized it;
        // only assert when it is not.
        if instance().is_err() {
            assert!(matches!(
                alloc(128, 0, NODE_ID_ANY),
                Err(NvmeError::NotInitialized)
            ));
            assert!(matches!(vtophys(0x1000), Err(NvmeError::NotInitialized)));
            free(std::ptr::null_mut());
        }
    }
}
