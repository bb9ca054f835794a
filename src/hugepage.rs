// Hugepage acquisition and indexing.
//
// Hugepages are files in a per-process subdirectory of the hugetlbfs
// mount, mapped into the process, bound to a NUMA node, faulted in,
// pinned, and translated to their physical base exactly once. Every
// live hugepage is mirrored into a small hash table keyed by
// `vaddr >> hugepage_bits` so the free and translation paths can find
// the owning descriptor from any interior address.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};

use crate::crit;
use crate::error::{NvmeError, Result};
use crate::manager::MemConfig;
use crate::sync::{AtomicCounter, AtomicCounter64, Spinlock};
use crate::translate::{Pagemap, PhysAddr};

/// Hugepage hash table geometry.
const HP_HASH_SIZE: usize = 32;
const HP_HASH_MASK: usize = HP_HASH_SIZE - 1;

/// "No preference" NUMA node id.
pub const NODE_ID_ANY: u32 = u32::MAX;

const NO_OWNER: usize = usize::MAX;

/// MPOL_PREFERRED from the kernel mempolicy ABI; glibc does not wrap
/// the mbind syscall.
const MPOL_PREFERRED: libc::c_int = 1;

/// One mapped, pinned hugepage.
///
/// The physical base is resolved at creation and stable until the page
/// is freed; the backing file is unlinked on free.
#[derive(Debug)]
pub struct Hugepage {
    vaddr: usize,
    paddr: PhysAddr,
    size: usize,
    size_bits: u32,
    node_id: u32,
    fd: RawFd,
    fname: String,
    // Pool index and heap id of the heap carved over this page, set
    // when the pool links it. NO_OWNER until then.
    pool_idx: AtomicUsize,
    heap_id: AtomicUsize,
}

impl Hugepage {
    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn size_bits(&self) -> u32 {
        self.size_bits
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Whether `vaddr` falls inside this page.
    pub fn contains(&self, vaddr: usize) -> bool {
        vaddr >= self.vaddr && vaddr < self.vaddr + self.size
    }

    pub(crate) fn set_owner(&self, pool_idx: usize, heap_id: usize) {
        self.pool_idx.store(pool_idx, Ordering::SeqCst);
        self.heap_id.store(heap_id, Ordering::SeqCst);
    }

    pub(crate) fn clear_owner(&self) {
        self.pool_idx.store(NO_OWNER, Ordering::SeqCst);
        self.heap_id.store(NO_OWNER, Ordering::SeqCst);
    }

    pub(crate) fn owner(&self) -> Option<(usize, usize)> {
        let pool = self.pool_idx.load(Ordering::SeqCst);
        let heap = self.heap_id.load(Ordering::SeqCst);
        if pool == NO_OWNER || heap == NO_OWNER {
            None
        } else {
            Some((pool, heap))
        }
    }
}

struct HashTable {
    buckets: [Vec<Arc<Hugepage>>; HP_HASH_SIZE],
}

/// Hugepage manager: mount discovery, per-process directory, page
/// allocation and the address index.
pub struct HugepageMgr {
    dir: PathBuf,
    hp_size: usize,
    hp_size_bits: u32,
    // Monotonic counter embedded in hugepage file names.
    seq: AtomicCounter64,
    nr_hp: AtomicCounter,
    table: Spinlock<HashTable>,
}

/// First mount of the wanted filesystem type in a mounts-file listing.
/// The type is the third whitespace-separated column.
fn find_mount(mounts: &str, fstype: &str) -> Option<PathBuf> {
    for line in mounts.lines() {
        let mut cols = line.split_whitespace().skip(1);
        let dir = match cols.next() {
            Some(d) => d,
            None => continue,
        };
        if cols.next() == Some(fstype) {
            return Some(PathBuf::from(dir));
        }
    }
    None
}

/// Parse a size with an optional unit suffix ("2048 kB", "2 MB", "512").
fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let value: usize = s[..split].parse().ok()?;
    let mult = match s[split..].trim() {
        "" | "B" => 1,
        "k" | "kB" | "KB" => 1024,
        "m" | "mB" | "MB" => 1024 * 1024,
        "g" | "gB" | "GB" => 1024 * 1024 * 1024,
        _ => return None,
    };
    Some(value * mult)
}

/// Hugepage size advertised by the meminfo file.
fn parse_meminfo_hugepage_size(meminfo: &str) -> Option<usize> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("Hugepagesize:"))
        .and_then(parse_size)
}

/// Map one hugepage worth of `fd`, hugepage-aligned.
///
/// hugetlbfs returns naturally aligned mappings; plain filesystems (the
/// test override path) do not, and the hash key `vaddr >> size_bits`
/// only stays constant across the page when the base is aligned. The
/// realignment reserves twice the size, fixes the file mapping at the
/// aligned address inside the reservation, and trims the slack.
fn map_aligned(fd: RawFd, size: usize) -> Result<usize> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        error!("mmap hugepage failed: {}", std::io::Error::last_os_error());
        return Err(NvmeError::oom("hugepage mmap failed"));
    }
    let addr = ptr as usize;
    if addr & (size - 1) == 0 {
        return Ok(addr);
    }

    unsafe {
        libc::munmap(ptr, size);
    }
    let span = size * 2;
    let reserve = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            span,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if reserve == libc::MAP_FAILED {
        error!(
            "mmap alignment reservation failed: {}",
            std::io::Error::last_os_error()
        );
        return Err(NvmeError::oom("hugepage mmap failed"));
    }
    let base = reserve as usize;
    let aligned = (base + size - 1) & !(size - 1);
    let fixed = unsafe {
        libc::mmap(
            aligned as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_FIXED,
            fd,
            0,
        )
    };
    if fixed == libc::MAP_FAILED {
        error!(
            "fixed hugepage mmap failed: {}",
            std::io::Error::last_os_error()
        );
        unsafe {
            libc::munmap(reserve, span);
        }
        return Err(NvmeError::oom("hugepage mmap failed"));
    }

    let pre = aligned - base;
    if pre > 0 {
        unsafe {
            libc::munmap(base as *mut libc::c_void, pre);
        }
    }
    let post = span - pre - size;
    if post > 0 {
        unsafe {
            libc::munmap((aligned + size) as *mut libc::c_void, post);
        }
    }
    Ok(aligned)
}

/// Apply a preferred-node policy to the mapped range; the node mask is
/// empty for "any", which leaves placement to the kernel.
fn bind_to_node(addr: usize, len: usize, node_id: u32) -> Result<()> {
    let mask: libc::c_ulong = if node_id == NODE_ID_ANY {
        0
    } else {
        1 << node_id
    };
    let maxnode: libc::c_ulong = if node_id == NODE_ID_ANY {
        0
    } else {
        8 * std::mem::size_of::<libc::c_ulong>() as libc::c_ulong
    };

    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr,
            len,
            MPOL_PREFERRED,
            &mask as *const libc::c_ulong,
            maxnode,
            0,
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            // Kernels without NUMA support and seccomp sandboxes reject
            // the syscall outright; placement is moot there.
            Some(libc::ENOSYS) | Some(libc::EPERM) => {
                warn!("mbind unavailable, skipping NUMA placement: {}", err);
            }
            _ => {
                error!("mbind {:#x} to node {} failed: {}", addr, node_id, err);
                return Err(NvmeError::oom("hugepage node binding failed"));
            }
        }
    }
    Ok(())
}

impl HugepageMgr {
    /// Locate the hugepage filesystem, create the per-process
    /// subdirectory and determine the hugepage size.
    pub fn new(cfg: &MemConfig) -> Result<Self> {
        let mount = match &cfg.mount_override {
            Some(dir) => dir.clone(),
            None => {
                let mounts = fs::read_to_string(&cfg.mounts_file)
                    .map_err(|_| NvmeError::env(format!("{}", cfg.mounts_file.display())))?;
                find_mount(&mounts, &cfg.hugetlbfs_type)
                    .ok_or_else(|| NvmeError::env(format!("{} mount", cfg.hugetlbfs_type)))?
            }
        };
        debug!("hugepage filesystem at {}", mount.display());

        let hp_size = match cfg.hugepage_size {
            Some(size) => size,
            None => {
                let meminfo = fs::read_to_string(&cfg.meminfo_file)
                    .map_err(|_| NvmeError::env(format!("{}", cfg.meminfo_file.display())))?;
                parse_meminfo_hugepage_size(&meminfo)
                    .ok_or_else(|| NvmeError::env("meminfo Hugepagesize entry"))?
            }
        };
        if hp_size == 0 || !hp_size.is_power_of_two() {
            return Err(NvmeError::invalid(format!(
                "hugepage size {} is not a power of two",
                hp_size
            )));
        }

        let dir = tempfile::Builder::new()
            .prefix(&format!("rusty-nvme.{}.", process::id()))
            .tempdir_in(&mount)
            .map_err(|e| {
                error!("create hugepage directory in {} failed: {}", mount.display(), e);
                NvmeError::env(format!("writable {} mount", cfg.hugetlbfs_type))
            })?
            .into_path();
        debug!("using hugepage directory {}", dir.display());

        Ok(Self {
            dir,
            hp_size,
            hp_size_bits: hp_size.trailing_zeros(),
            seq: AtomicCounter64::new(),
            nr_hp: AtomicCounter::new(),
            table: Spinlock::new(HashTable {
                buckets: std::array::from_fn(|_| Vec::new()),
            }),
        })
    }

    pub fn hp_size(&self) -> usize {
        self.hp_size
    }

    pub fn hp_size_bits(&self) -> u32 {
        self.hp_size_bits
    }

    /// Number of hugepages currently allocated.
    pub fn nr_hugepages(&self) -> u32 {
        self.nr_hp.read().max(0) as u32
    }

    /// Allocate one hugepage preferentially on `node_id`.
    ///
    /// On any failure the steps already taken are unwound in reverse
    /// and the error is returned.
    pub fn alloc(&self, node_id: u32, pagemap: &Pagemap) -> Result<Arc<Hugepage>> {
        let fname = format!("{}-{}", process::id(), self.seq.add_return(1));
        let path = self.dir.join(&fname);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .custom_flags(libc::O_LARGEFILE)
            .open(&path)
            .map_err(|e| {
                error!("open hugepage file {} failed: {}", path.display(), e);
                NvmeError::oom("hugepage file creation failed")
            })?;

        // One hugepage per file.
        if let Err(e) = file.set_len(self.hp_size as u64) {
            error!("size hugepage file {} failed: {}", path.display(), e);
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(NvmeError::oom("hugepage file sizing failed"));
        }

        let fd = file.into_raw_fd();
        let unwind = |mapped: Option<usize>| {
            if let Some(vaddr) = mapped {
                unsafe {
                    libc::munmap(vaddr as *mut libc::c_void, self.hp_size);
                }
            }
            unsafe {
                libc::close(fd);
            }
            let _ = fs::remove_file(&path);
        };

        let vaddr = match map_aligned(fd, self.hp_size) {
            Ok(vaddr) => vaddr,
            Err(e) => {
                unwind(None);
                return Err(e);
            }
        };

        if let Err(e) = bind_to_node(vaddr, self.hp_size, node_id) {
            unwind(Some(vaddr));
            return Err(e);
        }

        // Touch every byte: faulting the page in commits the physical
        // allocation on the preferred node.
        unsafe {
            std::ptr::write_bytes(vaddr as *mut u8, 0, self.hp_size);
        }

        if unsafe { libc::mlock(vaddr as *const libc::c_void, self.hp_size) } != 0 {
            error!(
                "mlock hugepage {:#x} failed: {}",
                vaddr,
                std::io::Error::last_os_error()
            );
            unwind(Some(vaddr));
            return Err(NvmeError::oom("hugepage pinning failed"));
        }

        let paddr = match pagemap.translate(vaddr) {
            Ok(paddr) => paddr,
            Err(e) => {
                error!("resolve hugepage {:#x} physical address failed", vaddr);
                unsafe {
                    libc::munlock(vaddr as *const libc::c_void, self.hp_size);
                }
                unwind(Some(vaddr));
                return Err(e);
            }
        };

        let hp = Arc::new(Hugepage {
            vaddr,
            paddr,
            size: self.hp_size,
            size_bits: self.hp_size_bits,
            node_id,
            fd,
            fname,
            pool_idx: AtomicUsize::new(NO_OWNER),
            heap_id: AtomicUsize::new(NO_OWNER),
        });

        let hash = (vaddr >> self.hp_size_bits) & HP_HASH_MASK;
        {
            let mut table = self.table.lock();
            table.buckets[hash].push(Arc::clone(&hp));
            self.nr_hp.inc();
            debug!(
                "allocated hugepage {} ({}, hash {}, {:#x} / {:#x})",
                hp.fname,
                self.nr_hp.read(),
                hash,
                hp.vaddr,
                hp.paddr.as_u64()
            );
        }

        Ok(hp)
    }

    /// Free a hugepage: drop it from the index, then unpin, unmap,
    /// close and unlink. Teardown failures are logged critically and
    /// the remaining steps still run.
    pub fn free(&self, hp: &Arc<Hugepage>) {
        let hash = (hp.vaddr >> self.hp_size_bits) & HP_HASH_MASK;
        {
            let mut table = self.table.lock();
            table.buckets[hash].retain(|entry| !Arc::ptr_eq(entry, hp));
            self.nr_hp.dec();
            debug!(
                "free hugepage {} ({}, {:#x} / {:#x})",
                hp.fname,
                self.nr_hp.read(),
                hp.vaddr,
                hp.paddr.as_u64()
            );
        }

        if unsafe { libc::munlock(hp.vaddr as *const libc::c_void, hp.size) } < 0 {
            crit!(
                "unlock hugepage {} failed: {}",
                hp.fname,
                std::io::Error::last_os_error()
            );
        }
        if unsafe { libc::munmap(hp.vaddr as *mut libc::c_void, hp.size) } < 0 {
            crit!(
                "unmap hugepage {} failed: {}",
                hp.fname,
                std::io::Error::last_os_error()
            );
        }
        if unsafe { libc::close(hp.fd) } < 0 {
            crit!(
                "close hugepage file {} failed: {}",
                hp.fname,
                std::io::Error::last_os_error()
            );
        }
        if let Err(e) = fs::remove_file(self.dir.join(&hp.fname)) {
            crit!("unlink hugepage file {} failed: {}", hp.fname, e);
        }
    }

    /// Descriptor of the hugepage containing `vaddr`, if any.
    pub fn lookup(&self, vaddr: usize) -> Option<Arc<Hugepage>> {
        let hpn = vaddr >> self.hp_size_bits;
        let table = self.table.lock();
        table.buckets[hpn & HP_HASH_MASK]
            .iter()
            .find(|hp| hp.vaddr >> self.hp_size_bits == hpn)
            .cloned()
    }

    /// Free every remaining hugepage and remove the per-process
    /// subdirectory.
    pub fn cleanup(&self) {
        loop {
            let hp = {
                let table = self.table.lock();
                table
                    .buckets
                    .iter()
                    .find_map(|bucket| bucket.first().cloned())
            };
            match hp {
                Some(hp) => self.free(&hp),
                None => break,
            }
        }

        if let Err(e) = fs::remove_dir(&self.dir) {
            crit!(
                "remove hugepage directory {} failed: {}",
                self.dir.display(),
                e
            );
        }
    }
}
