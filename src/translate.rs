// Virtual to physical address translation through the kernel page map.
//
// Hugepage addresses are resolved from the hugepage index instead (the
// manager caches the physical base at creation); this module is the
// slow path and the one-time resolution it relies on.

use std::fmt;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::error;
use serde::Serialize;

use crate::error::{NvmeError, Result};

/// Page-map entries are 8 bytes, indexed by virtual page frame number.
const PFN_ENTRY_SIZE: usize = 8;

/// The physical page frame number occupies bits 0-54 of an entry.
const PFN_MASK: u64 = 0x007f_ffff_ffff_ffff;

/// A physical (bus) address, as consumed by a DMA engine.
///
/// Distinct from virtual pointers on purpose: the only arithmetic a
/// caller may do is offsetting within a single allocation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PhysAddr(u64);

impl PhysAddr {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Address `off` bytes into the allocation this address points at.
    pub const fn offset(self, off: usize) -> Self {
        Self(self.0 + off as u64)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Read-only handle on the kernel page map plus the system page
/// geometry.
#[derive(Debug)]
pub struct Pagemap {
    file: File,
    pg_size: usize,
    pg_bits: u32,
    pg_mask: usize,
}

impl Pagemap {
    /// Open the page map at `path` (normally `/proc/self/pagemap`).
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            error!("open {} failed: {}", path.display(), e);
            NvmeError::env(format!("page map {}", path.display()))
        })?;

        let pg_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if pg_size <= 0 {
            return Err(NvmeError::env("system page size"));
        }
        Ok(Self::with_page_size(file, pg_size as usize))
    }

    pub(crate) fn with_page_size(file: File, pg_size: usize) -> Self {
        debug_assert!(pg_size.is_power_of_two());
        Self {
            file,
            pg_size,
            pg_bits: pg_size.trailing_zeros(),
            pg_mask: pg_size - 1,
        }
    }

    pub fn page_size(&self) -> usize {
        self.pg_size
    }

    pub fn page_bits(&self) -> u32 {
        self.pg_bits
    }

    /// Translate a virtual address by reading its page-map entry.
    ///
    /// Lock-free: each call is an independent positioned read, which
    /// the kernel serializes. Unprivileged readers see a zero frame
    /// number; only the in-page offset survives then.
    pub fn translate(&self, vaddr: usize) -> Result<PhysAddr> {
        let vpn = (vaddr >> self.pg_bits) as u64;
        let mut entry = [0u8; PFN_ENTRY_SIZE];

        match self.file.read_at(&mut entry, vpn * PFN_ENTRY_SIZE as u64) {
            Ok(PFN_ENTRY_SIZE) => {
                let ppfn = u64::from_le_bytes(entry) & PFN_MASK;
                Ok(PhysAddr(
                    (ppfn << self.pg_bits) + (vaddr & self.pg_mask) as u64,
                ))
            }
            Ok(n) => {
                error!("partial page-map entry for pfn {} ({} bytes)", vpn, n);
                Err(NvmeError::TranslationFailed { vaddr })
            }
            Err(e) => {
                error!("page-map read for pfn {} failed: {}", vpn, e);
                Err(NvmeError::TranslationFailed { vaddr })
            }
        }
    }
}
