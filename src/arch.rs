// Architecture-dependent primitives: memory barriers, the spin-wait
// pause hint, the cycle counter and volatile MMIO accessors.
//
// SMP barriers order accesses between CPUs and may degrade to compiler
// barriers on strongly-ordered architectures; the plain mb/wmb/rmb
// variants order accesses against devices and always emit a hardware
// fence.

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
compile_error!("unsupported target architecture");

use std::arch::asm;
use std::sync::atomic::{compiler_fence, Ordering};

/// Cache line size in bytes.
pub const CACHE_LINE_SIZE: usize = 64;

/// Compiler barrier: no instruction emitted, but the compiler may not
/// reorder memory accesses across this point.
#[inline(always)]
pub fn compiler_barrier() {
    compiler_fence(Ordering::SeqCst);
}

/// Full memory barrier: loads and stores issued before the barrier
/// complete before any issued after it.
#[inline(always)]
pub fn mb() {
    unsafe {
        asm!("mfence", options(nostack, preserves_flags));
    }
}

/// Store barrier.
#[inline(always)]
pub fn wmb() {
    unsafe {
        asm!("sfence", options(nostack, preserves_flags));
    }
}

/// Load barrier.
#[inline(always)]
pub fn rmb() {
    unsafe {
        asm!("lfence", options(nostack, preserves_flags));
    }
}

/// Full barrier between CPUs.
#[inline(always)]
pub fn smp_mb() {
    mb();
}

/// Store barrier between CPUs. x86 stores are not reordered against
/// other stores, so a compiler barrier is enough.
#[inline(always)]
pub fn smp_wmb() {
    compiler_barrier();
}

/// Load barrier between CPUs. x86 loads are not reordered against
/// other loads, so a compiler barrier is enough.
#[inline(always)]
pub fn smp_rmb() {
    compiler_barrier();
}

/// Spin-wait hint, to be issued inside busy-wait loops.
#[inline(always)]
pub fn pause() {
    std::hint::spin_loop();
}

/// Cycles elapsed since boot, from the timestamp counter.
#[inline]
pub fn cycles() -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    ((hi as u64) << 32) | lo as u64
}

/// Volatile 32-bit register read.
///
/// # Safety
///
/// `addr` must be valid for a 4-byte aligned volatile read for the
/// duration of the call (typically a mapped device register).
#[inline]
pub unsafe fn mmio_read_4(addr: *const u32) -> u32 {
    std::ptr::read_volatile(addr)
}

/// Volatile 32-bit register write.
///
/// # Safety
///
/// `addr` must be valid for a 4-byte aligned volatile write for the
/// duration of the call.
#[inline]
pub unsafe fn mmio_write_4(addr: *mut u32, val: u32) {
    std::ptr::write_volatile(addr, val);
}

/// Volatile 64-bit register read.
///
/// On targets without 64-bit MMIO the two halves are read separately,
/// lower half first.
///
/// # Safety
///
/// `addr` must be valid for an 8-byte aligned volatile read for the
/// duration of the call.
#[inline]
pub unsafe fn mmio_read_8(addr: *const u64) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        std::ptr::read_volatile(addr)
    }
    #[cfg(target_arch = "x86")]
    {
        let addr32 = addr as *const u32;
        let lo = std::ptr::read_volatile(addr32) as u64;
        let hi = std::ptr::read_volatile(addr32.add(1)) as u64;
        lo | (hi << 32)
    }
}

/// Volatile 64-bit register write.
///
/// On targets without 64-bit MMIO the store is split in two 32-bit
/// stores, lower half first; some DMA engines require that order.
///
/// # Safety
///
/// `addr` must be valid for an 8-byte aligned volatile write for the
/// duration of the call.
#[inline]
pub unsafe fn mmio_write_8(addr: *mut u64, val: u64) {
    #[cfg(target_arch = "x86_64")]
    {
        std::ptr::write_volatile(addr, val);
    }
    #[cfg(target_arch = "x86")]
    {
        let addr32 = addr as *mut u32;
        std::ptr::write_volatile(addr32, val as u32);
        std::ptr::write_volatile(addr32.add(1), (val >> 32) as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barriers_are_callable() {
        compiler_barrier();
        mb();
        wmb();
        rmb();
        smp_mb();
        smp_wmb();
        smp_rmb();
        pause();
    }

    #[test]
    fn test_cycles_advances() {
        let a = cycles();
        for _ in 0..1000 {
            pause();
        }
        let b = cycles();
        assert!(a != 0 || b != 0);
    }

    #[test]
    fn test_mmio_roundtrip() {
        let mut reg32: u32 = 0;
        let mut reg64: u64 = 0;
        unsafe {
            mmio_write_4(&mut reg32, 0xdead_beef);
            assert_eq!(mmio_read_4(&reg32), 0xdead_beef);
            mmio_write_8(&mut reg64, 0x0123_4567_89ab_cdef);
            assert_eq!(mmio_read_8(&reg64), 0x0123_4567_89ab_cdef);
        }
    }
}
