// RustyNVMe - userspace NVMe host runtime foundation
//
// The layer a driver needs before it can issue its first read: a
// hugepage-backed DMA-capable allocator with physical address
// translation, CPU/NUMA topology discovery, a level-filtered log sink
// and the low-level synchronization primitives everything above is
// built on. Controller state machines, queue pairs and command
// submission live in the layers on top and only consume the surface
// exported here.
//
// Lifecycle: call `init()` once before any allocation and `cleanup()`
// once after all driver threads have quiesced.

pub mod arch;
pub mod error;
pub mod hugepage;
pub mod logging;
pub mod manager;
pub mod pool;
pub mod sync;
pub mod topology;
pub mod translate;

pub use error::{NvmeError, Result};

pub use hugepage::NODE_ID_ANY;

pub use logging::{log_facility, log_level, set_log_facility, set_log_level, LogFacility, LogLevel};

pub use manager::{
    alloc, cleanup, free, init, init_with_config, malloc, memstat, vtophys, zalloc, DmaBuffer,
    MemConfig, MemStats,
};

pub use topology::{
    current_cpu_id, current_socket_id, socket_count, Cpu, CpuTopology, CPU_ID_ANY, SOCKET_ID_ANY,
};

pub use translate::PhysAddr;
