// CPU and NUMA socket enumeration from the kernel topology tree.
//
// The table is built once at startup and is immutable afterwards. A CPU
// is considered present when its topology directory carries a core_id
// file; hot-plug after startup is not tracked.

use std::path::Path;

use log::{debug, error, info};
use once_cell::sync::OnceCell;
use serde::Serialize;

/// Maximum number of CPUs supported.
pub const CPU_MAX: usize = 64;

/// Maximum number of sockets supported.
pub const SOCKET_MAX: usize = 32;

/// Undefined CPU id.
pub const CPU_ID_ANY: u32 = u32::MAX;

/// Undefined socket id.
pub const SOCKET_ID_ANY: u32 = u32::MAX;

/// One hardware thread.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Cpu {
    /// CPU index.
    pub id: u32,
    /// Socket (NUMA node) the CPU sits on.
    pub socket: u32,
    /// Core index within the socket.
    pub core: u32,
    /// Hardware-thread index within the core.
    pub thread: u32,
    /// Whether the CPU is present.
    pub present: bool,
}

/// System CPU information.
#[derive(Debug, Clone, Serialize)]
pub struct CpuTopology {
    cpus: Vec<Cpu>,
    nr_cpus: u32,
    nr_sockets: u32,
    nr_cores: u32,
}

/// Read a single decimal value from a sysfs attribute file.
fn parse_sysfs_value(path: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse::<u32>().ok()
}

impl CpuTopology {
    /// Enumerate the system topology from `/sys`.
    pub fn detect() -> Self {
        Self::from_sysfs_root(Path::new("/sys"))
    }

    /// Enumerate a topology tree rooted at `root` (the directory that
    /// contains `devices/system/...`).
    pub fn from_sysfs_root(root: &Path) -> Self {
        let node_dir = root.join("devices/system/node");
        let cpu_dir = root.join("devices/system/cpu");

        // Socket indices are contiguous from zero; stop at the first gap.
        let mut nr_sockets = 0u32;
        for socket in 0..SOCKET_MAX {
            if !node_dir.join(format!("node{}", socket)).exists() {
                break;
            }
            nr_sockets += 1;
        }

        let mut cpus = Vec::with_capacity(CPU_MAX);
        let mut nr_cpus = 0u32;
        let mut nr_cores = 0u32;

        for id in 0..CPU_MAX as u32 {
            let topo = cpu_dir.join(format!("cpu{}/topology", id));
            if !topo.join("core_id").exists() {
                cpus.push(Cpu {
                    id,
                    socket: 0,
                    core: 0,
                    thread: 0,
                    present: false,
                });
                continue;
            }

            let socket = parse_sysfs_value(&topo.join("physical_package_id")).unwrap_or_else(|| {
                error!("parse {}/physical_package_id failed", topo.display());
                0
            });
            let core = parse_sysfs_value(&topo.join("core_id")).unwrap_or_else(|| {
                error!("parse {}/core_id failed", topo.display());
                0
            });
            let thread = cpus
                .iter()
                .filter(|c| c.present && c.socket == socket && c.core == core)
                .count() as u32;

            debug!(
                "CPU {:02}: socket {:02}, core {:02}, thread {}",
                id, socket, core, thread
            );

            cpus.push(Cpu {
                id,
                socket,
                core,
                thread,
                present: true,
            });
            nr_cpus += 1;
            if thread == 0 {
                nr_cores += 1;
            }
        }

        // Containers and stripped sysfs trees expose no topology at
        // all; synthesize a single-socket layout from the CPU count.
        if nr_cpus == 0 {
            let fallback = num_cpus::get().min(CPU_MAX) as u32;
            cpus.clear();
            for id in 0..CPU_MAX as u32 {
                cpus.push(Cpu {
                    id,
                    socket: 0,
                    core: id,
                    thread: 0,
                    present: id < fallback,
                });
            }
            nr_cpus = fallback;
            nr_cores = fallback;
        }
        if nr_sockets == 0 {
            nr_sockets = 1;
        }

        info!(
            "detected {} CPUs: {} sockets, {} cores, {} threads",
            nr_cpus, nr_sockets, nr_cores, nr_cpus
        );

        Self {
            cpus,
            nr_cpus,
            nr_sockets,
            nr_cores,
        }
    }

    pub fn nr_cpus(&self) -> u32 {
        self.nr_cpus
    }

    pub fn nr_sockets(&self) -> u32 {
        self.nr_sockets
    }

    pub fn nr_cores(&self) -> u32 {
        self.nr_cores
    }

    /// Descriptor of CPU `id`, present or not.
    pub fn cpu(&self, id: u32) -> Option<&Cpu> {
        self.cpus.get(id as usize)
    }

    /// Descriptor of the CPU the caller runs on.
    ///
    /// When the thread is not pinned, the answer is only a snapshot. An
    /// out-of-range index from the kernel yields `None`.
    pub fn current_cpu(&self) -> Option<&Cpu> {
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 {
            error!(
                "sched_getcpu failed: {}",
                std::io::Error::last_os_error()
            );
            return None;
        }
        self.cpus.get(cpu as usize).filter(|c| c.present)
    }
}

static TOPOLOGY: OnceCell<CpuTopology> = OnceCell::new();

/// The process-wide topology, detected on first use.
pub fn topology() -> &'static CpuTopology {
    TOPOLOGY.get_or_init(CpuTopology::detect)
}

/// CPU id of the caller, or `CPU_ID_ANY`.
pub fn current_cpu_id() -> u32 {
    topology().current_cpu().map(|c| c.id).unwrap_or(CPU_ID_ANY)
}

/// Socket id of the caller, or `SOCKET_ID_ANY`.
pub fn current_socket_id() -> u32 {
    topology()
        .current_cpu()
        .map(|c| c.socket)
        .unwrap_or(SOCKET_ID_ANY)
}

/// Number of sockets in the system.
pub fn socket_count() -> u32 {
    topology().nr_sockets()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_cpu(root: &Path, id: u32, pkg: u32, core: u32) {
        let topo = root.join(format!("devices/system/cpu/cpu{}/topology", id));
        fs::create_dir_all(&topo).unwrap();
        fs::write(topo.join("physical_package_id"), format!("{}\n", pkg)).unwrap();
        fs::write(topo.join("core_id"), format!("{}\n", core)).unwrap();
    }

    fn write_node(root: &Path, id: u32) {
        fs::create_dir_all(root.join(format!("devices/system/node/node{}", id))).unwrap();
    }

    #[test]
    fn test_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_node(root, 0);
        write_node(root, 1);
        // Socket 0 core 0 with two hardware threads, one core each on
        // socket 1.
        write_cpu(root, 0, 0, 0);
        write_cpu(root, 1, 0, 0);
        write_cpu(root, 2, 1, 0);
        write_cpu(root, 3, 1, 1);

        let topo = CpuTopology::from_sysfs_root(root);
        assert_eq!(topo.nr_sockets(), 2);
        assert_eq!(topo.nr_cpus(), 4);
        assert_eq!(topo.nr_cores(), 3);

        let cpu1 = topo.cpu(1).unwrap();
        assert!(cpu1.present);
        assert_eq!(cpu1.socket, 0);
        assert_eq!(cpu1.thread, 1);

        let cpu3 = topo.cpu(3).unwrap();
        assert_eq!(cpu3.socket, 1);
        assert_eq!(cpu3.thread, 0);

        assert!(!topo.cpu(4).unwrap().present);
    }

    #[test]
    fn test_socket_gap_stops_probe() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_node(root, 0);
        write_node(root, 2); // gap at node1
        write_cpu(root, 0, 0, 0);

        let topo = CpuTopology::from_sysfs_root(root);
        assert_eq!(topo.nr_sockets(), 1);
    }

    #[test]
    fn test_empty_tree_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let topo = CpuTopology::from_sysfs_root(dir.path());
        assert!(topo.nr_cpus() >= 1);
        assert_eq!(topo.nr_sockets(), 1);
        assert_eq!(topo.cpu(0).unwrap().socket, 0);
    }

    #[test]
    fn test_current_cpu_on_host() {
        let topo = CpuTopology::detect();
        // Not pinned, so only check that the query stays in range.
        if let Some(cpu) = topo.current_cpu() {
            assert!(cpu.present);
            assert!((cpu.id as usize) < CPU_MAX);
        }
    }
}
