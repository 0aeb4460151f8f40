//! Listening-socket enumeration
//!
//! Walks the kernel socket tables and joins each listening socket against an
//! inode→(pid, comm) map built from /proc/<pid>/fd. Resolution failure for a
//! single socket (privilege, or the process exited between the two queries)
//! degrades that entry to `pid: None, process_name: None`; a partial snapshot is
//! always preferred to a failed scan.

use portgate_proto::PortInfo;

/// Enumerates currently-listening sockets
///
/// Stateless; every `scan` call queries the OS afresh. Caching is deliberately
/// absent: a stale snapshot would mislead port-conflict decisions downstream.
#[derive(Debug, Default)]
pub struct PortScanner;

impl PortScanner {
    pub fn new() -> Self {
        Self
    }

    /// Snapshot of all listening TCP sockets and bound UDP sockets
    ///
    /// Entries are unordered and the set may differ in length between calls as
    /// sockets appear and disappear. Never fails; sockets whose owner cannot be
    /// resolved are reported with `None` identity fields.
    pub fn scan(&self) -> Vec<PortInfo> {
        imp::scan()
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use portgate_proto::{PortInfo, Protocol};
    use std::collections::HashMap;
    use tracing::{debug, trace};

    pub fn scan() -> Vec<PortInfo> {
        let inode_owners = inode_owner_map();
        let mut ports = Vec::new();

        // TCP sockets in LISTEN state, v4 and v6 tables
        for table in [procfs::net::tcp(), procfs::net::tcp6()] {
            match table {
                Ok(entries) => {
                    for entry in entries {
                        if entry.state != procfs::net::TcpState::Listen {
                            continue;
                        }
                        ports.push(port_info(
                            entry.local_address.port(),
                            entry.inode,
                            Protocol::Tcp,
                            &inode_owners,
                        ));
                    }
                }
                Err(e) => debug!("Skipping unreadable TCP table: {}", e),
            }
        }

        // UDP has no LISTEN state; every bound socket is reported
        for table in [procfs::net::udp(), procfs::net::udp6()] {
            match table {
                Ok(entries) => {
                    for entry in entries {
                        ports.push(port_info(
                            entry.local_address.port(),
                            entry.inode,
                            Protocol::Udp,
                            &inode_owners,
                        ));
                    }
                }
                Err(e) => debug!("Skipping unreadable UDP table: {}", e),
            }
        }

        trace!(count = ports.len(), "Port scan complete");
        ports
    }

    fn port_info(
        port: u16,
        inode: u64,
        protocol: Protocol,
        owners: &HashMap<u64, (i32, Option<String>)>,
    ) -> PortInfo {
        let owner = owners.get(&inode);
        PortInfo {
            port,
            pid: owner.map(|(pid, _)| *pid),
            process_name: owner.and_then(|(_, name)| name.clone()),
            protocol,
        }
    }

    /// Map socket inodes to the (pid, comm) of the owning process
    ///
    /// Processes we cannot inspect (exited mid-walk, or /proc/<pid>/fd denied)
    /// are silently skipped; a readable fd table with an unreadable stat yields
    /// a pid without a name, left for the process controller to resolve.
    fn inode_owner_map() -> HashMap<u64, (i32, Option<String>)> {
        let mut map = HashMap::new();

        let procs = match procfs::process::all_processes() {
            Ok(procs) => procs,
            Err(e) => {
                debug!("Cannot enumerate processes: {}", e);
                return map;
            }
        };

        for proc in procs.flatten() {
            let pid = proc.pid;
            let name = proc.stat().map(|s| s.comm).ok();

            let Ok(fds) = proc.fd() else {
                continue;
            };
            for fd in fds.flatten() {
                if let procfs::process::FDTarget::Socket(inode) = fd.target {
                    map.insert(inode, (pid, name.clone()));
                }
            }
        }

        map
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use portgate_proto::PortInfo;
    use tracing::warn;

    pub fn scan() -> Vec<PortInfo> {
        warn!("Port scanning is only implemented for Linux; returning empty snapshot");
        Vec::new()
    }
}
