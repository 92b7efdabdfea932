//! Local resource sampling for the self node.

use std::collections::BTreeMap;
use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::{Disks, System};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::node::{Lun, MemoryUsage, ResourceSnapshot};

/// Samples this node's resources. Called on every heartbeat.
#[async_trait]
pub trait ResourceSampler: Send + Sync + 'static {
    /// Takes a fresh snapshot. Sampling problems degrade to zeroed fields.
    async fn sample(&self) -> ResourceSnapshot;
}

/// Always returns the same snapshot.
#[derive(Clone, Debug, Default)]
pub struct StaticSampler(pub ResourceSnapshot);

#[async_trait]
impl ResourceSampler for StaticSampler {
    async fn sample(&self) -> ResourceSnapshot {
        self.0.clone()
    }
}

/// Samples CPU, memory and block devices through `sysinfo`.
///
/// CPU usage is measured between consecutive samples, so the first sample
/// reports zero. Reports no containers.
pub struct ProcSampler {
    system: Mutex<System>,
}

impl ProcSampler {
    /// Creates a sampler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn luns() -> BTreeMap<String, Lun> {
        let disks = Disks::new_with_refreshed_list();

        disks
            .list()
            .iter()
            .filter_map(|disk| {
                let device_path = disk.name().to_string_lossy().into_owned();
                if device_path.is_empty() {
                    return None;
                }

                let lun = Lun {
                    device_path: device_path.clone(),
                    size_bytes: disk.total_space(),
                };
                Some((device_path, lun))
            })
            .collect()
    }
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcSampler").finish_non_exhaustive()
    }
}

#[async_trait]
impl ResourceSampler for ProcSampler {
    async fn sample(&self) -> ResourceSnapshot {
        let (cpu, memory) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();

            let total = system.total_memory();
            let free = system.available_memory();
            let memory = MemoryUsage {
                total,
                used: system.used_memory().min(total),
                free,
            };

            (f64::from(system.global_cpu_usage()), memory)
        };

        let luns = Self::luns();
        debug!(cpu, used = memory.used, luns = luns.len(), "sampled local resources");

        ResourceSnapshot {
            cpu,
            memory,
            luns,
            ..ResourceSnapshot::default()
        }
    }
}

/// Finds the address this host uses for outbound traffic.
///
/// No packet is sent: connecting a UDP socket only selects a route.
pub async fn detect_external_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    let ip = socket.local_addr()?.ip();

    if ip.is_loopback() || ip.is_unspecified() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "node is not connected to the network",
        ));
    }

    Ok(ip)
}
