use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sysinfo::{Components, Disks, Networks, System};
use tracing::debug;

use domain::DomainError;
use domain::telemetry::{NetworkInterfaceInfo, ProcessInfo, SystemProbe, SystemSnapshot};

const INTERFACE_CACHE_TTL: Duration = Duration::from_secs(30);
const TOP_PROCESS_COUNT: usize = 5;

/// Host telemetry via sysinfo.
///
/// The `System` handle is kept alive between snapshots so CPU usage deltas
/// are meaningful. Hostname and core count never change and are cached at
/// construction; network interfaces are cached with a short TTL.
pub struct SysinfoProbe {
    system: Mutex<System>,
    hostname: String,
    cpu_cores: usize,
    interface_cache: Mutex<Option<(Instant, Vec<NetworkInterfaceInfo>)>>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        let hostname = System::host_name().unwrap_or_else(|| "unknown".to_string());
        let cpu_cores = system.cpus().len();
        Self {
            system: Mutex::new(system),
            hostname,
            cpu_cores,
            interface_cache: Mutex::new(None),
        }
    }

    fn interfaces(&self) -> Vec<NetworkInterfaceInfo> {
        let mut cache = self.interface_cache.lock().expect("cache poisoned");
        if let Some((at, interfaces)) = cache.as_ref() {
            if at.elapsed() < INTERFACE_CACHE_TTL {
                return interfaces.clone();
            }
        }

        let networks = Networks::new_with_refreshed_list();
        let interfaces: Vec<NetworkInterfaceInfo> = networks
            .iter()
            .map(|(name, data)| {
                let address = data
                    .ip_networks()
                    .iter()
                    .find(|ip| ip.addr.is_ipv4() && !ip.addr.is_loopback())
                    .map(|ip| ip.addr.to_string());
                NetworkInterfaceInfo {
                    name: name.clone(),
                    address,
                    rx_bytes: data.total_received(),
                    tx_bytes: data.total_transmitted(),
                }
            })
            .collect();

        debug!(count = interfaces.len(), "refreshed interface cache");
        *cache = Some((Instant::now(), interfaces.clone()));
        interfaces
    }

    fn temperature() -> Option<f64> {
        let components = Components::new_with_refreshed_list();
        // Prefer a CPU-ish component, fall back to the first reading.
        let mut first = None;
        for component in components.iter() {
            let Some(temp) = component.temperature() else {
                continue;
            };
            let label = component.label().to_lowercase();
            if label.contains("cpu") || label.contains("coretemp") || label.contains("soc") {
                return Some(temp as f64);
            }
            if first.is_none() {
                first = Some(temp as f64);
            }
        }
        first
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemProbe for SysinfoProbe {
    async fn snapshot(&self) -> Result<SystemSnapshot, DomainError> {
        let interfaces = self.interfaces();
        let local_ip = interfaces.iter().find_map(|i| i.address.clone());

        let mut system = self.system.lock().expect("system poisoned");
        system.refresh_all();

        let cpu_percent = system.global_cpu_usage() as f64;
        let memory_total = system.total_memory();
        let memory_used = system.used_memory();
        let memory_percent = if memory_total > 0 {
            memory_used as f64 / memory_total as f64 * 100.0
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"));
        let (storage_total, storage_used) = match root {
            Some(disk) => (
                disk.total_space(),
                disk.total_space() - disk.available_space(),
            ),
            None => disks.iter().fold((0, 0), |(total, used), d| {
                (
                    total + d.total_space(),
                    used + (d.total_space() - d.available_space()),
                )
            }),
        };
        let storage_percent = if storage_total > 0 {
            storage_used as f64 / storage_total as f64 * 100.0
        } else {
            0.0
        };

        let mut top_processes: Vec<ProcessInfo> = system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().to_string(),
                cpu_percent: process.cpu_usage() as f64,
                memory_bytes: process.memory(),
            })
            .collect();
        top_processes.sort_by(|a, b| {
            b.cpu_percent
                .partial_cmp(&a.cpu_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        top_processes.truncate(TOP_PROCESS_COUNT);

        let process_rss_bytes = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| system.process(pid))
            .map(|p| p.memory())
            .unwrap_or(0);

        let load = System::load_average();

        Ok(SystemSnapshot {
            cpu_percent,
            memory_used,
            memory_total,
            memory_percent,
            storage_used,
            storage_total,
            storage_percent,
            uptime_secs: System::uptime(),
            temperature: Self::temperature(),
            local_ip,
            os_version: System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
            load_average: Some((load.one, load.five, load.fifteen)),
            top_processes,
            interfaces,
            process_rss_bytes,
        })
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn cpu_cores(&self) -> usize {
        self.cpu_cores
    }
}
