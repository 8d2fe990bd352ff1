//! Host inventory probes feeding the heartbeat envelope.
//!
//! Every sub-probe is best-effort: a failing probe degrades its fields to
//! `None` and the snapshot is still produced. The hardware section is the
//! expensive part (CPU/memory/disk enumeration), so it sits behind a
//! collector-owned cache with a 5 minute TTL.

use std::env;
use std::fs;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, Networks, RefreshKind, System};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const HARDWARE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize)]
pub struct InventorySnapshot {
    pub host: HostInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareInfo>,
    pub identity: IdentityInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub hostname: String,
    pub fqdn: String,
    pub os: String,
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_build: Option<String>,
    pub arch: &'static str,
    pub primary_ip: Option<String>,
    pub ip_addrs: Vec<String>,
    pub mac_addrs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HardwareInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram_total_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_total_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_free_gb: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub joined: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aad_joined: Option<bool>,
}

struct CachedHardware {
    refreshed_at: Instant,
    info: HardwareInfo,
}

pub struct InventoryCollector {
    hardware_cache: Mutex<Option<CachedHardware>>,
}

impl InventoryCollector {
    pub fn new() -> Self {
        Self {
            hardware_cache: Mutex::new(None),
        }
    }

    pub fn collect(&self) -> InventorySnapshot {
        let host = probe_host();
        let hardware = self.hardware();
        let identity = probe_identity(&host.hostname);

        InventorySnapshot {
            host,
            hardware,
            identity,
        }
    }

    fn hardware(&self) -> Option<HardwareInfo> {
        let mut cache = self.hardware_cache.lock().expect("non-poisoned");

        if let Some(cached) = cache.as_ref()
            && cached.refreshed_at.elapsed() < HARDWARE_CACHE_TTL
        {
            return Some(cached.info.clone());
        }

        let info = probe_hardware();

        *cache = Some(CachedHardware {
            refreshed_at: Instant::now(),
            info: info.clone(),
        });

        Some(info)
    }
}

impl Default for InventoryCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn probe_host() -> HostInfo {
    let hostname = match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(error) => {
            warn!(%error, "Hostname probe failed");
            "unknown".to_owned()
        }
    };

    // No DNS search-list resolution is attempted; the bare name is reported
    // unless the OS already hands out a dotted name.
    let fqdn = hostname.clone();

    let networks = Networks::new_with_refreshed_list();

    let mut addrs: Vec<IpAddr> = Vec::new();
    let mut mac_addrs: Vec<String> = Vec::new();

    for (_interface, data) in &networks {
        for ip_network in data.ip_networks() {
            if !ip_network.addr.is_loopback() && !addrs.contains(&ip_network.addr) {
                addrs.push(ip_network.addr);
            }
        }

        let mac = data.mac_address();
        if mac != sysinfo::MacAddr::UNSPECIFIED {
            let mac = mac.to_string();
            if !mac_addrs.contains(&mac) {
                mac_addrs.push(mac);
            }
        }
    }

    let primary_ip = addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .map(IpAddr::to_string);

    let boot_time = match System::boot_time() {
        0 => None,
        secs => format_unix_seconds(secs),
    };

    HostInfo {
        hostname,
        fqdn,
        os: System::name().unwrap_or_else(|| env::consts::OS.to_owned()),
        os_version: System::os_version(),
        os_build: System::kernel_version(),
        arch: normalize_arch(env::consts::ARCH),
        primary_ip,
        ip_addrs: addrs.iter().map(IpAddr::to_string).collect(),
        mac_addrs,
        timezone: probe_timezone(),
        boot_time,
        uptime_seconds: Some(System::uptime()),
    }
}

fn probe_hardware() -> HardwareInfo {
    let system = System::new_with_specifics(
        RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything()),
    );

    let cpu_model = system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_owned())
        .filter(|brand| !brand.is_empty());

    let cpu_cores = (!system.cpus().is_empty()).then(|| system.cpus().len());

    let ram_total_gb = (system.total_memory() > 0).then(|| bytes_to_gb(system.total_memory()));

    let disks = Disks::new_with_refreshed_list();
    let disk_total: u64 = disks.list().iter().map(|disk| disk.total_space()).sum();
    let disk_free: u64 = disks.list().iter().map(|disk| disk.available_space()).sum();

    HardwareInfo {
        cpu_model,
        cpu_cores,
        ram_total_gb,
        disk_total_gb: (disk_total > 0).then(|| bytes_to_gb(disk_total)),
        disk_free_gb: (disk_total > 0).then(|| bytes_to_gb(disk_free)),
    }
}

fn probe_identity(hostname: &str) -> IdentityInfo {
    if cfg!(target_os = "windows") {
        // USERDOMAIN equals the computer name on workgroup machines and the
        // NetBIOS domain name on joined ones.
        let domain = env::var("USERDOMAIN")
            .ok()
            .filter(|domain| !domain.is_empty() && !domain.eq_ignore_ascii_case(hostname));

        IdentityInfo {
            joined: domain.is_some(),
            domain,
            aad_joined: None,
        }
    } else {
        IdentityInfo {
            domain: None,
            joined: false,
            aad_joined: None,
        }
    }
}

fn probe_timezone() -> Option<String> {
    if let Ok(tz) = env::var("TZ")
        && !tz.is_empty()
    {
        return Some(tz);
    }

    if cfg!(unix) {
        return fs::read_to_string("/etc/timezone")
            .ok()
            .map(|contents| contents.trim().to_owned())
            .filter(|tz| !tz.is_empty());
    }

    None
}

pub(crate) fn normalize_arch(raw: &str) -> &'static str {
    match raw {
        "x86_64" => "x86_64",
        "aarch64" | "arm64" => "aarch64",
        "arm" | "armv5te" | "armv7" => "arm",
        "x86" | "i586" | "i686" => "i686",
        _ => "unknown",
    }
}

fn bytes_to_gb(bytes: u64) -> f64 {
    // One decimal is plenty for inventory purposes.
    #[allow(clippy::cast_precision_loss)]
    let gb = bytes as f64 / BYTES_PER_GB;
    (gb * 10.0).round() / 10.0
}

fn format_unix_seconds(secs: u64) -> Option<String> {
    let timestamp = i64::try_from(secs).ok()?;
    let instant = OffsetDateTime::from_unix_timestamp(timestamp).ok()?;
    instant.format(&Rfc3339).ok()
}
