//! Host discovery strategies.
//!
//! Each [`ScanMode`] has its own [`HostDiscoverer`]:
//! - [`LiveDiscoverer`] nudges every address in the range and reads the
//!   kernel neighbor table for the ones that resolved. Needs root.
//! - [`RestrictedDiscoverer`] finds nothing, on purpose.
//! - [`DemoNetwork`] returns a fixed set of synthetic hosts and also answers
//!   port scans for them, so demo runs never touch the network.

use std::collections::{BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ScanConfig;
use crate::error::DiscoveryError;
use crate::job::ScanMode;
use crate::netdetect;
use crate::scanner::{PortScan, PortScanReport};

/// A responsive device: its address and link-layer hardware id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredHost {
    pub address: IpAddr,
    pub hardware_id: String,
}

impl DiscoveredHost {
    pub fn new(address: IpAddr, hardware_id: impl Into<String>) -> Self {
        Self {
            address,
            hardware_id: hardware_id.into(),
        }
    }
}

#[async_trait]
pub trait HostDiscoverer: Send + Sync {
    /// The mode this strategy implements.
    fn mode(&self) -> ScanMode;

    /// Enumerate responsive hosts in `range`. An empty list means nothing
    /// answered and is not an error.
    async fn discover(&self, range: &IpNet) -> Result<Vec<DiscoveredHost>, DiscoveryError>;
}

/// Keep the first record seen for each address, preserving order.
pub fn dedup_by_address(hosts: Vec<DiscoveredHost>) -> Vec<DiscoveredHost> {
    let mut seen = HashSet::new();
    hosts
        .into_iter()
        .filter(|h| seen.insert(h.address))
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestrictedDiscoverer;

#[async_trait]
impl HostDiscoverer for RestrictedDiscoverer {
    fn mode(&self) -> ScanMode {
        ScanMode::Restricted
    }

    async fn discover(&self, range: &IpNet) -> Result<Vec<DiscoveredHost>, DiscoveryError> {
        debug!(%range, "restricted mode, skipping discovery");
        Ok(Vec::new())
    }
}

/// One synthetic host with its pre-assigned open ports.
#[derive(Debug, Clone)]
pub struct DemoHost {
    pub host: DiscoveredHost,
    pub open_ports: BTreeSet<u16>,
}

/// Fixed synthetic network used by demo scans.
#[derive(Debug, Clone)]
pub struct DemoNetwork {
    hosts: Vec<DemoHost>,
}

impl DemoNetwork {
    pub fn new(hosts: Vec<DemoHost>) -> Self {
        Self { hosts }
    }
}

impl Default for DemoNetwork {
    fn default() -> Self {
        let host = |last: u8, mac: &str, ports: &[u16]| DemoHost {
            host: DiscoveredHost::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)), mac),
            open_ports: ports.iter().copied().collect(),
        };
        Self::new(vec![
            host(10, "00:1A:2B:3C:4D:5E", &[22, 80]),
            host(20, "00:1A:2B:3C:4D:5F", &[443]),
        ])
    }
}

#[async_trait]
impl HostDiscoverer for DemoNetwork {
    fn mode(&self) -> ScanMode {
        ScanMode::Demo
    }

    async fn discover(&self, _range: &IpNet) -> Result<Vec<DiscoveredHost>, DiscoveryError> {
        Ok(self.hosts.iter().map(|h| h.host.clone()).collect())
    }
}

#[async_trait]
impl PortScan for DemoNetwork {
    async fn scan(
        &self,
        host: IpAddr,
        ports: &[u16],
        _cancel: &CancellationToken,
    ) -> PortScanReport {
        let requested: BTreeSet<u16> = ports.iter().copied().collect();
        let open = self
            .hosts
            .iter()
            .find(|h| h.host.address == host)
            .map(|h| h.open_ports.intersection(&requested).copied().collect())
            .unwrap_or_default();
        PortScanReport {
            open,
            probed: requested.len() as u64,
            errors: 0,
            cancelled: false,
        }
    }
}

/// Largest range live discovery will sweep (a /16 worth of hosts).
pub const MAX_LIVE_HOSTS: usize = 65_534;

const NUDGE_TIMEOUT: Duration = Duration::from_millis(250);
const ATF_COM: u32 = 0x2;

/// Neighbor-table based discovery on the local segment.
pub struct LiveDiscoverer {
    window: Duration,
    nudge_port: u16,
    concurrency: usize,
    neighbor_table: PathBuf,
    privileged: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl std::fmt::Debug for LiveDiscoverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveDiscoverer")
            .field("window", &self.window)
            .field("nudge_port", &self.nudge_port)
            .field("concurrency", &self.concurrency)
            .field("neighbor_table", &self.neighbor_table)
            .finish_non_exhaustive()
    }
}

impl LiveDiscoverer {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            window: config.discovery_window,
            nudge_port: config.nudge_port,
            concurrency: config.port_concurrency.max(1),
            neighbor_table: config.neighbor_table.clone(),
            privileged: Arc::new(is_root::is_root),
        }
    }

    /// Replace the privilege check (root by default).
    pub fn with_privilege_check(
        mut self,
        check: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        self.privileged = Arc::new(check);
        self
    }

    async fn nudge(&self, targets: Vec<IpAddr>, window: Duration) {
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let timeout = NUDGE_TIMEOUT.min(window);
        let port = self.nudge_port;

        let sweep = async {
            for ip in targets {
                let Ok(permit) = sem.clone().acquire_owned().await else {
                    break;
                };
                set.spawn(async move {
                    let _permit = permit;
                    // Any answer, even a refusal, makes the kernel resolve the neighbor.
                    let addr = SocketAddr::new(ip, port);
                    let _ = tokio::time::timeout(timeout, TcpStream::connect(addr)).await;
                });
            }
            while set.join_next().await.is_some() {}
        };

        if tokio::time::timeout(window, sweep).await.is_err() {
            debug!(?window, "discovery window closed before every nudge finished");
        }
    }
}

#[async_trait]
impl HostDiscoverer for LiveDiscoverer {
    fn mode(&self) -> ScanMode {
        ScanMode::Live
    }

    async fn discover(&self, range: &IpNet) -> Result<Vec<DiscoveredHost>, DiscoveryError> {
        if !(self.privileged)() {
            return Err(DiscoveryError::Privilege(
                "neighbor discovery needs root".into(),
            ));
        }
        if !self.neighbor_table.exists() {
            return Err(DiscoveryError::Unavailable(format!(
                "no neighbor table at {}",
                self.neighbor_table.display()
            )));
        }

        let hosts = netdetect::host_count(range);
        if hosts > MAX_LIVE_HOSTS {
            return Err(DiscoveryError::RangeTooLarge {
                range: range.to_string(),
                hosts,
                limit: MAX_LIVE_HOSTS,
            });
        }
        let targets = netdetect::expand_cidr_to_ips(*range);

        info!(%range, targets = targets.len(), window = ?self.window, "sweeping range");
        self.nudge(targets, self.window).await;

        let table = tokio::fs::read_to_string(&self.neighbor_table)
            .await
            .map_err(|e| {
                DiscoveryError::Failed(format!(
                    "reading {}: {e}",
                    self.neighbor_table.display()
                ))
            })?;
        let hosts = parse_neighbor_table(&table, range);
        info!(%range, found = hosts.len(), "live discovery finished");
        Ok(hosts)
    }
}

/// Parse `/proc/net/arp` style text into complete entries inside `range`,
/// deduplicated and sorted by address.
pub fn parse_neighbor_table(table: &str, range: &IpNet) -> Vec<DiscoveredHost> {
    let mut hosts: Vec<DiscoveredHost> = table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 4 {
                return None;
            }
            let ip: IpAddr = cols[0].parse().ok()?;
            let flags = u32::from_str_radix(cols[2].trim_start_matches("0x"), 16).ok()?;
            let mac = cols[3];
            if flags & ATF_COM == 0 || mac == "00:00:00:00:00:00" || !range.contains(&ip) {
                return None;
            }
            Some(DiscoveredHost::new(ip, mac.to_uppercase()))
        })
        .collect();
    hosts.sort_by_key(|h| h.address);
    dedup_by_address(hosts)
}
