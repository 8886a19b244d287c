use std::path::PathBuf;
use std::time::Duration;

use crate::intake;

/// Runtime settings handed to the orchestrator when it is built.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Ports used when a request does not name any.
    pub default_ports: Vec<u16>,

    /// Upper bound on a single connect attempt.
    pub probe_timeout: Duration,

    /// Max concurrent connect attempts per host scan.
    pub port_concurrency: usize,

    /// Time allotted to collect discovery responses.
    pub discovery_window: Duration,

    /// Deployment signal: whether live discovery may run here at all.
    pub allow_live_discovery: bool,

    /// Kernel neighbor table consulted by live discovery.
    pub neighbor_table: PathBuf,

    /// Port used to nudge hosts into answering address resolution.
    pub nudge_port: u16,
}

impl ScanConfig {
    pub const MAX_CONCURRENCY: usize = 5_000;

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.port_concurrency = concurrency.clamp(1, Self::MAX_CONCURRENCY);
        self
    }

    /// Hard ceiling for a whole discovery call, window plus slack for the
    /// neighbor table read.
    pub fn discovery_deadline(&self) -> Duration {
        self.discovery_window + Duration::from_secs(2)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            default_ports: intake::request_default_ports(),
            probe_timeout: Duration::from_millis(400),
            port_concurrency: 256,
            discovery_window: Duration::from_secs(3),
            allow_live_discovery: false,
            neighbor_table: PathBuf::from("/proc/net/arp"),
            nudge_port: 80,
        }
    }
}
