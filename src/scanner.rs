use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ScanConfig;
use crate::probe::{self, PortState};

/// Open ports found on one host, plus what went wrong along the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortScanReport {
    pub open: BTreeSet<u16>,
    /// Distinct ports actually probed.
    pub probed: u64,
    /// Probes that failed with a [`crate::error::ProbeError`].
    pub errors: u64,
    /// Set when cancellation stopped the scan before every port was probed.
    pub cancelled: bool,
}

/// Seam between the orchestrator and whatever answers "which ports are open".
#[async_trait]
pub trait PortScan: Send + Sync {
    async fn scan(&self, host: IpAddr, ports: &[u16], cancel: &CancellationToken) -> PortScanReport;
}

/// Real TCP connect scanner.
#[derive(Debug, Clone)]
pub struct TcpPortScanner {
    timeout: Duration,
    concurrency: usize,
}

impl TcpPortScanner {
    pub fn new(timeout: Duration, concurrency: usize) -> Self {
        Self {
            timeout,
            concurrency: concurrency.clamp(1, ScanConfig::MAX_CONCURRENCY),
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self::new(config.probe_timeout, config.port_concurrency)
    }
}

#[async_trait]
impl PortScan for TcpPortScanner {
    async fn scan(
        &self,
        host: IpAddr,
        ports: &[u16],
        cancel: &CancellationToken,
    ) -> PortScanReport {
        scan_ports(host, ports, self.timeout, self.concurrency, cancel).await
    }
}

/// Probe every port in `ports` on `host` with at most `concurrency` connects
/// in flight.
///
/// Duplicate ports are probed once. A failing probe counts as not open and
/// bumps `errors`; it never stops the rest of the scan. On cancellation no
/// new probes start and in-flight ones are abandoned; only handshakes that
/// already completed are reported open.
pub async fn scan_ports(
    host: IpAddr,
    ports: &[u16],
    timeout: Duration,
    concurrency: usize,
    cancel: &CancellationToken,
) -> PortScanReport {
    let unique: BTreeSet<u16> = ports.iter().copied().collect();
    let sem = Arc::new(Semaphore::new(
        concurrency.clamp(1, ScanConfig::MAX_CONCURRENCY),
    ));
    let mut set = JoinSet::new();
    let mut report = PortScanReport::default();

    for port in unique {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                report.cancelled = true;
                break;
            }
            permit = sem.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let cancel = cancel.clone();

        set.spawn(async move {
            let _permit = permit; // keep permit until task completes
            let addr = SocketAddr::new(host, port);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => (port, None),
                res = probe::probe(addr, timeout) => (port, Some(res)),
            }
        });
    }

    while let Some(joined) = set.join_next().await {
        let (port, outcome) = match joined {
            Ok(v) => v,
            Err(e) => {
                warn!(%host, error = %e, "probe task aborted");
                report.errors += 1;
                continue;
            }
        };
        match outcome {
            Some(Ok(state)) => {
                report.probed += 1;
                if state == PortState::Open {
                    report.open.insert(port);
                }
            }
            Some(Err(e)) => {
                report.probed += 1;
                report.errors += 1;
                debug!(%host, port, error = %e, "probe failed");
            }
            None => report.cancelled = true,
        }
    }

    if report.errors > 0 {
        warn!(%host, errors = report.errors, "some probes failed and were counted as not open");
    }
    report
}
