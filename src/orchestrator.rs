//! Drives scan jobs from `queued` to a terminal state.
//!
//! A run picks a discovery strategy from the request, scans each
//! discovered host's ports and writes results to the [`JobStore`] host by
//! host, so a crash or cancellation mid-run keeps whatever was already
//! recorded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ScanConfig;
use crate::discovery::{
    dedup_by_address, DemoNetwork, DiscoveredHost, HostDiscoverer, LiveDiscoverer,
    RestrictedDiscoverer,
};
use crate::error::{DiscoveryError, StoreError};
use crate::job::{Failure, FailureReason, JobEvent, JobId, NewScan, ScanJob, ScanMode};
use crate::scanner::{PortScan, TcpPortScanner};
use crate::store::JobStore;

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Why a run stopped before finishing its hosts.
#[derive(Debug)]
enum Interrupt {
    Cancelled,
    Discovery(DiscoveryError),
    Store(StoreError),
}

impl From<StoreError> for Interrupt {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl Interrupt {
    fn into_failure(self) -> Failure {
        match self {
            Self::Cancelled => Failure::new(FailureReason::Cancelled, "scan cancelled"),
            Self::Discovery(e) => Failure::new(FailureReason::DiscoveryFailed, e.to_string()),
            Self::Store(e) => Failure::new(FailureReason::PersistenceFailed, e.to_string()),
        }
    }
}

pub struct ScanOrchestrator {
    store: Arc<dyn JobStore>,
    config: ScanConfig,
    demo: Arc<DemoNetwork>,
    live: Arc<dyn HostDiscoverer>,
    restricted: Arc<dyn HostDiscoverer>,
    port_scanner: Arc<dyn PortScan>,
    running: Mutex<HashMap<JobId, CancellationToken>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ScanOrchestrator {
    pub fn new(store: Arc<dyn JobStore>, config: ScanConfig) -> Self {
        Self {
            store,
            demo: Arc::new(DemoNetwork::default()),
            live: Arc::new(LiveDiscoverer::from_config(&config)),
            restricted: Arc::new(RestrictedDiscoverer),
            port_scanner: Arc::new(TcpPortScanner::from_config(&config)),
            config,
            running: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_live_discoverer(mut self, discoverer: Arc<dyn HostDiscoverer>) -> Self {
        self.live = discoverer;
        self
    }

    pub fn with_port_scanner(mut self, scanner: Arc<dyn PortScan>) -> Self {
        self.port_scanner = scanner;
        self
    }

    pub fn with_demo_network(mut self, network: DemoNetwork) -> Self {
        self.demo = Arc::new(network);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Create a job and run it on a background task. Returns the job as
    /// created, still `queued`.
    pub async fn submit(self: &Arc<Self>, scan: NewScan) -> Result<ScanJob, StoreError> {
        let job = self.store.create_job(scan).await?;
        let id = job.id;
        let token = self.shutdown.child_token();
        self.running.lock().await.insert(id, token.clone());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run(id, token).await {
                error!(job_id = %id, error = %e, "scan run could not record its outcome");
            }
            this.running.lock().await.remove(&id);
        });

        info!(job_id = %id, range = %job.ip_range, demo = job.demo_requested, "scan queued");
        Ok(job)
    }

    /// Request cancellation of a submitted job. Returns false if it is not running here.
    pub async fn cancel(&self, id: JobId) -> bool {
        match self.running.lock().await.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every run started through [`Self::submit`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait up to `grace` for submitted runs to record their outcome.
    /// Returns false if some were still running when the grace period ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        let idle = async {
            while !self.running.lock().await.is_empty() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        tokio::time::timeout(grace, idle).await.is_ok()
    }

    /// Run a queued job to completion or failure.
    ///
    /// Only an error writing the job's own status escapes; every other
    /// problem ends the job `failed` with a reason code.
    #[instrument(skip(self, cancel), fields(job_id = %id))]
    pub async fn run(&self, id: JobId, cancel: CancellationToken) -> Result<ScanJob, StoreError> {
        let job = self
            .store
            .get_job(id)
            .await?
            .ok_or(StoreError::JobNotFound(id))?;

        if cancel.is_cancelled() {
            return self
                .fail(id, Failure::new(FailureReason::Cancelled, "cancelled before start"))
                .await;
        }
        if job.ports_requested.is_empty() {
            return self
                .fail(id, Failure::new(FailureReason::InvalidJob, "no ports requested"))
                .await;
        }

        let job = self
            .store
            .update_job_status(id, JobEvent::Started { at: OffsetDateTime::now_utc() })
            .await?;
        info!(range = %job.ip_range, ports = job.ports_requested.len(), "scan started");

        match self.execute(&job, &cancel).await {
            Ok(probe_errors) => {
                let completed = self
                    .store
                    .update_job_status(
                        id,
                        JobEvent::Completed {
                            at: OffsetDateTime::now_utc(),
                            probe_errors,
                        },
                    )
                    .await;
                let done = match completed {
                    Ok(done) => done,
                    Err(e) => {
                        return self
                            .fail(id, Failure::new(FailureReason::PersistenceFailed, e.to_string()))
                            .await;
                    }
                };
                info!(
                    mode = ?done.mode,
                    hosts = done.hosts.len(),
                    open_ports = done.open_port_count(),
                    "scan completed"
                );
                Ok(done)
            }
            Err(interrupt) => self.fail(id, interrupt.into_failure()).await,
        }
    }

    async fn fail(&self, id: JobId, failure: Failure) -> Result<ScanJob, StoreError> {
        warn!(reason = ?failure.reason, detail = %failure.detail, "scan failed");
        self.store
            .update_job_status(
                id,
                JobEvent::Failed {
                    failure,
                    at: OffsetDateTime::now_utc(),
                },
            )
            .await
    }

    async fn execute(&self, job: &ScanJob, cancel: &CancellationToken) -> Result<u64, Interrupt> {
        let (mode, hosts) = self.discover(job, cancel).await?;

        let scanner: Arc<dyn PortScan> = match mode {
            ScanMode::Demo => self.demo.clone(),
            ScanMode::Live | ScanMode::Restricted => self.port_scanner.clone(),
        };

        let mut probe_errors = 0;
        for host in hosts {
            if cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            probe_errors += self.scan_host(job, &host, scanner.as_ref(), cancel).await?;
        }
        Ok(probe_errors)
    }

    /// Pick the strategy, record the mode and enumerate hosts. Live discovery
    /// that lacks privilege or platform support falls back to restricted mode.
    async fn discover(
        &self,
        job: &ScanJob,
        cancel: &CancellationToken,
    ) -> Result<(ScanMode, Vec<DiscoveredHost>), Interrupt> {
        let (mode, reason) = if job.demo_requested {
            (ScanMode::Demo, None)
        } else if self.config.allow_live_discovery {
            (ScanMode::Live, None)
        } else {
            (
                ScanMode::Restricted,
                Some("live discovery is disabled in this deployment".to_string()),
            )
        };
        self.record_mode(job.id, mode, reason).await?;

        match self.discover_with(mode, &job.ip_range, cancel).await {
            Ok(hosts) => Ok((mode, hosts)),
            Err(Interrupt::Discovery(e)) if mode == ScanMode::Live && e.is_downgrade() => {
                warn!(error = %e, "live discovery unavailable, downgrading to restricted");
                self.record_mode(job.id, ScanMode::Restricted, Some(e.to_string()))
                    .await?;
                let hosts = self
                    .discover_with(ScanMode::Restricted, &job.ip_range, cancel)
                    .await?;
                Ok((ScanMode::Restricted, hosts))
            }
            Err(other) => Err(other),
        }
    }

    async fn record_mode(
        &self,
        id: JobId,
        mode: ScanMode,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        debug!(%mode, ?reason, "mode selected");
        self.store
            .update_job_status(id, JobEvent::ModeSelected { mode, reason })
            .await
            .map(|_| ())
    }

    async fn discover_with(
        &self,
        mode: ScanMode,
        range: &IpNet,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiscoveredHost>, Interrupt> {
        let discoverer: Arc<dyn HostDiscoverer> = match mode {
            ScanMode::Demo => self.demo.clone(),
            ScanMode::Live => self.live.clone(),
            ScanMode::Restricted => self.restricted.clone(),
        };
        let deadline = self.config.discovery_deadline();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            res = tokio::time::timeout(deadline, discoverer.discover(range)) => match res {
                Ok(Ok(hosts)) => {
                    let hosts = dedup_by_address(hosts);
                    info!(mode = %discoverer.mode(), found = hosts.len(), "discovery finished");
                    Ok(hosts)
                }
                Ok(Err(e)) => Err(Interrupt::Discovery(e)),
                Err(_elapsed) => Err(Interrupt::Discovery(DiscoveryError::TimedOut(deadline))),
            },
        }
    }

    /// Record one host, scan it and record its open ports. Returns the probe
    /// error count. Storage errors confined to this host are logged and the
    /// run moves on; anything that compromises the job record aborts it.
    async fn scan_host(
        &self,
        job: &ScanJob,
        host: &DiscoveredHost,
        scanner: &dyn PortScan,
        cancel: &CancellationToken,
    ) -> Result<u64, Interrupt> {
        let index = match self
            .store
            .append_host(job.id, host.address, &host.hardware_id)
            .await
        {
            Ok(i) => i,
            Err(e) if !e.is_job_level() => {
                warn!(host = %host.address, error = %e, "could not record host, skipping it");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let report = scanner.scan(host.address, &job.ports_requested, cancel).await;
        if report.cancelled || cancel.is_cancelled() {
            // Partial port results for this host are not merged.
            return Err(Interrupt::Cancelled);
        }

        for &port in &report.open {
            match self.store.append_open_port(job.id, index, port).await {
                Ok(()) => {}
                Err(e) if !e.is_job_level() => {
                    warn!(
                        host = %host.address,
                        port,
                        error = %e,
                        "could not record open ports for host"
                    );
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            host = %host.address,
            open = ?report.open,
            errors = report.errors,
            "host scanned"
        );
        Ok(report.errors)
    }
}
