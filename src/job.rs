//! Scan job records and their lifecycle.
//!
//! A [`ScanJob`] moves `queued -> running -> completed | failed` and never
//! backwards. Hosts and their open ports are append-only while the job runs;
//! once terminal, the record is frozen.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::TransitionError;

/// Opaque identifier assigned by the store when a job is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_move_to(self, next: ScanStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// Discovery strategy a job runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Fixed synthetic hosts, no network traffic.
    Demo,
    /// Neighbor discovery on the real network.
    Live,
    /// Discovery disabled by the deployment; always finds nothing.
    Restricted,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Demo => "demo",
            Self::Live => "live",
            Self::Restricted => "restricted",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Cancelled,
    DiscoveryFailed,
    PersistenceFailed,
    InvalidJob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub detail: String,
}

impl Failure {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// A validated scan request, ready to be turned into a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewScan {
    pub ip_range: IpNet,
    pub gateway: Option<IpAddr>,
    pub ports: Vec<u16>,
    pub demo: bool,
}

/// A device found during discovery, with the ports found open on it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub ip_address: IpAddr,
    pub mac_address: String,
    pub open_ports: BTreeSet<u16>,
}

impl Host {
    pub fn new(ip_address: IpAddr, mac_address: impl Into<String>) -> Self {
        Self {
            ip_address,
            mac_address: mac_address.into(),
            open_ports: BTreeSet::new(),
        }
    }
}

/// Lifecycle events applied to a job through [`ScanJob::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started {
        at: OffsetDateTime,
    },
    ModeSelected {
        mode: ScanMode,
        reason: Option<String>,
    },
    Completed {
        at: OffsetDateTime,
        probe_errors: u64,
    },
    Failed {
        failure: Failure,
        at: OffsetDateTime,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    pub id: JobId,
    pub ip_range: IpNet,
    pub gateway: Option<IpAddr>,
    pub ports_requested: Vec<u16>,
    pub demo_requested: bool,
    /// Discovery strategy, chosen when the run starts.
    pub mode: Option<ScanMode>,
    /// Why live discovery was replaced by restricted mode, if it was.
    pub downgrade_reason: Option<String>,
    pub status: ScanStatus,
    pub failure: Option<Failure>,
    /// Probes that failed for reasons other than a closed or silent port.
    pub probe_errors: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub failed_at: Option<OffsetDateTime>,
    pub hosts: Vec<Host>,
}

impl ScanJob {
    pub fn new(id: JobId, scan: NewScan, created_at: OffsetDateTime) -> Self {
        Self {
            id,
            ip_range: scan.ip_range,
            gateway: scan.gateway,
            ports_requested: scan.ports,
            demo_requested: scan.demo,
            mode: None,
            downgrade_reason: None,
            status: ScanStatus::Queued,
            failure: None,
            probe_errors: 0,
            created_at,
            started_at: None,
            completed_at: None,
            failed_at: None,
            hosts: Vec::new(),
        }
    }

    pub fn apply(&mut self, event: JobEvent) -> Result<(), TransitionError> {
        match event {
            JobEvent::Started { at } => {
                self.transition(ScanStatus::Running)?;
                self.started_at = Some(self.not_before(at));
            }
            JobEvent::ModeSelected { mode, reason } => {
                if self.status != ScanStatus::Running {
                    return Err(TransitionError::ModeLocked(self.status));
                }
                self.mode = Some(mode);
                self.downgrade_reason = reason;
            }
            JobEvent::Completed { at, probe_errors } => {
                self.transition(ScanStatus::Completed)?;
                self.probe_errors = probe_errors;
                self.completed_at = Some(self.not_before(at));
            }
            JobEvent::Failed { failure, at } => {
                self.transition(ScanStatus::Failed)?;
                self.failure = Some(failure);
                self.failed_at = Some(self.not_before(at));
            }
        }
        Ok(())
    }

    /// Append a discovered host and return its index within the job.
    pub fn record_host(&mut self, host: Host) -> Result<usize, TransitionError> {
        self.ensure_running()?;
        self.hosts.push(host);
        Ok(self.hosts.len() - 1)
    }

    /// Record an open port on the host at `index`. Returns `None` if there is
    /// no such host, otherwise whether the port was newly added.
    pub fn record_open_port(
        &mut self,
        index: usize,
        port: u16,
    ) -> Result<Option<bool>, TransitionError> {
        self.ensure_running()?;
        Ok(self
            .hosts
            .get_mut(index)
            .map(|host| host.open_ports.insert(port)))
    }

    pub fn open_port_count(&self) -> usize {
        self.hosts.iter().map(|h| h.open_ports.len()).sum()
    }

    fn ensure_running(&self) -> Result<(), TransitionError> {
        if self.status == ScanStatus::Running {
            Ok(())
        } else {
            Err(TransitionError::NotRunning(self.status))
        }
    }

    fn transition(&mut self, to: ScanStatus) -> Result<(), TransitionError> {
        if !self.status.can_move_to(to) {
            return Err(TransitionError::Invalid {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    // Clock steps backwards must not produce out-of-order timestamps.
    fn not_before(&self, at: OffsetDateTime) -> OffsetDateTime {
        [Some(self.created_at), self.started_at]
            .into_iter()
            .flatten()
            .fold(at, |acc, prev| acc.max(prev))
    }
}
