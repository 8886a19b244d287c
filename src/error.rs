use std::net::IpAddr;

use thiserror::Error;

use crate::job::{JobId, ScanStatus};

/// Failure of a single connect probe that is not simply "port not open".
///
/// Refused connections, timeouts and unreachable hosts are never errors; they
/// resolve to a non-open [`crate::probe::PortState`].
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("local resources exhausted while probing: {0}")]
    ResourceExhausted(#[source] std::io::Error),

    #[error("probe misconfigured: {0}")]
    Config(String),
}

/// Errors raised while enumerating hosts in a range.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("live discovery requires elevated privileges: {0}")]
    Privilege(String),

    #[error("live discovery unavailable in this environment: {0}")]
    Unavailable(String),

    #[error("range {range} has {hosts} addresses, more than the limit of {limit}")]
    RangeTooLarge {
        range: String,
        hosts: usize,
        limit: usize,
    },

    #[error("discovery did not finish within {0:?}")]
    TimedOut(std::time::Duration),

    #[error("discovery failed: {0}")]
    Failed(String),
}

impl DiscoveryError {
    /// True for the conditions handled by downgrading to restricted mode.
    pub fn is_downgrade(&self) -> bool {
        matches!(self, Self::Privilege(_) | Self::Unavailable(_))
    }
}

/// Rejected lifecycle transition on a scan job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot move job from {from} to {to}")]
    Invalid { from: ScanStatus, to: ScanStatus },

    #[error("job is {0}; mode can only change while running")]
    ModeLocked(ScanStatus),

    #[error("job is {0}; results can only be recorded while running")]
    NotRunning(ScanStatus),
}

/// Errors surfaced by a [`crate::store::JobStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("scan job {0} not found")]
    JobNotFound(JobId),

    #[error("host #{host} not found on scan job {job}")]
    HostNotFound { job: JobId, host: usize },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the error means the job record itself can no longer be trusted.
    ///
    /// Backend hiccups while writing one host's rows are isolated to that host.
    pub fn is_job_level(&self) -> bool {
        !matches!(self, Self::Backend(_) | Self::HostNotFound { .. })
    }
}

/// Request rejected by the intake validator before any job exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid IP range {0:?}: expected IPv4 CIDR such as 192.168.1.0/24")]
    InvalidRange(String),

    #[error("IP range {range} is too large (prefix /{prefix}, minimum /{min})")]
    RangeTooLarge { range: String, prefix: u8, min: u8 },

    #[error("invalid gateway address {0:?}")]
    InvalidGateway(String),

    #[error("gateway {gateway} is not inside {range}")]
    GatewayOutsideRange { gateway: IpAddr, range: String },

    #[error("port out of range: {0}")]
    InvalidPort(i64),

    #[error("port list is empty")]
    NoPorts,
}
