//! Request validation in front of the scan core.
//!
//! Everything here runs before a job exists: a request that fails these
//! checks never reaches the store or the orchestrator.

use anyhow::{bail, Context, Result};
use ipnet::{IpNet, Ipv4Net};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

use crate::error::ValidationError;
use crate::job::NewScan;

/// Shortest accepted prefix; larger sweeps are refused up front.
pub const MIN_PREFIX: u8 = 16;

/// A scan request as it arrives from a client.
///
/// Ports are kept wide so out-of-range values such as `0` or `65536` are
/// reported as validation errors rather than decoding failures.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    pub ip_range: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub ports: Option<Vec<i64>>,
    #[serde(default)]
    pub demo: bool,
}

/// Validate a request into a [`NewScan`].
///
/// Host bits in the range are dropped (`192.168.1.1/24` is accepted as
/// `192.168.1.0/24`). Missing ports fall back to `default_ports`; an
/// explicitly empty list is rejected. Ports keep their first-seen order.
pub fn validate(req: &ScanRequest, default_ports: &[u16]) -> Result<NewScan, ValidationError> {
    let ip_range = parse_range(&req.ip_range)?;

    let gateway = match req.gateway.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(g) => {
            let ip: IpAddr = g
                .parse()
                .map_err(|_| ValidationError::InvalidGateway(g.to_string()))?;
            if !ip_range.contains(&ip) {
                return Err(ValidationError::GatewayOutsideRange {
                    gateway: ip,
                    range: ip_range.to_string(),
                });
            }
            Some(ip)
        }
    };

    let ports = match &req.ports {
        None => default_ports.to_vec(),
        Some(raw) => validate_ports(raw)?,
    };
    if ports.is_empty() {
        return Err(ValidationError::NoPorts);
    }

    Ok(NewScan {
        ip_range,
        gateway,
        ports,
        demo: req.demo,
    })
}

/// Parse an IPv4 CIDR, tolerating host bits.
pub fn parse_range(s: &str) -> Result<IpNet, ValidationError> {
    let s = s.trim();
    let net: Ipv4Net = s
        .parse()
        .map_err(|_| ValidationError::InvalidRange(s.to_string()))?;
    if net.prefix_len() < MIN_PREFIX {
        return Err(ValidationError::RangeTooLarge {
            range: s.to_string(),
            prefix: net.prefix_len(),
            min: MIN_PREFIX,
        });
    }
    Ok(IpNet::V4(net.trunc()))
}

/// Check every port is within 1..=65535 and drop repeats.
pub fn validate_ports(raw: &[i64]) -> Result<Vec<u16>, ValidationError> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for &p in raw {
        let port = u16::try_from(p)
            .ok()
            .filter(|&v| v != 0)
            .ok_or(ValidationError::InvalidPort(p))?;
        if seen.insert(port) {
            out.push(port);
        }
    }
    Ok(out)
}

/// Parse a ports file content into a deduplicated list of TCP ports (1..=65535).
///
/// Supported formats per line:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comma separated lists: `22,80,443`
/// - comments: everything after `#` is ignored
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");

        for item in line.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            if let Some((a, b)) = item.split_once('-') {
                let start = parse_port_str(a.trim())
                    .with_context(|| format!("line {line_no}: invalid start in range: {a}"))?;
                let end = parse_port_str(b.trim())
                    .with_context(|| format!("line {line_no}: invalid end in range: {b}"))?;
                if start > end {
                    bail!("line {line_no}: invalid range {start}-{end} (start > end)");
                }
                out.extend((start..=end).filter(|p| seen.insert(*p)));
                continue;
            }

            let p = parse_port_str(item)
                .with_context(|| format!("line {line_no}: invalid port value: {item}"))?;
            if seen.insert(p) {
                out.push(p);
            }
        }
    }

    Ok(out)
}

/// Load a ports list from a file path. Errors if the file cannot be read or parsed.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    parse_ports_str(&content)
}

/// Ports used by API requests that do not list any.
pub fn request_default_ports() -> Vec<u16> {
    vec![22, 80, 443]
}

/// Common service ports used by the CLI when no ports file is given.
pub fn default_ports() -> Vec<u16> {
    const DEFAULT: &[u16] = &[20, 21, 22, 23, 25, 53, 80, 110, 143, 443, 3306, 8080];
    DEFAULT.to_vec()
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
