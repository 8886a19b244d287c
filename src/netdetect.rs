use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

/// Detect local non-loopback IPv4 addresses and convert each to a default /24 CIDR network.
///
/// For example, an interface IP `192.168.1.42` becomes `192.168.1.0/24`.
/// Duplicates are removed and the result is sorted.
pub fn detect_local_cidrs() -> Result<Vec<IpNet>> {
    let ifaces = get_if_addrs().context("failed to list network interfaces")?;
    let set: BTreeSet<Ipv4Net> = ifaces
        .into_iter()
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) if !v4.ip.is_loopback() => Some(ipv4_to_default_cidr(v4.ip)),
            _ => None,
        })
        .collect();
    Ok(set.into_iter().map(IpNet::V4).collect())
}

/// First detected local /24, used when no range is given.
pub fn default_range() -> Result<IpNet> {
    detect_local_cidrs()?
        .into_iter()
        .next()
        .context("no non-loopback IPv4 interface found")
}

/// Expand a CIDR into the individual host addresses worth probing.
///
/// For IPv4, network and broadcast addresses are skipped except on /31 and
/// /32 where every address is a host. IPv6 ranges are not swept.
pub fn expand_cidr_to_ips(cidr: IpNet) -> Vec<IpAddr> {
    match cidr {
        IpNet::V4(n4) => n4.hosts().map(IpAddr::V4).collect(),
        IpNet::V6(_) => Vec::new(),
    }
}

/// Number of addresses [`expand_cidr_to_ips`] would return, without expanding.
pub fn host_count(cidr: &IpNet) -> usize {
    match cidr {
        IpNet::V4(n4) => match n4.prefix_len() {
            32 => 1,
            31 => 2,
            p => (1usize << (32 - p)) - 2,
        },
        IpNet::V6(_) => 0,
    }
}

/// Convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    Ipv4Net::new(Ipv4Addr::new(o[0], o[1], o[2], 0), 24).expect("/24 is always valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cidr_from_ipv4() {
        let cidr = ipv4_to_default_cidr(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(cidr.to_string(), "10.1.2.0/24");
    }

    #[test]
    fn single_host_range_is_that_host() {
        let net: IpNet = "10.9.8.7/32".parse().unwrap();
        assert_eq!(expand_cidr_to_ips(net), vec![IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7))]);
        assert_eq!(host_count(&net), 1);
    }

    #[test]
    fn host_count_matches_expansion() {
        for cidr in ["192.168.0.0/24", "10.0.0.0/30", "10.0.0.0/31", "172.16.0.0/20"] {
            let net: IpNet = cidr.parse().unwrap();
            assert_eq!(host_count(&net), expand_cidr_to_ips(net).len(), "{cidr}");
        }
    }

    #[test]
    fn ipv6_is_not_swept() {
        let net: IpNet = "fd00::/120".parse().unwrap();
        assert!(expand_cidr_to_ips(net).is_empty());
    }
}
