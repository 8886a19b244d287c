use ipnet::IpNet;
use netsweep::netdetect::{expand_cidr_to_ips, host_count, ipv4_to_default_cidr};
use std::net::{IpAddr, Ipv4Addr};

#[test]
fn default_cidr_is_24() {
    let cidr = ipv4_to_default_cidr(Ipv4Addr::new(192, 168, 42, 99));
    assert_eq!(cidr.to_string(), "192.168.42.0/24");
}

#[test]
fn expand_excludes_network_and_broadcast() {
    let net: IpNet = "10.0.0.0/30".parse().unwrap();
    let list: Vec<_> = expand_cidr_to_ips(net)
        .into_iter()
        .map(|ip| match ip {
            IpAddr::V4(v) => v,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(
        list,
        vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
    );
}

#[test]
fn slash_24_has_254_hosts() {
    let net: IpNet = "192.168.1.0/24".parse().unwrap();
    assert_eq!(host_count(&net), 254);
    assert_eq!(expand_cidr_to_ips(net).len(), 254);
}
