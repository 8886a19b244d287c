use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use netsweep::scanner::{scan_ports, PortScan, TcpPortScanner};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn listeners(n: usize) -> (Vec<TcpListener>, Vec<u16>) {
    let mut held = Vec::new();
    let mut ports = Vec::new();
    for _ in 0..n {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ports.push(l.local_addr().unwrap().port());
        held.push(l);
    }
    (held, ports)
}

async fn closed_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    l.local_addr().unwrap().port()
}

#[tokio::test]
async fn finds_listeners_and_dedups() {
    let (_held, open) = listeners(3).await;
    let closed = closed_port().await;

    let mut requested = open.clone();
    requested.push(closed);
    requested.push(open[0]);
    requested.push(open[1]);

    let report = scan_ports(
        LOCALHOST,
        &requested,
        Duration::from_millis(500),
        16,
        &CancellationToken::new(),
    )
    .await;

    let expected: BTreeSet<u16> = open.iter().copied().collect();
    assert_eq!(report.open, expected);
    assert!(report.open.iter().all(|p| requested.contains(p)));
    assert_eq!(report.probed, 4);
    assert!(!report.cancelled);
}

#[tokio::test]
async fn concurrency_of_one_still_scans_everything() {
    let (_held, open) = listeners(2).await;
    let scanner = TcpPortScanner::new(Duration::from_millis(500), 1);
    let report = scanner.scan(LOCALHOST, &open, &CancellationToken::new()).await;
    assert_eq!(report.open.len(), 2);
}

#[tokio::test]
async fn silent_host_costs_about_one_timeout_not_one_per_port() {
    // TEST-NET-1: nothing answers, probes either time out or fail fast.
    let host = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
    let ports: Vec<u16> = (1..=40).collect();
    let timeout = Duration::from_millis(300);

    let started = Instant::now();
    let report = scan_ports(host, &ports, timeout, 64, &CancellationToken::new()).await;
    let elapsed = started.elapsed();

    assert!(report.open.is_empty());
    assert!(
        elapsed < timeout * 4,
        "took {elapsed:?}, sequential would be {:?}",
        timeout * ports.len() as u32
    );
}

#[tokio::test]
async fn cancelled_scan_reports_nothing_open() {
    let (_held, open) = listeners(2).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = scan_ports(LOCALHOST, &open, Duration::from_millis(500), 4, &cancel).await;
    assert!(report.cancelled);
    assert!(report.open.is_empty());
}

#[tokio::test]
async fn empty_port_list_is_an_empty_report() {
    let report = scan_ports(
        LOCALHOST,
        &[],
        Duration::from_millis(100),
        4,
        &CancellationToken::new(),
    )
    .await;
    assert!(report.open.is_empty());
    assert_eq!(report.probed, 0);
}

#[tokio::test]
async fn a_failing_port_is_counted_without_stopping_the_scan() {
    let (_held, open) = listeners(1).await;
    let report = scan_ports(
        LOCALHOST,
        &[0, open[0]],
        Duration::from_millis(500),
        4,
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(report.open, BTreeSet::from([open[0]]));
    assert_eq!(report.errors, 1);
    assert_eq!(report.probed, 2);
    assert!(!report.cancelled);
}
