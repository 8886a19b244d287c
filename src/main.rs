use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netsweep::intake::{self, ScanRequest};
use netsweep::job::{ScanJob, ScanStatus};
use netsweep::store::{JobStore, MemoryStore};
use netsweep::{netdetect, server, ScanConfig, ScanOrchestrator};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// netsweep: discover hosts on a range and list their open TCP ports.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "netsweep",
    version,
    about = "Discover hosts on a network range and enumerate their open TCP ports.",
    long_about = None
)]
struct Cli {
    /// IPv4 CIDR to scan (e.g., 192.168.1.0/24). If omitted, auto-detect local /24.
    #[arg(long)]
    targets: Option<String>,

    /// Gateway address inside the target range (recorded with the job).
    #[arg(long)]
    gateway: Option<String>,

    /// Path to ports list file (one port, range or comma list per line).
    #[arg(long)]
    ports: Option<PathBuf>,

    /// Max concurrent TCP connect attempts per host.
    #[arg(long, default_value_t = 256)]
    concurrency: usize,

    /// Socket connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 400)]
    timeout_ms: u64,

    /// Time allowed for host discovery, in milliseconds.
    #[arg(long = "discovery-window-ms", default_value_t = 3_000)]
    discovery_window_ms: u64,

    /// Permit live neighbor discovery in this deployment (needs root).
    #[arg(long = "allow-live", env = "NETSWEEP_ALLOW_LIVE", default_value_t = false)]
    allow_live: bool,

    /// Use the built-in demo network instead of the real one.
    #[arg(long, default_value_t = false)]
    demo: bool,

    /// Write the finished job as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Start the HTTP API and dashboard instead of running a single scan.
    #[arg(long = "serve-ui", default_value_t = false)]
    serve_ui: bool,

    /// Address for the HTTP server.
    #[arg(long, env = "NETSWEEP_BIND", default_value = "127.0.0.1:8080")]
    bind: String,
}

impl Cli {
    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            probe_timeout: Duration::from_millis(self.timeout_ms),
            discovery_window: Duration::from_millis(self.discovery_window_ms),
            allow_live_discovery: self.allow_live,
            ..ScanConfig::default()
        }
        .with_concurrency(self.concurrency)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = cli.scan_config();
    info!(
        concurrency = config.port_concurrency,
        timeout_ms = cli.timeout_ms,
        allow_live = config.allow_live_discovery,
        "configuration loaded"
    );

    let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    let orchestrator = Arc::new(ScanOrchestrator::new(store.clone(), config));

    if cli.serve_ui {
        let bind = cli.bind.clone();
        let api = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, api).await {
                warn!(error = %e, "HTTP server stopped");
            }
        });
        println!("UI server starting at http://{} (Ctrl+C to stop)", cli.bind);
        let _ = tokio::signal::ctrl_c().await;
        orchestrator.shutdown();
        if !orchestrator.drain(SHUTDOWN_GRACE).await {
            warn!(grace = ?SHUTDOWN_GRACE, "some scans did not record cancellation before exit");
        }
        return Ok(());
    }

    let ip_range = match cli.targets.as_deref() {
        Some(t) => t.to_string(),
        None => netdetect::default_range()
            .context("no --targets given and local network detection failed")?
            .to_string(),
    };
    let ports = match cli.ports.as_deref() {
        Some(path) => intake::load_ports_from_path(path)?,
        None => intake::default_ports(),
    };
    let request = ScanRequest {
        ip_range,
        gateway: cli.gateway.clone(),
        ports: Some(ports.into_iter().map(i64::from).collect()),
        demo: cli.demo,
    };
    let scan = intake::validate(&request, &orchestrator.config().default_ports)?;

    let job = store.create_job(scan).await?;
    println!(
        "Scanning {} ({} ports, {})",
        job.ip_range,
        job.ports_requested.len(),
        if job.demo_requested { "demo" } else { "live" }
    );

    // Ctrl-C cancels the scan.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    let finished = orchestrator.run(job.id, cancel).await?;
    print_results_table(&finished);

    if let Some(path) = cli.output.as_deref() {
        match write_results_json(path, &finished) {
            Ok(()) => println!("Wrote JSON results to {}", path.display()),
            Err(e) => eprintln!("Failed to write JSON to {}: {e:#}", path.display()),
        }
    }

    if finished.status == ScanStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_results_table(job: &ScanJob) {
    let ip_w = job
        .hosts
        .iter()
        .map(|h| h.ip_address.to_string().len())
        .fold("ip".len(), usize::max);
    let mac_w = job
        .hosts
        .iter()
        .map(|h| h.mac_address.len())
        .fold("mac".len(), usize::max);

    println!(
        "\nScan {}: {} (mode: {}), {} hosts, {} open ports",
        job.id,
        job.status,
        job.mode.map_or("none".to_string(), |m| m.to_string()),
        job.hosts.len(),
        job.open_port_count()
    );
    if let Some(reason) = &job.downgrade_reason {
        println!("Note: {reason}");
    }
    if let Some(failure) = &job.failure {
        println!("Failure ({:?}): {}", failure.reason, failure.detail);
    }
    if job.hosts.is_empty() {
        println!("No hosts found.");
        return;
    }

    println!(
        "{:<ip_w$}  {:<mac_w$}  open_ports",
        "ip",
        "mac",
        ip_w = ip_w,
        mac_w = mac_w
    );
    println!(
        "{:-<ip_w$}  {:-<mac_w$}  {:-<10}",
        "",
        "",
        "",
        ip_w = ip_w,
        mac_w = mac_w
    );
    for h in &job.hosts {
        let ports = if h.open_ports.is_empty() {
            "-".to_string()
        } else {
            h.open_ports
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!(
            "{:<ip_w$}  {:<mac_w$}  {}",
            h.ip_address.to_string(),
            h.mac_address,
            ports,
            ip_w = ip_w,
            mac_w = mac_w
        );
    }
}

fn write_results_json(path: &Path, job: &ScanJob) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, job)?;
    Ok(())
}
