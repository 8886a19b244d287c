//! Library crate for netsweep: host discovery and TCP port scanning run as
//! tracked background jobs.
pub mod config;
pub mod discovery;
pub mod error;
pub mod intake;
pub mod job;
pub mod netdetect;
pub mod orchestrator;
pub mod probe;
pub mod scanner;
pub mod server;
pub mod store;

pub use config::ScanConfig;
pub use job::{Host, JobId, ScanJob, ScanMode, ScanStatus};
pub use orchestrator::ScanOrchestrator;
