use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::job::{Host, JobEvent, JobId, NewScan, ScanJob};

/// Durable record keeper for scan jobs.
///
/// The store owns the job records; hosts and their open ports belong to their
/// job and go away with it. Implementations must apply [`JobEvent`]s through
/// [`ScanJob::apply`] so the lifecycle rules hold whatever the backend.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, scan: NewScan) -> Result<ScanJob, StoreError>;

    async fn update_job_status(&self, id: JobId, event: JobEvent) -> Result<ScanJob, StoreError>;

    /// Append a host to a running job; returns the host's index in the job.
    async fn append_host(
        &self,
        id: JobId,
        ip_address: IpAddr,
        mac_address: &str,
    ) -> Result<usize, StoreError>;

    async fn append_open_port(&self, id: JobId, host: usize, port: u16) -> Result<(), StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<ScanJob>, StoreError>;

    /// All jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<ScanJob>, StoreError>;

    /// Remove a job and everything recorded under it. Returns whether it existed.
    async fn delete_job(&self, id: JobId) -> Result<bool, StoreError>;
}

/// Process-local store, used by the CLI, the embedded server and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    jobs: BTreeMap<JobId, ScanJob>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, scan: NewScan) -> Result<ScanJob, StoreError> {
        let mut s = self.inner.write().await;
        s.next_id += 1;
        let id = JobId(s.next_id);
        let job = ScanJob::new(id, scan, OffsetDateTime::now_utc());
        s.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn update_job_status(&self, id: JobId, event: JobEvent) -> Result<ScanJob, StoreError> {
        let mut s = self.inner.write().await;
        let job = s.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.apply(event)?;
        Ok(job.clone())
    }

    async fn append_host(
        &self,
        id: JobId,
        ip_address: IpAddr,
        mac_address: &str,
    ) -> Result<usize, StoreError> {
        let mut s = self.inner.write().await;
        let job = s.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        Ok(job.record_host(Host::new(ip_address, mac_address))?)
    }

    async fn append_open_port(&self, id: JobId, host: usize, port: u16) -> Result<(), StoreError> {
        let mut s = self.inner.write().await;
        let job = s.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.record_open_port(host, port)?
            .map(|_| ())
            .ok_or(StoreError::HostNotFound { job: id, host })
    }

    async fn get_job(&self, id: JobId) -> Result<Option<ScanJob>, StoreError> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<ScanJob>, StoreError> {
        Ok(self.inner.read().await.jobs.values().cloned().collect())
    }

    async fn delete_job(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.jobs.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransitionError;
    use crate::job::ScanStatus;

    fn scan() -> NewScan {
        NewScan {
            ip_range: "192.168.1.0/24".parse().unwrap(),
            gateway: None,
            ports: vec![22, 80, 443],
            demo: true,
        }
    }

    #[tokio::test]
    async fn ids_are_unique_and_jobs_listed_in_creation_order() {
        let store = MemoryStore::new();
        let a = store.create_job(scan()).await.unwrap();
        let b = store.create_job(scan()).await.unwrap();
        assert_ne!(a.id, b.id);
        let ids: Vec<JobId> = store.list_jobs().await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn hosts_require_a_running_job() {
        let store = MemoryStore::new();
        let job = store.create_job(scan()).await.unwrap();
        let ip: IpAddr = "192.168.1.10".parse().unwrap();

        let err = store.append_host(job.id, ip, "aa").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Transition(TransitionError::NotRunning(ScanStatus::Queued))
        ));
        assert!(err.is_job_level());

        store
            .update_job_status(job.id, JobEvent::Started { at: OffsetDateTime::now_utc() })
            .await
            .unwrap();
        let idx = store.append_host(job.id, ip, "aa").await.unwrap();
        store.append_open_port(job.id, idx, 22).await.unwrap();
        assert!(matches!(
            store.append_open_port(job.id, idx + 5, 22).await,
            Err(StoreError::HostNotFound { .. })
        ));

        let saved = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(saved.hosts.len(), 1);
        assert!(saved.hosts[0].open_ports.contains(&22));
    }

    #[tokio::test]
    async fn delete_cascades_hosts() {
        let store = MemoryStore::new();
        let job = store.create_job(scan()).await.unwrap();
        store
            .update_job_status(job.id, JobEvent::Started { at: OffsetDateTime::now_utc() })
            .await
            .unwrap();
        store
            .append_host(job.id, "192.168.1.10".parse().unwrap(), "aa")
            .await
            .unwrap();

        assert!(store.delete_job(job.id).await.unwrap());
        assert!(store.get_job(job.id).await.unwrap().is_none());
        assert!(!store.delete_job(job.id).await.unwrap());
        assert!(matches!(
            store.append_host(job.id, "192.168.1.11".parse().unwrap(), "bb").await,
            Err(StoreError::JobNotFound(_))
        ));
    }
}
