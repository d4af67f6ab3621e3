//! # Run Sync Orchestrator
//!
//! Facade over the store, the remote gateway and the job scheduler. It is
//! the single source of truth for which runs exist locally and which
//! mutations still have to reach the remote service.
//!
//! Interactive mutations commit locally first (run + pending record in one
//! transaction) and return as soon as that commit lands. Remote confirmation
//! happens in background jobs whose outcome is visible only through the
//! presence or absence of pending records.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::gateway::RemoteRunGateway;
use crate::jobs::{JobHandle, JobScheduler, RetryableJob};
use crate::persistence::{DeleteOutcome, RunStore};
use crate::types::{Run, RunId};

pub struct RunSyncOrchestrator {
    store: Arc<RunStore>,
    gateway: Arc<dyn RemoteRunGateway>,
    scheduler: JobScheduler,
    config: SyncConfig,
}

impl RunSyncOrchestrator {
    pub fn new(store: Arc<RunStore>, gateway: Arc<dyn RemoteRunGateway>, config: SyncConfig) -> Self {
        crate::init_logging();
        let scheduler = JobScheduler::new(Arc::clone(&store), Arc::clone(&gateway), config.clone());
        Self {
            store,
            gateway,
            scheduler,
            config,
        }
    }

    /// Open the store at `db_path` and build an orchestrator on top of it.
    pub fn open(
        db_path: impl AsRef<Path>,
        gateway: Arc<dyn RemoteRunGateway>,
        config: SyncConfig,
    ) -> Result<Self> {
        let store = Arc::new(RunStore::open(db_path)?);
        Ok(Self::new(store, gateway, config))
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// Locally known runs, newest first. Every local commit is delivered,
    /// whether or not it has been synced.
    pub fn observe_runs(&self) -> watch::Receiver<Vec<Run>> {
        self.store.subscribe()
    }

    /// Pull the remote list and merge it into the local cache. A network
    /// failure leaves local state untouched.
    pub async fn fetch_runs(&self) -> Result<Vec<Run>> {
        let remote = self.gateway.fetch_runs().await?;
        self.store.merge_remote_runs(&remote)?;
        Ok(self.store.runs()?)
    }

    /// Save a run locally and schedule its upload. A run without id gets a
    /// fresh one, which is returned.
    ///
    /// Must be called from within a tokio runtime.
    pub fn upsert_run(&self, mut run: Run, map_image: &[u8]) -> Result<RunId> {
        let id = run.id.get_or_insert_with(RunId::generate).clone();
        self.store.upsert_run_with_pending(&run, map_image)?;
        self.scheduler.schedule(RetryableJob::Create(id.clone()));
        info!("[RunSyncOrchestrator] Upserted run {}", id);
        Ok(id)
    }

    /// Delete a run locally. Returns the Delete job, or None when the run
    /// never reached the remote and nothing has to be deleted there.
    ///
    /// Must be called from within a tokio runtime.
    pub fn delete_run(&self, id: &RunId) -> Result<Option<JobHandle>> {
        match self.store.delete_run_with_pending(id)? {
            DeleteOutcome::LocalOnly => {
                info!("[RunSyncOrchestrator] Deleted local-only run {}", id);
                Ok(None)
            }
            DeleteOutcome::RemoteDeleteRequired => {
                info!("[RunSyncOrchestrator] Deleted run {}, remote delete pending", id);
                Ok(Some(self.scheduler.schedule(RetryableJob::Delete(id.clone()))))
            }
        }
    }

    /// (Re)schedule a job for every outstanding pending record, e.g. after a
    /// restart or when connectivity returns.
    pub fn sync_pending_runs(&self) -> Result<Vec<JobHandle>> {
        let creates = self.store.pending_creates()?;
        let deletes = self.store.pending_deletes()?;
        debug!(
            "[RunSyncOrchestrator] Syncing {} pending creates, {} pending deletes",
            creates.len(),
            deletes.len()
        );

        let create_jobs = creates
            .iter()
            .filter_map(|pending| pending.run_id().cloned())
            .map(RetryableJob::Create);
        let delete_jobs = deletes
            .into_iter()
            .map(|pending| RetryableJob::Delete(pending.run_id));

        Ok(create_jobs
            .chain(delete_jobs)
            .map(|job| self.scheduler.schedule(job))
            .collect())
    }

    /// Start the periodic remote fetch at the configured interval.
    pub fn schedule_periodic_fetch(&self) -> JoinHandle<()> {
        self.scheduler
            .schedule_periodic_fetch(self.config.fetch_interval)
    }

    /// Clear every run, pending record and the tracking state. Local only.
    pub fn delete_all_runs(&self) -> Result<()> {
        self.store.delete_all()?;
        Ok(())
    }

    /// Invalidate the remote session. Callers clear local state only after
    /// this returns Ok.
    pub async fn logout(&self) -> Result<()> {
        self.gateway.logout().await?;
        info!("[RunSyncOrchestrator] Logged out");
        Ok(())
    }
}
