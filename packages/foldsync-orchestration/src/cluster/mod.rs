//! Client side of the external batch scheduler
//!
//! The orchestrator never caches job state across runs: every decision is
//! taken against a fresh [`ClusterSnapshot`].

pub mod dry_run;
pub mod lsf;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use foldsync_storage::AccessionKey;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::{ClusterState, JobKey, JobRequest};

pub use dry_run::DryRunCluster;
pub use lsf::LsfClient;

/// One job as listed by the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveJob {
    pub id: String,
    pub name: String,
    pub queue: String,
    pub state: ClusterState,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Current job listing
    async fn active_jobs(&self) -> Result<Vec<ActiveJob>>;

    /// Submit one job, returning the cluster's job id
    async fn submit(&self, request: &JobRequest) -> Result<String>;

    /// Remove a queued or running job by name
    async fn kill(&self, name: &str) -> Result<()>;

    async fn snapshot(&self) -> Result<ClusterSnapshot> {
        Ok(ClusterSnapshot::new(self.active_jobs().await?))
    }
}

/// Point-in-time view of the cluster
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    jobs: Vec<ActiveJob>,
}

impl ClusterSnapshot {
    pub fn new(jobs: Vec<ActiveJob>) -> Self {
        Self { jobs }
    }

    pub fn jobs(&self) -> &[ActiveJob] {
        &self.jobs
    }

    /// Queued plus running jobs across all queues
    pub fn total(&self) -> usize {
        self.jobs.iter().filter(|j| j.state.is_active()).count()
    }

    pub fn pending_in(&self, queue: &str) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.queue == queue && j.state == ClusterState::Queued)
            .count()
    }

    /// Pending counts for `queues`, zero for queues with no jobs
    pub fn pending_by_queue(&self, queues: &[String]) -> BTreeMap<String, usize> {
        queues
            .iter()
            .map(|q| (q.clone(), self.pending_in(q)))
            .collect()
    }

    pub fn state_of(&self, name: &str) -> ClusterState {
        self.jobs
            .iter()
            .find(|j| j.name == name)
            .map(|j| j.state)
            .unwrap_or(ClusterState::Absent)
    }

    /// Decoded keys of our own active jobs; foreign names are skipped
    pub fn in_flight_jobs(&self) -> Vec<JobKey> {
        self.jobs
            .iter()
            .filter(|j| j.state.is_active())
            .filter_map(|j| JobKey::decode(&j.name))
            .collect()
    }

    pub fn in_flight_keys(&self) -> BTreeSet<AccessionKey> {
        self.in_flight_jobs().into_iter().map(|j| j.key).collect()
    }
}
