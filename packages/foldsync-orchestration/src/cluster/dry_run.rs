//! In-process cluster for `--dry-run` and tests

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ActiveJob, ClusterClient};
use crate::error::{OrchestratorError, Result};
use crate::job::{ClusterState, JobRequest};

#[derive(Debug, Clone)]
struct DryRunJob {
    id: String,
    request: JobRequest,
    state: ClusterState,
}

#[derive(Debug, Default)]
struct DryRunState {
    next_id: u64,
    jobs: Vec<DryRunJob>,
    /// Foreign running jobs reported on successive listings
    external_load: VecDeque<usize>,
    listings: usize,
    refuse_submissions: bool,
}

/// Records submissions instead of running them.
///
/// In auto-advance mode every listing moves each job one step along
/// queued → running → done, holding jobs whose dependency has not finished.
pub struct DryRunCluster {
    state: Mutex<DryRunState>,
    auto_advance: bool,
}

impl DryRunCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DryRunState {
                next_id: 1,
                ..Default::default()
            }),
            auto_advance: false,
        }
    }

    pub fn auto_advancing() -> Self {
        Self {
            auto_advance: true,
            ..Self::new()
        }
    }

    /// Report `counts[i]` foreign running jobs on listing `i`; zero afterwards
    pub fn with_external_load(self, counts: impl IntoIterator<Item = usize>) -> Self {
        self.state.lock().external_load = counts.into_iter().collect();
        self
    }

    /// Make every subsequent `submit` fail
    pub fn refuse_submissions(&self, refuse: bool) {
        self.state.lock().refuse_submissions = refuse;
    }

    pub fn submissions(&self) -> Vec<JobRequest> {
        self.state.lock().jobs.iter().map(|j| j.request.clone()).collect()
    }

    /// Number of `active_jobs` calls so far
    pub fn listings(&self) -> usize {
        self.state.lock().listings
    }

    pub fn state_of(&self, name: &str) -> ClusterState {
        self.state
            .lock()
            .jobs
            .iter()
            .rev()
            .find(|j| j.request.name == name)
            .map(|j| j.state)
            .unwrap_or(ClusterState::Absent)
    }

    pub fn start(&self, name: &str) -> Result<()> {
        self.set_state(name, ClusterState::Running)
    }

    /// Send a running job back to pending, as preemption or `brequeue` does
    pub fn requeue(&self, name: &str) -> Result<()> {
        self.set_state(name, ClusterState::Queued)
    }

    /// Mark a job finished; exit status is not modelled
    pub fn finish(&self, name: &str) -> Result<()> {
        self.set_state(name, ClusterState::Done)
    }

    pub fn finish_all(&self) {
        for job in self.state.lock().jobs.iter_mut() {
            job.state = ClusterState::Done;
        }
    }

    fn set_state(&self, name: &str, state: ClusterState) -> Result<()> {
        let mut guard = self.state.lock();
        let job = guard
            .jobs
            .iter_mut()
            .rev()
            .find(|j| j.request.name == name)
            .ok_or_else(|| OrchestratorError::cluster("dry-run", format!("no job named {}", name)))?;
        job.state = state;
        Ok(())
    }
}

impl Default for DryRunCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn advance(jobs: &mut [DryRunJob]) {
    let done: Vec<String> = jobs
        .iter()
        .filter(|j| j.state == ClusterState::Done)
        .map(|j| j.request.name.clone())
        .collect();
    for job in jobs.iter_mut() {
        job.state = match job.state {
            ClusterState::Queued => {
                let blocked = job
                    .request
                    .dependency
                    .as_ref()
                    .is_some_and(|parent| !done.contains(parent));
                if blocked {
                    ClusterState::Queued
                } else {
                    ClusterState::Running
                }
            }
            ClusterState::Running => ClusterState::Done,
            other => other,
        };
    }
}

#[async_trait]
impl ClusterClient for DryRunCluster {
    async fn active_jobs(&self) -> Result<Vec<ActiveJob>> {
        let mut guard = self.state.lock();
        guard.listings += 1;
        if self.auto_advance {
            advance(&mut guard.jobs);
        }

        let foreign = guard.external_load.pop_front().unwrap_or(0);
        let mut jobs: Vec<ActiveJob> = (0..foreign)
            .map(|i| ActiveJob {
                id: format!("ext-{}", i),
                name: format!("external_{}", i),
                queue: "shared".to_string(),
                state: ClusterState::Running,
            })
            .collect();
        jobs.extend(guard.jobs.iter().map(|j| ActiveJob {
            id: j.id.clone(),
            name: j.request.name.clone(),
            queue: j.request.queue.clone(),
            state: j.state,
        }));
        Ok(jobs)
    }

    async fn submit(&self, request: &JobRequest) -> Result<String> {
        let mut guard = self.state.lock();
        if guard.refuse_submissions {
            return Err(OrchestratorError::cluster("dry-run", "submission refused"));
        }
        let id = guard.next_id.to_string();
        guard.next_id += 1;
        guard.jobs.push(DryRunJob {
            id: id.clone(),
            request: request.clone(),
            state: ClusterState::Queued,
        });
        tracing::info!(job = %request.name, queue = %request.queue, "dry-run: would submit");
        Ok(id)
    }

    /// Killed jobs end like any other; the submission record is kept
    async fn kill(&self, name: &str) -> Result<()> {
        let mut guard = self.state.lock();
        if let Some(job) = guard
            .jobs
            .iter_mut()
            .filter(|j| j.state.is_active())
            .find(|j| j.request.name == name)
        {
            job.state = ClusterState::Done;
            tracing::info!(job = %name, "dry-run: would kill");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, dependency: Option<&str>) -> JobRequest {
        JobRequest {
            name: name.to_string(),
            queue: "gpu".to_string(),
            cpus: 1,
            mem_gb: 1,
            gpus: None,
            dependency: dependency.map(str::to_string),
            command: "true".to_string(),
        }
    }

    #[tokio::test]
    async fn test_records_submissions() {
        let cluster = DryRunCluster::new();
        let id = cluster.submit(&request("a", None)).await.unwrap();
        assert_eq!(id, "1");
        assert_eq!(cluster.submissions().len(), 1);
        assert_eq!(cluster.state_of("a"), ClusterState::Queued);

        cluster.start("a").unwrap();
        cluster.finish("a").unwrap();
        assert_eq!(cluster.state_of("a"), ClusterState::Done);
        assert!(cluster.finish("missing").is_err());
    }

    #[tokio::test]
    async fn test_auto_advance_respects_dependencies() {
        let cluster = DryRunCluster::auto_advancing();
        cluster.submit(&request("msa", None)).await.unwrap();
        cluster.submit(&request("gpu", Some("msa"))).await.unwrap();

        cluster.active_jobs().await.unwrap();
        assert_eq!(cluster.state_of("msa"), ClusterState::Running);
        assert_eq!(cluster.state_of("gpu"), ClusterState::Queued);

        cluster.active_jobs().await.unwrap();
        assert_eq!(cluster.state_of("msa"), ClusterState::Done);
        assert_eq!(cluster.state_of("gpu"), ClusterState::Queued);

        cluster.active_jobs().await.unwrap();
        cluster.active_jobs().await.unwrap();
        assert_eq!(cluster.state_of("gpu"), ClusterState::Done);
    }

    #[tokio::test]
    async fn test_external_load_script() {
        let cluster = DryRunCluster::new().with_external_load([5, 5, 2]);
        let mut counts = Vec::new();
        for _ in 0..4 {
            counts.push(cluster.active_jobs().await.unwrap().len());
        }
        assert_eq!(counts, vec![5, 5, 2, 0]);
        assert_eq!(cluster.listings(), 4);
    }

    #[tokio::test]
    async fn test_kill_ends_active_job() {
        let cluster = DryRunCluster::new();
        cluster.submit(&request("a", None)).await.unwrap();
        cluster.kill("a").await.unwrap();
        assert_eq!(cluster.state_of("a"), ClusterState::Done);
        assert_eq!(cluster.submissions().len(), 1);
        cluster.kill("missing").await.unwrap();
    }

    #[test]
    fn test_refused_submission() {
        let cluster = DryRunCluster::new();
        cluster.refuse_submissions(true);
        tokio_test::assert_err!(tokio_test::block_on(cluster.submit(&request("a", None))));

        cluster.refuse_submissions(false);
        tokio_test::assert_ok!(tokio_test::block_on(cluster.submit(&request("a", None))));
        assert_eq!(cluster.submissions().len(), 1);
    }
}
