//! Job Scheduler: submits window jobs under cluster ceilings
//!
//! Capacity is re-read from the cluster before every submission; the
//! scheduler keeps no counters of its own that outlive one check.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::artifact::{write_fasta, ArtifactLayout};
use crate::cluster::{ClusterClient, ClusterSnapshot};
use crate::config::{ClusterConfig, StageProfile, SyncConfig};
use crate::error::{OrchestratorError, Result};
use crate::fragment::Window;
use crate::job::{
    render_template, wrap_command, JobKey, JobRequest, Stage, WorkItem,
    WorkItemState,
};
use crate::report::RunReport;
use crate::resolver::WorkItemSpec;

/// Result of [`Scheduler::drain`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub done: usize,
    pub failed: usize,
    pub polls: usize,
}

pub struct Scheduler {
    cluster: Arc<dyn ClusterClient>,
    layout: ArtifactLayout,
    settings: ClusterConfig,
    benign: Vec<String>,
    poll_interval: Duration,
    tracked: Vec<WorkItem>,
}

impl Scheduler {
    pub fn new(config: &SyncConfig, cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            cluster,
            layout: ArtifactLayout::from_config(&config.paths),
            settings: config.cluster.clone(),
            benign: config.stderr_filter.clone(),
            poll_interval: Duration::from_secs(config.cluster.poll_interval_secs),
            tracked: Vec::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Windows submitted during this run
    pub fn tracked(&self) -> &[WorkItem] {
        &self.tracked
    }

    /// Block until the cluster has room, then return the least-loaded queue.
    ///
    /// Waits while the global job count is at the ceiling or while even the
    /// emptiest candidate queue is at the per-queue pending ceiling.
    pub async fn wait_for_capacity(&self, queues: &[String]) -> Result<String> {
        let mut waited = false;
        loop {
            let snapshot = self.cluster.snapshot().await?;
            let total = snapshot.total();
            if total >= self.settings.global_ceiling {
                self.log_backpressure(&mut waited, "global", total, self.settings.global_ceiling, None);
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            let (queue, pending) = least_loaded(&snapshot, queues)?;
            if pending >= self.settings.per_queue_ceiling {
                self.log_backpressure(
                    &mut waited,
                    "queue",
                    pending,
                    self.settings.per_queue_ceiling,
                    Some(queue.as_str()),
                );
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            if waited {
                info!(queue = %queue, total, "cluster capacity available again");
            }
            return Ok(queue);
        }
    }

    fn log_backpressure(&self, waited: &mut bool, scope: &str, count: usize, ceiling: usize, queue: Option<&str>) {
        if *waited {
            debug!(scope, count, ceiling, queue, "still waiting for capacity");
        } else {
            info!(
                scope,
                count,
                ceiling,
                queue,
                interval_secs = self.poll_interval.as_secs_f64(),
                "at job ceiling, waiting"
            );
            *waited = true;
        }
    }

    /// Submit every window of `item` whose artifact is missing.
    ///
    /// Refuses items with any job still queued or running. Returns the
    /// number of jobs submitted.
    pub async fn submit_work_item(&mut self, item: &WorkItemSpec, report: &mut RunReport) -> Result<usize> {
        let snapshot = self.cluster.snapshot().await?;
        if snapshot.in_flight_keys().contains(&item.key) {
            return Err(OrchestratorError::AlreadyInFlight(item.key.to_string()));
        }

        tokio::fs::create_dir_all(self.layout.scratch_dir(&item.key)).await?;

        let mut submitted = 0;
        for window in item.windows() {
            if self.layout.window_done(&item.key, window.index).await {
                info!(key = %item.key, fragment = window.index, "window artifact present, skipping");
                report.windows_present += 1;
                continue;
            }
            submitted += self.submit_window(item, &window, report).await?;
        }
        Ok(submitted)
    }

    async fn submit_window(&mut self, item: &WorkItemSpec, window: &Window, report: &mut RunReport) -> Result<usize> {
        let key = &item.key;
        let fasta = self.layout.fasta_path(key, window.index);
        write_fasta(&fasta, &format!("{}_F{}", key.accession, window.index), &window.sequence).await?;

        let mut work = WorkItem::new(key.clone(), window.index);
        let mut submitted = 0;

        let mut parent = None;
        if self.settings.two_phase {
            if self.layout.msa_complete(key, window.index).await {
                debug!(key = %key, fragment = window.index, "alignments present, skipping msa stage");
                report.msa_reused += 1;
            } else {
                let request = self.request(&self.settings.msa, item, window, Stage::Msa, None).await?;
                self.submit(&request, Stage::Msa, item, window).await?;
                work.submit_cpu(request.name.clone())?;
                report.record_submission(Stage::Msa);
                submitted += 1;
                parent = Some(request.name);
            }
        }

        let request = self
            .request(&self.settings.predict, item, window, Stage::Predict, parent)
            .await?;
        self.submit(&request, Stage::Predict, item, window).await?;
        work.submit_gpu(request.name.clone())?;
        report.record_submission(Stage::Predict);
        submitted += 1;

        self.tracked.push(work);
        Ok(submitted)
    }

    async fn submit(&self, request: &JobRequest, stage: Stage, item: &WorkItemSpec, window: &Window) -> Result<()> {
        let id = self.cluster.submit(request).await?;
        info!(
            key = %item.key,
            fragment = window.index,
            total = item.total_windows,
            stage = %stage,
            queue = %request.queue,
            job = %request.name,
            id = %id,
            after = request.dependency.as_deref().unwrap_or("-"),
            "submitted"
        );
        Ok(())
    }

    async fn request(
        &self,
        profile: &StageProfile,
        item: &WorkItemSpec,
        window: &Window,
        stage: Stage,
        dependency: Option<String>,
    ) -> Result<JobRequest> {
        let key = &item.key;
        let attempt = self.layout.next_attempt(key, window.index, stage).await;
        let name = JobKey {
            key: key.clone(),
            fragment: window.index,
            total: item.total_windows,
            stage,
            attempt,
        }
        .encode();

        let scratch = self.layout.scratch_dir(key);
        let fragment = window.index.to_string();
        let fasta = self.layout.fasta_path(key, window.index);
        let msa_dir = self.layout.msa_dir(key, window.index);
        let artifact = self.layout.artifact_path(key, window.index);
        let scratch_str = scratch.display().to_string();
        let fasta_str = fasta.display().to_string();
        let msa_str = msa_dir.display().to_string();
        let artifact_str = artifact.display().to_string();

        let tool = render_template(
            &profile.command,
            &[
                ("accession", key.accession.as_str()),
                ("fragment", fragment.as_str()),
                ("fasta", fasta_str.as_str()),
                ("scratch", scratch_str.as_str()),
                ("msa_dir", msa_str.as_str()),
                ("artifact", artifact_str.as_str()),
            ],
        );
        let log = self.layout.log_stem(key, window.index, stage, attempt);

        let queue = self.wait_for_capacity(&profile.queues).await?;
        Ok(JobRequest {
            name,
            queue,
            cpus: profile.cpus,
            mem_gb: profile.mem_gb,
            gpus: profile.gpus,
            dependency,
            command: wrap_command(&scratch, &tool, &log, &self.benign),
        })
    }

    /// Block until every job submitted in this run has left the cluster.
    ///
    /// A window counts as done when its artifact exists afterwards; anything
    /// else is failed and simply stays wanted for the next pass.
    pub async fn drain(&mut self, report: &mut RunReport) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        loop {
            let snapshot = self.cluster.snapshot().await?;
            summary.polls += 1;

            let mut open = 0;
            for work in self.tracked.iter_mut().filter(|w| !w.state.is_terminal()) {
                if !step(work, &snapshot, &self.layout, self.cluster.as_ref()).await? {
                    open += 1;
                }
            }

            if open == 0 {
                break;
            }
            debug!(open, "draining");
            tokio::time::sleep(self.poll_interval).await;
        }

        for work in &self.tracked {
            match &work.state {
                WorkItemState::GpuDone { .. } => summary.done += 1,
                WorkItemState::Failed { stage, .. } => {
                    warn!(key = %work.key, fragment = work.fragment, stage = %stage, "window failed");
                    summary.failed += 1;
                }
                _ => {}
            }
        }
        report.windows_done += summary.done;
        report.windows_failed += summary.failed;
        info!(done = summary.done, failed = summary.failed, polls = summary.polls, "drain complete");
        self.tracked.clear();
        Ok(summary)
    }
}

/// Queue with the fewest pending jobs; ties go to the earliest configured
fn least_loaded(snapshot: &ClusterSnapshot, queues: &[String]) -> Result<(String, usize)> {
    queues
        .iter()
        .map(|q| (q.clone(), snapshot.pending_in(q)))
        .min_by_key(|(_, pending)| *pending)
        .ok_or_else(|| OrchestratorError::config("stage profile lists no queues"))
}

/// Advance one window against `snapshot`; true once it is terminal.
///
/// An msa job that leaves without its alignments fails the window and
/// takes the chained predict job with it; LSF holds a `done()` dependent
/// of a failed parent forever.
async fn step(
    work: &mut WorkItem,
    snapshot: &ClusterSnapshot,
    layout: &ArtifactLayout,
    cluster: &dyn ClusterClient,
) -> Result<bool> {
    let Some((job, _)) = work.state.current_job() else {
        return Ok(work.state.is_terminal());
    };
    let state = snapshot.state_of(job);
    if !work.observe(state)? {
        if !matches!(work.state, WorkItemState::CpuDone { .. }) {
            return Ok(false);
        }
        if !layout.msa_complete(&work.key, work.fragment).await {
            warn!(
                key = %work.key,
                fragment = work.fragment,
                job = work.predict_job.as_deref().unwrap_or("-"),
                "msa job left without alignments; killing the predict job"
            );
            if let Some(job) = &work.predict_job {
                cluster.kill(job).await?;
            }
            work.fail(Stage::Msa)?;
            return Ok(true);
        }
        work.release_gpu()?;
        debug!(key = %work.key, fragment = work.fragment, "alignments ready, predict stage released");
        let Some((job, _)) = work.state.current_job() else {
            return Ok(false);
        };
        let state = snapshot.state_of(job);
        if !work.observe(state)? {
            return Ok(false);
        }
    }

    let present = layout.window_done(&work.key, work.fragment).await;
    work.settle(present)?;
    Ok(true)
}
