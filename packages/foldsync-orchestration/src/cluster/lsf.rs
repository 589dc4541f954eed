//! IBM Spectrum LSF via `bjobs` / `bsub` / `bkill`

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use super::{ActiveJob, ClusterClient};
use crate::error::{OrchestratorError, Result};
use crate::job::{ClusterState, JobRequest};

const NO_JOBS: &str = "No unfinished job found";
const ALREADY_FINISHED: &str = "Job has already finished";

pub struct LsfClient {
    bjobs: String,
    bsub: String,
    bkill: String,
    submitted: Regex,
}

impl LsfClient {
    pub fn new() -> Self {
        Self::with_programs("bjobs", "bsub", "bkill")
    }

    /// Use alternative executables (wrappers, site-specific paths)
    pub fn with_programs(
        bjobs: impl Into<String>,
        bsub: impl Into<String>,
        bkill: impl Into<String>,
    ) -> Self {
        Self {
            bjobs: bjobs.into(),
            bsub: bsub.into(),
            bkill: bkill.into(),
            submitted: Regex::new(r"Job <(\d+)>").expect("submission pattern is valid"),
        }
    }
}

impl Default for LsfClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for LsfClient {
    async fn active_jobs(&self) -> Result<Vec<ActiveJob>> {
        let output = Command::new(&self.bjobs)
            .arg("-w")
            .output()
            .await
            .map_err(|e| OrchestratorError::cluster(&self.bjobs, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains(NO_JOBS) && stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        if !output.status.success() {
            return Err(OrchestratorError::cluster(
                &self.bjobs,
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(parse_bjobs(&stdout))
    }

    async fn submit(&self, request: &JobRequest) -> Result<String> {
        let output = Command::new(&self.bsub)
            .args(request.bsub_args())
            .output()
            .await
            .map_err(|e| OrchestratorError::cluster(&self.bsub, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(OrchestratorError::cluster(
                &self.bsub,
                format!(
                    "{} for {}: {}",
                    output.status,
                    request.name,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        let id = self
            .submitted
            .captures(&stdout)
            .map(|c| c[1].to_string())
            .ok_or_else(|| {
                OrchestratorError::cluster(&self.bsub, format!("unexpected output: {}", stdout.trim()))
            })?;
        debug!(job = %request.name, id = %id, queue = %request.queue, "bsub accepted job");
        Ok(id)
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let output = Command::new(&self.bkill)
            .args(["-J", name])
            .output()
            .await
            .map_err(|e| OrchestratorError::cluster(&self.bkill, e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        // the job may have ended between the listing and the kill
        if !output.status.success() && !stderr.contains(NO_JOBS) && !stderr.contains(ALREADY_FINISHED) {
            return Err(OrchestratorError::cluster(
                &self.bkill,
                format!("{} for {}: {}", output.status, name, stderr.trim()),
            ));
        }
        debug!(job = %name, "bkill accepted");
        Ok(())
    }
}

fn lsf_state(stat: &str) -> ClusterState {
    match stat {
        "PEND" | "PSUSP" => ClusterState::Queued,
        "DONE" | "EXIT" => ClusterState::Done,
        _ => ClusterState::Running,
    }
}

/// Parse `bjobs -w` output.
///
/// Columns are `JOBID USER STAT QUEUE FROM_HOST EXEC_HOST JOB_NAME SUBMIT_TIME`
/// where EXEC_HOST is blank for pending jobs and SUBMIT_TIME spans three
/// tokens, so the name is taken as the fourth token from the end.
pub fn parse_bjobs(output: &str) -> Vec<ActiveJob> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.starts_with("JOBID"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 7 {
                debug!(line, "skipping unparseable bjobs line");
                return None;
            }
            Some(ActiveJob {
                id: tokens[0].to_string(),
                state: lsf_state(tokens[2]),
                queue: tokens[3].to_string(),
                name: tokens[tokens.len() - 4].to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
JOBID   USER    STAT  QUEUE      FROM_HOST   EXEC_HOST   JOB_NAME   SUBMIT_TIME
81234   annot   RUN   gpu        login-1     8*gpu-07    fs1.P04637.recomputed.1.1.predict.1 Oct 16 09:12
81235   annot   PEND  standard   login-1                 fs1.Q9Y6K9.recomputed.2.8.msa.1 Oct 16 09:13
81236   annot   PSUSP gpu        login-1                 fs1.Q9Y6K9.recomputed.2.8.predict.1 Oct 16 09:13
81237   annot   DONE  gpu        login-1     gpu-02      legacy_job Oct 15 22:01
";

    #[test]
    fn test_parse_bjobs_listing() {
        let jobs = parse_bjobs(LISTING);
        assert_eq!(jobs.len(), 4);

        assert_eq!(jobs[0].id, "81234");
        assert_eq!(jobs[0].state, ClusterState::Running);
        assert_eq!(jobs[0].queue, "gpu");
        assert_eq!(jobs[0].name, "fs1.P04637.recomputed.1.1.predict.1");

        // blank EXEC_HOST
        assert_eq!(jobs[1].state, ClusterState::Queued);
        assert_eq!(jobs[1].queue, "standard");
        assert_eq!(jobs[1].name, "fs1.Q9Y6K9.recomputed.2.8.msa.1");

        assert_eq!(jobs[2].state, ClusterState::Queued);
        assert_eq!(jobs[3].state, ClusterState::Done);
        assert_eq!(jobs[3].name, "legacy_job");
    }

    #[test]
    fn test_parse_bjobs_empty() {
        assert!(parse_bjobs("").is_empty());
        assert!(parse_bjobs("JOBID USER STAT QUEUE FROM_HOST EXEC_HOST JOB_NAME SUBMIT_TIME\n").is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_transient_cluster_error() {
        let client = LsfClient::with_programs("/nonexistent/bjobs", "/nonexistent/bsub", "/nonexistent/bkill");
        let err = client.active_jobs().await.unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Transient);
        let err = client.kill("fs1.P1.recomputed.1.1.predict.1").await.unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Transient);
    }
}
