use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use foldsync_storage::{AccessionKey, SourceFlag};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of every job name this tool submits; bump on format changes
pub const JOB_NAME_VERSION: &str = "fs1";

/// Job stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// CPU pre-stage building the alignments
    Msa,
    /// GPU main stage producing the window artifact
    Predict,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Msa => "msa",
            Stage::Predict => "predict",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "msa" => Ok(Stage::Msa),
            "predict" => Ok(Stage::Predict),
            _ => Err(OrchestratorError::parse(format!("Invalid stage: {}", s))),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured identity of one cluster job.
///
/// Encoded as `fs1.{accession}.{source_flag}.{fragment}.{total}.{stage}.{attempt}`
/// with every accession byte outside `[A-Za-z0-9]` written as `_XX` (hex),
/// so the name survives the scheduler's character restrictions and splits
/// unambiguously on `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub key: AccessionKey,
    pub fragment: u32,
    pub total: u32,
    pub stage: Stage,
    pub attempt: u32,
}

impl JobKey {
    pub fn encode(&self) -> String {
        format!(
            "{}.{}.{}.{}.{}.{}.{}",
            JOB_NAME_VERSION,
            escape_accession(&self.key.accession),
            self.key.source_flag.as_str(),
            self.fragment,
            self.total,
            self.stage.as_str(),
            self.attempt
        )
    }

    /// Decode a job name; foreign or malformed names yield `None`
    pub fn decode(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split('.').collect();
        let [version, acc, flag, fragment, total, stage, attempt] = parts.as_slice() else {
            return None;
        };
        if *version != JOB_NAME_VERSION {
            return None;
        }
        let accession = unescape_accession(acc)?;
        if accession.is_empty() {
            return None;
        }
        let fragment: u32 = fragment.parse().ok()?;
        let total: u32 = total.parse().ok()?;
        if fragment == 0 || fragment > total {
            return None;
        }
        Some(Self {
            key: AccessionKey::new(accession, SourceFlag::from_str(flag).ok()?),
            fragment,
            total,
            stage: Stage::from_str(stage).ok()?,
            attempt: attempt.parse().ok()?,
        })
    }
}

fn escape_accession(accession: &str) -> String {
    let mut out = String::with_capacity(accession.len());
    for byte in accession.bytes() {
        if byte.is_ascii_alphanumeric() {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{:02X}", byte));
        }
    }
    out
}

fn unescape_accession(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                let hex = escaped.get(i + 1..i + 3)?;
                if !hex.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b)) {
                    return None;
                }
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b if b.is_ascii_alphanumeric() => {
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}

/// Job state as reported by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Queued,
    Running,
    /// Terminal, successful or not; exit codes are not inspected
    Done,
    /// Not listed at all
    Absent,
}

impl ClusterState {
    pub fn is_active(&self) -> bool {
        matches!(self, ClusterState::Queued | ClusterState::Running)
    }
}

/// One submission to the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub name: String,
    pub queue: String,
    pub cpus: u32,
    pub mem_gb: u32,
    pub gpus: Option<u32>,
    /// Name of a job that must finish successfully first
    pub dependency: Option<String>,
    pub command: String,
}

impl JobRequest {
    /// Arguments for `bsub`
    pub fn bsub_args(&self) -> Vec<String> {
        let mut args = vec![
            "-J".to_string(),
            self.name.clone(),
            "-q".to_string(),
            self.queue.clone(),
            "-n".to_string(),
            self.cpus.to_string(),
            "-R".to_string(),
            format!("rusage[mem={}G]", self.mem_gb),
            "-R".to_string(),
            "span[hosts=1]".to_string(),
        ];
        if let Some(gpus) = self.gpus.filter(|n| *n > 0) {
            args.push("-gpu".to_string());
            args.push(format!("num={}/host", gpus));
        }
        if let Some(parent) = &self.dependency {
            args.push("-w".to_string());
            args.push(format!("done({})", parent));
        }
        args.push(self.command.clone());
        args
    }
}

/// Substitute `{name}` placeholders in a stage command template
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

/// Wrap `tool` so it runs inside `scratch`, logs to `{log_stem}.out/.err`
/// with benign stderr lines filtered, and removes both logs when the
/// filtered stderr is empty.
pub fn wrap_command(scratch: &Path, tool: &str, log_stem: &Path, benign: &[String]) -> String {
    let log = log_stem.display();
    let filter = if benign.is_empty() {
        "cat".to_string()
    } else {
        format!("grep -viP \"{}\"", escape_double_quoted(&benign.join("|")))
    };
    let script = format!(
        "cd {scratch}; {tool} > {log}.out 2> >({filter} > {log}.err); \
         if [[ ! -s {log}.err ]]; then rm -f {log}.out {log}.err; fi",
        scratch = scratch.display(),
    );
    format!("bash -c {}", single_quote(&script))
}

fn escape_double_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ═══════════════════════════════════════════════════════════════════════════
// Work-item state machine
// ═══════════════════════════════════════════════════════════════════════════

/// Lifecycle of one window within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkItemState {
    Unsubmitted,
    CpuSubmitted { job: String, at: DateTime<Utc> },
    CpuRunning { job: String, at: DateTime<Utc> },
    CpuDone { job: String, at: DateTime<Utc> },
    GpuSubmitted { job: String, at: DateTime<Utc> },
    GpuRunning { job: String, at: DateTime<Utc> },
    GpuDone { at: DateTime<Utc> },
    Failed { stage: Stage, at: DateTime<Utc> },
}

impl WorkItemState {
    pub fn state_name(&self) -> &'static str {
        match self {
            WorkItemState::Unsubmitted => "unsubmitted",
            WorkItemState::CpuSubmitted { .. } => "cpu_submitted",
            WorkItemState::CpuRunning { .. } => "cpu_running",
            WorkItemState::CpuDone { .. } => "cpu_done",
            WorkItemState::GpuSubmitted { .. } => "gpu_submitted",
            WorkItemState::GpuRunning { .. } => "gpu_running",
            WorkItemState::GpuDone { .. } => "gpu_done",
            WorkItemState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkItemState::GpuDone { .. } | WorkItemState::Failed { .. })
    }

    /// Name of the job the cluster is currently tracking for this item
    pub fn current_job(&self) -> Option<(&str, Stage)> {
        match self {
            WorkItemState::CpuSubmitted { job, .. }
            | WorkItemState::CpuRunning { job, .. }
            | WorkItemState::CpuDone { job, .. } => Some((job, Stage::Msa)),
            WorkItemState::GpuSubmitted { job, .. } | WorkItemState::GpuRunning { job, .. } => {
                Some((job, Stage::Predict))
            }
            _ => None,
        }
    }
}

/// State machine for one submitted window.
///
/// With a CPU stage the state follows the msa job until it leaves the
/// cluster, even though the predict job is already queued behind it; the
/// scheduler then checks the alignments and either releases the GPU stage
/// or fails the window. Never persisted: a new run rebuilds what it needs
/// from the cluster.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub key: AccessionKey,
    pub fragment: u32,
    pub state: WorkItemState,
    pub msa_job: Option<String>,
    pub predict_job: Option<String>,
}

impl WorkItem {
    pub fn new(key: AccessionKey, fragment: u32) -> Self {
        Self {
            key,
            fragment,
            state: WorkItemState::Unsubmitted,
            msa_job: None,
            predict_job: None,
        }
    }

    fn invalid(&self, to: &str) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.state.state_name().to_string(),
            to: to.to_string(),
        }
    }

    /// Transition: UNSUBMITTED → CPU_SUBMITTED
    pub fn submit_cpu(&mut self, job: String) -> Result<()> {
        match self.state {
            WorkItemState::Unsubmitted => {
                self.msa_job = Some(job.clone());
                self.state = WorkItemState::CpuSubmitted { job, at: Utc::now() };
                Ok(())
            }
            _ => Err(self.invalid("cpu_submitted")),
        }
    }

    /// Record the predict job.
    ///
    /// Without a CPU stage: UNSUBMITTED → GPU_SUBMITTED. Behind a CPU job the
    /// state stays on the CPU side until [`WorkItem::release_gpu`].
    pub fn submit_gpu(&mut self, job: String) -> Result<()> {
        match self.state {
            WorkItemState::Unsubmitted => {
                self.predict_job = Some(job.clone());
                self.state = WorkItemState::GpuSubmitted { job, at: Utc::now() };
                Ok(())
            }
            WorkItemState::CpuSubmitted { .. } | WorkItemState::CpuRunning { .. }
                if self.predict_job.is_none() =>
            {
                self.predict_job = Some(job);
                Ok(())
            }
            _ => Err(self.invalid("gpu_submitted")),
        }
    }

    /// Transition: CPU_DONE → GPU_SUBMITTED, tracking the chained predict job
    pub fn release_gpu(&mut self) -> Result<()> {
        let job = match (&self.state, &self.predict_job) {
            (WorkItemState::CpuDone { .. }, Some(job)) => job.clone(),
            _ => return Err(self.invalid("gpu_submitted")),
        };
        self.state = WorkItemState::GpuSubmitted { job, at: Utc::now() };
        Ok(())
    }

    /// Fold the cluster's view of the tracked job into the state.
    ///
    /// A running job seen as queued again (preemption, requeue) drops back
    /// to submitted. Returns true once the GPU job has left the cluster (or
    /// the item is already terminal); `settle` then decides between done
    /// and failed.
    pub fn observe(&mut self, cluster: ClusterState) -> Result<bool> {
        let at = Utc::now();
        match (&self.state, cluster) {
            (state, _) if state.is_terminal() => Ok(true),
            (WorkItemState::Unsubmitted, _) => Err(self.invalid("observed")),
            (WorkItemState::CpuDone { .. }, _) => Ok(false),
            (WorkItemState::CpuSubmitted { .. }, ClusterState::Queued)
            | (WorkItemState::GpuSubmitted { .. }, ClusterState::Queued) => Ok(false),
            (WorkItemState::CpuRunning { job, .. }, ClusterState::Queued) => {
                self.state = WorkItemState::CpuSubmitted { job: job.clone(), at };
                Ok(false)
            }
            (
                WorkItemState::CpuSubmitted { job, .. } | WorkItemState::CpuRunning { job, .. },
                ClusterState::Running,
            ) => {
                self.state = WorkItemState::CpuRunning { job: job.clone(), at };
                Ok(false)
            }
            (
                WorkItemState::CpuSubmitted { job, .. } | WorkItemState::CpuRunning { job, .. },
                ClusterState::Done | ClusterState::Absent,
            ) => {
                self.state = WorkItemState::CpuDone { job: job.clone(), at };
                Ok(false)
            }
            (WorkItemState::GpuRunning { job, .. }, ClusterState::Queued) => {
                self.state = WorkItemState::GpuSubmitted { job: job.clone(), at };
                Ok(false)
            }
            (
                WorkItemState::GpuSubmitted { job, .. } | WorkItemState::GpuRunning { job, .. },
                ClusterState::Running,
            ) => {
                self.state = WorkItemState::GpuRunning { job: job.clone(), at };
                Ok(false)
            }
            (
                WorkItemState::GpuSubmitted { .. } | WorkItemState::GpuRunning { .. },
                ClusterState::Done | ClusterState::Absent,
            ) => Ok(true),
            _ => Err(self.invalid("observed")),
        }
    }

    /// Transition: * → FAILED
    pub fn fail(&mut self, stage: Stage) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.invalid("failed"));
        }
        self.state = WorkItemState::Failed { stage, at: Utc::now() };
        Ok(())
    }

    /// Transition: GPU_* → GPU_DONE | FAILED, decided by the artifact on disk
    pub fn settle(&mut self, artifact_present: bool) -> Result<()> {
        match self.state {
            WorkItemState::GpuSubmitted { .. } | WorkItemState::GpuRunning { .. } => {
                let at = Utc::now();
                self.state = if artifact_present {
                    WorkItemState::GpuDone { at }
                } else {
                    WorkItemState::Failed { stage: Stage::Predict, at }
                };
                Ok(())
            }
            _ => Err(self.invalid("settled")),
        }
    }
}
