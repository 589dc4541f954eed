/*
 * Foldsync Orchestration - structure database synchronisation
 *
 * Keeps per-residue structure annotations in step with an evolving
 * sequence database by fanning window jobs out to a batch cluster.
 *
 * Architecture:
 * - Resolver (wanted − in flight − completed)
 * - Fragmenter (overlapping windows, trimmed recombination)
 * - Scheduler (ceilings, queue balancing, chained stages, drain)
 * - Reconciler + Persistence Gate (two stores or neither)
 *
 * No local state survives a run: every pass re-reads the cluster and
 * the canonical stores.
 */

// Public modules
pub mod artifact;
pub mod cluster;
pub mod config;
pub mod error;
pub mod fragment;
pub mod gate;
pub mod job;
pub mod orchestrator;
pub mod reconciler;
pub mod report;
pub mod resolver;
pub mod scheduler;

// Re-exports
pub use artifact::{ArtifactLayout, ArtifactName};
pub use cluster::{ActiveJob, ClusterClient, ClusterSnapshot, DryRunCluster, LsfClient};
pub use config::SyncConfig;
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use fragment::{decompose, Recombiner, TrimPolicy, Window, WindowResult};
pub use gate::{CommitOutcome, PersistenceGate};
pub use job::{JobKey, JobRequest, Stage, WorkItem, WorkItemState};
pub use orchestrator::SyncOrchestrator;
pub use reconciler::Reconciler;
pub use report::RunReport;
pub use resolver::{Resolution, Resolver, SkipReason, WorkItemSpec};
pub use scheduler::{DrainSummary, Scheduler};
