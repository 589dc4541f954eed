//! Persistence Gate: the only writer of reconciled records
//!
//! A key is committed to both stores or neither; after a commit the stores
//! are re-read and anything short of complete is treated as corruption.

use std::collections::BTreeSet;
use std::sync::Arc;

use foldsync_storage::{AccessionKey, CompletionStatus, RecordStore, ReconciledRecord};
use tracing::{error, info, warn};

use crate::artifact::ArtifactLayout;
use crate::config::{GateConfig, SyncConfig};
use crate::error::{OrchestratorError, Result};
use crate::report::RunReport;

/// Outcome of [`PersistenceGate::commit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Both stores agree and the scratch directory is gone
    Committed { files_removed: usize },
    /// Stores disagree; tolerated by policy, artifacts kept
    Partial,
}

pub struct PersistenceGate {
    store: Arc<dyn RecordStore>,
    layout: ArtifactLayout,
    policy: GateConfig,
}

impl PersistenceGate {
    pub fn new(config: &SyncConfig, store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            layout: ArtifactLayout::from_config(&config.paths),
            policy: config.gate.clone(),
        }
    }

    /// Check the stores for keys present on one side only.
    ///
    /// Fails the run unless partial records are allowed. Returns the keys
    /// that must be left alone this run (kept incompletes).
    pub async fn audit(&self, report: &mut RunReport) -> Result<BTreeSet<AccessionKey>> {
        let partial = self.store.partial_keys().await?;
        report.partial = partial.len();
        if partial.is_empty() {
            return Ok(BTreeSet::new());
        }

        let keys: Vec<String> = partial.iter().map(|k| k.to_string()).collect();
        if !self.policy.allow_partial {
            error!(count = keys.len(), keys = ?keys, "partial records in canonical stores");
            return Err(OrchestratorError::PartialCompletion { keys });
        }

        if self.policy.keep_incompletes {
            warn!(count = keys.len(), keys = ?keys, "keeping partial records, excluded from scheduling");
            return Ok(partial);
        }

        for key in &partial {
            self.store.delete_record(key).await?;
            report.partial_deleted += 1;
            warn!(key = %key, "deleted partial record before resubmission");
        }
        Ok(BTreeSet::new())
    }

    /// Commit `record`, confirm both stores agree, then remove its scratch files
    pub async fn commit(&self, record: &ReconciledRecord) -> Result<CommitOutcome> {
        self.store.commit_record(record).await?;

        let presence = self.store.presence(&record.key).await?;
        let status = presence.status();
        if status != CompletionStatus::Complete {
            if self.policy.allow_partial {
                warn!(key = %record.key, ?presence, "record committed but not complete, keeping artifacts");
                return Ok(CommitOutcome::Partial);
            }
            error!(key = %record.key, ?presence, "stores disagree after commit");
            return Err(OrchestratorError::PartialCompletion {
                keys: vec![record.key.to_string()],
            });
        }

        let files_removed = self.layout.cleanup(&record.key).await?;
        info!(
            key = %record.key,
            residues = presence.residue_rows,
            pairs = presence.pair_rows,
            no_contacts = presence.no_contacts,
            files_removed,
            "record committed"
        );
        Ok(CommitOutcome::Committed { files_removed })
    }
}
