//! Result Reconciler: turn one work item's window artifacts into a
//! verified full-length record ready for the persistence gate.

use foldsync_storage::ReconciledRecord;
use tracing::{debug, error};

use crate::artifact::ArtifactLayout;
use crate::config::SyncConfig;
use crate::error::{OrchestratorError, Result};
use crate::fragment::{Recombiner, WindowResult};
use crate::resolver::WorkItemSpec;

pub struct Reconciler {
    layout: ArtifactLayout,
    recombiner: Recombiner,
}

impl Reconciler {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            layout: ArtifactLayout::from_config(&config.paths),
            recombiner: Recombiner::from_config(config),
        }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Discover, load, recombine and verify the artifacts of `item`.
    ///
    /// The returned record carries the registered sequence; its residue
    /// channel has been checked against the submitted one.
    pub async fn reconcile(&self, item: &WorkItemSpec) -> Result<ReconciledRecord> {
        let discovered = self.layout.discover(&item.key).await?;
        let fragments: Vec<u32> = discovered.iter().map(|a| a.name.fragment).collect();
        let expected: Vec<u32> = (1..=item.total_windows).collect();
        if fragments != expected {
            error!(
                key = %item.key,
                expected = ?expected,
                discovered = ?fragments,
                "fragment set does not match window count"
            );
            return Err(OrchestratorError::FragmentCountMismatch {
                key: item.key.to_string(),
                expected: item.total_windows as usize,
                discovered: fragments,
            });
        }

        let mut results: Vec<WindowResult> = Vec::with_capacity(discovered.len());
        for artifact in &discovered {
            results.push(self.layout.load(artifact).await?);
        }
        debug!(key = %item.key, windows = results.len(), "artifacts loaded");

        let mut recombiner = self.recombiner.clone().with_window_size(item.window_size);
        recombiner.stride = item.stride;
        let mut record = recombiner.recombine(&item.key, &results, item.total_windows as usize)?;

        if let Err(e) = Recombiner::verify(&record, &item.sequence) {
            if let OrchestratorError::SequenceMismatch { expected, observed, .. } = &e {
                error!(key = %item.key, %expected, %observed, "recombined sequence mismatch");
            }
            return Err(e);
        }

        record.sequence = item.canonical.clone();
        Ok(record)
    }
}
