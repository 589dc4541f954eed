use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use foldsync_storage::{AccessionKey, RecordStore, SequenceRecord, SourceFlag};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cluster::ClusterClient;
use crate::config::SyncConfig;
use crate::error::{OrchestratorError, Result};
use crate::gate::{CommitOutcome, PersistenceGate};
use crate::reconciler::Reconciler;
use crate::report::RunReport;
use crate::resolver::{Resolution, Resolver};
use crate::scheduler::Scheduler;

/// Binds one synchronisation pass together: audit, resolve, submit,
/// drain, reconcile, commit.
///
/// Holds no state between passes beyond its configuration; everything
/// else is re-read from the stores and the cluster.
pub struct SyncOrchestrator {
    config: SyncConfig,
    store: Arc<dyn RecordStore>,
    cluster: Arc<dyn ClusterClient>,
    poll_interval: Option<Duration>,
}

impl SyncOrchestrator {
    pub fn new(config: SyncConfig, store: Arc<dyn RecordStore>, cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            config,
            store,
            cluster,
            poll_interval: None,
        }
    }

    /// Override the configured cluster poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register every record of a FASTA file under `source_flag`
    pub async fn import_fasta(&self, path: &Path, source_flag: SourceFlag) -> Result<RunReport> {
        let mut report = RunReport::new(Uuid::new_v4());
        let bytes = tokio::fs::read(path).await?;
        let reader = bio::io::fasta::Reader::new(bytes.as_slice());

        for record in reader.records() {
            let record = record.map_err(OrchestratorError::parse)?;
            let accession = accession_from_header(record.id());
            let sequence = normalise_sequence(record.seq());
            let entry = SequenceRecord::new(accession, source_flag, sequence);

            match self.store.register_sequence(&entry).await {
                Ok(true) => report.imported += 1,
                Ok(false) => report.already_present += 1,
                Err(e) => self.isolate(&mut report, &entry.key, e.into())?,
            }
        }

        info!(
            path = %path.display(),
            imported = report.imported,
            already_present = report.already_present,
            "fasta imported"
        );
        report.finish();
        Ok(report)
    }

    /// Counts only; never submits, commits or deletes
    pub async fn status(&self) -> Result<RunReport> {
        let mut report = RunReport::new(Uuid::new_v4());
        let partial = self.store.partial_keys().await?;
        report.partial = partial.len();

        let excluded = if self.config.gate.keep_incompletes {
            partial
        } else {
            BTreeSet::new()
        };
        let resolution = self.resolver().resolve(excluded).await?;
        report.absorb_resolution(&resolution);
        report.finish();
        Ok(report)
    }

    /// Resolve and submit every pending work item; optionally drain
    pub async fn submit(&self, drain: bool) -> Result<RunReport> {
        let start = Instant::now();
        let mut report = RunReport::new(Uuid::new_v4());
        info!(run_id = %report.run_id, drain, "starting submit pass");

        let excluded = self.gate().audit(&mut report).await?;
        let resolution = self.resolver().resolve(excluded).await?;
        report.absorb_resolution(&resolution);

        let mut scheduler = self.scheduler();
        self.submit_pending(&mut scheduler, &resolution, &mut report).await?;
        if drain {
            scheduler.drain(&mut report).await?;
        }

        self.finish(report, start)
    }

    /// Reconcile and commit every artifact-complete work item
    pub async fn reconcile(&self) -> Result<RunReport> {
        let start = Instant::now();
        let mut report = RunReport::new(Uuid::new_v4());
        info!(run_id = %report.run_id, "starting reconcile pass");

        let excluded = self.gate().audit(&mut report).await?;
        let resolution = self.resolver().resolve(excluded).await?;
        report.absorb_resolution(&resolution);

        self.reconcile_ready(&resolution, &mut report).await?;
        self.finish(report, start)
    }

    /// Submit, drain, then reconcile whatever the drained jobs produced
    pub async fn run(&self) -> Result<RunReport> {
        let start = Instant::now();
        let mut report = RunReport::new(Uuid::new_v4());
        info!(run_id = %report.run_id, "starting full pass");

        let excluded = self.gate().audit(&mut report).await?;
        let resolver = self.resolver();
        let resolution = resolver.resolve(excluded.clone()).await?;
        report.absorb_resolution(&resolution);

        let mut scheduler = self.scheduler();
        self.submit_pending(&mut scheduler, &resolution, &mut report).await?;
        scheduler.drain(&mut report).await?;

        let resolution = resolver.resolve(excluded).await?;
        self.reconcile_ready(&resolution, &mut report).await?;
        self.finish(report, start)
    }

    async fn submit_pending(
        &self,
        scheduler: &mut Scheduler,
        resolution: &Resolution,
        report: &mut RunReport,
    ) -> Result<()> {
        for item in resolution.pending() {
            match scheduler.submit_work_item(item, report).await {
                Ok(jobs) => info!(key = %item.key, windows = item.total_windows, jobs, "work item submitted"),
                Err(e) => self.isolate(report, &item.key, e)?,
            }
        }
        Ok(())
    }

    async fn reconcile_ready(&self, resolution: &Resolution, report: &mut RunReport) -> Result<()> {
        let reconciler = self.reconciler();
        let gate = self.gate();

        for item in resolution.reconcilable() {
            let record = match reconciler.reconcile(item).await {
                Ok(record) => record,
                Err(e) => {
                    self.isolate(report, &item.key, e)?;
                    continue;
                }
            };
            match gate.commit(&record).await {
                Ok(CommitOutcome::Committed { .. }) => report.reconciled += 1,
                Ok(CommitOutcome::Partial) => report.partial += 1,
                Err(e) => self.isolate(report, &item.key, e)?,
            }
        }
        Ok(())
    }

    /// Record an item-local failure and carry on; anything else ends the run
    fn isolate(&self, report: &mut RunReport, key: &AccessionKey, e: OrchestratorError) -> Result<()> {
        let category = e.category();
        if !category.is_item_local() {
            error!(key = %key, category = %category, error = %e, "aborting run");
            return Err(e);
        }
        warn!(key = %key, category = %category, error = %e, "work item failed");
        report.record_failure(key, &e);
        Ok(())
    }

    fn finish(&self, mut report: RunReport, start: Instant) -> Result<RunReport> {
        report.finish();
        info!(
            run_id = %report.run_id,
            submitted = report.submitted_total(),
            reconciled = report.reconciled,
            failed = report.failed_total(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "pass complete"
        );
        Ok(report)
    }

    fn resolver(&self) -> Resolver {
        Resolver::new(&self.config, self.store.clone(), self.cluster.clone())
    }

    fn scheduler(&self) -> Scheduler {
        let scheduler = Scheduler::new(&self.config, self.cluster.clone());
        match self.poll_interval {
            Some(interval) => scheduler.with_poll_interval(interval),
            None => scheduler,
        }
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(&self.config)
    }

    fn gate(&self) -> PersistenceGate {
        PersistenceGate::new(&self.config, self.store.clone())
    }
}

/// `sp|P69905|HBA_HUMAN` and `tr|...|...` yield the middle field; anything
/// else is taken verbatim
pub fn accession_from_header(id: &str) -> &str {
    let mut fields = id.split('|');
    match (fields.next(), fields.next()) {
        (Some("sp" | "tr"), Some(accession)) if !accession.is_empty() => accession,
        _ => id,
    }
}

/// Uppercase, drop whitespace and a trailing stop
fn normalise_sequence(raw: &[u8]) -> String {
    let mut sequence: String = raw
        .iter()
        .filter(|b| !b.is_ascii_whitespace())
        .map(|b| b.to_ascii_uppercase() as char)
        .collect();
    if sequence.ends_with('*') {
        sequence.pop();
    }
    sequence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::DryRunCluster;
    use foldsync_storage::SqliteRecordStore;
    use std::io::Write;

    #[test]
    fn test_accession_from_header() {
        assert_eq!(accession_from_header("sp|P69905|HBA_HUMAN"), "P69905");
        assert_eq!(accession_from_header("tr|A0A024R161|A0A024R161_HUMAN"), "A0A024R161");
        assert_eq!(accession_from_header("P04637-2"), "P04637-2");
        assert_eq!(accession_from_header("sp||X"), "sp||X");
    }

    #[test]
    fn test_normalise_sequence() {
        assert_eq!(normalise_sequence(b"mkv la\n*"), "MKVLA");
    }

    #[tokio::test]
    async fn test_import_fasta_counts_new_and_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.fasta");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, ">sp|P69905|HBA_HUMAN Hemoglobin subunit alpha").unwrap();
        writeln!(file, "MVLSPADKTNVKAAWGKVGAHAGEYGAEALERMFLSFPTTKTYFPHF").unwrap();
        writeln!(file, ">Q00001").unwrap();
        writeln!(file, "mkvlaghe").unwrap();
        drop(file);

        let store = Arc::new(SqliteRecordStore::in_memory().unwrap());
        let orchestrator = SyncOrchestrator::new(
            SyncConfig::default(),
            store.clone(),
            Arc::new(DryRunCluster::new()),
        );

        let first = orchestrator.import_fasta(&path, SourceFlag::Recomputed).await.unwrap();
        assert_eq!((first.imported, first.already_present), (2, 0));
        let again = orchestrator.import_fasta(&path, SourceFlag::Recomputed).await.unwrap();
        assert_eq!((again.imported, again.already_present), (0, 2));

        let key = AccessionKey::new("Q00001", SourceFlag::Recomputed);
        let stored = store.get_sequence(&key).await.unwrap().unwrap();
        assert_eq!(stored.sequence, "MKVLAGHE");
    }

    #[tokio::test]
    async fn test_import_conflicting_sequence_is_item_local() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.fasta");
        std::fs::write(&path, ">P1\nMKVLAGHE\n>P2\nMKVL\n").unwrap();

        let store = Arc::new(SqliteRecordStore::in_memory().unwrap());
        store
            .register_sequence(&SequenceRecord::new("P1", SourceFlag::Recomputed, "MKVLAGHEW"))
            .await
            .unwrap();
        let orchestrator =
            SyncOrchestrator::new(SyncConfig::default(), store, Arc::new(DryRunCluster::new()));

        let report = orchestrator.import_fasta(&path, SourceFlag::Recomputed).await.unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(report.failed.get("data_integrity"), Some(&1));
        assert_eq!(report.failures[0].key, "P1/recomputed");
    }
}
