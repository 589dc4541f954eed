/// Full synchronisation passes against an in-process cluster
///
/// The external tools never run here: tests play their part by writing
/// window artifacts into the scratch directories and finishing jobs.
use foldsync_orchestration::fragment::{PairObservation, ResidueObservation, WindowResult};
use foldsync_orchestration::{
    decompose, ArtifactLayout, DryRunCluster, OrchestratorError, Stage, SyncConfig, SyncOrchestrator,
};
use foldsync_storage::{
    AccessionKey, RecordStore, ReconciledRecord, ResidueRow, SequenceRecord, SourceFlag,
    SqliteRecordStore,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SHORT: &str = "MKVLAGHEWRTYSPQNDCFI";
const LONG: &str = "MKVLAGHEWRTYMKVLAGHEWRTYMKVLAGHEWRTY";
const WINDOW: usize = 16;
const STRIDE: usize = 8;

fn config(root: &Path) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.fragment.window_size = WINDOW;
    config.fragment.stride = STRIDE;
    config.fragment.unfragmented_max = 0;
    config.paths.scratch_root = root.join("tmp");
    config.paths.msa_root = root.join("msa");
    config
}

async fn store_with(sequences: &[(&str, &str)]) -> Arc<SqliteRecordStore> {
    let store = Arc::new(SqliteRecordStore::in_memory().unwrap());
    for (acc, seq) in sequences {
        store
            .register_sequence(&SequenceRecord::new(*acc, SourceFlag::Recomputed, *seq))
            .await
            .unwrap();
    }
    store
}

fn key(acc: &str) -> AccessionKey {
    AccessionKey::new(acc, SourceFlag::Recomputed)
}

/// Stand in for the predict stage: one artifact per window
async fn write_artifacts(layout: &ArtifactLayout, acc: &str, sequence: &str) {
    for window in decompose(sequence, WINDOW, STRIDE) {
        let result = WindowResult {
            accession: acc.to_string(),
            fragment: window.index,
            residues: window
                .sequence
                .chars()
                .enumerate()
                .map(|(i, aa)| ResidueObservation {
                    site: i as u32 + 1,
                    aa,
                    plddt: 85.0,
                    asa: 60.0,
                    rel_asa: 0.4,
                    sec: 'H',
                    phi: Some(-60.0),
                    psi: Some(-45.0),
                    omega: Some(180.0),
                    tau: Some(50.0),
                    chi: [Some(-65.0), None, None, None, None],
                })
                .collect(),
            pairs: vec![PairObservation {
                site1: 1,
                site2: 3,
                metric_type: "hbond".to_string(),
                value: 2.9,
            }],
        };
        let path = layout.artifact_path(&key(acc), window.index);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, serde_json::to_vec(&result).unwrap()).await.unwrap();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Submit → tool → reconcile
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_submit_then_reconcile_commits_both_items() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let layout = ArtifactLayout::from_config(&config.paths);
    let store = store_with(&[("P1", SHORT), ("Q1", LONG)]).await;
    let cluster = Arc::new(DryRunCluster::new());
    let orchestrator = SyncOrchestrator::new(config, store.clone(), cluster.clone());

    let submitted = orchestrator.submit(false).await.unwrap();
    let windows = decompose(SHORT, WINDOW, STRIDE).len() + decompose(LONG, WINDOW, STRIDE).len();
    assert_eq!(submitted.wanted, 2);
    assert_eq!(submitted.pending, 2);
    assert_eq!(submitted.submitted.get(Stage::Msa.as_str()), Some(&windows));
    assert_eq!(submitted.submitted.get(Stage::Predict.as_str()), Some(&windows));
    assert_eq!(cluster.submissions().len(), 2 * windows);

    // Every predict request waits on its own msa job
    let requests = cluster.submissions();
    for pair in requests.chunks(2) {
        assert_eq!(pair[1].dependency.as_deref(), Some(pair[0].name.as_str()));
    }

    write_artifacts(&layout, "P1", SHORT).await;
    write_artifacts(&layout, "Q1", LONG).await;
    cluster.finish_all();

    let reconciled = orchestrator.reconcile().await.unwrap();
    assert_eq!(reconciled.reconciled, 2);
    assert_eq!(reconciled.failed_total(), 0);

    let completed = store.completed_keys().await.unwrap();
    assert!(completed.contains(&key("P1")));
    assert!(completed.contains(&key("Q1")));
    assert_eq!(store.residues(&key("Q1")).await.unwrap().len(), LONG.len());
    assert!(!layout.scratch_dir(&key("P1")).exists());
    assert!(!layout.scratch_dir(&key("Q1")).exists());

    let status = orchestrator.status().await.unwrap();
    assert_eq!(status.completed, 2);
    assert_eq!(status.pending, 0);
    assert_eq!(status.partial, 0);
}

#[tokio::test]
async fn test_in_flight_items_are_not_resubmitted() {
    let dir = TempDir::new().unwrap();
    let store = store_with(&[("P1", SHORT)]).await;
    let cluster = Arc::new(DryRunCluster::new());
    let orchestrator = SyncOrchestrator::new(config(dir.path()), store, cluster.clone());

    let first = orchestrator.submit(false).await.unwrap();
    let jobs = cluster.submissions().len();
    assert!(first.submitted_total() > 0);

    let second = orchestrator.submit(false).await.unwrap();
    assert_eq!(second.in_flight, 1);
    assert_eq!(second.pending, 0);
    assert_eq!(second.submitted_total(), 0);
    assert_eq!(cluster.submissions().len(), jobs);
}

#[tokio::test]
async fn test_present_artifacts_skip_submission() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let layout = ArtifactLayout::from_config(&config.paths);
    let store = store_with(&[("P1", SHORT), ("Q1", LONG)]).await;
    let cluster = Arc::new(DryRunCluster::new());
    let orchestrator = SyncOrchestrator::new(config, store.clone(), cluster.clone());

    write_artifacts(&layout, "P1", SHORT).await;
    let report = orchestrator.submit(false).await.unwrap();

    // P1 is artifact-complete: reconcile material, not scheduling material
    assert_eq!(report.pending, 1);
    assert!(cluster.submissions().iter().all(|r| r.name.contains(".Q1.")));
}

// ═══════════════════════════════════════════════════════════════════════════
// Failure by omission
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_run_without_artifacts_leaves_item_wanted() {
    let dir = TempDir::new().unwrap();
    let store = store_with(&[("P1", SHORT)]).await;
    let cluster = Arc::new(DryRunCluster::auto_advancing());
    let orchestrator = SyncOrchestrator::new(config(dir.path()), store.clone(), cluster)
        .with_poll_interval(Duration::from_millis(1));

    let report = orchestrator.run().await.unwrap();
    let windows = decompose(SHORT, WINDOW, STRIDE).len();
    assert_eq!(report.windows_done, 0);
    assert_eq!(report.windows_failed, windows);
    assert_eq!(report.reconciled, 0);
    assert_eq!(report.failed_total(), 0);

    assert!(store.completed_keys().await.unwrap().is_empty());
    let status = orchestrator.status().await.unwrap();
    assert_eq!(status.pending, 1);
    assert_eq!(status.in_flight, 0);

    // nothing of the failed pass is left queued, so the next pass resubmits
    let again = orchestrator.run().await.unwrap();
    assert_eq!(again.pending, 1);
    assert_eq!(again.submitted.get(Stage::Msa.as_str()), Some(&windows));
    assert_eq!(again.windows_failed, windows);
}

#[tokio::test]
async fn test_sequence_mismatch_fails_only_that_item() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let layout = ArtifactLayout::from_config(&config.paths);
    let store = store_with(&[("P1", SHORT), ("Q1", LONG)]).await;
    let orchestrator = SyncOrchestrator::new(config, store.clone(), Arc::new(DryRunCluster::new()));

    write_artifacts(&layout, "P1", SHORT).await;
    // Artifacts for Q1 carry a different residue string of the same length
    let corrupted: String = LONG.replace('W', "F");
    write_artifacts(&layout, "Q1", &corrupted).await;

    let report = orchestrator.reconcile().await.unwrap();
    assert_eq!(report.reconciled, 1);
    assert_eq!(report.failed.get("data_integrity"), Some(&1));
    assert_eq!(report.failures[0].key, "Q1/recomputed");

    let completed = store.completed_keys().await.unwrap();
    assert!(completed.contains(&key("P1")));
    assert!(!completed.contains(&key("Q1")));
    // Nothing of the failed item is deleted
    assert!(layout.artifact_path(&key("Q1"), 1).exists());
}

#[tokio::test]
async fn test_missing_window_is_not_reconciled() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let layout = ArtifactLayout::from_config(&config.paths);
    let store = store_with(&[("Q1", LONG)]).await;
    let orchestrator = SyncOrchestrator::new(config, store.clone(), Arc::new(DryRunCluster::new()));

    write_artifacts(&layout, "Q1", LONG).await;
    tokio::fs::remove_file(layout.artifact_path(&key("Q1"), 2)).await.unwrap();

    let report = orchestrator.reconcile().await.unwrap();
    assert_eq!(report.reconciled, 0);
    assert_eq!(report.pending, 1);
    assert!(store.completed_keys().await.unwrap().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════
// Partial records
// ═══════════════════════════════════════════════════════════════════════════

fn residue_only(acc: &str, sequence: &str) -> ReconciledRecord {
    ReconciledRecord {
        key: key(acc),
        sequence: sequence.to_string(),
        residues: sequence
            .chars()
            .enumerate()
            .map(|(i, aa)| ResidueRow {
                site: i as u32 + 1,
                aa,
                plddt: 70.0,
                plddt10: 70.0,
                asa: 30.0,
                asa10: 30.0,
                rel_asa: 0.2,
                rel_asa10: 0.2,
                dis: '.',
                dis10: '.',
                surf: 'C',
                surf10: 'C',
                sec: 'E',
                iso: None,
                phi: None,
                psi: None,
                omega: None,
                tau: None,
                chi: [None; 5],
            })
            .collect(),
        pairs: vec![],
    }
}

#[tokio::test]
async fn test_partial_record_aborts_pass_by_default() {
    let dir = TempDir::new().unwrap();
    let store = store_with(&[("P1", SHORT)]).await;
    store.commit_record(&residue_only("P1", SHORT)).await.unwrap();
    let cluster = Arc::new(DryRunCluster::new());
    let orchestrator = SyncOrchestrator::new(config(dir.path()), store, cluster.clone());

    let err = orchestrator.submit(false).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::PartialCompletion { .. }));
    assert!(cluster.submissions().is_empty());

    // status never fails on partial records
    assert_eq!(orchestrator.status().await.unwrap().partial, 1);
}

#[tokio::test]
async fn test_allow_partial_deletes_and_resubmits() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.gate.allow_partial = true;
    let store = store_with(&[("P1", SHORT)]).await;
    store.commit_record(&residue_only("P1", SHORT)).await.unwrap();
    let cluster = Arc::new(DryRunCluster::new());
    let orchestrator = SyncOrchestrator::new(config, store.clone(), cluster.clone());

    let report = orchestrator.submit(false).await.unwrap();
    assert_eq!(report.partial_deleted, 1);
    assert_eq!(report.pending, 1);
    assert!(!cluster.submissions().is_empty());
    assert!(store.partial_keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_keep_incompletes_excludes_from_scheduling() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.gate.allow_partial = true;
    config.gate.keep_incompletes = true;
    let store = store_with(&[("P1", SHORT), ("Q1", LONG)]).await;
    store.commit_record(&residue_only("P1", SHORT)).await.unwrap();
    let cluster = Arc::new(DryRunCluster::new());
    let orchestrator = SyncOrchestrator::new(config, store.clone(), cluster.clone());

    let report = orchestrator.submit(false).await.unwrap();
    assert_eq!(report.partial_deleted, 0);
    assert_eq!(report.pending, 1);
    assert!(cluster.submissions().iter().all(|r| !r.name.contains(".P1.")));
    assert_eq!(store.partial_keys().await.unwrap().len(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Skips
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_skip_reasons_are_counted() {
    let dir = TempDir::new().unwrap();
    let store = store_with(&[
        ("P1", SHORT),
        ("P2-2", SHORT),
        ("P3", "MKVLA"),
        ("P4", "MKVLAGHEWRTYSPQN1"),
    ])
    .await;
    let orchestrator = SyncOrchestrator::new(config(dir.path()), store, Arc::new(DryRunCluster::new()));

    let report = orchestrator.status().await.unwrap();
    assert_eq!(report.wanted, 1);
    assert_eq!(report.skipped.get("isoform"), Some(&1));
    assert_eq!(report.skipped.get("peptide"), Some(&1));
    assert_eq!(report.skipped.get("invalid_alphabet"), Some(&1));
}
