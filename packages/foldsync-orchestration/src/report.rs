use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use foldsync_storage::AccessionKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::job::Stage;
use crate::resolver::Resolution;

/// One item-local failure, kept for the end-of-run summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub key: String,
    pub category: String,
    pub message: String,
}

/// Counters and reasons aggregated over one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub wanted: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub partial: usize,
    pub pending: usize,
    /// Sequences registered by `import`
    pub imported: usize,
    /// Sequences `import` found already registered
    pub already_present: usize,
    /// Jobs submitted, by stage
    pub submitted: BTreeMap<String, usize>,
    /// Windows whose terminal artifact already existed
    pub windows_present: usize,
    /// Windows whose pre-stage artifacts already existed
    pub msa_reused: usize,
    /// Drained windows that left an artifact
    pub windows_done: usize,
    /// Drained windows that did not; re-offered next pass
    pub windows_failed: usize,
    pub reconciled: usize,
    pub partial_deleted: usize,
    /// Skip counts by reason
    pub skipped: BTreeMap<String, usize>,
    /// Failure counts by error category
    pub failed: BTreeMap<String, usize>,
    pub failures: Vec<FailureRecord>,
}

impl RunReport {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            wanted: 0,
            in_flight: 0,
            completed: 0,
            partial: 0,
            pending: 0,
            imported: 0,
            already_present: 0,
            submitted: BTreeMap::new(),
            windows_present: 0,
            msa_reused: 0,
            windows_done: 0,
            windows_failed: 0,
            reconciled: 0,
            partial_deleted: 0,
            skipped: BTreeMap::new(),
            failed: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    pub fn absorb_resolution(&mut self, resolution: &Resolution) {
        self.wanted = resolution.wanted.len();
        self.in_flight = resolution.in_flight.len();
        self.completed = resolution.completed.len();
        self.pending = resolution.pending().len();
        for (reason, count) in &resolution.skipped {
            *self.skipped.entry(reason.as_str().to_string()).or_insert(0) += count;
        }
    }

    pub fn record_skip(&mut self, reason: &str) {
        *self.skipped.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn record_submission(&mut self, stage: Stage) {
        *self.submitted.entry(stage.as_str().to_string()).or_insert(0) += 1;
    }

    pub fn submitted_total(&self) -> usize {
        self.submitted.values().sum()
    }

    pub fn record_failure(&mut self, key: &AccessionKey, error: &OrchestratorError) {
        let category = error.category().as_str().to_string();
        *self.failed.entry(category.clone()).or_insert(0) += 1;
        self.failures.push(FailureRecord {
            key: key.to_string(),
            category,
            message: error.to_string(),
        });
    }

    pub fn failed_total(&self) -> usize {
        self.failed.values().sum()
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(OrchestratorError::serialization)
    }

    /// Plain-text summary table
    pub fn render(&self) -> String {
        let mut rows: Vec<(String, usize)> = vec![
            ("wanted".to_string(), self.wanted),
            ("in flight".to_string(), self.in_flight),
            ("completed".to_string(), self.completed),
            ("partial".to_string(), self.partial),
            ("pending".to_string(), self.pending),
        ];
        if self.imported + self.already_present > 0 {
            rows.push(("imported".to_string(), self.imported));
            rows.push(("already present".to_string(), self.already_present));
        }
        for (stage, count) in &self.submitted {
            rows.push((format!("submitted {}", stage), *count));
        }
        rows.push(("windows already present".to_string(), self.windows_present));
        rows.push(("msa reused".to_string(), self.msa_reused));
        if self.windows_done + self.windows_failed > 0 {
            rows.push(("windows done".to_string(), self.windows_done));
            rows.push(("windows failed".to_string(), self.windows_failed));
        }
        rows.push(("reconciled".to_string(), self.reconciled));
        if self.partial_deleted > 0 {
            rows.push(("partial deleted".to_string(), self.partial_deleted));
        }
        for (reason, count) in &self.skipped {
            rows.push((format!("skipped: {}", reason), *count));
        }
        for (category, count) in &self.failed {
            rows.push((format!("failed: {}", category), *count));
        }

        let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
        let mut out = format!("Run {}\n", self.run_id);
        for (label, count) in rows {
            let _ = writeln!(out, "  {:<width$}  {:>8}", label, count, width = width);
        }
        for failure in &self.failures {
            let _ = writeln!(out, "  ! {} [{}] {}", failure.key, failure.category, failure.message);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldsync_storage::SourceFlag;

    #[test]
    fn test_counters_and_render() {
        let mut report = RunReport::new(Uuid::new_v4());
        report.record_submission(Stage::Msa);
        report.record_submission(Stage::Predict);
        report.record_submission(Stage::Predict);
        report.record_skip("isoform");
        report.record_skip("isoform");

        let key = AccessionKey::new("P1", SourceFlag::Recomputed);
        report.record_failure(
            &key,
            &OrchestratorError::FragmentCountMismatch {
                key: key.to_string(),
                expected: 3,
                discovered: vec![1, 3],
            },
        );

        assert_eq!(report.submitted_total(), 3);
        assert_eq!(report.failed.get("data_integrity"), Some(&1));
        assert_eq!(report.failed_total(), 1);

        let table = report.render();
        assert!(table.contains("submitted predict"));
        assert!(table.contains("skipped: isoform"));
        assert!(table.contains("failed: data_integrity"));
        assert!(table.contains("P1/recomputed"));
    }

    #[test]
    fn test_json_output() {
        let mut report = RunReport::new(Uuid::new_v4());
        report.reconciled = 4;
        report.finish();
        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["reconciled"], 4);
        assert!(value["finished_at"].is_string());
        let parsed: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }
}
