//! WorkItem Resolver: which accessions need (re)computation
//!
//! `pending = wanted − in_flight − completed`, where `completed` is the
//! store's completion predicate plus accessions whose window artifacts are
//! all on disk (those go to the reconciler instead of the scheduler).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use foldsync_storage::{AccessionKey, RecordStore, SequenceRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::ArtifactLayout;
use crate::cluster::ClusterClient;
use crate::config::{Criteria, FragmentConfig, SyncConfig};
use crate::error::Result;
use crate::fragment::{decompose, window_count, Window};

/// Residues accepted after substitution
pub const STANDARD_ALPHABET: &str = "ACDEFGHIKLMNPQRSTVWY";

const LINKER: &str = "GGGGS";

/// Replace non-standard residues without changing the length.
///
/// `U→C`, `B→N`, `Z→Q`. Runs of `X` at either terminus, or internal runs of
/// four or more, become a repeated `GGGGS` linker; shorter internal runs
/// become alanines.
pub fn substitute_nonstandard(sequence: &str) -> String {
    let residues: Vec<char> = sequence
        .chars()
        .map(|c| match c.to_ascii_uppercase() {
            'U' => 'C',
            'B' => 'N',
            'Z' => 'Q',
            other => other,
        })
        .collect();

    let n = residues.len();
    let mut out = String::with_capacity(n);
    let mut i = 0;
    while i < n {
        if residues[i] != 'X' {
            out.push(residues[i]);
            i += 1;
            continue;
        }
        let start = i;
        while i < n && residues[i] == 'X' {
            i += 1;
        }
        let run = i - start;
        if start == 0 || i == n || run >= 4 {
            out.extend(LINKER.chars().cycle().take(run));
        } else {
            out.extend(std::iter::repeat('A').take(run));
        }
    }
    out
}

/// Why a registered sequence is not wanted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Isoform,
    InvalidAlphabet,
    Peptide,
    TooShort,
    TooLong,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Isoform => "isoform",
            SkipReason::InvalidAlphabet => "invalid_alphabet",
            SkipReason::Peptide => "peptide",
            SkipReason::TooShort => "too_short",
            SkipReason::TooLong => "too_long",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One accession selected for computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItemSpec {
    pub key: AccessionKey,
    /// Sequence as registered in the store
    pub canonical: String,
    /// Sequence submitted to the tools (after substitution)
    pub sequence: String,
    /// Effective window size for this item
    pub window_size: usize,
    pub stride: usize,
    pub total_windows: u32,
}

impl WorkItemSpec {
    pub fn length(&self) -> usize {
        self.sequence.chars().count()
    }

    pub fn windows(&self) -> Vec<Window> {
        decompose(&self.sequence, self.window_size, self.stride)
    }
}

/// Apply the inclusion criteria to one registered sequence
pub fn evaluate(
    record: &SequenceRecord,
    criteria: &Criteria,
    fragment: &FragmentConfig,
) -> std::result::Result<WorkItemSpec, SkipReason> {
    if !criteria.allow_isoforms && record.key.accession.contains('-') {
        return Err(SkipReason::Isoform);
    }

    let sequence = if criteria.substitute_nonstandard {
        substitute_nonstandard(&record.sequence)
    } else {
        record.sequence.clone()
    };
    if sequence.is_empty() || !sequence.chars().all(|c| STANDARD_ALPHABET.contains(c)) {
        return Err(SkipReason::InvalidAlphabet);
    }

    let length = sequence.chars().count();
    if length < criteria.min_peptide_length {
        return Err(SkipReason::Peptide);
    }
    if criteria.min_length.is_some_and(|min| length < min) {
        return Err(SkipReason::TooShort);
    }
    if criteria.max_length.is_some_and(|max| length > max) {
        return Err(SkipReason::TooLong);
    }

    let window_size = fragment.effective_window_size(length);
    Ok(WorkItemSpec {
        key: record.key.clone(),
        canonical: record.sequence.clone(),
        total_windows: window_count(length, window_size, fragment.stride) as u32,
        sequence,
        window_size,
        stride: fragment.stride,
    })
}

/// Outcome of one resolver pass
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub wanted: BTreeMap<AccessionKey, WorkItemSpec>,
    pub skipped: BTreeMap<SkipReason, usize>,
    pub in_flight: BTreeSet<AccessionKey>,
    /// Complete in the canonical stores
    pub completed: BTreeSet<AccessionKey>,
    /// Every window artifact on disk, not yet committed
    pub artifact_complete: BTreeSet<AccessionKey>,
    /// Left alone by operator policy (kept partial records)
    pub excluded: BTreeSet<AccessionKey>,
}

impl Resolution {
    /// Items to hand to the scheduler
    pub fn pending(&self) -> Vec<&WorkItemSpec> {
        self.wanted
            .values()
            .filter(|item| {
                !self.in_flight.contains(&item.key)
                    && !self.completed.contains(&item.key)
                    && !self.artifact_complete.contains(&item.key)
                    && !self.excluded.contains(&item.key)
            })
            .collect()
    }

    /// Items to hand to the reconciler
    pub fn reconcilable(&self) -> Vec<&WorkItemSpec> {
        self.wanted
            .values()
            .filter(|item| {
                self.artifact_complete.contains(&item.key)
                    && !self.in_flight.contains(&item.key)
                    && !self.completed.contains(&item.key)
                    && !self.excluded.contains(&item.key)
            })
            .collect()
    }
}

pub struct Resolver {
    store: Arc<dyn RecordStore>,
    cluster: Arc<dyn ClusterClient>,
    layout: ArtifactLayout,
    criteria: Criteria,
    fragment: FragmentConfig,
}

impl Resolver {
    pub fn new(config: &SyncConfig, store: Arc<dyn RecordStore>, cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            store,
            cluster,
            layout: ArtifactLayout::from_config(&config.paths),
            criteria: config.criteria.clone(),
            fragment: config.fragment.clone(),
        }
    }

    /// Registered sequences passing the inclusion criteria
    pub async fn wanted(&self) -> Result<(BTreeMap<AccessionKey, WorkItemSpec>, BTreeMap<SkipReason, usize>)> {
        let mut wanted = BTreeMap::new();
        let mut skipped = BTreeMap::new();
        for record in self.store.list_sequences(Some(self.criteria.source_flag)).await? {
            match evaluate(&record, &self.criteria, &self.fragment) {
                Ok(item) => {
                    if item.sequence != item.canonical {
                        debug!(key = %item.key, "non-standard residues substituted");
                    }
                    wanted.insert(item.key.clone(), item);
                }
                Err(reason) => {
                    debug!(key = %record.key, reason = %reason, "sequence skipped");
                    *skipped.entry(reason).or_insert(0) += 1;
                }
            }
        }
        Ok((wanted, skipped))
    }

    /// Accessions with at least one of our jobs queued or running
    pub async fn in_flight(&self) -> Result<BTreeSet<AccessionKey>> {
        Ok(self.cluster.snapshot().await?.in_flight_keys())
    }

    /// Accessions satisfying the completion predicate in the stores
    pub async fn completed(&self) -> Result<BTreeSet<AccessionKey>> {
        Ok(self.store.completed_keys().await?)
    }

    /// True when every expected window artifact of `item` is on disk
    pub async fn artifacts_complete(&self, item: &WorkItemSpec) -> bool {
        for fragment in 1..=item.total_windows {
            if !self.layout.window_done(&item.key, fragment).await {
                return false;
            }
        }
        true
    }

    pub async fn resolve(&self, excluded: BTreeSet<AccessionKey>) -> Result<Resolution> {
        let (wanted, skipped) = self.wanted().await?;
        let in_flight = self.in_flight().await?;
        let completed = self.completed().await?;

        let mut artifact_complete = BTreeSet::new();
        for item in wanted.values() {
            if completed.contains(&item.key) || in_flight.contains(&item.key) {
                continue;
            }
            if self.artifacts_complete(item).await {
                artifact_complete.insert(item.key.clone());
            }
        }

        let resolution = Resolution {
            wanted,
            skipped,
            in_flight,
            completed,
            artifact_complete,
            excluded,
        };
        info!(
            wanted = resolution.wanted.len(),
            in_flight = resolution.in_flight.len(),
            completed = resolution.completed.len(),
            artifact_complete = resolution.artifact_complete.len(),
            pending = resolution.pending().len(),
            "resolved work items"
        );
        Ok(resolution)
    }
}
