//! Domain layer for the canonical structure-annotation stores
//!
//! # Stores
//!
//! - **Sequences**: one row per (accession, source flag), immutable once observed
//! - **PerResidue**: one row per global site of a reconciled record
//! - **PerPair**: one row per (site1, site2, metric type)
//!
//! An accession is *done* only when both the per-residue and per-pair stores
//! agree (see [`StorePresence::status`]). Anything in between is *partial*.
//!
//! # Examples
//!
//! ```rust,ignore
//! use foldsync_storage::domain::{AccessionKey, RecordStore, SourceFlag};
//!
//! async fn example(store: impl RecordStore) -> Result<()> {
//!     let key = AccessionKey::new("P69905", SourceFlag::Recomputed);
//!     if store.presence(&key).await?.status().is_complete() {
//!         return Ok(());
//!     }
//!     store.commit_record(&record).await?;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// Keys
// ═══════════════════════════════════════════════════════════════════════════

/// Distinguishes externally-sourced records from internally recomputed ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFlag {
    External,
    Recomputed,
}

impl SourceFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFlag::External => "external",
            SourceFlag::Recomputed => "recomputed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "external" => Ok(SourceFlag::External),
            "recomputed" => Ok(SourceFlag::Recomputed),
            _ => Err(StorageError::serialization(format!(
                "Invalid source flag: {}",
                s
            ))),
        }
    }

    /// Compact column value (1 = external, 0 = recomputed)
    pub fn as_code(&self) -> i64 {
        match self {
            SourceFlag::External => 1,
            SourceFlag::Recomputed => 0,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(SourceFlag::External),
            0 => Ok(SourceFlag::Recomputed),
            _ => Err(StorageError::serialization(format!(
                "Invalid source flag code: {}",
                code
            ))),
        }
    }
}

impl fmt::Display for SourceFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Work-item identity: accession plus source flag
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessionKey {
    pub accession: String,
    pub source_flag: SourceFlag,
}

impl AccessionKey {
    pub fn new(accession: impl Into<String>, source_flag: SourceFlag) -> Self {
        Self {
            accession: accession.into(),
            source_flag,
        }
    }
}

impl fmt::Display for AccessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.accession, self.source_flag)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// A sequence as first observed for a given source flag
///
/// # Examples
///
/// ```rust
/// use foldsync_storage::domain::{SequenceRecord, SourceFlag};
///
/// let seq = SequenceRecord::new("P69905", SourceFlag::External, "MVLSPADKTN");
/// assert_eq!(seq.length, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub key: AccessionKey,
    pub sequence: String,
    pub length: usize,
    pub observed_at: DateTime<Utc>,
}

impl SequenceRecord {
    pub fn new(
        accession: impl Into<String>,
        source_flag: SourceFlag,
        sequence: impl Into<String>,
    ) -> Self {
        let sequence = sequence.into();
        Self {
            key: AccessionKey::new(accession, source_flag),
            length: sequence.chars().count(),
            sequence,
            observed_at: Utc::now(),
        }
    }
}

/// One reconciled per-residue row (site is 1-based)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidueRow {
    pub site: u32,
    pub aa: char,
    pub plddt: f64,
    pub plddt10: f64,
    pub asa: f64,
    pub asa10: f64,
    pub rel_asa: f64,
    pub rel_asa10: f64,
    /// `*` disordered, `.` structured
    pub dis: char,
    pub dis10: char,
    /// `C` core, `S` surface
    pub surf: char,
    pub surf10: char,
    /// DSSP label, `' '` for loop
    pub sec: char,
    /// Peptide bond isomer from omega: `c`, `t` or `' '`
    pub iso: Option<char>,
    pub phi: Option<f64>,
    pub psi: Option<f64>,
    pub omega: Option<f64>,
    pub tau: Option<f64>,
    #[serde(default)]
    pub chi: [Option<f64>; 5],
}

impl ResidueRow {
    /// Backbone angles used by the completion marker
    pub fn has_backbone_angles(&self) -> bool {
        self.phi.is_some() && self.psi.is_some() && self.omega.is_some()
    }
}

/// One reconciled per-pair row (sites are 1-based, `site1 < site2`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRow {
    pub site1: u32,
    pub site2: u32,
    pub metric_type: String,
    pub value: f64,
}

/// Full-length reconciled record, canonical once committed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledRecord {
    pub key: AccessionKey,
    pub sequence: String,
    pub residues: Vec<ResidueRow>,
    pub pairs: Vec<PairRow>,
}

impl ReconciledRecord {
    /// True when the record carries no pairwise measurements
    pub fn no_contacts(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Residue letters in site order
    pub fn residue_string(&self) -> String {
        self.residues.iter().map(|r| r.aa).collect()
    }

    /// Check the one-row-per-site invariant
    pub fn validate(&self) -> Result<()> {
        let length = self.sequence.chars().count();
        if self.residues.len() != length {
            return Err(StorageError::invalid_record(format!(
                "{}: {} residue rows for sequence of length {}",
                self.key,
                self.residues.len(),
                length
            )));
        }
        for (i, row) in self.residues.iter().enumerate() {
            if row.site as usize != i + 1 {
                return Err(StorageError::invalid_record(format!(
                    "{}: expected site {} at row {}, got {}",
                    self.key,
                    i + 1,
                    i,
                    row.site
                )));
            }
        }
        for pair in &self.pairs {
            if pair.site1 == 0 || pair.site1 >= pair.site2 || pair.site2 as usize > length {
                return Err(StorageError::invalid_record(format!(
                    "{}: pair ({}, {}) out of range",
                    self.key, pair.site1, pair.site2
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Completion Marker
// ═══════════════════════════════════════════════════════════════════════════

/// Row counts for one key across both stores
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePresence {
    pub residue_rows: usize,
    /// Residue rows with phi, psi and omega all populated
    pub angular_rows: usize,
    pub pair_rows: usize,
    pub no_contacts: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Absent,
    Partial,
    Complete,
}

impl CompletionStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, CompletionStatus::Complete)
    }
}

impl StorePresence {
    pub fn status(&self) -> CompletionStatus {
        let pairs_side = self.pair_rows > 0 || self.no_contacts;
        if self.angular_rows > 0 && pairs_side {
            CompletionStatus::Complete
        } else if self.residue_rows > 0 || pairs_side {
            CompletionStatus::Partial
        } else {
            CompletionStatus::Absent
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Canonical store port
///
/// Writes are scoped per [`AccessionKey`]; implementations must make
/// [`RecordStore::commit_record`] all-or-nothing across both stores.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Register a sequence. Returns `false` if it was already present.
    /// Re-registering with a different residue string is an error.
    async fn register_sequence(&self, record: &SequenceRecord) -> Result<bool>;

    async fn get_sequence(&self, key: &AccessionKey) -> Result<Option<SequenceRecord>>;

    async fn list_sequences(&self, source_flag: Option<SourceFlag>) -> Result<Vec<SequenceRecord>>;

    /// Replace per-residue and per-pair rows for the key and mark completion
    async fn commit_record(&self, record: &ReconciledRecord) -> Result<()>;

    async fn presence(&self, key: &AccessionKey) -> Result<StorePresence>;

    async fn completed_keys(&self) -> Result<BTreeSet<AccessionKey>>;

    /// Keys present in one store but not agreeing with the other
    async fn partial_keys(&self) -> Result<BTreeSet<AccessionKey>>;

    /// Remove per-residue, per-pair rows and the completion flag (sequence stays)
    async fn delete_record(&self, key: &AccessionKey) -> Result<()>;

    async fn residues(&self, key: &AccessionKey) -> Result<Vec<ResidueRow>>;

    async fn pairs(&self, key: &AccessionKey) -> Result<Vec<PairRow>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(site: u32, aa: char) -> ResidueRow {
        ResidueRow {
            site,
            aa,
            plddt: 90.0,
            plddt10: 90.0,
            asa: 10.0,
            asa10: 10.0,
            rel_asa: 0.1,
            rel_asa10: 0.1,
            dis: '.',
            dis10: '.',
            surf: 'C',
            surf10: 'C',
            sec: 'H',
            iso: Some('t'),
            phi: Some(-60.0),
            psi: Some(-45.0),
            omega: Some(180.0),
            tau: None,
            chi: [None; 5],
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Key Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_source_flag_roundtrip() {
        for flag in [SourceFlag::External, SourceFlag::Recomputed] {
            assert_eq!(SourceFlag::from_str(flag.as_str()).unwrap(), flag);
            assert_eq!(SourceFlag::from_code(flag.as_code()).unwrap(), flag);
        }
        assert!(SourceFlag::from_str("afdb").is_err());
        assert!(SourceFlag::from_code(7).is_err());
    }

    #[test]
    fn test_accession_key_display_and_order() {
        let a = AccessionKey::new("P69905", SourceFlag::External);
        let b = AccessionKey::new("P69905", SourceFlag::Recomputed);
        assert_eq!(a.to_string(), "P69905/external");
        assert!(a < b);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Record Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_validate_accepts_contiguous_sites() {
        let record = ReconciledRecord {
            key: AccessionKey::new("Q1", SourceFlag::Recomputed),
            sequence: "MK".to_string(),
            residues: vec![row(1, 'M'), row(2, 'K')],
            pairs: vec![PairRow {
                site1: 1,
                site2: 2,
                metric_type: "HBondContacts".to_string(),
                value: 3.1,
            }],
        };
        assert!(record.validate().is_ok());
        assert_eq!(record.residue_string(), "MK");
        assert!(!record.no_contacts());
    }

    #[test]
    fn test_validate_rejects_gap() {
        let record = ReconciledRecord {
            key: AccessionKey::new("Q1", SourceFlag::Recomputed),
            sequence: "MKV".to_string(),
            residues: vec![row(1, 'M'), row(3, 'V')],
            pairs: vec![],
        };
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unordered_pair() {
        let record = ReconciledRecord {
            key: AccessionKey::new("Q1", SourceFlag::Recomputed),
            sequence: "MK".to_string(),
            residues: vec![row(1, 'M'), row(2, 'K')],
            pairs: vec![PairRow {
                site1: 2,
                site2: 1,
                metric_type: "IonicContacts".to_string(),
                value: 4.0,
            }],
        };
        assert!(record.validate().is_err());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Completion Marker Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_presence_residues_only_is_partial() {
        let presence = StorePresence {
            residue_rows: 100,
            angular_rows: 98,
            pair_rows: 0,
            no_contacts: false,
        };
        assert_eq!(presence.status(), CompletionStatus::Partial);
    }

    #[test]
    fn test_presence_no_contacts_flag_completes() {
        let presence = StorePresence {
            residue_rows: 12,
            angular_rows: 10,
            pair_rows: 0,
            no_contacts: true,
        };
        assert_eq!(presence.status(), CompletionStatus::Complete);
    }

    #[test]
    fn test_presence_without_angles_is_partial() {
        let presence = StorePresence {
            residue_rows: 12,
            angular_rows: 0,
            pair_rows: 40,
            no_contacts: false,
        };
        assert_eq!(presence.status(), CompletionStatus::Partial);
    }

    #[test]
    fn test_presence_empty_is_absent() {
        assert_eq!(StorePresence::default().status(), CompletionStatus::Absent);
    }

    #[test]
    fn test_residue_row_serde() {
        let json = serde_json::to_string(&row(5, 'W')).unwrap();
        let back: ResidueRow = serde_json::from_str(&json).unwrap();
        assert_eq!(back.site, 5);
        assert_eq!(back.aa, 'W');
        assert!(back.has_backbone_angles());
    }
}
