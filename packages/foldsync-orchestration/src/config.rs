//! Versioned YAML configuration
//!
//! ```yaml
//! version: 1
//! fragment:
//!   window_size: 1400
//!   stride: 200
//!   trim: { mode: midpoint }
//! cluster:
//!   global_ceiling: 1000
//!   per_queue_ceiling: 100
//!   predict:
//!     queues: [gpu, gpu-long]
//!     gpus: 1
//! ```

use std::path::{Path, PathBuf};

use foldsync_storage::SourceFlag;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::fragment::TrimPolicy;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Benign stderr lines from the structure/annotation tools
pub const DEFAULT_BENIGN_PATTERNS: &[&str] = &[
    r"Open Babel Warning +in PerceiveBondOrders",
    r"Failed to kekulize aromatic bonds in OBMol::PerceiveBondOrders",
    r"Constructed NamedStream from a NamedStream",
    r"^==============================$",
    r"^$",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Schema version (always 1 for v1)
    pub version: u32,
    #[serde(default)]
    pub fragment: FragmentConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub criteria: Criteria,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default = "default_benign_patterns")]
    pub stderr_filter: Vec<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
}

fn default_benign_patterns() -> Vec<String> {
    DEFAULT_BENIGN_PATTERNS.iter().map(|p| p.to_string()).collect()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            version: 1,
            fragment: FragmentConfig::default(),
            thresholds: Thresholds::default(),
            criteria: Criteria::default(),
            cluster: ClusterConfig::default(),
            paths: PathsConfig::default(),
            gate: GateConfig::default(),
            stderr_filter: default_benign_patterns(),
            database: DatabaseConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimMode {
    Midpoint,
    Margin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrimConfig {
    pub mode: TrimMode,
    #[serde(default)]
    pub margin: usize,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            mode: TrimMode::Midpoint,
            margin: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FragmentConfig {
    pub window_size: usize,
    pub stride: usize,
    /// Sequences at or below this length run as a single window
    pub unfragmented_max: usize,
    pub smoothing_half_window: usize,
    pub trim: TrimConfig,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            window_size: 1400,
            stride: 200,
            unfragmented_max: 2699,
            smoothing_half_window: 10,
            trim: TrimConfig::default(),
        }
    }
}

impl FragmentConfig {
    pub fn trim_policy(&self) -> TrimPolicy {
        match self.trim.mode {
            TrimMode::Midpoint => TrimPolicy::Midpoint,
            TrimMode::Margin => TrimPolicy::Margin(self.trim.margin),
        }
    }

    /// Window size actually used for a sequence of `length` residues
    pub fn effective_window_size(&self, length: usize) -> usize {
        if length <= self.unfragmented_max {
            self.window_size.max(self.unfragmented_max)
        } else {
            self.window_size
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Thresholds {
    /// Relative ASA at or above which a residue counts as disordered
    pub disorder: f64,
    /// Relative ASA at or below which a residue counts as buried (core)
    pub buried: f64,
    pub omega_cis_max: f64,
    pub omega_trans_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            disorder: 0.55,
            buried: 0.25,
            omega_cis_max: 50.0,
            omega_trans_min: 130.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Criteria {
    pub source_flag: SourceFlag,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_peptide_length: usize,
    pub allow_isoforms: bool,
    pub substitute_nonstandard: bool,
}

impl Default for Criteria {
    fn default() -> Self {
        Self {
            source_flag: SourceFlag::Recomputed,
            min_length: None,
            max_length: None,
            min_peptide_length: 16,
            allow_isoforms: false,
            substitute_nonstandard: true,
        }
    }
}

/// Resource profile and command template for one job stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageProfile {
    pub queues: Vec<String>,
    pub cpus: u32,
    pub mem_gb: u32,
    #[serde(default)]
    pub gpus: Option<u32>,
    /// Placeholders: {accession} {fragment} {fasta} {scratch} {msa_dir} {artifact}
    pub command: String,
}

impl StageProfile {
    fn default_msa() -> Self {
        Self {
            queues: vec!["standard".to_string()],
            cpus: 8,
            mem_gb: 64,
            gpus: None,
            command: "run_alphafold.sh --fasta_paths={fasta} --output_dir={msa_dir} \
                      --msa_only"
                .to_string(),
        }
    }

    fn default_predict() -> Self {
        Self {
            queues: vec!["gpu".to_string()],
            cpus: 8,
            mem_gb: 64,
            gpus: Some(1),
            command: "run_alphafold.sh --fasta_paths={fasta} --output_dir={msa_dir} \
                      --use_precomputed_msas && annotate_window {accession} {fragment} \
                      {msa_dir} {artifact}"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClusterConfig {
    /// Total jobs across all queues
    pub global_ceiling: usize,
    /// Pending jobs per queue
    pub per_queue_ceiling: usize,
    pub poll_interval_secs: u64,
    /// Submit the CPU pre-stage when its artifacts are missing
    pub two_phase: bool,
    pub msa: StageProfile,
    pub predict: StageProfile,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            global_ceiling: 1000,
            per_queue_ceiling: 100,
            poll_interval_secs: 60,
            two_phase: true,
            msa: StageProfile::default_msa(),
            predict: StageProfile::default_predict(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PathsConfig {
    /// Per-accession scratch directories live below this root
    pub scratch_root: PathBuf,
    /// Per-window pre-stage (MSA) directories live below this root
    pub msa_root: PathBuf,
    /// Tool-version tag embedded in window artifact names
    pub artifact_tag: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            scratch_root: PathBuf::from("tmp"),
            msa_root: PathBuf::from("msa"),
            artifact_tag: "model_v0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GateConfig {
    /// Tolerate keys present in only one canonical store
    pub allow_partial: bool,
    /// Leave tolerated partial keys in place instead of deleting them
    pub keep_incompletes: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("foldsync.sqlite"),
        }
    }
}

impl SyncConfig {
    /// Load from a YAML file (version field required)
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(content)?;
        let version = raw
            .get("version")
            .ok_or_else(|| {
                OrchestratorError::config(
                    "Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.",
                )
            })?
            .as_u64()
            .ok_or_else(|| OrchestratorError::config("'version' must be an integer"))?;

        let supported = u32::try_from(version).is_ok_and(|v| SUPPORTED_VERSIONS.contains(&v));
        if !supported {
            return Err(OrchestratorError::config(format!(
                "Unsupported configuration version {}. Supported versions: {:?}",
                version, SUPPORTED_VERSIONS
            )));
        }

        let config: SyncConfig = serde_yaml::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let f = &self.fragment;
        if f.window_size == 0 {
            return Err(OrchestratorError::config("fragment.window_size must be >= 1"));
        }
        if f.stride == 0 || f.stride >= f.window_size {
            return Err(OrchestratorError::config(format!(
                "fragment.stride {} not in 1..{}",
                f.stride, f.window_size
            )));
        }
        if let TrimPolicy::Margin(m) = f.trim_policy() {
            if 2 * m + f.stride > f.window_size {
                return Err(OrchestratorError::config(format!(
                    "fragment.trim.margin {}: 2*margin + stride ({}) exceeds window_size {}, leaving gaps",
                    m,
                    2 * m + f.stride,
                    f.window_size
                )));
            }
        }

        let t = &self.thresholds;
        for (name, value) in [("disorder", t.disorder), ("buried", t.buried)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(OrchestratorError::config(format!(
                    "thresholds.{} {} not in 0..=1",
                    name, value
                )));
            }
        }
        if t.omega_cis_max >= t.omega_trans_min {
            return Err(OrchestratorError::config(
                "thresholds.omega_cis_max must be below omega_trans_min",
            ));
        }

        if let (Some(min), Some(max)) = (self.criteria.min_length, self.criteria.max_length) {
            if min > max {
                return Err(OrchestratorError::config(format!(
                    "criteria.min_length {} exceeds max_length {}",
                    min, max
                )));
            }
        }

        if !crate::artifact::is_valid_tag(&self.paths.artifact_tag) {
            return Err(OrchestratorError::config(format!(
                "paths.artifact_tag '{}' may only contain letters, digits, '_' and '.'",
                self.paths.artifact_tag
            )));
        }

        let c = &self.cluster;
        if c.global_ceiling == 0 || c.per_queue_ceiling == 0 {
            return Err(OrchestratorError::config("cluster ceilings must be >= 1"));
        }
        for (name, profile) in [("msa", &c.msa), ("predict", &c.predict)] {
            if profile.queues.is_empty() {
                return Err(OrchestratorError::config(format!(
                    "cluster.{}.queues must name at least one queue",
                    name
                )));
            }
            if profile.cpus == 0 {
                return Err(OrchestratorError::config(format!(
                    "cluster.{}.cpus must be >= 1",
                    name
                )));
            }
        }

        for pattern in &self.stderr_filter {
            regex::Regex::new(pattern).map_err(|e| {
                OrchestratorError::config(format!("stderr_filter pattern '{}': {}", pattern, e))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_validate() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fragment.trim_policy(), TrimPolicy::Midpoint);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = SyncConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));
        assert!(yaml.contains("window_size: 1400"));

        let back = SyncConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_yaml_loading() {
        let yaml_content = r#"
version: 1
fragment:
  window_size: 1400
  stride: 200
  trim:
    mode: margin
    margin: 200
cluster:
  global_ceiling: 5
  per_queue_ceiling: 2
  predict:
    queues: [gpu, gpu-long]
    cpus: 4
    mem_gb: 32
    gpus: 1
    command: "predict {fasta}"
gate:
  allow_partial: true
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = SyncConfig::from_yaml(temp_file.path()).unwrap();
        assert_eq!(config.fragment.trim_policy(), TrimPolicy::Margin(200));
        assert_eq!(config.cluster.global_ceiling, 5);
        assert_eq!(config.cluster.predict.queues, vec!["gpu", "gpu-long"]);
        assert_eq!(config.cluster.msa, StageProfile::default_msa());
        assert!(config.gate.allow_partial);
        assert!(!config.gate.keep_incompletes);
    }

    #[test]
    fn test_yaml_missing_version() {
        let result = SyncConfig::from_yaml_str("fragment:\n  stride: 100\n");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Missing 'version'"));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let result = SyncConfig::from_yaml_str("version: 2\n");
        assert!(result.unwrap_err().to_string().contains("Unsupported"));
    }

    #[test]
    fn test_yaml_version_out_of_range() {
        // would wrap to 1 if narrowed
        let result = SyncConfig::from_yaml_str("version: 4294967297\n");
        assert!(result.unwrap_err().to_string().contains("Unsupported"));
    }

    #[test]
    fn test_artifact_tag_must_be_discoverable() {
        let mut config = SyncConfig::default();
        config.paths.artifact_tag = "af2-multimer".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("artifact_tag"));

        config.paths.artifact_tag = "af2_multimer.v3".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        let result = SyncConfig::from_yaml_str("version: 1\nfragment:\n  windowsize: 10\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_margin_geometry_validated() {
        let mut config = SyncConfig::default();
        config.fragment.trim = TrimConfig {
            mode: TrimMode::Margin,
            margin: 700,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stride_must_be_below_window() {
        let mut config = SyncConfig::default();
        config.fragment.stride = 1400;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_window_size() {
        let f = FragmentConfig::default();
        assert_eq!(f.effective_window_size(2699), 2699);
        assert_eq!(f.effective_window_size(500), 2699);
        assert_eq!(f.effective_window_size(2700), 1400);
    }

    #[test]
    fn test_bad_stderr_pattern_rejected() {
        let mut config = SyncConfig::default();
        config.stderr_filter.push("(unclosed".to_string());
        assert!(config.validate().is_err());
    }
}
