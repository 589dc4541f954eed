//! On-disk layout of per-window inputs, outputs and logs
//!
//! ```text
//! {scratch_root}/{source_flag}/{accession}/
//!     {accession}_F{n}.fasta                 window input
//!     AF-{accession}-F{n}-{tag}.annot.json   terminal window artifact
//!     {stage}_F{n}.{attempt}.out|err         retained logs of failed attempts
//! {msa_root}/{source_flag}/{accession}_F{n}/msas/  pre-stage artifacts
//! ```

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use foldsync_storage::AccessionKey;
use regex::Regex;
use tracing::debug;

use crate::config::PathsConfig;
use crate::error::{OrchestratorError, Result};
use crate::fragment::WindowResult;
use crate::job::Stage;

/// Files the MSA pre-stage leaves for each window
pub const MSA_FILES: [&str; 4] = [
    "bfd_uniref_hits.a3m",
    "mgnify_hits.sto",
    "pdb_hits.hhr",
    "uniref90_hits.sto",
];

fn artifact_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^AF-(?P<acc>.+)-F(?P<frag>\d+)-(?P<tag>[A-Za-z0-9_.]+)\.annot\.json$")
            .expect("artifact pattern is valid")
    })
}

/// Artifact tags the discovery pattern can match
pub fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
}

fn log_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<stage>[a-z]+)_F(?P<frag>\d+)\.(?P<attempt>\d+)\.(?P<ext>out|err)$")
            .expect("log pattern is valid")
    })
}

/// Parsed terminal artifact file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub accession: String,
    pub fragment: u32,
    pub tag: String,
}

impl ArtifactName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = artifact_pattern().captures(file_name)?;
        Some(Self {
            accession: caps["acc"].to_string(),
            fragment: caps["frag"].parse().ok()?,
            tag: caps["tag"].to_string(),
        })
    }

    pub fn file_name(&self) -> String {
        format!("AF-{}-F{}-{}.annot.json", self.accession, self.fragment, self.tag)
    }
}

/// Compare strings treating digit runs as numbers ("F9" < "F10")
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();
    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let mut da = String::new();
                while let Some(c) = a.peek().copied().filter(char::is_ascii_digit) {
                    da.push(c);
                    a.next();
                }
                let mut db = String::new();
                while let Some(c) = b.peek().copied().filter(char::is_ascii_digit) {
                    db.push(c);
                    b.next();
                }
                let ta = da.trim_start_matches('0');
                let tb = db.trim_start_matches('0');
                let ord = ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a.next();
                b.next();
            }
        }
    }
}

/// A terminal artifact found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredArtifact {
    pub name: ArtifactName,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    scratch_root: PathBuf,
    msa_root: PathBuf,
    tag: String,
}

impl ArtifactLayout {
    pub fn new(scratch_root: impl Into<PathBuf>, msa_root: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            msa_root: msa_root.into(),
            tag: tag.into(),
        }
    }

    pub fn from_config(paths: &PathsConfig) -> Self {
        Self::new(&paths.scratch_root, &paths.msa_root, &paths.artifact_tag)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn scratch_dir(&self, key: &AccessionKey) -> PathBuf {
        self.scratch_root
            .join(key.source_flag.as_str())
            .join(&key.accession)
    }

    pub fn artifact_path(&self, key: &AccessionKey, fragment: u32) -> PathBuf {
        let name = ArtifactName {
            accession: key.accession.clone(),
            fragment,
            tag: self.tag.clone(),
        };
        self.scratch_dir(key).join(name.file_name())
    }

    pub fn fasta_path(&self, key: &AccessionKey, fragment: u32) -> PathBuf {
        self.scratch_dir(key)
            .join(format!("{}_F{}.fasta", key.accession, fragment))
    }

    /// Per source flag: the two flags of one accession may carry different sequences
    pub fn msa_dir(&self, key: &AccessionKey, fragment: u32) -> PathBuf {
        self.msa_root
            .join(key.source_flag.as_str())
            .join(format!("{}_F{}", key.accession, fragment))
    }

    /// Log path without extension; the wrapper appends `.out` / `.err`
    pub fn log_stem(&self, key: &AccessionKey, fragment: u32, stage: Stage, attempt: u32) -> PathBuf {
        self.scratch_dir(key)
            .join(format!("{}_F{}.{}", stage.as_str(), fragment, attempt))
    }

    /// True when every pre-stage file for the window exists
    pub async fn msa_complete(&self, key: &AccessionKey, fragment: u32) -> bool {
        let dir = self.msa_dir(key, fragment).join("msas");
        for file in MSA_FILES {
            if !tokio::fs::try_exists(dir.join(file)).await.unwrap_or(false) {
                return false;
            }
        }
        true
    }

    pub async fn window_done(&self, key: &AccessionKey, fragment: u32) -> bool {
        tokio::fs::try_exists(self.artifact_path(key, fragment))
            .await
            .unwrap_or(false)
    }

    /// Terminal artifacts for `key` with this layout's tag, naturally sorted
    pub async fn discover(&self, key: &AccessionKey) -> Result<Vec<DiscoveredArtifact>> {
        let dir = self.scratch_dir(key);
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort_by(|a, b| natural_cmp(a, b));

        let mut found = Vec::new();
        for file_name in names {
            let Some(name) = ArtifactName::parse(&file_name) else {
                continue;
            };
            if name.accession != key.accession || name.tag != self.tag {
                debug!(file = %file_name, key = %key, "ignoring artifact of another accession or tool version");
                continue;
            }
            found.push(DiscoveredArtifact {
                path: dir.join(&file_name),
                name,
            });
        }
        Ok(found)
    }

    pub async fn load(&self, artifact: &DiscoveredArtifact) -> Result<WindowResult> {
        let bytes = tokio::fs::read(&artifact.path).await.map_err(|e| {
            OrchestratorError::MissingArtifact(format!("{}: {}", artifact.path.display(), e))
        })?;
        let result: WindowResult = serde_json::from_slice(&bytes)?;
        if result.fragment != artifact.name.fragment || result.accession != artifact.name.accession {
            return Err(OrchestratorError::parse(format!(
                "{}: content is for {} F{}",
                artifact.path.display(),
                result.accession,
                result.fragment
            )));
        }
        Ok(result)
    }

    /// Next attempt number: one past the highest retained log for the window and stage
    pub async fn next_attempt(&self, key: &AccessionKey, fragment: u32, stage: Stage) -> u32 {
        let mut highest = 0;
        let Ok(mut entries) = tokio::fs::read_dir(self.scratch_dir(key)).await else {
            return 1;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(caps) = file_name.to_str().and_then(|n| log_pattern().captures(n)) else {
                continue;
            };
            if &caps["stage"] == stage.as_str() && caps["frag"].parse::<u32>().ok() == Some(fragment) {
                if let Ok(attempt) = caps["attempt"].parse::<u32>() {
                    highest = highest.max(attempt);
                }
            }
        }
        highest + 1
    }

    /// Remove every file this layout owns for `key`, then the directory.
    ///
    /// Files the layout does not recognise are left alone and reported as
    /// [`OrchestratorError::ScratchNotEmpty`].
    pub async fn cleanup(&self, key: &AccessionKey) -> Result<usize> {
        let dir = self.scratch_dir(key);
        let mut removed = 0;
        let mut remaining = Vec::new();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if self.owns(key, &file_name) && entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            } else {
                remaining.push(file_name);
            }
        }

        if !remaining.is_empty() {
            remaining.sort_by(|a, b| natural_cmp(a, b));
            return Err(OrchestratorError::ScratchNotEmpty {
                path: dir.display().to_string(),
                remaining,
            });
        }
        tokio::fs::remove_dir(&dir).await?;
        Ok(removed)
    }

    fn owns(&self, key: &AccessionKey, file_name: &str) -> bool {
        if let Some(name) = ArtifactName::parse(file_name) {
            return name.accession == key.accession;
        }
        if log_pattern().is_match(file_name) {
            return true;
        }
        file_name
            .strip_prefix(key.accession.as_str())
            .and_then(|rest| rest.strip_prefix("_F"))
            .and_then(|rest| rest.strip_suffix(".fasta"))
            .is_some_and(|frag| frag.chars().all(|c| c.is_ascii_digit()))
    }
}

/// Write a single-record FASTA file for one window
pub async fn write_fasta(path: &Path, header: &str, sequence: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut body = format!(">{}\n", header);
    for line in sequence.as_bytes().chunks(60) {
        body.push_str(&String::from_utf8_lossy(line));
        body.push('\n');
    }
    tokio::fs::write(path, body).await?;
    Ok(())
}
