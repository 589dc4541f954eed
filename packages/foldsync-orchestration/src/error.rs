use foldsync_storage::{ErrorKind, StorageError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Store error: {0}")]
    Store(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Work item already in flight: {0}")]
    AlreadyInFlight(String),

    #[error("Cluster command failed: {command}: {message}")]
    Cluster { command: String, message: String },

    #[error("Fragment count mismatch for {key}: expected {expected}, discovered {discovered:?}")]
    FragmentCountMismatch {
        key: String,
        expected: usize,
        discovered: Vec<u32>,
    },

    #[error("Sequence mismatch for {key}:\n  expected: {expected}\n  observed: {observed}")]
    SequenceMismatch {
        key: String,
        expected: String,
        observed: String,
    },

    #[error("Window F{fragment} of {key} has {found} residues, expected {expected}")]
    WindowShape {
        key: String,
        fragment: u32,
        expected: usize,
        found: usize,
    },

    #[error("No window contributes to global position {position} of {key}")]
    CoverageGap { key: String, position: usize },

    #[error("Partial records in canonical stores: {keys:?}")]
    PartialCompletion { keys: Vec<String> },

    #[error("Missing artifact: {0}")]
    MissingArtifact(String),

    #[error("Scratch directory not empty after cleanup: {path} ({remaining:?})")]
    ScratchNotEmpty { path: String, remaining: Vec<String> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn cluster(command: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Cluster {
            command: command.into(),
            message: message.to_string(),
        }
    }

    /// How a failure of this kind is handled by the run loop
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::FragmentCountMismatch { .. }
            | OrchestratorError::SequenceMismatch { .. }
            | OrchestratorError::CoverageGap { .. }
            | OrchestratorError::WindowShape { .. }
            | OrchestratorError::MissingArtifact(_)
            | OrchestratorError::ScratchNotEmpty { .. }
            | OrchestratorError::Json(_) => ErrorCategory::DataIntegrity,
            OrchestratorError::Store(e)
                if matches!(e.kind, ErrorKind::InvalidRecord | ErrorKind::SequenceNotFound) =>
            {
                ErrorCategory::DataIntegrity
            }
            OrchestratorError::Cluster { .. }
            | OrchestratorError::Io(_)
            | OrchestratorError::AlreadyInFlight(_) => ErrorCategory::Transient,
            _ => ErrorCategory::Infrastructure,
        }
    }
}

/// Error category for run-loop handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Fatal for one work item, batch continues (mismatch, missing artifact)
    DataIntegrity,
    /// Item is re-offered on the next pass (cluster command, I/O hiccup)
    Transient,
    /// Aborts the run (store, configuration)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::DataIntegrity => "data_integrity",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "data_integrity" => Ok(ErrorCategory::DataIntegrity),
            "transient" => Ok(ErrorCategory::Transient),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::parse(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }

    /// Whether the batch may continue past this failure
    pub fn is_item_local(&self) -> bool {
        !matches!(self, ErrorCategory::Infrastructure)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
