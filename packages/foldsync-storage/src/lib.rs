//! foldsync-storage - canonical stores for reconciled structure annotations
//!
//! ## Core Principles
//!
//! 1. **Two stores or neither**: per-residue and per-pair rows for one
//!    (accession, source flag) are written in one transaction
//! 2. **Derived completion**: "done" is a predicate over the stores, never a
//!    separately trusted bit
//! 3. **Immutable sequences**: a sequence is registered once per source flag
//!
//! ## Usage
//!
//! ```rust,ignore
//! use foldsync_storage::{RecordStore, SqliteRecordStore, SequenceRecord, SourceFlag};
//!
//! let store = SqliteRecordStore::new("foldsync.sqlite")?;
//! store.register_sequence(&SequenceRecord::new("P69905", SourceFlag::Recomputed, seq)).await?;
//! store.commit_record(&reconciled).await?;
//! let done = store.completed_keys().await?;
//! ```

pub mod domain;
pub mod error;

#[cfg(feature = "sqlite")]
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    AccessionKey, CompletionStatus, PairRow, ReconciledRecord, RecordStore, ResidueRow,
    SequenceRecord, SourceFlag, StorePresence,
};

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteRecordStore;
