//! Domain error identifiers surfaced at component boundaries (spec §6, §7).
//!
//! Internal plumbing (I/O, sqlite) is propagated with `anyhow::Error` the way
//! the rest of this codebase does; only the errors a caller is expected to
//! match on by identity get their own variant here.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DgutaError {
    #[error("database already exists at {0}")]
    DbExists(PathBuf),

    #[error("database does not exist at {0}")]
    DbNotExists(PathBuf),

    #[error("directory not found: {0}")]
    DirNotFound(String),

    #[error("invalid age bucket: {0}")]
    InvalidAge(String),

    #[error("invalid file type: {0}")]
    InvalidType(String),

    #[error("bad path: {0}")]
    BadPath(String),

    #[error("too few columns: expected {expected}, got {got}")]
    TooFewColumns { expected: usize, got: usize },

    #[error("out of order input: {0}")]
    OutOfOrder(String),

    #[error("store integrity error: {0}")]
    StoreIntegrity(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DgutaError>;

impl DgutaError {
    /// Not-found is a domain value, not a failure, per spec §7: callers must
    /// be able to distinguish it from integrity/transient errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DgutaError::DirNotFound(_))
    }
}
