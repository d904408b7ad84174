//! Crate-level error type.
//!
//! Each layer keeps its own error enum; [`LedgerError`] is what the chain
//! controller hands back to callers. Nothing in the crate aborts the process.

use thiserror::Error;

use crate::config::ConfigError;
use crate::pow::PowError;
use crate::storage::codec::DecodeError;
use crate::storage::db::DbError;

/// Errors surfaced by [`Blockchain`](crate::storage::Blockchain) operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Open, read, write or commit against the embedded store failed.
    #[error("storage error: {0}")]
    Storage(#[from] DbError),

    /// A stored record does not decode to a well-formed, self-consistent block.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Mining failed. [`PowError::Exhausted`] is the bounded-search failure.
    #[error("mining failed: {0}")]
    Mining(#[from] PowError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The tip or a previous-hash link points at a record that is not stored.
    #[error("block {0} is referenced but missing from storage")]
    MissingBlock(String),

    /// Stored data contradicts the chain's structure.
    #[error("chain integrity violated at {hash}: {reason}")]
    Integrity { hash: String, reason: String },
}

impl LedgerError {
    /// True when the proof-of-work search ran out of nonces.
    pub fn is_mining_exhausted(&self) -> bool {
        matches!(self, Self::Mining(PowError::Exhausted { .. }))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
