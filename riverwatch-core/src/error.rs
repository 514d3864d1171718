//! Domain error types for the state store, HTTP layer, and poll loop.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by `riverwatch-core`.
///
/// Two conditions are deliberately absent from this enum: state corruption
/// (a corrupt document is repaired at load time, `meta.load_repaired` set,
/// and a warning logged, never raised — see `state::store::load`) and clock
/// skew (a latency sample with a negative upper bound is discarded and
/// logged, never raised — see `latency::observe`). Only conditions that
/// genuinely halt a caller live here.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path:?} is locked by another writer")]
    LockContended { path: PathBuf },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream schema error: {0}")]
    Schema(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
