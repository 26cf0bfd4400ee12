//! Error kinds that cross the CLI/tool boundary.
//!
//! Most internal plumbing uses `anyhow`; this enum exists for the failures
//! callers need to distinguish, and for mapping to process exit codes.

use thiserror::Error;

/// Failures that are reported with a specific exit code or retry policy.
#[derive(Debug, Error)]
pub enum GroveError {
    /// Bad user input: unknown slug, unknown bullet ID, malformed query.
    #[error("{0}")]
    Input(String),

    /// The derived store cannot be opened, or both retrieval channels failed.
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    /// Schema mismatch or corrupt derived file. Recovered automatically by
    /// drop-and-rebuild on open; surfaces only as a one-line notice.
    #[error("index stale: {0}")]
    IndexStale(String),

    /// Another process already holds the writer lock.
    #[error("writer already running: {0}")]
    WriterConflict(String),

    /// An embedding or reranker provider failed after retries.
    #[error("provider error: {0}")]
    ProviderTransient(String),

    /// Bad API key or unknown model — retrying will not help.
    #[error("provider configuration error: {0}")]
    ProviderHardFailure(String),
}

impl GroveError {
    /// Process exit code for this error kind.
    ///
    /// `0` success, `2` user-input error, `3` index unavailable,
    /// `4` writer already running. Provider errors surface as `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Input(_) => 2,
            Self::IndexUnavailable(_) | Self::IndexStale(_) => 3,
            Self::WriterConflict(_) => 4,
            Self::ProviderTransient(_) | Self::ProviderHardFailure(_) => 1,
        }
    }
}

/// Map an `anyhow::Error` chain to an exit code, defaulting to 1.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<GroveError>()
        .map(GroveError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(GroveError::Input("bad slug".into()).exit_code(), 2);
        assert_eq!(GroveError::IndexUnavailable("no db".into()).exit_code(), 3);
        assert_eq!(GroveError::IndexStale("schema v1 < v3".into()).exit_code(), 3);
        assert_eq!(GroveError::WriterConflict("locked".into()).exit_code(), 4);
    }

    #[test]
    fn downcast_through_anyhow() {
        let err: anyhow::Error = GroveError::WriterConflict("watcher pid 42".into()).into();
        assert_eq!(exit_code_for(&err), 4);
        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), 1);
    }
}
