//! Error types for the memory engine.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors surfaced by the memory engine's components.
///
/// Variants map directly onto the error kinds the core is specified against:
/// transient provider failures, malformed LLM output, validation rejections
/// isolated to a single record, not-found conditions (which are usually
/// handled as `Option` rather than raised here), configuration mistakes
/// caught at construction time, and lock contention reported as a plain
/// boolean at the call site rather than raised.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The LLM or embedding provider failed transiently (network, rate limit,
    /// timeout). Not retried by the core; the caller decides.
    #[error("provider call failed: {0}")]
    TransientExternal(String),

    /// The LLM returned JSON that could not be parsed even after tolerant
    /// recovery was attempted (extraction) or at all (consolidation, which
    /// never attempts recovery).
    #[error("malformed structured response: {0}")]
    MalformedStructured(String),

    /// A proposed mutation violated a domain invariant: confidence below
    /// `min_confidence`, a relation referencing a missing endpoint, an update
    /// referencing a missing concept. Always isolated to the one entry.
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// A required record did not exist. Most Store lookups return `Option`
    /// instead of this variant; it is used where absence is itself the
    /// caller-facing error (e.g. operating on a named memory that is not
    /// initialized).
    #[error("not found: {0}")]
    NotFound(String),

    /// Raised at construction time: an invalid database path, a malformed
    /// namespace name, or a rejected configuration value.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Background consolidation could not be spawned because another
    /// process already holds the per-database lock. Most call sites report
    /// this as a `bool` rather than constructing the error, but it exists
    /// for callers that want to distinguish "lock held" from other I/O
    /// failures while spawning.
    #[error("another consolidation is already running for this database")]
    LockContention,

    /// The underlying storage driver failed: I/O opening the file, a
    /// constraint violation, pool exhaustion. Treated as a single opaque
    /// infrastructure failure rather than enumerated per cause.
    #[error("storage error: {0}")]
    StorageIo(String),

    /// JSON (de)serialization failure outside the tolerant-recovery paths.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem I/O failure not covered by `StorageIo` (lock files,
    /// export/import paths).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<String> for MemoryError {
    fn from(s: String) -> Self {
        Self::ValidationFailure(s)
    }
}

impl From<&str> for MemoryError {
    fn from(s: &str) -> Self {
        Self::ValidationFailure(s.to_string())
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StorageIo(e.to_string())
    }
}

impl From<r2d2::Error> for MemoryError {
    fn from(e: r2d2::Error) -> Self {
        Self::StorageIo(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_a_non_empty_display() {
        let variants: Vec<MemoryError> = vec![
            MemoryError::TransientExternal("timeout".into()),
            MemoryError::MalformedStructured("not json".into()),
            MemoryError::ValidationFailure("confidence too low".into()),
            MemoryError::NotFound("concept:abc".into()),
            MemoryError::ConfigurationError("bad path".into()),
            MemoryError::LockContention,
            MemoryError::StorageIo("disk full".into()),
        ];
        for v in variants {
            assert!(!v.to_string().is_empty());
        }
    }

    #[test]
    fn string_conversions_land_in_validation_failure() {
        let e: MemoryError = "bad thing".into();
        assert!(matches!(e, MemoryError::ValidationFailure(_)));
        let e: MemoryError = String::from("bad thing").into();
        assert!(matches!(e, MemoryError::ValidationFailure(_)));
    }
}
