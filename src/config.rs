//! Memory engine configuration: consolidation, retrieval, and extraction tunables.

use std::collections::HashMap;

use crate::error::{MemoryError, Result};
use crate::types::ConceptRelationType;

/// Per-relation-type spreading-activation weights, keyed by the relation
/// type's lowercase tag. Any relation type absent from the map falls back
/// to 0.5.
#[derive(Debug, Clone)]
pub struct RelationWeights(HashMap<String, f32>);

impl Default for RelationWeights {
    fn default() -> Self {
        let mut map = HashMap::new();
        for rel in [
            ConceptRelationType::Implies,
            ConceptRelationType::Specializes,
            ConceptRelationType::Generalizes,
            ConceptRelationType::PartOf,
            ConceptRelationType::ContextOf,
            ConceptRelationType::Causes,
            ConceptRelationType::Correlates,
            ConceptRelationType::Contradicts,
        ] {
            map.insert(rel.as_str().to_string(), rel.default_weight());
        }
        Self(map)
    }
}

impl RelationWeights {
    /// Weight for a relation type; 0.5 when the type is not in the map.
    #[must_use]
    pub fn get(&self, relation_type: ConceptRelationType) -> f32 {
        self.0.get(relation_type.as_str()).copied().unwrap_or(0.5)
    }

    /// Override the weight for a specific relation type.
    pub fn set(&mut self, relation_type: ConceptRelationType, weight: f32) {
        self.0.insert(relation_type.as_str().to_string(), weight);
    }
}

/// Every tunable an embedding application needs to adjust, plus construction-time-only ambient
/// settings that are not tied to any specific LLM/embedding provider.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Episodes accumulated before auto-consolidation becomes eligible.
    pub consolidation_threshold: u32,
    /// Whether the façade triggers background consolidation automatically.
    pub auto_consolidate: bool,
    /// Default `k` for `recall` when the caller does not specify one.
    pub default_recall_k: usize,
    /// Number of spreading-activation hops beyond the initial seed.
    pub spread_hops: u32,
    /// Per-hop decay multiplier applied during spreading activation.
    pub spread_decay: f32,
    /// Activation floor below which a concept is not seeded or spread further.
    pub activation_threshold: f32,
    /// Per-relation-type spreading-activation weights.
    pub relation_weights: RelationWeights,
    /// Minimum confidence a newly proposed concept must meet to be created.
    pub min_confidence: f32,
    /// Maximum episodes fetched per consolidation phase.
    pub batch_size: u32,
    /// Content length above which extraction input is truncated.
    pub max_content_length: usize,
    /// Dimensionality every stored concept embedding must have (Invariant R2).
    pub embedding_dimensions: usize,
    /// Size of the connection pool backing the Store.
    pub connection_pool_size: u32,
    /// Per-user state directory override for the background coordinator's
    /// lock files; `None` resolves to the platform default at runtime.
    pub lock_state_dir: Option<std::path::PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            consolidation_threshold: 10,
            auto_consolidate: true,
            default_recall_k: 5,
            spread_hops: 2,
            spread_decay: 0.5,
            activation_threshold: 0.1,
            relation_weights: RelationWeights::default(),
            min_confidence: 0.3,
            batch_size: 10,
            max_content_length: 2000,
            embedding_dimensions: 384,
            connection_pool_size: 4,
            lock_state_dir: None,
        }
    }
}

impl MemoryConfig {
    /// A configuration tuned for fast, deterministic tests: a tiny pool and
    /// an isolated lock directory a caller is expected to override with a
    /// temp directory.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            connection_pool_size: 1,
            ..Self::default()
        }
    }

    /// Validate range constraints on the numeric tunables. Called at
    /// façade construction time; failures are [`MemoryError::ConfigurationError`].
    pub fn validate(&self) -> Result<()> {
        let checks: &[(bool, &str)] = &[
            (
                (0.0..=1.0).contains(&self.spread_decay),
                "spread_decay must be in [0, 1]",
            ),
            (
                (0.0..=1.0).contains(&self.activation_threshold),
                "activation_threshold must be in [0, 1]",
            ),
            (
                (0.0..=1.0).contains(&self.min_confidence),
                "min_confidence must be in [0, 1]",
            ),
            (self.batch_size > 0, "batch_size must be positive"),
            (
                self.embedding_dimensions > 0,
                "embedding_dimensions must be positive",
            ),
            (
                self.connection_pool_size > 0,
                "connection_pool_size must be positive",
            ),
            (
                self.default_recall_k > 0,
                "default_recall_k must be positive",
            ),
        ];
        for (ok, message) in checks {
            if !ok {
                return Err(MemoryError::ConfigurationError((*message).to_string()));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn with_embedding_dimensions(mut self, dims: usize) -> Self {
        self.embedding_dimensions = dims;
        self
    }

    #[must_use]
    pub fn with_lock_state_dir(mut self, dir: std::path::PathBuf) -> Self {
        self.lock_state_dir = Some(dir);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let c = MemoryConfig::default();
        assert_eq!(c.consolidation_threshold, 10);
        assert!(c.auto_consolidate);
        assert_eq!(c.default_recall_k, 5);
        assert_eq!(c.spread_hops, 2);
        assert!((c.spread_decay - 0.5).abs() < f32::EPSILON);
        assert!((c.activation_threshold - 0.1).abs() < f32::EPSILON);
        assert!((c.min_confidence - 0.3).abs() < f32::EPSILON);
        assert_eq!(c.batch_size, 10);
        assert_eq!(c.max_content_length, 2000);
    }

    #[test]
    fn relation_weights_match_spec_defaults_and_fall_back() {
        let w = RelationWeights::default();
        assert!((w.get(ConceptRelationType::Implies) - 0.9).abs() < f32::EPSILON);
        assert!((w.get(ConceptRelationType::Contradicts) - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn validate_rejects_out_of_range_decay() {
        let mut c = MemoryConfig::default();
        c.spread_decay = 1.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(MemoryConfig::default().validate().is_ok());
    }
}
