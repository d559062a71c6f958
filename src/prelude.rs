//! Prelude for common imports.
//!
//! Usage:
//! ```rust
//! use memtiers::prelude::*;
//! ```

pub use crate::config::MemoryConfig;
pub use crate::error::{MemoryError, Result};
pub use crate::facade::{resolve_db_path, MemoryInterface, RecallOutput, RecallResult, ScopedMemory};
pub use crate::store::Store;
pub use crate::traits::{EmbeddingClient, FakeEmbeddingClient, FakeLlmClient, LlmClient};
pub use crate::types::{
    ActivatedConcept, Concept, ConceptRelation, ConceptRelationType, ConsolidationResult, Entity,
    EntityType, Episode, EpisodeType,
};
