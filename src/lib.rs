//! # memtiers
//!
//! A hierarchical two-tier memory engine for long-running assistants.
//!
//! Raw observations ("episodes") are logged cheaply and synchronously via
//! [`facade::MemoryInterface::remember`]. Offline, a batch consolidation
//! pass generalizes groups of episodes into durable, typed "concepts" —
//! the semantic tier — which can later be retrieved by semantic similarity
//! and spread across a graph of concept-to-concept relations.
//!
//! ## Architecture
//!
//! ```text
//! MemoryInterface (facade)
//! ├── Store            SQLite-backed CRUD: episodes, entities, concepts, relations
//! ├── Extractor         per-episode entity/type classification (LLM)
//! ├── Consolidator       batch episode -> concept generalization (LLM)
//! ├── Retriever          spreading-activation concept retrieval + entity recall
//! └── background          cross-process file-locked consolidation worker
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use memtiers::prelude::*;
//!
//! let store = Store::open(Path::new("memory.db"), 4)?;
//! let memory = MemoryInterface::from_parts(store, llm, embedder, MemoryConfig::default());
//!
//! let episode_id = memory.remember("User prefers tabs over spaces", HashMap::new(), None, None, 1.0)?;
//!
//! let recalled = memory.recall("indentation preferences", None, None, None, false).await?;
//! println!("{}", recalled.as_formatted().unwrap_or_default());
//! ```

pub mod background;
pub mod config;
pub mod consolidation;
pub mod error;
pub mod extraction;
pub mod facade;
pub mod prelude;
pub mod retrieval;
pub mod store;
pub mod traits;
pub mod types;

pub use config::{MemoryConfig, RelationWeights};
pub use consolidation::Consolidator;
pub use error::{MemoryError, Result};
pub use extraction::Extractor;
pub use facade::{resolve_db_path, FacadeStats, MemoryInterface, RecallOutput, RecallResult, ScopedMemory};
pub use retrieval::Retriever;
pub use store::{ExportedData, Store, StoreStats};
pub use traits::{EmbeddingClient, FakeEmbeddingClient, FakeLlmClient, LlmClient};
pub use types::{
    ActivatedConcept, ActivationSource, Concept, ConceptRelation, ConceptRelationType,
    Contradiction, ConsolidationPlan, ConsolidationResult, Entity, EntityRelation, EntityType,
    Episode, EpisodeType, ExtractionResult,
};
