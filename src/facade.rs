//! The unified entry point applications embed: `remember` (fast,
//! synchronous, no LLM calls) and `recall`/`consolidate`/`end_session`
//! (LLM-backed), plus passthrough accessors over the Store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::config::MemoryConfig;
use crate::consolidation::Consolidator;
use crate::error::{MemoryError, Result};
use crate::extraction::Extractor;
use crate::retrieval::Retriever;
use crate::store::{ExportedData, Store, StoreStats};
use crate::traits::{EmbeddingClient, LlmClient};
use crate::types::{
    ActivatedConcept, Concept, ConsolidationResult, Entity, EntityType, Episode, EpisodeType,
};

const REMIND_DIR_NAME: &str = ".memtiers";

/// Resolve a database name or path the way the CLI/tooling layer does: an
/// absolute path is used as-is (with a `.db` suffix and parent-directory
/// creation); a simple name resolves under the per-user state directory;
/// anything else (a relative path, `~`, a dot-prefixed name) is rejected.
pub fn resolve_db_path(name: Option<&str>) -> Result<PathBuf> {
    let state_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(REMIND_DIR_NAME);

    let Some(name) = name else {
        std::fs::create_dir_all(&state_dir)?;
        return Ok(state_dir.join("memory.db"));
    };
    let name = name.trim();

    if name.starts_with('/') {
        let mut owned = name.to_string();
        if !owned.ends_with(".db") {
            owned.push_str(".db");
        }
        let path = PathBuf::from(owned);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        return Ok(path);
    }

    if name.contains('/') || name.starts_with('~') || name.starts_with('.') {
        return Err(MemoryError::ConfigurationError(format!(
            "invalid database name '{name}'; use a simple name like 'myproject', or an absolute path"
        )));
    }

    std::fs::create_dir_all(&state_dir)?;
    let mut owned = name.to_string();
    if !owned.ends_with(".db") {
        owned.push_str(".db");
    }
    Ok(state_dir.join(owned))
}

/// Per-canonicalized-db-path construction mutex: two callers racing to open
/// the same database file serialize through the same lock instead of racing
/// SQLite's own file-level locking during schema initialization.
static CONSTRUCTION_LOCKS: std::sync::OnceLock<DashMap<PathBuf, Arc<Mutex<()>>>> = std::sync::OnceLock::new();

fn construction_locks() -> &'static DashMap<PathBuf, Arc<Mutex<()>>> {
    CONSTRUCTION_LOCKS.get_or_init(DashMap::new)
}

fn construction_lock(path: &Path) -> Arc<Mutex<()>> {
    construction_locks()
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// The unified memory engine façade.
pub struct MemoryInterface {
    store: Store,
    consolidator: Consolidator,
    retriever: Retriever,
    extractor: Extractor,
    config: MemoryConfig,
    session_episode_ids: Mutex<Vec<String>>,
    last_consolidation: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    llm_name: String,
    embedding_name: String,
}

impl MemoryInterface {
    /// Open (or create) the database at `db_path` and wire up every
    /// component, serialized per-path against concurrent construction.
    pub fn open(db_path: &Path, llm: Arc<dyn LlmClient>, embedder: Arc<dyn EmbeddingClient>, config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        let canonical = db_path.canonicalize().unwrap_or_else(|_| db_path.to_path_buf());
        let lock = construction_lock(&canonical);
        let _guard = lock.lock();

        let store = Store::open(db_path, config.connection_pool_size)?;
        Ok(Self::from_parts(store, llm, embedder, config))
    }

    /// Build the façade over an already-open [`Store`] (used by tests and
    /// by in-memory construction, where there is no per-path lock to take).
    #[must_use]
    pub fn from_parts(store: Store, llm: Arc<dyn LlmClient>, embedder: Arc<dyn EmbeddingClient>, config: MemoryConfig) -> Self {
        let llm_name = llm.name().to_string();
        let embedding_name = embedder.name().to_string();
        let extractor = Extractor::new(llm.clone(), store.clone(), config.max_content_length);
        let consolidator_extractor = Extractor::new(llm.clone(), store.clone(), config.max_content_length);
        let consolidator = Consolidator::new(
            llm,
            embedder.clone(),
            store.clone(),
            consolidator_extractor,
            config.batch_size,
            config.min_confidence,
        );
        let retriever = Retriever::new(store.clone(), embedder, config.clone());

        Self {
            store,
            consolidator,
            retriever,
            extractor,
            config,
            session_episode_ids: Mutex::new(Vec::new()),
            last_consolidation: Mutex::new(None),
            llm_name,
            embedding_name,
        }
    }

    /// Log an experience. Fast and synchronous — no LLM calls; entity
    /// extraction and classification happen during [`Self::consolidate`].
    ///
    /// When `episode_type` or `entity_ids` is supplied explicitly, the
    /// episode is marked already extracted. Entities named via `entity_ids`
    /// are synthesized directly with that caller-supplied id (not
    /// recanonicalized), so callers who know their own id scheme keep
    /// exact control over it.
    pub fn remember(
        &self,
        content: impl Into<String>,
        metadata: HashMap<String, Value>,
        episode_type: Option<EpisodeType>,
        entity_ids: Option<Vec<String>>,
        confidence: f32,
    ) -> Result<String> {
        let mut episode = Episode::new(content.into(), confidence);
        episode.metadata = metadata;

        if let Some(et) = episode_type {
            episode.episode_type = et;
            episode.entities_extracted = true;
        }
        if let Some(ids) = &entity_ids {
            episode.entity_ids = ids.clone();
            episode.entities_extracted = true;
        }

        let episode_id = self.store.add_episode(&episode)?;
        self.session_episode_ids.lock().push(episode_id.clone());

        if let Some(ids) = entity_ids {
            for entity_id in ids {
                if self.store.get_entity(&entity_id)?.is_none() {
                    let (entity_type, name) = Entity::parse_id(&entity_id);
                    let entity = Entity {
                        id: entity_id.clone(),
                        entity_type,
                        display_name: name,
                        created_at: chrono::Utc::now(),
                    };
                    self.store.add_entity(&entity)?;
                }
                self.store.add_mention(&episode_id, &entity_id)?;
            }
        }

        debug!(episode_id = %episode_id, "remembered episode");
        Ok(episode_id)
    }

    /// Retrieve relevant memory: entity-based if `entity` is given,
    /// otherwise semantic spreading-activation retrieval seeded by `query`
    /// and an optional `context` block, including weakly-activated concepts.
    /// Returns raw objects when `raw` is `true`, or an LLM-ready formatted
    /// string otherwise.
    #[instrument(skip(self, query, context))]
    pub async fn recall(
        &self,
        query: &str,
        k: Option<usize>,
        context: Option<&str>,
        entity: Option<&str>,
        raw: bool,
    ) -> Result<RecallOutput> {
        let k = k.unwrap_or(self.config.default_recall_k);
        let result = if let Some(entity_id) = entity {
            let episodes = self.retriever.retrieve_by_entity(entity_id, (k * 4) as u32)?;
            RecallResult::Episodes(episodes)
        } else {
            let activated = self.retriever.retrieve(query, Some(k), context, true).await?;
            RecallResult::Concepts(activated)
        };
        if raw {
            Ok(RecallOutput::Raw(result))
        } else {
            let formatted = self.format_recall(&result);
            Ok(RecallOutput::Formatted(formatted))
        }
    }

    /// Render a [`RecallResult`] for LLM injection.
    #[must_use]
    pub fn format_recall(&self, result: &RecallResult) -> String {
        match result {
            RecallResult::Concepts(concepts) => self.retriever.format_for_llm(concepts, false),
            RecallResult::Episodes(episodes) => episodes
                .iter()
                .map(|e| format!("- {}", e.title.clone().unwrap_or_else(|| e.content.clone())))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Run consolidation manually.
    pub async fn consolidate(&self, force: bool) -> Result<ConsolidationResult> {
        let result = self.consolidator.consolidate(force).await?;
        if result.episodes_processed > 0 {
            *self.last_consolidation.lock() = Some(chrono::Utc::now());
            self.session_episode_ids.lock().clear();
        }
        Ok(result)
    }

    /// Hook for ending a session: force-consolidates if any episodes are
    /// pending, a no-op otherwise.
    pub async fn end_session(&self) -> Result<ConsolidationResult> {
        let pending = self.pending_episodes_count()?;
        if pending == 0 {
            debug!("end_session called but no pending episodes");
            return Ok(ConsolidationResult::empty());
        }
        info!(pending, "end_session: consolidating pending episodes");
        self.consolidate(true).await
    }

    pub fn pending_episodes_count(&self) -> Result<u64> {
        self.store.count_unconsolidated_episodes()
    }

    pub fn should_consolidate(&self) -> Result<bool> {
        Ok(self.pending_episodes_count()? >= u64::from(self.config.consolidation_threshold))
    }

    pub fn get_pending_episodes(&self, limit: u32) -> Result<Vec<Episode>> {
        self.store.get_unconsolidated_episodes(limit)
    }

    // -----------------------------------------------------------------
    // Direct passthrough accessors
    // -----------------------------------------------------------------

    pub fn get_concept(&self, id: &str) -> Result<Option<Concept>> {
        self.store.get_concept(id)
    }

    pub fn get_all_concepts(&self) -> Result<Vec<Concept>> {
        self.store.get_all_concepts()
    }

    pub fn get_recent_episodes(&self, limit: u32) -> Result<Vec<Episode>> {
        self.store.get_recent_episodes(limit)
    }

    pub fn get_episodes_by_type(&self, episode_type: EpisodeType, limit: u32) -> Result<Vec<Episode>> {
        self.store.get_episodes_by_type(episode_type, limit)
    }

    pub fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.store.get_entity(id)
    }

    pub fn get_all_entities(&self) -> Result<Vec<Entity>> {
        self.store.get_all_entities()
    }

    pub fn get_episodes_mentioning(&self, entity_id: &str, limit: u32) -> Result<Vec<Episode>> {
        self.store.get_episodes_mentioning(entity_id, limit)
    }

    pub fn get_entity_mention_counts(&self) -> Result<Vec<(Entity, u64)>> {
        let entities = self.store.get_all_entities()?;
        let mut counts = Vec::with_capacity(entities.len());
        for entity in entities {
            let count = self.store.get_entity_mention_counts(&entity.id)?;
            counts.push((entity, count));
        }
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(counts)
    }

    /// Memory statistics, including provider names and consolidation state.
    pub fn get_stats(&self) -> Result<FacadeStats> {
        let store_stats = self.store.get_stats()?;
        Ok(FacadeStats {
            store_stats,
            session_episode_buffer: self.session_episode_ids.lock().len(),
            consolidation_threshold: self.config.consolidation_threshold,
            auto_consolidate: self.config.auto_consolidate,
            should_consolidate: self.should_consolidate()?,
            last_consolidation: *self.last_consolidation.lock(),
            llm_provider: self.llm_name.clone(),
            embedding_provider: self.embedding_name.clone(),
        })
    }

    pub fn export_memory(&self) -> Result<ExportedData> {
        self.store.export_data()
    }

    pub fn import_memory(&self, data: &ExportedData) -> Result<()> {
        self.store.import_data(data)
    }

    /// The backing entity type for an unknown-scheme entity id, also used
    /// by the extractor to classify unprefixed proposed entity names.
    #[must_use]
    pub fn default_entity_type() -> EntityType {
        EntityType::Other
    }

    /// Borrow the underlying store (used by the background worker binary to
    /// construct its own [`Consolidator`] over the same database).
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }
}

/// Result of [`MemoryInterface::recall`]: entity-based recall yields raw
/// episodes; semantic recall yields activated concepts.
#[derive(Debug, Clone)]
pub enum RecallResult {
    Concepts(Vec<ActivatedConcept>),
    Episodes(Vec<Episode>),
}

/// Outer envelope returned by [`MemoryInterface::recall`]: the `raw`
/// argument picks which variant comes back.
#[derive(Debug, Clone)]
pub enum RecallOutput {
    Raw(RecallResult),
    Formatted(String),
}

impl RecallOutput {
    #[must_use]
    pub fn as_raw(&self) -> Option<&RecallResult> {
        match self {
            Self::Raw(result) => Some(result),
            Self::Formatted(_) => None,
        }
    }

    #[must_use]
    pub fn as_formatted(&self) -> Option<&str> {
        match self {
            Self::Formatted(text) => Some(text.as_str()),
            Self::Raw(_) => None,
        }
    }
}

/// A scoped façade guard: on drop, if any episodes are pending, spawns a
/// blocking consolidation via the runtime handle captured at construction.
/// Mirrors the source's context-manager form, whose `__aexit__` consolidates
/// pending episodes on scope exit.
pub struct ScopedMemory {
    interface: Arc<MemoryInterface>,
    handle: tokio::runtime::Handle,
}

impl ScopedMemory {
    #[must_use]
    pub fn new(interface: Arc<MemoryInterface>) -> Self {
        Self {
            interface,
            handle: tokio::runtime::Handle::current(),
        }
    }

    #[must_use]
    pub fn interface(&self) -> &MemoryInterface {
        &self.interface
    }
}

impl Drop for ScopedMemory {
    fn drop(&mut self) {
        let interface = self.interface.clone();
        self.handle.spawn(async move {
            match interface.pending_episodes_count() {
                Ok(0) | Err(_) => {}
                Ok(_) => {
                    if let Err(e) = interface.end_session().await {
                        tracing::warn!("scoped memory end_session failed: {e}");
                    }
                }
            }
        });
    }
}

/// Aggregate stats exposed by [`MemoryInterface::get_stats`].
#[derive(Debug, Clone)]
pub struct FacadeStats {
    pub store_stats: StoreStats,
    pub session_episode_buffer: usize,
    pub consolidation_threshold: u32,
    pub auto_consolidate: bool,
    pub should_consolidate: bool,
    pub last_consolidation: Option<chrono::DateTime<chrono::Utc>>,
    pub llm_provider: String,
    pub embedding_provider: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{FakeEmbeddingClient, FakeLlmClient};

    fn facade() -> MemoryInterface {
        let store = Store::open_in_memory();
        let llm = Arc::new(FakeLlmClient::with_response("{}"));
        let embedder = Arc::new(FakeEmbeddingClient::new(8));
        MemoryInterface::from_parts(store, llm, embedder, MemoryConfig::for_testing())
    }

    #[test]
    fn remember_is_synchronous_and_returns_an_id() {
        let f = facade();
        let id = f.remember("hello", HashMap::new(), None, None, 1.0).unwrap();
        assert!(!id.is_empty());
        assert_eq!(f.pending_episodes_count().unwrap(), 1);
    }

    #[test]
    fn remember_with_explicit_entities_uses_caller_supplied_id_verbatim() {
        let f = facade();
        f.remember(
            "discussed src/auth.ts",
            HashMap::new(),
            None,
            Some(vec!["file:src/auth.ts".to_string()]),
            1.0,
        )
        .unwrap();
        let entity = f.get_entity("file:src/auth.ts").unwrap().unwrap();
        assert_eq!(entity.id, "file:src/auth.ts");
        assert_eq!(entity.entity_type, EntityType::File);
    }

    #[test]
    fn remember_with_explicit_type_marks_entities_extracted() {
        let f = facade();
        let id = f
            .remember("decided to use SQLite", HashMap::new(), Some(EpisodeType::Decision), None, 1.0)
            .unwrap();
        let ep = f.store.get_episode(&id).unwrap().unwrap();
        assert!(ep.entities_extracted);
        assert_eq!(ep.episode_type, EpisodeType::Decision);
    }

    #[tokio::test]
    async fn end_session_is_noop_with_no_pending_episodes() {
        let f = facade();
        let result = f.end_session().await.unwrap();
        assert_eq!(result.episodes_processed, 0);
    }

    #[test]
    fn resolve_db_path_rejects_relative_and_dotted_names() {
        assert!(resolve_db_path(Some("../escape")).is_err());
        assert!(resolve_db_path(Some(".hidden")).is_err());
        assert!(resolve_db_path(Some("~/home")).is_err());
    }

    #[test]
    fn resolve_db_path_accepts_absolute_paths_as_is() {
        let resolved = resolve_db_path(Some("/tmp/memtiers-test-db-dir/mydb")).unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/memtiers-test-db-dir/mydb.db"));
    }

    #[test]
    fn resolve_db_path_appends_db_suffix_for_simple_names() {
        let resolved = resolve_db_path(Some("myproject")).unwrap();
        assert!(resolved.to_string_lossy().ends_with("myproject.db"));
    }
}
