//! Core data model: entities, episodes, concepts, and their relations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Generate an 8-character opaque identifier for episodes and concepts.
#[must_use]
pub fn generate_short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Lowercase, collapse internal whitespace, and trim a display name.
///
/// This is the exact normalization entity ids are derived from (Invariant
/// E1): two names differing only in casing or internal whitespace run
/// through this function must produce the same string.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let collapsed: Vec<&str> = name.split_whitespace().collect();
    collapsed.join(" ").to_lowercase()
}

/// Build the canonical entity id `"<type>:<normalized_name>"`.
#[must_use]
pub fn entity_id(entity_type: EntityType, display_name: &str) -> String {
    format!("{}:{}", entity_type.as_str(), normalize_name(display_name))
}

/// The fixed set of entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    File,
    Function,
    Class,
    Module,
    Subject,
    Person,
    Project,
    Tool,
    Other,
}

impl EntityType {
    /// Lowercase tag used in the canonical entity id and wire format.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Function => "function",
            Self::Class => "class",
            Self::Module => "module",
            Self::Subject => "subject",
            Self::Person => "person",
            Self::Project => "project",
            Self::Tool => "tool",
            Self::Other => "other",
        }
    }

    /// Parse a type tag, falling back to `Other` for anything unrecognized.
    #[must_use]
    pub fn parse_or_other(s: &str) -> Self {
        match s {
            "file" => Self::File,
            "function" => Self::Function,
            "class" => Self::Class,
            "module" => Self::Module,
            "subject" => Self::Subject,
            "person" => Self::Person,
            "project" => Self::Project,
            "tool" => Self::Tool,
            _ => Self::Other,
        }
    }
}

/// A named referent that episodes may mention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Canonical id, `"<type>:<normalize(display_name)>"`.
    pub id: String,
    pub entity_type: EntityType,
    /// Human-facing name, original casing preserved.
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    /// Construct an entity, deriving its id from type and display name.
    #[must_use]
    pub fn new(entity_type: EntityType, display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        let id = entity_id(entity_type, &display_name);
        Self {
            id,
            entity_type,
            display_name,
            created_at: Utc::now(),
        }
    }

    /// Parse an id of the form `"type:name"`, defaulting to [`EntityType::Other`]
    /// when the type prefix is absent or unrecognized.
    ///
    /// Used by the interface façade when synthesizing entities referenced by
    /// id in `remember`'s `entity_ids` parameter.
    #[must_use]
    pub fn parse_id(id: &str) -> (EntityType, String) {
        match id.split_once(':') {
            Some((type_str, name)) => (EntityType::parse_or_other(type_str), name.to_string()),
            None => (EntityType::Other, id.to_string()),
        }
    }
}

/// The fixed set of episode kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeType {
    Observation,
    Decision,
    Question,
    Meta,
    Preference,
}

impl Default for EpisodeType {
    fn default() -> Self {
        Self::Observation
    }
}

impl EpisodeType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::Decision => "decision",
            Self::Question => "question",
            Self::Meta => "meta",
            Self::Preference => "preference",
        }
    }

    /// Fixed display order used by entity-centric formatting.
    #[must_use]
    pub const fn display_order() -> [Self; 5] {
        [
            Self::Decision,
            Self::Question,
            Self::Preference,
            Self::Observation,
            Self::Meta,
        ]
    }

    /// Three-character abbreviation used in chronological entity-centric listings.
    #[must_use]
    pub const fn abbrev(self) -> &'static str {
        match self {
            Self::Observation => "obs",
            Self::Decision => "dec",
            Self::Question => "qst",
            Self::Meta => "met",
            Self::Preference => "prf",
        }
    }
}

impl std::str::FromStr for EpisodeType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "observation" => Self::Observation,
            "decision" => Self::Decision,
            "question" => Self::Question,
            "meta" => Self::Meta,
            "preference" => Self::Preference,
            _ => return Err(()),
        })
    }
}

/// A raw, timestamped observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    #[serde(default = "generate_short_id")]
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub title: Option<String>,
    #[serde(default)]
    pub episode_type: EpisodeType,
    #[serde(default)]
    pub entity_ids: Vec<String>,
    #[serde(default)]
    pub consolidated: bool,
    #[serde(default)]
    pub entities_extracted: bool,
    #[serde(default)]
    pub relations_extracted: bool,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Concept ids this episode has contributed activation evidence to.
    /// Internal bookkeeping, cleared by `reset_episode_flags`.
    #[serde(default)]
    pub concepts_activated: Vec<String>,
}

fn default_confidence() -> f32 {
    1.0
}

impl Episode {
    /// Construct a new episode with clamped confidence and an opaque id.
    #[must_use]
    pub fn new(content: impl Into<String>, confidence: f32) -> Self {
        Self {
            id: generate_short_id(),
            timestamp: Utc::now(),
            content: content.into(),
            title: None,
            episode_type: EpisodeType::default(),
            entity_ids: Vec::new(),
            consolidated: false,
            entities_extracted: false,
            relations_extracted: false,
            confidence: confidence.clamp(0.0, 1.0),
            metadata: HashMap::new(),
            concepts_activated: Vec::new(),
        }
    }

    /// Metadata keys visible to prompts (underscore-prefixed keys are
    /// pipeline-internal and filtered out).
    #[must_use]
    pub fn public_metadata(&self) -> HashMap<String, Value> {
        self.metadata
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// The fixed set of concept-to-concept relation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptRelationType {
    Implies,
    Contradicts,
    Specializes,
    Generalizes,
    Causes,
    Correlates,
    PartOf,
    ContextOf,
}

impl ConceptRelationType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Implies => "implies",
            Self::Contradicts => "contradicts",
            Self::Specializes => "specializes",
            Self::Generalizes => "generalizes",
            Self::Causes => "causes",
            Self::Correlates => "correlates",
            Self::PartOf => "part_of",
            Self::ContextOf => "context_of",
        }
    }

    /// Default spreading-activation weight for this relation type.
    #[must_use]
    pub const fn default_weight(self) -> f32 {
        match self {
            Self::Implies => 0.9,
            Self::Specializes | Self::Generalizes => 0.85,
            Self::PartOf => 0.8,
            Self::ContextOf | Self::Causes => 0.7,
            Self::Correlates => 0.6,
            Self::Contradicts => 0.3,
        }
    }
}

impl std::str::FromStr for ConceptRelationType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "implies" => Self::Implies,
            "contradicts" => Self::Contradicts,
            "specializes" => Self::Specializes,
            "generalizes" => Self::Generalizes,
            "causes" => Self::Causes,
            "correlates" => Self::Correlates,
            "part_of" => Self::PartOf,
            "context_of" => Self::ContextOf,
            _ => return Err(()),
        })
    }
}

/// A directed, typed, strength-weighted edge between two concepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptRelation {
    pub target_id: String,
    pub relation_type: ConceptRelationType,
    pub strength: f32,
    pub context: Option<String>,
}

/// The semantic-memory unit: a generalized statement derived from episodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    #[serde(default = "generate_short_id")]
    pub id: String,
    pub title: Option<String>,
    pub summary: String,
    pub confidence: f32,
    pub instance_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub relations: Vec<ConceptRelation>,
    #[serde(default)]
    pub source_episodes: Vec<String>,
    pub conditions: Option<String>,
    #[serde(default)]
    pub exceptions: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Concept {
    /// Construct a new concept; `instance_count` follows the creation rule
    /// (length of `source_episodes`, or 1 if empty) — distinct from the
    /// update rule, which always increments by exactly 1.
    #[must_use]
    pub fn new(summary: impl Into<String>, confidence: f32, source_episodes: Vec<String>) -> Self {
        let now = Utc::now();
        let instance_count = u32::try_from(source_episodes.len()).unwrap_or(u32::MAX).max(1);
        Self {
            id: generate_short_id(),
            title: None,
            summary: summary.into(),
            confidence: confidence.clamp(0.0, 1.0),
            instance_count,
            created_at: now,
            updated_at: now,
            relations: Vec::new(),
            source_episodes,
            conditions: None,
            exceptions: Vec::new(),
            embedding: None,
            tags: Vec::new(),
        }
    }

    /// Add or replace (by `(type, target_id)`) an outgoing relation.
    pub fn add_relation(&mut self, relation: ConceptRelation) {
        if let Some(existing) = self
            .relations
            .iter_mut()
            .find(|r| r.relation_type == relation.relation_type && r.target_id == relation.target_id)
        {
            *existing = relation;
        } else {
            self.relations.push(relation);
        }
    }
}

/// A directed, free-form-typed edge between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelation {
    pub source_id: String,
    pub target_id: String,
    pub relation_type: String,
    pub strength: f32,
    pub context: Option<String>,
    pub source_episode_id: Option<String>,
}

/// Proposed entity emitted by the extractor, pre-canonicalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedEntity {
    pub entity_type: EntityType,
    pub display_name: String,
}

/// Proposed entity-to-entity relation emitted by the extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedEntityRelation {
    pub source_name: String,
    pub target_name: String,
    pub relation_type: String,
    pub strength: f32,
    pub context: Option<String>,
}

/// Result of extracting a single episode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub episode_type: Option<EpisodeType>,
    pub title: Option<String>,
    #[serde(default)]
    pub entities: Vec<ProposedEntity>,
    #[serde(default)]
    pub entity_relations: Vec<ProposedEntityRelation>,
}

/// A concept proposed for update by a consolidation plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptUpdate {
    pub id: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub confidence_delta: f32,
    #[serde(default)]
    pub new_exceptions: Vec<String>,
    #[serde(default)]
    pub new_tags: Vec<String>,
    #[serde(default)]
    pub new_source_episodes: Vec<String>,
}

/// A relation embedded in a `new_concept` entry or a top-level `new_relations` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedConceptRelation {
    pub relation_type: ConceptRelationType,
    pub target_id: String,
    pub strength: f32,
    pub context: Option<String>,
}

/// A top-level relation referencing either existing concept ids or temp ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedTopLevelRelation {
    pub source_id: String,
    pub relation: ProposedConceptRelation,
}

/// A concept proposed for creation, keyed by a transient `NEW_<n>` id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConceptProposal {
    pub temp_id: String,
    pub title: Option<String>,
    pub summary: String,
    pub confidence: f32,
    #[serde(default)]
    pub source_episodes: Vec<String>,
    pub conditions: Option<String>,
    #[serde(default)]
    pub exceptions: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub relations: Vec<ProposedConceptRelation>,
}

/// A reported, unresolved contradiction between concepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contradiction {
    pub concept_a: String,
    pub concept_b: String,
    pub description: String,
}

/// The structured plan an LLM must return for Phase 2 of consolidation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsolidationPlan {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub updates: Vec<ConceptUpdate>,
    #[serde(default)]
    pub new_concepts: Vec<NewConceptProposal>,
    #[serde(default)]
    pub new_relations: Vec<ProposedTopLevelRelation>,
    #[serde(default)]
    pub contradictions: Vec<Contradiction>,
}

/// Aggregate counters and diagnostic id lists produced by `consolidate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsolidationResult {
    pub episodes_processed: usize,
    pub concepts_created: usize,
    pub concepts_updated: usize,
    pub contradictions_found: usize,
    pub created_concept_ids: Vec<String>,
    pub updated_concept_ids: Vec<String>,
}

impl ConsolidationResult {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Where an activated concept's activation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationSource {
    Embedding,
    Spread,
}

/// A concept returned by `retrieve`, with its activation bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatedConcept {
    pub concept: Concept,
    pub activation: f32,
    pub source: ActivationSource,
    pub hops: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_name("  Alice   Smith "), "alice smith");
        assert_eq!(normalize_name("ALICE"), "alice");
        assert_eq!(normalize_name("alice"), "alice");
    }

    #[test]
    fn entity_ids_match_across_casing_variants() {
        let a = Entity::new(EntityType::Person, "Alice");
        let b = Entity::new(EntityType::Person, "alice");
        let c = Entity::new(EntityType::Person, "  alice  ");
        assert_eq!(a.id, b.id);
        assert_eq!(b.id, c.id);
        assert_eq!(a.id, "person:alice");
    }

    #[test]
    fn parse_id_defaults_to_other() {
        assert_eq!(Entity::parse_id("unscoped"), (EntityType::Other, "unscoped".to_string()));
        assert_eq!(Entity::parse_id("tool:ripgrep"), (EntityType::Tool, "ripgrep".to_string()));
    }

    #[test]
    fn confidence_is_clamped_on_construction() {
        let ep = Episode::new("hello", 5.0);
        assert_eq!(ep.confidence, 1.0);
        let ep = Episode::new("hello", -1.0);
        assert_eq!(ep.confidence, 0.0);
    }

    #[test]
    fn public_metadata_filters_underscore_keys() {
        let mut ep = Episode::new("hi", 1.0);
        ep.metadata.insert("_pending".into(), Value::Bool(true));
        ep.metadata.insert("topic".into(), Value::String("rust".into()));
        let pub_meta = ep.public_metadata();
        assert!(!pub_meta.contains_key("_pending"));
        assert!(pub_meta.contains_key("topic"));
    }

    #[test]
    fn concept_relation_dedup_replaces_in_place() {
        let mut c = Concept::new("summary", 0.9, vec![]);
        c.add_relation(ConceptRelation {
            target_id: "x".into(),
            relation_type: ConceptRelationType::Implies,
            strength: 0.5,
            context: None,
        });
        c.add_relation(ConceptRelation {
            target_id: "x".into(),
            relation_type: ConceptRelationType::Implies,
            strength: 0.9,
            context: None,
        });
        assert_eq!(c.relations.len(), 1);
        assert_eq!(c.relations[0].strength, 0.9);
    }

    #[test]
    fn new_concept_instance_count_follows_creation_rule() {
        let c = Concept::new("s", 0.8, vec!["ep1".into(), "ep2".into()]);
        assert_eq!(c.instance_count, 2);
        let c = Concept::new("s", 0.8, vec![]);
        assert_eq!(c.instance_count, 1);
    }
}
