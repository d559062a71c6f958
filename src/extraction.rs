//! Single-episode pipeline: classify an episode and surface its entities
//! and entity-to-entity relations.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::store::Store;
use crate::traits::LlmClient;
use crate::types::{
    Entity, EntityRelation, EntityType, Episode, EpisodeType, ExtractionResult, ProposedEntity,
    ProposedEntityRelation,
};

const EXTRACTION_SYSTEM_PROMPT: &str = "You are an information extraction system. Your job is to:

1. Classify the type of memory/episode
2. Extract entities mentioned in the text
3. Identify relationships between extracted entities

Be conservative - only extract entities that are clearly mentioned.
Prefer specific entity types (file, function) over generic ones (subject).
Keep entity names SHORT (under 30 characters).
Only include relationships that are explicitly stated or strongly implied.
Respond with ONLY valid JSON, no explanations.";

const RELATIONS_SYSTEM_PROMPT: &str = EXTRACTION_SYSTEM_PROMPT;

fn extraction_prompt(content: &str) -> String {
    format!(
        "Classify and extract from this text:\n\n{content}\n\nReturn JSON:\n\
{{\n  \"type\": \"observation|decision|question|meta|preference\",\n  \"title\": \"Short descriptive title (5-10 words)\",\n  \"entities\": [{{\"type\": \"file|function|class|person|subject|tool|project\", \"id\": \"type:name\", \"name\": \"short name\"}}],\n  \"entity_relationships\": [{{\"source\": \"type:name\", \"target\": \"type:name\", \"relationship\": \"verb or description\", \"strength\": 0.7}}]\n}}\n\n\
Types: observation=noticed/learned, decision=choice made, question=uncertainty, meta=about thinking, preference=opinion/value\n\
Keep entity names under 30 chars. Empty arrays if none found. Strength is 0.0-1.0 confidence."
    )
}

fn relations_only_prompt(content: &str, entities: &str) -> String {
    format!(
        "Given this text and its already-identified entities, identify relationships between them:\n\n\
Text: {content}\n\nEntities present: {entities}\n\n\
Return JSON with relationships between these entities:\n\
{{\n  \"entity_relationships\": [{{\"source\": \"entity_id\", \"target\": \"entity_id\", \"relationship\": \"verb or description\", \"strength\": 0.7}}]\n}}\n\n\
Only identify relationships that are explicitly stated or strongly implied in the text.\n\
Use the exact entity IDs from the list above.\n\
Empty array if no relationships found. Strength is 0.0-1.0 confidence."
    )
}

/// Raw shape of the extraction LLM response, deserialized before
/// canonicalization/dedup is applied by [`Extractor`].
#[derive(Debug, Deserialize, Default)]
struct RawExtraction {
    #[serde(rename = "type")]
    episode_type: Option<String>,
    title: Option<String>,
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    entity_relationships: Vec<RawRelation>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    #[serde(rename = "type")]
    entity_type: Option<String>,
    name: Option<String>,
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRelation {
    source: Option<String>,
    target: Option<String>,
    relationship: Option<String>,
    #[serde(default = "default_strength")]
    strength: f32,
    context: Option<String>,
}

fn default_strength() -> f32 {
    0.5
}

#[derive(Debug, Deserialize)]
struct RawRelationsOnly {
    #[serde(default)]
    entity_relationships: Vec<RawRelation>,
}

/// Strip markdown fences, extract the first `{...}` region, close unmatched
/// delimiters, and as a last resort regex-recover `type`/`entities`. Used
/// only here — the Consolidator never attempts recovery.
fn try_fix_json(text: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }

    let fence_stripped = strip_code_fences(text);
    if let Ok(v) = serde_json::from_str(&fence_stripped) {
        return Some(v);
    }

    if let Some(brace_region) = extract_brace_region(&fence_stripped) {
        if let Ok(v) = serde_json::from_str(&brace_region) {
            return Some(v);
        }
        if let Ok(v) = serde_json::from_str(&close_unmatched_delimiters(&brace_region)) {
            return Some(v);
        }
    }

    regex_recover(text)
}

fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let without_open = Regex::new(r"^```(?:json)?\s*")
        .unwrap()
        .replace(trimmed, "")
        .into_owned();
    Regex::new(r"\s*```$")
        .unwrap()
        .replace(&without_open, "")
        .into_owned()
}

fn extract_brace_region(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(text[start..=end].to_string())
}

fn close_unmatched_delimiters(text: &str) -> String {
    let mut fixed = text.trim_end().to_string();
    let open_braces = fixed.matches('{').count() as i64 - fixed.matches('}').count() as i64;
    let open_brackets = fixed.matches('[').count() as i64 - fixed.matches(']').count() as i64;
    if fixed.matches('"').count() % 2 == 1 {
        fixed.push('"');
    }
    for _ in 0..open_brackets.max(0) {
        fixed.push(']');
    }
    for _ in 0..open_braces.max(0) {
        fixed.push('}');
    }
    fixed
}

fn regex_recover(text: &str) -> Option<serde_json::Value> {
    let type_re = Regex::new(r#""type"\s*:\s*"(\w+)""#).unwrap();
    let type_match = type_re.captures(text)?;
    let episode_type = type_match.get(1)?.as_str().to_string();

    let mut entities = Vec::new();
    if let Some(entities_match) =
        Regex::new(r#""entities"\s*:\s*\[(?s)(.*?)\]"#).unwrap().captures(text)
    {
        let body = entities_match.get(1).map(|m| m.as_str()).unwrap_or_default();
        let entity_re = Regex::new(r"\{[^}]+\}").unwrap();
        for m in entity_re.find_iter(body) {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(m.as_str()) {
                entities.push(v);
            }
        }
    }

    Some(serde_json::json!({ "type": episode_type, "entities": entities }))
}

/// Single-episode classification and entity/relation extraction, backed by
/// an [`LlmClient`] and writing its results back through a [`Store`].
pub struct Extractor {
    llm: Arc<dyn LlmClient>,
    store: Store,
    max_content_length: usize,
}

impl Extractor {
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>, store: Store, max_content_length: usize) -> Self {
        Self {
            llm,
            store,
            max_content_length,
        }
    }

    fn truncate(&self, content: &str) -> String {
        if content.chars().count() > self.max_content_length {
            let truncated: String = content.chars().take(self.max_content_length).collect();
            format!("{truncated}...[truncated]")
        } else {
            content.to_string()
        }
    }

    /// Classify `content` and surface its entities/relations. Never errors:
    /// on unrecoverable LLM/JSON failure it degrades to an empty
    /// observation result.
    #[instrument(skip(self, content), fields(episode_id))]
    pub async fn extract(&self, content: &str, episode_id: Option<&str>) -> ExtractionResult {
        if let Some(id) = episode_id {
            tracing::Span::current().record("episode_id", id);
        }
        let truncated = self.truncate(content);
        let prompt = extraction_prompt(&truncated);

        let raw_text = match self.llm.complete_json(&prompt, Some(EXTRACTION_SYSTEM_PROMPT), 0.1, 1024).await {
            Ok(text) => text,
            Err(e) => {
                warn!("extraction LLM call failed: {e}");
                return ExtractionResult::default();
            }
        };

        let value = match serde_json::from_str::<serde_json::Value>(&raw_text) {
            Ok(v) => v,
            Err(e) => {
                debug!("extraction JSON decode error, attempting recovery: {e}");
                match try_fix_json(&raw_text) {
                    Some(v) => {
                        debug!("JSON recovery successful");
                        v
                    }
                    None => {
                        warn!("extraction JSON recovery failed, degrading to empty observation");
                        return ExtractionResult::default();
                    }
                }
            }
        };

        let raw: RawExtraction = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                warn!("extraction result did not match expected shape: {e}");
                RawExtraction::default()
            }
        };

        let episode_type = raw
            .episode_type
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(EpisodeType::Observation);

        let entities: Vec<ProposedEntity> = raw
            .entities
            .into_iter()
            .filter_map(|e| {
                let name = e.name.or(e.id.clone())?;
                let entity_type = e
                    .entity_type
                    .as_deref()
                    .map_or(EntityType::Other, EntityType::parse_or_other);
                Some(ProposedEntity {
                    entity_type,
                    display_name: name,
                })
            })
            .collect();

        let entity_relations: Vec<ProposedEntityRelation> = raw
            .entity_relationships
            .into_iter()
            .filter_map(|r| {
                Some(ProposedEntityRelation {
                    source_name: r.source?,
                    target_name: r.target?,
                    relation_type: r.relationship?,
                    strength: r.strength.clamp(0.0, 1.0),
                    context: r.context,
                })
            })
            .collect();

        ExtractionResult {
            episode_type: Some(episode_type),
            title: raw.title,
            entities,
            entity_relations,
        }
    }

    /// Run [`Self::extract`] on `episode` and write the canonicalized,
    /// deduplicated entities/relations back to the Store, updating the
    /// episode's `entity_ids`, flags, and classification.
    pub async fn extract_and_store(&self, mut episode: Episode) -> crate::error::Result<ExtractionResult> {
        let result = self.extract(&episode.content, Some(&episode.id)).await;

        episode.episode_type = result.episode_type.unwrap_or(EpisodeType::Observation);
        episode.title = result.title.clone();
        episode.entities_extracted = true;
        episode.relations_extracted = true;

        let mut final_entity_ids = Vec::new();
        for proposed in &result.entities {
            let entity_id = self.canonicalize_entity(proposed)?;
            if !final_entity_ids.contains(&entity_id) {
                final_entity_ids.push(entity_id.clone());
            }
            self.store.add_mention(&episode.id, &entity_id)?;
        }
        episode.entity_ids = final_entity_ids;
        self.store.update_episode(&episode)?;

        for proposed_rel in &result.entity_relations {
            let source_id = crate::types::entity_id(EntityType::Other, &proposed_rel.source_name);
            let target_id = crate::types::entity_id(EntityType::Other, &proposed_rel.target_name);
            // Resolve against already-canonicalized ids when the names match
            // an entity just created/deduped above.
            let source_id = self.resolve_known_id(&proposed_rel.source_name, &source_id);
            let target_id = self.resolve_known_id(&proposed_rel.target_name, &target_id);
            self.store.add_entity_relation(&EntityRelation {
                source_id,
                target_id,
                relation_type: proposed_rel.relation_type.clone(),
                strength: proposed_rel.strength,
                context: proposed_rel.context.clone(),
                source_episode_id: Some(episode.id.clone()),
            })?;
        }

        Ok(result)
    }

    fn resolve_known_id(&self, name: &str, fallback: &str) -> String {
        self.store
            .find_entity_by_name(name)
            .ok()
            .flatten()
            .map_or_else(|| fallback.to_string(), |e| e.id)
    }

    /// Canonicalize a proposed entity: normalize its name, derive the
    /// canonical id, then consult `find_entity_by_name` to reuse an
    /// existing entity (possibly updating its type) instead of duplicating.
    fn canonicalize_entity(&self, proposed: &ProposedEntity) -> crate::error::Result<String> {
        if let Some(mut existing) = self.store.find_entity_by_name(&proposed.display_name)? {
            if existing.entity_type != proposed.entity_type {
                existing.entity_type = proposed.entity_type;
                self.store.add_entity(&existing)?;
            }
            return Ok(existing.id);
        }
        let entity = Entity::new(proposed.entity_type, proposed.display_name.clone());
        self.store.add_entity(&entity)?;
        Ok(entity.id)
    }

    /// Backfill relations for an episode that already has entities, skipping
    /// entity pairs that already have a relation in either direction.
    pub async fn extract_relations_only(&self, episode: &Episode) -> crate::error::Result<Vec<EntityRelation>> {
        if episode.entity_ids.len() < 2 {
            return Ok(Vec::new());
        }

        let existing_pairs = self.store.get_existing_relation_pairs(&episode.entity_ids)?;

        let mut entities_with_unrelated: HashSet<String> = HashSet::new();
        for (i, e1) in episode.entity_ids.iter().enumerate() {
            for e2 in &episode.entity_ids[i + 1..] {
                if !existing_pairs.contains(&(e1.clone(), e2.clone())) {
                    entities_with_unrelated.insert(e1.clone());
                    entities_with_unrelated.insert(e2.clone());
                }
            }
        }

        if entities_with_unrelated.is_empty() {
            debug!(
                "skipping relation extraction for {}: all {} entities already related",
                episode.id,
                episode.entity_ids.len()
            );
            return Ok(Vec::new());
        }

        let filtered: Vec<String> = episode
            .entity_ids
            .iter()
            .filter(|id| entities_with_unrelated.contains(*id))
            .cloned()
            .collect();

        let content = self.truncate(&episode.content);
        let entities_str = filtered.join(", ");
        let prompt = relations_only_prompt(&content, &entities_str);

        let raw_text = match self
            .llm
            .complete_json(&prompt, Some(RELATIONS_SYSTEM_PROMPT), 0.1, 512)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!("relation extraction failed for {}: {e}", episode.id);
                return Ok(Vec::new());
            }
        };

        let raw: RawRelationsOnly = serde_json::from_str(&raw_text)
            .or_else(|_| try_fix_json(&raw_text).map_or(Err(()), |v| serde_json::from_value(v).map_err(|_| ())))
            .unwrap_or(RawRelationsOnly {
                entity_relationships: Vec::new(),
            });

        let mut relations = Vec::new();
        for r in raw.entity_relationships {
            let (Some(source), Some(target), Some(relationship)) = (r.source, r.target, r.relationship) else {
                continue;
            };
            if !filtered.contains(&source) || !filtered.contains(&target) {
                continue;
            }
            if existing_pairs.contains(&(source.clone(), target.clone())) {
                continue;
            }
            relations.push(EntityRelation {
                source_id: source,
                target_id: target,
                relation_type: relationship,
                strength: r.strength.clamp(0.0, 1.0),
                context: r.context,
                source_episode_id: Some(episode.id.clone()),
            });
        }
        Ok(relations)
    }

    /// Run [`Self::extract_relations_only`] and persist the result, marking
    /// `relations_extracted`.
    pub async fn extract_and_store_relations_only(&self, mut episode: Episode) -> crate::error::Result<usize> {
        let relations = self.extract_relations_only(&episode).await?;
        for r in &relations {
            self.store.add_entity_relation(r)?;
        }
        episode.relations_extracted = true;
        self.store.update_episode(&episode)?;
        Ok(relations.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FakeLlmClient;

    fn store() -> Store {
        Store::open_in_memory()
    }

    #[test]
    fn try_fix_json_strips_code_fences() {
        let text = "```json\n{\"type\": \"observation\", \"entities\": []}\n```";
        let fixed = try_fix_json(text).unwrap();
        assert_eq!(fixed["type"], "observation");
    }

    #[test]
    fn try_fix_json_closes_unclosed_structures() {
        let text = r#"{"type": "observation", "entities": [{"type": "file", "name": "a.rs"#;
        let fixed = try_fix_json(text).unwrap();
        assert_eq!(fixed["type"], "observation");
    }

    #[test]
    fn try_fix_json_regex_recovers_type_and_entities() {
        let text = r#"garbage preamble "type": "decision" more garbage "entities": [{"type": "tool", "name": "ripgrep"}] trailing"#;
        let fixed = try_fix_json(text).unwrap();
        assert_eq!(fixed["type"], "decision");
    }

    #[tokio::test]
    async fn extract_degrades_to_observation_on_malformed_response() {
        let llm = Arc::new(FakeLlmClient::with_response("not json at all and no recoverable fields"));
        let extractor = Extractor::new(llm, store(), 2000);
        let result = extractor.extract("some content", None).await;
        assert_eq!(result.episode_type, Some(EpisodeType::Observation));
        assert!(result.entities.is_empty());
    }

    #[tokio::test]
    async fn extract_and_store_dedups_entities_by_normalized_name() {
        let response = serde_json::json!({
            "type": "observation",
            "title": "Talked about Alice",
            "entities": [{"type": "person", "id": "person:Alice", "name": "Alice"}],
            "entity_relationships": []
        })
        .to_string();
        let llm = Arc::new(FakeLlmClient::with_response(response.clone()));
        let s = store();
        let extractor = Extractor::new(llm.clone(), s.clone(), 2000);

        let ep1 = Episode::new("Fixed bug with Alice", 1.0);
        extractor.extract_and_store(ep1.clone()).await.unwrap();

        let response2 = serde_json::json!({
            "type": "observation",
            "title": "Chat with alice",
            "entities": [{"type": "person", "id": "person:alice", "name": "alice"}],
            "entity_relationships": []
        })
        .to_string();
        let llm2 = Arc::new(FakeLlmClient::with_response(response2));
        let extractor2 = Extractor::new(llm2, s.clone(), 2000);
        let ep2 = Episode::new("Chat with alice", 1.0);
        extractor2.extract_and_store(ep2.clone()).await.unwrap();

        let all_entities = s.get_all_entities().unwrap();
        assert_eq!(all_entities.len(), 1);
        assert_eq!(all_entities[0].id, "person:alice");

        let mentions = s.get_episodes_mentioning("person:alice", 10).unwrap();
        assert_eq!(mentions.len(), 2);
    }

    #[tokio::test]
    async fn extract_relations_only_skips_when_no_unrelated_pairs() {
        let s = store();
        let a = Entity::new(EntityType::Person, "Alice");
        let b = Entity::new(EntityType::Person, "Bob");
        s.add_entity(&a).unwrap();
        s.add_entity(&b).unwrap();
        s.add_entity_relation(&EntityRelation {
            source_id: a.id.clone(),
            target_id: b.id.clone(),
            relation_type: "knows".into(),
            strength: 0.8,
            context: None,
            source_episode_id: None,
        })
        .unwrap();

        let mut ep = Episode::new("Alice and Bob talked", 1.0);
        ep.entity_ids = vec![a.id.clone(), b.id.clone()];
        ep.entities_extracted = true;

        let llm = Arc::new(FakeLlmClient::with_response("{}"));
        let extractor = Extractor::new(llm, s, 2000);
        let relations = extractor.extract_relations_only(&ep).await.unwrap();
        assert!(relations.is_empty());
    }
}
