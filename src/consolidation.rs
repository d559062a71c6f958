//! Batch episode-to-concept generalization: two LLM phases —
//! extraction of entities for any not-yet-processed episodes, then a single
//! call that proposes concept updates/creations/relations over the whole
//! unconsolidated batch plus existing concepts for context.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::error::{MemoryError, Result};
use crate::extraction::Extractor;
use crate::store::Store;
use crate::traits::{EmbeddingClient, LlmClient};
use crate::types::{
    Concept, ConceptRelation, ConsolidationPlan, ConsolidationResult, Episode,
};

const CONSOLIDATION_SYSTEM_PROMPT: &str = "You are a memory consolidation system. Your job is to generalize \
specific episodic observations into durable semantic concepts.

Rules:
- Only create a new concept when no existing concept captures the pattern.
- Prefer updating an existing concept (raising its confidence, widening its
  source episodes) over creating a near-duplicate.
- Flag genuine contradictions between concepts rather than silently merging them.
- Relations between concepts should use one of: implies, contradicts,
  specializes, generalizes, causes, correlates, part_of, context_of.
- New concepts you propose must be referenced by new_relations using a
  NEW_<n> placeholder id (NEW_0, NEW_1, ...), never a real concept id.
Respond with ONLY valid JSON, no explanations.";

fn consolidation_prompt(episodes_text: &str, concepts_text: &str) -> String {
    format!(
        "Existing concepts:\n{concepts_text}\n\nNew episodes to consolidate:\n{episodes_text}\n\n\
Propose a consolidation plan as JSON:\n\
{{\n  \"analysis\": \"brief reasoning about what generalizes\",\n  \
\"updates\": [{{\"id\": \"concept_id\", \"title\": \"...\", \"summary\": \"revised summary or omit to keep\", \
\"confidence_delta\": 0.1, \"new_exceptions\": [], \"new_tags\": [], \"new_source_episodes\": [\"ep_id\"]}}],\n  \
\"new_concepts\": [{{\"temp_id\": \"NEW_0\", \"title\": \"...\", \"summary\": \"...\", \"confidence\": 0.6, \
\"source_episodes\": [\"ep_id\"], \"conditions\": null, \"exceptions\": [], \"tags\": [], \"relations\": []}}],\n  \
\"new_relations\": [{{\"source_id\": \"NEW_0 or existing id\", \"relation\": {{\"relation_type\": \"implies\", \
\"target_id\": \"existing id or NEW_1\", \"strength\": 0.7, \"context\": null}}}}],\n  \
\"contradictions\": [{{\"concept_a\": \"id\", \"concept_b\": \"id\", \"description\": \"...\"}}]\n}}\n\n\
Keep summaries concise (one or two sentences). Empty arrays where there is nothing to report."
    )
}

fn format_episodes(episodes: &[Episode]) -> String {
    episodes
        .iter()
        .map(|ep| {
            format!(
                "- [{}] ({}) {}",
                ep.id,
                ep.episode_type.as_str(),
                ep.title.clone().unwrap_or_else(|| ep.content.clone())
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_concepts(concepts: &[Concept]) -> String {
    if concepts.is_empty() {
        return "(none yet)".to_string();
    }
    concepts
        .iter()
        .map(|c| {
            format!(
                "- [{}] {} (confidence {:.2}, seen {} times)",
                c.id, c.summary, c.confidence, c.instance_count
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Batch consolidation over the Store's unconsolidated episodes.
pub struct Consolidator {
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn EmbeddingClient>,
    store: Store,
    extractor: Extractor,
    batch_size: u32,
    min_confidence: f32,
}

impl Consolidator {
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingClient>,
        store: Store,
        extractor: Extractor,
        batch_size: u32,
        min_confidence: f32,
    ) -> Self {
        Self {
            llm,
            embedder,
            store,
            extractor,
            batch_size,
            min_confidence,
        }
    }

    /// Run the two-phase pipeline. With `force == false`, does nothing (and
    /// returns an empty result) unless there are unconsolidated episodes.
    #[instrument(skip(self))]
    pub async fn consolidate(&self, force: bool) -> Result<ConsolidationResult> {
        let pending = self.store.count_unconsolidated_episodes()?;
        if pending == 0 && !force {
            return Ok(ConsolidationResult::empty());
        }

        self.run_extraction_phase().await?;

        let episodes = self.store.get_unconsolidated_episodes(self.batch_size)?;
        if episodes.is_empty() {
            return Ok(ConsolidationResult::empty());
        }
        if episodes.len() < 3 && !force {
            return Ok(ConsolidationResult::empty());
        }

        let existing_concepts = self.store.get_all_concepts()?;
        let episodes_text = format_episodes(&episodes);
        let concepts_text = format_concepts(&existing_concepts);
        let prompt = consolidation_prompt(&episodes_text, &concepts_text);

        let raw = self
            .llm
            .complete_json(&prompt, Some(CONSOLIDATION_SYSTEM_PROMPT), 0.2, 2048)
            .await?;

        let plan: ConsolidationPlan = serde_json::from_str(&raw)
            .map_err(|e| MemoryError::MalformedStructured(e.to_string()))?;

        let result = self.apply_plan(&plan, &episodes).await?;

        // Unconditional: every episode fetched in this batch is marked
        // consolidated regardless of whether the plan touched it (preserve
        // the original's behavior — an episode that yields nothing new is
        // still "seen" by consolidation).
        for mut ep in episodes {
            ep.consolidated = true;
            self.store.update_episode(&ep)?;
        }

        info!(
            created = result.concepts_created,
            updated = result.concepts_updated,
            contradictions = result.contradictions_found,
            "consolidation complete"
        );

        Ok(result)
    }

    /// Extract entities (and, where entities already exist, relations) for
    /// every episode not yet processed by the extractor, ahead of the
    /// generalization phase so concept proposals see accurate entity data.
    async fn run_extraction_phase(&self) -> Result<()> {
        let unextracted = self.store.get_unextracted_episodes(self.batch_size)?;
        for episode in unextracted {
            self.extractor.extract_and_store(episode).await?;
        }

        let needing_relations = self.store.get_unextracted_relation_episodes(self.batch_size)?;
        for episode in needing_relations {
            self.extractor.extract_and_store_relations_only(episode).await?;
        }

        Ok(())
    }

    /// Apply a plan: updates first, then two-phase concept creation (create
    /// bare nodes, map temp ids to real ids, then resolve and insert every
    /// relation), then top-level relations, then record contradictions. A
    /// concept's embedding is refreshed whenever its summary is (re)written,
    /// never otherwise.
    async fn apply_plan(&self, plan: &ConsolidationPlan, episodes: &[Episode]) -> Result<ConsolidationResult> {
        let mut result = ConsolidationResult::empty();
        result.episodes_processed = episodes.len();
        result.contradictions_found = plan.contradictions.len();

        for update in &plan.updates {
            let Some(mut concept) = self.store.get_concept(&update.id)? else {
                warn!("consolidation update referenced missing concept {}", update.id);
                continue;
            };
            if let Some(title) = &update.title {
                concept.title = Some(title.clone());
            }
            if let Some(summary) = &update.summary {
                if *summary != concept.summary {
                    concept.summary = summary.clone();
                    concept.embedding = Some(self.embedder.embed(summary).await?);
                }
            }
            concept.confidence = (concept.confidence + update.confidence_delta).clamp(0.0, 1.0);
            // Update rule: always +1, regardless of how many new source
            // episodes were attached (asymmetric with the creation rule).
            concept.instance_count += 1;
            for ep_id in &update.new_source_episodes {
                if !concept.source_episodes.contains(ep_id) {
                    concept.source_episodes.push(ep_id.clone());
                }
            }
            for exc in &update.new_exceptions {
                if !concept.exceptions.contains(exc) {
                    concept.exceptions.push(exc.clone());
                }
            }
            for tag in &update.new_tags {
                if !concept.tags.contains(tag) {
                    concept.tags.push(tag.clone());
                }
            }
            concept.updated_at = chrono::Utc::now();
            self.store.update_concept(&concept)?;
            result.concepts_updated += 1;
            result.updated_concept_ids.push(concept.id);
        }

        let mut temp_id_map: HashMap<String, String> = HashMap::new();
        let mut created_concepts: Vec<Concept> = Vec::new();
        for proposal in &plan.new_concepts {
            if proposal.confidence < self.min_confidence {
                warn!(
                    "skipping proposed concept below min_confidence: {}",
                    proposal.summary
                );
                continue;
            }
            let mut concept = Concept::new(
                proposal.summary.clone(),
                proposal.confidence,
                proposal.source_episodes.clone(),
            );
            concept.title = proposal.title.clone();
            concept.conditions = proposal.conditions.clone();
            concept.exceptions = proposal.exceptions.clone();
            concept.tags = proposal.tags.clone();
            concept.embedding = Some(self.embedder.embed(&concept.summary).await?);
            temp_id_map.insert(proposal.temp_id.clone(), concept.id.clone());
            created_concepts.push(concept);
        }

        // Phase two: resolve relations now that every temp id maps to a
        // real id, including relations embedded directly in a new_concept
        // proposal.
        for (proposal, concept) in plan.new_concepts.iter().zip(created_concepts.iter_mut()) {
            if proposal.confidence < self.min_confidence {
                continue;
            }
            for rel in &proposal.relations {
                let target_id = temp_id_map
                    .get(&rel.target_id)
                    .cloned()
                    .unwrap_or_else(|| rel.target_id.clone());
                concept.add_relation(ConceptRelation {
                    target_id,
                    relation_type: rel.relation_type,
                    strength: rel.strength.clamp(0.0, 1.0),
                    context: rel.context.clone(),
                });
            }
        }

        for concept in &created_concepts {
            self.store.add_concept(concept)?;
            result.concepts_created += 1;
            result.created_concept_ids.push(concept.id.clone());
        }

        for top_level in &plan.new_relations {
            let source_id = temp_id_map
                .get(&top_level.source_id)
                .cloned()
                .unwrap_or_else(|| top_level.source_id.clone());
            let target_id = temp_id_map
                .get(&top_level.relation.target_id)
                .cloned()
                .unwrap_or_else(|| top_level.relation.target_id.clone());

            let Some(mut source_concept) = self.store.get_concept(&source_id)? else {
                warn!("new_relations entry referenced unknown source {source_id}");
                continue;
            };
            source_concept.add_relation(ConceptRelation {
                target_id,
                relation_type: top_level.relation.relation_type,
                strength: top_level.relation.strength.clamp(0.0, 1.0),
                context: top_level.relation.context.clone(),
            });
            self.store.update_concept(&source_concept)?;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{FakeEmbeddingClient, FakeLlmClient};

    fn extractor(store: Store) -> Extractor {
        Extractor::new(Arc::new(FakeLlmClient::with_response("{}")), store, 2000)
    }

    fn embedder() -> Arc<FakeEmbeddingClient> {
        Arc::new(FakeEmbeddingClient::new(8))
    }

    #[tokio::test]
    async fn consolidate_is_noop_with_no_pending_and_no_force() {
        let store = Store::open_in_memory();
        let ext = extractor(store.clone());
        let llm = Arc::new(FakeLlmClient::with_response("{}"));
        let consolidator = Consolidator::new(llm, embedder(), store, ext, 10, 0.3);
        let result = consolidator.consolidate(false).await.unwrap();
        assert_eq!(result.episodes_processed, 0);
    }

    #[tokio::test]
    async fn consolidate_creates_concept_and_marks_episodes() {
        let store = Store::open_in_memory();
        let ep = Episode::new("Prefer tabs over spaces", 1.0);
        store.add_episode(&ep).unwrap();

        let plan = serde_json::json!({
            "analysis": "single preference episode",
            "updates": [],
            "new_concepts": [{
                "temp_id": "NEW_0",
                "title": "Indentation preference",
                "summary": "Prefers tabs over spaces",
                "confidence": 0.7,
                "source_episodes": [ep.id.clone()],
                "conditions": null,
                "exceptions": [],
                "tags": ["style"],
                "relations": []
            }],
            "new_relations": [],
            "contradictions": []
        })
        .to_string();

        let ext_llm = Arc::new(FakeLlmClient::with_response("{}"));
        let ext = Extractor::new(ext_llm, store.clone(), 2000);
        let llm = Arc::new(FakeLlmClient::with_response(plan));
        let consolidator = Consolidator::new(llm, embedder(), store.clone(), ext, 10, 0.3);

        let result = consolidator.consolidate(true).await.unwrap();
        assert_eq!(result.concepts_created, 1);

        let fetched = store.get_episode(&ep.id).unwrap().unwrap();
        assert!(fetched.consolidated);

        let concepts = store.get_all_concepts().unwrap();
        assert_eq!(concepts.len(), 1);
        assert_eq!(concepts[0].instance_count, 1);
        assert!(concepts[0].embedding.is_some());
    }

    #[tokio::test]
    async fn update_rule_increments_instance_count_by_exactly_one() {
        let store = Store::open_in_memory();
        let mut concept = Concept::new("Existing pattern", 0.5, vec!["ep_old".into()]);
        concept.instance_count = 3;
        store.add_concept(&concept).unwrap();

        let ep = Episode::new("Another instance of the pattern", 1.0);
        store.add_episode(&ep).unwrap();

        let plan = serde_json::json!({
            "analysis": "reinforces existing concept",
            "updates": [{
                "id": concept.id,
                "title": null,
                "summary": null,
                "confidence_delta": 0.1,
                "new_exceptions": [],
                "new_tags": [],
                "new_source_episodes": [ep.id.clone(), "ep_ignored_extra".to_string()]
            }],
            "new_concepts": [],
            "new_relations": [],
            "contradictions": []
        })
        .to_string();

        let ext = extractor(store.clone());
        let llm = Arc::new(FakeLlmClient::with_response(plan));
        let consolidator = Consolidator::new(llm, embedder(), store.clone(), ext, 10, 0.3);
        consolidator.consolidate(true).await.unwrap();

        let updated = store.get_concept(&concept.id).unwrap().unwrap();
        assert_eq!(updated.instance_count, 4);
    }

    #[tokio::test]
    async fn new_concepts_below_min_confidence_are_skipped() {
        let store = Store::open_in_memory();
        let ep = Episode::new("weak signal", 1.0);
        store.add_episode(&ep).unwrap();

        let plan = serde_json::json!({
            "analysis": "low confidence",
            "updates": [],
            "new_concepts": [{
                "temp_id": "NEW_0",
                "title": null,
                "summary": "uncertain pattern",
                "confidence": 0.1,
                "source_episodes": [ep.id.clone()],
                "conditions": null,
                "exceptions": [],
                "tags": [],
                "relations": []
            }],
            "new_relations": [],
            "contradictions": []
        })
        .to_string();

        let ext = extractor(store.clone());
        let llm = Arc::new(FakeLlmClient::with_response(plan));
        let consolidator = Consolidator::new(llm, embedder(), store.clone(), ext, 10, 0.3);
        let result = consolidator.consolidate(true).await.unwrap();
        assert_eq!(result.concepts_created, 0);
        assert!(store.get_all_concepts().unwrap().is_empty());
    }
}
