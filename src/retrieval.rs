//! Spreading-activation concept retrieval and entity-centric recall.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::instrument;

use crate::config::MemoryConfig;
use crate::error::Result;
use crate::store::Store;
use crate::traits::EmbeddingClient;
use crate::types::{
    ActivatedConcept, ActivationSource, Concept, ConceptRelationType, Entity, Episode, EpisodeType,
};

/// Retrieves concepts via embedding-seeded spreading activation, and
/// entities/episodes via direct lookup.
pub struct Retriever {
    store: Store,
    embedder: Arc<dyn EmbeddingClient>,
    config: MemoryConfig,
}

impl Retriever {
    #[must_use]
    pub fn new(store: Store, embedder: Arc<dyn EmbeddingClient>, config: MemoryConfig) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Seed from the top `2*k` embedding matches, weighting each seed's
    /// similarity by the seeded concept's own confidence and keeping only
    /// those strictly above `activation_threshold`, then spread activation
    /// outward along concept relations for `spread_hops` hops, decaying by
    /// `spread_decay`, the relation-type weight, the relation's own
    /// strength, and the *target* concept's confidence at every hop. A
    /// concept reached by more than one path keeps the maximum activation
    /// seen across all paths, and the *shallowest* hop count at which that
    /// maximum was achieved. `context`, if given, is appended to the query
    /// before embedding. Entries below `activation_threshold` (or below
    /// `2 * activation_threshold` when `include_weak` is `false`) are
    /// dropped from the final result.
    #[instrument(skip(self, query, context))]
    pub async fn retrieve(
        &self,
        query: &str,
        k: Option<usize>,
        context: Option<&str>,
        include_weak: bool,
    ) -> Result<Vec<ActivatedConcept>> {
        let k = k.unwrap_or(self.config.default_recall_k);
        let embedding_input = match context {
            Some(context) => format!("{query}\n{context}"),
            None => query.to_string(),
        };
        let query_embedding = self.embedder.embed(&embedding_input).await?;

        let seeds = self.store.find_by_embedding(&query_embedding, k.max(1) * 2)?;

        let mut activations: HashMap<String, (f32, u32, ActivationSource)> = HashMap::new();
        let mut frontier: VecDeque<(String, f32, u32)> = VecDeque::new();

        for (concept, similarity) in seeds {
            let activation = similarity * concept.confidence;
            if activation <= self.config.activation_threshold {
                continue;
            }
            activations.insert(concept.id.clone(), (activation, 0, ActivationSource::Embedding));
            frontier.push_back((concept.id, activation, 0));
        }

        while let Some((concept_id, activation, hops)) = frontier.pop_front() {
            if hops >= self.config.spread_hops {
                continue;
            }
            let Some(concept) = self.store.get_concept(&concept_id)? else {
                continue;
            };
            for relation in &concept.relations {
                let Some(target) = self.store.get_concept(&relation.target_id)? else {
                    continue;
                };
                let weight = self.config.relation_weights.get(relation.relation_type);
                let spread =
                    activation * self.config.spread_decay * weight * relation.strength * target.confidence;
                if spread <= self.config.activation_threshold {
                    continue;
                }
                let next_hops = hops + 1;
                let better = match activations.get(&relation.target_id) {
                    Some((existing, _, _)) => spread > *existing,
                    None => true,
                };
                if better {
                    activations.insert(
                        relation.target_id.clone(),
                        (spread, next_hops, ActivationSource::Spread),
                    );
                    frontier.push_back((relation.target_id.clone(), spread, next_hops));
                }
            }
        }

        let drop_threshold = if include_weak {
            self.config.activation_threshold
        } else {
            self.config.activation_threshold * 2.0
        };

        let mut ranked: Vec<(String, f32, u32, ActivationSource)> = activations
            .into_iter()
            .filter(|(_, (activation, _, _))| *activation >= drop_threshold)
            .map(|(id, (activation, hops, source))| (id, activation, hops, source))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);

        let mut results = Vec::with_capacity(ranked.len());
        for (id, activation, hops, source) in ranked {
            if let Some(concept) = self.store.get_concept(&id)? {
                results.push(ActivatedConcept {
                    concept,
                    activation,
                    source,
                    hops,
                });
            }
        }
        Ok(results)
    }

    /// Episodes mentioning the given entity, most recent first.
    pub fn retrieve_by_entity(&self, entity_id: &str, limit: u32) -> Result<Vec<Episode>> {
        self.store.get_episodes_mentioning(entity_id, limit)
    }

    /// Other entities co-mentioned with `entity_id`, ranked by co-mention count.
    pub fn retrieve_related_entities(&self, entity_id: &str, limit: usize) -> Result<Vec<(Entity, u64)>> {
        self.store.retrieve_related_entities(entity_id, limit)
    }

    /// Breadth-first search over outgoing concept relations from `start` to
    /// `end`, returning the shortest chain as `(concept, outgoing_relation_
    /// type_to_next)` pairs (the last entry carries `None`), or `None` if
    /// they are not connected within `max_depth` hops.
    pub fn find_related_chain(
        &self,
        start: &str,
        end: &str,
        max_depth: u32,
    ) -> Result<Option<Vec<(Concept, Option<ConceptRelationType>)>>> {
        let Some(start_concept) = self.store.get_concept(start)? else {
            return Ok(None);
        };
        if start == end {
            return Ok(Some(vec![(start_concept, None)]));
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(start.to_string());
        let mut queue: VecDeque<Vec<(Concept, Option<ConceptRelationType>)>> = VecDeque::new();
        queue.push_back(vec![(start_concept, None)]);

        while let Some(path) = queue.pop_front() {
            let hops_so_far = path.len() as u32 - 1;
            if hops_so_far >= max_depth {
                continue;
            }
            let (current, _) = path.last().expect("path always has at least one entry");
            for relation in current.relations.clone() {
                if visited.contains(&relation.target_id) {
                    continue;
                }
                let Some(target_concept) = self.store.get_concept(&relation.target_id)? else {
                    continue;
                };
                let mut extended = path.clone();
                if let Some(last) = extended.last_mut() {
                    last.1 = Some(relation.relation_type);
                }
                if relation.target_id == end {
                    extended.push((target_concept, None));
                    return Ok(Some(extended));
                }
                visited.insert(relation.target_id.clone());
                extended.push((target_concept, None));
                queue.push_back(extended);
            }
        }
        Ok(None)
    }

    /// Render activated concepts as an LLM-facing context block, or a
    /// lowercase fallback sentence when nothing cleared the threshold. Each
    /// entry gets a header (id, title if present, confidence, "via
    /// association" when the activation came from spreading rather than a
    /// direct embedding match), the summary, conditions, exceptions, up to 5
    /// outgoing relations with the target's summary inlined, and — when
    /// `include_source_episodes` is set — the verbatim source episode
    /// content.
    #[must_use]
    pub fn format_for_llm(&self, concepts: &[ActivatedConcept], include_source_episodes: bool) -> String {
        if concepts.is_empty() {
            return "no relevant memories found".to_string();
        }
        concepts
            .iter()
            .map(|ac| self.format_one(ac, include_source_episodes))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn format_one(&self, ac: &ActivatedConcept, include_source_episodes: bool) -> String {
        let concept = &ac.concept;
        let mut header = format!("[{}]", concept.id);
        if let Some(title) = &concept.title {
            header.push_str(&format!(" {title}"));
        }
        header.push_str(&format!(" (confidence {:.2}", concept.confidence));
        if ac.source == ActivationSource::Spread {
            header.push_str(", via association");
        }
        header.push(')');

        let mut out = vec![header, concept.summary.clone()];
        if let Some(conditions) = &concept.conditions {
            out.push(format!("  when: {conditions}"));
        }
        if !concept.exceptions.is_empty() {
            out.push(format!("  exceptions: {}", concept.exceptions.join(", ")));
        }
        if !concept.relations.is_empty() {
            let mut rel_lines = vec!["  relations:".to_string()];
            for rel in concept.relations.iter().take(5) {
                let target_summary = self
                    .store
                    .get_concept(&rel.target_id)
                    .ok()
                    .flatten()
                    .map_or_else(|| rel.target_id.clone(), |t| t.summary);
                rel_lines.push(format!("    --{}--> {}", rel.relation_type.as_str(), target_summary));
            }
            out.push(rel_lines.join("\n"));
        }
        if include_source_episodes && !concept.source_episodes.is_empty() {
            let mut ep_lines = vec!["  source episodes:".to_string()];
            for ep_id in &concept.source_episodes {
                let content = self
                    .store
                    .get_episode(ep_id)
                    .ok()
                    .flatten()
                    .map_or_else(|| ep_id.clone(), |e| e.content);
                ep_lines.push(format!("    - {content}"));
            }
            out.push(ep_lines.join("\n"));
        }
        out.join("\n")
    }

    /// Render an entity's episodes grouped by type in a fixed display
    /// order, each entry abbreviated and chronologically ordered, or a
    /// lowercase fallback sentence when there are none.
    #[must_use]
    pub fn format_entity_context(entity: &Entity, episodes: &[Episode]) -> String {
        if episodes.is_empty() {
            return "no memories about this entity".to_string();
        }
        let mut grouped: HashMap<EpisodeType, Vec<&Episode>> = HashMap::new();
        for ep in episodes {
            grouped.entry(ep.episode_type).or_default().push(ep);
        }
        let mut out = format!("{} ({}):\n", entity.display_name, entity.entity_type.as_str());
        for episode_type in EpisodeType::display_order() {
            let Some(mut eps) = grouped.remove(&episode_type) else {
                continue;
            };
            eps.sort_by_key(|e| e.timestamp);
            for ep in eps {
                out.push_str(&format!(
                    "  [{}] {}\n",
                    episode_type.abbrev(),
                    ep.title.clone().unwrap_or_else(|| ep.content.clone())
                ));
            }
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FakeEmbeddingClient;
    use crate::types::{Concept, ConceptRelation, ConceptRelationType, EntityType};

    fn retriever(store: Store) -> Retriever {
        let embedder = Arc::new(FakeEmbeddingClient::new(8));
        Retriever::new(store, embedder, MemoryConfig::for_testing())
    }

    #[tokio::test]
    async fn retrieve_seeds_above_threshold_only() {
        let store = Store::open_in_memory();
        let embedder = FakeEmbeddingClient::new(8);
        let mut c = Concept::new("relevant concept", 0.9, vec![]);
        c.embedding = Some(embedder.embed("match text").await.unwrap());
        store.add_concept(&c).unwrap();

        let r = retriever(store);
        let results = r.retrieve("match text", Some(5), None, true).await.unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].source, ActivationSource::Embedding);
        assert_eq!(results[0].hops, 0);
    }

    #[tokio::test]
    async fn retrieve_spreads_activation_along_relations() {
        let store = Store::open_in_memory();
        let embedder = FakeEmbeddingClient::new(8);
        let mut seed = Concept::new("seed concept", 0.9, vec![]);
        seed.embedding = Some(embedder.embed("seed text").await.unwrap());
        let target = Concept::new("related concept", 0.8, vec![]);
        store.add_concept(&target).unwrap();
        seed.add_relation(ConceptRelation {
            target_id: target.id.clone(),
            relation_type: ConceptRelationType::Implies,
            strength: 0.9,
            context: None,
        });
        store.add_concept(&seed).unwrap();

        let mut config = MemoryConfig::for_testing();
        config.activation_threshold = 0.01;
        let r = Retriever::new(store, Arc::new(embedder), config);
        let results = r.retrieve("seed text", Some(10), None, true).await.unwrap();
        assert!(results.iter().any(|ac| ac.concept.id == target.id && ac.source == ActivationSource::Spread));
    }

    #[test]
    fn format_for_llm_handles_empty() {
        let r = retriever(Store::open_in_memory());
        assert_eq!(r.format_for_llm(&[], false), "no relevant memories found");
    }

    #[tokio::test]
    async fn format_for_llm_inlines_relation_target_summary() {
        let store = Store::open_in_memory();
        let embedder = FakeEmbeddingClient::new(8);
        let target = Concept::new("the target summary", 0.8, vec![]);
        store.add_concept(&target).unwrap();
        let mut seed = Concept::new("the seed summary", 0.9, vec![]);
        seed.embedding = Some(embedder.embed("seed text").await.unwrap());
        seed.add_relation(ConceptRelation {
            target_id: target.id.clone(),
            relation_type: ConceptRelationType::Implies,
            strength: 0.9,
            context: None,
        });
        store.add_concept(&seed).unwrap();

        let r = Retriever::new(store, Arc::new(embedder), MemoryConfig::for_testing());
        let results = r.retrieve("seed text", Some(5), None, true).await.unwrap();
        let rendered = r.format_for_llm(&results, false);
        assert!(rendered.contains("the target summary"));
    }

    #[test]
    fn format_entity_context_handles_empty() {
        let e = Entity::new(EntityType::Person, "Alice");
        assert_eq!(Retriever::format_entity_context(&e, &[]), "no memories about this entity");
    }

    #[test]
    fn find_related_chain_returns_shortest_path() {
        let store = Store::open_in_memory();
        let c_concept = Concept::new("c", 0.8, vec![]);
        store.add_concept(&c_concept).unwrap();
        let mut b_concept = Concept::new("b", 0.8, vec![]);
        b_concept.add_relation(ConceptRelation {
            target_id: c_concept.id.clone(),
            relation_type: ConceptRelationType::PartOf,
            strength: 0.9,
            context: None,
        });
        store.add_concept(&b_concept).unwrap();
        let mut a_concept = Concept::new("a", 0.8, vec![]);
        a_concept.add_relation(ConceptRelation {
            target_id: b_concept.id.clone(),
            relation_type: ConceptRelationType::Implies,
            strength: 0.9,
            context: None,
        });
        store.add_concept(&a_concept).unwrap();

        let r = retriever(store);
        let chain = r.find_related_chain(&a_concept.id, &c_concept.id, 5).unwrap().unwrap();
        let ids: Vec<&str> = chain.iter().map(|(c, _)| c.id.as_str()).collect();
        assert_eq!(ids, vec![a_concept.id.as_str(), b_concept.id.as_str(), c_concept.id.as_str()]);
        assert_eq!(chain[0].1, Some(ConceptRelationType::Implies));
        assert_eq!(chain[1].1, Some(ConceptRelationType::PartOf));
        assert_eq!(chain[2].1, None);
    }

    #[test]
    fn find_related_chain_same_start_and_end_is_single_element() {
        let store = Store::open_in_memory();
        let concept = Concept::new("solo", 0.8, vec![]);
        store.add_concept(&concept).unwrap();
        let r = retriever(store);
        let chain = r.find_related_chain(&concept.id, &concept.id, 5).unwrap().unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].1, None);
    }

    #[test]
    fn find_related_chain_returns_none_when_unreachable() {
        let store = Store::open_in_memory();
        let a_concept = Concept::new("a", 0.8, vec![]);
        let b_concept = Concept::new("b", 0.8, vec![]);
        store.add_concept(&a_concept).unwrap();
        store.add_concept(&b_concept).unwrap();
        let r = retriever(store);
        assert!(r.find_related_chain(&a_concept.id, &b_concept.id, 5).unwrap().is_none());
    }
}
