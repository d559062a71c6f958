//! Durable CRUD and query primitives. Every other component routes
//! persistent state through a [`Store`].

mod schema;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::types::{
    Concept, ConceptRelation, ConceptRelationType, Entity, EntityRelation, EntityType, Episode,
    EpisodeType,
};

type Pool = r2d2::Pool<SqliteConnectionManager>;

/// Aggregate counters returned by [`Store::get_stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_episodes: usize,
    pub total_entities: usize,
    pub total_concepts: usize,
    pub unconsolidated_episodes: usize,
    pub episode_type_counts: HashMap<String, usize>,
}

/// A full export of a database's contents, used by `export_data`/`import_data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportedData {
    pub version: u32,
    pub concepts: Vec<Concept>,
    pub episodes: Vec<Episode>,
    pub entities: Vec<Entity>,
    pub mentions: Vec<(String, String)>,
    pub entity_relations: Vec<EntityRelation>,
}

/// Embedded relational store: episodes, entities, mentions, concepts,
/// concept-relations, entity-relations, and key-value metadata.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

/// On-disk representation of a concept's JSON-blob fields: everything
/// except `id`, `embedding`, and `relations` (which live in dedicated
/// columns/tables so they can be queried/joined efficiently).
#[derive(Serialize, Deserialize)]
struct ConceptData {
    summary: String,
    instance_count: u32,
    source_episodes: Vec<String>,
    conditions: Option<String>,
    exceptions: Vec<String>,
    tags: Vec<String>,
}

/// Raw row fields for a concept, without its relations (which require a
/// second query and so are loaded separately by the caller).
struct ConceptRow {
    id: String,
    title: Option<String>,
    data: ConceptData,
    confidence: f32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    embedding: Option<Vec<f32>>,
}

fn embedding_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for f in v {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out
}

fn blob_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

impl Store {
    /// Open (creating if absent) the database file at `path`, backed by a
    /// connection pool of the given size.
    pub fn open(path: &Path, pool_size: u32) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
        });
        let pool = r2d2::Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| MemoryError::StorageIo(e.to_string()))?;
        {
            let conn = pool.get().map_err(MemoryError::from)?;
            schema::initialize(&conn)?;
        }
        Ok(Self { pool })
    }

    /// Open an in-memory database; used only by tests (each call produces
    /// an isolated, unshared database, unlike `file::memory:?cache=shared`).
    #[must_use]
    pub fn open_in_memory() -> Self {
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder()
            .max_size(1)
            .build(manager)
            .expect("in-memory sqlite pool");
        let conn = pool.get().expect("pooled connection");
        schema::initialize(&conn).expect("schema init");
        drop(conn);
        Self { pool }
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(MemoryError::from)
    }

    // ---------------------------------------------------------------
    // Episodes
    // ---------------------------------------------------------------

    pub fn add_episode(&self, ep: &Episode) -> Result<String> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO episodes (id, timestamp, content, episode_type, entity_ids,
                consolidated, entities_extracted, relations_extracted, confidence,
                metadata, concepts_activated, title)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                ep.id,
                ep.timestamp.to_rfc3339(),
                ep.content,
                ep.episode_type.as_str(),
                serde_json::to_string(&ep.entity_ids)?,
                ep.consolidated,
                ep.entities_extracted,
                ep.relations_extracted,
                f64::from(ep.confidence),
                serde_json::to_string(&ep.metadata)?,
                serde_json::to_string(&ep.concepts_activated)?,
                ep.title,
            ],
        )?;
        Ok(ep.id.clone())
    }

    pub fn update_episode(&self, ep: &Episode) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE episodes SET timestamp=?2, content=?3, episode_type=?4, entity_ids=?5,
                consolidated=?6, entities_extracted=?7, relations_extracted=?8, confidence=?9,
                metadata=?10, concepts_activated=?11, title=?12
             WHERE id=?1",
            params![
                ep.id,
                ep.timestamp.to_rfc3339(),
                ep.content,
                ep.episode_type.as_str(),
                serde_json::to_string(&ep.entity_ids)?,
                ep.consolidated,
                ep.entities_extracted,
                ep.relations_extracted,
                f64::from(ep.confidence),
                serde_json::to_string(&ep.metadata)?,
                serde_json::to_string(&ep.concepts_activated)?,
                ep.title,
            ],
        )?;
        Ok(())
    }

    fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
        let timestamp: String = row.get("timestamp")?;
        let entity_ids: String = row.get("entity_ids")?;
        let metadata: String = row.get("metadata")?;
        let concepts_activated: String = row.get("concepts_activated")?;
        let episode_type: String = row.get("episode_type")?;
        let confidence: f64 = row.get("confidence")?;
        Ok(Episode {
            id: row.get("id")?,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            content: row.get("content")?,
            title: row.get("title")?,
            episode_type: episode_type.parse().unwrap_or(EpisodeType::Observation),
            entity_ids: serde_json::from_str(&entity_ids).unwrap_or_default(),
            consolidated: row.get("consolidated")?,
            entities_extracted: row.get("entities_extracted")?,
            relations_extracted: row.get("relations_extracted")?,
            confidence: confidence as f32,
            metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            concepts_activated: serde_json::from_str(&concepts_activated).unwrap_or_default(),
        })
    }

    const EPISODE_COLUMNS: &'static str = "id, timestamp, content, episode_type, entity_ids,
        consolidated, entities_extracted, relations_extracted, confidence, metadata,
        concepts_activated, title";

    pub fn get_episode(&self, id: &str) -> Result<Option<Episode>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM episodes WHERE id = ?1", Self::EPISODE_COLUMNS);
        conn.query_row(&sql, params![id], Self::row_to_episode)
            .optional()
            .map_err(Into::into)
    }

    pub fn get_unconsolidated_episodes(&self, limit: u32) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM episodes WHERE consolidated = 0 ORDER BY timestamp ASC LIMIT ?1",
            Self::EPISODE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit], Self::row_to_episode)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_unconsolidated_episodes(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT count(*) FROM episodes WHERE consolidated = 0", [], |r| {
                r.get(0)
            })?;
        Ok(count as u64)
    }

    pub fn get_unextracted_episodes(&self, limit: u32) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM episodes WHERE entities_extracted = 0 ORDER BY timestamp ASC LIMIT ?1",
            Self::EPISODE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit], Self::row_to_episode)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_unextracted_relation_episodes(&self, limit: u32) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM episodes WHERE entities_extracted = 1 AND relations_extracted = 0
             ORDER BY timestamp ASC",
            Self::EPISODE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::row_to_episode)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter(|ep| ep.entity_ids.len() >= 2)
            .take(limit as usize)
            .collect())
    }

    pub fn get_recent_episodes(&self, limit: u32) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM episodes ORDER BY timestamp DESC LIMIT ?1",
            Self::EPISODE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit], Self::row_to_episode)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_episodes_by_type(&self, episode_type: EpisodeType, limit: u32) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM episodes WHERE episode_type = ?1 ORDER BY timestamp DESC LIMIT ?2",
            Self::EPISODE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![episode_type.as_str(), limit], Self::row_to_episode)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_episodes_mentioning(&self, entity_id: &str, limit: u32) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM episodes e
             JOIN mentions m ON m.episode_id = e.id
             WHERE m.entity_id = ?1
             ORDER BY e.timestamp DESC LIMIT ?2",
            Self::EPISODE_COLUMNS
                .split(", ")
                .map(|c| format!("e.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![entity_id, limit], Self::row_to_episode)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Clear pipeline-progress flags and bookkeeping fields on every
    /// episode, used by the reconsolidate-from-scratch operation.
    pub fn reset_episode_flags(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE episodes SET consolidated = 0, entities_extracted = 0,
                relations_extracted = 0, entity_ids = '[]', concepts_activated = '[]'",
            [],
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Entities & mentions
    // ---------------------------------------------------------------

    pub fn add_entity(&self, e: &Entity) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO entities (id, entity_type, display_name, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET entity_type = excluded.entity_type,
                display_name = excluded.display_name",
            params![
                e.id,
                e.entity_type.as_str(),
                e.display_name,
                e.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
        let entity_type: String = row.get("entity_type")?;
        let created_at: String = row.get("created_at")?;
        Ok(Entity {
            id: row.get("id")?,
            entity_type: EntityType::parse_or_other(&entity_type),
            display_name: row.get("display_name")?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    pub fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, entity_type, display_name, created_at FROM entities WHERE id = ?1",
            params![id],
            Self::row_to_entity,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_all_entities(&self) -> Result<Vec<Entity>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, entity_type, display_name, created_at FROM entities")?;
        let rows = stmt
            .query_map([], Self::row_to_entity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// First entity whose normalized display name equals the normalized
    /// input, ordered by `created_at` ascending (i.e. the oldest match).
    pub fn find_entity_by_name(&self, name: &str) -> Result<Option<Entity>> {
        let normalized = crate::types::normalize_name(name);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entity_type, display_name, created_at FROM entities ORDER BY created_at ASC",
        )?;
        let all = stmt
            .query_map([], Self::row_to_entity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(all
            .into_iter()
            .find(|e| crate::types::normalize_name(&e.display_name) == normalized))
    }

    pub fn add_mention(&self, episode_id: &str, entity_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO mentions (episode_id, entity_id) VALUES (?1, ?2)",
            params![episode_id, entity_id],
        )?;
        Ok(())
    }

    pub fn get_entity_mention_counts(&self, entity_id: &str) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM mentions WHERE entity_id = ?1",
            params![entity_id],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    // ---------------------------------------------------------------
    // Concepts
    // ---------------------------------------------------------------

    fn upsert_concept(&self, conn: &Connection, c: &Concept) -> Result<()> {
        let data = ConceptData {
            summary: c.summary.clone(),
            instance_count: c.instance_count,
            source_episodes: c.source_episodes.clone(),
            conditions: c.conditions.clone(),
            exceptions: c.exceptions.clone(),
            tags: c.tags.clone(),
        };
        let blob = c.embedding.as_ref().map(|v| embedding_to_blob(v));
        conn.execute(
            "INSERT INTO concepts (id, data, embedding, confidence, created_at, updated_at, title)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET data=excluded.data, embedding=excluded.embedding,
                confidence=excluded.confidence, updated_at=excluded.updated_at, title=excluded.title",
            params![
                c.id,
                serde_json::to_string(&data)?,
                blob,
                f64::from(c.confidence),
                c.created_at.to_rfc3339(),
                c.updated_at.to_rfc3339(),
                c.title,
            ],
        )?;
        self.sync_relations(conn, &c.id, &c.relations)?;
        Ok(())
    }

    pub fn add_concept(&self, c: &Concept) -> Result<()> {
        let conn = self.conn()?;
        self.upsert_concept(&conn, c)
    }

    pub fn update_concept(&self, c: &Concept) -> Result<()> {
        let conn = self.conn()?;
        self.upsert_concept(&conn, c)
    }

    /// Atomically replace a concept's outgoing relation rows: delete then
    /// reinsert, so a partial update never leaves a stale edge behind.
    fn sync_relations(&self, conn: &Connection, concept_id: &str, relations: &[ConceptRelation]) -> Result<()> {
        conn.execute(
            "DELETE FROM concept_relations WHERE source_id = ?1",
            params![concept_id],
        )?;
        for r in relations {
            conn.execute(
                "INSERT OR REPLACE INTO concept_relations (source_id, target_id, relation_type, strength, context)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    concept_id,
                    r.target_id,
                    r.relation_type.as_str(),
                    f64::from(r.strength),
                    r.context,
                ],
            )?;
        }
        Ok(())
    }

    fn load_relations(conn: &Connection, concept_id: &str) -> Result<Vec<ConceptRelation>> {
        let mut stmt = conn.prepare(
            "SELECT target_id, relation_type, strength, context FROM concept_relations WHERE source_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![concept_id], |row| {
                let relation_type: String = row.get(1)?;
                let strength: f64 = row.get(2)?;
                Ok(ConceptRelation {
                    target_id: row.get(0)?,
                    relation_type: relation_type.parse().unwrap_or(ConceptRelationType::Correlates),
                    strength: strength as f32,
                    context: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_concept_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConceptRow> {
        let id: String = row.get("id")?;
        let data_json: String = row.get("data")?;
        let data: ConceptData = serde_json::from_str(&data_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let embedding_blob: Option<Vec<u8>> = row.get("embedding")?;
        let confidence: f64 = row.get("confidence")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        let title: Option<String> = row.get("title")?;
        Ok(ConceptRow {
            id,
            title,
            data,
            confidence: confidence as f32,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            embedding: embedding_blob.map(|b| blob_to_embedding(&b)),
        })
    }

    pub fn get_concept(&self, id: &str) -> Result<Option<Concept>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, data, embedding, confidence, created_at, updated_at, title
                 FROM concepts WHERE id = ?1",
                params![id],
                Self::row_to_concept_row,
            )
            .optional()?;
        let Some(row) = row else { return Ok(None) };
        let relations = Self::load_relations(&conn, &row.id)?;
        Ok(Some(Concept {
            id: row.id,
            title: row.title,
            summary: row.data.summary,
            confidence: row.confidence,
            instance_count: row.data.instance_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
            relations,
            source_episodes: row.data.source_episodes,
            conditions: row.data.conditions,
            exceptions: row.data.exceptions,
            embedding: row.embedding,
            tags: row.data.tags,
        }))
    }

    pub fn get_all_concepts(&self) -> Result<Vec<Concept>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, data, embedding, confidence, created_at, updated_at, title FROM concepts",
        )?;
        let rows: Vec<ConceptRow> = stmt
            .query_map([], Self::row_to_concept_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        let mut concepts = Vec::with_capacity(rows.len());
        for row in rows {
            let relations = Self::load_relations(&conn, &row.id)?;
            concepts.push(Concept {
                id: row.id,
                title: row.title,
                summary: row.data.summary,
                confidence: row.confidence,
                instance_count: row.data.instance_count,
                created_at: row.created_at,
                updated_at: row.updated_at,
                relations,
                source_episodes: row.data.source_episodes,
                conditions: row.data.conditions,
                exceptions: row.data.exceptions,
                embedding: row.embedding,
                tags: row.data.tags,
            });
        }
        Ok(concepts)
    }

    pub fn delete_all_concepts(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM concept_relations", [])?;
        conn.execute("DELETE FROM concepts", [])?;
        Ok(())
    }

    pub fn delete_all_entities(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM entity_relations", [])?;
        conn.execute("DELETE FROM mentions", [])?;
        conn.execute("DELETE FROM entities", [])?;
        Ok(())
    }

    /// Top-`k` `(concept, cosine_similarity)` pairs over all concepts with
    /// a non-null embedding, sorted descending. Linear scan; no ANN index
    /// (explicit non-goal).
    pub fn find_by_embedding(&self, query: &[f32], k: usize) -> Result<Vec<(Concept, f32)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, embedding FROM concepts WHERE embedding IS NOT NULL")?;
        let mut scored: Vec<(String, f32)> = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, blob))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(id, blob)| {
                let embedding = blob_to_embedding(&blob);
                let sim = cosine_similarity(query, &embedding);
                (id, sim)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        drop(stmt);
        scored
            .into_iter()
            .map(|(id, sim)| {
                let concept = self.get_concept(&id)?.ok_or_else(|| {
                    MemoryError::StorageIo(format!("concept {id} vanished mid-scan"))
                })?;
                Ok((concept, sim))
            })
            .collect()
    }

    /// DFS expansion from `concept_id` up to `depth` hops, optionally
    /// filtered to a set of relation types. Returns `(concept, incoming
    /// relation)` pairs; a visited set prevents cycles.
    pub fn get_related(
        &self,
        concept_id: &str,
        relation_types: Option<&[ConceptRelationType]>,
        depth: u32,
    ) -> Result<Vec<(Concept, ConceptRelation)>> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(concept_id.to_string());
        let mut results = Vec::new();
        let mut stack: Vec<(String, u32)> = vec![(concept_id.to_string(), depth)];
        while let Some((current, remaining)) = stack.pop() {
            if remaining == 0 {
                continue;
            }
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT target_id, relation_type, strength, context FROM concept_relations WHERE source_id = ?1",
            )?;
            let edges: Vec<ConceptRelation> = stmt
                .query_map(params![current], |row| {
                    let relation_type: String = row.get(1)?;
                    let strength: f64 = row.get(2)?;
                    Ok(ConceptRelation {
                        target_id: row.get(0)?,
                        relation_type: relation_type
                            .parse()
                            .unwrap_or(ConceptRelationType::Correlates),
                        strength: strength as f32,
                        context: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);
            drop(conn);
            for edge in edges {
                if let Some(types) = relation_types {
                    if !types.contains(&edge.relation_type) {
                        continue;
                    }
                }
                if visited.contains(&edge.target_id) {
                    continue;
                }
                visited.insert(edge.target_id.clone());
                if let Some(target_concept) = self.get_concept(&edge.target_id)? {
                    results.push((target_concept, edge.clone()));
                }
                if remaining > 1 {
                    stack.push((edge.target_id, remaining - 1));
                }
            }
        }
        Ok(results)
    }

    // ---------------------------------------------------------------
    // Entity relations
    // ---------------------------------------------------------------

    pub fn add_entity_relation(&self, r: &EntityRelation) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO entity_relations (source_id, target_id, relation_type, strength, context, source_episode_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(source_id, target_id, relation_type) DO UPDATE SET
                strength = excluded.strength, context = excluded.context,
                source_episode_id = excluded.source_episode_id",
            params![
                r.source_id,
                r.target_id,
                r.relation_type,
                f64::from(r.strength),
                r.context,
                r.source_episode_id,
            ],
        )?;
        Ok(())
    }

    /// The set of `(source, target)` pairs for which any relation exists in
    /// either direction among the given entity ids.
    pub fn get_existing_relation_pairs(&self, ids: &[String]) -> Result<HashSet<(String, String)>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let conn = self.conn()?;
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT source_id, target_id FROM entity_relations
             WHERE source_id IN ({placeholders}) AND target_id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = ids
            .iter()
            .chain(ids.iter())
            .map(|s| s as &dyn rusqlite::ToSql)
            .collect();
        let pairs = stmt
            .query_map(params.as_slice(), |row| {
                let s: String = row.get(0)?;
                let t: String = row.get(1)?;
                Ok((s, t))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut set = HashSet::new();
        for (s, t) in pairs {
            set.insert((s.clone(), t.clone()));
            set.insert((t, s));
        }
        Ok(set)
    }

    pub fn retrieve_related_entities(&self, entity_id: &str, limit: usize) -> Result<Vec<(Entity, u64)>> {
        let episodes = self.get_episodes_mentioning(entity_id, 100)?;
        let conn = self.conn()?;
        let mut counts: HashMap<String, u64> = HashMap::new();
        for ep in &episodes {
            let mut stmt = conn.prepare("SELECT entity_id FROM mentions WHERE episode_id = ?1")?;
            let ids: Vec<String> = stmt
                .query_map(params![ep.id], |r| r.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for id in ids {
                if id != entity_id {
                    *counts.entry(id).or_insert(0) += 1;
                }
            }
        }
        let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(limit);
        ranked
            .into_iter()
            .map(|(id, count)| {
                let entity = self
                    .get_entity(&id)?
                    .ok_or_else(|| MemoryError::StorageIo(format!("entity {id} vanished")))?;
                Ok((entity, count))
            })
            .collect()
    }

    // ---------------------------------------------------------------
    // Key-value metadata
    // ---------------------------------------------------------------

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Stats & export/import
    // ---------------------------------------------------------------

    pub fn get_stats(&self) -> Result<StoreStats> {
        let conn = self.conn()?;
        let total_episodes: i64 = conn.query_row("SELECT count(*) FROM episodes", [], |r| r.get(0))?;
        let total_entities: i64 = conn.query_row("SELECT count(*) FROM entities", [], |r| r.get(0))?;
        let total_concepts: i64 = conn.query_row("SELECT count(*) FROM concepts", [], |r| r.get(0))?;
        let unconsolidated: i64 =
            conn.query_row("SELECT count(*) FROM episodes WHERE consolidated = 0", [], |r| r.get(0))?;
        let mut stmt = conn.prepare("SELECT episode_type, count(*) FROM episodes GROUP BY episode_type")?;
        let type_counts = stmt
            .query_map([], |row| {
                let t: String = row.get(0)?;
                let c: i64 = row.get(1)?;
                Ok((t, c as usize))
            })?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(StoreStats {
            total_episodes: total_episodes as usize,
            total_entities: total_entities as usize,
            total_concepts: total_concepts as usize,
            unconsolidated_episodes: unconsolidated as usize,
            episode_type_counts: type_counts,
        })
    }

    pub fn export_data(&self) -> Result<ExportedData> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT episode_id, entity_id FROM mentions")?;
        let mentions = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        let mut stmt = conn.prepare(
            "SELECT source_id, target_id, relation_type, strength, context, source_episode_id FROM entity_relations",
        )?;
        let entity_relations = stmt
            .query_map([], |row| {
                let strength: f64 = row.get(3)?;
                Ok(EntityRelation {
                    source_id: row.get(0)?,
                    target_id: row.get(1)?,
                    relation_type: row.get(2)?,
                    strength: strength as f32,
                    context: row.get(4)?,
                    source_episode_id: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        Ok(ExportedData {
            version: 1,
            concepts: self.get_all_concepts()?,
            episodes: self.get_recent_episodes(u32::MAX)?,
            entities: self.get_all_entities()?,
            mentions,
            entity_relations,
        })
    }

    pub fn import_data(&self, data: &ExportedData) -> Result<()> {
        for e in &data.entities {
            self.add_entity(e)?;
        }
        for ep in &data.episodes {
            if self.get_episode(&ep.id)?.is_some() {
                self.update_episode(ep)?;
            } else {
                self.add_episode(ep)?;
            }
        }
        for c in &data.concepts {
            self.add_concept(c)?;
        }
        for (ep_id, e_id) in &data.mentions {
            self.add_mention(ep_id, e_id)?;
        }
        for r in &data.entity_relations {
            self.add_entity_relation(r)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConceptRelation, ConceptRelationType, Entity, EntityType, Episode};

    fn store() -> Store {
        Store::open_in_memory()
    }

    #[test]
    fn add_and_get_episode_round_trips() {
        let s = store();
        let ep = Episode::new("hello", 1.0);
        s.add_episode(&ep).unwrap();
        let fetched = s.get_episode(&ep.id).unwrap().unwrap();
        assert_eq!(fetched.content, "hello");
        assert!(!fetched.consolidated);
    }

    #[test]
    fn entity_upsert_preserves_id_updates_type() {
        let s = store();
        let e = Entity::new(EntityType::Person, "Alice");
        s.add_entity(&e).unwrap();
        let mut e2 = e.clone();
        e2.entity_type = EntityType::Subject;
        s.add_entity(&e2).unwrap();
        let fetched = s.get_entity(&e.id).unwrap().unwrap();
        assert_eq!(fetched.id, e.id);
        assert_eq!(fetched.entity_type, EntityType::Subject);
    }

    #[test]
    fn find_entity_by_name_matches_normalized_form() {
        let s = store();
        let e = Entity::new(EntityType::Person, "Alice Smith");
        s.add_entity(&e).unwrap();
        let found = s.find_entity_by_name("  alice   smith ").unwrap().unwrap();
        assert_eq!(found.id, e.id);
    }

    #[test]
    fn mentions_are_idempotent() {
        let s = store();
        let ep = Episode::new("x", 1.0);
        let e = Entity::new(EntityType::Tool, "ripgrep");
        s.add_episode(&ep).unwrap();
        s.add_entity(&e).unwrap();
        s.add_mention(&ep.id, &e.id).unwrap();
        s.add_mention(&ep.id, &e.id).unwrap();
        assert_eq!(s.get_entity_mention_counts(&e.id).unwrap(), 1);
    }

    #[test]
    fn find_by_embedding_sorts_descending_and_truncates() {
        let s = store();
        for (summary, vec) in [("a", vec![1.0, 0.0]), ("b", vec![0.9, 0.1]), ("c", vec![0.0, 1.0])] {
            let mut c = Concept::new(summary, 1.0, vec![]);
            c.embedding = Some(vec![vec[0], vec[1]]);
            s.add_concept(&c).unwrap();
        }
        let results = s.find_by_embedding(&[1.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].1 >= results[1].1);
    }

    #[test]
    fn concept_relations_resync_atomically() {
        let s = store();
        let mut a = Concept::new("A", 1.0, vec![]);
        let b = Concept::new("B", 1.0, vec![]);
        s.add_concept(&b).unwrap();
        a.add_relation(ConceptRelation {
            target_id: b.id.clone(),
            relation_type: ConceptRelationType::Implies,
            strength: 0.8,
            context: None,
        });
        s.add_concept(&a).unwrap();
        let fetched = s.get_concept(&a.id).unwrap().unwrap();
        assert_eq!(fetched.relations.len(), 1);
        assert_eq!(fetched.relations[0].target_id, b.id);

        // Resync with zero relations should clear the old edge.
        let mut a2 = fetched;
        a2.relations.clear();
        s.update_concept(&a2).unwrap();
        let refetched = s.get_concept(&a.id).unwrap().unwrap();
        assert!(refetched.relations.is_empty());
    }

    #[test]
    fn get_related_dfs_respects_depth_and_cycles() {
        let s = store();
        let mut a = Concept::new("A", 1.0, vec![]);
        let mut b = Concept::new("B", 1.0, vec![]);
        let c = Concept::new("C", 1.0, vec![]);
        s.add_concept(&c).unwrap();
        b.add_relation(ConceptRelation {
            target_id: c.id.clone(),
            relation_type: ConceptRelationType::Generalizes,
            strength: 0.9,
            context: None,
        });
        s.add_concept(&b).unwrap();
        a.add_relation(ConceptRelation {
            target_id: b.id.clone(),
            relation_type: ConceptRelationType::Implies,
            strength: 0.9,
            context: None,
        });
        s.add_concept(&a).unwrap();

        let one_hop = s.get_related(&a.id, None, 1).unwrap();
        assert_eq!(one_hop.len(), 1);
        assert_eq!(one_hop[0].0.id, b.id);

        let two_hop = s.get_related(&a.id, None, 2).unwrap();
        assert_eq!(two_hop.len(), 2);
    }

    #[test]
    fn reset_episode_flags_clears_progress_and_entity_ids() {
        let s = store();
        let mut ep = Episode::new("x", 1.0);
        ep.consolidated = true;
        ep.entities_extracted = true;
        ep.entity_ids = vec!["person:alice".into()];
        s.add_episode(&ep).unwrap();
        s.reset_episode_flags().unwrap();
        let fetched = s.get_episode(&ep.id).unwrap().unwrap();
        assert!(!fetched.consolidated);
        assert!(!fetched.entities_extracted);
        assert!(fetched.entity_ids.is_empty());
    }

    #[test]
    fn export_import_round_trips_core_fields() {
        let s = store();
        let e = Entity::new(EntityType::Person, "Alice");
        s.add_entity(&e).unwrap();
        let mut ep = Episode::new("hi", 1.0);
        ep.entity_ids = vec![e.id.clone()];
        s.add_episode(&ep).unwrap();
        s.add_mention(&ep.id, &e.id).unwrap();
        let mut c = Concept::new("summary", 0.8, vec![ep.id.clone()]);
        c.embedding = Some(vec![0.1, 0.2]);
        s.add_concept(&c).unwrap();

        let exported = s.export_data().unwrap();
        let s2 = store();
        s2.import_data(&exported).unwrap();
        let reimported = s2.export_data().unwrap();
        assert_eq!(exported.entities.len(), reimported.entities.len());
        assert_eq!(exported.concepts.len(), reimported.concepts.len());
        assert_eq!(exported.episodes.len(), reimported.episodes.len());
    }
}
