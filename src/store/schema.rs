//! Schema definition and non-destructive migration.

use rusqlite::Connection;

use crate::error::Result;

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS entities (
    id           TEXT PRIMARY KEY,
    entity_type  TEXT NOT NULL,
    display_name TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS episodes (
    id                  TEXT PRIMARY KEY,
    timestamp           TEXT NOT NULL,
    content             TEXT NOT NULL,
    episode_type        TEXT NOT NULL,
    entity_ids          TEXT NOT NULL DEFAULT '[]',
    consolidated        INTEGER NOT NULL DEFAULT 0,
    entities_extracted  INTEGER NOT NULL DEFAULT 0,
    relations_extracted INTEGER NOT NULL DEFAULT 0,
    confidence          REAL NOT NULL DEFAULT 1.0,
    metadata            TEXT NOT NULL DEFAULT '{}',
    concepts_activated  TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS mentions (
    episode_id TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
    entity_id  TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    PRIMARY KEY (episode_id, entity_id)
);

CREATE TABLE IF NOT EXISTS concepts (
    id         TEXT PRIMARY KEY,
    data       TEXT NOT NULL,
    embedding  BLOB,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS concept_relations (
    source_id     TEXT NOT NULL REFERENCES concepts(id) ON DELETE CASCADE,
    target_id     TEXT NOT NULL REFERENCES concepts(id) ON DELETE CASCADE,
    relation_type TEXT NOT NULL,
    strength      REAL NOT NULL,
    context       TEXT,
    PRIMARY KEY (source_id, target_id, relation_type)
);

CREATE TABLE IF NOT EXISTS entity_relations (
    source_id         TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    target_id         TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relation_type     TEXT NOT NULL,
    strength          REAL NOT NULL,
    context           TEXT,
    source_episode_id TEXT REFERENCES episodes(id) ON DELETE SET NULL,
    PRIMARY KEY (source_id, target_id, relation_type)
);

CREATE TABLE IF NOT EXISTS metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_episodes_consolidated ON episodes(consolidated);
CREATE INDEX IF NOT EXISTS idx_episodes_extracted ON episodes(entities_extracted);
CREATE INDEX IF NOT EXISTS idx_episodes_timestamp ON episodes(timestamp);
CREATE INDEX IF NOT EXISTS idx_mentions_entity ON mentions(entity_id);
CREATE INDEX IF NOT EXISTS idx_concept_relations_source ON concept_relations(source_id);
CREATE INDEX IF NOT EXISTS idx_entity_relations_source ON entity_relations(source_id);
CREATE INDEX IF NOT EXISTS idx_entity_relations_target ON entity_relations(target_id);
";

/// Create all tables/indices if absent, then apply any pending
/// non-destructive column migrations.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLES)?;
    migrate_title_columns(conn)?;
    Ok(())
}

/// `title` columns were added to `concepts` and `episodes` after the
/// original schema shipped. Detect their absence by probing with a `SELECT`
/// and catching the resulting error, then add the column — the same
/// probe-then-`ALTER TABLE` pattern used for every schema evolution here, so
/// that upgrading an existing database file never requires a destructive
/// rewrite.
fn migrate_title_columns(conn: &Connection) -> Result<()> {
    if conn
        .query_row("SELECT title FROM concepts LIMIT 1", [], |_| Ok(()))
        .is_err()
    {
        conn.execute("ALTER TABLE concepts ADD COLUMN title TEXT", [])?;
    }
    if conn
        .query_row("SELECT title FROM episodes LIMIT 1", [], |_| Ok(()))
        .is_err()
    {
        conn.execute("ALTER TABLE episodes ADD COLUMN title TEXT", [])?;
    }
    Ok(())
}
