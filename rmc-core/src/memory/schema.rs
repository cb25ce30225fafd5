//! SQLite schema and migrations for the relational memory store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL lets readers proceed while a worker writes
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

/// Apply version 1 schema.
fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "BEGIN;

        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            namespace TEXT NOT NULL,
            content_type TEXT NOT NULL,
            content TEXT NOT NULL,
            embedding BLOB,
            claim_key TEXT,
            claim_value TEXT,
            memory_type TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 1.0,
            base_score REAL NOT NULL DEFAULT 0.0,
            composite_score REAL NOT NULL DEFAULT 0.0,
            tier INTEGER NOT NULL DEFAULT 0,
            producer_kind TEXT NOT NULL,
            producer_id TEXT NOT NULL,
            producer_reputation REAL NOT NULL DEFAULT 0.5,
            created_at TEXT NOT NULL,
            last_accessed_at TEXT NOT NULL,
            usage_count INTEGER NOT NULL DEFAULT 0,
            root_id TEXT NOT NULL,
            parent_id TEXT REFERENCES memories(id),
            version INTEGER NOT NULL DEFAULT 0,
            archived INTEGER NOT NULL DEFAULT 0,
            processing TEXT NOT NULL DEFAULT 'pending',
            metadata TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_memories_scope ON memories(org_id, namespace);
        CREATE INDEX IF NOT EXISTS idx_memories_claim ON memories(org_id, namespace, claim_key);
        CREATE INDEX IF NOT EXISTS idx_memories_last_accessed ON memories(last_accessed_at);
        CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
        CREATE INDEX IF NOT EXISTS idx_memories_root ON memories(root_id);
        CREATE INDEX IF NOT EXISTS idx_memories_tier ON memories(tier);

        CREATE TABLE IF NOT EXISTS entity_tags (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 1.0,
            mention_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE (normalized_name, kind)
        );

        CREATE TABLE IF NOT EXISTS memory_entities (
            memory_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 1.0,
            PRIMARY KEY (memory_id, entity_id),
            FOREIGN KEY (memory_id) REFERENCES memories(id) ON DELETE CASCADE,
            FOREIGN KEY (entity_id) REFERENCES entity_tags(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_memory_entities_entity ON memory_entities(entity_id);

        CREATE TABLE IF NOT EXISTS memory_concepts (
            memory_id TEXT NOT NULL,
            label TEXT NOT NULL,
            is_topic INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (memory_id, label, is_topic),
            FOREIGN KEY (memory_id) REFERENCES memories(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS relations (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relation_type TEXT NOT NULL,
            strength REAL NOT NULL,
            reason TEXT,
            inferred_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (source_id, target_id, relation_type),
            FOREIGN KEY (source_id) REFERENCES memories(id) ON DELETE CASCADE,
            FOREIGN KEY (target_id) REFERENCES memories(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_relations_source ON relations(source_id);
        CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(target_id);
        CREATE INDEX IF NOT EXISTS idx_relations_type_strength ON relations(relation_type, strength);

        CREATE TABLE IF NOT EXISTS conflicts (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            namespace TEXT NOT NULL,
            entry_a TEXT NOT NULL,
            entry_b TEXT NOT NULL,
            kind TEXT NOT NULL,
            claim_key TEXT,
            severity TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            reason TEXT,
            resolution TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (entry_a, entry_b, kind),
            FOREIGN KEY (entry_a) REFERENCES memories(id),
            FOREIGN KEY (entry_b) REFERENCES memories(id)
        );

        CREATE INDEX IF NOT EXISTS idx_conflicts_scope_status ON conflicts(org_id, namespace, status);

        CREATE TABLE IF NOT EXISTS conflict_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conflict_id TEXT NOT NULL,
            action TEXT NOT NULL,
            actor TEXT NOT NULL,
            detail TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (conflict_id) REFERENCES conflicts(id)
        );

        CREATE TABLE IF NOT EXISTS score_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            from_tier INTEGER,
            to_tier INTEGER,
            score REAL NOT NULL,
            reason TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (memory_id) REFERENCES memories(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_score_log_memory ON score_log(memory_id);

        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            last_error TEXT,
            run_after TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status_run_after ON jobs(status, run_after);

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;",
    )
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='memories'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_schema() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        assert!(is_initialized(&conn));
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_idempotent_initialization() {
        let conn = Connection::open_in_memory().unwrap();

        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_entity_uniqueness_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        let insert = "INSERT INTO entity_tags (id, name, kind, normalized_name, created_at)
                      VALUES (?1, 'Postgres', 'technology', 'postgres', '2024-01-01T00:00:00Z')";
        conn.execute(insert, ["a"]).unwrap();
        assert!(conn.execute(insert, ["b"]).is_err());
    }

    #[test]
    fn test_indexes_exist() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        for name in [
            "idx_relations_type_strength",
            "idx_memories_last_accessed",
            "idx_conflicts_scope_status",
        ] {
            let count: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name=?1",
                    [name],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing index {}", name);
        }
    }
}
