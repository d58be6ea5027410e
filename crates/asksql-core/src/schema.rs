//! Database schema for the session store.

/// SQL schema for conversations and their turns.
///
/// Timestamps are unix milliseconds. `idx` is the append position within a
/// conversation and is the only ordering key for turns.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    first_question TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    turn_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated
    ON conversations(updated_at DESC);

CREATE TABLE IF NOT EXISTS turns (
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    idx INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    refined_question TEXT,
    sql_text TEXT,
    table_json TEXT,
    PRIMARY KEY (conversation_id, idx),
    CHECK ((sql_text IS NULL) = (table_json IS NULL))
);
"#;
