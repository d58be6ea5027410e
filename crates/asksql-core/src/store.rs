//! Session store: durable conversations and their append-only turns.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    ConversationSummary, ConversationWithTurns, DEFAULT_TITLE, NewTurn, QueryRecord, Turn,
    TurnRole, title_from_question,
};
use crate::schema::SCHEMA;

const LOCK_PRUNE_THRESHOLD: usize = 1024;

/// Durable store of conversations.
///
/// Mutations of a single conversation are serialized through a per-conversation
/// lock and each runs in one transaction, so concurrent appends never lose or
/// interleave turns.
pub struct SessionStore {
    pool: SqlitePool,
    locks: ConversationLocks,
}

impl SessionStore {
    /// Open or create a store at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        let parent = path.parent().unwrap_or(Path::new("."));
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            locks: ConversationLocks::default(),
        };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the store.
    pub async fn close(self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Conversations
    // =========================================================================

    /// Create an empty conversation and return its id.
    pub async fn create_conversation(&self) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO conversations (id, title, first_question, created_at, updated_at, turn_count)
            VALUES (?, ?, NULL, ?, ?, 0)
            "#,
        )
        .bind(id.to_string())
        .bind(DEFAULT_TITLE)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        tracing::debug!(conversation_id = %id, "created conversation");
        Ok(id)
    }

    /// Whether a conversation with this id exists.
    pub async fn conversation_exists(&self, id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// List conversations, newest-updated first.
    pub async fn list_conversations(
        &self,
        opts: ListConversationsOptions,
    ) -> Result<Vec<ConversationSummary>> {
        let mut sql = String::from("SELECT * FROM conversations WHERE 1=1");

        if opts.since.is_some() {
            sql.push_str(" AND updated_at >= ?");
        }

        sql.push_str(" ORDER BY updated_at DESC, created_at DESC");

        if let Some(limit) = opts.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query(&sql);
        if let Some(since) = opts.since {
            query = query.bind(since.timestamp_millis());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(conversation_from_row).collect()
    }

    /// Get a conversation by ID.
    pub async fn get_conversation(&self, id: Uuid) -> Result<Option<ConversationSummary>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Get a conversation together with all of its turns.
    pub async fn get_conversation_with_turns(&self, id: Uuid) -> Result<ConversationWithTurns> {
        let conversation = self
            .get_conversation(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conversation '{id}'")))?;
        let turns = self.get_turns(id).await?;
        Ok(ConversationWithTurns {
            conversation,
            turns,
        })
    }

    /// Get conversation count.
    pub async fn count_conversations(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conversations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    /// Delete a conversation and all of its turns.
    pub async fn delete_conversation(&self, id: Uuid) -> Result<()> {
        let lock = self.locks.for_conversation(id);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM turns WHERE conversation_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(Error::NotFound(format!("conversation '{id}'")));
        }

        tx.commit().await?;
        self.locks.forget(id);
        tracing::info!(conversation_id = %id, "deleted conversation");
        Ok(())
    }

    /// Replace a conversation's title. Timestamps are left untouched.
    pub async fn rename_conversation(&self, id: Uuid, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::InvalidInput("title must not be empty".to_string()));
        }

        let lock = self.locks.for_conversation(id);
        let _guard = lock.lock().await;

        let result = sqlx::query("UPDATE conversations SET title = ? WHERE id = ?")
            .bind(title)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("conversation '{id}'")));
        }
        Ok(())
    }

    // =========================================================================
    // Turns
    // =========================================================================

    /// Append one turn. Creates the conversation when `id` is unset or unknown.
    pub async fn append_turn(&self, id: Option<Uuid>, turn: &NewTurn) -> Result<Uuid> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        let lock = self.locks.for_conversation(id);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let state = match load_append_state(&mut tx, id).await? {
            Some(state) => state,
            None => insert_conversation(&mut tx, id).await?,
        };
        append_in_tx(&mut tx, id, state, turn).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Append a user turn and its assistant reply as one atomic step.
    pub async fn append_exchange(
        &self,
        id: Uuid,
        user: &NewTurn,
        assistant: &NewTurn,
    ) -> Result<()> {
        self.append_pair(id, user, assistant, false).await
    }

    /// Like [`SessionStore::append_exchange`], inserting the conversation in
    /// the same transaction when it does not exist yet.
    pub async fn append_exchange_or_create(
        &self,
        id: Uuid,
        user: &NewTurn,
        assistant: &NewTurn,
    ) -> Result<()> {
        self.append_pair(id, user, assistant, true).await
    }

    async fn append_pair(
        &self,
        id: Uuid,
        user: &NewTurn,
        assistant: &NewTurn,
        create_if_absent: bool,
    ) -> Result<()> {
        let lock = self.locks.for_conversation(id);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let state = match load_append_state(&mut tx, id).await? {
            Some(state) => state,
            None if create_if_absent => insert_conversation(&mut tx, id).await?,
            None => {
                tx.rollback().await?;
                return Err(Error::NotFound(format!("conversation '{id}'")));
            }
        };
        let state = append_in_tx(&mut tx, id, state, user).await?;
        append_in_tx(&mut tx, id, state, assistant).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Get all turns of a conversation in append order.
    pub async fn get_turns(&self, id: Uuid) -> Result<Vec<Turn>> {
        if !self.conversation_exists(id).await? {
            return Err(Error::NotFound(format!("conversation '{id}'")));
        }

        let rows = sqlx::query("SELECT * FROM turns WHERE conversation_id = ? ORDER BY idx")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(turn_from_row).collect()
    }

    /// Get the last `limit` turns of a conversation, oldest first.
    pub async fn recent_turns(&self, id: Uuid, limit: usize) -> Result<Vec<Turn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT * FROM turns WHERE conversation_id = ? ORDER BY idx DESC LIMIT ?
            ) ORDER BY idx ASC
            "#,
        )
        .bind(id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(turn_from_row).collect()
    }
}

/// Options for listing conversations.
#[derive(Debug, Default)]
pub struct ListConversationsOptions {
    /// Only conversations updated at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Default)]
struct ConversationLocks {
    inner: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    fn for_conversation(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if map.len() > LOCK_PRUNE_THRESHOLD {
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(map.entry(id).or_default())
    }

    fn forget(&self, id: Uuid) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(&id);
    }
}

#[derive(Debug, Clone, Copy)]
struct AppendState {
    updated_at: i64,
    turn_count: i64,
    has_first_question: bool,
}

async fn load_append_state(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
) -> Result<Option<AppendState>> {
    let row = sqlx::query(
        "SELECT updated_at, turn_count, first_question FROM conversations WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(|row| AppendState {
        updated_at: row.get("updated_at"),
        turn_count: row.get("turn_count"),
        has_first_question: row.get::<Option<String>, _>("first_question").is_some(),
    }))
}

async fn insert_conversation(tx: &mut Transaction<'_, Sqlite>, id: Uuid) -> Result<AppendState> {
    let now = Utc::now().timestamp_millis();
    sqlx::query(
        r#"
        INSERT INTO conversations (id, title, first_question, created_at, updated_at, turn_count)
        VALUES (?, ?, NULL, ?, ?, 0)
        "#,
    )
    .bind(id.to_string())
    .bind(DEFAULT_TITLE)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    // The first append advances past creation time.
    Ok(AppendState {
        updated_at: now,
        turn_count: 0,
        has_first_question: false,
    })
}

async fn append_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    state: AppendState,
    turn: &NewTurn,
) -> Result<AppendState> {
    let at = Utc::now().timestamp_millis().max(state.updated_at + 1);
    let (sql_text, table_json) = match &turn.query {
        Some(record) => (
            Some(record.sql.as_str()),
            Some(serde_json::to_string(&record.table)?),
        ),
        None => (None, None),
    };

    sqlx::query(
        r#"
        INSERT INTO turns (conversation_id, idx, role, content, created_at, refined_question, sql_text, table_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(state.turn_count)
    .bind(turn.role.to_string())
    .bind(&turn.content)
    .bind(at)
    .bind(&turn.refined_question)
    .bind(sql_text)
    .bind(table_json)
    .execute(&mut **tx)
    .await?;

    let opens_session = turn.role == TurnRole::User && !state.has_first_question;
    if opens_session {
        sqlx::query(
            r#"
            UPDATE conversations
            SET updated_at = ?,
                turn_count = turn_count + 1,
                first_question = ?,
                title = CASE WHEN title = ? THEN ? ELSE title END
            WHERE id = ?
            "#,
        )
        .bind(at)
        .bind(&turn.content)
        .bind(DEFAULT_TITLE)
        .bind(title_from_question(&turn.content))
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
    } else {
        sqlx::query(
            "UPDATE conversations SET updated_at = ?, turn_count = turn_count + 1 WHERE id = ?",
        )
        .bind(at)
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
    }

    Ok(AppendState {
        updated_at: at,
        turn_count: state.turn_count + 1,
        has_first_question: state.has_first_question || opens_session,
    })
}

fn timestamp_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::Other(format!("corrupt conversation id '{raw}': {e}")))
}

fn conversation_from_row(row: &SqliteRow) -> Result<ConversationSummary> {
    Ok(ConversationSummary {
        id: parse_id(row.get::<&str, _>("id"))?,
        title: row.get("title"),
        created_at: timestamp_from_millis(row.get("created_at")),
        updated_at: timestamp_from_millis(row.get("updated_at")),
        turn_count: row.get("turn_count"),
        first_question: row.get("first_question"),
    })
}

fn turn_from_row(row: &SqliteRow) -> Result<Turn> {
    let role_raw: &str = row.get("role");
    let role = TurnRole::parse(role_raw)
        .ok_or_else(|| Error::Other(format!("unknown turn role '{role_raw}'")))?;

    let sql_text: Option<String> = row.get("sql_text");
    let table_json: Option<String> = row.get("table_json");
    let query = match (sql_text, table_json) {
        (Some(sql), Some(table)) => Some(QueryRecord {
            sql,
            table: serde_json::from_str(&table)?,
        }),
        _ => None,
    };

    Ok(Turn {
        idx: row.get("idx"),
        role,
        content: row.get("content"),
        created_at: timestamp_from_millis(row.get("created_at")),
        refined_question: row.get("refined_question"),
        query,
    })
}
