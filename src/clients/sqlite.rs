//! SQLite-backed durable store and vector index
//!
//! The durable tier holds session headers, the append-only message log,
//! identity aggregates, metrics batches, feedback and failure records.
//! Vector search runs against a sqlite-vec `vec0` virtual table joined with
//! the chunk metadata table. Chunk ingestion is owned by the external KB
//! pipeline; this module only reads chunks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use super::{DurableStore, FailureRecord, FailureState, FeedbackRecord, VectorIndex};
use crate::error::{Error, Result};
use crate::kb::{EntryType, KbChunk, MetadataFilter, ScoredChunk, UserType};
use crate::metrics::QueryMetrics;
use crate::session::{EndReason, MessageMetadata, Role, SessionHeader, StoredMessage};

/// Register sqlite-vec on every new connection.
/// Must run before the first pool connection is opened.
pub fn register_vector_extension() {
    unsafe {
        libsqlite3_sys::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    }
}

/// Open a pool against `database_url` (e.g. `sqlite://kbase.db?mode=rwc`).
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(10);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("bad timestamp {raw}: {e}")))
}

// ============================================================================
// Durable store
// ============================================================================

/// sqlx-backed durable tier
#[derive(Clone)]
pub struct SqliteDurableStore {
    pool: Arc<SqlitePool>,
}

impl SqliteDurableStore {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Create the schema. Safe to call multiple times (IF NOT EXISTS).
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS kb_sessions (
                id TEXT PRIMARY KEY,
                identity TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                ended_at TEXT,
                end_reason TEXT,
                message_count INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS kb_session_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metadata TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_kb_session_messages_session
                ON kb_session_messages (session_id, id)",
            "CREATE TABLE IF NOT EXISTS kb_identity_aggregates (
                identity TEXT PRIMARY KEY,
                total_queries INTEGER NOT NULL DEFAULT 0,
                total_cost_usd REAL NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS kb_query_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                record TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS kb_feedback (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                rating TEXT NOT NULL,
                comment TEXT,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS kb_agent_failures (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                query_text TEXT NOT NULL,
                reason TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        ];
        for statement in statements {
            sqlx::query(statement).execute(self.pool.as_ref()).await?;
        }
        tracing::info!("durable-store schema ready");
        Ok(())
    }
}

fn row_to_header(row: &sqlx::sqlite::SqliteRow) -> Result<SessionHeader> {
    let ended_at: Option<String> = row.get("ended_at");
    let end_reason: Option<String> = row.get("end_reason");
    Ok(SessionHeader {
        session_id: row.get("id"),
        identity: row.get("identity"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        last_activity_at: parse_timestamp(&row.get::<String, _>("last_activity_at"))?,
        ended_at: ended_at.as_deref().map(parse_timestamp).transpose()?,
        end_reason: end_reason.as_deref().and_then(EndReason::parse),
        message_count: row.get::<i64, _>("message_count") as u64,
    })
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn create_session(&self, header: &SessionHeader) -> Result<()> {
        sqlx::query(
            "INSERT INTO kb_sessions (id, identity, created_at, last_activity_at, message_count)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&header.session_id)
        .bind(&header.identity)
        .bind(header.created_at.to_rfc3339())
        .bind(header.last_activity_at.to_rfc3339())
        .bind(header.message_count as i64)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn session_header(&self, session_id: &str) -> Result<Option<SessionHeader>> {
        let row = sqlx::query("SELECT * FROM kb_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        row.as_ref().map(row_to_header).transpose()
    }

    async fn append_message(&self, session_id: &str, message: &StoredMessage) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let ended: Option<Option<String>> =
            sqlx::query_scalar("SELECT ended_at FROM kb_sessions WHERE id = ?")
                .bind(session_id)
                .fetch_optional(&mut *tx)
                .await?;
        match ended {
            None => return Err(Error::Database(format!("unknown session {session_id}"))),
            Some(Some(_)) => return Err(Error::SessionEnded(session_id.to_string())),
            Some(None) => {}
        }

        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO kb_session_messages (session_id, role, content, timestamp, metadata)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp.to_rfc3339())
        .bind(metadata)
        .execute(&mut *tx)
        .await?;

        let count: i64 = sqlx::query_scalar(
            "UPDATE kb_sessions
             SET message_count = message_count + 1, last_activity_at = ?
             WHERE id = ?
             RETURNING message_count",
        )
        .bind(message.timestamp.to_rfc3339())
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(count as u64)
    }

    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT role, content, timestamp, metadata
             FROM kb_session_messages
             WHERE session_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(self.pool.as_ref())
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let role = Role::parse(&row.get::<String, _>("role"))
                .ok_or_else(|| Error::Database("bad role in message log".into()))?;
            let metadata: Option<MessageMetadata> = row
                .get::<Option<String>, _>("metadata")
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?;
            messages.push(StoredMessage {
                role,
                content: row.get("content"),
                timestamp: parse_timestamp(&row.get::<String, _>("timestamp"))?,
                metadata,
            });
        }
        Ok(messages)
    }

    async fn mark_ended(&self, session_id: &str, reason: EndReason, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE kb_sessions SET ended_at = ?, end_reason = ? WHERE id = ? AND ended_at IS NULL",
        )
        .bind(at.to_rfc3339())
        .bind(reason.as_str())
        .bind(session_id)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn update_identity_aggregates(
        &self,
        identity: &str,
        queries: u64,
        cost_usd: f64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO kb_identity_aggregates (identity, total_queries, total_cost_usd)
             VALUES (?, ?, ?)
             ON CONFLICT (identity) DO UPDATE SET
                 total_queries = total_queries + excluded.total_queries,
                 total_cost_usd = total_cost_usd + excluded.total_cost_usd",
        )
        .bind(identity)
        .bind(queries as i64)
        .bind(cost_usd)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn store_metrics_batch(&self, session_id: &str, records: &[QueryMetrics]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO kb_query_metrics (session_id, recorded_at, record) VALUES (?, ?, ?)",
            )
            .bind(session_id)
            .bind(Utc::now().to_rfc3339())
            .bind(serde_json::to_string(record)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_feedback(&self, record: &FeedbackRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO kb_feedback (id, session_id, rating, comment, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(match record.rating {
            super::FeedbackRating::Up => "up",
            super::FeedbackRating::Down => "down",
        })
        .bind(&record.comment)
        .bind(record.created_at.to_rfc3339())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn record_failure(&self, record: &FailureRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO kb_agent_failures (id, session_id, query_text, reason, state, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.query_text)
        .bind(&record.reason)
        .bind(failure_state_str(record.state))
        .bind(record.created_at.to_rfc3339())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn get_failure(&self, failure_id: &str) -> Result<Option<FailureRecord>> {
        let row = sqlx::query("SELECT * FROM kb_agent_failures WHERE id = ?")
            .bind(failure_id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        row.map(|row| {
            let state = match row.get::<String, _>("state").as_str() {
                "ticket_created" => FailureState::TicketCreated,
                "declined" => FailureState::Declined,
                _ => FailureState::Recorded,
            };
            Ok(FailureRecord {
                id: row.get("id"),
                session_id: row.get("session_id"),
                query_text: row.get("query_text"),
                reason: row.get("reason"),
                state,
                created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
            })
        })
        .transpose()
    }

    async fn set_failure_state(&self, failure_id: &str, state: FailureState) -> Result<bool> {
        let result = sqlx::query("UPDATE kb_agent_failures SET state = ? WHERE id = ?")
            .bind(failure_state_str(state))
            .bind(failure_id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn failure_state_str(state: FailureState) -> &'static str {
    match state {
        FailureState::Recorded => "recorded",
        FailureState::TicketCreated => "ticket_created",
        FailureState::Declined => "declined",
    }
}

// ============================================================================
// Vector index
// ============================================================================

/// sqlite-vec index over the externally-ingested chunk tables
#[derive(Clone)]
pub struct SqliteVectorIndex {
    pool: Arc<SqlitePool>,
}

impl SqliteVectorIndex {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Ensure the vec0 virtual table exists. The ingestion pipeline writes
    /// it; the engine only needs it present for reads on a fresh database.
    pub async fn ensure_vec_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS vec_kb USING vec0(\
             chunk_id TEXT PRIMARY KEY, \
             embedding float[768])",
        )
        .execute(self.pool.as_ref())
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kb_chunks (
                chunk_id TEXT PRIMARY KEY,
                parent_entry_id TEXT NOT NULL,
                parent_title TEXT NOT NULL,
                content TEXT NOT NULL,
                section_label TEXT NOT NULL DEFAULT '',
                chunk_index INTEGER NOT NULL,
                total_chunks INTEGER NOT NULL,
                entry_type TEXT NOT NULL,
                user_type TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT '',
                related_documents TEXT NOT NULL DEFAULT '[]'
            )",
        )
        .execute(self.pool.as_ref())
        .await?;
        tracing::info!("vec_kb virtual table ready");
        Ok(())
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<KbChunk> {
    let entry_type = EntryType::parse(&row.get::<String, _>("entry_type"))
        .ok_or_else(|| Error::Database("bad entry_type in kb_chunks".into()))?;
    let user_type = UserType::parse(&row.get::<String, _>("user_type"))
        .ok_or_else(|| Error::Database("bad user_type in kb_chunks".into()))?;
    let related: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("related_documents")).unwrap_or_default();
    Ok(KbChunk {
        chunk_id: row.get("chunk_id"),
        parent_entry_id: row.get("parent_entry_id"),
        parent_title: row.get("parent_title"),
        content: row.get("content"),
        section_label: row.get("section_label"),
        chunk_index: row.get::<i64, _>("chunk_index") as u32,
        total_chunks: row.get::<i64, _>("total_chunks") as u32,
        entry_type,
        user_type,
        category: row.get("category"),
        related_documents: related.into_iter().collect(),
    })
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
        threshold: f64,
    ) -> Result<Vec<ScoredChunk>> {
        // f32 little-endian bytes for sqlite-vec
        let embedding_bytes: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();

        // Build dynamic SQL with optional filters
        let mut sql = String::from(
            "SELECT c.*, vec_distance_cosine(v.embedding, ?) as distance \
             FROM vec_kb v \
             JOIN kb_chunks c ON v.chunk_id = c.chunk_id \
             WHERE 1=1",
        );
        if filter.entry_type.is_some() {
            sql.push_str(" AND c.entry_type = ?");
        }
        if !filter.user_types.is_empty() {
            let placeholders: Vec<&str> = filter.user_types.iter().map(|_| "?").collect();
            sql.push_str(&format!(" AND c.user_type IN ({})", placeholders.join(",")));
        }
        if filter.category.is_some() {
            sql.push_str(" AND c.category = ?");
        }
        sql.push_str(" ORDER BY distance ASC LIMIT ?");

        let mut db_query = sqlx::query(&sql).bind(&embedding_bytes);
        if let Some(entry_type) = filter.entry_type {
            db_query = db_query.bind(entry_type.to_string());
        }
        for user_type in &filter.user_types {
            db_query = db_query.bind(user_type.to_string());
        }
        if let Some(category) = &filter.category {
            db_query = db_query.bind(category.clone());
        }
        db_query = db_query.bind(k as i64);

        let rows = db_query.fetch_all(self.pool.as_ref()).await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let distance: f64 = row.get("distance");
            let similarity = 1.0 - distance;
            if similarity < threshold {
                continue;
            }
            scored.push(ScoredChunk {
                chunk: row_to_chunk(&row)?,
                similarity,
            });
        }
        // The index orders by distance; re-sort for deterministic tie-breaks.
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
                .then(a.chunk.parent_entry_id.cmp(&b.chunk.parent_entry_id))
        });
        Ok(scored)
    }

    async fn fetch_siblings(&self, parent_entry_id: &str) -> Result<Vec<KbChunk>> {
        let rows = sqlx::query(
            "SELECT * FROM kb_chunks WHERE parent_entry_id = ? ORDER BY chunk_index ASC",
        )
        .bind(parent_entry_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }
}
