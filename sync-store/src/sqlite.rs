//! SQLite implementation of the message store.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::{Mutex, OwnedMutexGuard};

use chat_sync_types::{
    ConversationId, DeliveryStatus, LocalId, Message, MessageKind, MessagePayload, OpId,
    OpTarget, OperationKind, PendingOperation, ServerId, UserId,
};

use crate::error::{Result, StorageError};
use crate::MessageStore;

/// SQLite-backed message store.
///
/// Uses WAL mode for concurrent reads alongside writes and a bounded busy
/// timeout so no local operation blocks indefinitely. Writes within one
/// conversation are serialized through a per-conversation lock; writes to
/// different conversations proceed concurrently.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    write_locks: Arc<DashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl SqliteStore {
    /// Open (or create) a store at the given database path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.to_str().ok_or_else(|| StorageError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let options = SqliteConnectOptions::from_str(path_str)
            .map_err(StorageError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        tracing::info!(path = %path.display(), "opening message store");

        let store = Self {
            pool,
            write_locks: Arc::new(DashMap::new()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let store = Self {
            pool,
            write_locks: Arc::new(DashMap::new()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                local_id        TEXT PRIMARY KEY,
                server_id       TEXT UNIQUE,
                conversation_id TEXT NOT NULL,
                sender_id       TEXT NOT NULL,
                kind            TEXT NOT NULL,
                payload         TEXT NOT NULL,
                metadata        TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                recalled_at     INTEGER,
                edited_at       INTEGER,
                status          TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_operations (
                op_id           TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                kind            TEXT NOT NULL,
                target          TEXT NOT NULL,
                draft           TEXT,
                attempt_count   INTEGER NOT NULL DEFAULT 0,
                next_retry_at   INTEGER NOT NULL,
                created_at      INTEGER NOT NULL,
                UNIQUE(conversation_id, kind, target)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_retry
             ON pending_operations(conversation_id, next_retry_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(())
    }

    /// Acquire the write lock for one conversation.
    async fn write_lock(&self, conversation_id: &ConversationId) -> OwnedMutexGuard<()> {
        let lock = self
            .write_locks
            .entry(*conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn put_message(&self, message: &Message) -> Result<()> {
        let _guard = self.write_lock(&message.conversation_id).await;

        let payload = serde_json::to_string(&message.payload)
            .map_err(|e| StorageError::corrupt(format!("encode payload: {e}")))?;
        let metadata = serde_json::to_string(&message.metadata)
            .map_err(|e| StorageError::corrupt(format!("encode metadata: {e}")))?;
        let server_id = message.server_id.as_ref().map(|s| s.as_str().to_string());

        // A row already holding this server_id keeps its local_id linkage,
        // whatever local_id the caller passed.
        if let Some(ref sid) = server_id {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT local_id FROM messages WHERE server_id = ?1")
                    .bind(sid)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(StorageError::Database)?;

            if let Some(existing_local) = existing {
                if existing_local != message.local_id.to_string() {
                    sqlx::query(
                        r#"
                        UPDATE messages
                        SET conversation_id = ?2, sender_id = ?3, kind = ?4,
                            payload = ?5, metadata = ?6, created_at = ?7,
                            recalled_at = ?8, edited_at = ?9, status = ?10
                        WHERE server_id = ?1
                        "#,
                    )
                    .bind(sid)
                    .bind(message.conversation_id.to_string())
                    .bind(message.sender_id.as_str())
                    .bind(kind_str(message.kind))
                    .bind(&payload)
                    .bind(&metadata)
                    .bind(message.created_at)
                    .bind(message.recalled_at)
                    .bind(message.edited_at)
                    .bind(message.status.as_str())
                    .execute(&self.pool)
                    .await
                    .map_err(StorageError::Database)?;
                    return Ok(());
                }
            }
        }

        sqlx::query(
            r#"
            INSERT INTO messages (local_id, server_id, conversation_id, sender_id,
                                  kind, payload, metadata, created_at,
                                  recalled_at, edited_at, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(local_id) DO UPDATE SET
                server_id = COALESCE(excluded.server_id, messages.server_id),
                conversation_id = excluded.conversation_id,
                sender_id = excluded.sender_id,
                kind = excluded.kind,
                payload = excluded.payload,
                metadata = excluded.metadata,
                created_at = excluded.created_at,
                recalled_at = excluded.recalled_at,
                edited_at = excluded.edited_at,
                status = excluded.status
            "#,
        )
        .bind(message.local_id.to_string())
        .bind(&server_id)
        .bind(message.conversation_id.to_string())
        .bind(message.sender_id.as_str())
        .bind(kind_str(message.kind))
        .bind(&payload)
        .bind(&metadata)
        .bind(message.created_at)
        .bind(message.recalled_at)
        .bind(message.edited_at)
        .bind(message.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(())
    }

    async fn get_by_local_id(&self, local_id: &LocalId) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE local_id = ?1",
        )
        .bind(local_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        row.map(Message::try_from).transpose()
    }

    async fn get_by_server_id(&self, server_id: &ServerId) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE server_id = ?1",
        )
        .bind(server_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        row.map(Message::try_from).transpose()
    }

    async fn query_conversation(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&LocalId>,
    ) -> Result<Vec<Message>> {
        let rows = match before {
            None => {
                sqlx::query_as::<_, MessageRow>(
                    r#"
                    SELECT * FROM messages
                    WHERE conversation_id = ?1
                    ORDER BY created_at DESC, local_id DESC
                    LIMIT ?2
                    "#,
                )
                .bind(conversation_id.to_string())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(StorageError::Database)?
            }
            Some(anchor_id) => {
                // Resolve the cursor to its (created_at, local_id) position.
                let anchor: Option<(i64, String)> = sqlx::query_as(
                    "SELECT created_at, local_id FROM messages WHERE local_id = ?1",
                )
                .bind(anchor_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::Database)?;

                let Some((anchor_at, anchor_local)) = anchor else {
                    return Ok(Vec::new());
                };

                sqlx::query_as::<_, MessageRow>(
                    r#"
                    SELECT * FROM messages
                    WHERE conversation_id = ?1
                      AND (created_at < ?2
                           OR (created_at = ?2 AND local_id < ?3))
                    ORDER BY created_at DESC, local_id DESC
                    LIMIT ?4
                    "#,
                )
                .bind(conversation_id.to_string())
                .bind(anchor_at)
                .bind(anchor_local)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(StorageError::Database)?
            }
        };

        rows.into_iter().map(Message::try_from).collect()
    }

    async fn delete_message(&self, local_id: &LocalId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE local_id = ?1")
            .bind(local_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_pending_op(&self, op: PendingOperation) -> Result<PendingOperation> {
        let _guard = self.write_lock(&op.conversation_id).await;

        let draft = op
            .draft
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::corrupt(format!("encode draft: {e}")))?;

        // Coalesce: an existing (conversation, kind, target) entry keeps its
        // identity, attempt count, and schedule; only the snapshot refreshes.
        sqlx::query(
            r#"
            INSERT INTO pending_operations
                (op_id, conversation_id, kind, target, draft,
                 attempt_count, next_retry_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(conversation_id, kind, target) DO UPDATE SET
                draft = excluded.draft
            "#,
        )
        .bind(op.op_id.to_string())
        .bind(op.conversation_id.to_string())
        .bind(op.kind.as_str())
        .bind(op.target.key())
        .bind(&draft)
        .bind(op.attempt_count as i64)
        .bind(op.next_retry_at)
        .bind(op.created_at)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        let row = sqlx::query_as::<_, PendingOpRow>(
            r#"
            SELECT * FROM pending_operations
            WHERE conversation_id = ?1 AND kind = ?2 AND target = ?3
            "#,
        )
        .bind(op.conversation_id.to_string())
        .bind(op.kind.as_str())
        .bind(op.target.key())
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        PendingOperation::try_from(row)
    }

    async fn list_pending_ops(
        &self,
        conversation_id: Option<&ConversationId>,
    ) -> Result<Vec<PendingOperation>> {
        let rows = match conversation_id {
            Some(conversation) => {
                sqlx::query_as::<_, PendingOpRow>(
                    r#"
                    SELECT * FROM pending_operations
                    WHERE conversation_id = ?1
                    ORDER BY created_at ASC, rowid ASC
                    "#,
                )
                .bind(conversation.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(StorageError::Database)?
            }
            None => {
                sqlx::query_as::<_, PendingOpRow>(
                    "SELECT * FROM pending_operations ORDER BY created_at ASC, rowid ASC",
                )
                .fetch_all(&self.pool)
                .await
                .map_err(StorageError::Database)?
            }
        };

        rows.into_iter().map(PendingOperation::try_from).collect()
    }

    async fn list_due_ops(&self, now_millis: i64) -> Result<Vec<PendingOperation>> {
        let rows = sqlx::query_as::<_, PendingOpRow>(
            r#"
            SELECT * FROM pending_operations
            WHERE next_retry_at <= ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(now_millis)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        rows.into_iter().map(PendingOperation::try_from).collect()
    }

    async fn reschedule_op(
        &self,
        op_id: &OpId,
        attempt_count: u32,
        next_retry_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE pending_operations SET attempt_count = ?2, next_retry_at = ?3 WHERE op_id = ?1",
        )
        .bind(op_id.to_string())
        .bind(attempt_count as i64)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(())
    }

    async fn remove_pending_op(&self, op_id: &OpId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pending_operations WHERE op_id = ?1")
            .bind(op_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Result<u64> {
        let _guard = self.write_lock(conversation_id).await;
        let result = sqlx::query(
            "UPDATE messages SET status = 'read'
             WHERE conversation_id = ?1 AND status = 'delivered'",
        )
        .bind(conversation_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(result.rows_affected())
    }

    async fn mark_message_read(&self, server_id: &ServerId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'read'
             WHERE server_id = ?1 AND status = 'delivered'",
        )
        .bind(server_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(result.rows_affected() > 0)
    }
}

fn kind_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Image => "image",
        MessageKind::Voice => "voice",
        MessageKind::Video => "video",
        MessageKind::File => "file",
        MessageKind::Location => "location",
        MessageKind::System => "system",
    }
}

fn parse_kind(s: &str) -> Option<MessageKind> {
    match s {
        "text" => Some(MessageKind::Text),
        "image" => Some(MessageKind::Image),
        "voice" => Some(MessageKind::Voice),
        "video" => Some(MessageKind::Video),
        "file" => Some(MessageKind::File),
        "location" => Some(MessageKind::Location),
        "system" => Some(MessageKind::System),
        _ => None,
    }
}

/// Internal row type for SQLite queries.
#[derive(sqlx::FromRow)]
struct MessageRow {
    local_id: String,
    server_id: Option<String>,
    conversation_id: String,
    sender_id: String,
    kind: String,
    payload: String,
    metadata: String,
    created_at: i64,
    recalled_at: Option<i64>,
    edited_at: Option<i64>,
    status: String,
}

impl TryFrom<MessageRow> for Message {
    type Error = StorageError;

    fn try_from(row: MessageRow) -> Result<Self> {
        let local_id = LocalId::parse(&row.local_id)
            .ok_or_else(|| StorageError::corrupt(format!("local_id: {}", row.local_id)))?;
        let conversation_id = ConversationId::parse(&row.conversation_id).ok_or_else(|| {
            StorageError::corrupt(format!("conversation_id: {}", row.conversation_id))
        })?;
        let kind = parse_kind(&row.kind)
            .ok_or_else(|| StorageError::corrupt(format!("kind: {}", row.kind)))?;
        let payload: MessagePayload = serde_json::from_str(&row.payload)
            .map_err(|e| StorageError::corrupt(format!("payload: {e}")))?;
        let metadata: BTreeMap<String, String> = serde_json::from_str(&row.metadata)
            .map_err(|e| StorageError::corrupt(format!("metadata: {e}")))?;
        let status = DeliveryStatus::parse(&row.status)
            .ok_or_else(|| StorageError::corrupt(format!("status: {}", row.status)))?;

        Ok(Message {
            local_id,
            server_id: row.server_id.map(ServerId::new),
            conversation_id,
            sender_id: UserId::new(row.sender_id),
            kind,
            payload,
            metadata,
            created_at: row.created_at,
            recalled_at: row.recalled_at,
            edited_at: row.edited_at,
            status,
        })
    }
}

/// Internal row type for the pending-operations table.
#[derive(sqlx::FromRow)]
struct PendingOpRow {
    op_id: String,
    conversation_id: String,
    kind: String,
    target: String,
    draft: Option<String>,
    attempt_count: i64,
    next_retry_at: i64,
    created_at: i64,
}

impl TryFrom<PendingOpRow> for PendingOperation {
    type Error = StorageError;

    fn try_from(row: PendingOpRow) -> Result<Self> {
        let op_id = OpId::parse(&row.op_id)
            .ok_or_else(|| StorageError::corrupt(format!("op_id: {}", row.op_id)))?;
        let conversation_id = ConversationId::parse(&row.conversation_id).ok_or_else(|| {
            StorageError::corrupt(format!("conversation_id: {}", row.conversation_id))
        })?;
        let kind = OperationKind::parse(&row.kind)
            .ok_or_else(|| StorageError::corrupt(format!("op kind: {}", row.kind)))?;
        let target = OpTarget::parse(&row.target)
            .ok_or_else(|| StorageError::corrupt(format!("op target: {}", row.target)))?;
        let draft = row
            .draft
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StorageError::corrupt(format!("draft: {e}")))?;

        Ok(PendingOperation {
            op_id,
            conversation_id,
            kind,
            target,
            draft,
            attempt_count: row.attempt_count as u32,
            next_retry_at: row.next_retry_at,
            created_at: row.created_at,
        })
    }
}
