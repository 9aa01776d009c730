use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::{OptionExt, ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, DecodeJsonSnafu, EncodeJsonSnafu,
    InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::types::{
    ConversationBatch, ConversationRecord, DurableMessage, MessageRole, MessageStatus,
    NewDurableMessage, assign_message_ids,
};
use super::{BoxFuture, ConversationSaver, MessageBackend, unix_timestamp_millis};

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, reasoning, model, provider, parent_id, is_main_branch, status, attachments_json, citations_json, metadata_json, created_at";

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One long-lived connection: in-memory databases vanish with their connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "sqlite storage opened");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn insert_batch(&self, batch: ConversationBatch) -> StorageResult<ConversationId> {
        ensure!(
            !batch.messages.is_empty(),
            ConflictSnafu {
                stage: "sqlite-save-conversation",
                entity: "conversation",
                details: "conversation batch has no messages".to_string(),
            }
        );

        let conversation_id = ConversationId::new_v7();
        let now = unix_timestamp_millis();
        let message_count = batch.messages.len();

        // Whole batch in one transaction; dropping `tx` on error rolls back.
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "save-conversation-begin",
        })?;

        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(conversation_id.as_str())
        .bind(&batch.user_id)
        .bind(&batch.title)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "save-conversation-insert-conversation",
        })?;

        for (index, (message_id, message)) in
            assign_message_ids(batch.messages).into_iter().enumerate()
        {
            let seq = usize_to_i64(index + 1, "save-conversation-seq")?;
            let row = EncodedMessage::encode(message)?;
            sqlx::query(
                "INSERT INTO messages (id, conversation_id, seq, role, content, reasoning, model, provider, parent_id, is_main_branch, status, attachments_json, citations_json, metadata_json, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.as_str())
            .bind(conversation_id.as_str())
            .bind(seq)
            .bind(row.role)
            .bind(row.content)
            .bind(row.reasoning)
            .bind(row.model)
            .bind(row.provider)
            .bind(row.parent_id)
            .bind(row.is_main_branch)
            .bind(MessageStatus::Done.as_str())
            .bind(row.attachments_json)
            .bind(row.citations_json)
            .bind(row.metadata_json)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "save-conversation-insert-message",
            })?;
        }

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "save-conversation-commit",
        })?;

        tracing::info!(
            conversation_id = %conversation_id,
            message_count,
            "conversation saved"
        );
        Ok(conversation_id)
    }

    async fn conversation_exists(
        &self,
        conversation_id: &ConversationId,
        stage: &'static str,
    ) -> StorageResult<bool> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM conversations WHERE id = ?")
            .bind(conversation_id.as_str())
            .fetch_one(&self.pool)
            .await
            .context(SqliteQuerySnafu { stage })?;
        Ok(count > 0)
    }

    async fn fetch_message(&self, message_id: &MessageId) -> StorageResult<DurableMessage> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "fetch-message-query",
        })?
        .context(NotFoundSnafu {
            stage: "fetch-message",
            entity: "message",
            id: message_id.to_string(),
        })?;
        message_row_to_document(row)
    }
}

impl ConversationSaver for SqliteStorage {
    fn save_conversation(
        &self,
        batch: ConversationBatch,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationId>>> {
        Box::pin(async move { self.insert_batch(batch).await.map(Some) })
    }
}

impl MessageBackend for SqliteStorage {
    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<DurableMessage>>> {
        Box::pin(async move {
            ensure!(
                self.conversation_exists(&conversation_id, "message-list-conversation")
                    .await?,
                NotFoundSnafu {
                    stage: "message-list",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
            );

            let rows = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY seq ASC"
            ))
            .bind(conversation_id.as_str())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_document).collect()
        })
    }

    fn append_message(
        &self,
        conversation_id: ConversationId,
        message: NewDurableMessage,
    ) -> BoxFuture<'_, StorageResult<DurableMessage>> {
        Box::pin(async move {
            ensure!(
                self.conversation_exists(&conversation_id, "message-append-conversation")
                    .await?,
                NotFoundSnafu {
                    stage: "message-append",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
            );

            let message_id = MessageId::new_v7();
            let now = unix_timestamp_millis();
            let row = EncodedMessage::encode(message)?;
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            let next_seq = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?",
            )
            .bind(conversation_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-next-seq",
            })?;

            sqlx::query(
                "INSERT INTO messages (id, conversation_id, seq, role, content, reasoning, model, provider, parent_id, is_main_branch, status, attachments_json, citations_json, metadata_json, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.as_str())
            .bind(conversation_id.as_str())
            .bind(next_seq)
            .bind(row.role)
            .bind(row.content)
            .bind(row.reasoning)
            .bind(row.model)
            .bind(row.provider)
            .bind(row.parent_id)
            .bind(row.is_main_branch)
            .bind(MessageStatus::Done.as_str())
            .bind(row.attachments_json)
            .bind(row.citations_json)
            .bind(row.metadata_json)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(conversation_id.as_str())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-append-touch-conversation",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            self.fetch_message(&message_id).await
        })
    }

    fn update_message_content(
        &self,
        message_id: MessageId,
        content: String,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE messages SET content = ? WHERE id = ?")
                .bind(content)
                .bind(message_id.as_str())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-update-content",
                })?;

            ensure!(
                result.rows_affected() > 0,
                NotFoundSnafu {
                    stage: "message-update-content",
                    entity: "message",
                    id: message_id.to_string(),
                }
            );
            Ok(())
        })
    }

    fn delete_message(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(message_id.as_str())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete",
                })?;

            ensure!(
                result.rows_affected() > 0,
                NotFoundSnafu {
                    stage: "message-delete",
                    entity: "message",
                    id: message_id.to_string(),
                }
            );
            Ok(())
        })
    }

    fn list_conversations(
        &self,
        user_id: String,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT c.id, c.user_id, c.title, c.created_at, c.updated_at, COUNT(m.id) AS message_count FROM conversations c LEFT JOIN messages m ON m.conversation_id = c.id WHERE c.user_id = ? GROUP BY c.id ORDER BY c.updated_at DESC, c.id DESC",
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }
}

struct EncodedMessage {
    role: &'static str,
    content: String,
    reasoning: Option<String>,
    model: Option<String>,
    provider: Option<String>,
    parent_id: Option<String>,
    is_main_branch: bool,
    attachments_json: Option<String>,
    citations_json: Option<String>,
    metadata_json: Option<String>,
    created_at: i64,
}

impl EncodedMessage {
    fn encode(message: NewDurableMessage) -> StorageResult<Self> {
        Ok(Self {
            role: message.role.as_str(),
            attachments_json: encode_json_list(&message.attachments, "attachments")?,
            citations_json: encode_json_list(&message.citations, "citations")?,
            metadata_json: message
                .metadata
                .as_ref()
                .map(|metadata| {
                    serde_json::to_string(metadata).context(EncodeJsonSnafu {
                        stage: "encode-message-metadata",
                        field: "metadata",
                    })
                })
                .transpose()?,
            content: message.content,
            reasoning: message.reasoning,
            model: message.model,
            provider: message.provider,
            parent_id: message.parent_id.map(String::from),
            is_main_branch: message.is_main_branch.unwrap_or(true),
            created_at: message.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    reasoning: Option<String>,
    model: Option<String>,
    provider: Option<String>,
    parent_id: Option<String>,
    is_main_branch: bool,
    status: Option<String>,
    attachments_json: Option<String>,
    citations_json: Option<String>,
    metadata_json: Option<String>,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    user_id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
    message_count: i64,
}

fn message_row_to_document(row: MessageRow) -> StorageResult<DurableMessage> {
    let role = MessageRole::parse(&row.role).context(InvariantViolationSnafu {
        stage: "message-row-role",
        details: format!("unknown message role '{}'", row.role),
    })?;

    Ok(DurableMessage {
        id: MessageId::parse(&row.id)?,
        creation_time: row.created_at as f64,
        conversation_id: Some(ConversationId::parse(&row.conversation_id)?),
        role,
        content: row.content,
        reasoning: row.reasoning,
        model: row.model,
        provider: row.provider,
        parent_id: row.parent_id.map(MessageId::from),
        is_main_branch: Some(row.is_main_branch),
        status: row.status.map(MessageStatus::from),
        attachments: decode_json_column(row.attachments_json, "attachments")?,
        citations: decode_json_column(row.citations_json, "citations")?,
        metadata: decode_json_column(row.metadata_json, "metadata")?,
        created_at: Some(row.created_at),
    })
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        user_id: row.user_id,
        title: row.title,
        created_at: row.created_at,
        updated_at: row.updated_at,
        message_count: i64_to_u64(row.message_count, "conversation-row-message-count")?,
    })
}

fn encode_json_list<T: Serialize>(
    values: &[T],
    field: &'static str,
) -> StorageResult<Option<String>> {
    if values.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(values)
        .map(Some)
        .context(EncodeJsonSnafu {
            stage: "encode-json-column",
            field,
        })
}

fn decode_json_column<T: DeserializeOwned>(
    raw: Option<String>,
    field: &'static str,
) -> StorageResult<Option<T>> {
    raw.map(|raw| {
        serde_json::from_str(&raw).context(DecodeJsonSnafu {
            stage: "decode-json-column",
            field,
        })
    })
    .transpose()
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn usize_to_i64(value: usize, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("sequence '{value}' overflows sqlite integer"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
