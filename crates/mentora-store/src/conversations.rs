use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use mentora_schema::{
    Conversation, ConversationMessage, DocumentStatus, MessageRole, NewMessage, TemporaryFile,
};

use crate::db::Database;
use crate::{embedding_to_json, json_to_embedding};

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn row_to_conversation(row: &Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        last_updated: millis_to_datetime(row.get(3)?),
    })
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, tool_calls, tool_output, \
                               llm_type_used, llm_model_used, sent_at";

fn row_to_message(row: &Row) -> Result<ConversationMessage> {
    let tool_calls: Option<String> = row.get(4)?;
    let tool_output: Option<String> = row.get(5)?;
    Ok(ConversationMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: MessageRole::parse(&row.get::<_, String>(2)?),
        content: row.get(3)?,
        tool_calls: tool_calls.as_deref().map(serde_json::from_str).transpose()?,
        tool_output: tool_output.as_deref().map(serde_json::from_str).transpose()?,
        llm_type_used: row.get(6)?,
        llm_model_used: row.get(7)?,
        sent_at: millis_to_datetime(row.get(8)?),
    })
}

#[derive(Clone)]
pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, owner_id: i64) -> Result<Conversation> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO ai_conversations(owner_id, last_updated) VALUES (?1, ?2)",
                    params![owner_id, Utc::now().timestamp_millis()],
                )?;
                let id = conn.last_insert_rowid();
                get_conversation(conn, id)?
                    .ok_or_else(|| anyhow!("conversation {id} vanished after insert"))
            })
            .await
    }

    pub async fn get_owned(
        &self,
        conversation_id: i64,
        owner_id: i64,
    ) -> Result<Option<Conversation>> {
        self.db
            .call(move |conn| {
                let convo = get_conversation(conn, conversation_id)?;
                Ok(convo.filter(|c| c.owner_id == owner_id))
            })
            .await
    }

    pub async fn list(&self, owner_id: i64) -> Result<Vec<Conversation>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_id, title, last_updated FROM ai_conversations
                     WHERE owner_id = ?1 ORDER BY last_updated DESC",
                )?;
                let rows = stmt.query_map(params![owner_id], row_to_conversation)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    /// Chronological page of messages (oldest first).
    pub async fn list_messages(
        &self,
        conversation_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ConversationMessage>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM ai_conversation_messages
                     WHERE conversation_id = ?1
                     ORDER BY sent_at ASC, id ASC
                     LIMIT ?2 OFFSET ?3"
                ))?;
                let mut rows = stmt.query(params![conversation_id, limit, offset])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_message(row)?);
                }
                Ok(out)
            })
            .await
    }

    /// The last `n` messages, returned oldest first: the chat prefix
    /// for an agent turn.
    pub async fn recent_messages(
        &self,
        conversation_id: i64,
        n: i64,
    ) -> Result<Vec<ConversationMessage>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM (
                         SELECT {MESSAGE_COLUMNS} FROM ai_conversation_messages
                         WHERE conversation_id = ?1
                         ORDER BY sent_at DESC, id DESC
                         LIMIT ?2
                     ) ORDER BY sent_at ASC, id ASC"
                ))?;
                let mut rows = stmt.query(params![conversation_id, n])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_message(row)?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn message_count(&self, conversation_id: i64) -> Result<i64> {
        self.db
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM ai_conversation_messages WHERE conversation_id = ?1",
                    params![conversation_id],
                    |r| r.get(0),
                )?)
            })
            .await
    }

    /// Append a full turn in one transaction, running `hook` (points,
    /// achievements) against the same transaction before commit. If the
    /// hook fails the whole turn rolls back.
    pub async fn append_turn_with<F>(
        &self,
        conversation_id: i64,
        messages: Vec<NewMessage>,
        hook: F,
    ) -> Result<Vec<ConversationMessage>>
    where
        F: FnOnce(&Transaction) -> Result<()> + Send + 'static,
    {
        self.db
            .transaction(move |tx| {
                let exists: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM ai_conversations WHERE id = ?1",
                        params![conversation_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Err(anyhow!("conversation not found"));
                }

                let appended = append_messages(tx, conversation_id, &messages)?;

                tx.execute(
                    "UPDATE ai_conversations SET last_updated = ?1 WHERE id = ?2",
                    params![Utc::now().timestamp_millis(), conversation_id],
                )?;

                hook(tx)?;
                Ok(appended)
            })
            .await
    }

    pub async fn append_turn(
        &self,
        conversation_id: i64,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<ConversationMessage>> {
        self.append_turn_with(conversation_id, messages, |_| Ok(())).await
    }

    /// First non-null wins: if another writer already set a title, that
    /// title is returned instead of the candidate.
    pub async fn set_title_if_absent(
        &self,
        conversation_id: i64,
        title: &str,
    ) -> Result<String> {
        let title = title.to_owned();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE ai_conversations SET title = ?1 WHERE id = ?2 AND title IS NULL",
                    params![title, conversation_id],
                )?;
                let current: Option<String> = conn.query_row(
                    "SELECT title FROM ai_conversations WHERE id = ?1",
                    params![conversation_id],
                    |r| r.get(0),
                )?;
                current.ok_or_else(|| anyhow!("conversation title unexpectedly null"))
            })
            .await
    }

    /// Cascade delete: messages, temporary files, then the conversation
    /// row. Returns the temp-file blob keys for compensation deletes.
    pub async fn delete(&self, conversation_id: i64, owner_id: i64) -> Result<Vec<String>> {
        self.db
            .transaction(move |tx| {
                let owned: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM ai_conversations WHERE id = ?1 AND owner_id = ?2",
                        params![conversation_id, owner_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                if owned.is_none() {
                    return Err(anyhow!("conversation not found"));
                }

                let mut blob_keys = Vec::new();
                let mut stmt = tx.prepare(
                    "SELECT blob_key FROM conversation_temp_files WHERE conversation_id = ?1",
                )?;
                let rows = stmt.query_map(params![conversation_id], |r| r.get::<_, String>(0))?;
                for row in rows {
                    blob_keys.push(row?);
                }
                drop(stmt);

                tx.execute(
                    "DELETE FROM ai_conversation_messages WHERE conversation_id = ?1",
                    params![conversation_id],
                )?;
                tx.execute(
                    "DELETE FROM conversation_temp_files WHERE conversation_id = ?1",
                    params![conversation_id],
                )?;
                tx.execute(
                    "DELETE FROM ai_conversations WHERE id = ?1",
                    params![conversation_id],
                )?;
                Ok(blob_keys)
            })
            .await
    }

    // ------------------------------------------------------------------
    // Temporary files
    // ------------------------------------------------------------------

    pub async fn create_temp_file(
        &self,
        conversation_id: i64,
        owner_id: i64,
        file_name: &str,
        blob_key: &str,
        mime: &str,
    ) -> Result<TemporaryFile> {
        let file_name = file_name.to_owned();
        let blob_key = blob_key.to_owned();
        let mime = mime.to_owned();
        self.db
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO conversation_temp_files
                        (conversation_id, owner_id, file_name, blob_key, mime)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    params![conversation_id, owner_id, file_name, blob_key, mime],
                )?;
                let id = conn.last_insert_rowid();
                get_temp_file(conn, id)?
                    .ok_or_else(|| anyhow!("temporary file {id} vanished after insert"))
            })
            .await
    }

    pub async fn get_temp_file(&self, id: i64) -> Result<Option<TemporaryFile>> {
        self.db.call(move |conn| get_temp_file(conn, id)).await
    }

    pub async fn set_temp_file_status(
        &self,
        id: i64,
        status: DocumentStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let message = message.map(str::to_owned);
        self.db
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE conversation_temp_files SET status = ?1, status_message = ?2 WHERE id = ?3",
                    params![status.as_str(), message, id],
                )?;
                if updated == 0 {
                    return Err(anyhow!("temporary file {id} not found"));
                }
                Ok(())
            })
            .await
    }

    pub async fn complete_temp_file(
        &self,
        id: i64,
        extracted_text: &str,
        embedding: Vec<f32>,
    ) -> Result<()> {
        let extracted_text = extracted_text.to_owned();
        self.db
            .call(move |conn| {
                let updated = conn.execute(
                    r#"
                    UPDATE conversation_temp_files
                    SET status = 'completed', status_message = NULL,
                        extracted_text = ?1, embedding = ?2
                    WHERE id = ?3
                    "#,
                    params![extracted_text, embedding_to_json(&embedding), id],
                )?;
                if updated == 0 {
                    return Err(anyhow!("temporary file {id} not found"));
                }
                Ok(())
            })
            .await
    }

    pub async fn list_temp_files(&self, conversation_id: i64) -> Result<Vec<TemporaryFile>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, conversation_id, owner_id, file_name, blob_key, mime,
                           status, status_message, extracted_text, embedding
                    FROM conversation_temp_files
                    WHERE conversation_id = ?1
                    ORDER BY id
                    "#,
                )?;
                let mut rows = stmt.query(params![conversation_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_temp_file(row)?);
                }
                Ok(out)
            })
            .await
    }
}

/// Append messages with monotonic `sent_at`: every message gets a
/// timestamp strictly after anything already in the conversation, so
/// readers always observe a gap-free ordered prefix.
pub fn append_messages(
    tx: &Transaction,
    conversation_id: i64,
    messages: &[NewMessage],
) -> Result<Vec<ConversationMessage>> {
    let last: Option<i64> = tx
        .query_row(
            "SELECT MAX(sent_at) FROM ai_conversation_messages WHERE conversation_id = ?1",
            params![conversation_id],
            |r| r.get(0),
        )
        .optional()?
        .flatten();

    let now = Utc::now().timestamp_millis();
    let base = match last {
        Some(last) => now.max(last + 1),
        None => now,
    };

    let mut out = Vec::with_capacity(messages.len());
    for (i, message) in messages.iter().enumerate() {
        let sent_at = base + i as i64;
        let tool_calls = message
            .tool_calls
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let tool_output = message
            .tool_output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        tx.execute(
            r#"
            INSERT INTO ai_conversation_messages
                (conversation_id, role, content, tool_calls, tool_output,
                 llm_type_used, llm_model_used, sent_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                conversation_id,
                message.role.as_str(),
                message.content,
                tool_calls,
                tool_output,
                message.llm_type_used,
                message.llm_model_used,
                sent_at
            ],
        )?;
        out.push(ConversationMessage {
            id: tx.last_insert_rowid(),
            conversation_id,
            role: message.role,
            content: message.content.clone(),
            tool_calls: message.tool_calls.clone(),
            tool_output: message.tool_output.clone(),
            llm_type_used: message.llm_type_used.clone(),
            llm_model_used: message.llm_model_used.clone(),
            sent_at: millis_to_datetime(sent_at),
        });
    }
    Ok(out)
}

fn get_conversation(conn: &Connection, id: i64) -> Result<Option<Conversation>> {
    let convo = conn
        .query_row(
            "SELECT id, owner_id, title, last_updated FROM ai_conversations WHERE id = ?1",
            params![id],
            row_to_conversation,
        )
        .optional()?;
    Ok(convo)
}

fn get_temp_file(conn: &Connection, id: i64) -> Result<Option<TemporaryFile>> {
    let raw = conn
        .query_row(
            r#"
            SELECT id, conversation_id, owner_id, file_name, blob_key, mime,
                   status, status_message, extracted_text, embedding
            FROM conversation_temp_files WHERE id = ?1
            "#,
            params![id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                ))
            },
        )
        .optional()?;

    match raw {
        Some(r) => Ok(Some(temp_file_from_parts(r)?)),
        None => Ok(None),
    }
}

type TempFileParts = (
    i64,
    i64,
    i64,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
);

fn temp_file_from_parts(parts: TempFileParts) -> Result<TemporaryFile> {
    let (id, conversation_id, owner_id, file_name, blob_key, mime, status, status_message, extracted_text, embedding_json) =
        parts;
    Ok(TemporaryFile {
        id,
        conversation_id,
        owner_id,
        file_name,
        blob_key,
        mime,
        status: DocumentStatus::parse(&status),
        status_message,
        extracted_text,
        embedding: json_to_embedding(&embedding_json)?,
    })
}

fn row_to_temp_file(row: &Row) -> Result<TemporaryFile> {
    temp_file_from_parts((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}
