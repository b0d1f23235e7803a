use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use mentora_schema::{
    AccessLevel, DocumentStatus, KnowledgeArticle, KnowledgeBase, KnowledgeDocument,
};

use crate::db::Database;
use crate::users::parse_sqlite_datetime;
use crate::{embedding_to_json, json_to_embedding};

const DOCUMENT_COLUMNS: &str = "id, kb_id, owner_id, file_name, blob_key, blob_public_url, mime, \
                                folder_id, status, status_message, total_chunks, created_at";

fn row_to_document(row: &Row) -> rusqlite::Result<KnowledgeDocument> {
    Ok(KnowledgeDocument {
        id: row.get(0)?,
        kb_id: row.get(1)?,
        owner_id: row.get(2)?,
        file_name: row.get(3)?,
        blob_key: row.get(4)?,
        blob_public_url: row.get(5)?,
        mime: row.get(6)?,
        folder_id: row.get(7)?,
        status: DocumentStatus::parse(&row.get::<_, String>(8)?),
        status_message: row.get(9)?,
        total_chunks: row.get(10)?,
        created_at: parse_sqlite_datetime(&row.get::<_, String>(11)?),
    })
}

fn row_to_kb(row: &Row) -> rusqlite::Result<KnowledgeBase> {
    Ok(KnowledgeBase {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        access: AccessLevel::parse(&row.get::<_, String>(4)?),
        created_at: parse_sqlite_datetime(&row.get::<_, String>(5)?),
    })
}

#[derive(Clone)]
pub struct KnowledgeRepo {
    db: Database,
}

impl KnowledgeRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ------------------------------------------------------------------
    // Knowledge bases
    // ------------------------------------------------------------------

    pub async fn create_kb(
        &self,
        owner_id: i64,
        name: &str,
        description: Option<&str>,
        access: AccessLevel,
    ) -> Result<KnowledgeBase> {
        let name = name.to_owned();
        let description = description.map(str::to_owned);
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO knowledge_bases(owner_id, name, description, access) VALUES (?1, ?2, ?3, ?4)",
                    params![owner_id, name, description, access.as_str()],
                )?;
                let id = conn.last_insert_rowid();
                get_kb(conn, id)?.ok_or_else(|| anyhow!("knowledge base {id} vanished after insert"))
            })
            .await
    }

    pub async fn get_kb(&self, kb_id: i64) -> Result<Option<KnowledgeBase>> {
        self.db.call(move |conn| get_kb(conn, kb_id)).await
    }

    pub async fn list_kbs(&self, owner_id: i64) -> Result<Vec<KnowledgeBase>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_id, name, description, access, created_at
                     FROM knowledge_bases WHERE owner_id = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![owner_id], row_to_kb)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    /// Filter the requested kb ids down to the ones the caller may
    /// read: owned, or public. Unknown ids are dropped silently so the
    /// caller cannot probe for existence.
    pub async fn accessible_kb_ids(&self, user_id: i64, requested: Vec<i64>) -> Result<Vec<i64>> {
        if requested.is_empty() {
            return Ok(Vec::new());
        }
        self.db
            .call(move |conn| {
                let mut out = Vec::new();
                let mut stmt = conn.prepare(
                    "SELECT owner_id, access FROM knowledge_bases WHERE id = ?1",
                )?;
                for kb_id in requested {
                    let found = stmt
                        .query_row(params![kb_id], |row| {
                            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                        })
                        .optional()?;
                    if let Some((owner_id, access)) = found {
                        if owner_id == user_id || AccessLevel::parse(&access) == AccessLevel::Public
                        {
                            out.push(kb_id);
                        }
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Delete a knowledge base and everything it owns in one
    /// transaction. Returns the blob keys of the deleted documents so
    /// the caller can schedule compensation deletes.
    pub async fn delete_kb(&self, kb_id: i64, owner_id: i64) -> Result<Vec<String>> {
        self.db
            .transaction(move |tx| {
                let owned: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM knowledge_bases WHERE id = ?1 AND owner_id = ?2",
                        params![kb_id, owner_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                if owned.is_none() {
                    return Err(anyhow!("knowledge base not found"));
                }

                let mut blob_keys = Vec::new();
                let mut stmt =
                    tx.prepare("SELECT blob_key FROM knowledge_documents WHERE kb_id = ?1")?;
                let rows = stmt.query_map(params![kb_id], |r| r.get::<_, String>(0))?;
                for row in rows {
                    blob_keys.push(row?);
                }
                drop(stmt);

                delete_vec_rows_for_kb(tx, kb_id)?;
                tx.execute("DELETE FROM document_chunks WHERE kb_id = ?1", params![kb_id])?;
                tx.execute(
                    "DELETE FROM knowledge_documents WHERE kb_id = ?1",
                    params![kb_id],
                )?;
                tx.execute(
                    "DELETE FROM knowledge_articles WHERE kb_id = ?1",
                    params![kb_id],
                )?;
                tx.execute("DELETE FROM kb_folders WHERE kb_id = ?1", params![kb_id])?;
                tx.execute("DELETE FROM knowledge_bases WHERE id = ?1", params![kb_id])?;

                Ok(blob_keys)
            })
            .await
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_document(
        &self,
        kb_id: i64,
        owner_id: i64,
        file_name: &str,
        blob_key: &str,
        blob_public_url: &str,
        mime: &str,
        folder_id: Option<i64>,
    ) -> Result<KnowledgeDocument> {
        let file_name = file_name.to_owned();
        let blob_key = blob_key.to_owned();
        let blob_public_url = blob_public_url.to_owned();
        let mime = mime.to_owned();
        self.db
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO knowledge_documents
                        (kb_id, owner_id, file_name, blob_key, blob_public_url, mime, folder_id)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    params![kb_id, owner_id, file_name, blob_key, blob_public_url, mime, folder_id],
                )?;
                let id = conn.last_insert_rowid();
                get_document(conn, id)?.ok_or_else(|| anyhow!("document {id} vanished after insert"))
            })
            .await
    }

    pub async fn get_document(&self, document_id: i64) -> Result<Option<KnowledgeDocument>> {
        self.db
            .call(move |conn| get_document(conn, document_id))
            .await
    }

    /// Delete the row the ingestion pipeline created when the blob
    /// upload itself failed; nothing else references it yet.
    pub async fn delete_document_row(&self, document_id: i64) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM knowledge_documents WHERE id = ?1",
                    params![document_id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_document_status(
        &self,
        document_id: i64,
        status: DocumentStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let message = message.map(str::to_owned);
        self.db
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE knowledge_documents SET status = ?1, status_message = ?2 WHERE id = ?3",
                    params![status.as_str(), message, document_id],
                )?;
                if updated == 0 {
                    return Err(anyhow!("document {document_id} not found"));
                }
                Ok(())
            })
            .await
    }

    pub async fn complete_document(&self, document_id: i64, total_chunks: i64) -> Result<()> {
        self.db
            .call(move |conn| {
                let updated = conn.execute(
                    r#"
                    UPDATE knowledge_documents
                    SET status = 'completed', status_message = NULL, total_chunks = ?1
                    WHERE id = ?2
                    "#,
                    params![total_chunks, document_id],
                )?;
                if updated == 0 {
                    return Err(anyhow!("document {document_id} not found"));
                }
                Ok(())
            })
            .await
    }

    /// Delete a document and its chunks in one transaction. Returns the
    /// blob key so the caller can delete (or schedule deletion of) the
    /// backing blob.
    pub async fn delete_document(&self, document_id: i64, owner_id: i64) -> Result<String> {
        self.db
            .transaction(move |tx| {
                let blob_key: Option<String> = tx
                    .query_row(
                        "SELECT blob_key FROM knowledge_documents WHERE id = ?1 AND owner_id = ?2",
                        params![document_id, owner_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                let blob_key = blob_key.ok_or_else(|| anyhow!("document not found"))?;

                delete_vec_rows_for_document(tx, document_id)?;
                tx.execute(
                    "DELETE FROM document_chunks WHERE document_id = ?1",
                    params![document_id],
                )?;
                tx.execute(
                    "DELETE FROM knowledge_documents WHERE id = ?1",
                    params![document_id],
                )?;
                Ok(blob_key)
            })
            .await
    }

    pub async fn list_documents(&self, kb_id: i64) -> Result<Vec<KnowledgeDocument>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM knowledge_documents WHERE kb_id = ?1 ORDER BY id"
                ))?;
                let rows = stmt.query_map(params![kb_id], row_to_document)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    // ------------------------------------------------------------------
    // Articles
    // ------------------------------------------------------------------

    pub async fn create_article(
        &self,
        kb_id: i64,
        owner_id: i64,
        title: &str,
        content: &str,
        embedding: Vec<f32>,
    ) -> Result<i64> {
        let title = title.to_owned();
        let content = content.to_owned();
        self.db
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO knowledge_articles(kb_id, owner_id, title, content, embedding)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    params![kb_id, owner_id, title, content, embedding_to_json(&embedding)],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Edits to any text that feeds the embedding re-embed; the caller
    /// passes the fresh vector alongside the new content.
    pub async fn update_article(
        &self,
        article_id: i64,
        owner_id: i64,
        title: &str,
        content: &str,
        embedding: Vec<f32>,
    ) -> Result<()> {
        let title = title.to_owned();
        let content = content.to_owned();
        self.db
            .call(move |conn| {
                let updated = conn.execute(
                    r#"
                    UPDATE knowledge_articles
                    SET title = ?1, content = ?2, embedding = ?3, updated_at = datetime('now')
                    WHERE id = ?4 AND owner_id = ?5
                    "#,
                    params![title, content, embedding_to_json(&embedding), article_id, owner_id],
                )?;
                if updated == 0 {
                    return Err(anyhow!("article not found"));
                }
                Ok(())
            })
            .await
    }

    pub async fn get_article(&self, article_id: i64) -> Result<Option<KnowledgeArticle>> {
        self.db
            .call(move |conn| {
                let article = conn
                    .query_row(
                        r#"
                        SELECT id, kb_id, owner_id, title, content, embedding, updated_at
                        FROM knowledge_articles WHERE id = ?1
                        "#,
                        params![article_id],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, i64>(1)?,
                                row.get::<_, i64>(2)?,
                                row.get::<_, String>(3)?,
                                row.get::<_, String>(4)?,
                                row.get::<_, String>(5)?,
                                row.get::<_, String>(6)?,
                            ))
                        },
                    )
                    .optional()?;
                match article {
                    Some((id, kb_id, owner_id, title, content, embedding_json, updated_at)) => {
                        Ok(Some(KnowledgeArticle {
                            id,
                            kb_id,
                            owner_id,
                            title,
                            content,
                            embedding: json_to_embedding(&embedding_json)?,
                            updated_at: parse_sqlite_datetime(&updated_at),
                        }))
                    }
                    None => Ok(None),
                }
            })
            .await
    }
}

pub(crate) fn get_kb(conn: &Connection, kb_id: i64) -> Result<Option<KnowledgeBase>> {
    let kb = conn
        .query_row(
            "SELECT id, owner_id, name, description, access, created_at
             FROM knowledge_bases WHERE id = ?1",
            params![kb_id],
            row_to_kb,
        )
        .optional()?;
    Ok(kb)
}

pub(crate) fn get_document(conn: &Connection, document_id: i64) -> Result<Option<KnowledgeDocument>> {
    let doc = conn
        .query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM knowledge_documents WHERE id = ?1"),
            params![document_id],
            row_to_document,
        )
        .optional()?;
    Ok(doc)
}

fn chunks_vec_exists(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_vec'",
        [],
        |r| r.get(0),
    )
    .unwrap_or(false)
}

fn delete_vec_rows_for_document(conn: &Connection, document_id: i64) -> Result<()> {
    if chunks_vec_exists(conn) {
        conn.execute(
            "DELETE FROM chunks_vec WHERE chunk_id IN
                (SELECT id FROM document_chunks WHERE document_id = ?1)",
            params![document_id],
        )?;
    }
    Ok(())
}

fn delete_vec_rows_for_kb(conn: &Connection, kb_id: i64) -> Result<()> {
    if chunks_vec_exists(conn) {
        conn.execute(
            "DELETE FROM chunks_vec WHERE chunk_id IN
                (SELECT id FROM document_chunks WHERE kb_id = ?1)",
            params![kb_id],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepo;

    async fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let user = UserRepo::new(db.clone()).create("owner").await.unwrap();
        (db, user.id)
    }

    #[tokio::test]
    async fn document_lifecycle() {
        let (db, owner) = setup().await;
        let repo = KnowledgeRepo::new(db);
        let kb = repo
            .create_kb(owner, "notes", None, AccessLevel::Private)
            .await
            .unwrap();

        let doc = repo
            .create_document(
                kb.id,
                owner,
                "intro.txt",
                "knowledge_documents/abc.txt",
                "https://blobs.example.com/knowledge_documents/abc.txt",
                "text/plain",
                None,
            )
            .await
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert_eq!(doc.total_chunks, 0);

        repo.set_document_status(doc.id, DocumentStatus::Processing, Some("downloading"))
            .await
            .unwrap();
        let mid = repo.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(mid.status, DocumentStatus::Processing);
        assert_eq!(mid.status_message.as_deref(), Some("downloading"));

        repo.complete_document(doc.id, 3).await.unwrap();
        let done = repo.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(done.status, DocumentStatus::Completed);
        assert_eq!(done.total_chunks, 3);
        assert!(done.status_message.is_none());
    }

    #[tokio::test]
    async fn delete_document_returns_blob_key() {
        let (db, owner) = setup().await;
        let repo = KnowledgeRepo::new(db);
        let kb = repo
            .create_kb(owner, "notes", None, AccessLevel::Private)
            .await
            .unwrap();
        let doc = repo
            .create_document(kb.id, owner, "a.txt", "knowledge_documents/a", "u", "text/plain", None)
            .await
            .unwrap();

        let key = repo.delete_document(doc.id, owner).await.unwrap();
        assert_eq!(key, "knowledge_documents/a");
        assert!(repo.get_document(doc.id).await.unwrap().is_none());

        // Wrong owner or missing id both read as "not found".
        let err = repo.delete_document(doc.id, owner).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn accessible_kb_ids_respects_ownership_and_access() {
        let (db, owner) = setup().await;
        let other = UserRepo::new(db.clone()).create("other").await.unwrap();
        let repo = KnowledgeRepo::new(db);

        let mine = repo
            .create_kb(owner, "mine", None, AccessLevel::Private)
            .await
            .unwrap();
        let theirs_private = repo
            .create_kb(other.id, "theirs", None, AccessLevel::Private)
            .await
            .unwrap();
        let theirs_public = repo
            .create_kb(other.id, "shared", None, AccessLevel::Public)
            .await
            .unwrap();

        let visible = repo
            .accessible_kb_ids(owner, vec![mine.id, theirs_private.id, theirs_public.id, 404])
            .await
            .unwrap();
        assert_eq!(visible, vec![mine.id, theirs_public.id]);
    }

    #[tokio::test]
    async fn article_update_replaces_embedding() {
        let (db, owner) = setup().await;
        let repo = KnowledgeRepo::new(db);
        let kb = repo
            .create_kb(owner, "kb", None, AccessLevel::Private)
            .await
            .unwrap();

        let id = repo
            .create_article(kb.id, owner, "Alpha", "first", vec![1.0, 0.0])
            .await
            .unwrap();
        repo.update_article(id, owner, "Alpha", "second", vec![0.0, 1.0])
            .await
            .unwrap();

        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.content, "second");
        assert_eq!(article.embedding, vec![0.0, 1.0]);
    }
}
