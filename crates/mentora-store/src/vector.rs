use anyhow::{anyhow, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use mentora_schema::DocumentChunk;

use crate::db::Database;
use crate::{embedding_to_json, is_zero_vector, json_to_embedding};

/// Chunk payload for bulk insert; ids are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub document_id: i64,
    pub owner_id: i64,
    pub kb_id: i64,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Filter predicates for a top-K query. `owner_id` is always enforced.
#[derive(Debug, Clone)]
pub struct ChunkFilter {
    pub owner_id: i64,
    pub kb_ids: Option<Vec<i64>>,
    pub document_ids: Option<Vec<i64>>,
}

impl ChunkFilter {
    pub fn owner(owner_id: i64) -> Self {
        Self {
            owner_id,
            kb_ids: None,
            document_ids: None,
        }
    }

    pub fn with_kb_ids(mut self, kb_ids: Vec<i64>) -> Self {
        self.kb_ids = Some(kb_ids);
        self
    }

    pub fn with_document_ids(mut self, document_ids: Vec<i64>) -> Self {
        self.document_ids = Some(document_ids);
        self
    }
}

/// Per-owner vector index over document chunks. Rows live in
/// `document_chunks` with a JSON-encoded embedding column; non-zero
/// embeddings are mirrored into the sqlite-vec `chunks_vec` virtual
/// table for accelerated KNN when no narrowing filter applies.
#[derive(Clone)]
pub struct VectorIndex {
    db: Database,
}

impl VectorIndex {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create (or recreate on dimension change) the vec0 table.
    pub async fn ensure_vec_table(&self, dimensions: usize) -> Result<()> {
        self.db
            .call(move |conn| ensure_vec_table(conn, dimensions))
            .await
    }

    /// Bulk insert chunks with their embeddings in one transaction.
    /// Returns the assigned chunk ids in input order.
    pub async fn insert_chunks(&self, chunks: Vec<NewChunk>) -> Result<Vec<i64>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        self.db
            .transaction(move |tx| {
                let vec_dims = current_vec_dimensions(tx)?;
                let mut ids = Vec::with_capacity(chunks.len());
                for chunk in &chunks {
                    tx.execute(
                        r#"
                        INSERT INTO document_chunks
                            (document_id, owner_id, kb_id, chunk_index, text, embedding)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                        "#,
                        params![
                            chunk.document_id,
                            chunk.owner_id,
                            chunk.kb_id,
                            chunk.chunk_index,
                            chunk.text,
                            embedding_to_json(&chunk.embedding)
                        ],
                    )?;
                    let id = tx.last_insert_rowid();
                    ids.push(id);

                    // The zero-vector sentinel never participates in KNN.
                    if let Some(dims) = vec_dims {
                        if chunk.embedding.len() == dims && !is_zero_vector(&chunk.embedding) {
                            tx.execute(
                                "INSERT OR REPLACE INTO chunks_vec(chunk_id, embedding) VALUES (?1, ?2)",
                                params![id, embedding_to_json(&chunk.embedding)],
                            )?;
                        }
                    }
                }
                Ok(ids)
            })
            .await
    }

    /// Cosine-similarity top-K. Zero-vector candidates are filtered out
    /// of results; ties break by `chunk_index` ascending then
    /// `document_id` ascending for stability.
    pub async fn query_top_k(
        &self,
        query_embedding: Vec<f32>,
        filter: ChunkFilter,
        k: usize,
    ) -> Result<Vec<(DocumentChunk, f32)>> {
        if k == 0 || query_embedding.is_empty() || is_zero_vector(&query_embedding) {
            return Ok(Vec::new());
        }

        self.db
            .call(move |conn| {
                let candidates = load_candidates(conn, &filter, &query_embedding, k)?;
                let mut scored: Vec<(DocumentChunk, f32)> = Vec::new();
                for chunk in candidates {
                    if chunk.embedding.is_empty() || is_zero_vector(&chunk.embedding) {
                        continue;
                    }
                    let score = cosine_similarity(&query_embedding, &chunk.embedding);
                    scored.push((chunk, score));
                }

                scored.sort_by(|a, b| {
                    b.1.total_cmp(&a.1)
                        .then_with(|| a.0.chunk_index.cmp(&b.0.chunk_index))
                        .then_with(|| a.0.document_id.cmp(&b.0.document_id))
                });
                scored.truncate(k);
                Ok(scored)
            })
            .await
    }

    pub async fn count_for_document(&self, document_id: i64) -> Result<i64> {
        self.db
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM document_chunks WHERE document_id = ?1",
                    params![document_id],
                    |r| r.get(0),
                )?)
            })
            .await
    }
}

fn ensure_vec_table(conn: &Connection, dimensions: usize) -> Result<()> {
    if dimensions == 0 {
        return Err(anyhow!("embedding dimensions must be non-zero"));
    }

    let current_dims: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'vec_dimensions'",
            [],
            |r| r.get(0),
        )
        .optional()?;

    let needs_recreate = match current_dims {
        Some(d) => d.parse::<usize>().unwrap_or(0) != dimensions,
        None => true,
    };

    if needs_recreate {
        conn.execute_batch("DROP TABLE IF EXISTS chunks_vec;")?;
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE chunks_vec USING vec0(chunk_id INTEGER PRIMARY KEY, embedding float[{dimensions}]);"
        ))?;
        conn.execute(
            "INSERT INTO meta(key, value) VALUES('vec_dimensions', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![dimensions.to_string()],
        )?;
        tracing::info!("created chunks_vec virtual table with {dimensions} dimensions");
    }

    Ok(())
}

fn current_vec_dimensions(conn: &Connection) -> Result<Option<usize>> {
    let current: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'vec_dimensions'",
            [],
            |r| r.get(0),
        )
        .optional()?;
    Ok(current.and_then(|d| d.parse::<usize>().ok()).filter(|d| *d > 0))
}

const CHUNK_COLUMNS: &str =
    "id, document_id, owner_id, kb_id, chunk_index, text, embedding";

fn row_to_chunk(row: &rusqlite::Row) -> Result<DocumentChunk> {
    let embedding_json: String = row.get(6)?;
    Ok(DocumentChunk {
        id: row.get(0)?,
        document_id: row.get(1)?,
        owner_id: row.get(2)?,
        kb_id: row.get(3)?,
        chunk_index: row.get(4)?,
        text: row.get(5)?,
        embedding: json_to_embedding(&embedding_json)?,
    })
}

/// Load scoring candidates. With no kb/document narrowing and a live
/// vec0 table of matching width, pre-select by KNN (over-fetching so
/// owner filtering still leaves k candidates); otherwise scan the
/// SQL-filtered rows exactly.
fn load_candidates(
    conn: &Connection,
    filter: &ChunkFilter,
    query_embedding: &[f32],
    k: usize,
) -> Result<Vec<DocumentChunk>> {
    let unscoped = filter.kb_ids.is_none() && filter.document_ids.is_none();
    if unscoped {
        if let Some(dims) = current_vec_dimensions(conn)? {
            if dims == query_embedding.len() {
                let ids = knn_candidate_ids(conn, query_embedding, k.saturating_mul(8).max(32))?;
                if !ids.is_empty() {
                    return load_chunks_by_ids(conn, filter.owner_id, &ids);
                }
            }
        }
    }

    let mut sql = format!(
        "SELECT {CHUNK_COLUMNS} FROM document_chunks WHERE owner_id = ?"
    );
    let mut bind: Vec<i64> = vec![filter.owner_id];

    if let Some(kb_ids) = &filter.kb_ids {
        if kb_ids.is_empty() {
            return Ok(Vec::new());
        }
        sql.push_str(&format!(
            " AND kb_id IN ({})",
            vec!["?"; kb_ids.len()].join(", ")
        ));
        bind.extend(kb_ids.iter().copied());
    }
    if let Some(document_ids) = &filter.document_ids {
        if document_ids.is_empty() {
            return Ok(Vec::new());
        }
        sql.push_str(&format!(
            " AND document_id IN ({})",
            vec!["?"; document_ids.len()].join(", ")
        ));
        bind.extend(document_ids.iter().copied());
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(bind))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_chunk(row)?);
    }
    Ok(out)
}

fn knn_candidate_ids(conn: &Connection, query_embedding: &[f32], k: usize) -> Result<Vec<i64>> {
    let query_json = embedding_to_json(query_embedding);
    let mut stmt = conn.prepare(
        "SELECT chunk_id FROM chunks_vec WHERE embedding MATCH ?1 AND k = ?2",
    )?;
    let rows = stmt.query_map(params![query_json, k as i64], |r| r.get::<_, i64>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

fn load_chunks_by_ids(conn: &Connection, owner_id: i64, ids: &[i64]) -> Result<Vec<DocumentChunk>> {
    let sql = format!(
        "SELECT {CHUNK_COLUMNS} FROM document_chunks WHERE owner_id = ? AND id IN ({})",
        vec!["?"; ids.len()].join(", ")
    );
    let mut bind: Vec<i64> = vec![owner_id];
    bind.extend(ids.iter().copied());

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(bind))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_chunk(row)?);
    }
    Ok(out)
}

/// Raw cosine similarity in [-1, 1]. Mismatched or degenerate inputs
/// score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}
