// Durable document/cell storage.
//
// `CellStore` is the only way the relay touches persistent state. The
// Postgres variant is used in production; the memory variant backs local
// development (no database configured) and tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use gridsync_common::types::{Cell, Document, NewDocument};
use sqlx::postgres::PgPool;
use tokio::sync::RwLock;
use tracing::{info_span, Instrument};
use uuid::Uuid;

/// A single cell value addressed by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellWrite {
    pub row: i32,
    pub col: i32,
    pub value: String,
}

impl CellWrite {
    pub fn new(row: i32, col: i32, value: impl Into<String>) -> Self {
        Self { row, col, value: value.into() }
    }
}

/// One statement of an atomic cell batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellOp {
    /// Insert or overwrite the cell at `(row, col)`.
    Upsert(CellWrite),
    /// Delete every cell of the document whose position is not listed.
    RetainOnly(Vec<(i32, i32)>),
}

#[derive(Debug, Clone)]
pub enum CellStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryCellStore>>),
}

#[derive(Debug, Default)]
pub struct MemoryCellStore {
    documents: HashMap<String, Document>,
    cells: HashMap<String, BTreeMap<(i32, i32), StoredCell>>,
    committed_batches: HashMap<String, usize>,
    failing_writes: HashSet<String>,
    failing_reads: HashSet<String>,
}

#[derive(Debug, Clone)]
struct StoredCell {
    value: String,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    id: String,
    name: String,
    row_count: i32,
    col_count: i32,
    secret: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            row_count: row.row_count,
            col_count: row.col_count,
            secret: row.secret,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CellRow {
    row_index: i32,
    col_index: i32,
    value: String,
    updated_at: DateTime<Utc>,
}

impl From<CellRow> for Cell {
    fn from(row: CellRow) -> Self {
        Self {
            row_index: row.row_index,
            col_index: row.col_index,
            value: row.value,
            updated_at: row.updated_at,
        }
    }
}

impl CellStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryCellStore::default())))
    }

    pub async fn find_document(&self, id: &str) -> Result<Option<Document>> {
        match self {
            Self::Postgres(pool) => Ok(sqlx::query_as::<_, DocumentRow>(
                "
                SELECT id, name, row_count, col_count, secret, created_at
                FROM documents
                WHERE id = $1
                ",
            )
            .bind(id)
            .fetch_optional(pool)
            .instrument(info_span!("relay.db.query", query = "find_document"))
            .await
            .with_context(|| format!("failed to load document `{id}`"))?
            .map(Document::from)),
            Self::Memory(store) => {
                let store = store.read().await;
                if store.failing_reads.contains(id) {
                    bail!("read rejected for document `{id}`");
                }
                Ok(store.documents.get(id).cloned())
            }
        }
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        match self {
            Self::Postgres(pool) => Ok(sqlx::query_as::<_, DocumentRow>(
                "
                SELECT id, name, row_count, col_count, secret, created_at
                FROM documents
                ORDER BY created_at ASC, id ASC
                ",
            )
            .fetch_all(pool)
            .instrument(info_span!("relay.db.query", query = "list_documents"))
            .await
            .context("failed to list documents")?
            .into_iter()
            .map(Document::from)
            .collect()),
            Self::Memory(store) => {
                let mut documents =
                    store.read().await.documents.values().cloned().collect::<Vec<_>>();
                documents.sort_by(|lhs, rhs| {
                    lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
                });
                Ok(documents)
            }
        }
    }

    pub async fn create_document(&self, request: &NewDocument) -> Result<Document> {
        self.create_document_with_id(&Uuid::new_v4().to_string(), request).await
    }

    pub async fn create_document_with_id(
        &self,
        id: &str,
        request: &NewDocument,
    ) -> Result<Document> {
        let (name, row_count, col_count, secret) = request.resolved();

        match self {
            Self::Postgres(pool) => Ok(sqlx::query_as::<_, DocumentRow>(
                "
                INSERT INTO documents (id, name, row_count, col_count, secret)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id, name, row_count, col_count, secret, created_at
                ",
            )
            .bind(id)
            .bind(&name)
            .bind(row_count)
            .bind(col_count)
            .bind(secret.as_deref())
            .fetch_one(pool)
            .instrument(info_span!("relay.db.query", query = "insert_document"))
            .await
            .with_context(|| format!("failed to create document `{id}`"))?
            .into()),
            Self::Memory(store) => {
                let mut store = store.write().await;
                if store.documents.contains_key(id) {
                    bail!("document `{id}` already exists");
                }
                let document = Document {
                    id: id.to_string(),
                    name,
                    row_count,
                    col_count,
                    secret,
                    created_at: Utc::now(),
                };
                store.documents.insert(id.to_string(), document.clone());
                Ok(document)
            }
        }
    }

    /// Delete a document and its cells. Returns `false` when it did not exist.
    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        match self {
            Self::Postgres(pool) => {
                let result = sqlx::query("DELETE FROM documents WHERE id = $1")
                    .bind(id)
                    .execute(pool)
                    .instrument(info_span!("relay.db.query", query = "delete_document"))
                    .await
                    .with_context(|| format!("failed to delete document `{id}`"))?;
                Ok(result.rows_affected() > 0)
            }
            Self::Memory(store) => {
                let mut store = store.write().await;
                store.cells.remove(id);
                Ok(store.documents.remove(id).is_some())
            }
        }
    }

    /// All durable cells of a document ordered by `(row, col)`.
    pub async fn list_cells(&self, document_id: &str) -> Result<Vec<Cell>> {
        match self {
            Self::Postgres(pool) => Ok(sqlx::query_as::<_, CellRow>(
                "
                SELECT row_index, col_index, value, updated_at
                FROM cells
                WHERE document_id = $1
                ORDER BY row_index ASC, col_index ASC
                ",
            )
            .bind(document_id)
            .fetch_all(pool)
            .instrument(info_span!("relay.db.query", query = "list_cells"))
            .await
            .with_context(|| format!("failed to list cells for document `{document_id}`"))?
            .into_iter()
            .map(Cell::from)
            .collect()),
            Self::Memory(store) => Ok(store
                .read()
                .await
                .cells
                .get(document_id)
                .map(|cells| {
                    cells
                        .iter()
                        .map(|(&(row_index, col_index), stored)| Cell {
                            row_index,
                            col_index,
                            value: stored.value.clone(),
                            updated_at: stored.updated_at,
                        })
                        .collect()
                })
                .unwrap_or_default()),
        }
    }

    pub async fn upsert_cell(&self, document_id: &str, write: CellWrite) -> Result<()> {
        self.run_atomically(document_id, vec![CellOp::Upsert(write)]).await
    }

    /// Apply `ops` to one document's cells in a single transaction.
    ///
    /// Either every operation is visible afterwards or none is.
    pub async fn run_atomically(&self, document_id: &str, ops: Vec<CellOp>) -> Result<()> {
        match self {
            Self::Postgres(pool) => run_postgres_batch(pool, document_id, ops).await,
            Self::Memory(store) => store.write().await.apply_batch(document_id, ops),
        }
    }

    /// Make every subsequent batch for `document_id` fail (memory store only).
    #[cfg(test)]
    pub(crate) async fn fail_writes_for(&self, document_id: &str, failing: bool) {
        if let Self::Memory(store) = self {
            let mut store = store.write().await;
            if failing {
                store.failing_writes.insert(document_id.to_string());
            } else {
                store.failing_writes.remove(document_id);
            }
        }
    }

    /// Make every subsequent document lookup for `document_id` fail (memory store only).
    #[cfg(test)]
    pub(crate) async fn fail_reads_for(&self, document_id: &str, failing: bool) {
        if let Self::Memory(store) = self {
            let mut store = store.write().await;
            if failing {
                store.failing_reads.insert(document_id.to_string());
            } else {
                store.failing_reads.remove(document_id);
            }
        }
    }

    /// Number of batches committed for `document_id` (memory store only).
    #[cfg(test)]
    pub(crate) async fn committed_batches(&self, document_id: &str) -> usize {
        match self {
            Self::Memory(store) => {
                store.read().await.committed_batches.get(document_id).copied().unwrap_or(0)
            }
            Self::Postgres(_) => 0,
        }
    }
}

impl MemoryCellStore {
    fn apply_batch(&mut self, document_id: &str, ops: Vec<CellOp>) -> Result<()> {
        if self.failing_writes.contains(document_id) {
            bail!("write rejected for document `{document_id}`");
        }
        if !self.documents.contains_key(document_id) {
            return Err(anyhow!("document `{document_id}` does not exist"));
        }

        // Build the next state aside and swap it in so a failure leaves nothing applied.
        let mut next = self.cells.get(document_id).cloned().unwrap_or_default();
        let now = Utc::now();
        for op in ops {
            match op {
                CellOp::Upsert(write) => {
                    let unchanged =
                        next.get(&(write.row, write.col)).is_some_and(|c| c.value == write.value);
                    if !unchanged {
                        next.insert(
                            (write.row, write.col),
                            StoredCell { value: write.value, updated_at: now },
                        );
                    }
                }
                CellOp::RetainOnly(keep) => {
                    let keep = keep.into_iter().collect::<HashSet<_>>();
                    next.retain(|position, _| keep.contains(position));
                }
            }
        }

        self.cells.insert(document_id.to_string(), next);
        *self.committed_batches.entry(document_id.to_string()).or_default() += 1;
        Ok(())
    }
}

async fn run_postgres_batch(pool: &PgPool, document_id: &str, ops: Vec<CellOp>) -> Result<()> {
    async {
        let mut tx = pool
            .begin()
            .instrument(info_span!("relay.db.query", query = "begin_cell_batch_tx"))
            .await
            .context("failed to open transaction for cell batch")?;

        let mut pending_upserts = Vec::new();
        for op in ops {
            match op {
                CellOp::Upsert(write) => pending_upserts.push(write),
                CellOp::RetainOnly(keep) => {
                    upsert_postgres_cells(&mut tx, document_id, &mut pending_upserts).await?;

                    let (rows, cols): (Vec<i32>, Vec<i32>) = keep.into_iter().unzip();
                    sqlx::query(
                        "
                        DELETE FROM cells AS c
                        WHERE c.document_id = $1
                          AND NOT EXISTS (
                              SELECT 1
                              FROM UNNEST($2::int4[], $3::int4[]) AS keep(row_index, col_index)
                              WHERE keep.row_index = c.row_index
                                AND keep.col_index = c.col_index
                          )
                        ",
                    )
                    .bind(document_id)
                    .bind(rows)
                    .bind(cols)
                    .execute(&mut *tx)
                    .instrument(info_span!("relay.db.query", query = "prune_cells"))
                    .await
                    .context("failed to prune cells outside the snapshot")?;
                }
            }
        }
        upsert_postgres_cells(&mut tx, document_id, &mut pending_upserts).await?;

        tx.commit()
            .instrument(info_span!("relay.db.query", query = "commit_cell_batch_tx"))
            .await
            .context("failed to commit cell batch transaction")
    }
    .instrument(info_span!("relay.store.run_atomically", doc_id = %document_id))
    .await
}

async fn upsert_postgres_cells(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    document_id: &str,
    writes: &mut Vec<CellWrite>,
) -> Result<()> {
    if writes.is_empty() {
        return Ok(());
    }

    let mut rows = Vec::with_capacity(writes.len());
    let mut cols = Vec::with_capacity(writes.len());
    let mut values = Vec::with_capacity(writes.len());
    for write in writes.drain(..) {
        rows.push(write.row);
        cols.push(write.col);
        values.push(write.value);
    }

    sqlx::query(
        "
        INSERT INTO cells (document_id, row_index, col_index, value, updated_at)
        SELECT $1, t.row_index, t.col_index, t.value, now()
        FROM UNNEST($2::int4[], $3::int4[], $4::text[]) AS t(row_index, col_index, value)
        ON CONFLICT (document_id, row_index, col_index)
        DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
        WHERE cells.value IS DISTINCT FROM EXCLUDED.value
        ",
    )
    .bind(document_id)
    .bind(rows)
    .bind(cols)
    .bind(values)
    .execute(&mut **tx)
    .instrument(info_span!("relay.db.query", query = "upsert_cells"))
    .await
    .with_context(|| format!("failed to upsert cells for document `{document_id}`"))?;

    Ok(())
}
