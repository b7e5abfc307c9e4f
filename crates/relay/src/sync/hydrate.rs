// Rebuilds an empty in-memory grid from the durable cells of its document.

use gridsync_common::types::Cell;
use tracing::{info_span, Instrument};
use yrs::{Doc, Transact};

use crate::store::CellStore;
use crate::sync::grid::{GridError, TableGrid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationOutcome {
    /// The grid already had rows; nothing was written.
    AlreadyPopulated,
    Hydrated { rows: u32, cols: u32, cells: usize },
}

#[derive(Debug)]
pub enum HydrationError {
    DocumentQuery { doc_id: String, source: anyhow::Error },

    CellQuery { doc_id: String, source: anyhow::Error },

    Materialize { doc_id: String, source: GridError },
}

impl std::fmt::Display for HydrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DocumentQuery { doc_id, source } => {
                write!(f, "failed to load metadata for document {doc_id}: {source:#}")
            }
            Self::CellQuery { doc_id, source } => {
                write!(f, "failed to load cells for document {doc_id}: {source:#}")
            }
            Self::Materialize { doc_id, source } => {
                write!(f, "failed to materialize grid for document {doc_id}: {source}")
            }
        }
    }
}

impl std::error::Error for HydrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Materialize { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Grid dimensions plus the cells to place, derived from durable rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydrationPlan {
    pub rows: u32,
    pub cols: u32,
    pub cells: Vec<(u32, u32, String)>,
}

impl HydrationPlan {
    /// The target shape is the larger of the recorded counts and the extent
    /// implied by the highest stored indices. Cells with negative indices are
    /// ignored.
    pub fn new(row_count: i32, col_count: i32, stored: Vec<Cell>) -> Self {
        let mut rows = u32::try_from(row_count).unwrap_or(0);
        let mut cols = u32::try_from(col_count).unwrap_or(0);
        let mut cells = Vec::with_capacity(stored.len());

        for cell in stored {
            let (Ok(row), Ok(col)) = (u32::try_from(cell.row_index), u32::try_from(cell.col_index))
            else {
                continue;
            };
            rows = rows.max(row.saturating_add(1));
            cols = cols.max(col.saturating_add(1));
            cells.push((row, col, cell.value));
        }

        Self { rows, cols, cells }
    }
}

/// Populate `doc` from the durable store when its grid has no rows.
///
/// Must run before the document is shared or observed. Everything is written
/// in a single transaction so peers never see a half-built grid.
pub async fn hydrate_if_empty(
    store: &CellStore,
    doc_id: &str,
    doc: &Doc,
) -> Result<HydrationOutcome, HydrationError> {
    if TableGrid::new(doc).row_count(&doc.transact()) > 0 {
        return Ok(HydrationOutcome::AlreadyPopulated);
    }

    let (document, stored) = async {
        let document = store.find_document(doc_id).await.map_err(|source| {
            HydrationError::DocumentQuery { doc_id: doc_id.to_string(), source }
        })?;
        let stored = store
            .list_cells(doc_id)
            .await
            .map_err(|source| HydrationError::CellQuery { doc_id: doc_id.to_string(), source })?;
        Ok::<_, HydrationError>((document, stored))
    }
    .instrument(info_span!("relay.sync.hydrate", doc_id = %doc_id))
    .await?;

    let (row_count, col_count) =
        document.map(|document| (document.row_count, document.col_count)).unwrap_or((0, 0));
    let plan = HydrationPlan::new(row_count, col_count, stored);
    apply_plan(&TableGrid::new(doc), doc, doc_id, &plan)
}

fn apply_plan(
    grid: &TableGrid,
    doc: &Doc,
    doc_id: &str,
    plan: &HydrationPlan,
) -> Result<HydrationOutcome, HydrationError> {
    let mut txn = doc.transact_mut();
    // Someone else may have populated the grid while the store was queried.
    if grid.row_count(&txn) > 0 {
        return Ok(HydrationOutcome::AlreadyPopulated);
    }

    let materialize = |txn: &mut yrs::TransactionMut| -> Result<(), GridError> {
        grid.ensure_shape(txn, plan.rows, plan.cols)?;
        for (row, col, value) in &plan.cells {
            grid.replace_cell_at(txn, *row, *col, value)?;
        }
        Ok(())
    };
    materialize(&mut txn)
        .map_err(|source| HydrationError::Materialize { doc_id: doc_id.to_string(), source })?;

    Ok(HydrationOutcome::Hydrated { rows: plan.rows, cols: plan.cols, cells: plan.cells.len() })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use gridsync_common::types::{Cell, NewDocument};
    use proptest::prelude::*;
    use yrs::{Doc, Transact};

    use super::{hydrate_if_empty, HydrationOutcome, HydrationPlan};
    use crate::store::{CellStore, CellWrite};
    use crate::sync::grid::{read_matrix, TableGrid};
    use crate::sync::snapshot::persist_snapshot;

    fn cell(row: i32, col: i32, value: &str) -> Cell {
        Cell { row_index: row, col_index: col, value: value.to_string(), updated_at: Utc::now() }
    }

    async fn store_with(id: &str, rows: i32, cols: i32, cells: &[(i32, i32, &str)]) -> CellStore {
        let store = CellStore::memory();
        store
            .create_document_with_id(
                id,
                &NewDocument { rows: Some(rows), cols: Some(cols), ..NewDocument::default() },
            )
            .await
            .expect("document should be created");
        for (row, col, value) in cells {
            store.upsert_cell(id, CellWrite::new(*row, *col, *value)).await.expect("seed cell");
        }
        store
    }

    #[test]
    fn plan_grows_past_recorded_counts() {
        let plan = HydrationPlan::new(2, 2, vec![cell(0, 0, "x"), cell(3, 4, "far")]);
        assert_eq!((plan.rows, plan.cols), (4, 5));
        assert_eq!(plan.cells.len(), 2);
    }

    #[test]
    fn plan_skips_negative_indices() {
        let plan = HydrationPlan::new(1, 1, vec![cell(-1, 0, "bad"), cell(0, -3, "bad")]);
        assert_eq!((plan.rows, plan.cols), (1, 1));
        assert!(plan.cells.is_empty());
    }

    #[tokio::test]
    async fn hydrates_recorded_shape_and_values() {
        let store = store_with("t1", 2, 2, &[(0, 0, "x"), (1, 1, "y")]).await;
        let doc = Doc::new();

        let outcome = hydrate_if_empty(&store, "t1", &doc).await.expect("hydration");

        assert_eq!(outcome, HydrationOutcome::Hydrated { rows: 2, cols: 2, cells: 2 });
        assert_eq!(read_matrix(&doc), vec![vec!["x", ""], vec!["", "y"]]);
    }

    #[tokio::test]
    async fn hydrating_twice_does_not_duplicate_rows() {
        let store = store_with("t1", 2, 2, &[(0, 0, "x")]).await;
        let doc = Doc::new();

        hydrate_if_empty(&store, "t1", &doc).await.expect("first hydration");
        let second = hydrate_if_empty(&store, "t1", &doc).await.expect("second hydration");

        assert_eq!(second, HydrationOutcome::AlreadyPopulated);
        assert_eq!(read_matrix(&doc).len(), 2);
    }

    #[tokio::test]
    async fn populated_grid_is_left_alone() {
        let store = store_with("t1", 3, 3, &[(0, 0, "durable")]).await;
        let doc = Doc::new();
        let grid = TableGrid::new(&doc);
        {
            let mut txn = doc.transact_mut();
            grid.append_row(&mut txn);
            grid.append_cell(&mut txn, 0, "live").expect("row exists");
        }

        let outcome = hydrate_if_empty(&store, "t1", &doc).await.expect("hydration");

        assert_eq!(outcome, HydrationOutcome::AlreadyPopulated);
        assert_eq!(read_matrix(&doc), vec![vec!["live"]]);
    }

    #[tokio::test]
    async fn missing_document_hydrates_to_empty_grid() {
        let store = CellStore::memory();
        let doc = Doc::new();

        let outcome = hydrate_if_empty(&store, "ghost", &doc).await.expect("hydration");

        assert_eq!(outcome, HydrationOutcome::Hydrated { rows: 0, cols: 0, cells: 0 });
        assert!(read_matrix(&doc).is_empty());
    }

    proptest! {
        #[test]
        fn hydrated_grid_matches_stored_cells(
            entries in proptest::collection::btree_map((0i32..6, 0i32..6), "[a-z]{0,4}", 0..20),
            rows in 0i32..4,
            cols in 0i32..4,
        ) {
            let stored = entries
                .iter()
                .map(|(&(row, col), value)| cell(row, col, value))
                .collect::<Vec<_>>();
            let plan = HydrationPlan::new(rows, cols, stored);
            let doc = Doc::new();
            let grid = TableGrid::new(&doc);
            super::apply_plan(&grid, &doc, "prop", &plan).expect("plan should apply");

            let matrix = read_matrix(&doc);
            prop_assert_eq!(matrix.len() as u32, plan.rows);
            for row in &matrix {
                prop_assert_eq!(row.len() as u32, plan.cols);
            }
            for (row, col) in (0..plan.rows).flat_map(|r| (0..plan.cols).map(move |c| (r, c))) {
                let expected = entries
                    .get(&(row as i32, col as i32))
                    .map(String::as_str)
                    .unwrap_or("");
                prop_assert_eq!(matrix[row as usize][col as usize].as_str(), expected);
            }
        }
    }

    proptest! {
        #[test]
        fn flushed_grid_hydrates_back_padded(
            matrix in proptest::collection::vec(
                proptest::collection::vec("[a-z]{0,3}", 0..5),
                0..5,
            ),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime should build");
            let hydrated = runtime.block_on(async {
                let store = store_with("t1", matrix.len() as i32, 0, &[(7, 7, "stale")]).await;
                persist_snapshot(&store, "t1", &matrix).await.expect("flush should commit");

                let doc = Doc::new();
                hydrate_if_empty(&store, "t1", &doc).await.expect("hydration");
                read_matrix(&doc)
            });

            // Ragged rows come back padded with empty cells.
            let width = matrix.iter().map(Vec::len).max().unwrap_or(0);
            let expected = matrix
                .iter()
                .map(|row| {
                    let mut row = row.clone();
                    row.resize(width, String::new());
                    row
                })
                .collect::<Vec<_>>();
            prop_assert_eq!(hydrated, expected);
        }
    }
}
