// Structural access to the replicated grid.
//
// A document's grid lives in the root array `table-data`; each element is a
// nested array of strings (one per row). Rows and cells only ever grow by
// append, a row may be shorter than its neighbours until padded.

use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, DeepObservable, Doc, Out, ReadTxn, Subscription, Transact,
    TransactionMut,
};

/// Name of the root array holding the grid rows.
pub const TABLE_DATA: &str = "table-data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    RowOutOfBounds { row: u32, rows: u32 },
    ColumnOutOfBounds { row: u32, col: u32, cols: u32 },
    NotARow { row: u32 },
}

impl std::fmt::Display for GridError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RowOutOfBounds { row, rows } => {
                write!(f, "row {row} is out of bounds for a grid with {rows} rows")
            }
            Self::ColumnOutOfBounds { row, col, cols } => {
                write!(f, "column {col} is out of bounds for row {row} with {cols} cells")
            }
            Self::NotARow { row } => write!(f, "element {row} of the grid is not a row array"),
        }
    }
}

impl std::error::Error for GridError {}

/// Handle on a document's `table-data` array.
///
/// Obtain it with no transaction open on the document; all reads and writes
/// then go through caller-provided transactions.
pub struct TableGrid {
    rows: ArrayRef,
}

impl TableGrid {
    pub fn new(doc: &Doc) -> Self {
        Self { rows: doc.get_or_insert_array(TABLE_DATA) }
    }

    pub fn row_count<T: ReadTxn>(&self, txn: &T) -> u32 {
        self.rows.len(txn)
    }

    /// Append an empty row and return it.
    pub fn append_row(&self, txn: &mut TransactionMut) -> ArrayRef {
        self.rows.push_back(txn, ArrayPrelim::default())
    }

    /// Append a cell to the end of `row`.
    pub fn append_cell(
        &self,
        txn: &mut TransactionMut,
        row: u32,
        value: &str,
    ) -> Result<(), GridError> {
        let row_ref = self.row(txn, row)?;
        row_ref.push_back(txn, value.to_string());
        Ok(())
    }

    /// Overwrite the cell at `(row, col)`. Appending at `col == len` is allowed.
    pub fn replace_cell_at(
        &self,
        txn: &mut TransactionMut,
        row: u32,
        col: u32,
        value: &str,
    ) -> Result<(), GridError> {
        let row_ref = self.row(txn, row)?;
        let cols = row_ref.len(txn);
        if col > cols {
            return Err(GridError::ColumnOutOfBounds { row, col, cols });
        }
        if col < cols {
            row_ref.remove(txn, col);
        }
        row_ref.insert(txn, col, value.to_string());
        Ok(())
    }

    /// Grow the grid to at least `rows` rows and pad every row to at least
    /// `cols` cells with empty strings.
    pub fn ensure_shape(
        &self,
        txn: &mut TransactionMut,
        rows: u32,
        cols: u32,
    ) -> Result<(), GridError> {
        while self.row_count(txn) < rows {
            self.append_row(txn);
        }
        for row in 0..self.row_count(txn) {
            self.pad_row(txn, row, cols)?;
        }
        Ok(())
    }

    /// Pad `row` with empty strings until it holds at least `len` cells.
    pub fn pad_row(&self, txn: &mut TransactionMut, row: u32, len: u32) -> Result<(), GridError> {
        let row_ref = self.row(txn, row)?;
        while row_ref.len(txn) < len {
            row_ref.push_back(txn, String::new());
        }
        Ok(())
    }

    /// Register `on_change` for every mutation below the grid (row growth and
    /// cell edits alike). Dropping the returned subscription unsubscribes.
    pub fn subscribe_deep<F>(&self, on_change: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.rows.observe_deep(move |_txn, _events| on_change())
    }

    pub fn read_matrix<T: ReadTxn>(&self, txn: &T) -> Vec<Vec<String>> {
        read_rows(&self.rows, txn)
    }

    fn row<T: ReadTxn>(&self, txn: &T, row: u32) -> Result<ArrayRef, GridError> {
        match self.rows.get(txn, row) {
            Some(Out::YArray(row_ref)) => Ok(row_ref),
            Some(_) => Err(GridError::NotARow { row }),
            None => Err(GridError::RowOutOfBounds { row, rows: self.rows.len(txn) }),
        }
    }
}

/// Read the grid of `doc` without creating the root array when it is missing.
pub fn read_matrix(doc: &Doc) -> Vec<Vec<String>> {
    let txn = doc.transact();
    match txn.get_array(TABLE_DATA) {
        Some(rows) => read_rows(&rows, &txn),
        None => Vec::new(),
    }
}

fn read_rows<T: ReadTxn>(rows: &ArrayRef, txn: &T) -> Vec<Vec<String>> {
    (0..rows.len(txn))
        .map(|row| match rows.get(txn, row) {
            Some(Out::YArray(row_ref)) => (0..row_ref.len(txn))
                .map(|col| row_ref.get(txn, col).map(|value| cell_text(txn, value)).unwrap_or_default())
                .collect(),
            // Keep indices aligned: anything that is not a row reads as an empty row.
            _ => Vec::new(),
        })
        .collect()
}

fn cell_text<T: ReadTxn>(txn: &T, value: Out) -> String {
    match value {
        Out::Any(Any::String(text)) => text.to_string(),
        Out::Any(Any::Null) | Out::Any(Any::Undefined) => String::new(),
        other => other.to_string(txn),
    }
}
