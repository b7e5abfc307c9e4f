// Core domain types shared across gridsync crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default name given to documents created without one.
pub const DEFAULT_DOCUMENT_NAME: &str = "Untitled Table";
/// Default grid size for new documents.
pub const DEFAULT_ROW_COUNT: i32 = 3;
pub const DEFAULT_COL_COUNT: i32 = 3;

/// A collaboratively edited grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub row_count: i32,
    pub col_count: i32,
    /// Shared secret required to join the real-time session. `None` means unprotected.
    pub secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// The secret a connecting client must present, if any.
    ///
    /// A stored empty string is treated the same as no secret.
    pub fn required_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|secret| !secret.is_empty())
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            row_count: self.row_count,
            col_count: self.col_count,
            has_secret: self.required_secret().is_some(),
            created_at: self.created_at,
        }
    }
}

/// Public view of a document. Never carries the secret itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub id: String,
    pub name: String,
    pub row_count: i32,
    pub col_count: i32,
    pub has_secret: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields accepted when creating a document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rows: Option<i32>,
    #[serde(default)]
    pub cols: Option<i32>,
    #[serde(default)]
    pub secret: Option<String>,
}

impl NewDocument {
    /// Apply creation defaults: blank name becomes [`DEFAULT_DOCUMENT_NAME`],
    /// missing or negative sizes fall back to 3x3, a blank secret becomes `None`.
    pub fn resolved(&self) -> (String, i32, i32, Option<String>) {
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_DOCUMENT_NAME)
            .to_string();
        let rows = self.rows.filter(|rows| *rows >= 0).unwrap_or(DEFAULT_ROW_COUNT);
        let cols = self.cols.filter(|cols| *cols >= 0).unwrap_or(DEFAULT_COL_COUNT);
        let secret = self.secret.clone().filter(|secret| !secret.is_empty());
        (name, rows, cols, secret)
    }
}

/// One durable cell of a document grid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub row_index: i32,
    pub col_index: i32,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn document(secret: Option<&str>) -> Document {
        Document {
            id: "t1".to_string(),
            name: "Budget".to_string(),
            row_count: 2,
            col_count: 2,
            secret: secret.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn empty_stored_secret_is_unprotected() {
        assert_eq!(document(Some("")).required_secret(), None);
        assert_eq!(document(None).required_secret(), None);
        assert_eq!(document(Some("hunter2")).required_secret(), Some("hunter2"));
    }

    #[test]
    fn summary_hides_secret() {
        let summary = document(Some("hunter2")).summary();
        assert!(summary.has_secret);

        let json = serde_json::to_value(&summary).expect("summary should serialize");
        assert!(json.get("secret").is_none());
        assert_eq!(json["rowCount"], 2);
        assert_eq!(json["hasSecret"], true);
    }

    #[test]
    fn new_document_defaults() {
        let (name, rows, cols, secret) = NewDocument::default().resolved();
        assert_eq!(name, DEFAULT_DOCUMENT_NAME);
        assert_eq!((rows, cols), (DEFAULT_ROW_COUNT, DEFAULT_COL_COUNT));
        assert_eq!(secret, None);
    }

    #[test]
    fn new_document_trims_name_and_drops_blank_secret() {
        let request = NewDocument {
            name: Some("  Roster  ".to_string()),
            rows: Some(10),
            cols: Some(-1),
            secret: Some(String::new()),
        };
        let (name, rows, cols, secret) = request.resolved();
        assert_eq!(name, "Roster");
        assert_eq!(rows, 10);
        assert_eq!(cols, DEFAULT_COL_COUNT);
        assert_eq!(secret, None);
    }

    #[test]
    fn cell_serializes_with_camel_case_keys() {
        let cell = Cell { row_index: 1, col_index: 2, value: "y".to_string(), updated_at: Utc::now() };
        let json = serde_json::to_value(&cell).expect("cell should serialize");
        assert_eq!(json["rowIndex"], 1);
        assert_eq!(json["colIndex"], 2);
        assert_eq!(json["value"], "y");
    }
}
