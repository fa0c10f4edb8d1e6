//! Spreadsheet access
//!
//! The spreadsheet is reached through a small web app published from the
//! spreadsheet's scripting host. Every call is one JSON POST:
//!
//! ```text
//! {"op": "find" | "find_all" | "update" | "append",
//!  "sheet": "conversations", "key": "...", "row": 7, "cells": [...], "token": "..."}
//! ```
//!
//! and the web app answers `{"ok": true, "row": {...}, "rows": [...]}` or
//! `{"ok": false, "error": "..."}`. Rows are 1-based sheet row numbers; row 1
//! is the header. Keys are matched against the first column.

use super::StoreError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SheetError {
    #[error("Sheet service unavailable: {0}")]
    Unavailable(String),
    #[error("Sheet service rejected request: {0}")]
    Rejected(String),
}

impl From<SheetError> for StoreError {
    fn from(e: SheetError) -> Self {
        match e {
            SheetError::Unavailable(msg) => StoreError::BackendUnavailable(msg),
            SheetError::Rejected(msg) => StoreError::Rejected(msg),
        }
    }
}

/// A sheet row and its position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRow {
    pub row_number: usize,
    pub cells: Vec<String>,
}

/// Row-oriented spreadsheet operations
#[async_trait]
pub trait SheetClient: Send + Sync {
    /// First row whose key column equals `key`
    async fn find_row(&self, sheet: &str, key: &str) -> Result<Option<SheetRow>, SheetError>;

    /// All rows whose key column equals `key`, in sheet order
    async fn find_rows(&self, sheet: &str, key: &str) -> Result<Vec<SheetRow>, SheetError>;

    /// Overwrite a row in place
    async fn update_row(
        &self,
        sheet: &str,
        row_number: usize,
        cells: Vec<String>,
    ) -> Result<(), SheetError>;

    /// Append a row; returns its row number
    async fn append_row(&self, sheet: &str, cells: Vec<String>) -> Result<usize, SheetError>;
}

#[async_trait]
impl<T: SheetClient + ?Sized> SheetClient for std::sync::Arc<T> {
    async fn find_row(&self, sheet: &str, key: &str) -> Result<Option<SheetRow>, SheetError> {
        (**self).find_row(sheet, key).await
    }

    async fn find_rows(&self, sheet: &str, key: &str) -> Result<Vec<SheetRow>, SheetError> {
        (**self).find_rows(sheet, key).await
    }

    async fn update_row(
        &self,
        sheet: &str,
        row_number: usize,
        cells: Vec<String>,
    ) -> Result<(), SheetError> {
        (**self).update_row(sheet, row_number, cells).await
    }

    async fn append_row(&self, sheet: &str, cells: Vec<String>) -> Result<usize, SheetError> {
        (**self).append_row(sheet, cells).await
    }
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Serialize)]
struct SheetRequest<'a> {
    op: &'a str,
    sheet: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cells: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

impl<'a> SheetRequest<'a> {
    fn new(op: &'a str, sheet: &'a str) -> Self {
        Self {
            op,
            sheet,
            key: None,
            row: None,
            cells: None,
            token: None,
        }
    }
}

#[derive(Deserialize)]
struct WireRow {
    number: usize,
    cells: Vec<Value>,
}

impl From<WireRow> for SheetRow {
    fn from(row: WireRow) -> Self {
        Self {
            row_number: row.number,
            cells: row.cells.into_iter().map(cell_to_string).collect(),
        }
    }
}

#[derive(Deserialize)]
struct SheetResponse {
    ok: bool,
    #[serde(default)]
    row: Option<WireRow>,
    #[serde(default)]
    rows: Vec<WireRow>,
    #[serde(default)]
    error: Option<String>,
}

/// Spreadsheets type their cells; the store only deals in strings
fn cell_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Client for the spreadsheet web app
pub struct HttpSheetClient {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpSheetClient {
    pub fn new(url: String, token: Option<String>) -> Result<Self, SheetError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("relaybot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SheetError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url, token })
    }

    async fn call<'a>(&'a self, mut request: SheetRequest<'a>) -> Result<SheetResponse, SheetError> {
        request.token = self.token.as_deref();
        let start = std::time::Instant::now();

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SheetError::Unavailable(e.to_string()))?;

        let status = response.status();
        tracing::debug!(
            op = request.op,
            sheet = request.sheet,
            status = %status,
            duration_ms = %start.elapsed().as_millis(),
            "Sheet request completed"
        );

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SheetError::Unavailable(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(SheetError::Rejected(format!("HTTP {status}")));
        }

        let body: SheetResponse = response
            .json()
            .await
            .map_err(|e| SheetError::Rejected(format!("invalid response: {e}")))?;
        if !body.ok {
            return Err(SheetError::Rejected(
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(body)
    }
}

#[async_trait]
impl SheetClient for HttpSheetClient {
    async fn find_row(&self, sheet: &str, key: &str) -> Result<Option<SheetRow>, SheetError> {
        let mut request = SheetRequest::new("find", sheet);
        request.key = Some(key);
        let response = self.call(request).await?;
        Ok(response.row.map(SheetRow::from))
    }

    async fn find_rows(&self, sheet: &str, key: &str) -> Result<Vec<SheetRow>, SheetError> {
        let mut request = SheetRequest::new("find_all", sheet);
        request.key = Some(key);
        let response = self.call(request).await?;
        Ok(response.rows.into_iter().map(SheetRow::from).collect())
    }

    async fn update_row(
        &self,
        sheet: &str,
        row_number: usize,
        cells: Vec<String>,
    ) -> Result<(), SheetError> {
        let mut request = SheetRequest::new("update", sheet);
        request.row = Some(row_number);
        request.cells = Some(&cells);
        self.call(request).await?;
        Ok(())
    }

    async fn append_row(&self, sheet: &str, cells: Vec<String>) -> Result<usize, SheetError> {
        let mut request = SheetRequest::new("append", sheet);
        request.cells = Some(&cells);
        let response = self.call(request).await?;
        response
            .row
            .map(|row| row.number)
            .ok_or_else(|| SheetError::Rejected("append did not report a row".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_cells_become_strings() {
        let row: WireRow = serde_json::from_value(json!({
            "number": 4,
            "cells": ["c1", "active", "{}", 12, null]
        }))
        .unwrap();
        let row = SheetRow::from(row);
        assert_eq!(row.row_number, 4);
        assert_eq!(row.cells, vec!["c1", "active", "{}", "12", ""]);
    }

    #[test]
    fn test_request_omits_unused_fields() {
        let mut request = SheetRequest::new("find", "conversations");
        request.key = Some("c1");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json, json!({"op": "find", "sheet": "conversations", "key": "c1"}));
    }

    #[test]
    fn test_sheet_errors_map_to_store_errors() {
        assert_eq!(
            StoreError::from(SheetError::Unavailable("down".into())),
            StoreError::BackendUnavailable("down".into())
        );
        assert_eq!(
            StoreError::from(SheetError::Rejected("no such sheet".into())),
            StoreError::Rejected("no such sheet".into())
        );
    }
}
