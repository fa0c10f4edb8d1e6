//! In-memory spreadsheet for tests

use super::sheet_client::{SheetClient, SheetError, SheetRow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Spreadsheet kept in memory.
///
/// Row numbers start at 2 because row 1 of a real sheet is the header.
#[derive(Default)]
pub struct MemorySheetClient {
    sheets: Mutex<HashMap<String, Vec<Vec<String>>>>,
    latency: Option<Duration>,
    failures: AtomicUsize,
    /// Number of calls made, failed ones included
    pub calls: AtomicUsize,
}

const FIRST_DATA_ROW: usize = 2;

impl MemorySheetClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, like a remote spreadsheet
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `n` calls as unavailable
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Snapshot of a sheet's data rows
    pub fn rows(&self, sheet: &str) -> Vec<Vec<String>> {
        self.sheets
            .lock()
            .unwrap()
            .get(sheet)
            .cloned()
            .unwrap_or_default()
    }

    async fn enter(&self) -> Result<(), SheetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SheetError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    fn matching(&self, sheet: &str, key: &str) -> Vec<SheetRow> {
        self.sheets
            .lock()
            .unwrap()
            .get(sheet)
            .map(|rows| {
                rows.iter()
                    .enumerate()
                    .filter(|(_, cells)| cells.first().map(String::as_str) == Some(key))
                    .map(|(i, cells)| SheetRow {
                        row_number: i + FIRST_DATA_ROW,
                        cells: cells.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SheetClient for MemorySheetClient {
    async fn find_row(&self, sheet: &str, key: &str) -> Result<Option<SheetRow>, SheetError> {
        self.enter().await?;
        Ok(self.matching(sheet, key).into_iter().next())
    }

    async fn find_rows(&self, sheet: &str, key: &str) -> Result<Vec<SheetRow>, SheetError> {
        self.enter().await?;
        Ok(self.matching(sheet, key))
    }

    async fn update_row(
        &self,
        sheet: &str,
        row_number: usize,
        cells: Vec<String>,
    ) -> Result<(), SheetError> {
        self.enter().await?;
        let mut sheets = self.sheets.lock().unwrap();
        let slot = row_number
            .checked_sub(FIRST_DATA_ROW)
            .and_then(|i| sheets.get_mut(sheet).and_then(|rows| rows.get_mut(i)))
            .ok_or_else(|| SheetError::Rejected(format!("row {row_number} out of range")))?;
        *slot = cells;
        Ok(())
    }

    async fn append_row(&self, sheet: &str, cells: Vec<String>) -> Result<usize, SheetError> {
        self.enter().await?;
        let mut sheets = self.sheets.lock().unwrap();
        let rows = sheets.entry(sheet.to_string()).or_default();
        rows.push(cells);
        Ok(rows.len() - 1 + FIRST_DATA_ROW)
    }
}
