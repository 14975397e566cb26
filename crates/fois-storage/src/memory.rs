use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use fois_core::{format_sink_date, ColumnType, Dataset, TDATE_COLUMN};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{aligned_text_rows, unknown_columns, Sink, SinkError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTable {
    pub columns: Vec<(String, ColumnType)>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl MemoryTable {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// In-process sink with the same create-once schema rule as the row store.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<BTreeMap<String, MemoryTable>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn table(&self, name: &str) -> Option<MemoryTable> {
        self.tables.lock().await.get(name).cloned()
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.tables.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn describe(&self) -> &str {
        "memory"
    }

    async fn exists(&self, dataset: &str, date: NaiveDate) -> Result<bool, SinkError> {
        let tables = self.tables.lock().await;
        let Some(table) = tables.get(dataset) else {
            return Ok(false);
        };
        let Some(idx) = table.columns.iter().position(|(name, _)| name == TDATE_COLUMN) else {
            return Ok(false);
        };
        let wanted = format_sink_date(date);
        Ok(table
            .rows
            .iter()
            .any(|row| row[idx].as_deref() == Some(wanted.as_str())))
    }

    async fn store(&self, dataset: &str, data: &Dataset) -> Result<usize, SinkError> {
        let mut tables = self.tables.lock().await;
        let table = tables.entry(dataset.to_string()).or_insert_with(|| {
            debug!(dataset, "creating in-memory table");
            MemoryTable {
                columns: data.column_types(),
                rows: Vec::new(),
            }
        });

        let names = table.column_names();
        let unknown = unknown_columns(&names, data);
        if !unknown.is_empty() {
            return Err(SinkError::SchemaMismatch {
                table: dataset.to_string(),
                columns: unknown.into_iter().map(str::to_string).collect(),
            });
        }

        let rows = aligned_text_rows(&names, data);
        let written = rows.len();
        table.rows.extend(rows);
        Ok(written)
    }
}
