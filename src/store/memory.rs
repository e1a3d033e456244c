//! In-memory record store for local runs and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Record, RecordStore, Table};

/// Keeps every table as a plain row list, mirroring the append/scan behavior
/// of the spreadsheet backend it stands in for.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, Vec<Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table with records, replacing its current contents.
    pub async fn seed(&self, table: Table, records: Vec<Record>) {
        self.tables.write().await.insert(table, records);
    }
}

fn key_matches(record: &Record, key_field: &str, key: &str) -> bool {
    record
        .get(key_field)
        .map(|v| match v {
            serde_json::Value::String(s) => s == key,
            other => other.to_string() == key,
        })
        .unwrap_or(false)
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, table: Table, key: &str) -> Option<Record> {
        let tables = self.tables.read().await;
        tables
            .get(&table)?
            .iter()
            .find(|r| key_matches(r, table.key_field(), key))
            .cloned()
    }

    async fn insert(&self, table: Table, record: Record) -> bool {
        self.tables.write().await.entry(table).or_default().push(record);
        true
    }

    async fn update(&self, table: Table, key: &str, fields: Record) -> bool {
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(&table) else {
            return false;
        };
        let Some(row) = rows
            .iter_mut()
            .find(|r| key_matches(r, table.key_field(), key))
        else {
            tracing::warn!("Record {} not found in {}", key, table);
            return false;
        };
        for (name, value) in fields {
            row.insert(name, value);
        }
        true
    }

    async fn list(&self, table: Table) -> Vec<Record> {
        self.tables
            .read()
            .await
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }
}
