//! Record store — the tabular persistence seam.
//!
//! One client interface covers all five entity tables; callers never see
//! transport errors. A failed read is `None`/empty, a failed write is
//! `false`, and the workflow carries on either way.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

/// A single row, keyed by field name.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// The entity tables the funnel reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Leads,
    Pets,
    Services,
    Appointments,
    Brands,
}

impl Table {
    /// Table name as it appears in the backing store.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Leads => "Leads",
            Self::Pets => "Pets",
            Self::Services => "Services",
            Self::Appointments => "Appointments",
            Self::Brands => "Brands",
        }
    }

    /// The business-identifier field records in this table are keyed by.
    ///
    /// Pets and appointments are keyed by the owning lead, one row per lead
    /// in this scope.
    pub fn key_field(&self) -> &'static str {
        match self {
            Self::Leads | Self::Pets | Self::Appointments => "lead_id",
            Self::Services => "service_id",
            Self::Brands => "brand_id",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Backend-agnostic record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch the record whose key field equals `key`.
    async fn get(&self, table: Table, key: &str) -> Option<Record>;

    /// Append a new record. Returns false if the store is unavailable.
    async fn insert(&self, table: Table, record: Record) -> bool;

    /// Merge `fields` into the record keyed by `key`. Returns false if the
    /// record is missing or the store is unavailable.
    async fn update(&self, table: Table, key: &str, fields: Record) -> bool;

    /// Fetch every record in the table.
    async fn list(&self, table: Table) -> Vec<Record>;
}

/// A grooming service offering, parsed leniently from a catalog record.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServiceRecord {
    pub service_id: String,
    pub title: String,
    pub description: String,
    pub base_price: Option<f64>,
    pub duration_min: Option<u32>,
}

impl ServiceRecord {
    /// Build from a raw record. Spreadsheet-backed stores hand everything
    /// back as strings, so numeric fields are parsed both ways.
    pub fn from_record(record: &Record) -> Option<Self> {
        let service_id = string_field(record, "service_id")?;
        let title = string_field(record, "title")?;
        Some(Self {
            service_id,
            title,
            description: string_field(record, "description").unwrap_or_default(),
            base_price: number_field(record, "base_price"),
            duration_min: number_field(record, "duration_min").map(|v| v as u32),
        })
    }
}

pub(crate) fn string_field(record: &Record, name: &str) -> Option<String> {
    let value = record.get(name)?;
    let text = match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() { None } else { Some(text) }
}

pub(crate) fn number_field(record: &Record, name: &str) -> Option<f64> {
    match record.get(name)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
