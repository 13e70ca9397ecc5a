use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::error::{EngineError, Result};

/// How a table's rows are owned. Direct ownership carries a `user_id`
/// column on the row itself; inherited ownership walks a single declared
/// FK to a parent table that is itself owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Direct,
    Inherited { parent_table: String, fk_column: String },
}

/// Declarative per-table policy.
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub name: String,
    pub columns: Vec<String>,
    pub ownership: Ownership,
    pub is_singleton: bool,
    pub exclude_from_conflict: HashSet<String>,
    pub numeric_merge_fields: HashSet<String>,
}

impl TableConfig {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            ownership: Ownership::Direct,
            is_singleton: false,
            exclude_from_conflict: HashSet::new(),
            numeric_merge_fields: HashSet::new(),
        }
    }

    pub fn inherited(mut self, parent_table: impl Into<String>, fk_column: impl Into<String>) -> Self {
        self.ownership = Ownership::Inherited {
            parent_table: parent_table.into(),
            fk_column: fk_column.into(),
        };
        self
    }

    pub fn singleton(mut self) -> Self {
        self.is_singleton = true;
        self
    }

    pub fn exclude_from_conflict(mut self, fields: impl IntoIterator<Item = &'static str>) -> Self {
        self.exclude_from_conflict.extend(fields.into_iter().map(String::from));
        self
    }

    pub fn numeric_merge_fields(mut self, fields: impl IntoIterator<Item = &'static str>) -> Self {
        self.numeric_merge_fields.extend(fields.into_iter().map(String::from));
        self
    }
}

/// System columns present on every synced table.
pub const SYSTEM_COLUMNS: &[&str] = &[
    "id",
    "user_id",
    "created_at",
    "updated_at",
    "deleted",
    "_version",
    "device_id",
];

/// Top-level declarative configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub prefix: String,
    pub tables: Vec<TableConfig>,
    pub sync_debounce_ms: u64,
    pub sync_interval_ms: u64,
    pub tombstone_max_age_days: u32,
    pub visibility_sync_min_away_ms: u64,
    pub online_reconnect_cooldown_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: "app".to_string(),
            tables: Vec::new(),
            sync_debounce_ms: 2_000,
            sync_interval_ms: 15 * 60 * 1_000,
            tombstone_max_age_days: 30,
            visibility_sync_min_away_ms: 5 * 60 * 1_000,
            online_reconnect_cooldown_ms: 2 * 60 * 1_000,
        }
    }
}

impl Config {
    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// One-time schema validation at start. Rejects duplicate table names,
    /// a `numericMergeFields` entry that isn't a declared column, and a
    /// `parent` FK pointing at an undeclared table, before any I/O happens.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for t in &self.tables {
            if !seen.insert(t.name.as_str()) {
                return Err(EngineError::Config(format!("duplicate table {:?}", t.name)));
            }
            for field in &t.numeric_merge_fields {
                if !t.columns.iter().any(|c| c == field) {
                    return Err(EngineError::Config(format!(
                        "table {:?} declares numeric_merge_field {:?} which is not a column",
                        t.name, field
                    )));
                }
            }
            if let Ownership::Inherited { parent_table, .. } = &t.ownership {
                if !self.tables.iter().any(|p| &p.name == parent_table) {
                    return Err(EngineError::Config(format!(
                        "table {:?} has parent {:?} which is not declared",
                        t.name, parent_table
                    )));
                }
            }
        }
        Ok(())
    }

    /// Deterministic hash of the declared store shape. Drives
    /// auto-versioned schema upgrades: a changed hash means a new version
    /// is declared above the previously observed one. A SHA-256 digest over
    /// a canonical encoding, not `std::hash::Hash` -- the latter is not
    /// guaranteed stable across process runs or compiler versions and so
    /// cannot drive a durable on-disk version number.
    pub fn shape_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.prefix.as_bytes());
        let mut tables: Vec<&TableConfig> = self.tables.iter().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        for t in tables {
            hasher.update(t.name.as_bytes());
            let mut cols = t.columns.clone();
            cols.sort();
            for c in &cols {
                hasher.update(c.as_bytes());
            }
            match &t.ownership {
                Ownership::Direct => hasher.update(b"direct"),
                Ownership::Inherited { parent_table, fk_column } => {
                    hasher.update(b"inherited");
                    hasher.update(parent_table.as_bytes());
                    hasher.update(fk_column.as_bytes());
                }
            }
            hasher.update([t.is_singleton as u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}
