use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

/// One row: the system columns plus whatever domain fields the table
/// declares, all carried as a single JSON object so the conflict resolver
/// can iterate "the union of keys" directly without a separate schema
/// description at merge time.
#[derive(Debug, Clone, PartialEq)]
pub struct Record(pub Map<String, Value>);

impl Record {
    pub fn new(id: impl Into<String>, user_id: Option<&str>, device_id: &str) -> Self {
        let now = Utc::now();
        let mut map = Map::new();
        map.insert("id".into(), Value::String(id.into()));
        if let Some(uid) = user_id {
            map.insert("user_id".into(), Value::String(uid.to_string()));
        }
        map.insert("created_at".into(), Value::from(now.timestamp_millis()));
        map.insert("updated_at".into(), Value::from(now.timestamp_millis()));
        map.insert("deleted".into(), Value::Bool(false));
        map.insert("_version".into(), Value::from(1_i64));
        map.insert("device_id".into(), Value::String(device_id.to_string()));
        Self(map)
    }

    pub fn from_value(v: Value) -> Result<Self> {
        match v {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(EngineError::LocalStore("record is not a JSON object".into())),
        }
    }

    pub fn id(&self) -> &str {
        self.0.get("id").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.0.get("user_id").and_then(Value::as_str)
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.0
            .get("updated_at")
            .and_then(Value::as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
    }

    pub fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.0.insert("updated_at".into(), Value::from(at.timestamp_millis()));
    }

    pub fn deleted(&self) -> bool {
        self.0.get("deleted").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        self.0.insert("deleted".into(), Value::Bool(deleted));
    }

    pub fn version(&self) -> i64 {
        self.0.get("_version").and_then(Value::as_i64).unwrap_or(1)
    }

    pub fn set_version(&mut self, v: i64) {
        self.0.insert("_version".into(), Value::from(v));
    }

    pub fn device_id(&self) -> Option<&str> {
        self.0.get("device_id").and_then(Value::as_str)
    }

    pub fn set_device_id(&mut self, device_id: &str) {
        self.0.insert("device_id".into(), Value::String(device_id.to_string()));
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.0.insert(field.to_string(), value);
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// System and policy columns that are never subject to field-level diffing
/// in the conflict resolver.
pub fn always_excluded_fields() -> &'static [&'static str] {
    &["id", "_version"]
}
