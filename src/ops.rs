use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// The closed set of intent types the engine can queue and push.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Create,
    Set,
    Increment,
    Delete,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Create => "create",
            OpType::Set => "set",
            OpType::Increment => "increment",
            OpType::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "create" => OpType::Create,
            "set" => OpType::Set,
            "increment" => OpType::Increment,
            "delete" => OpType::Delete,
            other => return Err(EngineError::LocalStore(format!("unknown op_type {other:?}"))),
        })
    }
}

/// One outbox entry: an intended change, durably queued, awaiting push.
/// `value` carries the operation's payload: the full record (minus `id`)
/// for `create`; a single-field or multi-field JSON object for `set`;
/// `{"field": name, "delta": n}` for `increment`; unused for `delete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub seq: i64,
    pub table: String,
    pub entity_id: String,
    pub op_type: OpType,
    pub field: Option<String>,
    pub value: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub retries: i32,
}

impl Operation {
    /// For `set`, the set of fields this operation touches -- used by the
    /// conflict resolver's tier 3 ("if the field has any pending local
    /// operation -> local value wins").
    pub fn touched_fields(&self) -> Vec<String> {
        match self.op_type {
            OpType::Set => match &self.value {
                Some(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
                _ => self.field.clone().into_iter().collect(),
            },
            OpType::Increment => self.field.clone().into_iter().collect(),
            OpType::Create | OpType::Delete => Vec::new(),
        }
    }

    /// Read a `set`'s value for a given field, whether it was logged as a
    /// single-field pair or a multi-field object.
    pub fn field_value(&self, field: &str) -> Option<&serde_json::Value> {
        match (&self.field, &self.value) {
            (Some(f), Some(v)) if f == field => Some(v),
            (None, Some(serde_json::Value::Object(map))) => map.get(field),
            _ => None,
        }
    }

    pub fn increment_delta(&self) -> Option<f64> {
        if self.op_type != OpType::Increment {
            return None;
        }
        self.value.as_ref().and_then(|v| v.as_f64())
    }
}
