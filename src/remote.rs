use async_trait::async_trait;
use serde_json::Value;

use crate::error::{classify_http_status, EngineError, Result};
use crate::ops::OpType;

/// A single remote mutation to apply for one outbox operation. Every
/// mutation requests the affected row's `id` back (`RETURNING
/// id`-equivalent): a zero-row reply means the write was silently rejected
/// (e.g. by row-level security), which the push pipeline raises as an
/// authorization error rather than treating as a no-op.
pub struct MutationResult {
    /// Ids returned by the remote for rows actually affected. Empty
    /// means "zero rows" (silent RLS rejection or genuine not-found).
    pub ids: Vec<String>,
}

/// One row as returned by a pull fetch: the table-agnostic JSON document
/// plus the columns the pull pipeline needs for ordering and cursor
/// advancement.
pub struct RemoteRow {
    pub id: String,
    pub updated_at_ms: i64,
    pub deleted: bool,
    pub data: Value,
}

/// The minimal PostgREST-like profile this engine depends on. The shipped
/// adapter ([`PostgrestRemote`]) speaks to a real PostgREST-shaped HTTP
/// endpoint; tests substitute an in-memory fake implementing this same
/// trait.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Apply one outbox operation's remote side effect. `op_type` plus
    /// `field`/`value` (already JSON-encoded the way [`crate::ops::Operation`]
    /// carries them) fully describe the mutation; `create` additionally
    /// needs the full record payload.
    async fn mutate(
        &self,
        table: &str,
        entity_id: &str,
        op_type: OpType,
        field: Option<&str>,
        value: Option<&Value>,
        record: Option<&Value>,
    ) -> Result<MutationResult>;

    /// Fetch rows for `table` owned by `owner_id` with `updated_at >
    /// cursor_ms` (or all non-deleted rows when `cursor_ms` is `None`,
    /// i.e. cold-start hydration), ordered `(updated_at asc, id asc)`.
    async fn fetch_since(
        &self,
        table: &str,
        owner_id: &str,
        cursor_ms: Option<i64>,
    ) -> Result<Vec<RemoteRow>>;
}

/// Concrete [`RemoteService`] adapter for a PostgREST-shaped HTTP
/// endpoint, built on `reqwest`.
pub struct PostgrestRemote {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PostgrestRemote {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.base_url.trim_end_matches('/'), path))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Prefer", "return=representation")
    }
}

#[async_trait]
impl RemoteService for PostgrestRemote {
    async fn mutate(
        &self,
        table: &str,
        entity_id: &str,
        op_type: OpType,
        field: Option<&str>,
        value: Option<&Value>,
        record: Option<&Value>,
    ) -> Result<MutationResult> {
        let resp = match op_type {
            OpType::Create => {
                let body = record.cloned().unwrap_or(Value::Null);
                self.request(reqwest::Method::POST, table).json(&body).send().await?
            }
            OpType::Set => {
                let mut body = serde_json::Map::new();
                if let (Some(f), Some(v)) = (field, value) {
                    body.insert(f.to_string(), v.clone());
                } else if let Some(Value::Object(map)) = value {
                    body = map.clone();
                }
                self.request(reqwest::Method::PATCH, &format!("{table}?id=eq.{entity_id}"))
                    .json(&Value::Object(body))
                    .send()
                    .await?
            }
            OpType::Increment => {
                // PostgREST has no atomic increment primitive; the remote is
                // expected to expose a stored procedure (`rpc/increment_field`)
                // for this table. Callers needing true additive semantics
                // should route through their own RPC-backed RemoteService.
                let f = field.unwrap_or_default();
                let delta = value.and_then(Value::as_f64).unwrap_or(0.0);
                self.request(reqwest::Method::POST, "rpc/increment_field")
                    .json(&serde_json::json!({
                        "p_table": table,
                        "p_id": entity_id,
                        "p_field": f,
                        "p_delta": delta,
                    }))
                    .send()
                    .await?
            }
            OpType::Delete => {
                self.request(reqwest::Method::PATCH, &format!("{table}?id=eq.{entity_id}"))
                    .json(&serde_json::json!({"deleted": true}))
                    .send()
                    .await?
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http_status(status.as_u16(), &body));
        }
        let rows: Vec<Value> = resp.json().await.map_err(EngineError::from)?;
        let ids = rows
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_str).map(str::to_string))
            .collect();
        Ok(MutationResult { ids })
    }

    async fn fetch_since(
        &self,
        table: &str,
        owner_id: &str,
        cursor_ms: Option<i64>,
    ) -> Result<Vec<RemoteRow>> {
        let mut path = format!(
            "{table}?user_id=eq.{owner_id}&order=updated_at.asc,id.asc"
        );
        match cursor_ms {
            Some(ms) => path.push_str(&format!("&updated_at=gt.{ms}")),
            None => path.push_str("&deleted=eq.false"),
        }
        let resp = self.request(reqwest::Method::GET, &path).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http_status(status.as_u16(), &body));
        }
        let rows: Vec<Value> = resp.json().await.map_err(EngineError::from)?;
        rows.into_iter()
            .map(|v| {
                let id = v
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| EngineError::Schema("remote row missing id".into()))?
                    .to_string();
                let updated_at_ms = v
                    .get("updated_at")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| EngineError::Schema("remote row missing updated_at".into()))?;
                let deleted = v.get("deleted").and_then(Value::as_bool).unwrap_or(false);
                Ok(RemoteRow { id, updated_at_ms, deleted, data: v })
            })
            .collect()
    }
}
