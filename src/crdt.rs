use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use futures_util::StreamExt;
use rusqlite::{params, OptionalExtension};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::IntervalStream;
use tracing::instrument;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::error::{EngineError, Result};
use crate::store::LocalStore;

/// CRDT document lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocState {
    Open,
    Hydrating,
    Live,
    Persisting,
    Destroyed,
}

/// Persistence cadence between durable snapshots; the broadcast path
/// carries incremental bytes in between.
const SNAPSHOT_INTERVAL: StdDuration = StdDuration::from_secs(30);

/// Thin wrapper around a `yrs::Doc`: the engine never reimplements CRDT
/// merge logic, it only owns the snapshot table, the pending-update
/// spool, and the broadcast transport.
pub struct CrdtDocument {
    pub doc_id: String,
    pub page_id: String,
    pub owner_id: String,
    doc: yrs::Doc,
    state: std::sync::Mutex<DocState>,
    updates_tx: broadcast::Sender<Vec<u8>>,
}

impl CrdtDocument {
    fn new(doc_id: String, page_id: String, owner_id: String) -> Self {
        let (updates_tx, _) = broadcast::channel(256);
        Self {
            doc_id,
            page_id,
            owner_id,
            doc: yrs::Doc::new(),
            state: std::sync::Mutex::new(DocState::Open),
            updates_tx,
        }
    }

    pub fn state(&self) -> DocState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: DocState) {
        *self.state.lock().unwrap() = s;
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<Vec<u8>> {
        self.updates_tx.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn doc(&self) -> &yrs::Doc {
        &self.doc
    }

    /// `encodeState()`: a full update encoding the document's entire
    /// current state.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// `encodeStateVector()`.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// `applyUpdate(update)`. Republishes the raw bytes on the broadcast
    /// transport so other local subscribers (e.g. a realtime relay) can
    /// forward it without re-encoding.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update).map_err(|e| EngineError::Schema(format!("crdt update decode: {e}")))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| EngineError::Schema(format!("crdt update apply: {e}")))?;
        drop(txn);
        let _ = self.updates_tx.send(update.to_vec());
        Ok(())
    }

    /// `diffUpdate(remoteVector)`: the update needed to bring a peer at
    /// `remote_state_vector` up to date with this document.
    pub fn diff_update(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| EngineError::Schema(format!("crdt state vector decode: {e}")))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }
}

/// Owns the durable snapshot table, the pending-update spool, and the
/// set of live [`CrdtDocument`]s.
pub struct CrdtManager {
    store: Arc<LocalStore>,
    open_docs: Mutex<HashMap<String, Arc<CrdtDocument>>>,
}

impl CrdtManager {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store, open_docs: Mutex::new(HashMap::new()) }
    }

    pub fn init_schema(&self) -> Result<()> {
        self.store.connection().execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS crdt_snapshots (
    doc_id TEXT NOT NULL,
    page_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    state BLOB NOT NULL,
    state_vector BLOB NOT NULL,
    size INTEGER NOT NULL,
    device_id TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (page_id, owner_id)
);
CREATE TABLE IF NOT EXISTS crdt_pending_updates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id TEXT NOT NULL,
    update BLOB NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_crdt_pending_doc ON crdt_pending_updates(doc_id);
"#,
        )?;
        Ok(())
    }

    /// Open (or return the already-open) document for `(page_id,
    /// owner_id)`, hydrating from the durable snapshot plus any
    /// crash-recovery updates spooled since it.
    #[instrument(skip(self))]
    pub async fn open(&self, doc_id: &str, page_id: &str, owner_id: &str, device_id: &str) -> Result<Arc<CrdtDocument>> {
        let mut docs = self.open_docs.lock().await;
        if let Some(existing) = docs.get(doc_id) {
            return Ok(Arc::clone(existing));
        }

        let document = Arc::new(CrdtDocument::new(doc_id.to_string(), page_id.to_string(), owner_id.to_string()));
        document.set_state(DocState::Hydrating);

        if let Some((snapshot, _sv, _size, _device, _updated_at)) = self.load_snapshot(page_id, owner_id)? {
            document.apply_update(&snapshot)?;
        }
        for update in self.load_pending(doc_id)? {
            document.apply_update(&update)?;
        }

        document.set_state(DocState::Live);
        docs.insert(doc_id.to_string(), Arc::clone(&document));

        let doc_clone = Arc::clone(&document);
        let device_id = device_id.to_string();
        let page_id = page_id.to_string();
        let owner_id = owner_id.to_string();
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            periodic_persist(doc_clone, store, page_id, owner_id, device_id).await;
        });

        Ok(document)
    }

    /// Append an incoming update to the crash-recovery spool; called
    /// between snapshot cadences so a crash mid-session doesn't lose
    /// updates that haven't been snapshotted yet.
    pub fn spool_update(&self, doc_id: &str, update: &[u8]) -> Result<()> {
        self.store.connection().execute(
            "INSERT INTO crdt_pending_updates (doc_id, update, created_at) VALUES (?1, ?2, ?3)",
            params![doc_id, update, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn load_snapshot(&self, page_id: &str, owner_id: &str) -> Result<Option<(Vec<u8>, Vec<u8>, i64, String, i64)>> {
        Ok(self
            .store
            .connection()
            .query_row(
                "SELECT state, state_vector, size, device_id, updated_at
                 FROM crdt_snapshots WHERE page_id = ?1 AND owner_id = ?2",
                params![page_id, owner_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()?)
    }

    fn load_pending(&self, doc_id: &str) -> Result<Vec<Vec<u8>>> {
        let conn = self.store.connection();
        let mut stmt = conn.prepare("SELECT update FROM crdt_pending_updates WHERE doc_id = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map(params![doc_id], |r| r.get::<_, Vec<u8>>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn persist_snapshot(store: &LocalStore, doc: &CrdtDocument, page_id: &str, owner_id: &str, device_id: &str) -> Result<()> {
        let state = doc.encode_state();
        let sv = doc.encode_state_vector();
        let size = state.len() as i64;
        store.connection().execute(
            "INSERT INTO crdt_snapshots (doc_id, page_id, owner_id, state, state_vector, size, device_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(page_id, owner_id) DO UPDATE SET
                state=excluded.state, state_vector=excluded.state_vector,
                size=excluded.size, device_id=excluded.device_id, updated_at=excluded.updated_at",
            params![
                doc.doc_id,
                page_id,
                owner_id,
                state,
                sv,
                size,
                device_id,
                chrono::Utc::now().timestamp_millis(),
            ],
        )?;
        store
            .connection()
            .execute("DELETE FROM crdt_pending_updates WHERE doc_id = ?1", params![doc.doc_id])?;
        Ok(())
    }

    /// `destroy()`: drop the in-memory document, leaving the last
    /// snapshot durable.
    pub async fn destroy(&self, doc_id: &str) {
        let mut docs = self.open_docs.lock().await;
        if let Some(doc) = docs.remove(doc_id) {
            doc.set_state(DocState::Destroyed);
        }
    }
}

async fn periodic_persist(doc: Arc<CrdtDocument>, store: Arc<LocalStore>, page_id: String, owner_id: String, device_id: String) {
    let mut ticks = IntervalStream::new(tokio::time::interval(SNAPSHOT_INTERVAL));
    while ticks.next().await.is_some() {
        if doc.state() == DocState::Destroyed {
            return;
        }
        doc.set_state(DocState::Persisting);
        if let Err(e) = CrdtManager::persist_snapshot(&store, &doc, &page_id, &owner_id, &device_id) {
            tracing::warn!(error = %e, "crdt snapshot persist failed");
        }
        doc.set_state(DocState::Live);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn hydrate_then_apply_update_round_trips() {
        let store = Arc::new(LocalStore::open_in_memory(&Config::default()).unwrap());
        let manager = CrdtManager::new(Arc::clone(&store));
        manager.init_schema().unwrap();

        let doc = manager.open("doc1", "page1", "u1", "dev-a").await.unwrap();
        assert_eq!(doc.state(), DocState::Live);

        let writer = yrs::Doc::new();
        {
            let text = writer.get_or_insert_text("body");
            let mut txn = writer.transact_mut();
            text.insert(&mut txn, 0, "hello");
        }
        let update = writer.transact().encode_state_as_update_v1(&StateVector::default());
        doc.apply_update(&update).unwrap();

        let txn = doc.doc().transact();
        let text = doc.doc().get_or_insert_text("body").get_string(&txn);
        assert_eq!(text, "hello");
    }
}
