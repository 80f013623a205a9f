//! The session registry: the single source of truth mapping document ids
//! to live sessions.
//!
//! Sessions are created on first join, seeded from the injected snapshot
//! store, and evicted on last leave with a background flush of the final
//! snapshot. Creation and eviction both happen under the registry's async
//! mutex, which is what makes "exactly one container per document" hold
//! under concurrent joins and leaves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::crdt::replica::Replica;
use crate::error::StorageError;
use crate::error::SyncError;
use crate::sync::session::JoinToken;
use crate::sync::session::Session;

/// Storage collaborator for seeding and flushing document snapshots.
///
/// The registry is the only caller: `load` runs at most once per session
/// creation, `flush` on session teardown. Implementations talk to whatever
/// durable store the application uses.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the persisted snapshot for a document, if one exists.
    async fn load(&self, doc: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Persist a snapshot for a document.
    async fn flush(&self, doc: &str, snapshot: &[u8]) -> Result<(), StorageError>;
}

/// In-memory snapshot store.
///
/// Mirrors running without durable storage (document state lives and dies
/// with the process) and doubles as the test store.
#[derive(Default)]
pub struct MemoryStore {
    docs: parking_lot::Mutex<FxHashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        return MemoryStore::default();
    }

    /// Peek at a stored snapshot.
    pub fn get(&self, doc: &str) -> Option<Vec<u8>> {
        return self.docs.lock().get(doc).cloned();
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, doc: &str) -> Result<Option<Vec<u8>>, StorageError> {
        return Ok(self.docs.lock().get(doc).cloned());
    }

    async fn flush(&self, doc: &str, snapshot: &[u8]) -> Result<(), StorageError> {
        self.docs.lock().insert(doc.to_string(), snapshot.to_vec());
        return Ok(());
    }
}

struct Entry {
    session: Arc<Session>,
    /// Outstanding join tokens; the session is evicted when the last one
    /// leaves.
    tokens: FxHashSet<u64>,
}

/// Maps document ids to live sessions and owns their lifecycle.
pub struct Registry {
    sessions: Mutex<FxHashMap<String, Entry>>,
    store: Arc<dyn SnapshotStore>,
    flush_attempts: u32,
    flush_backoff: Duration,
}

impl Registry {
    /// Create a registry backed by the given snapshot store.
    pub fn new(store: Arc<dyn SnapshotStore>) -> Registry {
        return Registry {
            sessions: Mutex::new(FxHashMap::default()),
            store,
            flush_attempts: 3,
            flush_backoff: Duration::from_millis(250),
        };
    }

    /// Join a document session, creating it on first join.
    ///
    /// First join seeds the container from the store; the registry lock is
    /// held across the load, so concurrent joins for the same id always
    /// observe a single container. A storage outage surfaces as a join
    /// failure; a corrupt stored snapshot falls back to an empty document.
    pub async fn join(&self, doc: &str) -> Result<(Arc<Session>, JoinToken), SyncError> {
        let mut sessions = self.sessions.lock().await;

        if let Some(entry) = sessions.get_mut(doc) {
            let token = entry.session.issue_token();
            entry.tokens.insert(token.0);
            debug!(doc, joined = entry.tokens.len(), "joined existing session");
            return Ok((entry.session.clone(), token));
        }

        let replica = match self.store.load(doc).await? {
            Some(bytes) => match Replica::from_snapshot(&bytes) {
                Ok(replica) => replica,
                Err(error) => {
                    warn!(doc, %error, "stored snapshot is corrupt, starting empty");
                    Replica::new()
                }
            },
            None => Replica::new(),
        };

        let session = Arc::new(Session::new(doc.to_string(), replica));
        let token = session.issue_token();
        let mut tokens = FxHashSet::default();
        tokens.insert(token.0);
        sessions.insert(
            doc.to_string(),
            Entry {
                session: session.clone(),
                tokens,
            },
        );
        info!(doc, "created session");
        return Ok((session, token));
    }

    /// Leave a session.
    ///
    /// The last leave evicts the session and flushes its final snapshot in
    /// a background task with bounded backoff retries; client traffic is
    /// never blocked on storage.
    pub async fn leave(&self, doc: &str, token: JoinToken) -> Result<(), SyncError> {
        let mut sessions = self.sessions.lock().await;

        let entry = sessions.get_mut(doc).ok_or_else(|| SyncError::UnknownSession {
            doc: doc.to_string(),
        })?;
        if !entry.tokens.remove(&token.0) {
            return Err(SyncError::UnknownSession {
                doc: doc.to_string(),
            });
        }
        entry.session.detach(token);

        if !entry.tokens.is_empty() {
            debug!(doc, joined = entry.tokens.len(), "left session");
            return Ok(());
        }

        let entry = match sessions.remove(doc) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        info!(doc, "last connection left, evicting session");
        self.spawn_flush(doc.to_string(), entry.session.snapshot());
        return Ok(());
    }

    fn spawn_flush(&self, doc: String, snapshot: Vec<u8>) {
        let store = self.store.clone();
        let attempts = self.flush_attempts;
        let backoff = self.flush_backoff;

        tokio::spawn(async move {
            let mut delay = backoff;
            for attempt in 1..=attempts {
                match store.flush(&doc, &snapshot).await {
                    Ok(()) => {
                        debug!(doc = doc.as_str(), "final snapshot flushed");
                        return;
                    }
                    Err(error) => {
                        warn!(doc = doc.as_str(), attempt, %error, "snapshot flush failed");
                    }
                }
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
            warn!(doc = doc.as_str(), "snapshot flush abandoned");
        });
    }

    /// Read-only snapshot access for collaborators that do not join a live
    /// session (e.g. a REST display path). Served from the live session
    /// when one exists, otherwise passed through to the store.
    pub async fn read_snapshot(&self, doc: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(entry) = self.sessions.lock().await.get(doc) {
            return Ok(Some(entry.session.snapshot()));
        }
        return self.store.load(doc).await;
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        return self.sessions.lock().await.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::clock::ReplicaId;

    fn registry() -> Registry {
        return Registry::new(Arc::new(MemoryStore::new()));
    }

    #[tokio::test]
    async fn join_creates_session_once() {
        let registry = registry();

        let (first, t1) = registry.join("doc1").await.unwrap();
        let (second, t2) = registry.join("doc1").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_ne!(t1, t2);
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn distinct_documents_get_distinct_sessions() {
        let registry = registry();

        let (a, _) = registry.join("doc1").await.unwrap();
        let (b, _) = registry.join("doc2").await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.session_count().await, 2);
    }

    #[tokio::test]
    async fn last_leave_evicts_session() {
        let registry = registry();

        let (_, t1) = registry.join("doc1").await.unwrap();
        let (_, t2) = registry.join("doc1").await.unwrap();

        registry.leave("doc1", t1).await.unwrap();
        assert_eq!(registry.session_count().await, 1);

        registry.leave("doc1", t2).await.unwrap();
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn leave_unknown_doc_fails() {
        let registry = registry();
        let result = registry.leave("nope", JoinToken(0)).await;
        assert!(matches!(result, Err(SyncError::UnknownSession { .. })));
    }

    #[tokio::test]
    async fn leave_with_stale_token_fails() {
        let registry = registry();
        let (_, token) = registry.join("doc1").await.unwrap();

        registry.leave("doc1", token).await.unwrap();
        // Session is gone; the token no longer refers to anything.
        let result = registry.leave("doc1", token).await;
        assert!(matches!(result, Err(SyncError::UnknownSession { .. })));
    }

    #[tokio::test]
    async fn rejoin_after_eviction_creates_fresh_session() {
        let registry = registry();

        let (first, token) = registry.join("doc1").await.unwrap();
        registry.leave("doc1", token).await.unwrap();

        let (second, _) = registry.join("doc1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn join_seeds_from_stored_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let mut replica = Replica::with_id(ReplicaId(1));
        replica.insert(0, b"seeded");
        store.flush("doc1", &replica.snapshot()).await.unwrap();

        let registry = Registry::new(store);
        let (session, _) = registry.join("doc1").await.unwrap();

        let restored = Replica::from_snapshot(&session.snapshot()).unwrap();
        assert_eq!(restored.to_string(), "seeded");
    }

    #[tokio::test]
    async fn corrupt_snapshot_falls_back_to_empty() {
        let store = Arc::new(MemoryStore::new());
        store.flush("doc1", b"not a snapshot").await.unwrap();

        let registry = Registry::new(store);
        let (session, _) = registry.join("doc1").await.unwrap();

        let restored = Replica::from_snapshot(&session.snapshot()).unwrap();
        assert_eq!(restored.to_string(), "");
    }

    struct OutageStore;

    #[async_trait]
    impl SnapshotStore for OutageStore {
        async fn load(&self, _doc: &str) -> Result<Option<Vec<u8>>, StorageError> {
            return Err(StorageError("connection refused".to_string()));
        }

        async fn flush(&self, _doc: &str, _snapshot: &[u8]) -> Result<(), StorageError> {
            return Err(StorageError("connection refused".to_string()));
        }
    }

    #[tokio::test]
    async fn storage_outage_surfaces_as_join_failure() {
        let registry = Registry::new(Arc::new(OutageStore));
        let result = registry.join("doc1").await;
        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn read_snapshot_prefers_live_session() {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(store.clone());

        let (session, token) = registry.join("doc1").await.unwrap();
        let conn = session.issue_token();
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        session.attach(conn, tx);

        let mut client = Replica::with_id(ReplicaId(1));
        let fragment = client.insert(0, b"live");
        session.relay(conn, &fragment).unwrap();

        let snapshot = registry.read_snapshot("doc1").await.unwrap().unwrap();
        let restored = Replica::from_snapshot(&snapshot).unwrap();
        assert_eq!(restored.to_string(), "live");

        registry.leave("doc1", token).await.unwrap();
    }

    #[tokio::test]
    async fn read_snapshot_falls_back_to_store() {
        let store = Arc::new(MemoryStore::new());
        store.flush("doc1", b"stored bytes").await.unwrap();

        let registry = Registry::new(store);
        let snapshot = registry.read_snapshot("doc1").await.unwrap().unwrap();
        assert_eq!(snapshot, b"stored bytes");
    }

    #[tokio::test]
    async fn read_snapshot_of_unknown_doc_is_none() {
        let registry = registry();
        assert!(registry.read_snapshot("nope").await.unwrap().is_none());
    }
}
