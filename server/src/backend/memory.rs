//! In-process document store.
//!
//! Writes are buffered in the transaction and applied on commit. Every
//! document key carries a version that is bumped on each committed write;
//! a transaction remembers the version of each key it touched and fails to
//! commit with [`BackendError::Rollback`] if any of them moved meanwhile.

use super::{
    BackendResult, Backend, Checkpoint, ExclusiveTransaction, InternalId, WriteTransaction,
};
use crate::error::BackendError;
use async_trait::async_trait;
use oplog_engine::{DatabaseName, Document, DocumentKey, Namespace};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type VersionKey = (Namespace, DocumentKey);

#[derive(Debug, Default)]
struct StoredCollection {
    docs: HashMap<DocumentKey, (InternalId, Document)>,
    keys: HashMap<InternalId, DocumentKey>,
}

#[derive(Debug, Default)]
struct State {
    next_id: InternalId,
    collections: BTreeMap<Namespace, StoredCollection>,
    versions: HashMap<VersionKey, u64>,
    checkpoint: Option<Checkpoint>,
}

impl State {
    fn version(&self, key: &VersionKey) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: VersionKey) {
        *self.versions.entry(key).or_insert(0) += 1;
    }

    fn insert(&mut self, namespace: &Namespace, key: DocumentKey, doc: Document) {
        self.next_id += 1;
        let id = self.next_id;
        let collection = self.collections.entry(namespace.clone()).or_default();
        collection.keys.insert(id, key.clone());
        collection.docs.insert(key.clone(), (id, doc));
        self.bump((namespace.clone(), key));
    }

    fn remove(&mut self, namespace: &Namespace, id: InternalId) {
        let Some(collection) = self.collections.get_mut(namespace) else {
            return;
        };
        if let Some(key) = collection.keys.remove(&id) {
            collection.docs.remove(&key);
            self.bump((namespace.clone(), key));
        }
    }

    fn drop_where(&mut self, pred: impl Fn(&Namespace) -> bool) {
        let dropped: Vec<Namespace> = self
            .collections
            .keys()
            .filter(|ns| pred(ns))
            .cloned()
            .collect();
        for ns in dropped {
            if let Some(collection) = self.collections.remove(&ns) {
                for key in collection.docs.into_keys() {
                    self.bump((ns.clone(), key));
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    find_calls: AtomicU64,
    fetch_calls: AtomicU64,
    delete_calls: AtomicU64,
    insert_calls: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Backend call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub find_calls: u64,
    pub fetch_calls: u64,
    pub delete_calls: u64,
    pub insert_calls: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

/// In-memory [`Backend`].
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    gate: Arc<RwLock<()>>,
    counters: Arc<Counters>,
    failing_commits: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store documents directly, bypassing transactions.
    pub fn seed(&self, namespace: &Namespace, documents: Vec<Document>) -> BackendResult<()> {
        let mut state = self.lock();
        for doc in documents {
            let key = DocumentKey::of(&doc)
                .ok_or_else(|| BackendError::Corrupt("document without _id".to_string()))?;
            let exists = state
                .collections
                .get(namespace)
                .is_some_and(|c| c.docs.contains_key(&key));
            if exists {
                return Err(BackendError::UniqueViolation(format!("{namespace} {key}")));
            }
            state.insert(namespace, key, doc);
        }
        Ok(())
    }

    /// Stored documents of a namespace, ordered by key.
    pub fn documents(&self, namespace: &Namespace) -> Vec<Document> {
        let state = self.lock();
        let Some(collection) = state.collections.get(namespace) else {
            return Vec::new();
        };
        let mut docs: Vec<_> = collection.docs.iter().collect();
        docs.sort_by(|a, b| a.0.cmp(b.0));
        docs.into_iter().map(|(_, (_, doc))| doc.clone()).collect()
    }

    pub fn get(&self, namespace: &Namespace, key: &DocumentKey) -> Option<Document> {
        self.lock()
            .collections
            .get(namespace)
            .and_then(|c| c.docs.get(key))
            .map(|(_, doc)| doc.clone())
    }

    /// Namespaces holding at least one document.
    pub fn namespaces(&self) -> Vec<Namespace> {
        self.lock()
            .collections
            .iter()
            .filter(|(_, c)| !c.docs.is_empty())
            .map(|(ns, _)| ns.clone())
            .collect()
    }

    pub fn stats(&self) -> MemoryStats {
        let c = &self.counters;
        MemoryStats {
            find_calls: c.find_calls.load(Ordering::Relaxed),
            fetch_calls: c.fetch_calls.load(Ordering::Relaxed),
            delete_calls: c.delete_calls.load(Ordering::Relaxed),
            insert_calls: c.insert_calls.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
            rollbacks: c.rollbacks.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.counters;
        for counter in [
            &c.find_calls,
            &c.fetch_calls,
            &c.delete_calls,
            &c.insert_calls,
            &c.commits,
            &c.rollbacks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Make the next `n` commits fail with a rollback conflict.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn begin(&self, _namespace: &Namespace) -> BackendResult<Box<dyn WriteTransaction>> {
        let guard = self.gate.clone().read_owned().await;
        Ok(Box::new(MemoryTransaction::new(self.clone(), Guard::Shared(guard))))
    }

    async fn begin_exclusive(&self) -> BackendResult<Box<dyn ExclusiveTransaction>> {
        let guard = self.gate.clone().write_owned().await;
        Ok(Box::new(MemoryTransaction::new(self.clone(), Guard::Exclusive(guard))))
    }

    async fn load_checkpoint(&self) -> BackendResult<Option<Checkpoint>> {
        Ok(self.lock().checkpoint.clone())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BackendResult<()> {
        self.lock().checkpoint = Some(checkpoint.clone());
        Ok(())
    }
}

#[derive(Debug)]
#[allow(dead_code)]
enum Guard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

#[derive(Debug)]
enum PendingWrite {
    Delete(Namespace, InternalId),
    Insert(Namespace, DocumentKey, Document),
    DropCollection(Namespace),
    DropDatabase(DatabaseName),
}

/// Transaction over a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryTransaction {
    backend: MemoryBackend,
    _guard: Guard,
    observed: HashMap<VersionKey, u64>,
    writes: Vec<PendingWrite>,
    removed: HashSet<VersionKey>,
    added: HashSet<VersionKey>,
    dropped_namespaces: HashSet<Namespace>,
    dropped_databases: HashSet<DatabaseName>,
    finished: bool,
}

impl MemoryTransaction {
    fn new(backend: MemoryBackend, guard: Guard) -> Self {
        Self {
            backend,
            _guard: guard,
            observed: HashMap::new(),
            writes: Vec::new(),
            removed: HashSet::new(),
            added: HashSet::new(),
            dropped_namespaces: HashSet::new(),
            dropped_databases: HashSet::new(),
            finished: false,
        }
    }

    fn ensure_open(&self) -> BackendResult<()> {
        if self.finished {
            return Err(BackendError::TransactionFinished);
        }
        Ok(())
    }

    fn observe(&mut self, state: &State, key: &VersionKey) {
        if !self.observed.contains_key(key) {
            self.observed.insert(key.clone(), state.version(key));
        }
    }

    fn is_dropped(&self, namespace: &Namespace) -> bool {
        self.dropped_namespaces.contains(namespace)
            || self.dropped_databases.contains(&namespace.database)
    }

    /// Whether a committed document is still visible to this transaction.
    fn is_visible(&self, key: &VersionKey) -> bool {
        !self.removed.contains(key) && !self.is_dropped(&key.0)
    }

    fn count_visible(&self, state: &State, pred: impl Fn(&Namespace) -> bool) -> u64 {
        let committed = state
            .collections
            .iter()
            .filter(|(ns, _)| pred(ns) && !self.is_dropped(ns))
            .flat_map(|(ns, c)| c.docs.keys().map(move |k| (ns.clone(), k.clone())))
            .filter(|key| !self.removed.contains(key))
            .count();
        let added = self.added.iter().filter(|(ns, _)| pred(ns)).count();
        (committed + added) as u64
    }
}

#[async_trait]
impl WriteTransaction for MemoryTransaction {
    async fn find_ids_by_keys(
        &mut self,
        namespace: &Namespace,
        keys: &[DocumentKey],
    ) -> BackendResult<HashMap<DocumentKey, InternalId>> {
        self.ensure_open()?;
        self.backend.counters.find_calls.fetch_add(1, Ordering::Relaxed);

        let backend = self.backend.clone();
        let state = backend.lock();
        let mut found = HashMap::new();
        for key in keys {
            let versioned = (namespace.clone(), key.clone());
            self.observe(&state, &versioned);
            if !self.is_visible(&versioned) {
                continue;
            }
            if let Some((id, _)) = state.collections.get(namespace).and_then(|c| c.docs.get(key)) {
                found.insert(key.clone(), *id);
            }
        }
        Ok(found)
    }

    async fn fetch_documents(
        &mut self,
        namespace: &Namespace,
        ids: &[InternalId],
    ) -> BackendResult<HashMap<InternalId, Document>> {
        self.ensure_open()?;
        self.backend.counters.fetch_calls.fetch_add(1, Ordering::Relaxed);

        let backend = self.backend.clone();
        let state = backend.lock();
        let Some(collection) = state.collections.get(namespace) else {
            return Ok(HashMap::new());
        };
        let mut docs = HashMap::new();
        for id in ids {
            let Some(key) = collection.keys.get(id) else {
                continue;
            };
            let versioned = (namespace.clone(), key.clone());
            self.observe(&state, &versioned);
            if self.is_visible(&versioned) {
                if let Some((_, doc)) = collection.docs.get(key) {
                    docs.insert(*id, doc.clone());
                }
            }
        }
        Ok(docs)
    }

    async fn delete_by_ids(
        &mut self,
        namespace: &Namespace,
        ids: &[InternalId],
    ) -> BackendResult<u64> {
        self.ensure_open()?;
        self.backend.counters.delete_calls.fetch_add(1, Ordering::Relaxed);

        let backend = self.backend.clone();
        let state = backend.lock();
        let Some(collection) = state.collections.get(namespace) else {
            return Ok(0);
        };
        let mut deleted = 0;
        for id in ids {
            let Some(key) = collection.keys.get(id) else {
                continue;
            };
            let versioned = (namespace.clone(), key.clone());
            if !self.is_visible(&versioned) {
                continue;
            }
            self.observe(&state, &versioned);
            self.removed.insert(versioned);
            self.writes.push(PendingWrite::Delete(namespace.clone(), *id));
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn insert_documents(
        &mut self,
        namespace: &Namespace,
        documents: Vec<Document>,
    ) -> BackendResult<()> {
        self.ensure_open()?;
        self.backend.counters.insert_calls.fetch_add(1, Ordering::Relaxed);

        let backend = self.backend.clone();
        let state = backend.lock();
        for doc in documents {
            let key = DocumentKey::of(&doc)
                .ok_or_else(|| BackendError::Corrupt("document without _id".to_string()))?;
            let versioned = (namespace.clone(), key.clone());
            self.observe(&state, &versioned);

            let committed = state
                .collections
                .get(namespace)
                .is_some_and(|c| c.docs.contains_key(&key));
            if self.added.contains(&versioned) || (committed && self.is_visible(&versioned)) {
                return Err(BackendError::UniqueViolation(format!("{namespace} {key}")));
            }

            self.added.insert(versioned);
            self.writes
                .push(PendingWrite::Insert(namespace.clone(), key, doc));
        }
        Ok(())
    }

    async fn commit(&mut self) -> BackendResult<()> {
        self.ensure_open()?;
        self.finished = true;

        if self.backend.take_injected_failure() {
            self.backend.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
            return Err(BackendError::Rollback("injected conflict".to_string()));
        }

        let backend = self.backend.clone();
        let mut state = backend.lock();
        if let Some((key, _)) = self
            .observed
            .iter()
            .find(|(key, version)| state.version(key) != **version)
        {
            self.backend.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
            return Err(BackendError::Rollback(format!(
                "{} {} changed concurrently",
                key.0, key.1
            )));
        }

        // No observed key moved, so the pending writes still apply cleanly.
        for write in self.writes.drain(..) {
            match write {
                PendingWrite::Delete(ns, id) => state.remove(&ns, id),
                PendingWrite::Insert(ns, key, doc) => state.insert(&ns, key, doc),
                PendingWrite::DropCollection(ns) => state.drop_where(|n| *n == ns),
                PendingWrite::DropDatabase(db) => state.drop_where(|n| n.database == db),
            }
        }
        self.backend.counters.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl ExclusiveTransaction for MemoryTransaction {
    async fn drop_collection(&mut self, namespace: &Namespace) -> BackendResult<u64> {
        self.ensure_open()?;
        let backend = self.backend.clone();
        let state = backend.lock();
        let dropped = self.count_visible(&state, |ns| ns == namespace);

        self.added.retain(|(ns, _)| ns != namespace);
        self.dropped_namespaces.insert(namespace.clone());
        self.writes
            .push(PendingWrite::DropCollection(namespace.clone()));
        Ok(dropped)
    }

    async fn drop_database(&mut self, database: &DatabaseName) -> BackendResult<u64> {
        self.ensure_open()?;
        let backend = self.backend.clone();
        let state = backend.lock();
        let dropped = self.count_visible(&state, |ns| &ns.database == database);

        self.added.retain(|(ns, _)| &ns.database != database);
        self.dropped_databases.insert(database.clone());
        self.writes.push(PendingWrite::DropDatabase(database.clone()));
        Ok(dropped)
    }

    fn as_write(&mut self) -> &mut dyn WriteTransaction {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oplog_engine::as_document;
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("shop", "orders")
    }

    fn doc(id: &str, n: i64) -> Document {
        as_document(json!({"_id": id, "n": n})).unwrap()
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin(&ns()).await.unwrap();
        tx.insert_documents(&ns(), vec![doc("a", 1)]).await.unwrap();
        assert!(backend.documents(&ns()).is_empty());

        tx.commit().await.unwrap();
        assert_eq!(backend.documents(&ns()), vec![doc("a", 1)]);
    }

    #[tokio::test]
    async fn finished_transaction_is_not_retryable() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin(&ns()).await.unwrap();
        tx.commit().await.unwrap();

        let err = tx.insert_documents(&ns(), vec![doc("a", 1)]).await.unwrap_err();
        assert!(matches!(err, BackendError::TransactionFinished));
        assert!(!err.is_retryable());
        assert!(matches!(tx.commit().await, Err(BackendError::TransactionFinished)));
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let backend = MemoryBackend::new();
        {
            let mut tx = backend.begin(&ns()).await.unwrap();
            tx.insert_documents(&ns(), vec![doc("a", 1)]).await.unwrap();
        }
        assert!(backend.documents(&ns()).is_empty());
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected_on_insert() {
        let backend = MemoryBackend::new();
        backend.seed(&ns(), vec![doc("a", 1)]).unwrap();

        let mut tx = backend.begin(&ns()).await.unwrap();
        let err = tx
            .insert_documents(&ns(), vec![doc("a", 2)])
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn delete_then_insert_same_key() {
        let backend = MemoryBackend::new();
        backend.seed(&ns(), vec![doc("a", 1)]).unwrap();

        let mut tx = backend.begin(&ns()).await.unwrap();
        let ids = tx
            .find_ids_by_keys(&ns(), &[DocumentKey::from("a")])
            .await
            .unwrap();
        let id = ids[&DocumentKey::from("a")];
        assert_eq!(tx.delete_by_ids(&ns(), &[id]).await.unwrap(), 1);
        tx.insert_documents(&ns(), vec![doc("a", 2)]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(backend.documents(&ns()), vec![doc("a", 2)]);
    }

    #[tokio::test]
    async fn concurrent_write_to_observed_key_rolls_back() {
        let backend = MemoryBackend::new();
        backend.seed(&ns(), vec![doc("a", 1)]).unwrap();

        let mut first = backend.begin(&ns()).await.unwrap();
        first
            .find_ids_by_keys(&ns(), &[DocumentKey::from("a")])
            .await
            .unwrap();

        let mut second = backend.begin(&ns()).await.unwrap();
        let ids = second
            .find_ids_by_keys(&ns(), &[DocumentKey::from("a")])
            .await
            .unwrap();
        second
            .delete_by_ids(&ns(), &[ids[&DocumentKey::from("a")]])
            .await
            .unwrap();
        second.commit().await.unwrap();

        let err = first.commit().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(backend.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn disjoint_keys_do_not_conflict() {
        let backend = MemoryBackend::new();
        let mut first = backend.begin(&ns()).await.unwrap();
        let mut second = backend.begin(&ns()).await.unwrap();
        first.insert_documents(&ns(), vec![doc("a", 1)]).await.unwrap();
        second.insert_documents(&ns(), vec![doc("b", 1)]).await.unwrap();
        second.commit().await.unwrap();
        first.commit().await.unwrap();
        assert_eq!(backend.documents(&ns()).len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_next_commits(1);

        let mut tx = backend.begin(&ns()).await.unwrap();
        assert!(tx.commit().await.unwrap_err().is_retryable());

        let mut tx = backend.begin(&ns()).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(backend.stats().commits, 1);
    }

    #[tokio::test]
    async fn drop_database_removes_every_collection() {
        let backend = MemoryBackend::new();
        backend.seed(&ns(), vec![doc("a", 1)]).unwrap();
        backend
            .seed(&Namespace::new("shop", "users"), vec![doc("u", 1)])
            .unwrap();
        backend
            .seed(&Namespace::new("other", "orders"), vec![doc("o", 1)])
            .unwrap();

        let mut tx = backend.begin_exclusive().await.unwrap();
        assert_eq!(tx.drop_database(&"shop".to_string()).await.unwrap(), 2);
        tx.commit().await.unwrap();

        assert_eq!(backend.namespaces(), vec![Namespace::new("other", "orders")]);
    }

    #[tokio::test]
    async fn checkpoint_round_trip() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.load_checkpoint().await.unwrap(), None);

        let op = oplog_engine::ChangeOperation::Noop(oplog_engine::NoopOp::new(42, 7));
        let checkpoint = Checkpoint::of(&op);
        backend.save_checkpoint(&checkpoint).await.unwrap();
        assert_eq!(backend.load_checkpoint().await.unwrap(), Some(checkpoint));
    }
}
