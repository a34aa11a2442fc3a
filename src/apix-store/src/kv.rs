//!
//! # Key value store contract
//!
//! The etcd shaped seam the per-type storage adapts. Values are API
//! objects in their storage version encoding; the store stamps each
//! write's revision into `metadata.resourceVersion`, mirroring the etcd
//! versioner. The in-memory implementation backs tests and single process
//! deployments.
//!
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::json;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("key already exists")]
    AlreadyExists,
    #[error("revision conflict: expected {expected}, current {current}")]
    Conflict { expected: u64, current: u64 },
    #[error("requested revision {0} has been compacted")]
    Expired(u64),
    #[error("store failure: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct KvPair {
    pub key: String,
    pub value: Value,
    pub revision: u64,
}

#[derive(Debug, Clone)]
pub enum KvEvent {
    Put { pair: KvPair, created: bool },
    Delete { pair: KvPair },
}

impl KvEvent {
    pub fn revision(&self) -> u64 {
        match self {
            Self::Put { pair, .. } | Self::Delete { pair } => pair.revision,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Put { pair, .. } | Self::Delete { pair } => &pair.key,
        }
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError>;

    /// insert a new key; the assigned revision is returned and stamped
    /// into the stored document
    async fn insert(&self, key: &str, value: Value) -> Result<KvPair, StoreError>;

    /// compare-and-swap on the pair's current revision
    async fn update(
        &self,
        key: &str,
        value: Value,
        expected_revision: u64,
    ) -> Result<KvPair, StoreError>;

    async fn delete(&self, key: &str, expected_revision: Option<u64>)
        -> Result<KvPair, StoreError>;

    /// all pairs under a prefix in key order, plus the store revision the
    /// listing is consistent at
    async fn list(&self, prefix: &str) -> Result<(Vec<KvPair>, u64), StoreError>;

    async fn current_revision(&self) -> u64;

    /// events for keys under the prefix, starting after `from_revision`.
    /// Fails with [`StoreError::Expired`] when the start point has been
    /// compacted out of the replay window.
    fn watch_prefix(
        &self,
        prefix: &str,
        from_revision: u64,
    ) -> Result<BoxStream<'static, KvEvent>, StoreError>;
}

const REPLAY_WINDOW: usize = 4096;

struct MemoryInner {
    entries: BTreeMap<String, KvPair>,
    revision: u64,
    /// bounded history for watch replay
    log: VecDeque<KvEvent>,
    compacted: u64,
    subscribers: Vec<(String, mpsc::UnboundedSender<KvEvent>)>,
}

/// single process store with a replay window, suitable for tests and for
/// development deployments
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                entries: BTreeMap::new(),
                revision: 0,
                log: VecDeque::new(),
                compacted: 0,
                subscribers: vec![],
            }),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl MemoryInner {
    fn lock_error() -> StoreError {
        StoreError::Internal("store lock poisoned".to_owned())
    }

    fn stamp(value: &mut Value, revision: u64) {
        if let Some(metadata) = value.pointer_mut("/metadata") {
            if let Some(fields) = metadata.as_object_mut() {
                fields.insert("resourceVersion".to_owned(), json!(revision.to_string()));
            }
        }
    }

    fn publish(&mut self, event: KvEvent) {
        self.log.push_back(event.clone());
        while self.log.len() > REPLAY_WINDOW {
            if let Some(old) = self.log.pop_front() {
                self.compacted = old.revision();
            }
        }
        self.subscribers
            .retain(|(prefix, sender)| {
                if !event.key().starts_with(prefix.as_str()) {
                    return !sender.is_closed();
                }
                sender.send(event.clone()).is_ok()
            });
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError> {
        let inner = self.inner.lock().map_err(|_| MemoryInner::lock_error())?;
        Ok(inner.entries.get(key).cloned())
    }

    async fn insert(&self, key: &str, mut value: Value) -> Result<KvPair, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| MemoryInner::lock_error())?;
        if inner.entries.contains_key(key) {
            return Err(StoreError::AlreadyExists);
        }
        inner.revision += 1;
        let revision = inner.revision;
        MemoryInner::stamp(&mut value, revision);
        let pair = KvPair {
            key: key.to_owned(),
            value,
            revision,
        };
        inner.entries.insert(key.to_owned(), pair.clone());
        trace!(key, revision, "kv insert");
        inner.publish(KvEvent::Put {
            pair: pair.clone(),
            created: true,
        });
        Ok(pair)
    }

    async fn update(
        &self,
        key: &str,
        mut value: Value,
        expected_revision: u64,
    ) -> Result<KvPair, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| MemoryInner::lock_error())?;
        let current = inner
            .entries
            .get(key)
            .ok_or(StoreError::NotFound)?
            .revision;
        if current != expected_revision {
            return Err(StoreError::Conflict {
                expected: expected_revision,
                current,
            });
        }
        inner.revision += 1;
        let revision = inner.revision;
        MemoryInner::stamp(&mut value, revision);
        let pair = KvPair {
            key: key.to_owned(),
            value,
            revision,
        };
        inner.entries.insert(key.to_owned(), pair.clone());
        trace!(key, revision, "kv update");
        inner.publish(KvEvent::Put {
            pair: pair.clone(),
            created: false,
        });
        Ok(pair)
    }

    async fn delete(
        &self,
        key: &str,
        expected_revision: Option<u64>,
    ) -> Result<KvPair, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| MemoryInner::lock_error())?;
        let current = inner
            .entries
            .get(key)
            .ok_or(StoreError::NotFound)?
            .revision;
        if let Some(expected) = expected_revision {
            if current != expected {
                return Err(StoreError::Conflict {
                    expected,
                    current,
                });
            }
        }
        let mut pair = inner.entries.remove(key).ok_or(StoreError::NotFound)?;
        inner.revision += 1;
        pair.revision = inner.revision;
        trace!(key, revision = pair.revision, "kv delete");
        inner.publish(KvEvent::Delete { pair: pair.clone() });
        Ok(pair)
    }

    async fn list(&self, prefix: &str) -> Result<(Vec<KvPair>, u64), StoreError> {
        let inner = self.inner.lock().map_err(|_| MemoryInner::lock_error())?;
        let pairs = inner
            .entries
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, pair)| pair.clone())
            .collect();
        Ok((pairs, inner.revision))
    }

    async fn current_revision(&self) -> u64 {
        self.inner.lock().map(|inner| inner.revision).unwrap_or(0)
    }

    fn watch_prefix(
        &self,
        prefix: &str,
        from_revision: u64,
    ) -> Result<BoxStream<'static, KvEvent>, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| MemoryInner::lock_error())?;
        if from_revision < inner.compacted {
            return Err(StoreError::Expired(from_revision));
        }
        let backlog: Vec<KvEvent> = inner
            .log
            .iter()
            .filter(|event| event.revision() > from_revision && event.key().starts_with(prefix))
            .cloned()
            .collect();
        let (sender, receiver) = mpsc::unbounded_channel();
        inner.subscribers.push((prefix.to_owned(), sender));
        drop(inner);

        let live = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|event| (event, receiver))
        });
        Ok(futures_util::stream::iter(backlog).chain(live).boxed())
    }
}
