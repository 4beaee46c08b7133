//! In-memory store backend
//!
//! Feature-complete stand-in for the Redis backend: per-key TTLs, atomic
//! conditional writes, and watched transactions with optimistic commit
//! checks. Every mutation bumps a per-key version; a watched transaction
//! snapshots versions at `watch` time and commits only if none moved.
//! Expiry is evaluated lazily and counts as a mutation, matching how a
//! watched key aborts a transaction when it expires mid-flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{KvError, KvStore, WatchedTx};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Shared {
    entries: HashMap<String, Entry>,
    /// Monotonic per-key change counters. Survive deletion so that
    /// delete/recreate cycles are visible to watchers.
    versions: HashMap<String, u64>,
    clock: u64,
}

impl Shared {
    fn bump(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// Drop the entry if its TTL has passed. Expiry is a visible mutation.
    fn expire(&mut self, key: &str) {
        let expired = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= Instant::now()
        );
        if expired {
            self.entries.remove(key);
            self.bump(key);
        }
    }

    fn get_str(&mut self, key: &str) -> Result<Option<String>, KvError> {
        self.expire(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(Entry { value: Value::Hash(_), .. }) => Err(KvError::Corrupt {
                key: key.to_string(),
                reason: "expected string, found hash".to_string(),
            }),
        }
    }

    fn get_hash_fields(
        &mut self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<String>>, KvError> {
        self.expire(key);
        match self.entries.get(key) {
            None => Ok(vec![None; fields.len()]),
            Some(Entry { value: Value::Hash(h), .. }) => {
                Ok(fields.iter().map(|f| h.get(*f).cloned()).collect())
            }
            Some(Entry { value: Value::Str(_), .. }) => Err(KvError::Corrupt {
                key: key.to_string(),
                reason: "expected hash, found string".to_string(),
            }),
        }
    }
}

/// In-memory [`KvStore`]. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<Shared>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut shared = self.inner.lock().unwrap();
        shared.expire(key);
        if shared.entries.contains_key(key) {
            return Ok(false);
        }
        shared.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        shared.bump(key);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.inner.lock().unwrap().get_str(key)
    }

    async fn delete_if_equal(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let mut shared = self.inner.lock().unwrap();
        match shared.get_str(key)? {
            Some(current) if current == value => {
                shared.entries.remove(key);
                shared.bump(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn hget_multi(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, KvError> {
        self.inner.lock().unwrap().get_hash_fields(key, fields)
    }

    async fn watch(&self, keys: &[String]) -> Result<Box<dyn WatchedTx>, KvError> {
        let mut shared = self.inner.lock().unwrap();
        let snapshot = keys
            .iter()
            .map(|k| {
                shared.expire(k);
                (k.clone(), shared.version(k))
            })
            .collect();
        Ok(Box::new(MemoryTx {
            inner: self.inner.clone(),
            snapshot,
            staged: Vec::new(),
        }))
    }
}

enum StagedOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    HSet {
        key: String,
        field: String,
        value: String,
    },
}

struct MemoryTx {
    inner: Arc<Mutex<Shared>>,
    snapshot: Vec<(String, u64)>,
    staged: Vec<StagedOp>,
}

#[async_trait]
impl WatchedTx for MemoryTx {
    async fn get(&mut self, key: &str) -> Result<Option<String>, KvError> {
        self.inner.lock().unwrap().get_str(key)
    }

    async fn hget_multi(
        &mut self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<String>>, KvError> {
        self.inner.lock().unwrap().get_hash_fields(key, fields)
    }

    fn stage_hset(&mut self, key: &str, field: &str, value: &str) {
        self.staged.push(StagedOp::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        });
    }

    fn stage_set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.staged.push(StagedOp::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        });
    }

    async fn commit(self: Box<Self>) -> Result<bool, KvError> {
        let mut shared = self.inner.lock().unwrap();

        for (key, version) in &self.snapshot {
            shared.expire(key);
            if shared.version(key) != *version {
                return Ok(false);
            }
        }

        for op in self.staged {
            match op {
                StagedOp::Set { key, value, ttl } => {
                    shared.entries.insert(
                        key.clone(),
                        Entry {
                            value: Value::Str(value),
                            expires_at: ttl.map(|t| Instant::now() + t),
                        },
                    );
                    shared.bump(&key);
                }
                StagedOp::HSet { key, field, value } => {
                    let entry = shared.entries.entry(key.clone()).or_insert_with(|| Entry {
                        value: Value::Hash(HashMap::new()),
                        expires_at: None,
                    });
                    match &mut entry.value {
                        Value::Hash(h) => {
                            h.insert(field, value);
                        }
                        Value::Str(_) => {
                            return Err(KvError::Corrupt {
                                key: key.clone(),
                                reason: "hset on string entry".to_string(),
                            });
                        }
                    }
                    shared.bump(&key);
                }
            }
        }

        Ok(true)
    }

    async fn cancel(self: Box<Self>) -> Result<(), KvError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_if_absent_respects_existing() {
        let kv = MemoryKv::new();
        assert!(kv.set_if_absent("k", "a", TTL).await.unwrap());
        assert!(!kv.set_if_absent("k", "b", TTL).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let kv = MemoryKv::new();
        kv.set_if_absent("k", "a", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        // Expired slot is free for a new writer.
        assert!(kv.set_if_absent("k", "b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_equal() {
        let kv = MemoryKv::new();
        kv.set_if_absent("k", "mine", TTL).await.unwrap();
        assert!(!kv.delete_if_equal("k", "theirs").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some("mine".to_string()));
        assert!(kv.delete_if_equal("k", "mine").await.unwrap());
        assert!(!kv.delete_if_equal("k", "mine").await.unwrap());
    }

    #[tokio::test]
    async fn test_hget_multi_alignment() {
        let kv = MemoryKv::new();
        let mut tx = kv.watch(&[]).await.unwrap();
        tx.stage_hset("h", "balance", "10.00");
        tx.stage_hset("h", "status", "active");
        assert!(tx.commit().await.unwrap());

        let fields = kv
            .hget_multi("h", &["balance", "missing", "status"])
            .await
            .unwrap();
        assert_eq!(
            fields,
            vec![
                Some("10.00".to_string()),
                None,
                Some("active".to_string())
            ]
        );

        let absent = kv.hget_multi("nope", &["balance"]).await.unwrap();
        assert_eq!(absent, vec![None]);
    }

    #[tokio::test]
    async fn test_watched_commit_applies_batch() {
        let kv = MemoryKv::new();
        let mut tx = kv.watch(&["h".to_string()]).await.unwrap();
        tx.stage_hset("h", "balance", "5.00");
        tx.stage_set("marker", "done", Some(TTL));
        assert!(tx.commit().await.unwrap());

        assert_eq!(
            kv.hget_multi("h", &["balance"]).await.unwrap(),
            vec![Some("5.00".to_string())]
        );
        assert_eq!(kv.get("marker").await.unwrap(), Some("done".to_string()));
    }

    #[tokio::test]
    async fn test_watched_commit_aborts_on_concurrent_write() {
        let kv = MemoryKv::new();
        kv.set_if_absent("w", "0", TTL).await.unwrap();

        let mut tx = kv.watch(&["w".to_string()]).await.unwrap();
        tx.stage_set("w", "from-tx", None);

        // Concurrent writer touches the watched key.
        kv.delete_if_equal("w", "0").await.unwrap();

        assert!(!tx.commit().await.unwrap());
        assert_eq!(kv.get("w").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_watched_commit_aborts_on_expiry() {
        let kv = MemoryKv::new();
        kv.set_if_absent("w", "0", Duration::from_millis(20))
            .await
            .unwrap();

        let mut tx = kv.watch(&["w".to_string()]).await.unwrap();
        tx.stage_set("other", "x", None);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!tx.commit().await.unwrap());
        assert_eq!(kv.get("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_watch_of_absent_key_sees_creation() {
        let kv = MemoryKv::new();
        let mut tx = kv.watch(&["new".to_string()]).await.unwrap();
        tx.stage_set("new", "from-tx", None);

        kv.set_if_absent("new", "raced", TTL).await.unwrap();

        assert!(!tx.commit().await.unwrap());
        assert_eq!(kv.get("new").await.unwrap(), Some("raced".to_string()));
    }
}
