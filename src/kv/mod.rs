//! Key-Value Store Adapter
//!
//! The store is the only shared mutable resource in the system, and this
//! module is the only way the engine touches it. The surface is deliberately
//! narrow: six operations, enough for leases, wallet reads, and optimistic
//! multi-key commits. Any backend implementing [`KvStore`] can be swapped in;
//! [`MemoryKv`] backs the test suites, [`RedisKv`] backs production.

pub mod memory;
pub mod redis;

pub use memory::MemoryKv;
pub use redis::RedisKv;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("redis error: {0}")]
    Backend(#[from] ::redis::RedisError),

    #[error("malformed value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Capability set the engine requires from the store.
///
/// All compound operations are server-side atomic: `set_if_absent` is a
/// single conditional write, `delete_if_equal` a single compare-and-delete.
/// Neither may be emulated with a client-side read followed by a write.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Write `value` under `key` only if the key is absent. The entry expires
    /// after `ttl`. Returns true if the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Delete `key` only if it currently holds exactly `value`. Returns true
    /// if the key was deleted.
    async fn delete_if_equal(&self, key: &str, value: &str) -> Result<bool, KvError>;

    /// Read several fields of a hash. Result entries align with `fields`;
    /// a missing field (or missing hash) yields `None` in its slot.
    async fn hget_multi(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, KvError>;

    /// Begin a watched transaction over `keys`.
    ///
    /// Reads through the returned handle observe live state; staged writes
    /// are buffered and applied atomically by [`WatchedTx::commit`], which
    /// fails (returns `false`) if any watched key changed since `watch` was
    /// called.
    async fn watch(&self, keys: &[String]) -> Result<Box<dyn WatchedTx>, KvError>;
}

/// One in-flight optimistic transaction.
///
/// Dropping the handle without calling [`commit`](WatchedTx::commit) or
/// [`cancel`](WatchedTx::cancel) abandons the transaction; nothing is
/// written.
#[async_trait]
pub trait WatchedTx: Send {
    async fn get(&mut self, key: &str) -> Result<Option<String>, KvError>;

    async fn hget_multi(&mut self, key: &str, fields: &[&str])
    -> Result<Vec<Option<String>>, KvError>;

    /// Buffer a hash-field write for the commit batch.
    fn stage_hset(&mut self, key: &str, field: &str, value: &str);

    /// Buffer a plain write for the commit batch, optionally with a TTL.
    fn stage_set(&mut self, key: &str, value: &str, ttl: Option<Duration>);

    /// Apply all staged writes atomically. Returns `false` if a watched key
    /// was modified since the transaction began (nothing was written; the
    /// caller decides whether to retry).
    async fn commit(self: Box<Self>) -> Result<bool, KvError>;

    /// Abandon the transaction and clear the watch.
    async fn cancel(self: Box<Self>) -> Result<(), KvError>;
}
