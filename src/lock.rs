//! Multi-Key Distributed Lock
//!
//! Serialises conflicting transfers across worker processes through leases
//! in the shared store. An acquisition takes *every* requested name or none:
//! names are deduplicated and sorted byte-wise first, so all acquirers
//! request conflicting names in the same order and a wait cycle cannot form.
//! Ownership is bound to a random 128-bit token; release is compare-and-
//! delete on that token and releasing something you no longer own is a
//! no-op. If a holder dies, the lease TTL frees the names on its own.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::kv::{KvError, KvStore};

/// Exponent clamp for the backoff doubling; beyond this the cap delay
/// dominates anyway.
const BACKOFF_EXP_CAP: u32 = 10;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("locks unavailable after {attempts} attempts")]
    Unavailable { attempts: u32 },

    #[error("lock request with no names")]
    EmptyNameSet,

    #[error(transparent)]
    Kv(#[from] KvError),
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub ttl: Duration,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub max_retries: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(10_000),
            base_retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_millis(2_000),
            max_retries: 10,
        }
    }
}

impl From<&EngineConfig> for LockConfig {
    fn from(engine: &EngineConfig) -> Self {
        Self {
            ttl: Duration::from_millis(engine.ttl_ms),
            base_retry_delay: Duration::from_millis(engine.base_retry_delay_ms),
            max_retry_delay: Duration::from_millis(engine.max_retry_delay_ms),
            max_retries: engine.max_retries,
        }
    }
}

/// A held set of leases. Must be handed back to [`MultiLock::release`];
/// a lease that is merely dropped stays held until its TTL runs out.
#[derive(Debug)]
pub struct LockLease {
    token: String,
    names: Vec<String>,
    released: bool,
}

impl LockLease {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Names held by this lease, in acquisition (canonical) order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                token = %self.token,
                names = ?self.names,
                "lock lease dropped without release; leases will expire via TTL"
            );
        }
    }
}

pub struct MultiLock {
    kv: Arc<dyn KvStore>,
    config: LockConfig,
}

impl MultiLock {
    pub fn new(kv: Arc<dyn KvStore>, config: LockConfig) -> Self {
        Self { kv, config }
    }

    /// Acquire a lease on every one of `names`, or none.
    ///
    /// `op_id` is carried for log correlation only; ownership is identified
    /// by the freshly minted token inside the returned lease.
    pub async fn acquire(&self, names: &[&str], op_id: &str) -> Result<LockLease, LockError> {
        if names.is_empty() {
            return Err(LockError::EmptyNameSet);
        }

        let names = canonical_names(names);
        let token = Uuid::new_v4().simple().to_string();

        for attempt in 0..self.config.max_retries {
            if self.try_acquire_all(&names, &token).await? {
                debug!(
                    op_id = %op_id,
                    token = %token,
                    count = names.len(),
                    attempt = attempt + 1,
                    "acquired all locks"
                );
                return Ok(LockLease {
                    token,
                    names,
                    released: false,
                });
            }

            if attempt + 1 < self.config.max_retries {
                let delay = self.backoff_delay(attempt);
                debug!(
                    op_id = %op_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "lock contention, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }

        warn!(
            op_id = %op_id,
            attempts = self.config.max_retries,
            "failed to acquire locks"
        );
        Err(LockError::Unavailable {
            attempts: self.config.max_retries,
        })
    }

    /// Release every name in the lease. Entries that expired or now belong
    /// to someone else are skipped silently; release never fails.
    pub async fn release(&self, mut lease: LockLease) {
        for name in &lease.names {
            match self
                .kv
                .delete_if_equal(&lock_key(name), &lease.token)
                .await
            {
                Ok(true) => debug!(name = %name, "released lock"),
                Ok(false) => debug!(name = %name, "lock already expired or reassigned"),
                Err(e) => warn!(name = %name, error = %e, "lock release failed"),
            }
        }
        lease.released = true;
    }

    /// One all-or-nothing pass over the sorted names.
    async fn try_acquire_all(&self, names: &[String], token: &str) -> Result<bool, LockError> {
        let mut acquired: Vec<&String> = Vec::with_capacity(names.len());

        for name in names {
            let taken = match self
                .kv
                .set_if_absent(&lock_key(name), token, self.config.ttl)
                .await
            {
                Ok(taken) => taken,
                Err(e) => {
                    self.rollback(&acquired, token).await;
                    return Err(e.into());
                }
            };

            if taken {
                acquired.push(name);
            } else {
                self.rollback(&acquired, token).await;
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn rollback(&self, acquired: &[&String], token: &str) {
        for name in acquired {
            if let Err(e) = self.kv.delete_if_equal(&lock_key(name), token).await {
                warn!(name = %name, error = %e, "rollback release failed");
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_retry_delay.as_millis() as u64;
        let cap = self.config.max_retry_delay.as_millis() as u64;
        let doubled = base
            .saturating_mul(1u64 << attempt.min(BACKOFF_EXP_CAP))
            .min(cap);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        let delay = ((doubled as f64) * jitter) as u64;
        Duration::from_millis(delay.min(cap))
    }
}

fn lock_key(name: &str) -> String {
    format!("lock:{}", name)
}

/// Deduplicate and byte-wise sort the requested names. This global total
/// order is the sole deadlock-prevention mechanism.
fn canonical_names(names: &[&str]) -> Vec<String> {
    names
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use proptest::prelude::*;

    fn fast_config() -> LockConfig {
        LockConfig {
            ttl: Duration::from_secs(5),
            base_retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_millis(40),
            max_retries: 10,
        }
    }

    fn lock_over(kv: &MemoryKv, config: LockConfig) -> MultiLock {
        MultiLock::new(Arc::new(kv.clone()), config)
    }

    #[test]
    fn test_canonical_names_sorted_and_deduped() {
        let names = canonical_names(&["bob", "alice", "bob", "carol"]);
        assert_eq!(names, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_acquire_release_roundtrip() {
        let kv = MemoryKv::new();
        let lock = lock_over(&kv, fast_config());

        let lease = lock.acquire(&["user_2", "user_1"], "op_1").await.unwrap();
        assert_eq!(lease.names(), ["user_1", "user_2"]);
        assert_eq!(
            kv.get("lock:user_1").await.unwrap().as_deref(),
            Some(lease.token())
        );

        lock.release(lease).await;
        assert_eq!(kv.get("lock:user_1").await.unwrap(), None);
        assert_eq!(kv.get("lock:user_2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_held_name_blocks_acquirer() {
        let kv = MemoryKv::new();
        let lock = lock_over(&kv, fast_config());
        let contender = lock_over(
            &kv,
            LockConfig {
                max_retries: 2,
                ..fast_config()
            },
        );

        let lease = lock.acquire(&["user_1"], "op_holder").await.unwrap();

        let err = contender
            .acquire(&["user_1", "user_9"], "op_waiter")
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Unavailable { attempts: 2 }));

        // All-or-nothing: the free name must not stay acquired.
        assert_eq!(kv.get("lock:user_9").await.unwrap(), None);

        lock.release(lease).await;
    }

    #[tokio::test]
    async fn test_contenders_serialise() {
        let kv = MemoryKv::new();

        let mut handles = Vec::new();
        for i in 0..8 {
            let lock = lock_over(&kv, fast_config());
            handles.push(tokio::spawn(async move {
                let lease = lock
                    .acquire(&["user_1", "user_2"], &format!("op_{}", i))
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
                lock.release(lease).await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(kv.get("lock:user_1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lease_expires_without_release() {
        let kv = MemoryKv::new();
        let abandoner = lock_over(
            &kv,
            LockConfig {
                ttl: Duration::from_millis(30),
                ..fast_config()
            },
        );
        let lock = lock_over(&kv, fast_config());

        let lease = abandoner.acquire(&["user_1"], "op_crash").await.unwrap();
        std::mem::forget(lease); // simulated worker crash: no release

        tokio::time::sleep(Duration::from_millis(50)).await;

        let lease = lock.acquire(&["user_1"], "op_after").await.unwrap();
        lock.release(lease).await;
    }

    #[tokio::test]
    async fn test_release_skips_foreign_token() {
        let kv = MemoryKv::new();
        let lock = lock_over(&kv, fast_config());

        let lease = lock.acquire(&["user_1"], "op_1").await.unwrap();

        // Lease expires under us and another worker takes the name.
        kv.delete_if_equal("lock:user_1", lease.token())
            .await
            .unwrap();
        kv.set_if_absent("lock:user_1", "someone-else", Duration::from_secs(5))
            .await
            .unwrap();

        lock.release(lease).await;
        assert_eq!(
            kv.get("lock:user_1").await.unwrap(),
            Some("someone-else".to_string())
        );
    }

    #[tokio::test]
    async fn test_empty_name_set_rejected() {
        let kv = MemoryKv::new();
        let lock = lock_over(&kv, fast_config());
        assert!(matches!(
            lock.acquire(&[], "op_1").await,
            Err(LockError::EmptyNameSet)
        ));
    }

    proptest! {
        #[test]
        fn prop_canonical_names_permutation_invariant(mut names in proptest::collection::vec("[a-z]{1,6}", 1..8)) {
            let forward = canonical_names(&names.iter().map(String::as_str).collect::<Vec<_>>());
            names.reverse();
            let backward = canonical_names(&names.iter().map(String::as_str).collect::<Vec<_>>());
            prop_assert_eq!(&forward, &backward);
            let mut sorted = forward.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(forward, sorted);
        }
    }
}
