//! Transfer Coordinator
//!
//! Public entry point for a single transfer. Owns the lock and the
//! idempotency guard and drives them in a fixed order: validate, duplicate
//! fast path, lock `{from, to}` in canonical order, run the primitive,
//! release. The lease is released on every exit path; release is never
//! conditional on success.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::TransferError;
use super::idempotency::{IdempotencyGuard, IdempotencyStatus};
use super::transfer::{self, PrimitiveOutcome};
use super::types::{Applied, TransferCommand};
use crate::config::EngineConfig;
use crate::kv::KvStore;
use crate::lock::{LockConfig, MultiLock};

pub struct TransferCoordinator {
    kv: Arc<dyn KvStore>,
    lock: MultiLock,
    guard: IdempotencyGuard,
    config: EngineConfig,
}

impl TransferCoordinator {
    pub fn new(kv: Arc<dyn KvStore>, config: EngineConfig) -> Self {
        let lock = MultiLock::new(kv.clone(), LockConfig::from(&config));
        let guard = IdempotencyGuard::new(kv.clone(), config.idempotency_ttl());
        Self {
            kv,
            lock,
            guard,
            config,
        }
    }

    /// Execute one transfer command to completion.
    pub async fn transfer(&self, cmd: &TransferCommand) -> Result<Applied, TransferError> {
        self.transfer_inner(cmd, None).await
    }

    /// Like [`transfer`](Self::transfer), but observes `cancel` at
    /// suspension points. Cancellation before commit releases the lock and
    /// changes no balance; once the commit has landed the successful result
    /// is returned and the signal is ignored.
    pub async fn transfer_cancellable(
        &self,
        cmd: &TransferCommand,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Applied, TransferError> {
        self.transfer_inner(cmd, Some(cancel)).await
    }

    async fn transfer_inner(
        &self,
        cmd: &TransferCommand,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<Applied, TransferError> {
        self.validate(cmd)?;

        // Fast path: already committed, return the recorded outcome without
        // taking any lock or writing anything.
        if let IdempotencyStatus::Applied(prior) = self.guard.check(&cmd.op_id).await? {
            debug!(op_id = %cmd.op_id, "duplicate transfer, returning recorded outcome");
            return Ok(Applied {
                new_from: prior.new_from,
                new_to: prior.new_to,
                duplicate: true,
            });
        }

        if super::is_cancelled(cancel) {
            return Err(TransferError::Cancelled);
        }

        let lease = self
            .lock
            .acquire(&[&cmd.from, &cmd.to], &cmd.op_id)
            .await
            .map_err(TransferError::from)?;

        let result = if super::is_cancelled(cancel) {
            Err(TransferError::Cancelled)
        } else {
            transfer::execute(self.kv.as_ref(), &self.guard, &self.config, cmd, cancel).await
        };

        self.lock.release(lease).await;

        match result {
            Ok(PrimitiveOutcome::Applied { new_from, new_to }) => {
                info!(
                    op_id = %cmd.op_id,
                    from = %cmd.from,
                    to = %cmd.to,
                    amount = %cmd.amount,
                    new_from = %new_from,
                    new_to = %new_to,
                    "transfer applied"
                );
                Ok(Applied {
                    new_from,
                    new_to,
                    duplicate: false,
                })
            }
            Ok(PrimitiveOutcome::Replayed(prior)) => {
                debug!(op_id = %cmd.op_id, "transfer already applied by concurrent duplicate");
                Ok(Applied {
                    new_from: prior.new_from,
                    new_to: prior.new_to,
                    duplicate: true,
                })
            }
            Err(e) => {
                warn!(
                    op_id = %cmd.op_id,
                    from = %cmd.from,
                    to = %cmd.to,
                    code = e.code(),
                    error = %e,
                    "transfer rejected"
                );
                Err(e)
            }
        }
    }

    fn validate(&self, cmd: &TransferCommand) -> Result<(), TransferError> {
        if cmd.op_id.trim().is_empty() {
            return Err(TransferError::InvalidRequest(
                "op_id must not be empty".to_string(),
            ));
        }
        if cmd.from.is_empty() || cmd.to.is_empty() {
            return Err(TransferError::InvalidRequest(
                "user ids must not be empty".to_string(),
            ));
        }
        if cmd.from == cmd.to {
            return Err(TransferError::SameUserTransfer);
        }
        if cmd.amount <= rust_decimal::Decimal::ZERO {
            return Err(TransferError::InvalidRequest(
                "amount must be positive".to_string(),
            ));
        }
        // Amounts arrive already scaled; a finer-grained amount is a caller
        // bug, not something to round away.
        if cmd.amount.scale() > self.config.balance_scale {
            return Err(TransferError::InvalidAmount {
                scale: self.config.balance_scale,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemoryKv, WatchedTx};
    use crate::wallet::types::{FIELD_BALANCE, FIELD_STATUS, STATUS_ACTIVE, wallet_key};
    use std::time::Duration;

    async fn seed_wallet(kv: &MemoryKv, user: &str, balance: &str) {
        let key = wallet_key(user);
        let mut tx = kv.watch(&[]).await.unwrap();
        tx.stage_hset(&key, FIELD_BALANCE, balance);
        tx.stage_hset(&key, FIELD_STATUS, STATUS_ACTIVE);
        assert!(tx.commit().await.unwrap());
    }

    async fn balance_of(kv: &MemoryKv, user: &str) -> String {
        kv.hget_multi(&wallet_key(user), &[FIELD_BALANCE])
            .await
            .unwrap()
            .remove(0)
            .unwrap()
    }

    fn fast_engine() -> EngineConfig {
        EngineConfig {
            base_retry_delay_ms: 5,
            max_retry_delay_ms: 40,
            ..EngineConfig::default()
        }
    }

    fn cmd(op_id: &str, from: &str, to: &str, amount: &str) -> TransferCommand {
        TransferCommand::new(op_id, from, to, amount.parse().unwrap())
    }

    #[tokio::test]
    async fn test_validation_rejections() {
        let kv = MemoryKv::new();
        let coordinator = TransferCoordinator::new(Arc::new(kv), fast_engine());

        let err = coordinator
            .transfer(&cmd("tx_1", "user_1", "user_1", "5.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SameUserTransfer));

        let err = coordinator
            .transfer(&cmd("tx_1", "", "user_2", "5.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidRequest(_)));

        let err = coordinator
            .transfer(&cmd("tx_1", "user_1", "user_2", "-5.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidRequest(_)));

        let err = coordinator
            .transfer(&cmd("tx_1", "user_1", "user_2", "5.001"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidAmount { scale: 2 }));

        let err = coordinator
            .transfer(&cmd(" ", "user_1", "user_2", "5.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_self_transfer_leaves_no_lock_behind() {
        let kv = MemoryKv::new();
        seed_wallet(&kv, "user_1", "100.00").await;
        let coordinator = TransferCoordinator::new(Arc::new(kv.clone()), fast_engine());

        let err = coordinator
            .transfer(&cmd("tx_y", "user_1", "user_1", "5.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SameUserTransfer));
        assert_eq!(balance_of(&kv, "user_1").await, "100.00");
        assert_eq!(kv.get("lock:user_1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_takes_fast_path() {
        let kv = MemoryKv::new();
        seed_wallet(&kv, "user_1", "100.00").await;
        seed_wallet(&kv, "user_2", "0.00").await;
        let coordinator = TransferCoordinator::new(Arc::new(kv.clone()), fast_engine());
        let command = cmd("tx_1", "user_1", "user_2", "10.00");

        let first = coordinator.transfer(&command).await.unwrap();
        assert!(!first.duplicate);

        // Hold the locks so the fast path would deadlock if it tried them.
        kv.set_if_absent("lock:user_1", "other", Duration::from_secs(60))
            .await
            .unwrap();
        kv.set_if_absent("lock:user_2", "other", Duration::from_secs(60))
            .await
            .unwrap();

        let second = coordinator.transfer(&command).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.new_from, first.new_from);
        assert_eq!(second.new_to, first.new_to);
        assert_eq!(balance_of(&kv, "user_1").await, "90.00");
    }

    #[tokio::test]
    async fn test_lock_released_after_domain_failure() {
        let kv = MemoryKv::new();
        seed_wallet(&kv, "user_1", "10.00").await;
        seed_wallet(&kv, "user_2", "0.00").await;
        let coordinator = TransferCoordinator::new(Arc::new(kv.clone()), fast_engine());

        let err = coordinator
            .transfer(&cmd("tx_1", "user_1", "user_2", "30.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InsufficientFunds { .. }));

        assert_eq!(kv.get("lock:user_1").await.unwrap(), None);
        assert_eq!(kv.get("lock:user_2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_unavailable_when_held_elsewhere() {
        let kv = MemoryKv::new();
        seed_wallet(&kv, "user_1", "100.00").await;
        seed_wallet(&kv, "user_2", "0.00").await;
        kv.set_if_absent("lock:user_1", "foreign", Duration::from_secs(60))
            .await
            .unwrap();

        let engine = EngineConfig {
            max_retries: 2,
            ..fast_engine()
        };
        let coordinator = TransferCoordinator::new(Arc::new(kv.clone()), engine);

        let err = coordinator
            .transfer(&cmd("tx_1", "user_1", "user_2", "10.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::LockUnavailable));
        assert_eq!(balance_of(&kv, "user_1").await, "100.00");
    }

    #[tokio::test]
    async fn test_cancelled_before_commit() {
        let kv = MemoryKv::new();
        seed_wallet(&kv, "user_1", "100.00").await;
        seed_wallet(&kv, "user_2", "0.00").await;
        let coordinator = TransferCoordinator::new(Arc::new(kv.clone()), fast_engine());

        let (signal, cancel) = watch::channel(true);
        let err = coordinator
            .transfer_cancellable(&cmd("tx_1", "user_1", "user_2", "10.00"), &cancel)
            .await
            .unwrap_err();
        drop(signal);

        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(balance_of(&kv, "user_1").await, "100.00");
        assert_eq!(kv.get("lock:user_1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_signal_low_lets_transfer_through() {
        let kv = MemoryKv::new();
        seed_wallet(&kv, "user_1", "100.00").await;
        seed_wallet(&kv, "user_2", "0.00").await;
        let coordinator = TransferCoordinator::new(Arc::new(kv.clone()), fast_engine());

        let (signal, cancel) = watch::channel(false);
        let applied = coordinator
            .transfer_cancellable(&cmd("tx_1", "user_1", "user_2", "10.00"), &cancel)
            .await
            .unwrap();
        drop(signal);

        assert!(!applied.duplicate);
        assert_eq!(balance_of(&kv, "user_1").await, "90.00");
    }
}
