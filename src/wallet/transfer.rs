//! Transfer Primitive
//!
//! The paired debit/credit, executed under the multi-key lock the
//! coordinator already holds. Each attempt is one watched transaction over
//! both wallets and the idempotency record: read, validate, stage the three
//! writes, commit. A commit abort means a watched key moved underneath us;
//! with the lock held that only happens when a lease expired mid-flight, so
//! the attempt restarts, a bounded number of times.

use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::debug;

use super::error::TransferError;
use super::idempotency::{IdempotencyGuard, RecordedOutcome};
use super::types::{
    FIELD_BALANCE, FIELD_STATUS, STATUS_ACTIVE, TransferCommand, applied_key, wallet_key,
};
use crate::config::EngineConfig;
use crate::kv::{KvStore, WatchedTx};

const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// What one primitive invocation resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrimitiveOutcome {
    /// This call moved the money.
    Applied { new_from: Decimal, new_to: Decimal },
    /// A previous call already moved it; this is the recorded result.
    Replayed(RecordedOutcome),
}

pub(crate) async fn execute(
    kv: &dyn KvStore,
    guard: &IdempotencyGuard,
    config: &EngineConfig,
    cmd: &TransferCommand,
    cancel: Option<&watch::Receiver<bool>>,
) -> Result<PrimitiveOutcome, TransferError> {
    for attempt in 1..=config.tx_max_attempts {
        if super::is_cancelled(cancel) {
            return Err(TransferError::Cancelled);
        }

        match attempt_once(kv, guard, config, cmd).await? {
            Attempt::Committed { new_from, new_to } => {
                return Ok(PrimitiveOutcome::Applied { new_from, new_to });
            }
            Attempt::Replayed(outcome) => {
                return Ok(PrimitiveOutcome::Replayed(outcome));
            }
            Attempt::Conflict => {
                debug!(
                    op_id = %cmd.op_id,
                    attempt,
                    max = config.tx_max_attempts,
                    "watched transaction aborted, retrying"
                );
                if attempt < config.tx_max_attempts {
                    tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
                }
            }
        }
    }

    Err(TransferError::ConcurrencyConflict)
}

enum Attempt {
    Committed { new_from: Decimal, new_to: Decimal },
    Replayed(RecordedOutcome),
    Conflict,
}

async fn attempt_once(
    kv: &dyn KvStore,
    guard: &IdempotencyGuard,
    config: &EngineConfig,
    cmd: &TransferCommand,
) -> Result<Attempt, TransferError> {
    let watched = vec![
        wallet_key(&cmd.from),
        wallet_key(&cmd.to),
        applied_key(&cmd.op_id),
    ];
    let mut tx = kv.watch(&watched).await?;

    match stage_transfer(tx.as_mut(), guard, config, cmd).await {
        Ok(Staged::Replay(outcome)) => {
            tx.cancel().await.map_err(TransferError::from)?;
            Ok(Attempt::Replayed(outcome))
        }
        Ok(Staged::Ready { new_from, new_to }) => {
            if tx.commit().await? {
                Ok(Attempt::Committed { new_from, new_to })
            } else {
                Ok(Attempt::Conflict)
            }
        }
        Err(e) => {
            // Validation or domain rejection: nothing was written, drop the watch.
            let _ = tx.cancel().await;
            Err(e)
        }
    }
}

enum Staged {
    Replay(RecordedOutcome),
    Ready { new_from: Decimal, new_to: Decimal },
}

async fn stage_transfer(
    tx: &mut dyn WatchedTx,
    guard: &IdempotencyGuard,
    config: &EngineConfig,
    cmd: &TransferCommand,
) -> Result<Staged, TransferError> {
    // A duplicate that lost the check-then-lock race lands here and is
    // absorbed without touching the balances.
    if let Some(raw) = tx.get(&applied_key(&cmd.op_id)).await? {
        return Ok(Staged::Replay(RecordedOutcome::decode(&raw)?));
    }

    let from = load_wallet(tx, &cmd.from).await?;
    let to = load_wallet(tx, &cmd.to).await?;

    if from.status != STATUS_ACTIVE {
        return Err(TransferError::WalletInactive {
            user: cmd.from.clone(),
            status: from.status,
        });
    }
    if to.status != STATUS_ACTIVE {
        return Err(TransferError::WalletInactive {
            user: cmd.to.clone(),
            status: to.status,
        });
    }

    if from.balance < cmd.amount {
        return Err(TransferError::InsufficientFunds {
            user: cmd.from.clone(),
            balance: from.balance,
            requested: cmd.amount,
        });
    }

    let mut new_from = from.balance - cmd.amount;
    let mut new_to = to.balance + cmd.amount;
    new_from.rescale(config.balance_scale);
    new_to.rescale(config.balance_scale);

    tx.stage_hset(&wallet_key(&cmd.from), FIELD_BALANCE, &new_from.to_string());
    tx.stage_hset(&wallet_key(&cmd.to), FIELD_BALANCE, &new_to.to_string());
    guard.stage_record(tx, &cmd.op_id, &RecordedOutcome { new_from, new_to });

    Ok(Staged::Ready { new_from, new_to })
}

struct WalletSnapshot {
    balance: Decimal,
    status: String,
}

async fn load_wallet(tx: &mut dyn WatchedTx, user: &str) -> Result<WalletSnapshot, TransferError> {
    let key = wallet_key(user);
    let fields = tx.hget_multi(&key, &[FIELD_BALANCE, FIELD_STATUS]).await?;

    let raw_balance = match fields.first() {
        Some(Some(raw)) => raw.clone(),
        _ => return Err(TransferError::WalletNotFound(user.to_string())),
    };
    let balance: Decimal = raw_balance.parse().map_err(|_| {
        TransferError::Unavailable(format!("corrupt balance for wallet {}: {:?}", user, raw_balance))
    })?;

    let status = fields
        .get(1)
        .cloned()
        .flatten()
        .unwrap_or_else(|| "missing".to_string());

    Ok(WalletSnapshot { balance, status })
}
