//! Wallet Transfer Engine
//!
//! Moves balance between wallets in the shared store, safely under
//! arbitrary worker parallelism and at-least-once command delivery.
//!
//! # Architecture
//!
//! ```text
//! bus feed → TransferWorker → TransferCoordinator
//!                              ├─ IdempotencyGuard   (duplicate fast path)
//!                              ├─ MultiLock           (sorted {from, to} leases)
//!                              └─ transfer primitive  (watched tx: debit + credit + record)
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Conservation**: every committed transfer debits and credits the same
//!    amount in one atomic batch; money is never created or destroyed.
//! 2. **Non-negativity**: the debit is validated against the live balance
//!    inside the watched transaction; no balance goes below zero.
//! 3. **All-or-nothing**: the debit, the credit, and the idempotency record
//!    commit together or not at all.
//! 4. **Single holder**: at most one live lease per lock name; expiry counts
//!    as release.

pub mod coordinator;
pub mod error;
pub mod idempotency;
pub mod seed;
mod transfer;
pub mod types;
pub mod worker;

pub use coordinator::TransferCoordinator;
pub use error::TransferError;
pub use idempotency::{IdempotencyGuard, IdempotencyStatus, RecordedOutcome};
pub use seed::{SeedReport, WalletSeeder, WalletSpec};
pub use types::{Applied, CompletionStatus, TransferCommand, TransferCompleted};
pub use worker::{TransferWorker, command_channel};

use tokio::sync::watch;

/// Cooperative cancellation probe used at suspension points.
pub(crate) fn is_cancelled(cancel: Option<&watch::Receiver<bool>>) -> bool {
    cancel.map(|c| *c.borrow()).unwrap_or(false)
}
