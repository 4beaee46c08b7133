//! Transfer Error Types
//!
//! Every failure a caller can observe is a value here, grouped by how it
//! should be handled: validation and domain rejections touch no state and
//! are not retriable; concurrency and infrastructure failures are transient
//! and safe to retry under the same op_id.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::kv::KvError;
use crate::lock::LockError;

#[derive(Error, Debug, Clone)]
pub enum TransferError {
    // === Validation ===
    #[error("invalid transfer request: {0}")]
    InvalidRequest(String),

    #[error("cannot transfer to the same user")]
    SameUserTransfer,

    #[error("amount exceeds {scale} decimal places")]
    InvalidAmount { scale: u32 },

    // === Domain ===
    #[error("insufficient funds: {user} has {balance}, needs {requested}")]
    InsufficientFunds {
        user: String,
        balance: Decimal,
        requested: Decimal,
    },

    #[error("wallet not found: {0}")]
    WalletNotFound(String),

    #[error("wallet {user} is not active (status: {status})")]
    WalletInactive { user: String, status: String },

    // === Concurrency ===
    #[error("could not acquire transfer locks")]
    LockUnavailable,

    #[error("transfer aborted by concurrent updates")]
    ConcurrencyConflict,

    #[error("transfer cancelled")]
    Cancelled,

    // === Infrastructure ===
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl TransferError {
    /// Stable outcome code for completion events and logs.
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidRequest(_) => "INVALID_REQUEST",
            TransferError::SameUserTransfer => "SAME_USER_TRANSFER",
            TransferError::InvalidAmount { .. } => "INVALID_AMOUNT",
            TransferError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            TransferError::WalletNotFound(_) => "WALLET_NOT_FOUND",
            TransferError::WalletInactive { .. } => "WALLET_INACTIVE",
            TransferError::LockUnavailable => "LOCK_UNAVAILABLE",
            TransferError::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            TransferError::Cancelled => "CANCELLED",
            TransferError::Unavailable(_) => "UNAVAILABLE",
        }
    }

    /// Whether resubmitting the same command (same op_id) can succeed.
    /// Idempotency makes such retries safe.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TransferError::LockUnavailable
                | TransferError::ConcurrencyConflict
                | TransferError::Cancelled
                | TransferError::Unavailable(_)
        )
    }
}

impl From<KvError> for TransferError {
    fn from(e: KvError) -> Self {
        TransferError::Unavailable(e.to_string())
    }
}

impl From<LockError> for TransferError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Unavailable { .. } => TransferError::LockUnavailable,
            LockError::EmptyNameSet => {
                TransferError::InvalidRequest("no lock names derived from request".to_string())
            }
            LockError::Kv(kv) => kv.into(),
        }
    }
}
