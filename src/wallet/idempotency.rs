//! Idempotency Guard
//!
//! Maps an operation id to its committed outcome. The fast path is a plain
//! read before any lock is taken; the authoritative write happens inside
//! the same atomic batch as the balance updates, so "recorded" and
//! "visible debit/credit" can never diverge. Records expire after the
//! configured retention.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::TransferError;
use super::types::applied_key;
use crate::kv::{KvStore, WatchedTx};

/// Outcome stored under `applied:<op_id>` once a transfer commits.
/// Only successful transfers are recorded; a rejected transfer leaves no
/// trace and may be resubmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedOutcome {
    #[serde(with = "rust_decimal::serde::str")]
    pub new_from: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub new_to: Decimal,
}

impl RecordedOutcome {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("recorded outcome encodes as json")
    }

    pub fn decode(raw: &str) -> Result<Self, TransferError> {
        serde_json::from_str(raw).map_err(|e| {
            TransferError::Unavailable(format!("corrupt idempotency record: {}", e))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyStatus {
    Applied(RecordedOutcome),
    NotApplied,
}

pub struct IdempotencyGuard {
    kv: Arc<dyn KvStore>,
    retention: Duration,
}

impl IdempotencyGuard {
    pub fn new(kv: Arc<dyn KvStore>, retention: Duration) -> Self {
        Self { kv, retention }
    }

    /// Duplicate-detection fast path. A `NotApplied` answer can race with a
    /// concurrent commit of the same op_id; the watched transaction in the
    /// transfer primitive is what actually closes that window.
    pub async fn check(&self, op_id: &str) -> Result<IdempotencyStatus, TransferError> {
        match self.kv.get(&applied_key(op_id)).await? {
            Some(raw) => Ok(IdempotencyStatus::Applied(RecordedOutcome::decode(&raw)?)),
            None => Ok(IdempotencyStatus::NotApplied),
        }
    }

    /// Enqueue the outcome record into the commit batch of `tx`. Never a
    /// standalone write.
    pub fn stage_record(&self, tx: &mut dyn WatchedTx, op_id: &str, outcome: &RecordedOutcome) {
        tx.stage_set(&applied_key(op_id), &outcome.encode(), Some(self.retention));
    }
}
