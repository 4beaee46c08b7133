//! Transfer command and outcome types.
//!
//! Amounts travel as decimal strings on the wire and as exact [`Decimal`]s
//! in memory; binary floating point never touches a balance.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::TransferError;

pub const FIELD_BALANCE: &str = "balance";
pub const FIELD_STATUS: &str = "status";
pub const STATUS_ACTIVE: &str = "active";

/// The authoritative account record for `user_id`.
pub fn wallet_key(user_id: &str) -> String {
    format!("wallet:{}", user_id)
}

/// Idempotency record for an operation id.
pub fn applied_key(op_id: &str) -> String {
    format!("applied:{}", op_id)
}

/// One transfer request as delivered by the bus.
///
/// Delivery is at-least-once; `op_id` is the caller-assigned idempotency
/// key that makes redelivery harmless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCommand {
    pub op_id: String,
    pub from: String,
    pub to: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl TransferCommand {
    pub fn new(op_id: &str, from: &str, to: &str, amount: Decimal) -> Self {
        Self {
            op_id: op_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            amount,
            currency: default_currency(),
        }
    }
}

/// Successful transfer outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub new_from: Decimal,
    pub new_to: Decimal,
    /// True when this call observed a previously committed outcome instead
    /// of moving money itself.
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

/// Completion event emitted by the worker for every consumed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCompleted {
    pub op_id: String,
    pub status: CompletionStatus,
    /// Stable outcome code (`APPLIED`, `INSUFFICIENT_FUNDS`, ...).
    pub code: String,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub new_from: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub new_to: Option<Decimal>,
    pub duplicate: bool,
    pub processed_at: DateTime<Utc>,
}

impl TransferCompleted {
    pub fn from_result(cmd: &TransferCommand, result: &Result<Applied, TransferError>) -> Self {
        match result {
            Ok(applied) => Self {
                op_id: cmd.op_id.clone(),
                status: CompletionStatus::Completed,
                code: "APPLIED".to_string(),
                new_from: Some(applied.new_from),
                new_to: Some(applied.new_to),
                duplicate: applied.duplicate,
                processed_at: Utc::now(),
            },
            Err(e) => Self {
                op_id: cmd.op_id.clone(),
                status: CompletionStatus::Failed,
                code: e.code().to_string(),
                new_from: None,
                new_to: None,
                duplicate: false,
                processed_at: Utc::now(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_decodes_string_amount() {
        let json = r#"{"op_id":"tx_1","from":"user_1","to":"user_2","amount":"100.50"}"#;
        let cmd: TransferCommand = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.amount, "100.50".parse::<Decimal>().unwrap());
        assert_eq!(cmd.currency, "USD");
    }

    #[test]
    fn test_command_roundtrip_keeps_scale() {
        let cmd = TransferCommand::new("tx_1", "user_1", "user_2", "10.00".parse().unwrap());
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""amount":"10.00""#));
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(wallet_key("user_1"), "wallet:user_1");
        assert_eq!(applied_key("tx_9"), "applied:tx_9");
    }

    #[test]
    fn test_completion_from_failure() {
        let cmd = TransferCommand::new("tx_1", "user_1", "user_2", "5.00".parse().unwrap());
        let event = TransferCompleted::from_result(&cmd, &Err(TransferError::LockUnavailable));
        assert_eq!(event.status, CompletionStatus::Failed);
        assert_eq!(event.code, "LOCK_UNAVAILABLE");
        assert_eq!(event.new_from, None);
    }
}
