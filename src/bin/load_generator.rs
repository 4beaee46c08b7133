//! Emit random transfer commands as JSON lines, for piping into the worker:
//!
//! ```text
//! TRANSFER_COUNT=50 load_generator | ledgerflow
//! ```
//!
//! Amounts are random two-decimal values; op_ids are fresh uuids, so every
//! line is a distinct logical transfer.

use anyhow::{Context, Result};
use rand::Rng;
use rust_decimal::Decimal;
use uuid::Uuid;

use ledgerflow::wallet::TransferCommand;

fn main() -> Result<()> {
    let count: usize = std::env::var("TRANSFER_COUNT")
        .unwrap_or_else(|_| "7".to_string())
        .parse()
        .context("TRANSFER_COUNT must be a number")?;
    let user_count: usize = std::env::var("USER_COUNT")
        .unwrap_or_else(|_| "10".to_string())
        .parse()
        .context("USER_COUNT must be a number")?;
    let max_cents: i64 = std::env::var("MAX_AMOUNT_CENTS")
        .unwrap_or_else(|_| "50000".to_string())
        .parse()
        .context("MAX_AMOUNT_CENTS must be a number")?;

    if user_count < 2 {
        anyhow::bail!("need at least 2 users to generate transfers");
    }

    let mut rng = rand::thread_rng();
    for _ in 0..count {
        let from = rng.gen_range(1..=user_count);
        let to = loop {
            let candidate = rng.gen_range(1..=user_count);
            if candidate != from {
                break candidate;
            }
        };
        let amount = Decimal::new(rng.gen_range(1..=max_cents), 2);

        let cmd = TransferCommand::new(
            &format!("tx_{}", Uuid::new_v4().simple()),
            &format!("user_{}", from),
            &format!("user_{}", to),
            amount,
        );
        println!("{}", serde_json::to_string(&cmd)?);
    }

    Ok(())
}
