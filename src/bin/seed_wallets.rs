//! Seed an environment with demo wallets.
//!
//! ```text
//! REDIS_URL=redis://localhost:6379/0 SEED_USERS=10 SEED_BALANCE=1000.00 seed_wallets
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::info;

use ledgerflow::kv::RedisKv;
use ledgerflow::wallet::{WalletSeeder, WalletSpec};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/0".to_string());
    let user_count: usize = std::env::var("SEED_USERS")
        .unwrap_or_else(|_| "10".to_string())
        .parse()
        .context("SEED_USERS must be a number")?;
    let balance: Decimal = std::env::var("SEED_BALANCE")
        .unwrap_or_else(|_| "1000.00".to_string())
        .parse()
        .context("SEED_BALANCE must be a decimal amount")?;

    let kv = Arc::new(
        RedisKv::connect(&url)
            .await
            .context("failed to connect to redis")?,
    );
    let seeder = WalletSeeder::new(kv, 2);

    let specs: Vec<WalletSpec> = (1..=user_count)
        .map(|i| WalletSpec::new(&format!("user_{}", i), balance))
        .collect();

    let report = seeder.seed(&specs).await?;
    info!(
        created = report.created,
        skipped = report.skipped,
        "seeding complete"
    );
    Ok(())
}
