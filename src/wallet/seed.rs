//! Wallet Seeder
//!
//! Creates wallet records for an environment without ever overwriting one
//! that exists. The existence check and the hash write happen inside a
//! single watched transaction, so two seeders racing on the same user id
//! resolve to exactly one creation.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::types::{FIELD_BALANCE, FIELD_STATUS, STATUS_ACTIVE, wallet_key};
use crate::kv::{KvError, KvStore, WatchedTx};

#[derive(Debug, Clone)]
pub struct WalletSpec {
    pub user_id: String,
    pub balance: Decimal,
    pub currency: String,
}

impl WalletSpec {
    pub fn new(user_id: &str, balance: Decimal) -> Self {
        Self {
            user_id: user_id.to_string(),
            balance,
            currency: "USD".to_string(),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub created: usize,
    pub skipped: usize,
}

pub struct WalletSeeder {
    kv: Arc<dyn KvStore>,
    balance_scale: u32,
}

impl WalletSeeder {
    pub fn new(kv: Arc<dyn KvStore>, balance_scale: u32) -> Self {
        Self { kv, balance_scale }
    }

    /// Create one wallet if absent. Returns true when this call created it.
    pub async fn create_wallet(&self, spec: &WalletSpec) -> Result<bool, KvError> {
        let key = wallet_key(&spec.user_id);
        let mut tx = self.kv.watch(std::slice::from_ref(&key)).await?;

        let existing = tx.hget_multi(&key, &[FIELD_BALANCE]).await?;
        if existing[0].is_some() {
            debug!(user_id = %spec.user_id, "wallet already exists, skipping");
            tx.cancel().await?;
            return Ok(false);
        }

        let mut balance = spec.balance;
        balance.rescale(self.balance_scale);
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        tx.stage_hset(&key, "wallet_id", &format!("wallet_{}", spec.user_id));
        tx.stage_hset(&key, "user_id", &spec.user_id);
        tx.stage_hset(&key, FIELD_BALANCE, &balance.to_string());
        tx.stage_hset(&key, "currency", &spec.currency);
        tx.stage_hset(&key, "created_at", &created_at);
        tx.stage_hset(&key, FIELD_STATUS, STATUS_ACTIVE);

        // A racing creator flips the watched key and our commit backs off.
        let created = tx.commit().await?;
        if created {
            info!(user_id = %spec.user_id, balance = %balance, "created wallet");
        }
        Ok(created)
    }

    /// Seed a batch of wallets, reporting how many were created vs skipped.
    pub async fn seed(&self, specs: &[WalletSpec]) -> Result<SeedReport, KvError> {
        let mut report = SeedReport::default();
        for spec in specs {
            if self.create_wallet(spec).await? {
                report.created += 1;
            } else {
                report.skipped += 1;
            }
        }
        info!(
            created = report.created,
            skipped = report.skipped,
            "wallet seeding finished"
        );
        Ok(report)
    }
}
