//! ledgerflow - Distributed Wallet Transfer Worker
//!
//! Moves monetary balance between Redis-backed wallets in response to
//! asynchronous transfer commands, with the guarantees a ledger demands:
//! atomic paired debit/credit, no negative balances, and no money created
//! or destroyed by concurrency, retries, or duplicated delivery.
//!
//! # Modules
//!
//! - [`kv`] - Store adapter (Redis backend + in-memory fake)
//! - [`lock`] - Multi-key distributed lock with TTL leases
//! - [`wallet`] - Transfer engine: coordinator, primitive, idempotency,
//!   worker loop, seeder
//! - [`config`] - YAML configuration with env overrides
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod kv;
pub mod lock;
pub mod logging;
pub mod wallet;

// Convenient re-exports at crate root
pub use config::{AppConfig, EngineConfig};
pub use kv::{KvError, KvStore, MemoryKv, RedisKv, WatchedTx};
pub use lock::{LockConfig, LockError, LockLease, MultiLock};
pub use wallet::{
    Applied, TransferCommand, TransferCompleted, TransferCoordinator, TransferError,
    TransferWorker, WalletSeeder, WalletSpec, command_channel,
};
