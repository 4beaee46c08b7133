//! Worker binary: consumes transfer commands as JSON lines on stdin and
//! emits completion events as JSON lines on stdout. Transport framing
//! beyond that is someone else's job; anything that can pipe newline-
//! delimited JSON can feed this process.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use ledgerflow::config::AppConfig;
use ledgerflow::kv::RedisKv;
use ledgerflow::wallet::{
    TransferCommand, TransferCoordinator, TransferWorker, WalletSeeder, WalletSpec,
    command_channel,
};
use ledgerflow::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let env = std::env::var("APP_ENV").unwrap_or_else(|_| "default".to_string());
    let config = AppConfig::load(&env)?;
    let _log_guard = logging::init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_HASH"),
        env = %env,
        "starting ledgerflow worker"
    );

    let kv = Arc::new(
        RedisKv::connect(&config.redis.url)
            .await
            .context("failed to connect to redis")?,
    );

    if config.seed.enabled {
        let seeder = WalletSeeder::new(kv.clone(), config.engine.balance_scale);
        let specs: Vec<WalletSpec> = (1..=config.seed.user_count)
            .map(|i| WalletSpec::new(&format!("user_{}", i), config.seed.initial_balance))
            .collect();
        seeder.seed(&specs).await.context("wallet seeding failed")?;
    }

    let coordinator = Arc::new(TransferCoordinator::new(kv, config.engine.clone()));
    let worker = TransferWorker::new(coordinator, config.worker.concurrency);

    let (cmd_tx, cmd_rx) = command_channel(config.worker.queue_size);
    let (done_tx, mut done_rx) = mpsc::channel(config.worker.queue_size);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut worker_task = tokio::spawn(worker.run(cmd_rx, done_tx, shutdown_rx));

    let printer = tokio::spawn(async move {
        while let Some(event) = done_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "failed to encode completion event"),
            }
        }
    });

    let feed = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<TransferCommand>(line) {
                        Ok(cmd) => {
                            if cmd_tx.send(cmd).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "skipping malformed command line"),
                    }
                }
                Ok(None) => break, // EOF closes the feed
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
        // Dropping the sender lets the worker drain and stop.
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
            feed.abort();
            (&mut worker_task).await?;
        }
        joined = &mut worker_task => {
            joined?;
        }
    }

    printer.await?;
    info!("ledgerflow worker stopped");
    Ok(())
}
