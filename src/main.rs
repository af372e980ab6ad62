// Copyright (C) 2025, 2026 Poolpay Developers (see AUTHORS)
//
// This file is part of Poolpay
//
// Poolpay is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Poolpay is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Poolpay. If not, see <https://www.gnu.org/licenses/>.

use clap::Parser;
use poolpay::config::Config;
use poolpay::logging::setup_logging;
use poolpay::rpc::HttpChainRpc;
use poolpay::service::start_payout_tasks;
use poolpay::shares::PoolShares;
use poolpay::store::{PoolStore, assert_payout_weights};
use poolpay::utils::time_provider::SystemTimeProvider;
use poolpay::webhooks::WebhookNotifier;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, env("POOLPAY_CONFIG"))]
    config: String,
    /// Override the configured percentage of the account balance paid
    /// out per direct payout
    #[arg(long)]
    balance_percent_payout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    // hold guard so the file appender flushes on exit
    let _guard = match setup_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            error!("Failed to set up logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Starting poolpay for pool {}...", config.pool.name);
    assert_payout_weights();

    let store = match PoolStore::open(
        &config.store.path,
        config.pool.attempt_payout_interval,
        config.pool.successful_payout_interval,
        config.pool.max_addresses_per_payout,
    )
    .await
    {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open ledger store: {e}");
            return ExitCode::FAILURE;
        }
    };

    let rpc = match HttpChainRpc::new(&config.chainrpc.url) {
        Ok(rpc) => Arc::new(rpc),
        Err(e) => {
            error!("Failed to create chain RPC client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let webhooks = WebhookNotifier::new(config.webhooks.urls.clone(), &config.pool.name);

    let shares = Arc::new(
        PoolShares::new(store.clone(), rpc, SystemTimeProvider, webhooks, &config.pool)
            .with_balance_percent_override(args.balance_percent_payout),
    );

    let handles = start_payout_tasks(shares, &config.pool);

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {e}");
        }
    }

    for handle in handles {
        handle.abort();
    }
    store.close().await;

    ExitCode::SUCCESS
}
