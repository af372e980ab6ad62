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

//! Background timers driving the settlement loops.
//!
//! Each loop ticks independently and logs failures without stopping; a
//! transient store or node error is retried on the next tick.

use crate::config::PoolConfig;
use crate::rpc::ChainRpc;
use crate::shares::PoolShares;
use crate::utils::time_provider::TimeProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Spawn the rollover, payout and confirmation loops. The returned handles
/// are aborted on shutdown.
pub fn start_payout_tasks<C, T>(
    shares: Arc<PoolShares<C, T>>,
    config: &PoolConfig,
) -> Vec<JoinHandle<()>>
where
    C: ChainRpc + 'static,
    T: TimeProvider + 'static,
{
    info!(
        "Starting payout tasks: rollover every {}s, payouts every {}s, confirmations every {}s",
        config.rollover_tick, config.payout_tick, config.confirmation_tick
    );

    let mut handles = Vec::new();

    let rollover_shares = shares.clone();
    let rollover_tick = config.rollover_tick;
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(rollover_tick));
        loop {
            interval.tick().await;
            if let Err(e) = rollover_shares.rollover_payout_period().await {
                error!("Payout period rollover failed: {}", e);
            }
        }
    }));

    let payout_shares = shares.clone();
    let payout_tick = config.payout_tick;
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(payout_tick));
        loop {
            interval.tick().await;
            if let Err(e) = payout_shares.create_new_payout().await {
                error!("Period payout attempt failed: {}", e);
            }
        }
    }));

    let confirmation_shares = shares;
    let confirmation_tick = config.confirmation_tick;
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(confirmation_tick));
        loop {
            interval.tick().await;
            if let Err(e) = confirmation_shares.reconcile_block_statuses().await {
                error!("Block status reconciliation failed: {}", e);
            }
            if let Err(e) = confirmation_shares.reconcile_transaction_statuses().await {
                error!("Transaction status reconciliation failed: {}", e);
            }
        }
    }));

    handles
}
