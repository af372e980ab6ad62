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

//! Accounting and settlement orchestration: share submission, payout period
//! lifecycle, the two payout strategies and chain reconciliation.
//!
//! Chain RPC calls never happen inside a store transaction. A payout first
//! claims its slot (or submits its transaction), then records the outcome;
//! a crash between the two leaves a claim that expires on its own.

use crate::config::PoolConfig;
use crate::rpc::{ChainRpc, ChainRpcError, TransactionOutput};
use crate::store::{BlockRow, PayoutTransactionRow, PoolStore, StoreError};
use crate::utils::time_provider::TimeProvider;
use crate::webhooks::WebhookNotifier;
use num_bigint::BigUint;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Hash recorded on a payout transaction claim before the node has
/// returned the real one
const PENDING_TRANSACTION_HASH: &str = "pending";

#[derive(Debug)]
pub enum SharesError {
    Store(StoreError),
    Rpc(ChainRpcError),
}

impl fmt::Display for SharesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharesError::Store(e) => write!(f, "Store error: {e}"),
            SharesError::Rpc(e) => write!(f, "Chain RPC error: {e}"),
        }
    }
}

impl Error for SharesError {}

impl From<StoreError> for SharesError {
    fn from(err: StoreError) -> Self {
        SharesError::Store(err)
    }
}

impl From<ChainRpcError> for SharesError {
    fn from(err: ChainRpcError) -> Self {
        SharesError::Rpc(err)
    }
}

pub struct PoolShares<C: ChainRpc, T: TimeProvider> {
    store: Arc<PoolStore>,
    rpc: Arc<C>,
    time: T,
    webhooks: WebhookNotifier,
    pool_name: String,
    account_name: String,
    recent_share_cutoff: u64,
    balance_percent_payout: u64,
    balance_percent_override: Option<u64>,
    payout_period_duration: u64,
    enable_payouts: bool,
}

impl<C: ChainRpc, T: TimeProvider> PoolShares<C, T> {
    pub fn new(
        store: Arc<PoolStore>,
        rpc: Arc<C>,
        time: T,
        webhooks: WebhookNotifier,
        config: &PoolConfig,
    ) -> Self {
        Self {
            store,
            rpc,
            time,
            webhooks,
            pool_name: config.name.clone(),
            account_name: config.account_name.clone(),
            recent_share_cutoff: config.recent_share_cutoff,
            balance_percent_payout: config.balance_percent_payout,
            balance_percent_override: None,
            payout_period_duration: config.payout_period_duration,
            enable_payouts: config.enable_payouts,
        }
    }

    /// Override the configured balance payout percent, e.g. from a CLI flag
    pub fn with_balance_percent_override(mut self, percent: Option<u64>) -> Self {
        self.balance_percent_override = percent;
        self
    }

    /// Record one accepted share for the given miner
    pub async fn submit_share(&self, public_address: &str) -> Result<(), SharesError> {
        let now = self.time.seconds_since_epoch();
        self.store.new_share(public_address, now).await?;
        Ok(())
    }

    /// Record a block mined by the pool. Some node APIs report the miner
    /// reward as a negative delta, so the magnitude is taken.
    pub async fn submit_block(
        &self,
        sequence: u64,
        hash: &str,
        reward: i64,
    ) -> Result<(), SharesError> {
        let reward = BigUint::from(reward.unsigned_abs());
        let now = self.time.seconds_since_epoch();
        self.store.new_block(sequence, hash, &reward, now).await?;
        Ok(())
    }

    /// Close the open payout period once it has exceeded its configured
    /// duration. Creates the initial period on first run.
    pub async fn rollover_payout_period(&self) -> Result<(), SharesError> {
        let now = self.time.seconds_since_epoch();
        let cutoff = now.saturating_sub(self.payout_period_duration);

        if let Some(period) = self.store.current_payout_period().await? {
            if period.start > cutoff {
                // Current payout period has not exceeded its duration yet
                return Ok(());
            }
        }

        self.store.rollover_payout_period(now).await?;
        Ok(())
    }

    /// Direct payout strategy: split a configured percentage of the pool
    /// account balance across all unpaid shares, proportionally per address.
    pub async fn create_payout(&self) -> Result<(), SharesError> {
        if !self.enable_payouts {
            return Ok(());
        }

        // Timestamps have 1 second granularity, so cut off 1 second ago to
        // exclude shares landing in the current second
        let cutoff = self.time.seconds_since_epoch() - 1;

        // Claim the payout slot. The conditional insert doubles as the lock
        // against concurrent and too-frequent payouts.
        let payout_id = match self.store.new_payout(cutoff).await? {
            Some(id) => id,
            None => {
                info!("Another payout may be in progress or a payout was made too recently, skipping.");
                return Ok(());
            }
        };

        let shares = self.store.shares_for_payout(cutoff).await?;
        let (total_shares, share_counts) = sum_shares(&shares);
        if total_shares == 0 {
            info!("No shares submitted since last payout, skipping.");
            return Ok(());
        }

        let balance = self.rpc.get_account_balance(&self.account_name).await?;
        let percent = self
            .balance_percent_override
            .unwrap_or(self.balance_percent_payout);
        let payout_amount = balance.confirmed * percent / BigUint::from(100u32);

        // Each share must earn at least 1 unit after paying an estimated
        // fee of 1 unit per recipient
        let minimum = BigUint::from(total_shares + share_counts.len() as u64);
        if payout_amount <= minimum {
            info!("Insufficient funds for payout, skipping.");
            return Ok(());
        }

        let total = BigUint::from(total_shares);
        let outputs: Vec<TransactionOutput> = share_counts
            .iter()
            .map(|(address, count)| TransactionOutput {
                public_address: address.clone(),
                amount: (&payout_amount * *count / &total).to_string(),
                memo: format!("{} payout {}", self.pool_name, cutoff),
                asset_id: None,
            })
            .collect();

        debug!(
            "Creating payout {}, shares: {}, outputs: {}",
            payout_id,
            total_shares,
            outputs.len()
        );
        self.webhooks
            .payout_started(Some(payout_id), &outputs, total_shares)
            .await;

        // Fee estimate of one unit per output
        let fee = outputs.len() as u64;
        match self
            .rpc
            .send_transaction(&self.account_name, &outputs, fee)
            .await
        {
            Ok(hash) => {
                self.store
                    .mark_payout_success(payout_id, cutoff, &hash)
                    .await?;
                debug!("Payout {} succeeded", payout_id);
                self.webhooks
                    .payout_success(Some(payout_id), &hash, &outputs, total_shares)
                    .await;
            }
            Err(e) => {
                error!("There was an error with the payout transaction: {}", e);
                self.webhooks
                    .payout_error(Some(payout_id), &e.to_string())
                    .await;
            }
        }

        Ok(())
    }

    /// Period payout strategy: pay the oldest fully settled period's unpaid
    /// shares out of its weighted block reward window.
    pub async fn create_new_payout(&self) -> Result<(), SharesError> {
        if !self.enable_payouts {
            return Ok(());
        }

        let period = match self.store.earliest_outstanding_payout_period().await? {
            Some(period) => period,
            None => {
                debug!("No outstanding shares, skipping payout");
                return Ok(());
            }
        };

        // The open period is still accumulating shares
        if period.end.is_none() {
            return Ok(());
        }

        if !self.store.payout_period_blocks_confirmed(period.id).await? {
            return Ok(());
        }

        let addresses = self.store.payout_addresses(period.id).await?;
        if addresses.is_empty() {
            return Ok(());
        }

        let total_reward = self.store.get_payout_reward(period.id).await?;

        // Subtract the recipient count as the transaction fee estimate
        let fee = BigUint::from(addresses.len());
        if total_reward <= fee {
            info!(
                "Reward for payout period {} does not cover fees, skipping.",
                period.id
            );
            return Ok(());
        }
        let total_amount = total_reward - fee;

        // The period came from earliest_outstanding_payout_period, so it has
        // at least one unpaid share. A zero divisor here is a logic defect.
        let total_share_count = self.store.payout_period_share_count(period.id).await?;
        assert!(
            total_share_count > 0,
            "outstanding payout period {} has no shares",
            period.id
        );

        let amount_per_share = &total_amount / BigUint::from(total_share_count);
        if amount_per_share == BigUint::ZERO {
            info!(
                "Reward for payout period {} is too small to pay per share, skipping.",
                period.id
            );
            return Ok(());
        }

        let outputs: Vec<TransactionOutput> = addresses
            .iter()
            .map(|entry| TransactionOutput {
                public_address: entry.public_address.clone(),
                amount: (&amount_per_share * entry.share_count).to_string(),
                memo: format!("{} payout for period {}", self.pool_name, period.id),
                asset_id: None,
            })
            .collect();

        debug!(
            "Paying out period {}: {} total amount, {} total shares, {} per share, {} recipients",
            period.id,
            total_amount,
            total_share_count,
            amount_per_share,
            outputs.len()
        );
        // Claim the period before touching the chain: the conditional insert
        // attributes the shares and excludes every other concurrent payer.
        // The placeholder hash is replaced once the node returns the real one.
        let now = self.time.seconds_since_epoch();
        let transaction_id = match self
            .store
            .new_transaction_with_shares(PENDING_TRANSACTION_HASH, period.id, now)
            .await?
        {
            Some(id) => id,
            None => {
                debug!(
                    "A payout transaction for period {} is already in flight, skipping",
                    period.id
                );
                return Ok(());
            }
        };

        self.webhooks
            .payout_started(Some(period.id), &outputs, total_share_count)
            .await;

        let fee = outputs.len() as u64;
        match self
            .rpc
            .send_transaction(&self.account_name, &outputs, fee)
            .await
        {
            Ok(hash) => {
                self.store
                    .update_transaction_hash(transaction_id, &hash)
                    .await?;
                debug!("Payout for period {} succeeded", period.id);
                self.webhooks
                    .payout_success(Some(period.id), &hash, &outputs, total_share_count)
                    .await;
            }
            Err(e) => {
                // Submission never happened: expire the claim and return
                // the shares so a later cycle retries
                error!("There was an error with the payout transaction: {}", e);
                self.store
                    .update_transaction_status(transaction_id, false, true)
                    .await?;
                self.store.mark_shares_unpaid(transaction_id).await?;
                self.webhooks
                    .payout_error(Some(period.id), &e.to_string())
                    .await;
            }
        }

        Ok(())
    }

    /// Poll the chain for every unconfirmed block and record status
    /// changes. A failed status query is logged and skipped so one
    /// unreachable lookup does not starve the rest of the batch.
    pub async fn reconcile_block_statuses(&self) -> Result<(), SharesError> {
        for block in self.store.unconfirmed_blocks().await? {
            let status = match self
                .rpc
                .get_block_status(&block.block_hash, block.block_sequence)
                .await
            {
                Ok(status) => status,
                Err(e) => {
                    error!(
                        "Failed to query status for block {}: {}",
                        block.block_hash, e
                    );
                    continue;
                }
            };
            self.update_block_status(&block, status.main, status.confirmed)
                .await?;
        }
        Ok(())
    }

    /// Record a block's chain status if it changed
    pub async fn update_block_status(
        &self,
        block: &BlockRow,
        main: bool,
        confirmed: bool,
    ) -> Result<(), SharesError> {
        if main == block.main && confirmed == block.confirmed {
            return Ok(());
        }
        self.store
            .update_block_status(block.id, main, confirmed)
            .await?;
        Ok(())
    }

    /// Poll the chain for every pending payout transaction and record
    /// status changes
    pub async fn reconcile_transaction_statuses(&self) -> Result<(), SharesError> {
        for transaction in self.store.unconfirmed_transactions().await? {
            let status = match self
                .rpc
                .get_transaction_status(&transaction.transaction_hash)
                .await
            {
                Ok(status) => status,
                Err(e) => {
                    error!(
                        "Failed to query status for transaction {}: {}",
                        transaction.transaction_hash, e
                    );
                    continue;
                }
            };
            self.update_payout_transaction_status(&transaction, status.confirmed, status.expired)
                .await?;
        }
        Ok(())
    }

    /// Record a payout transaction's status if it changed. A transaction
    /// that expired without confirming returns its shares to the unpaid
    /// pool so a later payout picks them up.
    pub async fn update_payout_transaction_status(
        &self,
        transaction: &PayoutTransactionRow,
        confirmed: bool,
        expired: bool,
    ) -> Result<(), SharesError> {
        if confirmed == transaction.confirmed && expired == transaction.expired {
            return Ok(());
        }

        self.store
            .update_transaction_status(transaction.id, confirmed, expired)
            .await?;

        if expired && !confirmed {
            let returned = self.store.mark_shares_unpaid(transaction.id).await?;
            info!(
                "Payout transaction {} expired, returned {} shares",
                transaction.transaction_hash, returned
            );
        }

        Ok(())
    }

    /// Shares per second over the recent share window
    pub async fn share_rate(&self, public_address: Option<&str>) -> Result<f64, SharesError> {
        let since = self
            .time
            .seconds_since_epoch()
            .saturating_sub(self.recent_share_cutoff);
        let count = self.store.share_count_since(since, public_address).await?;
        Ok(count as f64 / self.recent_share_cutoff as f64)
    }

    pub async fn shares_pending_payout(
        &self,
        public_address: Option<&str>,
    ) -> Result<u64, SharesError> {
        let count = self.store.shares_count_for_payout(public_address).await?;
        Ok(count)
    }

    pub async fn unconfirmed_blocks(&self) -> Result<Vec<BlockRow>, SharesError> {
        let blocks = self.store.unconfirmed_blocks().await?;
        Ok(blocks)
    }

    pub async fn unconfirmed_payout_transactions(
        &self,
    ) -> Result<Vec<PayoutTransactionRow>, SharesError> {
        let transactions = self.store.unconfirmed_transactions().await?;
        Ok(transactions)
    }
}

/// Total share count plus per-address counts, in address order
fn sum_shares(shares: &[crate::store::ShareRow]) -> (u64, BTreeMap<String, u64>) {
    let mut totals = BTreeMap::new();
    for share in shares {
        *totals.entry(share.public_address.clone()).or_insert(0u64) += 1;
    }
    let total = shares.len() as u64;
    (total, totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::rpc::{AccountBalance, BlockStatus, TransactionStatus};
    use crate::utils::time_provider::TestTimeProvider;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct MockChainRpc {
        balance: BigUint,
        next_hash: String,
        fail_send: bool,
        sent: Mutex<Vec<(String, Vec<TransactionOutput>)>>,
        block_statuses: Mutex<HashMap<String, BlockStatus>>,
        transaction_statuses: Mutex<HashMap<String, TransactionStatus>>,
        status_errors: Mutex<HashSet<String>>,
    }

    impl MockChainRpc {
        fn new(balance: u64) -> Self {
            Self {
                balance: BigUint::from(balance),
                next_hash: "txhash".to_string(),
                fail_send: false,
                sent: Mutex::new(Vec::new()),
                block_statuses: Mutex::new(HashMap::new()),
                transaction_statuses: Mutex::new(HashMap::new()),
                status_errors: Mutex::new(HashSet::new()),
            }
        }

        fn failing_send(mut self) -> Self {
            self.fail_send = true;
            self
        }

        fn set_block_status(&self, hash: &str, main: bool, confirmed: bool) {
            self.block_statuses
                .lock()
                .unwrap()
                .insert(hash.to_string(), BlockStatus { main, confirmed });
        }

        fn set_transaction_status(&self, hash: &str, confirmed: bool, expired: bool) {
            self.transaction_statuses
                .lock()
                .unwrap()
                .insert(hash.to_string(), TransactionStatus { confirmed, expired });
        }

        fn set_status_error(&self, hash: &str) {
            self.status_errors
                .lock()
                .unwrap()
                .insert(hash.to_string());
        }

        fn sent_outputs(&self) -> Vec<(String, Vec<TransactionOutput>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl ChainRpc for MockChainRpc {
        async fn get_account_balance(
            &self,
            _account: &str,
        ) -> Result<AccountBalance, ChainRpcError> {
            Ok(AccountBalance {
                confirmed: self.balance.clone(),
            })
        }

        async fn send_transaction(
            &self,
            from_account: &str,
            outputs: &[TransactionOutput],
            _fee: u64,
        ) -> Result<String, ChainRpcError> {
            if self.fail_send {
                return Err(ChainRpcError::Other("node unavailable".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((from_account.to_string(), outputs.to_vec()));
            Ok(self.next_hash.clone())
        }

        async fn get_block_status(
            &self,
            hash: &str,
            _sequence: u64,
        ) -> Result<BlockStatus, ChainRpcError> {
            if self.status_errors.lock().unwrap().contains(hash) {
                return Err(ChainRpcError::Other("node unavailable".to_string()));
            }
            Ok(*self
                .block_statuses
                .lock()
                .unwrap()
                .get(hash)
                .unwrap_or(&BlockStatus {
                    main: true,
                    confirmed: false,
                }))
        }

        async fn get_transaction_status(
            &self,
            hash: &str,
        ) -> Result<TransactionStatus, ChainRpcError> {
            if self.status_errors.lock().unwrap().contains(hash) {
                return Err(ChainRpcError::Other("node unavailable".to_string()));
            }
            Ok(*self
                .transaction_statuses
                .lock()
                .unwrap()
                .get(hash)
                .unwrap_or(&TransactionStatus {
                    confirmed: false,
                    expired: false,
                }))
        }
    }

    fn test_config() -> PoolConfig {
        PoolConfig {
            name: "testpool".to_string(),
            account_name: "default".to_string(),
            recent_share_cutoff: 600,
            balance_percent_payout: 10,
            attempt_payout_interval: 900,
            successful_payout_interval: 3600,
            payout_period_duration: 7200,
            max_addresses_per_payout: 250,
            enable_payouts: true,
            rollover_tick: 10,
            payout_tick: 60,
            confirmation_tick: 30,
        }
    }

    async fn test_shares(
        dir: &tempfile::TempDir,
        rpc: MockChainRpc,
        time: TestTimeProvider,
        config: PoolConfig,
    ) -> (
        PoolShares<MockChainRpc, TestTimeProvider>,
        Arc<PoolStore>,
        Arc<MockChainRpc>,
    ) {
        let store = Arc::new(
            PoolStore::open(
                dir.path().join("ledger.sqlite").to_str().unwrap(),
                config.attempt_payout_interval,
                config.successful_payout_interval,
                config.max_addresses_per_payout,
            )
            .await
            .unwrap(),
        );
        let rpc = Arc::new(rpc);
        let shares = PoolShares::new(
            store.clone(),
            rpc.clone(),
            time,
            WebhookNotifier::new(vec![], "testpool"),
            &config,
        );
        (shares, store, rpc)
    }

    #[tokio::test]
    async fn test_rollover_respects_period_duration() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, store, _) =
            test_shares(&dir, MockChainRpc::new(0), time.clone(), test_config()).await;

        // First call creates the initial period
        shares.rollover_payout_period().await.unwrap();
        let first = store.current_payout_period().await.unwrap().unwrap();
        assert_eq!(first.start, 10_000);

        // Within the duration: no rollover
        time.advance(7199);
        shares.rollover_payout_period().await.unwrap();
        assert_eq!(
            store.current_payout_period().await.unwrap().unwrap().id,
            first.id
        );

        // Past the duration: rolls over
        time.advance(1);
        shares.rollover_payout_period().await.unwrap();
        let second = store.current_payout_period().await.unwrap().unwrap();
        assert_eq!(second.id, first.id + 1);
        assert_eq!(second.start, 17_200);
    }

    #[tokio::test]
    async fn test_submit_block_normalizes_negative_reward() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, store, _) =
            test_shares(&dir, MockChainRpc::new(0), time, test_config()).await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_block(5, "hash1", -200_000).await.unwrap();

        let blocks = store.unconfirmed_blocks().await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].miner_reward, BigUint::from(200_000u64));
        assert_eq!(blocks[0].block_sequence, 5);
    }

    #[tokio::test]
    async fn test_period_payout_end_to_end() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, store, rpc) =
            test_shares(&dir, MockChainRpc::new(0), time.clone(), test_config()).await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        shares.submit_share("addr2").await.unwrap();
        shares.submit_block(1, "blockhash", 200_000).await.unwrap();

        // Confirm the block on the main chain
        rpc.set_block_status("blockhash", true, true);
        shares.reconcile_block_statuses().await.unwrap();

        // Close the period
        time.advance(7200);
        shares.rollover_payout_period().await.unwrap();

        shares.create_new_payout().await.unwrap();

        // Reward window: 200000 * 50% = 100000. Fee estimate of 1 per
        // recipient leaves 99998 across 4 shares, 24999 each.
        let sent = rpc.sent_outputs();
        assert_eq!(sent.len(), 1);
        let (account, outputs) = &sent[0];
        assert_eq!(account, "default");
        assert_eq!(outputs.len(), 2);

        let by_address: HashMap<&str, &str> = outputs
            .iter()
            .map(|o| (o.public_address.as_str(), o.amount.as_str()))
            .collect();
        assert_eq!(by_address["addr1"], "74997");
        assert_eq!(by_address["addr2"], "24999");

        // All period shares are now attributed to the transaction
        assert_eq!(store.pending_share_count(None).await.unwrap(), 0);
        let transactions = store.unconfirmed_transactions().await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].transaction_hash, "txhash");
    }

    #[tokio::test]
    async fn test_period_payout_skips_open_period() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, _, rpc) =
            test_shares(&dir, MockChainRpc::new(0), time, test_config()).await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();

        shares.create_new_payout().await.unwrap();
        assert!(rpc.sent_outputs().is_empty());
    }

    #[tokio::test]
    async fn test_period_payout_waits_for_block_confirmation() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, _, rpc) =
            test_shares(&dir, MockChainRpc::new(0), time.clone(), test_config()).await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        shares.submit_block(1, "blockhash", 200_000).await.unwrap();

        time.advance(7200);
        shares.rollover_payout_period().await.unwrap();

        // Block still unconfirmed: the payout stalls
        shares.create_new_payout().await.unwrap();
        assert!(rpc.sent_outputs().is_empty());

        rpc.set_block_status("blockhash", true, true);
        shares.reconcile_block_statuses().await.unwrap();
        shares.create_new_payout().await.unwrap();
        assert_eq!(rpc.sent_outputs().len(), 1);
    }

    #[tokio::test]
    async fn test_period_payout_send_failure_keeps_shares_unpaid() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, store, rpc) = test_shares(
            &dir,
            MockChainRpc::new(0).failing_send(),
            time.clone(),
            test_config(),
        )
        .await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        shares.submit_block(1, "blockhash", 200_000).await.unwrap();
        rpc.set_block_status("blockhash", true, true);
        shares.reconcile_block_statuses().await.unwrap();

        time.advance(7200);
        shares.rollover_payout_period().await.unwrap();

        shares.create_new_payout().await.unwrap();

        // The claim taken before the send was expired and its shares
        // returned: shares stay pending, no live transaction row
        assert_eq!(store.pending_share_count(None).await.unwrap(), 1);
        assert!(store.unconfirmed_transactions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_period_payout_skips_while_claim_in_flight() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let mut config = test_config();
        // One address per transaction, so the period needs two payouts
        config.max_addresses_per_payout = 1;
        let (shares, store, rpc) =
            test_shares(&dir, MockChainRpc::new(0), time.clone(), config).await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        shares.submit_share("addr2").await.unwrap();
        shares.submit_block(1, "blockhash", 200_000).await.unwrap();
        rpc.set_block_status("blockhash", true, true);
        shares.reconcile_block_statuses().await.unwrap();

        time.advance(7200);
        shares.rollover_payout_period().await.unwrap();

        shares.create_new_payout().await.unwrap();
        assert_eq!(rpc.sent_outputs().len(), 1);
        assert_eq!(store.pending_share_count(None).await.unwrap(), 1);

        // The first transaction is unresolved: the second attempt takes no
        // claim and submits nothing, even though a share is outstanding
        shares.create_new_payout().await.unwrap();
        assert_eq!(rpc.sent_outputs().len(), 1);
        assert_eq!(store.pending_share_count(None).await.unwrap(), 1);

        // Once it confirms, the remaining address gets its payout
        rpc.set_transaction_status("txhash", true, false);
        shares.reconcile_transaction_statuses().await.unwrap();
        shares.create_new_payout().await.unwrap();
        assert_eq!(rpc.sent_outputs().len(), 2);
        assert_eq!(store.pending_share_count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_block_reconcile_continues_past_rpc_error() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, store, rpc) =
            test_shares(&dir, MockChainRpc::new(0), time, test_config()).await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_block(1, "hash1", 100_000).await.unwrap();
        shares.submit_block(2, "hash2", 100_000).await.unwrap();

        rpc.set_status_error("hash1");
        rpc.set_block_status("hash2", true, true);

        // hash1's lookup fails but hash2 still gets reconciled
        shares.reconcile_block_statuses().await.unwrap();
        let remaining = store.unconfirmed_blocks().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].block_hash, "hash1");
    }

    #[tokio::test]
    async fn test_transaction_reconcile_continues_past_rpc_error() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, store, rpc) =
            test_shares(&dir, MockChainRpc::new(0), time, test_config()).await;

        shares.rollover_payout_period().await.unwrap();
        let first = store.current_payout_period().await.unwrap().unwrap();
        shares.submit_share("addr1").await.unwrap();
        store.rollover_payout_period(20_000).await.unwrap();
        let second = store.current_payout_period().await.unwrap().unwrap();
        shares.submit_share("addr2").await.unwrap();

        store
            .new_transaction_with_shares("t1", first.id, 20_100)
            .await
            .unwrap()
            .unwrap();
        store
            .new_transaction_with_shares("t2", second.id, 20_100)
            .await
            .unwrap()
            .unwrap();

        rpc.set_status_error("t1");
        rpc.set_transaction_status("t2", true, false);

        shares.reconcile_transaction_statuses().await.unwrap();
        let remaining = store.unconfirmed_transactions().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].transaction_hash, "t1");
    }

    #[tokio::test]
    async fn test_update_block_status_unchanged_is_noop() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, store, _) =
            test_shares(&dir, MockChainRpc::new(0), time, test_config()).await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_block(1, "hash1", 100_000).await.unwrap();

        let block = store.unconfirmed_blocks().await.unwrap().remove(0);
        assert!(block.main);
        assert!(!block.confirmed);

        // Same flags: no write happens
        shares
            .update_block_status(&block, block.main, block.confirmed)
            .await
            .unwrap();
        let after = store.unconfirmed_blocks().await.unwrap().remove(0);
        assert_eq!(after, block);

        // Changed flags do write
        shares.update_block_status(&block, false, false).await.unwrap();
        let changed = store.unconfirmed_blocks().await.unwrap().remove(0);
        assert!(!changed.main);
    }

    #[tokio::test]
    async fn test_update_payout_transaction_status_unchanged_is_noop() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, store, _) =
            test_shares(&dir, MockChainRpc::new(0), time, test_config()).await;

        shares.rollover_payout_period().await.unwrap();
        let period = store.current_payout_period().await.unwrap().unwrap();
        shares.submit_share("addr1").await.unwrap();
        store
            .new_transaction_with_shares("t1", period.id, 10_100)
            .await
            .unwrap()
            .unwrap();

        let transaction = store.unconfirmed_transactions().await.unwrap().remove(0);
        assert_eq!(store.pending_share_count(None).await.unwrap(), 0);

        // Same flags: no write, no share movement
        shares
            .update_payout_transaction_status(
                &transaction,
                transaction.confirmed,
                transaction.expired,
            )
            .await
            .unwrap();
        let after = store.unconfirmed_transactions().await.unwrap().remove(0);
        assert_eq!(after, transaction);
        assert_eq!(store.pending_share_count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_direct_payout_percent_override() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, _, rpc) = test_shares(
            &dir,
            MockChainRpc::new(1_000_000),
            time.clone(),
            test_config(),
        )
        .await;
        let shares = shares.with_balance_percent_override(Some(50));

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        time.advance(10);
        shares.create_payout().await.unwrap();

        // 50% override beats the configured 10%
        let sent = rpc.sent_outputs();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1[0].amount, "500000");
    }

    #[tokio::test]
    async fn test_direct_payout_proportional_outputs() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, store, rpc) = test_shares(
            &dir,
            MockChainRpc::new(1_000_000),
            time.clone(),
            test_config(),
        )
        .await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        shares.submit_share("addr2").await.unwrap();

        // Shares are only payable once older than the cutoff second
        time.advance(10);
        shares.create_payout().await.unwrap();

        // 10% of 1_000_000 = 100_000 split 3:1
        let sent = rpc.sent_outputs();
        assert_eq!(sent.len(), 1);
        let by_address: HashMap<&str, &str> = sent[0]
            .1
            .iter()
            .map(|o| (o.public_address.as_str(), o.amount.as_str()))
            .collect();
        assert_eq!(by_address["addr1"], "75000");
        assert_eq!(by_address["addr2"], "25000");

        // All shares are attributed to the succeeded payout
        assert_eq!(shares.shares_pending_payout(None).await.unwrap(), 0);
        assert_eq!(store.shares_count_for_payout(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_direct_payout_guard_blocks_second_run() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, _, rpc) = test_shares(
            &dir,
            MockChainRpc::new(1_000_000),
            time.clone(),
            test_config(),
        )
        .await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        time.advance(10);
        shares.create_payout().await.unwrap();
        assert_eq!(rpc.sent_outputs().len(), 1);

        // New share, but the successful payout interval has not elapsed
        shares.submit_share("addr2").await.unwrap();
        time.advance(10);
        shares.create_payout().await.unwrap();
        assert_eq!(rpc.sent_outputs().len(), 1);
    }

    #[tokio::test]
    async fn test_direct_payout_insufficient_balance_skips() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        // Balance of 30 at 10% pays 3, not enough for 2 shares + 2 fees
        let (shares, store, rpc) =
            test_shares(&dir, MockChainRpc::new(30), time.clone(), test_config()).await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        shares.submit_share("addr2").await.unwrap();
        time.advance(10);
        shares.create_payout().await.unwrap();

        assert!(rpc.sent_outputs().is_empty());
        assert_eq!(store.shares_count_for_payout(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_direct_payout_send_failure_leaves_shares_unpaid() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, store, _) = test_shares(
            &dir,
            MockChainRpc::new(1_000_000).failing_send(),
            time.clone(),
            test_config(),
        )
        .await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        time.advance(10);
        shares.create_payout().await.unwrap();

        assert_eq!(store.shares_count_for_payout(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_payouts_disabled() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let mut config = test_config();
        config.enable_payouts = false;
        let (shares, _, rpc) =
            test_shares(&dir, MockChainRpc::new(1_000_000), time.clone(), config).await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        time.advance(10);
        shares.create_payout().await.unwrap();
        shares.create_new_payout().await.unwrap();

        assert!(rpc.sent_outputs().is_empty());
    }

    #[tokio::test]
    async fn test_expired_transaction_returns_shares() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, store, rpc) =
            test_shares(&dir, MockChainRpc::new(0), time.clone(), test_config()).await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        shares.submit_block(1, "blockhash", 200_000).await.unwrap();
        rpc.set_block_status("blockhash", true, true);
        shares.reconcile_block_statuses().await.unwrap();

        time.advance(7200);
        shares.rollover_payout_period().await.unwrap();
        shares.create_new_payout().await.unwrap();
        assert_eq!(store.pending_share_count(None).await.unwrap(), 0);

        // The payout transaction expires unconfirmed
        rpc.set_transaction_status("txhash", false, true);
        shares.reconcile_transaction_statuses().await.unwrap();

        assert_eq!(store.pending_share_count(None).await.unwrap(), 1);
        assert!(store.unconfirmed_transactions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_transaction_keeps_shares_attributed() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, store, rpc) =
            test_shares(&dir, MockChainRpc::new(0), time.clone(), test_config()).await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        shares.submit_block(1, "blockhash", 200_000).await.unwrap();
        rpc.set_block_status("blockhash", true, true);
        shares.reconcile_block_statuses().await.unwrap();

        time.advance(7200);
        shares.rollover_payout_period().await.unwrap();
        shares.create_new_payout().await.unwrap();

        rpc.set_transaction_status("txhash", true, false);
        shares.reconcile_transaction_statuses().await.unwrap();

        assert_eq!(store.pending_share_count(None).await.unwrap(), 0);
        assert!(store.unconfirmed_transactions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_share_rate() {
        let dir = tempdir().unwrap();
        let time = TestTimeProvider::new(10_000);
        let (shares, _, _) =
            test_shares(&dir, MockChainRpc::new(0), time.clone(), test_config()).await;

        shares.rollover_payout_period().await.unwrap();
        shares.submit_share("addr1").await.unwrap();
        time.advance(1);
        shares.submit_share("addr1").await.unwrap();
        time.advance(1);
        shares.submit_share("addr2").await.unwrap();
        time.advance(1);

        // 3 shares over a 600 second window
        let rate = shares.share_rate(None).await.unwrap();
        assert!((rate - 3.0 / 600.0).abs() < f64::EPSILON);

        let addr1_rate = shares.share_rate(Some("addr1")).await.unwrap();
        assert!((addr1_rate - 2.0 / 600.0).abs() < f64::EPSILON);
    }
}
