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

//! Persistent ledger store for shares, payout periods, blocks and payout
//! transactions.
//!
//! SQLite is used as the underlying database. Every cross-row consistency
//! requirement is carried by a single atomic statement (the payout guard
//! insert) or a single transaction (period rollover, share attribution), so
//! concurrent callers never need an in-process lock.

use num_bigint::BigUint;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub mod migrations;

/// How many periods before the target period contribute to its reward
pub const PREVIOUS_PAYOUT_PERIODS: i64 = 3;

/// Reward weight in percent for the target period and each predecessor,
/// newest first. Checked against the window size at startup.
pub const PAYOUT_PERIOD_WEIGHTS: [u32; 4] = [50, 25, 15, 10];

/// Consistency check for the reward weight table, run at startup. A weight
/// table that does not cover the window or sum to 100 is a configuration
/// defect, not a runtime condition.
pub fn assert_payout_weights() {
    assert_eq!(
        PAYOUT_PERIOD_WEIGHTS.len() as i64,
        PREVIOUS_PAYOUT_PERIODS + 1,
        "payout weight table must cover the target period and each predecessor"
    );
    assert_eq!(
        PAYOUT_PERIOD_WEIGHTS.iter().sum::<u32>(),
        100,
        "payout weights must sum to 100 percent"
    );
}

/// Error type for ledger store operations
#[derive(Debug)]
pub enum StoreError {
    Database(String),
    InvalidData(String),
    Migration(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(msg) => write!(f, "Database error: {msg}"),
            StoreError::InvalidData(msg) => write!(f, "Invalid data: {msg}"),
            StoreError::Migration(msg) => write!(f, "Migration error: {msg}"),
        }
    }
}

impl Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// One accepted share in the legacy direct-payout ledger
#[derive(Debug, Clone, PartialEq)]
pub struct ShareRow {
    pub id: i64,
    pub public_address: String,
    pub created_at: u64,
    pub payout_id: Option<i64>,
}

/// A payout period. `end == None` marks the single currently open period.
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutPeriod {
    pub id: i64,
    pub start: u64,
    pub end: Option<u64>,
}

/// A block mined by the pool, attributed to the period open when it was
/// mined. `main` and `confirmed` flip freely under chain reorganization.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRow {
    pub id: i64,
    pub payout_period_id: Option<i64>,
    pub block_sequence: u64,
    pub block_hash: String,
    pub miner_reward: BigUint,
    pub confirmed: bool,
    pub main: bool,
}

/// An on-chain transaction paying out a period's shares
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutTransactionRow {
    pub id: i64,
    pub transaction_hash: String,
    pub payout_period_id: i64,
    pub confirmed: bool,
    pub expired: bool,
}

/// Distinct address with its unpaid share count for one payout period
#[derive(Debug, Clone, PartialEq)]
pub struct AddressShareCount {
    pub public_address: String,
    pub share_count: u64,
}

pub struct PoolStore {
    pool: SqlitePool,
    attempt_payout_interval: u64,
    successful_payout_interval: u64,
    max_addresses_per_payout: u32,
}

impl PoolStore {
    /// Open (or create) the ledger database and bring the schema up to date
    pub async fn open(
        path: &str,
        attempt_payout_interval: u64,
        successful_payout_interval: u64,
        max_addresses_per_payout: u32,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Database(format!("Failed to create store dir: {e}")))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        migrations::migrate(&pool).await?;

        Ok(Self {
            pool,
            attempt_payout_interval,
            successful_payout_interval,
            max_addresses_per_payout,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Append one share, attributed to the currently open payout period.
    /// Writes the legacy direct-flow row and the period-flow row in one
    /// transaction.
    pub async fn new_share(&self, public_address: &str, now: u64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO share (public_address, created_at) VALUES (?, ?)")
            .bind(public_address)
            .bind(now as i64)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO payout_share (payout_period_id, public_address, created_at) \
             VALUES ((SELECT id FROM payout_period WHERE end IS NULL), ?, ?)",
        )
        .bind(public_address)
        .bind(now as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Unpaid legacy shares older than the cutoff
    pub async fn shares_for_payout(&self, cutoff: u64) -> Result<Vec<ShareRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, public_address, created_at, payout_id FROM share \
             WHERE payout_id IS NULL AND created_at < ?",
        )
        .bind(cutoff as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ShareRow {
                id: row.get("id"),
                public_address: row.get("public_address"),
                created_at: row.get::<i64, _>("created_at") as u64,
                payout_id: row.get("payout_id"),
            })
            .collect())
    }

    /// Count of unpaid legacy shares, optionally for one address
    pub async fn shares_count_for_payout(
        &self,
        public_address: Option<&str>,
    ) -> Result<u64, StoreError> {
        let count: i64 = match public_address {
            Some(address) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM share WHERE payout_id IS NULL AND public_address = ?",
                )
                .bind(address)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM share WHERE payout_id IS NULL")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as u64)
    }

    /// The direct-payout concurrency guard. A payout row is inserted only if
    /// no successful payout exists within the successful payout interval and
    /// no attempt exists within the attempt interval. The conditional insert
    /// is a single atomic statement, so only one concurrent caller can win.
    ///
    /// Returns the new payout id, or None if another payout is in flight or
    /// was made too recently.
    pub async fn new_payout(&self, now: u64) -> Result<Option<i64>, StoreError> {
        let successful_cutoff = now.saturating_sub(self.successful_payout_interval);
        let attempt_cutoff = now.saturating_sub(self.attempt_payout_interval);

        let result = sqlx::query(
            "INSERT INTO payout (created_at, succeeded) \
             SELECT ?, FALSE \
             WHERE NOT EXISTS (SELECT 1 FROM payout WHERE created_at > ? AND succeeded = TRUE) \
               AND NOT EXISTS (SELECT 1 FROM payout WHERE created_at > ?)",
        )
        .bind(now as i64)
        .bind(successful_cutoff as i64)
        .bind(attempt_cutoff as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 0 {
            Ok(Some(result.last_insert_rowid()))
        } else {
            Ok(None)
        }
    }

    /// Mark a payout succeeded and attribute every unpaid legacy share older
    /// than the cutoff to it. Uses the same cutoff and unpaid predicate the
    /// share fetch used.
    pub async fn mark_payout_success(
        &self,
        payout_id: i64,
        cutoff: u64,
        transaction_hash: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE payout SET succeeded = TRUE, transaction_hash = ? WHERE id = ?")
            .bind(transaction_hash)
            .bind(payout_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE share SET payout_id = ? WHERE payout_id IS NULL AND created_at < ?",
        )
        .bind(payout_id)
        .bind(cutoff as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Whether the payout row with the given id has succeeded
    pub async fn payout_succeeded(&self, payout_id: i64) -> Result<bool, StoreError> {
        let succeeded: bool = sqlx::query_scalar("SELECT succeeded FROM payout WHERE id = ?")
            .bind(payout_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(succeeded)
    }

    /// Count of legacy shares submitted since the given timestamp
    pub async fn share_count_since(
        &self,
        since: u64,
        public_address: Option<&str>,
    ) -> Result<u64, StoreError> {
        let count: i64 = match public_address {
            Some(address) => {
                sqlx::query_scalar(
                    "SELECT COUNT(id) FROM share WHERE created_at > ? AND public_address = ?",
                )
                .bind(since as i64)
                .bind(address)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(id) FROM share WHERE created_at > ?")
                    .bind(since as i64)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as u64)
    }

    pub async fn current_payout_period(&self) -> Result<Option<PayoutPeriod>, StoreError> {
        let row = sqlx::query("SELECT id, start, end FROM payout_period WHERE end IS NULL")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(parse_payout_period))
    }

    /// Close the open period at `now - 1` and open a new one starting at
    /// `now`, atomically. The -1 keeps periods strictly non-overlapping so a
    /// given timestamp maps to exactly one period. The first call, when no
    /// period exists, just creates the initial open period.
    pub async fn rollover_payout_period(&self, now: u64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE payout_period SET end = ? WHERE end IS NULL")
            .bind((now - 1) as i64)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO payout_period (start, created_at) VALUES (?, ?)")
            .bind(now as i64)
            .bind(now as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Record a block mined by the pool, attributed to the open period
    pub async fn new_block(
        &self,
        sequence: u64,
        hash: &str,
        reward: &BigUint,
        now: u64,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO block (payout_period_id, block_sequence, block_hash, miner_reward, created_at) \
             VALUES ((SELECT id FROM payout_period WHERE end IS NULL), ?, ?, ?, ?)",
        )
        .bind(sequence as i64)
        .bind(hash)
        .bind(reward.to_string())
        .bind(now as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn unconfirmed_blocks(&self) -> Result<Vec<BlockRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, payout_period_id, block_sequence, block_hash, miner_reward, confirmed, main \
             FROM block WHERE confirmed = FALSE",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_block).collect()
    }

    pub async fn update_block_status(
        &self,
        block_id: i64,
        main: bool,
        confirmed: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE block SET main = ?, confirmed = ? WHERE id = ?")
            .bind(main)
            .bind(confirmed)
            .bind(block_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Claim a payout for the period: create its transaction row and
    /// attribute the period's unpaid shares to it, atomically. The insert is
    /// conditional on the period having no other in-flight transaction
    /// (unconfirmed and unexpired), so only one of several concurrent
    /// callers wins the claim. The address selection uses exactly the
    /// criteria of [`payout_addresses`](Self::payout_addresses), so the set
    /// marked paid is the set that was read.
    ///
    /// Returns None if another transaction for the period is in flight.
    pub async fn new_transaction_with_shares(
        &self,
        hash: &str,
        payout_period_id: i64,
        now: u64,
    ) -> Result<Option<i64>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO payout_transaction (transaction_hash, payout_period_id, created_at) \
             SELECT ?, ?, ? \
             WHERE NOT EXISTS (\
                 SELECT 1 FROM payout_transaction \
                 WHERE payout_period_id = ? AND confirmed = FALSE AND expired = FALSE\
             )",
        )
        .bind(hash)
        .bind(payout_period_id)
        .bind(now as i64)
        .bind(payout_period_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        let transaction_id = result.last_insert_rowid();

        sqlx::query(MARK_SHARES_PAID_SQL)
            .bind(transaction_id)
            .bind(payout_period_id)
            .bind(payout_period_id)
            .bind(self.max_addresses_per_payout)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(transaction_id))
    }

    /// Record the real transaction hash on a claim created before submission
    pub async fn update_transaction_hash(
        &self,
        transaction_id: i64,
        hash: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE payout_transaction SET transaction_hash = ? WHERE id = ?")
            .bind(hash)
            .bind(transaction_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Create a payout transaction row without touching share attribution
    pub async fn new_transaction(
        &self,
        hash: &str,
        payout_period_id: i64,
        now: u64,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO payout_transaction (transaction_hash, payout_period_id, created_at) \
             VALUES (?, ?, ?)",
        )
        .bind(hash)
        .bind(payout_period_id)
        .bind(now as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn unconfirmed_transactions(
        &self,
    ) -> Result<Vec<PayoutTransactionRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, transaction_hash, payout_period_id, confirmed, expired \
             FROM payout_transaction WHERE confirmed = FALSE AND expired = FALSE",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(parse_payout_transaction).collect())
    }

    pub async fn update_transaction_status(
        &self,
        transaction_id: i64,
        confirmed: bool,
        expired: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE payout_transaction SET confirmed = ?, expired = ? WHERE id = ?")
            .bind(confirmed)
            .bind(expired)
            .bind(transaction_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Distinct unpaid addresses and their share counts for one period,
    /// capped at the configured address limit to bound transaction size
    pub async fn payout_addresses(
        &self,
        payout_period_id: i64,
    ) -> Result<Vec<AddressShareCount>, StoreError> {
        let rows = sqlx::query(
            "SELECT public_address, COUNT(id) AS share_count \
             FROM payout_share \
             WHERE payout_period_id = ? AND payout_transaction_id IS NULL \
             GROUP BY public_address \
             LIMIT ?",
        )
        .bind(payout_period_id)
        .bind(self.max_addresses_per_payout)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AddressShareCount {
                public_address: row.get("public_address"),
                share_count: row.get::<i64, _>("share_count") as u64,
            })
            .collect())
    }

    /// Attribute the period's unpaid shares to the given transaction, using
    /// the same selection criteria as [`payout_addresses`](Self::payout_addresses)
    pub async fn mark_shares_paid(
        &self,
        payout_period_id: i64,
        payout_transaction_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(MARK_SHARES_PAID_SQL)
            .bind(payout_transaction_id)
            .bind(payout_period_id)
            .bind(payout_period_id)
            .bind(self.max_addresses_per_payout)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Return every share attributed to the given transaction to the unpaid
    /// pool. Called when a payout transaction expires unconfirmed.
    pub async fn mark_shares_unpaid(&self, payout_transaction_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE payout_share SET payout_transaction_id = NULL WHERE payout_transaction_id = ?",
        )
        .bind(payout_transaction_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// The oldest payout period that still has an unpaid share
    pub async fn earliest_outstanding_payout_period(
        &self,
    ) -> Result<Option<PayoutPeriod>, StoreError> {
        let row = sqlx::query(
            "SELECT id, start, end FROM payout_period WHERE id = ( \
                SELECT payout_period_id FROM payout_share \
                WHERE payout_transaction_id IS NULL ORDER BY id LIMIT 1 \
             )",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_payout_period))
    }

    /// Total share count for a period, paid or not
    pub async fn payout_period_share_count(
        &self,
        payout_period_id: i64,
    ) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM payout_share WHERE payout_period_id = ?")
                .bind(payout_period_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    /// Shares not yet paid out, independent of payout period
    pub async fn pending_share_count(
        &self,
        public_address: Option<&str>,
    ) -> Result<u64, StoreError> {
        let count: i64 = match public_address {
            Some(address) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM payout_share \
                     WHERE payout_transaction_id IS NULL AND public_address = ?",
                )
                .bind(address)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM payout_share WHERE payout_transaction_id IS NULL",
                )
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(count as u64)
    }

    /// Total payable reward for a period: the weighted sum over the period
    /// and its three predecessors of each period's confirmed main-chain
    /// block rewards. Per-period contribution is floor(sum * weight / 100).
    ///
    /// Rewards are summed in Rust with BigUint rather than SQL SUM, which
    /// would coerce the TEXT amounts to floats.
    pub async fn get_payout_reward(&self, payout_period_id: i64) -> Result<BigUint, StoreError> {
        let rows = sqlx::query(
            "SELECT payout_period_id, miner_reward FROM block \
             WHERE payout_period_id BETWEEN ? AND ? \
               AND confirmed = TRUE AND main = TRUE",
        )
        .bind(payout_period_id - PREVIOUS_PAYOUT_PERIODS)
        .bind(payout_period_id)
        .fetch_all(&self.pool)
        .await?;

        let mut period_rewards = vec![BigUint::ZERO; PAYOUT_PERIOD_WEIGHTS.len()];
        for row in rows {
            let period: i64 = row.get("payout_period_id");
            let reward = parse_reward(row.get("miner_reward"))?;
            let offset = (payout_period_id - period) as usize;
            period_rewards[offset] += reward;
        }

        let hundred = BigUint::from(100u32);
        let mut total = BigUint::ZERO;
        for (reward, weight) in period_rewards.iter().zip(PAYOUT_PERIOD_WEIGHTS) {
            total += reward * weight / &hundred;
        }

        Ok(total)
    }

    /// False if any block in the target period or its three predecessors is
    /// still unconfirmed. The payout stalls until the whole reward window
    /// has settled.
    pub async fn payout_period_blocks_confirmed(
        &self,
        payout_period_id: i64,
    ) -> Result<bool, StoreError> {
        let unconfirmed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM block \
             WHERE payout_period_id BETWEEN ? AND ? AND confirmed = FALSE",
        )
        .bind(payout_period_id - PREVIOUS_PAYOUT_PERIODS)
        .bind(payout_period_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(unconfirmed == 0)
    }

    /// All payout periods, ordered by id. Used by tests and status queries.
    pub async fn all_payout_periods(&self) -> Result<Vec<PayoutPeriod>, StoreError> {
        let rows = sqlx::query("SELECT id, start, end FROM payout_period ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(parse_payout_period).collect())
    }
}

// The address subselect must match payout_addresses exactly: same period,
// same unpaid predicate, same limit. If one changes the other must too.
const MARK_SHARES_PAID_SQL: &str = "UPDATE payout_share \
     SET payout_transaction_id = ? \
     WHERE payout_period_id = ? \
       AND payout_transaction_id IS NULL \
       AND public_address IN ( \
           SELECT public_address FROM payout_share \
           WHERE payout_period_id = ? AND payout_transaction_id IS NULL \
           GROUP BY public_address \
           LIMIT ? \
       )";

fn parse_payout_period(row: sqlx::sqlite::SqliteRow) -> PayoutPeriod {
    PayoutPeriod {
        id: row.get("id"),
        start: row.get::<i64, _>("start") as u64,
        end: row.get::<Option<i64>, _>("end").map(|e| e as u64),
    }
}

fn parse_block(row: sqlx::sqlite::SqliteRow) -> Result<BlockRow, StoreError> {
    Ok(BlockRow {
        id: row.get("id"),
        payout_period_id: row.get("payout_period_id"),
        block_sequence: row.get::<i64, _>("block_sequence") as u64,
        block_hash: row.get("block_hash"),
        miner_reward: parse_reward(row.get("miner_reward"))?,
        confirmed: row.get("confirmed"),
        main: row.get("main"),
    })
}

fn parse_payout_transaction(row: sqlx::sqlite::SqliteRow) -> PayoutTransactionRow {
    PayoutTransactionRow {
        id: row.get("id"),
        transaction_hash: row.get("transaction_hash"),
        payout_period_id: row.get("payout_period_id"),
        confirmed: row.get("confirmed"),
        expired: row.get("expired"),
    }
}

fn parse_reward(raw: String) -> Result<BigUint, StoreError> {
    BigUint::from_str(&raw)
        .map_err(|e| StoreError::InvalidData(format!("bad miner_reward '{raw}': {e}")))
}
