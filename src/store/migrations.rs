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

//! Schema migrations for the ledger store.
//!
//! Each migration is a forward/backward SQL pair applied in strict sequence.
//! The current version is the number of applied migrations, recorded in a
//! single-row bookkeeping table.

use super::StoreError;
use sqlx::SqlitePool;
use tracing::info;

pub struct Migration {
    pub name: &'static str,
    pub forward: &'static str,
    pub backward: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "001-initial",
        forward: "
            CREATE TABLE payout (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                succeeded BOOLEAN NOT NULL DEFAULT FALSE,
                transaction_hash TEXT
            );
            CREATE TABLE share (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                public_address TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                payout_id INTEGER REFERENCES payout (id)
            );
        ",
        backward: "
            DROP TABLE IF EXISTS share;
            DROP TABLE IF EXISTS payout;
        ",
    },
    Migration {
        name: "002-add-share-indexes",
        forward: "
            CREATE INDEX idx_share_payout_id ON share (payout_id);
            CREATE INDEX idx_share_public_address ON share (public_address);
        ",
        backward: "
            DROP INDEX IF EXISTS idx_share_payout_id;
            DROP INDEX IF EXISTS idx_share_public_address;
        ",
    },
    Migration {
        name: "003-add-payout-period-tables",
        forward: "
            CREATE TABLE payout_period (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                start INTEGER NOT NULL,
                end INTEGER
            );
            CREATE TABLE payout_share (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payout_period_id INTEGER REFERENCES payout_period (id),
                public_address TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );
            CREATE INDEX idx_payout_share_period ON payout_share (payout_period_id);
        ",
        backward: "
            DROP INDEX IF EXISTS idx_payout_share_period;
            DROP TABLE IF EXISTS payout_share;
            DROP TABLE IF EXISTS payout_period;
        ",
    },
    Migration {
        name: "004-add-block-table",
        forward: "
            CREATE TABLE block (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                payout_period_id INTEGER REFERENCES payout_period (id),
                block_sequence INTEGER NOT NULL,
                block_hash TEXT NOT NULL,
                miner_reward TEXT NOT NULL,
                confirmed BOOLEAN NOT NULL DEFAULT FALSE,
                main BOOLEAN NOT NULL DEFAULT TRUE
            );
            CREATE INDEX idx_block_period ON block (payout_period_id);
        ",
        backward: "
            DROP INDEX IF EXISTS idx_block_period;
            DROP TABLE IF EXISTS block;
        ",
    },
    Migration {
        name: "005-add-payout-transaction-table",
        forward: "
            CREATE TABLE payout_transaction (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                transaction_hash TEXT NOT NULL,
                payout_period_id INTEGER NOT NULL REFERENCES payout_period (id),
                confirmed BOOLEAN NOT NULL DEFAULT FALSE,
                expired BOOLEAN NOT NULL DEFAULT FALSE
            );
            ALTER TABLE payout_share ADD payout_transaction_id INTEGER REFERENCES payout_transaction (id);
        ",
        backward: "
            ALTER TABLE payout_share DROP COLUMN payout_transaction_id;
            DROP TABLE IF EXISTS payout_transaction;
        ",
    },
];

async fn ensure_version_table(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (id INTEGER PRIMARY KEY CHECK (id = 0), version INTEGER NOT NULL)",
    )
    .execute(pool)
    .await?;
    sqlx::query("INSERT OR IGNORE INTO migrations (id, version) VALUES (0, 0)")
        .execute(pool)
        .await?;
    Ok(())
}

/// Current schema version, i.e. the number of applied migrations
pub async fn current_version(pool: &SqlitePool) -> Result<usize, StoreError> {
    ensure_version_table(pool).await?;
    let version: i64 = sqlx::query_scalar("SELECT version FROM migrations WHERE id = 0")
        .fetch_one(pool)
        .await?;
    Ok(version as usize)
}

/// Apply all pending forward migrations in order
pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    let current = current_version(pool).await?;

    for (index, migration) in MIGRATIONS.iter().enumerate().skip(current) {
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.forward)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                StoreError::Migration(format!("{} failed: {}", migration.name, e))
            })?;
        sqlx::query("UPDATE migrations SET version = ? WHERE id = 0")
            .bind((index + 1) as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!("Applied migration {}", migration.name);
    }

    Ok(())
}

/// Roll the schema back to the given version, applying backward migrations
/// in reverse order
pub async fn rollback_to(pool: &SqlitePool, version: usize) -> Result<(), StoreError> {
    let current = current_version(pool).await?;

    for index in (version..current).rev() {
        let migration = &MIGRATIONS[index];
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.backward)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                StoreError::Migration(format!("{} rollback failed: {}", migration.name, e))
            })?;
        sqlx::query("UPDATE migrations SET version = ? WHERE id = 0")
            .bind(index as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!("Rolled back migration {}", migration.name);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use tempfile::tempdir;

    async fn open_pool(path: &std::path::Path) -> SqlitePool {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_migrate_to_latest_and_rollback() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir.path().join("migrations.sqlite")).await;

        assert_eq!(current_version(&pool).await.unwrap(), 0);

        migrate(&pool).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), MIGRATIONS.len());

        // All tables exist after migrating forward
        for table in ["share", "payout", "payout_period", "payout_share", "block", "payout_transaction"] {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert_eq!(count, 1, "table {} missing", table);
        }

        // Migrating again is a no-op
        migrate(&pool).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), MIGRATIONS.len());

        rollback_to(&pool, 0).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), 0);

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('share', 'payout', 'payout_period', 'payout_share', 'block', 'payout_transaction')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 0);
    }

    #[tokio::test]
    async fn test_rollback_one_version() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir.path().join("rollback.sqlite")).await;

        migrate(&pool).await.unwrap();
        rollback_to(&pool, MIGRATIONS.len() - 1).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), MIGRATIONS.len() - 1);

        // payout_transaction is gone, the rest survive
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'payout_transaction'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 0);

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'payout_period'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }
}
