//! `PostgreSQL` backend.
//!
//! One `sqlx` transaction per block commit and per rewind. The cursor row is
//! read `FOR UPDATE` at the start of every commit, so the linkage check and
//! the cursor write happen in the same unit of work.

use super::{
    ChainStats, CommitOutcome, CommitSummary, ProverTotal, RewindSummary, Store, check_extends,
};
use crate::core::indexer::BlockRows;
use crate::types::{BlockHash, ChainCursor, FinalizeOperation, PuzzleReward, StakeReward};
use crate::utils::error::{IndexerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS blocks (
        height BIGINT PRIMARY KEY,
        hash TEXT NOT NULL UNIQUE,
        previous_hash TEXT NOT NULL,
        timestamp BIGINT NOT NULL,
        block_time TIMESTAMPTZ,
        block_reward BIGINT NOT NULL,
        puzzle_reward BIGINT NOT NULL,
        total_fees BIGINT NOT NULL,
        total_supply BIGINT NOT NULL,
        transaction_count INTEGER NOT NULL,
        indexed_at TIMESTAMPTZ DEFAULT NOW()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS transactions (
        id TEXT PRIMARY KEY,
        height BIGINT NOT NULL,
        tx_index INTEGER NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        fee BIGINT NOT NULL,
        fee_payer TEXT,
        reject_reason TEXT
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_transactions_height ON transactions(height)",
    r"
    CREATE TABLE IF NOT EXISTS transitions (
        id TEXT PRIMARY KEY,
        transaction_id TEXT NOT NULL,
        height BIGINT NOT NULL,
        transition_index INTEGER NOT NULL,
        program_id TEXT NOT NULL,
        function_name TEXT NOT NULL,
        inputs TEXT NOT NULL,
        outputs TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_transitions_height ON transitions(height)",
    r"
    CREATE TABLE IF NOT EXISTS program_calls (
        height BIGINT NOT NULL,
        program_id TEXT NOT NULL,
        function_name TEXT NOT NULL,
        calls BIGINT NOT NULL,
        PRIMARY KEY (height, program_id, function_name)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS stake_rewards (
        height BIGINT NOT NULL,
        address TEXT NOT NULL,
        amount BIGINT NOT NULL,
        PRIMARY KEY (height, address)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS puzzle_rewards (
        height BIGINT NOT NULL,
        solution_id TEXT NOT NULL,
        address TEXT NOT NULL,
        target BIGINT NOT NULL,
        amount BIGINT NOT NULL,
        PRIMARY KEY (height, solution_id)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_puzzle_rewards_address ON puzzle_rewards(address)",
    r"
    CREATE TABLE IF NOT EXISTS balances (
        address TEXT PRIMARY KEY,
        amount BIGINT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS balance_changes (
        height BIGINT NOT NULL,
        address TEXT NOT NULL,
        delta BIGINT NOT NULL,
        PRIMARY KEY (height, address)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS mappings (
        program_id TEXT NOT NULL,
        mapping TEXT NOT NULL,
        height BIGINT NOT NULL,
        PRIMARY KEY (program_id, mapping)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS mapping_values (
        program_id TEXT NOT NULL,
        mapping TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        height BIGINT NOT NULL,
        PRIMARY KEY (program_id, mapping, key)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS mapping_history (
        id BIGSERIAL PRIMARY KEY,
        height BIGINT NOT NULL,
        transaction_id TEXT NOT NULL,
        program_id TEXT NOT NULL,
        mapping TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_mapping_history_key
    ON mapping_history(program_id, mapping, key, height)
    ",
    r"
    CREATE TABLE IF NOT EXISTS chain_cursor (
        id SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
        height BIGINT NOT NULL,
        hash TEXT NOT NULL
    )
    ",
];

/// Tables holding rows derived from a height, deleted on rewind.
const HEIGHT_TABLES: &[&str] = &[
    "balance_changes",
    "stake_rewards",
    "puzzle_rewards",
    "program_calls",
    "transitions",
    "transactions",
];

fn db_int(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| IndexerError::InternalError(format!("{value} exceeds BIGINT range")))
}

/// Unix seconds as a timestamp; out-of-range values are stored as NULL.
fn block_time(timestamp: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp, 0)
}

fn from_db(value: i64) -> u64 {
    value.try_into().unwrap_or(0)
}

fn parse_hash(raw: &str) -> Result<BlockHash> {
    raw.parse().map_err(IndexerError::DecodingError)
}

/// `PostgreSQL` implementation of [`Store`].
///
/// # Example
///
/// ```no_run
/// use explorer_indexer::storage::{PgStore, Store};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PgStore::new("postgresql://localhost/explorer").await?;
/// store.initialize().await?;
/// # Ok(())
/// # }
/// ```
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a new store with a connection pool.
    ///
    /// # Errors
    ///
    /// Returns `IndexerError::DatabaseError` if connection fails.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Closes the database connection pool.
    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn lock_cursor(conn: &mut PgConnection) -> Result<Option<ChainCursor>> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT height, hash FROM chain_cursor WHERE id = 1 FOR UPDATE")
                .fetch_optional(&mut *conn)
                .await?;

        match row {
            Some((height, hash)) => Ok(Some(ChainCursor::new(from_db(height), parse_hash(&hash)?))),
            None => Ok(None),
        }
    }

    async fn write_cursor(conn: &mut PgConnection, cursor: Option<&ChainCursor>) -> Result<()> {
        match cursor {
            Some(cursor) => {
                sqlx::query(
                    r"
                    INSERT INTO chain_cursor (id, height, hash) VALUES (1, $1, $2)
                    ON CONFLICT (id) DO UPDATE SET height = EXCLUDED.height, hash = EXCLUDED.hash
                    ",
                )
                .bind(db_int(cursor.height)?)
                .bind(cursor.hash.to_string())
                .execute(&mut *conn)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM chain_cursor")
                    .execute(&mut *conn)
                    .await?;
            }
        }
        Ok(())
    }

    async fn insert_block(conn: &mut PgConnection, rows: &BlockRows) -> Result<()> {
        let block = &rows.block;
        let height = db_int(block.height)?;

        sqlx::query(
            r"
            INSERT INTO blocks (height, hash, previous_hash, timestamp, block_time,
                                block_reward, puzzle_reward, total_fees, total_supply,
                                transaction_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(height)
        .bind(block.hash.to_string())
        .bind(block.previous_hash.to_string())
        .bind(block.timestamp)
        .bind(block_time(block.timestamp))
        .bind(db_int(block.block_reward)?)
        .bind(db_int(block.puzzle_reward)?)
        .bind(db_int(block.total_fees())?)
        .bind(db_int(rows.total_supply)?)
        .bind(i32::try_from(block.transactions.len()).unwrap_or(i32::MAX))
        .execute(&mut *conn)
        .await?;

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            sqlx::query(
                r"
                INSERT INTO transactions (id, height, tx_index, kind, status, fee,
                                          fee_payer, reject_reason)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(&tx.id)
            .bind(height)
            .bind(i32::try_from(tx_index).unwrap_or(i32::MAX))
            .bind(tx.kind.as_str())
            .bind(tx.status.as_str())
            .bind(db_int(tx.fee)?)
            .bind(tx.fee_payer.as_deref())
            .bind(tx.reject_reason.as_deref())
            .execute(&mut *conn)
            .await?;

            for (transition_index, transition) in tx.transitions.iter().enumerate() {
                sqlx::query(
                    r"
                    INSERT INTO transitions (id, transaction_id, height, transition_index,
                                             program_id, function_name, inputs, outputs)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ",
                )
                .bind(&transition.id)
                .bind(&tx.id)
                .bind(height)
                .bind(i32::try_from(transition_index).unwrap_or(i32::MAX))
                .bind(&transition.program_id)
                .bind(&transition.function_name)
                .bind(serde_json::to_string(&transition.inputs)?)
                .bind(serde_json::to_string(&transition.outputs)?)
                .execute(&mut *conn)
                .await?;
            }
        }

        Ok(())
    }

    async fn insert_derived(conn: &mut PgConnection, rows: &BlockRows) -> Result<()> {
        let height = db_int(rows.block.height)?;

        for call in &rows.program_calls {
            sqlx::query(
                r"
                INSERT INTO program_calls (height, program_id, function_name, calls)
                VALUES ($1, $2, $3, $4)
                ",
            )
            .bind(height)
            .bind(&call.program_id)
            .bind(&call.function_name)
            .bind(db_int(call.calls)?)
            .execute(&mut *conn)
            .await?;
        }

        for reward in &rows.stake_rewards {
            sqlx::query("INSERT INTO stake_rewards (height, address, amount) VALUES ($1, $2, $3)")
                .bind(height)
                .bind(&reward.address)
                .bind(db_int(reward.amount)?)
                .execute(&mut *conn)
                .await?;
        }

        for reward in &rows.puzzle_rewards {
            sqlx::query(
                r"
                INSERT INTO puzzle_rewards (height, solution_id, address, target, amount)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(height)
            .bind(&reward.solution_id)
            .bind(&reward.address)
            .bind(db_int(reward.target)?)
            .bind(db_int(reward.amount)?)
            .execute(&mut *conn)
            .await?;
        }

        for change in &rows.balance_changes {
            sqlx::query("INSERT INTO balance_changes (height, address, delta) VALUES ($1, $2, $3)")
                .bind(height)
                .bind(&change.address)
                .bind(change.delta)
                .execute(&mut *conn)
                .await?;

            sqlx::query(
                r"
                INSERT INTO balances (address, amount) VALUES ($1, $2)
                ON CONFLICT (address) DO UPDATE SET amount = balances.amount + EXCLUDED.amount
                ",
            )
            .bind(&change.address)
            .bind(change.delta)
            .execute(&mut *conn)
            .await?;
        }

        for change in &rows.mapping_changes {
            Self::apply_mapping_change(&mut *conn, height, &change.transaction_id, &change.operation)
                .await?;
        }

        Ok(())
    }

    async fn apply_mapping_change(
        conn: &mut PgConnection,
        height: i64,
        transaction_id: &str,
        operation: &FinalizeOperation,
    ) -> Result<()> {
        let (program_id, mapping, key, value) = match operation {
            FinalizeOperation::InitializeMapping {
                program_id,
                mapping,
            } => {
                sqlx::query(
                    r"
                    INSERT INTO mappings (program_id, mapping, height) VALUES ($1, $2, $3)
                    ON CONFLICT DO NOTHING
                    ",
                )
                .bind(program_id)
                .bind(mapping)
                .bind(height)
                .execute(&mut *conn)
                .await?;
                return Ok(());
            }
            FinalizeOperation::UpdateKeyValue {
                program_id,
                mapping,
                key,
                value,
            } => {
                sqlx::query(
                    r"
                    INSERT INTO mapping_values (program_id, mapping, key, value, height)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (program_id, mapping, key)
                    DO UPDATE SET value = EXCLUDED.value, height = EXCLUDED.height
                    ",
                )
                .bind(program_id)
                .bind(mapping)
                .bind(key)
                .bind(value)
                .bind(height)
                .execute(&mut *conn)
                .await?;
                (program_id, mapping, key, Some(value))
            }
            FinalizeOperation::RemoveKeyValue {
                program_id,
                mapping,
                key,
            } => {
                sqlx::query(
                    "DELETE FROM mapping_values WHERE program_id = $1 AND mapping = $2 AND key = $3",
                )
                .bind(program_id)
                .bind(mapping)
                .bind(key)
                .execute(&mut *conn)
                .await?;
                (program_id, mapping, key, None)
            }
        };

        sqlx::query(
            r"
            INSERT INTO mapping_history (height, transaction_id, program_id, mapping, key, value)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(height)
        .bind(transaction_id)
        .bind(program_id)
        .bind(mapping)
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    /// Creates every table and index if it does not already exist.
    async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn read_cursor(&self) -> Result<Option<ChainCursor>> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT height, hash FROM chain_cursor WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((height, hash)) => Ok(Some(ChainCursor::new(from_db(height), parse_hash(&hash)?))),
            None => Ok(None),
        }
    }

    async fn read_block_hash(&self, height: u64) -> Result<Option<BlockHash>> {
        let hash: Option<String> = sqlx::query_scalar("SELECT hash FROM blocks WHERE height = $1")
            .bind(db_int(height)?)
            .fetch_optional(&self.pool)
            .await?;

        hash.as_deref().map(parse_hash).transpose()
    }

    async fn commit_block(&self, rows: &BlockRows) -> Result<CommitOutcome> {
        let block = &rows.block;
        let mut tx = self.pool.begin().await?;

        let cursor = Self::lock_cursor(&mut *tx).await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT hash FROM blocks WHERE height = $1")
                .bind(db_int(block.height)?)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(existing) = existing {
            if parse_hash(&existing)? == block.hash {
                return Ok(CommitOutcome::AlreadyCommitted);
            }
            return Err(IndexerError::LinkageViolation {
                height: block.height,
                expected: existing,
                found: block.hash.to_string(),
            });
        }

        check_extends(cursor.as_ref(), block)?;

        Self::insert_block(&mut *tx, rows).await?;
        Self::insert_derived(&mut *tx, rows).await?;
        Self::write_cursor(&mut *tx, Some(&ChainCursor::new(block.height, block.hash))).await?;

        tx.commit().await?;

        Ok(CommitOutcome::Committed(CommitSummary::from_rows(rows)))
    }

    async fn rewind_to(&self, ancestor: Option<u64>) -> Result<RewindSummary> {
        let floor = match ancestor {
            Some(height) => db_int(height)?,
            None => -1,
        };
        let mut tx = self.pool.begin().await?;

        // cursor lock serialises rewinds with commits
        Self::lock_cursor(&mut *tx).await?;

        sqlx::query(
            r"
            UPDATE balances b SET amount = b.amount - c.delta
            FROM (
                SELECT address, SUM(delta)::BIGINT AS delta
                FROM balance_changes WHERE height > $1 GROUP BY address
            ) c
            WHERE b.address = c.address
            ",
        )
        .bind(floor)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            DELETE FROM mapping_values
            WHERE (program_id, mapping, key) IN (
                SELECT program_id, mapping, key FROM mapping_history WHERE height > $1
            )
            ",
        )
        .bind(floor)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            INSERT INTO mapping_values (program_id, mapping, key, value, height)
            SELECT program_id, mapping, key, value, height FROM (
                SELECT DISTINCT ON (program_id, mapping, key)
                       program_id, mapping, key, value, height
                FROM mapping_history
                WHERE height <= $1
                  AND (program_id, mapping, key) IN (
                      SELECT program_id, mapping, key FROM mapping_history WHERE height > $1
                  )
                ORDER BY program_id, mapping, key, height DESC, id DESC
            ) latest
            WHERE value IS NOT NULL
            ",
        )
        .bind(floor)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM mapping_history WHERE height > $1")
            .bind(floor)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM mappings WHERE height > $1")
            .bind(floor)
            .execute(&mut *tx)
            .await?;

        for table in HEIGHT_TABLES {
            sqlx::query(&format!("DELETE FROM {table} WHERE height > $1"))
                .bind(floor)
                .execute(&mut *tx)
                .await?;
        }

        let removed = sqlx::query("DELETE FROM blocks WHERE height > $1")
            .bind(floor)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let tip: Option<(i64, String)> =
            sqlx::query_as("SELECT height, hash FROM blocks ORDER BY height DESC LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;
        let cursor = match tip {
            Some((height, hash)) => Some(ChainCursor::new(from_db(height), parse_hash(&hash)?)),
            None => None,
        };

        Self::write_cursor(&mut *tx, cursor.as_ref()).await?;
        tx.commit().await?;

        Ok(RewindSummary {
            removed_blocks: removed,
            cursor,
        })
    }

    async fn chain_stats(&self) -> Result<ChainStats> {
        let (tip, blocks, transactions, supply): (Option<i64>, i64, i64, Option<i64>) =
            sqlx::query_as(
                r"
                SELECT
                    (SELECT MAX(height) FROM blocks),
                    (SELECT COUNT(*) FROM blocks),
                    (SELECT COUNT(*) FROM transactions),
                    (SELECT total_supply FROM blocks ORDER BY height DESC LIMIT 1)
                ",
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(ChainStats {
            tip_height: tip.map(from_db),
            block_count: from_db(blocks),
            transaction_count: from_db(transactions),
            total_supply: supply.map(from_db),
        })
    }

    async fn find_linkage_break(&self, from: u64, to: u64) -> Result<Option<u64>> {
        let height: Option<i64> = sqlx::query_scalar(
            r"
            SELECT b.height FROM blocks b
            JOIN blocks p ON p.height = b.height - 1
            WHERE b.height > $1 AND b.height <= $2 AND b.previous_hash <> p.hash
            ORDER BY b.height
            LIMIT 1
            ",
        )
        .bind(db_int(from)?)
        .bind(db_int(to)?)
        .fetch_optional(&self.pool)
        .await?;

        Ok(height.map(from_db))
    }

    async fn supply_at(&self, height: u64) -> Result<Option<u64>> {
        let supply: Option<i64> =
            sqlx::query_scalar("SELECT total_supply FROM blocks WHERE height = $1")
                .bind(db_int(height)?)
                .fetch_optional(&self.pool)
                .await?;
        Ok(supply.map(from_db))
    }

    async fn stake_rewards_at(&self, height: u64) -> Result<Vec<StakeReward>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT address, amount FROM stake_rewards WHERE height = $1 ORDER BY address",
        )
        .bind(db_int(height)?)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(address, amount)| StakeReward {
                height,
                address,
                amount: from_db(amount),
            })
            .collect())
    }

    async fn puzzle_rewards_at(&self, height: u64) -> Result<Vec<PuzzleReward>> {
        let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
            r"
            SELECT solution_id, address, target, amount FROM puzzle_rewards
            WHERE height = $1 ORDER BY solution_id
            ",
        )
        .bind(db_int(height)?)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(solution_id, address, target, amount)| PuzzleReward {
                height,
                solution_id,
                address,
                target: from_db(target),
                amount: from_db(amount),
            })
            .collect())
    }

    async fn prover_leaderboard(&self, limit: usize) -> Result<Vec<ProverTotal>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r"
            SELECT address, COUNT(*), SUM(amount)::BIGINT AS total
            FROM puzzle_rewards
            GROUP BY address
            ORDER BY total DESC, address
            LIMIT $1
            ",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(address, solutions, total)| ProverTotal {
                address,
                solutions: from_db(solutions),
                total_reward: from_db(total),
            })
            .collect())
    }

    async fn prover_total(&self, address: &str) -> Result<Option<ProverTotal>> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            r"
            SELECT COUNT(*), SUM(amount)::BIGINT FROM puzzle_rewards
            WHERE address = $1 GROUP BY address
            ",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(solutions, total)| ProverTotal {
            address: address.to_string(),
            solutions: from_db(solutions),
            total_reward: from_db(total),
        }))
    }

    async fn balance(&self, address: &str) -> Result<Option<i64>> {
        Ok(
            sqlx::query_scalar("SELECT amount FROM balances WHERE address = $1")
                .bind(address)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn mapping_value(
        &self,
        program_id: &str,
        mapping: &str,
        key: &str,
    ) -> Result<Option<String>> {
        Ok(sqlx::query_scalar(
            "SELECT value FROM mapping_values WHERE program_id = $1 AND mapping = $2 AND key = $3",
        )
        .bind(program_id)
        .bind(mapping)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn mapping_value_at(
        &self,
        program_id: &str,
        mapping: &str,
        key: &str,
        height: u64,
    ) -> Result<Option<String>> {
        let value: Option<Option<String>> = sqlx::query_scalar(
            r"
            SELECT value FROM mapping_history
            WHERE program_id = $1 AND mapping = $2 AND key = $3 AND height <= $4
            ORDER BY height DESC, id DESC
            LIMIT 1
            ",
        )
        .bind(program_id)
        .bind(mapping)
        .bind(key)
        .bind(db_int(height)?)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value.flatten())
    }

    async fn program_call_count(&self, program_id: &str) -> Result<u64> {
        let calls: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(calls), 0)::BIGINT FROM program_calls WHERE program_id = $1",
        )
        .bind(program_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(from_db(calls))
    }
}
