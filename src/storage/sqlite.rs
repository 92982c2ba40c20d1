//! SQLite Persistent Storage for the Custody Backend
//!
//! Durable storage for addresses, deposits, master wallets and the sweep
//! audit log. Uses connection pooling via r2d2 for concurrent access.
//! Uniqueness rules are table constraints, so concurrent writers racing on the
//! same tuple get `StorageError::Duplicate` from the database itself.
//!
//! Amounts are `u128` and stored as decimal TEXT.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

use super::traits::{
    AddressStore, DepositTxStore, MasterWalletStore, StorageError, StorageResult, SweepAuditStore,
};
use crate::types::{
    DepositAddress, DepositTransaction, DepositTxStatus, MasterWallet, SweepAuditRecord,
    SweepResult, SweepStatus,
};

/// SQLite-backed custody store with connection pooling
pub struct SqliteCustodyStore {
    pool: Pool<SqliteConnectionManager>,
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

/// Map constraint violations (primary key 1555, unique 2067) to `Duplicate`
fn insert_err(e: rusqlite::Error, what: &str) -> StorageError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        if err.extended_code == 1555 || err.extended_code == 2067 {
            return StorageError::Duplicate(what.to_string());
        }
    }
    StorageError::Database(e.to_string())
}

fn parse_amount(idx: &str, raw: String) -> rusqlite::Result<u128> {
    raw.parse::<u128>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("{}: {}", idx, e).into(),
        )
    })
}

impl SqliteCustodyStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Connection(e.to_string()))?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|c| c.busy_timeout(std::time::Duration::from_secs(5)));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deposit_addresses (
                id TEXT PRIMARY KEY,
                owner_user_id TEXT NOT NULL,
                asset_id TEXT NOT NULL,
                network_id TEXT NOT NULL,
                address TEXT NOT NULL,
                key_handle TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_balance TEXT NOT NULL DEFAULT '0',
                baseline_epoch INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_used_at INTEGER,
                UNIQUE (owner_user_id, asset_id, network_id)
            );

            CREATE INDEX IF NOT EXISTS idx_addresses_network ON deposit_addresses(network_id, is_active);

            CREATE TABLE IF NOT EXISTS deposit_transactions (
                id TEXT PRIMARY KEY,
                address_id TEXT NOT NULL,
                tx_hash TEXT,
                amount TEXT NOT NULL,
                usd_value REAL NOT NULL DEFAULT 0,
                confirmations INTEGER NOT NULL DEFAULT 0,
                required_confirmations INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                baseline_balance TEXT NOT NULL,
                observed_balance TEXT NOT NULL,
                detected_height INTEGER NOT NULL,
                idempotency_key TEXT NOT NULL,
                failure_reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (address_id, idempotency_key)
            );

            CREATE INDEX IF NOT EXISTS idx_deposits_address_status ON deposit_transactions(address_id, status);
            CREATE INDEX IF NOT EXISTS idx_deposits_created_at ON deposit_transactions(created_at);

            CREATE TABLE IF NOT EXISTS master_wallets (
                id TEXT PRIMARY KEY,
                network_id TEXT NOT NULL,
                label TEXT NOT NULL,
                symbol TEXT NOT NULL,
                address TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_master_wallets_active
                ON master_wallets(network_id) WHERE is_active = 1;

            CREATE TABLE IF NOT EXISTS sweep_audit (
                id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL,
                address_id TEXT NOT NULL,
                address TEXT,
                network_id TEXT,
                status TEXT NOT NULL,
                message TEXT NOT NULL,
                tx_hash TEXT,
                required_gas TEXT,
                amount TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sweep_audit_created_at ON sweep_audit(created_at);
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn row_to_address(row: &rusqlite::Row) -> rusqlite::Result<DepositAddress> {
        Ok(DepositAddress {
            id: row.get("id")?,
            owner_user_id: row.get("owner_user_id")?,
            asset_id: row.get("asset_id")?,
            network_id: row.get("network_id")?,
            address: row.get("address")?,
            key_handle: row.get("key_handle")?,
            is_active: row.get::<_, i64>("is_active")? != 0,
            last_balance: parse_amount("last_balance", row.get("last_balance")?)?,
            baseline_epoch: row.get::<_, i64>("baseline_epoch")? as u64,
            created_at: row.get::<_, i64>("created_at")? as u64,
            last_used_at: row.get::<_, Option<i64>>("last_used_at")?.map(|v| v as u64),
        })
    }

    fn row_to_deposit(row: &rusqlite::Row) -> rusqlite::Result<DepositTransaction> {
        let status_str: String = row.get("status")?;
        let status = status_str.parse().unwrap_or(DepositTxStatus::Pending);

        Ok(DepositTransaction {
            id: row.get("id")?,
            address_id: row.get("address_id")?,
            tx_hash: row.get("tx_hash")?,
            amount: parse_amount("amount", row.get("amount")?)?,
            usd_value: row.get("usd_value")?,
            confirmations: row.get::<_, i64>("confirmations")? as u32,
            required_confirmations: row.get::<_, i64>("required_confirmations")? as u32,
            status,
            baseline_balance: parse_amount("baseline_balance", row.get("baseline_balance")?)?,
            observed_balance: parse_amount("observed_balance", row.get("observed_balance")?)?,
            detected_height: row.get::<_, i64>("detected_height")? as u64,
            idempotency_key: row.get("idempotency_key")?,
            failure_reason: row.get("failure_reason")?,
            created_at: row.get::<_, i64>("created_at")? as u64,
            updated_at: row.get::<_, i64>("updated_at")? as u64,
        })
    }

    fn row_to_wallet(row: &rusqlite::Row) -> rusqlite::Result<MasterWallet> {
        Ok(MasterWallet {
            id: row.get("id")?,
            network_id: row.get("network_id")?,
            label: row.get("label")?,
            symbol: row.get("symbol")?,
            address: row.get("address")?,
            is_active: row.get::<_, i64>("is_active")? != 0,
            created_at: row.get::<_, i64>("created_at")? as u64,
        })
    }

    fn row_to_sweep(row: &rusqlite::Row) -> rusqlite::Result<SweepAuditRecord> {
        let status_str: String = row.get("status")?;
        let status = status_str.parse().unwrap_or(SweepStatus::Error);
        let required_gas = match row.get::<_, Option<String>>("required_gas")? {
            Some(raw) => Some(parse_amount("required_gas", raw)?),
            None => None,
        };
        let amount = match row.get::<_, Option<String>>("amount")? {
            Some(raw) => Some(parse_amount("amount", raw)?),
            None => None,
        };

        Ok(SweepAuditRecord {
            id: row.get("id")?,
            batch_id: row.get("batch_id")?,
            result: SweepResult {
                address_id: row.get("address_id")?,
                address: row.get("address")?,
                status,
                message: row.get("message")?,
                tx_hash: row.get("tx_hash")?,
                required_gas,
                network_id: row.get("network_id")?,
            },
            amount,
            created_at: row.get::<_, i64>("created_at")? as u64,
        })
    }

    fn query_addresses(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<DepositAddress>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let records = stmt
            .query_map(args, |row| Self::row_to_address(row))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(records)
    }

    fn query_deposits(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<DepositTransaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let records = stmt
            .query_map(args, |row| Self::row_to_deposit(row))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(records)
    }

    // Synchronous helper methods for the trait implementations

    fn insert_address_sync(&self, record: &DepositAddress) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO deposit_addresses (
                id, owner_user_id, asset_id, network_id, address, key_handle,
                is_active, last_balance, baseline_epoch, created_at, last_used_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.id,
                record.owner_user_id,
                record.asset_id,
                record.network_id,
                record.address,
                record.key_handle,
                record.is_active as i64,
                record.last_balance.to_string(),
                record.baseline_epoch as i64,
                record.created_at as i64,
                record.last_used_at.map(|v| v as i64),
            ],
        )
        .map_err(|e| {
            insert_err(
                e,
                &format!(
                    "address for {}/{}/{}",
                    record.owner_user_id, record.asset_id, record.network_id
                ),
            )
        })?;
        Ok(())
    }

    fn get_address_sync(&self, id: &str) -> StorageResult<Option<DepositAddress>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM deposit_addresses WHERE id = ?1",
            params![id],
            |row| Self::row_to_address(row),
        )
        .optional()
        .map_err(db_err)
    }

    fn find_address_sync(
        &self,
        owner_user_id: &str,
        asset_id: &str,
        network_id: &str,
    ) -> StorageResult<Option<DepositAddress>> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT * FROM deposit_addresses
            WHERE owner_user_id = ?1 AND asset_id = ?2 AND network_id = ?3
            "#,
            params![owner_user_id, asset_id, network_id],
            |row| Self::row_to_address(row),
        )
        .optional()
        .map_err(db_err)
    }

    fn set_address_active_sync(&self, id: &str, active: bool) -> StorageResult<()> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE deposit_addresses SET is_active = ?2 WHERE id = ?1",
                params![id, active as i64],
            )
            .map_err(db_err)?;
        if rows == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn rebaseline_sync(&self, id: &str, balance: u128) -> StorageResult<DepositAddress> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                r#"
                UPDATE deposit_addresses
                SET last_balance = ?2, baseline_epoch = baseline_epoch + 1
                WHERE id = ?1
                "#,
                params![id, balance.to_string()],
            )
            .map_err(db_err)?;
        if rows == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        drop(conn);
        self.get_address_sync(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    fn delete_address_sync(&self, id: &str) -> StorageResult<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute("DELETE FROM deposit_addresses WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    fn insert_deposit_sync(&self, record: &DepositTransaction) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO deposit_transactions (
                id, address_id, tx_hash, amount, usd_value, confirmations,
                required_confirmations, status, baseline_balance, observed_balance,
                detected_height, idempotency_key, failure_reason, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                record.id,
                record.address_id,
                record.tx_hash,
                record.amount.to_string(),
                record.usd_value,
                record.confirmations as i64,
                record.required_confirmations as i64,
                record.status.to_string(),
                record.baseline_balance.to_string(),
                record.observed_balance.to_string(),
                record.detected_height as i64,
                record.idempotency_key,
                record.failure_reason,
                record.created_at as i64,
                record.updated_at as i64,
            ],
        )
        .map_err(|e| insert_err(e, &record.idempotency_key))?;
        Ok(())
    }

    /// Rewrite the mutable columns of a non-terminal deposit
    fn write_deposit(conn: &rusqlite::Connection, record: &DepositTransaction) -> StorageResult<usize> {
        conn.execute(
            r#"
            UPDATE deposit_transactions SET
                tx_hash = ?2,
                usd_value = ?3,
                confirmations = ?4,
                status = ?5,
                failure_reason = ?6,
                updated_at = ?7
            WHERE id = ?1 AND status NOT IN ('completed', 'failed')
            "#,
            params![
                record.id,
                record.tx_hash,
                record.usd_value,
                record.confirmations as i64,
                record.status.to_string(),
                record.failure_reason,
                record.updated_at as i64,
            ],
        )
        .map_err(db_err)
    }

    fn terminal_or_missing(conn: &rusqlite::Connection, id: &str) -> StorageError {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM deposit_transactions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or(None);
        match status {
            Some(s) => StorageError::InvalidData(format!("deposit {} is {}", id, s)),
            None => StorageError::NotFound(id.to_string()),
        }
    }

    fn update_deposit_sync(&self, record: &DepositTransaction) -> StorageResult<()> {
        let conn = self.conn()?;
        if Self::write_deposit(&conn, record)? == 0 {
            return Err(Self::terminal_or_missing(&conn, &record.id));
        }
        Ok(())
    }

    fn get_deposit_sync(&self, id: &str) -> StorageResult<Option<DepositTransaction>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM deposit_transactions WHERE id = ?1",
            params![id],
            |row| Self::row_to_deposit(row),
        )
        .optional()
        .map_err(db_err)
    }

    fn find_deposit_by_key_sync(
        &self,
        address_id: &str,
        key: &str,
    ) -> StorageResult<Option<DepositTransaction>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM deposit_transactions WHERE address_id = ?1 AND idempotency_key = ?2",
            params![address_id, key],
            |row| Self::row_to_deposit(row),
        )
        .optional()
        .map_err(db_err)
    }

    fn complete_deposit_sync(
        &self,
        record: &DepositTransaction,
        new_last_balance: u128,
        used_at: u64,
    ) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        if Self::write_deposit(&tx, record)? == 0 {
            return Err(Self::terminal_or_missing(&tx, &record.id));
        }

        let rows = tx
            .execute(
                r#"
                UPDATE deposit_addresses SET last_balance = ?2, last_used_at = ?3
                WHERE id = ?1
                "#,
                params![record.address_id, new_last_balance.to_string(), used_at as i64],
            )
            .map_err(db_err)?;
        if rows == 0 {
            return Err(StorageError::NotFound(record.address_id.clone()));
        }

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn insert_master_wallet_sync(&self, record: &MasterWallet) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO master_wallets (id, network_id, label, symbol, address, is_active, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.id,
                record.network_id,
                record.label,
                record.symbol,
                record.address,
                record.is_active as i64,
                record.created_at as i64,
            ],
        )
        .map_err(|e| insert_err(e, &format!("active master wallet for {}", record.network_id)))?;
        Ok(())
    }

    fn query_wallets(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> StorageResult<Vec<MasterWallet>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let records = stmt
            .query_map(args, |row| Self::row_to_wallet(row))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(records)
    }

    fn set_master_wallet_active_sync(&self, id: &str, active: bool) -> StorageResult<()> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE master_wallets SET is_active = ?2 WHERE id = ?1",
                params![id, active as i64],
            )
            .map_err(|e| insert_err(e, &format!("active master wallet (activating {})", id)))?;
        if rows == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn record_sweep_sync(&self, record: &SweepAuditRecord) -> StorageResult<()> {
        let conn = self.conn()?;
        let r = &record.result;
        conn.execute(
            r#"
            INSERT INTO sweep_audit (
                id, batch_id, address_id, address, network_id, status, message,
                tx_hash, required_gas, amount, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.id,
                record.batch_id,
                r.address_id,
                r.address,
                r.network_id,
                r.status.to_string(),
                r.message,
                r.tx_hash,
                r.required_gas.map(|g| g.to_string()),
                record.amount.map(|a| a.to_string()),
                record.created_at as i64,
            ],
        )
        .map_err(|e| insert_err(e, &record.id))?;
        Ok(())
    }

    fn list_sweeps_sync(&self, limit: usize) -> StorageResult<Vec<SweepAuditRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM sweep_audit ORDER BY created_at DESC, rowid DESC LIMIT ?1")
            .map_err(db_err)?;
        let records = stmt
            .query_map(params![limit as i64], |row| Self::row_to_sweep(row))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(records)
    }
}

#[async_trait]
impl AddressStore for SqliteCustodyStore {
    async fn insert_address(&self, record: &DepositAddress) -> StorageResult<()> {
        self.insert_address_sync(record)
    }

    async fn get_address(&self, id: &str) -> StorageResult<Option<DepositAddress>> {
        self.get_address_sync(id)
    }

    async fn find_address(
        &self,
        owner_user_id: &str,
        asset_id: &str,
        network_id: &str,
    ) -> StorageResult<Option<DepositAddress>> {
        self.find_address_sync(owner_user_id, asset_id, network_id)
    }

    async fn list_addresses(&self) -> StorageResult<Vec<DepositAddress>> {
        self.query_addresses(
            "SELECT * FROM deposit_addresses ORDER BY created_at ASC, id ASC",
            &[],
        )
    }

    async fn list_active_addresses(&self, network_id: &str) -> StorageResult<Vec<DepositAddress>> {
        self.query_addresses(
            r#"
            SELECT * FROM deposit_addresses
            WHERE network_id = ?1 AND is_active = 1
            ORDER BY created_at ASC, id ASC
            "#,
            &[&network_id],
        )
    }

    async fn set_address_active(&self, id: &str, active: bool) -> StorageResult<()> {
        self.set_address_active_sync(id, active)
    }

    async fn rebaseline(&self, id: &str, balance: u128) -> StorageResult<DepositAddress> {
        self.rebaseline_sync(id, balance)
    }

    async fn delete_address(&self, id: &str) -> StorageResult<bool> {
        self.delete_address_sync(id)
    }
}

#[async_trait]
impl DepositTxStore for SqliteCustodyStore {
    async fn insert_deposit(&self, record: &DepositTransaction) -> StorageResult<()> {
        self.insert_deposit_sync(record)
    }

    async fn update_deposit(&self, record: &DepositTransaction) -> StorageResult<()> {
        self.update_deposit_sync(record)
    }

    async fn get_deposit(&self, id: &str) -> StorageResult<Option<DepositTransaction>> {
        self.get_deposit_sync(id)
    }

    async fn find_deposit_by_key(
        &self,
        address_id: &str,
        idempotency_key: &str,
    ) -> StorageResult<Option<DepositTransaction>> {
        self.find_deposit_by_key_sync(address_id, idempotency_key)
    }

    async fn open_deposits(&self, address_id: &str) -> StorageResult<Vec<DepositTransaction>> {
        self.query_deposits(
            r#"
            SELECT * FROM deposit_transactions
            WHERE address_id = ?1 AND status NOT IN ('completed', 'failed')
            ORDER BY created_at ASC, rowid ASC
            "#,
            &[&address_id],
        )
    }

    async fn deposits_for_address(&self, address_id: &str) -> StorageResult<Vec<DepositTransaction>> {
        self.query_deposits(
            "SELECT * FROM deposit_transactions WHERE address_id = ?1 ORDER BY created_at ASC, rowid ASC",
            &[&address_id],
        )
    }

    async fn list_deposits(&self) -> StorageResult<Vec<DepositTransaction>> {
        self.query_deposits(
            "SELECT * FROM deposit_transactions ORDER BY created_at DESC, rowid DESC",
            &[],
        )
    }

    async fn complete_deposit(
        &self,
        record: &DepositTransaction,
        new_last_balance: u128,
        used_at: u64,
    ) -> StorageResult<()> {
        self.complete_deposit_sync(record, new_last_balance, used_at)
    }
}

#[async_trait]
impl MasterWalletStore for SqliteCustodyStore {
    async fn insert_master_wallet(&self, record: &MasterWallet) -> StorageResult<()> {
        self.insert_master_wallet_sync(record)
    }

    async fn get_master_wallet(&self, id: &str) -> StorageResult<Option<MasterWallet>> {
        Ok(self
            .query_wallets("SELECT * FROM master_wallets WHERE id = ?1", &[&id])?
            .into_iter()
            .next())
    }

    async fn active_master_wallet(&self, network_id: &str) -> StorageResult<Option<MasterWallet>> {
        Ok(self
            .query_wallets(
                "SELECT * FROM master_wallets WHERE network_id = ?1 AND is_active = 1",
                &[&network_id],
            )?
            .into_iter()
            .next())
    }

    async fn list_master_wallets(&self) -> StorageResult<Vec<MasterWallet>> {
        self.query_wallets(
            "SELECT * FROM master_wallets ORDER BY created_at ASC, id ASC",
            &[],
        )
    }

    async fn set_master_wallet_active(&self, id: &str, active: bool) -> StorageResult<()> {
        self.set_master_wallet_active_sync(id, active)
    }
}

#[async_trait]
impl SweepAuditStore for SqliteCustodyStore {
    async fn record_sweep(&self, record: &SweepAuditRecord) -> StorageResult<()> {
        self.record_sweep_sync(record)
    }

    async fn list_sweeps(&self, limit: usize) -> StorageResult<Vec<SweepAuditRecord>> {
        self.list_sweeps_sync(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(user: &str) -> DepositAddress {
        DepositAddress::new(user, "eth", "eth-mainnet", format!("0x{}", user), "kh_test")
    }

    #[tokio::test]
    async fn test_insert_and_find_address() {
        let store = SqliteCustodyStore::in_memory().unwrap();
        let record = address("u1");

        store.insert_address(&record).await.unwrap();

        let retrieved = store.get_address(&record.id).await.unwrap().unwrap();
        assert_eq!(retrieved, record);

        let found = store.find_address("u1", "eth", "eth-mainnet").await.unwrap();
        assert_eq!(found.map(|a| a.id), Some(record.id));
        assert!(store.find_address("u1", "btc", "eth-mainnet").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_tuple() {
        let store = SqliteCustodyStore::in_memory().unwrap();
        store.insert_address(&address("u1")).await.unwrap();
        let result = store.insert_address(&address("u1")).await;
        assert!(matches!(result, Err(StorageError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_large_balance_roundtrip() {
        let store = SqliteCustodyStore::in_memory().unwrap();
        let record = address("whale");
        store.insert_address(&record).await.unwrap();

        let big = u128::from(u64::MAX) * 1_000;
        let updated = store.rebaseline(&record.id, big).await.unwrap();
        assert_eq!(updated.last_balance, big);
        assert_eq!(updated.baseline_epoch, 1);
    }

    #[tokio::test]
    async fn test_deposit_lifecycle() {
        let store = SqliteCustodyStore::in_memory().unwrap();
        let record = address("u1");
        store.insert_address(&record).await.unwrap();

        let mut tx = DepositTransaction::new(&record.id, 5, 3, "deposit:eth-mainnet:x:delta:0:0->5");
        tx.observed_balance = 5;
        store.insert_deposit(&tx).await.unwrap();

        let dup = DepositTransaction::new(&record.id, 5, 3, "deposit:eth-mainnet:x:delta:0:0->5");
        assert!(matches!(
            store.insert_deposit(&dup).await,
            Err(StorageError::Duplicate(_))
        ));

        tx.update_confirmations(1);
        store.update_deposit(&tx).await.unwrap();
        assert_eq!(store.open_deposits(&record.id).await.unwrap().len(), 1);

        tx.update_confirmations(3);
        tx.mark_completed().unwrap();
        store.complete_deposit(&tx, 5, 42).await.unwrap();

        let addr = store.get_address(&record.id).await.unwrap().unwrap();
        assert_eq!(addr.last_balance, 5);
        assert_eq!(addr.last_used_at, Some(42));
        assert!(store.open_deposits(&record.id).await.unwrap().is_empty());

        // Terminal records are not rewritten
        let mut again = tx.clone();
        again.confirmations = 99;
        assert!(matches!(
            store.update_deposit(&again).await,
            Err(StorageError::InvalidData(_))
        ));
        let stored = store.get_deposit(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.confirmations, 3);
        assert_eq!(stored.status, DepositTxStatus::Completed);
    }

    #[tokio::test]
    async fn test_one_active_master_wallet_per_network() {
        let store = SqliteCustodyStore::in_memory().unwrap();
        let first = MasterWallet::new("eth-mainnet", "Treasury", "ETH", "0xa");
        let second = MasterWallet::new("eth-mainnet", "Cold", "ETH", "0xb");

        store.insert_master_wallet(&first).await.unwrap();
        assert!(matches!(
            store.insert_master_wallet(&second).await,
            Err(StorageError::Duplicate(_))
        ));

        store.set_master_wallet_active(&first.id, false).await.unwrap();
        store.insert_master_wallet(&second).await.unwrap();
        assert!(matches!(
            store.set_master_wallet_active(&first.id, true).await,
            Err(StorageError::Duplicate(_))
        ));
        assert_eq!(store.list_master_wallets().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_audit() {
        let store = SqliteCustodyStore::in_memory().unwrap();
        let first = SweepAuditRecord::new(
            "batch-1",
            SweepResult::need_gas("addr_1", "0x1", "eth-mainnet", 1_000),
            None,
        );
        let second = SweepAuditRecord::new("batch-1", SweepResult::error("addr_2", "boom"), None);
        store.record_sweep(&first).await.unwrap();
        store.record_sweep(&second).await.unwrap();

        let sweeps = store.list_sweeps(10).await.unwrap();
        assert_eq!(sweeps.len(), 2);
        assert_eq!(sweeps[0].id, second.id);
        assert_eq!(sweeps[1].result.required_gas, Some(1_000));
    }
}
