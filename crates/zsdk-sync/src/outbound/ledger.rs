//! Durable store of pending outbound transactions.

use super::pending::{PendingTransaction, Recipient};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tokio::sync::watch;
use zsdk_params::{BlockHeight, ConsensusParams, NetworkType, Zatoshi};

/// Persistence for [`PendingTransaction`] rows.
///
/// Every mutation bumps the counter observed through [`subscribe`](Self::subscribe).
#[async_trait]
pub trait PendingTransactionLedger: Send + Sync {
    /// Insert a row, returning it with its assigned id
    async fn insert(&self, tx: PendingTransaction) -> Result<PendingTransaction>;

    /// Load a row by id
    async fn find(&self, id: i64) -> Result<Option<PendingTransaction>>;

    /// Overwrite an existing row
    async fn update(&self, tx: &PendingTransaction) -> Result<()>;

    /// Delete a row; `false` if it did not exist
    async fn delete(&self, id: i64) -> Result<bool>;

    /// All rows, oldest first
    async fn all(&self) -> Result<Vec<PendingTransaction>>;

    /// Change counter, bumped on every mutation
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Ledger backed by SQLite.
pub struct SqlitePendingLedger {
    params: ConsensusParams,
    conn: Mutex<Connection>,
    version: watch::Sender<u64>,
}

const COLUMNS: &str = "id, value, to_address, to_account, memo, account, raw, txid, \
     expiry_height, mined_height, encode_attempts, submit_attempts, error_code, \
     error_message, cancelled, create_time, marked_for_deletion, accepted";

impl SqlitePendingLedger {
    /// Open (creating if needed) the ledger at `path`
    pub fn open(path: impl AsRef<Path>, network: NetworkType) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?, network)
    }

    /// In-memory ledger
    pub fn open_in_memory(network: NetworkType) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, network)
    }

    fn init(conn: Connection, network: NetworkType) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pending_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                value INTEGER NOT NULL,
                to_address TEXT,
                to_account INTEGER,
                memo BLOB NOT NULL,
                account INTEGER NOT NULL,
                raw BLOB,
                txid BLOB,
                expiry_height INTEGER,
                mined_height INTEGER,
                encode_attempts INTEGER NOT NULL DEFAULT 0,
                submit_attempts INTEGER NOT NULL DEFAULT 0,
                error_code INTEGER,
                error_message TEXT,
                cancelled INTEGER NOT NULL DEFAULT 0,
                create_time INTEGER NOT NULL,
                marked_for_deletion INTEGER NOT NULL DEFAULT 0,
                accepted INTEGER NOT NULL DEFAULT 0
             );",
        )?;
        let (version, _) = watch::channel(0);
        Ok(Self {
            params: ConsensusParams::from_network(network),
            conn: Mutex::new(conn),
            version,
        })
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn from_row(&self, row: &Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            id: row.get(0)?,
            value: row.get(1)?,
            to_address: row.get(2)?,
            to_account: row.get(3)?,
            memo: row.get(4)?,
            account: row.get(5)?,
            raw: row.get(6)?,
            txid: row.get(7)?,
            expiry_height: row.get(8)?,
            mined_height: row.get(9)?,
            encode_attempts: row.get(10)?,
            submit_attempts: row.get(11)?,
            error_code: row.get(12)?,
            error_message: row.get(13)?,
            cancelled: row.get(14)?,
            create_time: row.get(15)?,
            marked_for_deletion: row.get(16)?,
            accepted: row.get(17)?,
        })
    }

    fn height(&self, raw: Option<i64>) -> Result<Option<BlockHeight>> {
        raw.map(|h| BlockHeight::new(h as u64, self.params.network.network_type))
            .transpose()
            .map_err(Error::from)
    }

    fn hydrate(&self, raw: RawRow) -> Result<PendingTransaction> {
        let recipient = match (raw.to_address, raw.to_account) {
            (Some(address), _) => Recipient::Address(address),
            (None, Some(account)) => Recipient::SelfAccount(account),
            (None, None) => {
                return Err(Error::Storage(format!(
                    "pending transaction {} has no recipient",
                    raw.id
                )))
            }
        };
        Ok(PendingTransaction {
            id: raw.id,
            value: Zatoshi::new(raw.value, &self.params)?,
            recipient,
            memo: raw.memo,
            account: raw.account,
            raw: raw.raw,
            txid: raw.txid,
            expiry_height: self.height(raw.expiry_height)?,
            mined_height: self.height(raw.mined_height)?,
            encode_attempts: raw.encode_attempts,
            submit_attempts: raw.submit_attempts,
            accepted: raw.accepted,
            error_code: raw.error_code,
            error_message: raw.error_message,
            cancelled: raw.cancelled,
            create_time: raw.create_time,
            marked_for_deletion: raw.marked_for_deletion,
        })
    }
}

struct RawRow {
    id: i64,
    value: i64,
    to_address: Option<String>,
    to_account: Option<u32>,
    memo: Vec<u8>,
    account: u32,
    raw: Option<Vec<u8>>,
    txid: Option<Vec<u8>>,
    expiry_height: Option<i64>,
    mined_height: Option<i64>,
    encode_attempts: u32,
    submit_attempts: u32,
    error_code: Option<i32>,
    error_message: Option<String>,
    cancelled: bool,
    create_time: i64,
    marked_for_deletion: bool,
    accepted: bool,
}

fn recipient_columns(recipient: &Recipient) -> (Option<&str>, Option<u32>) {
    match recipient {
        Recipient::Address(address) => (Some(address.as_str()), None),
        Recipient::SelfAccount(account) => (None, Some(*account)),
    }
}

fn height_column(height: Option<BlockHeight>) -> Option<i64> {
    height.map(|h| h.value() as i64)
}

#[async_trait]
impl PendingTransactionLedger for SqlitePendingLedger {
    async fn insert(&self, mut tx: PendingTransaction) -> Result<PendingTransaction> {
        let (to_address, to_account) = recipient_columns(&tx.recipient);
        let id = {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO pending_transactions (value, to_address, to_account, memo, account,
                    raw, txid, expiry_height, mined_height, encode_attempts, submit_attempts,
                    error_code, error_message, cancelled, create_time, marked_for_deletion, accepted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    tx.value.value(),
                    to_address,
                    to_account,
                    tx.memo,
                    tx.account,
                    tx.raw,
                    tx.txid,
                    height_column(tx.expiry_height),
                    height_column(tx.mined_height),
                    tx.encode_attempts,
                    tx.submit_attempts,
                    tx.error_code,
                    tx.error_message,
                    tx.cancelled,
                    tx.create_time,
                    tx.marked_for_deletion,
                    tx.accepted,
                ],
            )?;
            conn.last_insert_rowid()
        };
        tx.id = id;
        self.bump();
        Ok(tx)
    }

    async fn find(&self, id: i64) -> Result<Option<PendingTransaction>> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM pending_transactions WHERE id = ?1"),
                params![id],
                |row| self.from_row(row),
            )
            .optional()?
        };
        raw.map(|r| self.hydrate(r)).transpose()
    }

    async fn update(&self, tx: &PendingTransaction) -> Result<()> {
        let (to_address, to_account) = recipient_columns(&tx.recipient);
        let changed = {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE pending_transactions SET value = ?2, to_address = ?3, to_account = ?4,
                    memo = ?5, account = ?6, raw = ?7, txid = ?8, expiry_height = ?9,
                    mined_height = ?10, encode_attempts = ?11, submit_attempts = ?12,
                    error_code = ?13, error_message = ?14, cancelled = ?15, create_time = ?16,
                    marked_for_deletion = ?17, accepted = ?18
                 WHERE id = ?1",
                params![
                    tx.id,
                    tx.value.value(),
                    to_address,
                    to_account,
                    tx.memo,
                    tx.account,
                    tx.raw,
                    tx.txid,
                    height_column(tx.expiry_height),
                    height_column(tx.mined_height),
                    tx.encode_attempts,
                    tx.submit_attempts,
                    tx.error_code,
                    tx.error_message,
                    tx.cancelled,
                    tx.create_time,
                    tx.marked_for_deletion,
                    tx.accepted,
                ],
            )?
        };
        if changed == 0 {
            return Err(Error::TransactionNotFound(tx.id));
        }
        self.bump();
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let removed = {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM pending_transactions WHERE id = ?1", params![id])?
        };
        if removed > 0 {
            self.bump();
        }
        Ok(removed > 0)
    }

    async fn all(&self) -> Result<Vec<PendingTransaction>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM pending_transactions ORDER BY id"))?;
            let rows = stmt
                .query_map([], |row| self.from_row(row))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(|r| self.hydrate(r)).collect()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}
