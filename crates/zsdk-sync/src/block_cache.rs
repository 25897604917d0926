//! SQLite compact block cache.

use crate::backend::{BlockCacheStore, CompactBlock};
use crate::{Error, Result};
use async_trait::async_trait;
use directories::ProjectDirs;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use zsdk_params::{BlockHeight, NetworkType};

/// Environment variable overriding the SDK data directory
pub const DATA_DIR_ENV: &str = "ZSDK_DATA_DIR";

/// Block cache backed by a single SQLite file.
pub struct SqliteBlockCache {
    network: NetworkType,
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteBlockCache {
    /// Open (creating if needed) the cache at `path`
    pub fn open(path: impl AsRef<Path>, network: NetworkType) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
        }
        let conn = Connection::open(&path)?;
        Self::init(conn, network, Some(path))
    }

    /// Cache that lives only as long as this value
    pub fn open_in_memory(network: NetworkType) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, network, None)
    }

    fn init(conn: Connection, network: NetworkType, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS compactblocks (
                height INTEGER PRIMARY KEY,
                hash BLOB NOT NULL,
                prev_hash BLOB NOT NULL,
                data BLOB NOT NULL
             );",
        )?;
        Ok(Self {
            network,
            path,
            conn: Mutex::new(conn),
        })
    }

    /// File backing this cache, `None` for in-memory caches
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of cached blocks
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM compactblocks", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn height(&self, raw: i64) -> Result<BlockHeight> {
        Ok(BlockHeight::new(raw as u64, self.network)?)
    }
}

#[async_trait]
impl BlockCacheStore for SqliteBlockCache {
    async fn highest_height(&self) -> Result<Option<BlockHeight>> {
        let max: Option<i64> = {
            let conn = self.conn.lock();
            conn.query_row("SELECT MAX(height) FROM compactblocks", [], |row| row.get(0))?
        };
        max.map(|h| self.height(h)).transpose()
    }

    async fn write_batch(&self, blocks: Vec<CompactBlock>) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO compactblocks (height, hash, prev_hash, data)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for block in &blocks {
                stmt.execute(params![
                    block.height.value() as i64,
                    block.hash,
                    block.prev_hash,
                    block.data
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn truncate_above(&self, height: BlockHeight) -> Result<()> {
        let removed = {
            let conn = self.conn.lock();
            conn.execute(
                "DELETE FROM compactblocks WHERE height > ?1",
                params![height.value() as i64],
            )?
        };
        tracing::debug!("Block cache truncated above {} ({} blocks removed)", height, removed);
        Ok(())
    }

    async fn read(&self, height: BlockHeight) -> Result<Option<CompactBlock>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT hash, prev_hash, data FROM compactblocks WHERE height = ?1",
                params![height.value() as i64],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )
            .optional()?
        };
        Ok(row.map(|(hash, prev_hash, data)| CompactBlock {
            height,
            hash,
            prev_hash,
            data,
        }))
    }
}

/// Base directory for SDK databases.
///
/// `ZSDK_DATA_DIR` wins when set; otherwise the platform data directory.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    ProjectDirs::from("com", "zsdk", "LightWalletSdk")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}
