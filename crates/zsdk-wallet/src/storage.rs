//! On-disk layout of a wallet and its removal

use crate::registry::{SynchronizerIdentity, SynchronizerRegistry};
use crate::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// SQLite side files removed together with a database
const SIDE_FILE_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// Which store a file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Compact block cache
    Cache,
    /// Wallet data
    Data,
    /// Pending transaction ledger
    Pending,
}

/// Database paths for one wallet identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    /// Compact block cache
    pub cache: PathBuf,
    /// Wallet data store
    pub data: PathBuf,
    /// Pending transaction ledger
    pub pending: PathBuf,
}

impl StoragePaths {
    /// Paths for `identity` under `data_dir`
    pub fn for_identity(data_dir: &Path, identity: &SynchronizerIdentity) -> Self {
        let prefix = format!("{}_{}", identity.network, identity.alias);
        Self {
            cache: data_dir.join(format!("{}_cache.db", prefix)),
            data: data_dir.join(format!("{}_data.db", prefix)),
            pending: data_dir.join(format!("{}_pending.db", prefix)),
        }
    }

    /// Every store with its path
    pub fn stores(&self) -> [(StoreKind, &Path); 3] {
        [
            (StoreKind::Cache, self.cache.as_path()),
            (StoreKind::Data, self.data.as_path()),
            (StoreKind::Pending, self.pending.as_path()),
        ]
    }
}

/// What [`erase_wallet`] found and removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EraseOutcome {
    /// Stores whose database existed and was deleted
    pub removed: Vec<StoreKind>,
    /// Stores with no database on disk
    pub missing: Vec<StoreKind>,
    /// Every file deleted, side files included
    pub files: Vec<PathBuf>,
}

impl EraseOutcome {
    /// Whether anything was deleted
    pub fn erased_anything(&self) -> bool {
        !self.files.is_empty()
    }
}

/// Delete all databases of `identity`.
///
/// The identity is claimed for the duration of the erase, so no synchronizer
/// can open the stores meanwhile. Fails with [`Error::AlreadyActive`] while a
/// synchronizer is running and waits for one that is shutting down. Missing
/// stores are reported in the outcome.
pub async fn erase_wallet(
    registry: &SynchronizerRegistry,
    data_dir: &Path,
    identity: &SynchronizerIdentity,
) -> Result<EraseOutcome> {
    let lease = registry.claim(identity.clone()).await?;
    let outcome = remove_stores(data_dir, identity);
    lease.release();
    outcome
}

fn remove_stores(data_dir: &Path, identity: &SynchronizerIdentity) -> Result<EraseOutcome> {
    let paths = StoragePaths::for_identity(data_dir, identity);
    let mut outcome = EraseOutcome::default();

    for (kind, path) in paths.stores() {
        if remove_if_exists(path)? {
            outcome.removed.push(kind);
            outcome.files.push(path.to_path_buf());
        } else {
            outcome.missing.push(kind);
        }

        for suffix in SIDE_FILE_SUFFIXES {
            let mut side = path.as_os_str().to_owned();
            side.push(suffix);
            let side = PathBuf::from(side);
            if remove_if_exists(&side)? {
                outcome.files.push(side);
            }
        }
    }

    if outcome.missing.len() == paths.stores().len() {
        warn!("No wallet data found for {}", identity);
    }
    info!(
        event = "wallet_erased",
        identity = %identity,
        files = outcome.files.len(),
        "Erased wallet data"
    );
    Ok(outcome)
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::time::Duration;
    use zsdk_params::NetworkType;

    fn identity() -> SynchronizerIdentity {
        SynchronizerIdentity::new(NetworkType::Testnet, "alias1").unwrap()
    }

    #[test]
    fn test_paths_are_namespaced() {
        let dir = Path::new("/data");
        let paths = StoragePaths::for_identity(dir, &identity());
        assert_eq!(paths.cache, dir.join("testnet_alias1_cache.db"));
        assert_eq!(paths.data, dir.join("testnet_alias1_data.db"));
        assert_eq!(paths.pending, dir.join("testnet_alias1_pending.db"));

        let other = SynchronizerIdentity::new(NetworkType::Mainnet, "alias1").unwrap();
        assert_ne!(StoragePaths::for_identity(dir, &other), paths);
    }

    #[tokio::test]
    async fn test_erase_removes_databases_and_side_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StoragePaths::for_identity(dir.path(), &identity());
        fs::write(&paths.cache, b"cache").unwrap();
        fs::write(&paths.data, b"data").unwrap();
        fs::write(dir.path().join("testnet_alias1_data.db-wal"), b"wal").unwrap();
        fs::write(dir.path().join("testnet_alias1_cache.db-journal"), b"j").unwrap();

        let outcome = erase_wallet(&SynchronizerRegistry::new(), dir.path(), &identity())
            .await
            .unwrap();
        assert_eq!(outcome.removed, vec![StoreKind::Cache, StoreKind::Data]);
        assert_eq!(outcome.missing, vec![StoreKind::Pending]);
        assert_eq!(outcome.files.len(), 4);
        assert!(!paths.cache.exists());
        assert!(!paths.data.exists());
        assert!(!dir.path().join("testnet_alias1_data.db-wal").exists());
    }

    #[tokio::test]
    async fn test_erase_missing_wallet_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SynchronizerRegistry::new();
        let outcome = erase_wallet(&registry, dir.path(), &identity()).await.unwrap();
        assert!(!outcome.erased_anything());
        assert_eq!(outcome.missing.len(), 3);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_erase_refuses_active_identity() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SynchronizerRegistry::new();
        let paths = StoragePaths::for_identity(dir.path(), &identity());
        fs::write(&paths.data, b"data").unwrap();

        let lease = registry.claim(identity()).await.unwrap();
        let err = erase_wallet(&registry, dir.path(), &identity()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyActive { .. }));
        assert!(paths.data.exists());

        lease.release();
        assert!(erase_wallet(&registry, dir.path(), &identity()).await.is_ok());
        assert!(!paths.data.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_erase_waits_for_shutdown_and_holds_identity() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SynchronizerRegistry::new();
        let paths = StoragePaths::for_identity(dir.path(), &identity());
        fs::write(&paths.data, b"data").unwrap();

        let lease = registry.claim(identity()).await.unwrap();
        lease.begin_shutdown();

        let erase = {
            let registry = registry.clone();
            let dir = dir.path().to_path_buf();
            tokio::spawn(async move { erase_wallet(&registry, &dir, &identity()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!erase.is_finished());
        assert!(paths.data.exists());

        lease.release();
        let outcome = erase.await.unwrap().unwrap();
        assert_eq!(outcome.removed, vec![StoreKind::Data]);
        assert!(registry.is_empty());
    }
}
