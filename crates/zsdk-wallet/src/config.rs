//! Synchronizer configuration

use crate::registry::SynchronizerIdentity;
use crate::{Error, Result};
use std::path::PathBuf;
use zsdk_params::{BlockHeight, Checkpoint, NetworkType};
use zsdk_sync::{default_data_dir, LightClientConfig, OutboundConfig, SyncConfig};

/// Alias used when the caller does not name the wallet
pub const DEFAULT_ALIAS: &str = "zsdk";

/// Longest accepted alias
pub const MAX_ALIAS_LEN: usize = 99;

/// Check an alias is 1-99 characters from `[A-Za-z0-9_]`.
///
/// Aliases end up in file names, so nothing else is allowed.
pub fn validate_alias(alias: &str) -> Result<()> {
    let valid = !alias.is_empty()
        && alias.len() <= MAX_ALIAS_LEN
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidAlias(alias.to_string()))
    }
}

/// Everything needed to build a [`crate::Synchronizer`]
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// Network
    pub network: NetworkType,
    /// Wallet alias; with the network forms the wallet identity
    pub alias: String,
    /// Light server endpoint (`None` = network default)
    pub endpoint: Option<String>,
    /// Checkpoint the wallet was born at
    pub birthday: Checkpoint,
    /// Viewing keys imported on first initialization
    pub viewing_keys: Vec<String>,
    /// Directory holding the wallet databases
    pub data_dir: PathBuf,
    /// Block processor settings
    pub sync: SyncConfig,
    /// Outbound transaction settings
    pub outbound: OutboundConfig,
}

impl SynchronizerConfig {
    /// Config with default settings for `alias` on `network`
    pub fn new(network: NetworkType, alias: &str, birthday: Checkpoint) -> Self {
        Self {
            network,
            alias: alias.to_string(),
            endpoint: None,
            birthday,
            viewing_keys: Vec::new(),
            data_dir: default_data_dir(),
            sync: SyncConfig::default(),
            outbound: OutboundConfig::default(),
        }
    }

    /// Override the data directory
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Override the light server endpoint
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    /// Set the viewing keys imported on first run
    pub fn with_viewing_keys(mut self, keys: Vec<String>) -> Self {
        self.viewing_keys = keys;
        self
    }

    /// Validated identity of this wallet
    pub fn identity(&self) -> Result<SynchronizerIdentity> {
        SynchronizerIdentity::new(self.network, &self.alias)
    }

    /// Birthday checkpoint height on this network
    pub fn birthday_height(&self) -> Result<BlockHeight> {
        Ok(self.birthday.block_height(self.network)?)
    }

    /// Light client settings for the configured endpoint
    pub fn light_client(&self) -> LightClientConfig {
        match &self.endpoint {
            Some(endpoint) => LightClientConfig::new(endpoint, self.network),
            None => LightClientConfig::for_network(self.network),
        }
    }
}
