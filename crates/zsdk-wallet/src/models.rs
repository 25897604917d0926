//! Public models republished by the synchronizer

use serde::{Deserialize, Serialize};
use std::fmt;
use zsdk_sync::{ProcessorInfo, ProcessorState, WalletBalance};

/// Collapsed sync status for UI consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// The light server cannot be reached, or has not answered yet
    Disconnected,
    /// Fetching blocks
    Downloading,
    /// Checking downloaded blocks
    Validating,
    /// Scanning blocks for wallet activity
    Scanning,
    /// Fetching full transactions
    Enhancing,
    /// Scanned up to the chain tip
    Synced,
    /// Shut down
    Stopped,
}

impl SyncStatus {
    /// Collapse a processor state.
    ///
    /// The idle state between passes reads as `Synced` once the last scanned
    /// height has reached the known tip, `Disconnected` before any tip was
    /// seen, and `Downloading` otherwise.
    pub fn from_processor(state: &ProcessorState, info: &ProcessorInfo) -> Self {
        match state {
            ProcessorState::Downloading => Self::Downloading,
            ProcessorState::Validating => Self::Validating,
            ProcessorState::Scanning | ProcessorState::Scanned(_) => Self::Scanning,
            ProcessorState::Enhancing => Self::Enhancing,
            ProcessorState::Disconnected => Self::Disconnected,
            ProcessorState::Stopped => Self::Stopped,
            ProcessorState::Initialized => {
                if info.is_synced() {
                    Self::Synced
                } else if info.network_block_height.is_none() {
                    Self::Disconnected
                } else {
                    Self::Downloading
                }
            }
        }
    }

    /// Whether the wallet is catching up with the chain
    pub fn is_syncing(&self) -> bool {
        matches!(
            self,
            Self::Downloading | Self::Validating | Self::Scanning | Self::Enhancing
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Downloading => "downloading",
            Self::Validating => "validating",
            Self::Scanning => "scanning",
            Self::Enhancing => "enhancing",
            Self::Synced => "synced",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Result of address validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    /// Sapling shielded address
    Shielded,
    /// Transparent address
    Transparent,
    /// Unified address
    Unified,
    /// Not an address on this network
    Invalid(String),
}

impl AddressType {
    /// Whether the address can receive funds
    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}

/// Balances per pool, `None` until first computed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalances {
    /// Shielded balance of the default account
    pub shielded: Option<WalletBalance>,
    /// Transparent balance of the default account's address
    pub transparent: Option<WalletBalance>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use zsdk_params::{BlockHeight, NetworkType};

    fn h(v: u64) -> BlockHeight {
        BlockHeight::new(v, NetworkType::Regtest).unwrap()
    }

    #[test]
    fn test_idle_status_collapse() {
        let mut info = ProcessorInfo::default();
        assert_eq!(
            SyncStatus::from_processor(&ProcessorState::Initialized, &info),
            SyncStatus::Disconnected
        );

        info.network_block_height = Some(h(200));
        info.last_scanned_height = Some(h(150));
        assert_eq!(
            SyncStatus::from_processor(&ProcessorState::Initialized, &info),
            SyncStatus::Downloading
        );

        info.last_scanned_height = Some(h(200));
        assert_eq!(
            SyncStatus::from_processor(&ProcessorState::Initialized, &info),
            SyncStatus::Synced
        );
    }

    #[test]
    fn test_active_states_map_directly() {
        let info = ProcessorInfo::default();
        let range = zsdk_sync::BlockRange::new(h(10), h(20)).unwrap();
        let cases = [
            (ProcessorState::Downloading, SyncStatus::Downloading),
            (ProcessorState::Validating, SyncStatus::Validating),
            (ProcessorState::Scanning, SyncStatus::Scanning),
            (ProcessorState::Scanned(range), SyncStatus::Scanning),
            (ProcessorState::Enhancing, SyncStatus::Enhancing),
            (ProcessorState::Disconnected, SyncStatus::Disconnected),
            (ProcessorState::Stopped, SyncStatus::Stopped),
        ];
        for (state, expected) in cases {
            assert_eq!(SyncStatus::from_processor(&state, &info), expected);
        }
    }

    #[test]
    fn test_status_serializes_by_name() {
        let json = serde_json::to_string(&SyncStatus::Synced).unwrap();
        assert_eq!(json, "\"Synced\"");
        assert_eq!(SyncStatus::Synced.to_string(), "synced");
    }
}
