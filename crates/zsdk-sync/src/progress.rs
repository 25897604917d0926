//! Processor state and progress publishing.
//!
//! Every value is published through a `tokio::sync::watch` channel, so late
//! subscribers always see the most recent state.

use crate::backend::BlockRange;
use std::sync::Arc;
use tokio::sync::watch;
use zsdk_params::BlockHeight;

/// Block processor state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorState {
    /// Idle between passes
    Initialized,
    /// Fetching compact blocks into the cache
    Downloading,
    /// Checking hash linkage of cached blocks
    Validating,
    /// Handing cached blocks to the wallet store
    Scanning,
    /// A range finished scanning
    Scanned(BlockRange),
    /// Fetching full transactions for newly found txids
    Enhancing,
    /// The remote could not be reached
    Disconnected,
    /// Terminal
    Stopped,
}

impl ProcessorState {
    /// Get display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::Downloading => "Downloading",
            Self::Validating => "Validating",
            Self::Scanning => "Scanning",
            Self::Scanned(_) => "Scanned",
            Self::Enhancing => "Enhancing",
            Self::Disconnected => "Disconnected",
            Self::Stopped => "Stopped",
        }
    }
}

/// Snapshot of processor heights and ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorInfo {
    /// Chain tip last reported by the remote
    pub network_block_height: Option<BlockHeight>,
    /// Highest cached height
    pub last_downloaded_height: Option<BlockHeight>,
    /// Highest scanned height
    pub last_scanned_height: Option<BlockHeight>,
    /// Lowest scanned height
    pub first_scanned_height: Option<BlockHeight>,
    /// Range of the current download
    pub download_range: Option<BlockRange>,
    /// Range of the current scan
    pub scan_range: Option<BlockRange>,
    /// Whether a scan is in flight
    pub is_scanning: bool,
}

impl ProcessorInfo {
    /// Scan progress in percent.
    ///
    /// Measured over the current scan range; 100 once the last scanned
    /// height has reached the known tip.
    pub fn progress(&self) -> u8 {
        if let (Some(last), Some(tip)) = (self.last_scanned_height, self.network_block_height) {
            if last >= tip {
                return 100;
            }
        }
        let (Some(range), Some(last)) = (self.scan_range, self.last_scanned_height) else {
            return 0;
        };
        if last < range.start {
            return 0;
        }
        if last >= range.end {
            return 100;
        }
        let done = (last.value() - range.start.value() + 1) as u64;
        ((done * 100) / range.len() as u64).min(100) as u8
    }

    /// Whether the wallet has scanned up to the known tip
    pub fn is_synced(&self) -> bool {
        matches!(
            (self.last_scanned_height, self.network_block_height),
            (Some(last), Some(tip)) if last >= tip
        )
    }
}

/// Publishes processor state, info and progress.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    state: Arc<watch::Sender<ProcessorState>>,
    info: Arc<watch::Sender<ProcessorInfo>>,
    progress: Arc<watch::Sender<u8>>,
}

impl ProgressTracker {
    /// Create new tracker in the `Initialized` state
    pub fn new() -> Self {
        let (state, _) = watch::channel(ProcessorState::Initialized);
        let (info, _) = watch::channel(ProcessorInfo::default());
        let (progress, _) = watch::channel(0u8);
        Self {
            state: Arc::new(state),
            info: Arc::new(info),
            progress: Arc::new(progress),
        }
    }

    /// Publish a state transition
    pub fn set_state(&self, state: ProcessorState) {
        tracing::debug!(state = state.name(), "Processor state changed");
        self.state.send_replace(state);
    }

    /// Mutate and republish the info snapshot, refreshing progress
    pub fn update_info(&self, f: impl FnOnce(&mut ProcessorInfo)) {
        self.info.send_modify(f);
        let pct = self.info.borrow().progress();
        self.progress.send_if_modified(|current| {
            if *current != pct {
                *current = pct;
                true
            } else {
                false
            }
        });
    }

    /// Current state
    pub fn state(&self) -> ProcessorState {
        self.state.borrow().clone()
    }

    /// Current info snapshot
    pub fn info(&self) -> ProcessorInfo {
        self.info.borrow().clone()
    }

    /// Subscribe to state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessorState> {
        self.state.subscribe()
    }

    /// Subscribe to info changes
    pub fn subscribe_info(&self) -> watch::Receiver<ProcessorInfo> {
        self.info.subscribe()
    }

    /// Subscribe to progress changes
    pub fn subscribe_progress(&self) -> watch::Receiver<u8> {
        self.progress.subscribe()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zsdk_params::NetworkType;

    fn h(v: u64) -> BlockHeight {
        BlockHeight::new(v, NetworkType::Regtest).unwrap()
    }

    #[test]
    fn test_progress_over_scan_range() {
        let mut info = ProcessorInfo {
            network_block_height: Some(h(200)),
            scan_range: BlockRange::new(h(101), h(200)),
            last_scanned_height: Some(h(100)),
            ..Default::default()
        };
        assert_eq!(info.progress(), 0);

        info.last_scanned_height = Some(h(150));
        assert_eq!(info.progress(), 50);

        info.last_scanned_height = Some(h(200));
        assert_eq!(info.progress(), 100);
        assert!(info.is_synced());
    }

    #[test]
    fn test_progress_without_range() {
        let info = ProcessorInfo::default();
        assert_eq!(info.progress(), 0);
        assert!(!info.is_synced());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_last_value() {
        let tracker = ProgressTracker::new();
        tracker.set_state(ProcessorState::Downloading);
        tracker.set_state(ProcessorState::Scanning);

        let rx = tracker.subscribe_state();
        assert_eq!(*rx.borrow(), ProcessorState::Scanning);
    }

    #[tokio::test]
    async fn test_progress_published_on_info_update() {
        let tracker = ProgressTracker::new();
        let mut rx = tracker.subscribe_progress();
        tracker.update_info(|info| {
            info.network_block_height = Some(h(10));
            info.last_scanned_height = Some(h(10));
        });
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 100);
    }
}
