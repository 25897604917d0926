//! Error handler registration and the sync event channel.

use crate::backend::BlockRange;
use crate::progress::ProcessorState;
use crate::Error;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use zsdk_params::BlockHeight;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What the engine should do after a reported failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Keep going (retry, or ignore for setup errors)
    Retry,
    /// Give up
    Abort,
}

/// Handler consulted on a recoverable failure
pub type ErrorHandler = Arc<dyn Fn(&Error) -> Decision + Send + Sync>;
/// Handler told about fatal failures
pub type CriticalHandler = Arc<dyn Fn(&Error) + Send + Sync>;
/// Handler told about a repaired reorg: `(error_height, rewind_height)`
pub type ChainErrorHandler = Arc<dyn Fn(BlockHeight, BlockHeight) + Send + Sync>;

/// Events broadcast by the processor and the outbound manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Processor state transition
    StateChanged(ProcessorState),
    /// Reorg detected at `error_height`, repaired by rewinding to `rewind_height`
    ChainError {
        /// First height whose linkage broke
        error_height: BlockHeight,
        /// Height the stores were rewound to
        rewind_height: BlockHeight,
    },
    /// A pass failed and will be retried
    ProcessorError(String),
    /// Unrecoverable failure
    Critical(String),
    /// A range finished scanning
    Scanned(BlockRange),
}

#[derive(Default, Clone)]
struct HandlerSet {
    critical: Option<CriticalHandler>,
    processor: Option<ErrorHandler>,
    setup: Option<ErrorHandler>,
    submission: Option<ErrorHandler>,
    chain: Option<ChainErrorHandler>,
}

/// Registered error handlers plus the event broadcast.
///
/// Cheap to clone; all clones share registrations.
#[derive(Clone)]
pub struct Handlers {
    inner: Arc<RwLock<HandlerSet>>,
    events: broadcast::Sender<SyncEvent>,
}

impl Handlers {
    /// No handlers registered
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(HandlerSet::default())),
            events,
        }
    }

    /// Register the critical-error handler
    pub fn set_critical(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        self.inner.write().critical = Some(Arc::new(handler));
    }

    /// Register the processor-error handler
    pub fn set_processor(&self, handler: impl Fn(&Error) -> Decision + Send + Sync + 'static) {
        self.inner.write().processor = Some(Arc::new(handler));
    }

    /// Register the setup-error handler
    pub fn set_setup(&self, handler: impl Fn(&Error) -> Decision + Send + Sync + 'static) {
        self.inner.write().setup = Some(Arc::new(handler));
    }

    /// Register the submission-error handler
    pub fn set_submission(&self, handler: impl Fn(&Error) -> Decision + Send + Sync + 'static) {
        self.inner.write().submission = Some(Arc::new(handler));
    }

    /// Register the chain-error handler
    pub fn set_chain(&self, handler: impl Fn(BlockHeight, BlockHeight) + Send + Sync + 'static) {
        self.inner.write().chain = Some(Arc::new(handler));
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Broadcast an event; dropped when nobody listens
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Report a failed pass. Defaults to `Retry`.
    pub fn processor_error(&self, error: &Error) -> Decision {
        self.emit(SyncEvent::ProcessorError(error.to_string()));
        let handler = self.inner.read().processor.clone();
        handler.map(|h| h(error)).unwrap_or(Decision::Retry)
    }

    /// Report a setup failure. Defaults to `Abort`.
    pub fn setup_error(&self, error: &Error) -> Decision {
        let handler = self.inner.read().setup.clone();
        handler.map(|h| h(error)).unwrap_or(Decision::Abort)
    }

    /// Report a rejected submission. Defaults to `Abort`.
    pub fn submission_error(&self, error: &Error) -> Decision {
        let handler = self.inner.read().submission.clone();
        handler.map(|h| h(error)).unwrap_or(Decision::Abort)
    }

    /// Report an unrecoverable failure
    pub fn critical_error(&self, error: &Error) {
        tracing::error!(event = "critical_error", error = %error, "Critical sync error");
        self.emit(SyncEvent::Critical(error.to_string()));
        let handler = self.inner.read().critical.clone();
        if let Some(h) = handler {
            h(error);
        }
    }

    /// Report a repaired reorg
    pub fn chain_error(&self, error_height: BlockHeight, rewind_height: BlockHeight) {
        self.emit(SyncEvent::ChainError {
            error_height,
            rewind_height,
        });
        let handler = self.inner.read().chain.clone();
        if let Some(h) = handler {
            h(error_height, rewind_height);
        }
    }
}

impl Default for Handlers {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}
