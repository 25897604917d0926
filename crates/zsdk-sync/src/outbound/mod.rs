//! Outbound transactions: pending rows, their ledger and the manager that
//! moves them through encoding, submission and reconciliation.

pub mod ledger;
pub mod manager;
pub mod pending;

pub use ledger::{PendingTransactionLedger, SqlitePendingLedger};
pub use manager::{OutboundConfig, OutboundTransactionManager, ReconcileReport};
pub use pending::{PendingState, PendingTransaction, Recipient, ERROR_ENCODING, ERROR_SUBMITTING};
