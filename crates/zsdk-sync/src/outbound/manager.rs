//! Outbound transaction manager
//!
//! Owns the lifecycle of spends and shielding transactions: persistence,
//! construction through the wallet data store, submission to the light
//! server and per-pass reconciliation against the scanned chain.

use super::ledger::PendingTransactionLedger;
use super::pending::{PendingState, PendingTransaction, Recipient, ERROR_ENCODING, ERROR_SUBMITTING};
use crate::backend::{EncodedTransaction, RemoteChainService, WalletDataStore};
use crate::{Error, Result};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zsdk_params::{BlockHeight, ConsensusParams, Zatoshi};

/// Outbound policy
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    /// Blocks past expiry before an unmined row is removed
    pub expiry_grace: u32,
    /// Age after which mined rows may be discarded
    pub discard_after_mined: Duration,
    /// Age after which rows that failed encoding (or were cancelled) may be discarded
    pub discard_after_failed_encoding: Duration,
    /// Age after which rows that failed submission may be discarded
    pub discard_after_failed_submit: Duration,
    /// Re-submissions allowed when the submission handler asks to retry
    pub max_submit_retries: u32,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            expiry_grace: 20,
            discard_after_mined: Duration::from_secs(30 * 60),
            discard_after_failed_encoding: Duration::from_secs(30 * 60),
            discard_after_failed_submit: Duration::from_secs(30 * 24 * 60 * 60),
            max_submit_retries: 3,
        }
    }
}

/// What one reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rows stamped with a mined height
    pub mined: Vec<i64>,
    /// Rows stripped and marked for deletion
    pub marked: Vec<i64>,
    /// Rows deleted
    pub removed: Vec<i64>,
}

type SharedLedger = Arc<Mutex<Arc<dyn PendingTransactionLedger>>>;

/// Drives pending transactions from creation to mined (or discarded).
pub struct OutboundTransactionManager {
    params: ConsensusParams,
    config: OutboundConfig,
    ledger: SharedLedger,
    store: Arc<dyn WalletDataStore>,
    remote: Arc<dyn RemoteChainService>,
    in_flight: parking_lot::Mutex<HashSet<i64>>,
}

impl OutboundTransactionManager {
    /// Create a manager over `ledger`
    pub fn new(
        params: ConsensusParams,
        config: OutboundConfig,
        ledger: Arc<dyn PendingTransactionLedger>,
        store: Arc<dyn WalletDataStore>,
        remote: Arc<dyn RemoteChainService>,
    ) -> Self {
        Self {
            params,
            config,
            ledger: Arc::new(Mutex::new(ledger)),
            store,
            remote,
            in_flight: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// Outbound policy
    pub fn config(&self) -> &OutboundConfig {
        &self.config
    }

    /// Persist a new spend. Fails without touching the ledger if the
    /// amount is out of range or the recipient is empty.
    pub async fn init_spend(
        &self,
        value: i64,
        to_address: &str,
        memo: &[u8],
        account: u32,
    ) -> Result<PendingTransaction> {
        let value = Zatoshi::new(value, &self.params).map_err(|_| Error::InvalidAmount(value))?;
        let to_address = to_address.trim();
        if to_address.is_empty() {
            return Err(Error::InvalidRecipient("empty address".to_string()));
        }

        let row = PendingTransaction::new(
            value,
            Recipient::Address(to_address.to_string()),
            memo.to_vec(),
            account,
        );
        let row = self.ledger.lock().await.insert(row).await?;
        info!(
            event = "pending_created",
            id = row.id,
            value = %row.value,
            account,
            "Created pending spend"
        );
        Ok(row)
    }

    /// Persist a new shielding transaction into `account`
    pub async fn init_shield(&self, memo: &[u8], account: u32) -> Result<PendingTransaction> {
        let row = PendingTransaction::new(
            Zatoshi::ZERO,
            Recipient::SelfAccount(account),
            memo.to_vec(),
            account,
        );
        let row = self.ledger.lock().await.insert(row).await?;
        info!(event = "pending_created", id = row.id, account, "Created pending shielding");
        Ok(row)
    }

    /// Build the transaction for `tx`. Encoding is attempted once; a
    /// failure is recorded on the row and is terminal.
    pub async fn encode(
        &self,
        spending_key: &str,
        tx: &PendingTransaction,
    ) -> Result<PendingTransaction> {
        let row = {
            let ledger = self.ledger.lock().await;
            let mut row = ledger
                .find(tx.id)
                .await?
                .ok_or(Error::TransactionNotFound(tx.id))?;
            match row.state() {
                PendingState::Created => {}
                PendingState::Cancelled => return Ok(row),
                other => {
                    return Err(Error::InvalidState(format!(
                        "transaction {} cannot be encoded in state {:?}",
                        row.id, other
                    )))
                }
            }
            row.encode_attempts += 1;
            ledger.update(&row).await?;
            row
        };

        let built = self.build(spending_key, &row).await;

        let ledger = self.ledger.lock().await;
        let mut current = ledger
            .find(row.id)
            .await?
            .ok_or(Error::TransactionNotFound(row.id))?;
        if current.cancelled {
            debug!("Transaction {} cancelled while encoding", row.id);
            return Ok(current);
        }
        match built {
            Ok(encoded) => {
                info!(
                    event = "pending_encoded",
                    id = current.id,
                    txid = %hex::encode(&encoded.txid),
                    "Encoded pending transaction"
                );
                current.raw = Some(encoded.raw);
                current.txid = Some(encoded.txid);
                current.expiry_height = encoded.expiry_height;
                current.error_code = None;
                current.error_message = None;
            }
            Err(e) => {
                warn!(event = "pending_encode_failed", id = current.id, error = %e, "Encoding failed");
                current.error_code = Some(ERROR_ENCODING);
                current.error_message = Some(e.to_string());
            }
        }
        ledger.update(&current).await?;
        Ok(current)
    }

    async fn build(&self, spending_key: &str, row: &PendingTransaction) -> Result<EncodedTransaction> {
        let tx_row = match &row.recipient {
            Recipient::Address(to) => {
                self.store
                    .create_spend(row.account, spending_key, to, row.value, &row.memo)
                    .await?
            }
            Recipient::SelfAccount(account) => {
                self.store
                    .create_shielding(*account, spending_key, &row.memo)
                    .await?
            }
        };
        self.store.encoded_transaction(tx_row).await
    }

    /// Hand the encoded transaction to the light server.
    ///
    /// The row is reloaded first; rows that failed encoding, were cancelled or
    /// carry no raw bytes are returned untouched. Otherwise the outcome is
    /// recorded and the attempt counter bumped whether or not the server
    /// accepted it. Once accepted, a row stays accepted; later rejections only
    /// update the error fields. The ledger is not locked during the network call.
    pub async fn submit(&self, tx: &PendingTransaction) -> Result<PendingTransaction> {
        let (raw, _in_flight) = {
            let ledger = self.ledger.lock().await;
            let row = ledger
                .find(tx.id)
                .await?
                .ok_or(Error::TransactionNotFound(tx.id))?;

            match row.state() {
                PendingState::FailedEncoding | PendingState::Cancelled => {
                    debug!("Skipping submit of {} in state {:?}", row.id, row.state());
                    return Ok(row);
                }
                _ => {}
            }
            let Some(raw) = row.raw.clone() else {
                debug!("Skipping submit of {}: not encoded", row.id);
                return Ok(row);
            };
            (raw, InFlight::enter(&self.in_flight, row.id))
        };

        let outcome = self.remote.submit(&raw).await;

        let ledger = self.ledger.lock().await;
        let mut row = ledger
            .find(tx.id)
            .await?
            .ok_or(Error::TransactionNotFound(tx.id))?;
        match outcome {
            Ok(response) if response.is_success() => {
                row.accepted = true;
                row.error_code = None;
                row.error_message = None;
                info!(
                    event = "pending_submitted",
                    id = row.id,
                    code = response.code,
                    "Transaction accepted by server"
                );
            }
            Ok(response) => {
                warn!(
                    event = "pending_rejected",
                    id = row.id,
                    code = response.code,
                    message = %response.message,
                    accepted_before = row.accepted,
                    "Transaction rejected by server"
                );
                row.error_code = Some(response.code);
                row.error_message = Some(response.message);
            }
            Err(e) => {
                warn!(event = "pending_submit_failed", id = row.id, error = %e, "Submit call failed");
                row.error_code = Some(ERROR_SUBMITTING);
                row.error_message = Some(e.to_string());
            }
        }
        row.submit_attempts = row.submit_attempts.saturating_add(1);
        ledger.update(&row).await?;
        Ok(row)
    }

    /// Whether a submit call for `id` is in flight
    pub fn is_submitting(&self, id: i64) -> bool {
        self.in_flight.lock().contains(&id)
    }

    /// Load a row
    pub async fn find(&self, id: i64) -> Result<Option<PendingTransaction>> {
        self.ledger.lock().await.find(id).await
    }

    /// Live view of one row: the current value, then every change. Ends when
    /// the row is deleted. Restartable; each call starts from the current row.
    pub async fn monitor_by_id(&self, id: i64) -> Result<BoxStream<'static, PendingTransaction>> {
        let rx = self.ledger.lock().await.subscribe();
        let ledger = Arc::clone(&self.ledger);

        let stream = stream::unfold(
            (ledger, rx, None::<PendingTransaction>, true),
            move |(ledger, mut rx, last, first)| async move {
                loop {
                    if !first || last.is_some() {
                        rx.changed().await.ok()?;
                    }
                    rx.borrow_and_update();
                    let row = {
                        let guard = ledger.lock().await;
                        guard.find(id).await.ok()?
                    };
                    let row = row?;
                    if last.as_ref() != Some(&row) {
                        return Some((row.clone(), (ledger, rx, Some(row), false)));
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    /// Snapshot of every row
    pub async fn all(&self) -> Result<Vec<PendingTransaction>> {
        self.ledger.lock().await.all().await
    }

    /// Live view of all rows, re-emitted on every ledger change
    pub async fn get_all(&self) -> Result<BoxStream<'static, Vec<PendingTransaction>>> {
        let rx = self.ledger.lock().await.subscribe();
        let ledger = Arc::clone(&self.ledger);

        let stream = stream::unfold((ledger, rx, true), |(ledger, mut rx, first)| async move {
            if !first {
                rx.changed().await.ok()?;
            }
            rx.borrow_and_update();
            let rows = {
                let guard = ledger.lock().await;
                guard.all().await.ok()?
            };
            Some((rows, (ledger, rx, false)))
        });
        Ok(stream.boxed())
    }

    /// Cancel a row that has not been accepted by the server yet.
    /// Returns `false` when it is too late, including while a submission
    /// of the row is in flight.
    pub async fn cancel(&self, id: i64) -> Result<bool> {
        let ledger = self.ledger.lock().await;
        let mut row = ledger.find(id).await?.ok_or(Error::TransactionNotFound(id))?;
        if row.accepted || row.mined_height.is_some() {
            info!("Refusing to cancel submitted transaction {}", id);
            return Ok(false);
        }
        if self.is_submitting(id) {
            info!("Refusing to cancel transaction {} while it is being submitted", id);
            return Ok(false);
        }
        match row.state() {
            PendingState::Cancelled => Ok(true),
            _ => {
                row.cancelled = true;
                ledger.update(&row).await?;
                info!(event = "pending_cancelled", id, "Cancelled pending transaction");
                Ok(true)
            }
        }
    }

    /// Delete a row unconditionally
    pub async fn abort(&self, tx: &PendingTransaction) -> Result<bool> {
        let removed = self.ledger.lock().await.delete(tx.id).await?;
        if removed {
            info!(event = "pending_aborted", id = tx.id, "Deleted pending transaction");
        }
        Ok(removed)
    }

    /// Strip a row's raw bytes and txid and flag it; the next reconciliation deletes it
    pub async fn mark_for_deletion(&self, id: i64) -> Result<()> {
        let ledger = self.ledger.lock().await;
        let mut row = ledger.find(id).await?.ok_or(Error::TransactionNotFound(id))?;
        row.strip_identity();
        ledger.update(&row).await
    }

    /// Reconcile the ledger against the wallet scanned up to `last_scanned`
    pub async fn reconcile(&self, last_scanned: BlockHeight) -> Result<ReconcileReport> {
        self.reconcile_at(last_scanned, chrono::Utc::now().timestamp_millis())
            .await
    }

    /// [`reconcile`](Self::reconcile) with an explicit clock (Unix millis)
    pub async fn reconcile_at(
        &self,
        last_scanned: BlockHeight,
        now_ms: i64,
    ) -> Result<ReconcileReport> {
        let ledger = self.ledger.lock().await;
        let mut report = ReconcileReport::default();
        let rows = ledger.all().await?;

        let mut survivors = Vec::with_capacity(rows.len());
        for mut row in rows {
            if awaiting_mined_height(&row) {
                if let Some(txid) = row.txid.clone() {
                    if let Some(height) = self.store.mined_height(&txid).await? {
                        row.mined_height = Some(height);
                        ledger.update(&row).await?;
                        report.mined.push(row.id);
                        info!(event = "pending_mined", id = row.id, height = %height, "Transaction mined");
                    }
                }
            }

            if row.marked_for_deletion || self.is_long_expired(&row, last_scanned) {
                if !row.marked_for_deletion {
                    row.strip_identity();
                    ledger.update(&row).await?;
                }
                if ledger.delete(row.id).await? {
                    report.removed.push(row.id);
                    debug!("Removed pending transaction {}", row.id);
                }
                continue;
            }
            survivors.push(row);
        }

        for mut row in survivors {
            if self.is_safe_to_discard(&row, now_ms) {
                row.strip_identity();
                ledger.update(&row).await?;
                report.marked.push(row.id);
                debug!("Marked pending transaction {} for deletion", row.id);
            }
        }

        if report != ReconcileReport::default() {
            info!(
                event = "pending_reconciled",
                mined = report.mined.len(),
                marked = report.marked.len(),
                removed = report.removed.len(),
                last_scanned = %last_scanned,
                "Reconciled pending transactions"
            );
        }
        Ok(report)
    }

    fn is_long_expired(&self, row: &PendingTransaction, last_scanned: BlockHeight) -> bool {
        match (row.expiry_height, row.mined_height) {
            (Some(expiry), None) => {
                u64::from(last_scanned.value())
                    > u64::from(expiry.value()) + u64::from(self.config.expiry_grace)
            }
            _ => false,
        }
    }

    fn is_safe_to_discard(&self, row: &PendingTransaction, now_ms: i64) -> bool {
        let age = Duration::from_millis(now_ms.saturating_sub(row.create_time).max(0) as u64);
        match row.state() {
            PendingState::Mined => age > self.config.discard_after_mined,
            PendingState::FailedEncoding | PendingState::Cancelled => {
                age > self.config.discard_after_failed_encoding
            }
            PendingState::FailedSubmit => age > self.config.discard_after_failed_submit,
            _ => false,
        }
    }
}

fn awaiting_mined_height(row: &PendingTransaction) -> bool {
    row.accepted && row.mined_height.is_none() && !row.marked_for_deletion && row.txid.is_some()
}

/// Marks a row as being submitted until dropped
struct InFlight<'a> {
    ids: &'a parking_lot::Mutex<HashSet<i64>>,
    id: i64,
}

impl<'a> InFlight<'a> {
    fn enter(ids: &'a parking_lot::Mutex<HashSet<i64>>, id: i64) -> Self {
        ids.lock().insert(id);
        Self { ids, id }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.ids.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OutboundConfig::default();
        assert_eq!(config.expiry_grace, 20);
        assert_eq!(config.discard_after_mined, Duration::from_secs(1800));
        assert_eq!(config.discard_after_failed_submit.as_secs(), 30 * 86_400);
    }

    #[test]
    fn test_awaiting_mined_height() {
        let mut row = PendingTransaction::new(
            Zatoshi::ZERO,
            Recipient::Address("zs1x".into()),
            Vec::new(),
            0,
        );
        assert!(!awaiting_mined_height(&row));
        row.raw = Some(vec![1]);
        row.txid = Some(vec![2]);
        row.submit_attempts = 1;
        row.error_code = Some(-26);
        assert!(!awaiting_mined_height(&row));
        row.accepted = true;
        assert!(awaiting_mined_height(&row));
        row.marked_for_deletion = true;
        assert!(!awaiting_mined_height(&row));
    }
}
