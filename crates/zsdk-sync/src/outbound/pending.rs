//! Pending outbound transaction rows and their derived lifecycle state.

use serde::{Deserialize, Serialize};
use zsdk_params::{BlockHeight, Zatoshi};

/// Error code recorded when transaction construction fails
pub const ERROR_ENCODING: i32 = -1000;
/// Error code recorded when the submit call itself fails
pub const ERROR_SUBMITTING: i32 = -2000;

/// Where the funds go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    /// External address
    Address(String),
    /// Shielding into one of our own accounts
    SelfAccount(u32),
}

/// Lifecycle state, derived from the row's fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingState {
    /// Persisted, not yet encoded
    Created,
    /// Encoding in progress
    Encoding,
    /// Raw bytes and txid present, not yet submitted
    Encoded,
    /// Construction failed; terminal
    FailedEncoding,
    /// Server accepted the transaction
    SubmitSuccess,
    /// Server rejected the transaction or the call failed
    FailedSubmit,
    /// Seen in a scanned block
    Mined,
    /// Expiry height passed without being mined
    Expired,
    /// Cancelled before submission
    Cancelled,
    /// Identity stripped, awaiting deletion
    SafeToDiscard,
}

impl PendingState {
    /// Whether no further transition will happen without user action
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::FailedEncoding
                | Self::FailedSubmit
                | Self::Mined
                | Self::Expired
                | Self::Cancelled
                | Self::SafeToDiscard
        )
    }
}

/// An outbound transaction tracked by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    /// Ledger id (0 until inserted)
    pub id: i64,
    /// Amount sent
    pub value: Zatoshi,
    /// Recipient
    pub recipient: Recipient,
    /// Memo bytes
    pub memo: Vec<u8>,
    /// Spending account
    pub account: u32,
    /// Serialized transaction
    pub raw: Option<Vec<u8>>,
    /// Transaction id
    pub txid: Option<Vec<u8>>,
    /// Expiry height
    pub expiry_height: Option<BlockHeight>,
    /// Height mined at
    pub mined_height: Option<BlockHeight>,
    /// Encode attempts
    pub encode_attempts: u32,
    /// Submit attempts
    pub submit_attempts: u32,
    /// Accepted by the server at least once; never reset
    pub accepted: bool,
    /// Last error code
    pub error_code: Option<i32>,
    /// Last error message
    pub error_message: Option<String>,
    /// Cancelled by the user
    pub cancelled: bool,
    /// Creation time (Unix epoch millis)
    pub create_time: i64,
    /// Identity stripped, first phase of deletion done
    pub marked_for_deletion: bool,
}

impl PendingTransaction {
    /// New row in the `Created` state
    pub fn new(value: Zatoshi, recipient: Recipient, memo: Vec<u8>, account: u32) -> Self {
        Self {
            id: 0,
            value,
            recipient,
            memo,
            account,
            raw: None,
            txid: None,
            expiry_height: None,
            mined_height: None,
            encode_attempts: 0,
            submit_attempts: 0,
            accepted: false,
            error_code: None,
            error_message: None,
            cancelled: false,
            create_time: chrono::Utc::now().timestamp_millis(),
            marked_for_deletion: false,
        }
    }

    /// Whether this row shields funds into our own account
    pub fn is_shielding(&self) -> bool {
        matches!(self.recipient, Recipient::SelfAccount(_))
    }

    /// Lifecycle state without expiry information
    pub fn state(&self) -> PendingState {
        self.state_at(None)
    }

    /// Lifecycle state given the wallet's last scanned height
    pub fn state_at(&self, last_scanned: Option<BlockHeight>) -> PendingState {
        if self.cancelled {
            return PendingState::Cancelled;
        }
        if self.marked_for_deletion {
            return PendingState::SafeToDiscard;
        }
        if self.mined_height.is_some() {
            return PendingState::Mined;
        }
        if self.is_expired(last_scanned) {
            return PendingState::Expired;
        }
        if self.error_code == Some(ERROR_ENCODING) {
            return PendingState::FailedEncoding;
        }
        if self.raw.is_none() {
            return if self.encode_attempts > 0 {
                PendingState::Encoding
            } else {
                PendingState::Created
            };
        }
        if self.submit_attempts == 0 {
            return PendingState::Encoded;
        }
        if self.accepted {
            PendingState::SubmitSuccess
        } else {
            PendingState::FailedSubmit
        }
    }

    /// Unmined and past its expiry height
    pub fn is_expired(&self, last_scanned: Option<BlockHeight>) -> bool {
        match (self.expiry_height, self.mined_height, last_scanned) {
            (Some(expiry), None, Some(last)) => last > expiry,
            _ => false,
        }
    }

    /// Clear raw bytes and txid and flag for deletion
    pub fn strip_identity(&mut self) {
        self.raw = None;
        self.txid = None;
        self.marked_for_deletion = true;
    }
}
