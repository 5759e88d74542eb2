use crate::electrum::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid script: {0}")]
    InvalidScript(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("insufficient funds: have {available} sat, need {required} sat")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("input index {index} out of range (tx has {count} inputs)")]
    InputOutOfRange { index: usize, count: usize },

    #[error("key does not control input {0}")]
    KeyMismatch(usize),

    #[error("signature {signature} does not match the key order of the redeem script")]
    SignatureOrder { signature: usize },

    #[error("insufficient signatures: {valid} valid, {required} required")]
    InsufficientSignatures { valid: usize, required: usize },

    #[error("invalid transaction data: {0}")]
    InvalidTxData(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error {code}: {message}")]
    ServerError { code: i64, message: String },

    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("merkle proof unavailable at height {height}: {reason}")]
    ProofUnavailable { height: u32, reason: String },

    #[error("session is not ready (state: {0})")]
    NotReady(SessionState),

    #[error("session closed")]
    SessionClosed,

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Errors caused by the transport rather than by the request itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::SessionClosed | Self::Timeout(_) | Self::Io(_)
        )
    }
}
