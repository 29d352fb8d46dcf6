use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwapError {
    /// Signing-session steps called out of order, or a session reused.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no output pays to tweaked key {key}")]
    OutputNotFound { key: String },

    #[error("insufficient funds: input of {input} sat cannot cover fee of {fee} sat")]
    InsufficientFunds { input: u64, fee: u64 },

    #[error("remote rejected: {0}")]
    RemoteRejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid swap tree: {0}")]
    InvalidSwapTree(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("confidential address required, got {0}")]
    Confidentiality(String),

    #[error("invalid fee rate: {0} sat/vbyte")]
    InvalidFeeRate(f64),

    #[error("fee search did not converge after {0} iterations")]
    FeeNotConverged(usize),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl SwapError {
    /// Only transport failures are worth another attempt with a fresh session.
    pub fn is_transient(&self) -> bool {
        matches!(self, SwapError::Transport(_))
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        SwapError::ProtocolViolation(msg.into())
    }
}

impl From<reqwest::Error> for SwapError {
    fn from(err: reqwest::Error) -> Self {
        SwapError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SwapError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SwapError::Transport(err.to_string())
    }
}

impl From<hex::FromHexError> for SwapError {
    fn from(err: hex::FromHexError) -> Self {
        SwapError::Encoding(err.to_string())
    }
}

impl From<serde_json::Error> for SwapError {
    fn from(err: serde_json::Error) -> Self {
        SwapError::Encoding(err.to_string())
    }
}
