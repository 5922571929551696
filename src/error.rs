use thiserror::Error;

/// Errors raised while building, publishing, and correlating zap events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZapError {
    /// Bad input fields. Events in this state never reach the network.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The local public key has not been derived yet.
    #[error("identity unavailable: public key not derived yet")]
    IdentityUnavailable,

    /// No relay accepted the event. Informational: the receipt may still arrive.
    #[error("publish failed on every relay: {0:?}")]
    PublishFailed(Vec<(String, String)>),

    #[error("invalid QR code")]
    InvalidQr,

    #[error("invalid LNURL: {0}")]
    InvalidLnurl(String),

    #[error("network error: {0}")]
    Network(String),

    /// A delivered event failed the id or signature check.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// A relay answered `OK false`.
    #[error("relay rejected event: {0}")]
    Rejected(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("order incomplete: {0}")]
    OrderIncomplete(&'static str),
}

impl ZapError {
    /// Recoverable failures the point-of-sale screen should show to the user.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            ZapError::InvalidQr | ZapError::InvalidLnurl(_) | ZapError::Network(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ZapError>;
