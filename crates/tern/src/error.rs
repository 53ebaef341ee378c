use thiserror::Error;

/// Stable error categories shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Validation,
    Crypto,
    Network,
    Storage,
    Protocol,
    Configuration,
    Runtime,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Crypto => "crypto",
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Protocol => "protocol",
            Self::Configuration => "configuration",
            Self::Runtime => "runtime",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum Error {
    // Validation
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid event id: {0}")]
    InvalidEventId(String),
    #[error("invalid signature for event {event_id}")]
    InvalidSignature { event_id: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    // Crypto
    #[error("signing failed: {reason}")]
    SigningFailed { reason: String },
    #[error("verification failed: {reason}")]
    VerificationFailed { reason: String },
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },
    #[error("key derivation failed")]
    KeyDerivationFailed,

    // Network
    #[error("connection to {relay} failed: {reason}")]
    ConnectionFailed { relay: String, reason: String },
    #[error("connection to {relay} lost")]
    ConnectionLost { relay: String },
    #[error("not connected to {relay}")]
    NotConnected { relay: String },
    #[error("timed out after {after_ms}ms waiting on {relay}")]
    Timeout { relay: String, after_ms: u64 },
    #[error("server error from {relay}: {reason}")]
    ServerError { relay: String, reason: String },
    #[error("unauthorized by {relay}: {reason}")]
    Unauthorized { relay: String, reason: String },

    // Storage
    #[error("cache failed: {reason}")]
    CacheFailed { reason: String },
    #[error("disk full")]
    DiskFull,
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("corrupted data: {reason}")]
    CorruptedData { reason: String },

    // Protocol
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),
    #[error("subscription failed: {reason}")]
    SubscriptionFailed { reason: String },

    // Configuration
    #[error("not configured: {0}")]
    NotConfigured(&'static str),
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    // Runtime
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Unknown(String),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidPublicKey(_)
            | Self::InvalidPrivateKey
            | Self::InvalidEventId(_)
            | Self::InvalidSignature { .. }
            | Self::InvalidInput(_)
            | Self::InvalidFilter(_) => ErrorCategory::Validation,

            Self::SigningFailed { .. }
            | Self::VerificationFailed { .. }
            | Self::EncryptionFailed { .. }
            | Self::DecryptionFailed { .. }
            | Self::KeyDerivationFailed => ErrorCategory::Crypto,

            Self::ConnectionFailed { .. }
            | Self::ConnectionLost { .. }
            | Self::NotConnected { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::Unauthorized { .. } => ErrorCategory::Network,

            Self::CacheFailed { .. }
            | Self::DiskFull
            | Self::FileNotFound(_)
            | Self::CorruptedData { .. } => ErrorCategory::Storage,

            Self::InvalidMessage { .. }
            | Self::UnsupportedVersion(_)
            | Self::SubscriptionFailed { .. } => ErrorCategory::Protocol,

            Self::NotConfigured(_) | Self::InvalidConfiguration { .. } => {
                ErrorCategory::Configuration
            }

            Self::NotImplemented(_) | Self::Cancelled | Self::Unknown(_) => ErrorCategory::Runtime,
        }
    }

    /// Stable machine-readable code, unique within a category.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPublicKey(_) => "invalid_public_key",
            Self::InvalidPrivateKey => "invalid_private_key",
            Self::InvalidEventId(_) => "invalid_event_id",
            Self::InvalidSignature { .. } => "invalid_signature",
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidFilter(_) => "invalid_filter",
            Self::SigningFailed { .. } => "signing_failed",
            Self::VerificationFailed { .. } => "verification_failed",
            Self::EncryptionFailed { .. } => "encryption_failed",
            Self::DecryptionFailed { .. } => "decryption_failed",
            Self::KeyDerivationFailed => "key_derivation_failed",
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::NotConnected { .. } => "not_connected",
            Self::Timeout { .. } => "timeout",
            Self::ServerError { .. } => "server_error",
            Self::Unauthorized { .. } => "unauthorized",
            Self::CacheFailed { .. } => "cache_failed",
            Self::DiskFull => "disk_full",
            Self::FileNotFound(_) => "file_not_found",
            Self::CorruptedData { .. } => "corrupted_data",
            Self::InvalidMessage { .. } => "invalid_message",
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::SubscriptionFailed { .. } => "subscription_failed",
            Self::NotConfigured(_) => "not_configured",
            Self::InvalidConfiguration { .. } => "invalid_configuration",
            Self::NotImplemented(_) => "not_implemented",
            Self::Cancelled => "cancelled",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Retry policy hook: automatic retries are reserved for transient
    /// network failures. Everything else needs caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::ConnectionLost { .. } | Self::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidMessage {
            reason: e.to_string(),
        }
    }
}

impl From<hex::FromHexError> for Error {
    fn from(_e: hex::FromHexError) -> Self {
        Error::InvalidInput("hex decoding failed".to_owned())
    }
}
