use axum::http::StatusCode;

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Failures raised by the adapter layer.
///
/// Every variant is cheap to clone so a single token fetch can hand the same
/// failure to all of its waiters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// Missing or incomplete account credentials.
    #[error("{channel} configuration error: {message}")]
    Configuration { channel: String, message: String },

    /// Webhook signature did not verify.
    #[error("signature verification failed: {reason}")]
    Signature { reason: String },

    /// Malformed base64 or otherwise undecodable input.
    #[error("decode failed: {0}")]
    Decode(String),

    /// AES key has the wrong length or shape.
    #[error("invalid key: {0}")]
    Key(String),

    /// Cipher-level failure (bad block alignment, bad padding).
    #[error("decrypt failed: {0}")]
    Decrypt(String),

    /// Decrypted payload is structurally broken or addressed to another tenant.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("{platform} api error {code}: {message}")]
    VendorApi {
        platform: String,
        code: i64,
        message: String,
    },

    #[error("{platform} transport error: {message}")]
    Transport { platform: String, message: String },

    /// The application's message or event callback failed.
    #[error("callback failed: {0}")]
    Callback(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

impl ChannelError {
    pub fn configuration(channel: &str, message: impl Into<String>) -> Self {
        Self::Configuration {
            channel: channel.to_string(),
            message: message.into(),
        }
    }

    pub fn signature(reason: impl Into<String>) -> Self {
        Self::Signature {
            reason: reason.into(),
        }
    }

    pub fn vendor(platform: &str, code: i64, message: impl Into<String>) -> Self {
        Self::VendorApi {
            platform: platform.to_string(),
            code,
            message: message.into(),
        }
    }

    pub fn transport(platform: &str, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            platform: platform.to_string(),
            message: err.to_string(),
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Signature { .. } => "SIGNATURE_INVALID",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Key(_) => "KEY_ERROR",
            Self::Decrypt(_) => "DECRYPT_ERROR",
            Self::Integrity(_) => "INTEGRITY_ERROR",
            Self::VendorApi { .. } => "VENDOR_API_ERROR",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::Callback(_) => "CALLBACK_ERROR",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::UnknownChannel(_) => "UNKNOWN_CHANNEL",
        }
    }

    /// HTTP status used when the error terminates an inbound or API request.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Signature { .. } => StatusCode::FORBIDDEN,
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::UnknownChannel(_) => StatusCode::NOT_FOUND,
            Self::VendorApi { .. } | Self::Transport { .. } => StatusCode::BAD_GATEWAY,
            Self::Configuration { .. }
            | Self::Decode(_)
            | Self::Key(_)
            | Self::Decrypt(_)
            | Self::Integrity(_)
            | Self::Callback(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
