use {roost_protocol::error_codes, thiserror::Error};

/// Everything that can go wrong while handling a client's frame or running
/// the hub. Session-recoverable kinds map to stable wire codes; the rest
/// never leave the process as frames.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("user {user_id} has not joined channel {channel_id}")]
    NotInChannel {
        user_id: String,
        channel_id: String,
    },

    #[error("permission denied for channel {channel_id}")]
    PermissionDenied { channel_id: String },

    #[error("permission check failed: {0}")]
    PermissionCheck(String),

    #[error("rate limited")]
    RateLimited,

    #[error("rate limit check failed: {0}")]
    RateLimitCheck(String),

    #[error("store failure: {0}")]
    Store(String),

    #[error("bus failure: {0}")]
    Bus(String),

    #[error("session closed")]
    SessionClosed,

    #[error("outbound queue full")]
    QueueFull,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl HubError {
    /// The stable `error {code}` reported back to the client, where one
    /// exists. Terminal and internal kinds have none; the session is torn
    /// down or the error stays server-side.
    #[must_use]
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::InvalidFrame(_) => Some(error_codes::INVALID_MESSAGE),
            Self::UnknownType(_) => Some(error_codes::UNKNOWN_MESSAGE_TYPE),
            Self::NotInChannel { .. } => Some(error_codes::NOT_IN_CHANNEL),
            Self::PermissionDenied { .. } => Some(error_codes::PERMISSION_DENIED),
            Self::PermissionCheck(_) => Some(error_codes::PERMISSION_ERROR),
            Self::RateLimited => Some(error_codes::RATE_LIMITED),
            Self::RateLimitCheck(_) => Some(error_codes::RATE_LIMIT_ERROR),
            Self::Store(_) => Some(error_codes::ERROR),
            Self::Bus(_) => Some(error_codes::PUBLISH_FAILED),
            Self::SessionClosed
            | Self::QueueFull
            | Self::Timeout(_)
            | Self::Internal(_) => None,
        }
    }
}

impl roost_common::FromMessage for HubError {
    fn from_message(message: String) -> Self {
        Self::Internal(message)
    }
}

pub type Error = HubError;
pub type Result<T> = std::result::Result<T, HubError>;
