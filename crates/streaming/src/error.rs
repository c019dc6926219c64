use crate::media::ContentType;

/// Broad classification used by recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    MediaAppend,
    Streaming,
    Player,
}

/// How an error is reported to the player interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Recoverable,
    Critical,
}

/// Errors produced by the streaming engine and its network layer.
///
/// Cloneable so one request outcome can be observed by both a prefetch cache
/// and the consumer that later claims it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamingError {
    #[error("request to {uri} failed with HTTP {status}")]
    BadHttpStatus { uri: String, status: u16 },

    #[error("HTTP request to {uri} failed: {reason}")]
    Http { uri: String, reason: String },

    #[error("request to {uri} timed out")]
    Timeout { uri: String },

    #[error("operation aborted")]
    OperationAborted,

    #[error("segment is marked as missing")]
    SegmentMissing,

    #[error("unsupported URI scheme `{scheme}`")]
    UnsupportedScheme { scheme: String },

    #[error("malformed URI `{uri}`: {reason}")]
    MalformedUri { uri: String, reason: String },

    #[error("{content_type} buffer is full")]
    QuotaExceeded { content_type: ContentType },

    #[error("media sink operation failed for {content_type}: {reason}")]
    MediaSourceOperationFailed {
        content_type: ContentType,
        reason: String,
    },

    #[error("failed to parse media segment: {reason}")]
    Mp4Parse { reason: String },

    #[error("segment decryption failed: {reason}")]
    Decryption { reason: String },

    #[error("streaming engine started without a variant")]
    StartupInvalidState,

    #[error("media sink is not accepting data")]
    StreamingNotAllowed,

    #[error("segment index could not be created: {reason}")]
    SegmentIndex { reason: String },

    #[error("retry attempts exhausted")]
    AttemptsExhausted,

    #[error("streaming engine was destroyed")]
    ObjectDestroyed,
}

impl StreamingError {
    pub fn http(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Http {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(uri: impl Into<String>) -> Self {
        Self::Timeout { uri: uri.into() }
    }

    pub fn malformed_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    pub fn sink(content_type: ContentType, reason: impl Into<String>) -> Self {
        Self::MediaSourceOperationFailed {
            content_type,
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BadHttpStatus { .. }
            | Self::Http { .. }
            | Self::Timeout { .. }
            | Self::OperationAborted
            | Self::SegmentMissing
            | Self::UnsupportedScheme { .. }
            | Self::MalformedUri { .. } => ErrorCategory::Network,
            Self::QuotaExceeded { .. }
            | Self::MediaSourceOperationFailed { .. }
            | Self::Mp4Parse { .. }
            | Self::Decryption { .. } => ErrorCategory::MediaAppend,
            Self::StartupInvalidState | Self::StreamingNotAllowed | Self::SegmentIndex { .. } => {
                ErrorCategory::Streaming
            }
            Self::AttemptsExhausted | Self::ObjectDestroyed => ErrorCategory::Player,
        }
    }

    /// Whether the network layer may retry the request that produced this error.
    ///
    /// Authorization failures and malformed requests will not get better by
    /// trying again.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BadHttpStatus { status, .. } => !matches!(status, 401 | 403),
            Self::Http { .. } | Self::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::OperationAborted)
    }
}
