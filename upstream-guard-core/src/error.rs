use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use validator::ValidationErrors;

/// Transport-level failure kinds an upstream call can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    ConnectionAborted,
    Dns,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::ConnectionReset => "connection_reset",
            TransportErrorKind::ConnectionRefused => "connection_refused",
            TransportErrorKind::ConnectionAborted => "connection_aborted",
            TransportErrorKind::Dns => "dns",
            TransportErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Error reported by an upstream fetcher for a single attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("upstream returned status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("upstream error: {0}")]
    Other(String),
}

impl FetchError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        FetchError::Status {
            code,
            message: message.into(),
        }
    }

    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        FetchError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Whether the upstream signalled "too many requests".
    pub fn is_throttled(&self) -> bool {
        matches!(self, FetchError::Status { code: 429, .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            FetchError::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Stage at which a bounded wait elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStage {
    /// Waiting in the admission queue for a concurrency slot.
    Queue,
    /// A single upstream attempt.
    Attempt,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutStage::Queue => write!(f, "queue wait"),
            TimeoutStage::Attempt => write!(f, "upstream attempt"),
        }
    }
}

/// Errors surfaced to pipeline callers.
///
/// `Clone` so a single coalesced fetch can report the same outcome to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Rate limit exceeded for {key}. Retry after {retry_after_ms}ms")]
    RateLimitExceeded { key: String, retry_after_ms: u64 },

    #[error("Circuit breaker is open for {key}")]
    CircuitOpen { key: String, retry_after_ms: u64 },

    #[error("{stage} timed out after {elapsed_ms}ms")]
    Timeout { stage: TimeoutStage, elapsed_ms: u64 },

    #[error("Upstream failed after {attempts} attempt(s): {source}")]
    Upstream { source: FetchError, attempts: u32 },

    #[error("Data quality below floor for {key}: score {score} < {floor}")]
    DataQuality { key: String, score: u8, floor: u8 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether a caller may reasonably try again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::RateLimitExceeded { .. }
                | PipelineError::CircuitOpen { .. }
                | PipelineError::Timeout { .. }
                | PipelineError::Upstream { .. }
        )
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            PipelineError::CircuitOpen { .. } => "circuit_open",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Upstream { .. } => "upstream",
            PipelineError::DataQuality { .. } => "data_quality",
            PipelineError::InvalidRequest(_) => "invalid_request",
            PipelineError::Config(_) => "config",
        }
    }
}

/// Configuration rejected at construction time.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ValidationErrors> for ConfigError {
    fn from(errors: ValidationErrors) -> Self {
        ConfigError::Invalid(errors.to_string())
    }
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
