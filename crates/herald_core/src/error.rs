use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::id::SourceType;

/// Configuration-specific errors
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for field {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Failures while talking to an upstream platform.
///
/// None of these are fatal: the poller that hit one backs off and retries
/// on its next cycle without touching any cursor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("{source_type} upstream unavailable: {reason}")]
    UpstreamUnavailable {
        source_type: SourceType,
        reason: String,
    },

    #[error("{source_type} credentials expired or rejected")]
    UpstreamAuthExpired { source_type: SourceType },

    #[error("{source_type} returned a malformed response: {reason}")]
    MalformedResponse {
        source_type: SourceType,
        reason: String,
    },

    #[error("{source_type} refused the request: {reason}")]
    UpstreamRejected {
        source_type: SourceType,
        reason: String,
    },
}

impl FetchError {
    pub fn unavailable(source_type: SourceType, reason: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            source_type,
            reason: reason.into(),
        }
    }

    pub fn malformed(source_type: SourceType, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            source_type,
            reason: reason.into(),
        }
    }

    pub fn rejected(source_type: SourceType, reason: impl Into<String>) -> Self {
        Self::UpstreamRejected {
            source_type,
            reason: reason.into(),
        }
    }

    pub fn timed_out(source_type: SourceType, after: Duration) -> Self {
        Self::UpstreamUnavailable {
            source_type,
            reason: format!("no response within {:?}", after),
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::UpstreamAuthExpired { .. })
    }
}

/// A single item in an otherwise valid response that could not be parsed.
/// The item is skipped; the rest of the batch still counts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed {source_type} item: {reason}")]
pub struct MalformedItem {
    pub source_type: SourceType,
    pub reason: String,
}

impl MalformedItem {
    pub fn new(source_type: SourceType, reason: impl Into<String>) -> Self {
        Self {
            source_type,
            reason: reason.into(),
        }
    }
}

/// Failures delivering one event to one subscriber.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("subscriber {subscriber} has no open persistent channel")]
    ChannelClosed { subscriber: String },

    #[error("HTTP delivery to {subscriber} at {address} failed")]
    Http {
        subscriber: String,
        address: String,
        #[source]
        cause: reqwest::Error,
    },

    #[error("subscriber {subscriber} at {address} answered with status {status}")]
    HttpStatus {
        subscriber: String,
        address: String,
        status: u16,
    },

    #[error("subscriber {0} is not registered")]
    UnknownSubscriber(String),
}

/// Rejections from the control plane. Every variant maps to the numeric
/// code that control clients receive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("invalid JSON parameters")]
    InvalidJson,

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("invalid uid")]
    InvalidEntityId,

    #[error("invalid type")]
    InvalidType,

    #[error("type is not enabled")]
    SourceDisabled,

    #[error("subtype is not enabled")]
    SubtypeDisabled,

    #[error("subscriber is not initialized")]
    SubscriberNotInitialized,

    #[error("uid is not subscribed")]
    NotSubscribed,

    #[error("failed to watch upstream entity: {reason}")]
    WatchFailed { reason: String },

    #[error("failed to persist state: {reason}")]
    Persistence { reason: String },

    #[error("invalid subscriber address: {0}")]
    InvalidAddress(String),

    #[error("connection already initialized")]
    DuplicateInit,

    #[error("client name is already connected")]
    NameInUse,

    #[error("connection is not initialized")]
    NotInitialized,

    #[error("illegal command")]
    IllegalCommand,

    #[error("base subscription missing for this uid")]
    BaseWatchMissing,
}

impl ControlError {
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidJson => -1,
            Self::MissingParameter(_) => 1,
            Self::InvalidEntityId => 2,
            Self::InvalidType => 3,
            Self::SourceDisabled => 4,
            Self::SubtypeDisabled => 5,
            Self::SubscriberNotInitialized => 6,
            Self::NotSubscribed => 7,
            Self::WatchFailed { .. } => 8,
            Self::Persistence { .. } => 9,
            Self::InvalidAddress(_) => 10,
            Self::DuplicateInit => 11,
            Self::NameInUse => 12,
            Self::NotInitialized => 13,
            Self::IllegalCommand => 14,
            Self::BaseWatchMissing => 15,
        }
    }
}

impl From<CoreError> for ControlError {
    fn from(err: CoreError) -> Self {
        Self::Persistence {
            reason: err.to_string(),
        }
    }
}

#[derive(Error, Diagnostic, Debug)]
pub enum CoreError {
    #[error("Configuration error for field '{field}'")]
    #[diagnostic(
        code(herald_core::configuration_error),
        help("Check configuration file at {config_path}\nExpected: {expected}")
    )]
    ConfigurationError {
        config_path: String,
        field: String,
        expected: String,
        #[source]
        cause: ConfigError,
    },

    #[error("IO error: {operation} failed")]
    #[diagnostic(
        code(herald_core::io_error),
        help("Check file permissions and disk space for {path}")
    )]
    IoError {
        operation: String,
        path: String,
        #[source]
        cause: std::io::Error,
    },

    #[error("Serialization error")]
    #[diagnostic(
        code(herald_core::serialization_error),
        help("Failed to serialize/deserialize {data_type}")
    )]
    SerializationError {
        data_type: String,
        #[source]
        cause: serde_json::Error,
    },

    #[error("Unknown source type: {name}")]
    #[diagnostic(
        code(herald_core::unknown_source_type),
        help("Known source types are weibo, bili_dyn and bili_live")
    )]
    UnknownSourceType { name: String },

    #[error("Upstream fetch failed")]
    #[diagnostic(
        code(herald_core::fetch_failed),
        help("The poller backs off and retries; check connectivity and the configured cookie")
    )]
    Fetch(#[from] FetchError),

    #[error("Event delivery failed")]
    #[diagnostic(code(herald_core::delivery_failed))]
    Delivery(#[from] DeliveryError),

    #[error("Control request rejected: {0}")]
    #[diagnostic(code(herald_core::control_rejected))]
    Control(#[from] ControlError),

    #[error("Event queue closed")]
    #[diagnostic(
        code(herald_core::queue_closed),
        help("The dispatcher has stopped, so new events cannot be delivered")
    )]
    QueueClosed,

    #[error("HTTP client setup failed")]
    #[diagnostic(code(herald_core::http_client))]
    HttpClient {
        #[source]
        cause: reqwest::Error,
    },
}

impl CoreError {
    pub fn io(operation: impl Into<String>, path: impl AsRef<std::path::Path>, cause: std::io::Error) -> Self {
        Self::IoError {
            operation: operation.into(),
            path: path.as_ref().display().to_string(),
            cause,
        }
    }

    pub fn serialization(data_type: impl Into<String>, cause: serde_json::Error) -> Self {
        Self::SerializationError {
            data_type: data_type.into(),
            cause,
        }
    }

    pub fn config(
        config_path: impl Into<String>,
        field: impl Into<String>,
        expected: impl Into<String>,
        cause: ConfigError,
    ) -> Self {
        Self::ConfigurationError {
            config_path: config_path.into(),
            field: field.into(),
            expected: expected.into(),
            cause,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
