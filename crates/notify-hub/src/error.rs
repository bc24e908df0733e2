//! Crate-wide error types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::result::SendingResults;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
///
/// Errors are cloneable so that a per-target failure can be stored inside a
/// [`DeliveryResult`](crate::DeliveryResult) and copied across retry rounds.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("no targets specified")]
    NoTargets,

    #[error("platform already registered: {0}")]
    DuplicatePlatform(String),

    #[error("transport not found for platform: {0}")]
    PlatformNotFound(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("invalid target type: {0}")]
    InvalidTargetType(String),

    #[error("empty target value")]
    EmptyTargetValue,

    #[error("rate limited")]
    RateLimited,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled {
        /// Results accumulated before the cancellation was observed.
        partial: Option<Box<SendingResults>>,
    },

    #[error("hub already running")]
    AlreadyRunning,

    #[error("hub already stopping")]
    AlreadyStopping,

    #[error("hub is not running")]
    NotRunning,

    #[error("shutdown timeout after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("middleware {name} failed: {reason}")]
    Middleware { name: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Discriminant of [`Error`], used to classify failures without matching on payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidMessage,
    InvalidTarget,
    NoTargets,
    DuplicatePlatform,
    PlatformNotFound,
    InvalidCredentials,
    InvalidTargetType,
    EmptyTargetValue,
    RateLimited,
    Transport,
    Timeout,
    Cancelled,
    AlreadyRunning,
    AlreadyStopping,
    NotRunning,
    ShutdownTimeout,
    Middleware,
    Configuration,
    Serialization,
}

impl Error {
    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }

    pub fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn middleware(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Middleware {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Cancellation without any partial results.
    pub fn cancelled() -> Self {
        Self::Cancelled { partial: None }
    }

    /// Cancellation carrying the results gathered so far.
    pub fn cancelled_with(partial: SendingResults) -> Self {
        Self::Cancelled {
            partial: Some(Box::new(partial)),
        }
    }

    /// Results accumulated before a cancellation, if any.
    pub fn partial_results(&self) -> Option<&SendingResults> {
        match self {
            Self::Cancelled { partial } => partial.as_deref(),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMessage(_) => ErrorKind::InvalidMessage,
            Self::InvalidTarget { .. } => ErrorKind::InvalidTarget,
            Self::NoTargets => ErrorKind::NoTargets,
            Self::DuplicatePlatform(_) => ErrorKind::DuplicatePlatform,
            Self::PlatformNotFound(_) => ErrorKind::PlatformNotFound,
            Self::InvalidCredentials(_) => ErrorKind::InvalidCredentials,
            Self::InvalidTargetType(_) => ErrorKind::InvalidTargetType,
            Self::EmptyTargetValue => ErrorKind::EmptyTargetValue,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::AlreadyRunning => ErrorKind::AlreadyRunning,
            Self::AlreadyStopping => ErrorKind::AlreadyStopping,
            Self::NotRunning => ErrorKind::NotRunning,
            Self::ShutdownTimeout(_) => ErrorKind::ShutdownTimeout,
            Self::Middleware { .. } => ErrorKind::Middleware,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
