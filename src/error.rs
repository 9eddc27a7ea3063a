//! Error types shared across the profiler.
//!
//! Anything that can reach the person running the profiler is a
//! [`ReportableError`]: it carries a short message meant for them and a
//! technical detail string meant for the logs. Failures at the seams to
//! external collaborators (sample sources, collectors) travel as
//! `anyhow::Error` and get wrapped when they cross into user-facing code.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// An error with a user-facing message and a separate technical cause.
#[derive(Debug, Error)]
pub struct ReportableError {
    user_message: String,
    detail: String,
    #[source]
    cause: Option<BoxError>,
}

impl ReportableError {
    pub fn new(user_message: impl Into<String>) -> Self {
        let user_message = user_message.into();
        Self {
            detail: user_message.clone(),
            user_message,
            cause: None,
        }
    }

    pub fn with_detail(user_message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            detail: detail.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// What the person running the profiler should be told.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Technical context for diagnosis (endpoint, truncated response, ...).
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for ReportableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message)
    }
}

/// Failures that prevent a session from being created or driven.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("profiling is not supported on {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },
    #[error("sample source unavailable: {0}")]
    MissingCapability(String),
    #[error("failed to register the profiling session: {0}")]
    Handshake(#[from] ReportableError),
    #[error("failed to spawn the scheduler thread")]
    Scheduler(#[source] std::io::Error),
    #[error("this session has already been started")]
    AlreadyStarted,
    #[error("this session is not running")]
    NotRunning,
}

impl InitError {
    /// Short message for the user, without the technical chain.
    pub fn user_message(&self) -> String {
        match self {
            InitError::Handshake(err) => err.user_message().to_string(),
            other => other.to_string(),
        }
    }
}

/// Errors raised while turning frames into dictionary entries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DictionaryError {
    #[error("malformed signature {signature:?}: {reason}")]
    MalformedSignature { signature: String, reason: String },
}

/// Errors raised while producing an upload payload.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Dictionary(#[from] DictionaryError),
    #[error("failed to write protobuf message")]
    Wire(#[from] protobuf::Error),
    #[error("failed to compress payload")]
    Compress(#[from] std::io::Error),
}

/// Errors raised by call tree operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallTreeError {
    #[error("cannot merge a node for {found} into a node for {expected}")]
    FrameMismatch { expected: String, found: String },
}
