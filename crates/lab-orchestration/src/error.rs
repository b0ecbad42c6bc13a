//! Error types for lab orchestration

use std::fmt;
use thiserror::Error;

/// Lab orchestration error type
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request or policy violation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown event, lab or exercise tag
    #[error("{kind} not found: {tag}")]
    NotFound {
        /// What was looked up ("environment", "lab", "exercise")
        kind: &'static str,
        /// The tag that did not resolve
        tag: String,
    },

    /// A bounded resource is used up
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Duplicate tag or already issued resource
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Infrastructure collaborator failure
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// One or more exercises failed to start
    #[error("Failed to start exercises: {0}")]
    ExerciseStart(Failures),

    /// Some lab resources could not be torn down
    #[error("Lab teardown incomplete: {0}")]
    Teardown(Failures),

    /// Snapshot could not be saved or loaded
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Network resource error
    #[error("Network error: {0}")]
    Network(#[from] range_network::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("YAML configuration error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Sled database error
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error classes reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request or policy violation
    Validation,
    /// Unresolved tag
    NotFound,
    /// Pool or queue empty/full
    ResourceExhausted,
    /// Duplicate tag or rule already issued
    Conflict,
    /// Collaborator create/start/close failure
    Infrastructure,
    /// Snapshot save or load failure
    Persistence,
}

impl Error {
    /// Shorthand for [`Error::NotFound`]
    pub fn not_found(kind: &'static str, tag: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            tag: tag.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        use range_network::Error as NetError;

        match self {
            Error::Validation(_) | Error::Yaml(_) => ErrorKind::Validation,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Infrastructure(_) | Error::ExerciseStart(_) | Error::Teardown(_) => {
                ErrorKind::Infrastructure
            }
            Error::Persistence(_) | Error::Io(_) | Error::Json(_) | Error::Sled(_) => {
                ErrorKind::Persistence
            }
            Error::Network(e) => match e {
                NetError::AddressPoolExhausted(_) | NetError::SubnetExhausted(_) => {
                    ErrorKind::ResourceExhausted
                }
                NetError::AddressInUse { .. } | NetError::RuleAlreadyIssued(_) => {
                    ErrorKind::Conflict
                }
                NetError::RuleNotFound(_) => ErrorKind::NotFound,
                NetError::AddressNotInRange { .. } | NetError::InvalidConfig(_) => {
                    ErrorKind::Validation
                }
                NetError::Firewall(_) | NetError::Gateway(_) => ErrorKind::Infrastructure,
            },
        }
    }
}

/// Per-item failures collected from operations that keep going after an error
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Failures(Vec<(String, String)>);

impl Failures {
    /// Create an empty failure list
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for a tag
    pub fn push(&mut self, tag: impl Into<String>, error: impl fmt::Display) {
        self.0.push((tag.into(), error.to_string()));
    }

    /// Whether nothing failed
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of failures
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Tags that failed, in the order they were recorded
    pub fn tags(&self) -> Vec<&str> {
        self.0.iter().map(|(tag, _)| tag.as_str()).collect()
    }

    /// Iterate over `(tag, message)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(tag, msg)| (tag.as_str(), msg.as_str()))
    }

    /// Merge another failure list into this one
    pub fn extend(&mut self, other: Failures) {
        self.0.extend(other.0);
    }
}

impl fmt::Display for Failures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(tag, msg)| format!("{} ({})", tag, msg))
            .collect();
        f.write_str(&parts.join(", "))
    }
}
