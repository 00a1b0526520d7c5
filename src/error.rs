//! Error taxonomy for skillforge.
//!
//! Fatal, run-level errors are [`IndexerError`]. Errors raised while a
//! single item moves through a stage are [`StageError`]; the engine decides
//! from the variant whether to retry, record, or abort. Tracker backends
//! report [`TrackerError`].

use std::fmt;

use thiserror::Error;

use crate::engine::RunReport;

/// Result alias used by run-level operations.
pub type Result<T> = std::result::Result<T, IndexerError>;

/// Process exit codes used by the `skillforge` binary.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const ITEM_FAILURES: i32 = 1;
    pub const FATAL: i32 = 2;
    pub const INVALID_CONFIG: i32 = 3;
}

/// One violated constraint found by the schema validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path to the offending field, e.g. `definitions[2].skill.params.chunk_size`.
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Every violation collected during one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigValidationError {
    pub violations: Vec<Violation>,
}

impl ConfigValidationError {
    /// Returns `true` if any violation mentions `field` in its path.
    pub fn mentions(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.path.contains(field))
    }
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "configuration has {} violation(s)",
            self.violations.len()
        )?;
        for v in &self.violations {
            write!(f, "\n  - {}", v)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigValidationError {}

/// Fatal errors that stop a run before or during execution.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("{0}")]
    ConfigValidation(#[from] ConfigValidationError),

    #[error("unknown skill: category '{category}', name '{name}'")]
    UnknownSkill { category: String, name: String },

    #[error(
        "incompatible pipeline: '{upstream}' produces {produced} but '{downstream}' accepts {accepted}"
    )]
    IncompatiblePipeline {
        upstream: String,
        downstream: String,
        produced: String,
        accepted: String,
    },

    #[error("failed to construct skill '{skill}': {message}")]
    SkillConstruction { skill: String, message: String },

    #[error("stage {stage} ('{skill}') failed fatally: {message}")]
    StageFatal {
        stage: usize,
        skill: String,
        message: String,
    },

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// A fatal error that ended the indexer after some skillsets ran.
    /// `runs` holds a report for each of them, the aborted run last.
    #[error("{cause}")]
    RunAborted {
        cause: Box<IndexerError>,
        runs: Vec<RunReport>,
    },
}

impl IndexerError {
    /// Exit code the binary uses when this error ends a run.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RunAborted { cause, .. } => cause.exit_code(),
            Self::ConfigValidation(_) | Self::Parse(_) | Self::Io { .. } => {
                exit_codes::INVALID_CONFIG
            }
            Self::UnknownSkill { .. } | Self::IncompatiblePipeline { .. } => {
                exit_codes::INVALID_CONFIG
            }
            _ => exit_codes::FATAL,
        }
    }

    /// Reports of the runs that happened before this error, if any.
    pub fn partial_runs(&self) -> &[RunReport] {
        match self {
            Self::RunAborted { runs, .. } => runs,
            _ => &[],
        }
    }

    /// Attach the reports of completed runs. Reports already carried by an
    /// aborted run are kept after `earlier`.
    pub fn with_runs(self, mut earlier: Vec<RunReport>) -> Self {
        match self {
            Self::RunAborted { cause, runs } => {
                earlier.extend(runs);
                Self::RunAborted {
                    cause,
                    runs: earlier,
                }
            }
            cause if earlier.is_empty() => cause,
            cause => Self::RunAborted {
                cause: Box::new(cause),
                runs: earlier,
            },
        }
    }
}

/// Classification of a failure recorded against a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Error raised by a skill while handling one item.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    /// Retryable: rate limits, 5xx responses, dropped connections.
    #[error("transient: {0}")]
    Transient(String),

    /// Not retryable, but confined to this item.
    #[error("permanent: {0}")]
    Permanent(String),

    /// A required dependency is unusable; the whole run stops.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn transient(msg: impl fmt::Display) -> Self {
        Self::Transient(msg.to_string())
    }

    pub fn permanent(msg: impl fmt::Display) -> Self {
        Self::Permanent(msg.to_string())
    }

    pub fn fatal(msg: impl fmt::Display) -> Self {
        Self::Fatal(msg.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) | Self::Fatal(m) => m,
        }
    }

    /// Classify a reqwest failure: connection problems and timeouts are
    /// transient, everything else (bad URL, decode errors) is permanent.
    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::transient(err)
        } else {
            Self::permanent(err)
        }
    }

    /// Classify an unsuccessful HTTP status: 429 and 5xx are transient.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let msg = format!("HTTP {}: {}", status, body.trim());
        if status.as_u16() == 429 || status.is_server_error() {
            Self::Transient(msg)
        } else {
            Self::Permanent(msg)
        }
    }
}

/// Errors raised by a tracker backend.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker backend unavailable: {0}")]
    Unavailable(String),

    #[error("tracker backend error: {0}")]
    Backend(String),

    #[error("corrupt tracker entry for '{document_id}': {message}")]
    Corrupt {
        document_id: String,
        message: String,
    },
}

impl From<sqlx::Error> for TrackerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(err.to_string())
            }
            other => Self::Backend(other.to_string()),
        }
    }
}
