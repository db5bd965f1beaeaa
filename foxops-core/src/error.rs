//! Error types for foxops-core.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or writing the incarnation state sidecar.
#[derive(Debug, Error)]
pub enum StateError {
    /// Underlying I/O failure (permission denied, disk full, etc.).
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load — includes file path and line context from serde_yaml.
    #[error("failed to parse incarnation state at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// No state sidecar exists in the incarnation directory.
    #[error("incarnation state not found at {path}")]
    StateNotFound { path: PathBuf },
}

/// Errors raised by template configuration loading and data validation.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `fengine.yaml` is not valid YAML or does not match the configuration shape.
    #[error("failed to parse template configuration at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The variable schema itself violates an invariant (bad name, bad default).
    #[error("invalid template schema: {}", .errors.join("; "))]
    InvalidSchema { errors: Vec<String> },

    /// User-supplied data does not satisfy the schema. Lists every problem found.
    #[error("invalid template data: {}", join_data_errors(.errors))]
    InvalidTemplateData { errors: Vec<DataError> },

    /// A `key=value` assignment could not be parsed.
    #[error("invalid data assignment '{0}': expected KEY=VALUE")]
    InvalidAssignment(String),
}

/// A single validation failure, addressed by dotted variable path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataError {
    pub path: String,
    pub kind: DataErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataErrorKind {
    /// Required variable (no default) is absent.
    Missing,
    /// Value present but not of the declared kind.
    Mismatch { expected: &'static str, found: String },
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DataErrorKind::Missing => write!(f, "missing required variable '{}'", self.path),
            DataErrorKind::Mismatch { expected, found } => write!(
                f,
                "variable '{}' expected {expected}, got {found}",
                self.path
            ),
        }
    }
}

fn join_data_errors(errors: &[DataError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub(crate) fn state_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn template_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> TemplateError {
    TemplateError::Io {
        path: path.into(),
        source,
    }
}
