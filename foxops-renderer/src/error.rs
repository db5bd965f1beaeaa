//! Error types for foxops-renderer.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise while rendering a template tree.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Tera template engine error not tied to a single entry.
    #[error("template engine error: {0}")]
    Tera(#[from] tera::Error),

    /// A path, file body or symlink target failed to render. The tera error
    /// chain carries the undefined variable or syntax problem.
    #[error("failed to render {path}: {}", render_chain(.source))]
    Template {
        path: PathBuf,
        #[source]
        source: tera::Error,
    },

    /// JSON serialization error (building tera context).
    #[error("context serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An exclusion pattern is not a valid glob.
    #[error("invalid exclusion pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// A path component rendered to something that cannot be a file name.
    #[error("path component {path} rendered to invalid name '{rendered}'")]
    InvalidName { path: PathBuf, rendered: String },

    /// Filesystem error while reading the template or writing the target.
    #[error("template io error at {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

/// Flatten tera's error chain; its top-level message alone is rarely useful.
fn render_chain(err: &tera::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RenderError {
    RenderError::Io {
        path: path.into(),
        source,
    }
}
