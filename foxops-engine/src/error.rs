//! Error types for foxops-engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use foxops_core::{StateError, TemplateError};
use foxops_renderer::RenderError;

/// All errors that can arise from engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An error from the rendering engine.
    #[error("render error: {0}")]
    Render(#[from] RenderError),

    /// Template configuration or data validation failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The state sidecar could not be read or written.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A git subprocess exited unsuccessfully. Carries the captured output.
    #[error("`git {command}` failed (exit code {code:?}): {}", .stderr.trim())]
    Git {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The git binary could not be started at all.
    #[error("failed to spawn `git {command}`: {source}")]
    GitSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A git subprocess ran past its deadline and was killed.
    #[error("`git {command}` timed out after {timeout:?}")]
    GitTimeout { command: String, timeout: Duration },

    /// The remote refused the push because it has diverged (non-fast-forward).
    #[error("push of '{branch}' was rejected, remote has diverged: {}", .stderr.trim())]
    PushRejected { branch: String, stderr: String },

    /// No state sidecar: the directory was never initialized.
    #[error("incarnation at {path} is not initialized")]
    NotInitialized { path: PathBuf },

    /// A state sidecar already exists where an initialization was requested.
    #[error("incarnation at {path} is already initialized")]
    AlreadyInitialized { path: PathBuf },

    /// The template repository could not be cloned at the requested ref.
    #[error("template repository {template_repository} is unreachable: {reason}")]
    TemplateUnreachable {
        template_repository: String,
        reason: String,
    },

    /// The recorded template commit can no longer be rendered, so the
    /// previous rendering cannot be reproduced.
    #[error(
        "cannot reproduce previous rendering from {template_repository} at {version_hash}: {reason}"
    )]
    Reproduction {
        template_repository: String,
        version_hash: String,
        reason: String,
    },
}

impl EngineError {
    /// True for failures caused by the remote having moved under us.
    pub fn is_push_rejected(&self) -> bool {
        matches!(self, EngineError::PushRejected { .. })
    }
}

/// A failed template clone is reported as [`EngineError::TemplateUnreachable`];
/// timeouts and spawn failures pass through unchanged.
pub(crate) fn template_clone_err(template_repository: &str, e: EngineError) -> EngineError {
    match e {
        EngineError::Git { .. } => EngineError::TemplateUnreachable {
            template_repository: template_repository.to_string(),
            reason: e.to_string(),
        },
        other => other,
    }
}

/// Convenience constructor for [`EngineError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.into(),
        source,
    }
}
