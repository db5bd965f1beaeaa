use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use foxops_core::{IncarnationId, StateError};
use foxops_engine::EngineError;

/// Failures reported by a [`crate::hoster::Hoster`].
#[derive(Debug, Error)]
pub enum HosterError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Git(#[from] EngineError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("incarnation state in {repository} is unreadable: {source}")]
    State {
        repository: String,
        #[source]
        source: StateError,
    },

    #[error("repository '{repository}' does not exist")]
    RepositoryNotFound { repository: String },

    #[error("target directory '{target_directory}' must be a relative path inside the repository")]
    InvalidTargetDirectory { target_directory: String },

    #[error("merge request {id} not found in '{repository}'")]
    MergeRequestNotFound { repository: String, id: String },

    #[error("cannot merge '{source_branch}' in '{repository}': {reason}")]
    MergeFailed {
        repository: String,
        source_branch: String,
        reason: String,
    },
}

/// Failures reported by a [`crate::store::Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse store record at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Another writer already claimed this revision.
    #[error("revision {revision} of incarnation {incarnation_id} already exists")]
    ChangeConflict {
        incarnation_id: IncarnationId,
        revision: u64,
    },

    #[error("an incarnation of '{incarnation_repository}' at '{target_directory}' already exists")]
    IncarnationExists {
        incarnation_repository: String,
        target_directory: String,
    },

    #[error("incarnation {id} not found")]
    IncarnationNotFound { id: IncarnationId },

    #[error("revision {revision} of incarnation {incarnation_id} not found")]
    ChangeNotFound {
        incarnation_id: IncarnationId,
        revision: u64,
    },
}

/// Coarse classification used by callers to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input; retrying the same request cannot succeed.
    User,
    /// Lost a race against a concurrent writer.
    Conflict,
    /// Infrastructure hiccup; the same request may succeed later.
    Transient,
    /// Recorded data no longer matches reality.
    Integrity,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "user error"),
            ErrorCategory::Conflict => write!(f, "conflict"),
            ErrorCategory::Transient => write!(f, "transient error"),
            ErrorCategory::Integrity => write!(f, "integrity error"),
        }
    }
}

/// Errors from the change orchestrator.
#[derive(Debug, Error)]
pub enum ChangeError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("hoster error: {0}")]
    Hoster(#[from] HosterError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("incarnation is already initialized at commit {commit_sha}{}", mismatch_note(.has_mismatch))]
    AlreadyInitialized {
        commit_sha: String,
        /// The recorded state differs from what was requested.
        has_mismatch: bool,
    },

    #[error("no incarnation state in '{incarnation_repository}' at '{target_directory}'")]
    NotInitialized {
        incarnation_repository: String,
        target_directory: String,
    },

    #[error("incarnation {id} not found")]
    IncarnationNotFound { id: IncarnationId },

    #[error("revision {revision} of incarnation {incarnation_id} not found")]
    ChangeNotFound {
        incarnation_id: IncarnationId,
        revision: u64,
    },

    #[error("invalid setting {name}={value}: {reason}")]
    InvalidSetting {
        name: String,
        value: String,
        reason: String,
    },
}

impl ChangeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ChangeError::Engine(e) => engine_category(e),
            ChangeError::Hoster(e) => match e {
                HosterError::Git(e) => engine_category(e),
                HosterError::Io { .. } => ErrorCategory::Transient,
                HosterError::Yaml(_) | HosterError::State { .. } => ErrorCategory::Integrity,
                HosterError::RepositoryNotFound { .. }
                | HosterError::InvalidTargetDirectory { .. }
                | HosterError::MergeRequestNotFound { .. } => ErrorCategory::User,
                HosterError::MergeFailed { .. } => ErrorCategory::Conflict,
            },
            ChangeError::Store(e) => match e {
                StoreError::ChangeConflict { .. } | StoreError::IncarnationExists { .. } => {
                    ErrorCategory::Conflict
                }
                StoreError::Io { .. } => ErrorCategory::Transient,
                StoreError::Yaml(_) | StoreError::Parse { .. } => ErrorCategory::Integrity,
                StoreError::IncarnationNotFound { .. } | StoreError::ChangeNotFound { .. } => {
                    ErrorCategory::User
                }
            },
            ChangeError::AlreadyInitialized { .. } => ErrorCategory::Conflict,
            ChangeError::NotInitialized { .. }
            | ChangeError::IncarnationNotFound { .. }
            | ChangeError::ChangeNotFound { .. }
            | ChangeError::InvalidSetting { .. } => ErrorCategory::User,
        }
    }
}

fn mismatch_note(has_mismatch: &bool) -> &'static str {
    if *has_mismatch {
        " with different template settings"
    } else {
        ""
    }
}

fn engine_category(e: &EngineError) -> ErrorCategory {
    match e {
        EngineError::Render(_)
        | EngineError::Template(_)
        | EngineError::NotInitialized { .. }
        | EngineError::TemplateUnreachable { .. } => ErrorCategory::User,
        EngineError::PushRejected { .. } | EngineError::AlreadyInitialized { .. } => {
            ErrorCategory::Conflict
        }
        EngineError::Io { .. }
        | EngineError::Git { .. }
        | EngineError::GitSpawn { .. }
        | EngineError::GitTimeout { .. } => ErrorCategory::Transient,
        EngineError::State(_) | EngineError::Reproduction { .. } => ErrorCategory::Integrity,
    }
}

pub(crate) fn hoster_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> HosterError {
    HosterError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn store_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn categories() {
        let conflict = ChangeError::Store(StoreError::ChangeConflict {
            incarnation_id: IncarnationId(1),
            revision: 2,
        });
        assert_eq!(conflict.category(), ErrorCategory::Conflict);

        let timeout = ChangeError::Engine(EngineError::GitTimeout {
            command: "clone".into(),
            timeout: Duration::from_secs(1),
        });
        assert_eq!(timeout.category(), ErrorCategory::Transient);

        let gone = ChangeError::Engine(EngineError::Reproduction {
            template_repository: "t".into(),
            version_hash: "abc".into(),
            reason: "gone".into(),
        });
        assert_eq!(gone.category(), ErrorCategory::Integrity);

        let initialized = ChangeError::AlreadyInitialized {
            commit_sha: "abc".into(),
            has_mismatch: true,
        };
        assert_eq!(initialized.category(), ErrorCategory::Conflict);
        assert!(initialized.to_string().contains("different template settings"));

        let unreachable = ChangeError::Engine(EngineError::TemplateUnreachable {
            template_repository: "/nowhere".into(),
            reason: "not a git repository".into(),
        });
        assert_eq!(unreachable.category(), ErrorCategory::User);

        let via_hoster = ChangeError::Hoster(HosterError::Git(EngineError::TemplateUnreachable {
            template_repository: "/nowhere".into(),
            reason: "not a git repository".into(),
        }));
        assert_eq!(via_hoster.category(), ErrorCategory::User);
    }
}
