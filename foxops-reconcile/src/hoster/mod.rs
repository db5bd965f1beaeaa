//! The version-control hosting backend, behind an async trait.

use std::path::Path;

use async_trait::async_trait;
use tempfile::TempDir;

use foxops_core::{IncarnationState, MergeRequestStatus};
use foxops_engine::GitRepository;

use crate::error::HosterError;

pub mod local;

pub use local::{LocalHoster, MergeRequestRecord};

/// Facts about a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryMetadata {
    pub default_branch: String,
}

/// A merge request as returned on creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub id: String,
    /// Head of the source branch when the request was opened.
    pub commit_sha: String,
    pub status: MergeRequestStatus,
}

/// A working copy in a temporary directory, removed on drop.
#[derive(Debug)]
pub struct ClonedRepository {
    repo: GitRepository,
    _scratch: TempDir,
}

impl ClonedRepository {
    pub fn new(scratch: TempDir, repo: GitRepository) -> Self {
        Self {
            repo,
            _scratch: scratch,
        }
    }

    pub fn repo(&self) -> &GitRepository {
        &self.repo
    }

    pub fn path(&self) -> &Path {
        self.repo.dir()
    }
}

#[async_trait]
pub trait Hoster: Send + Sync {
    /// Fail unless `incarnation_repository` exists and can host an incarnation
    /// at `target_directory`.
    async fn validate(&self, incarnation_repository: &str, target_directory: &str) -> Result<(), HosterError>;

    /// Sidecar at `target_directory` on the default branch, with the commit it was read from.
    async fn get_incarnation_state(
        &self,
        incarnation_repository: &str,
        target_directory: &str,
    ) -> Result<Option<(String, IncarnationState)>, HosterError>;

    /// Fresh clone checked out at `refspec` (default branch when `None`).
    async fn cloned_repository(
        &self,
        repository: &str,
        refspec: Option<&str>,
    ) -> Result<ClonedRepository, HosterError>;

    /// Open a merge request from `source_branch` into the default branch.
    /// With `with_automerge` the hoster merges it as soon as it is allowed to.
    async fn merge_request(
        &self,
        incarnation_repository: &str,
        source_branch: &str,
        title: &str,
        description: &str,
        with_automerge: bool,
    ) -> Result<MergeRequest, HosterError>;

    /// Head commit of `branch` if it exists.
    async fn has_pending_incarnation_branch(
        &self,
        incarnation_repository: &str,
        branch: &str,
    ) -> Result<Option<String>, HosterError>;

    /// Id of an open merge request from `branch`, if any.
    async fn has_pending_incarnation_merge_request(
        &self,
        incarnation_repository: &str,
        branch: &str,
    ) -> Result<Option<String>, HosterError>;

    async fn get_repository_metadata(&self, repository: &str) -> Result<RepositoryMetadata, HosterError>;

    async fn does_commit_exist(&self, repository: &str, commit_sha: &str) -> Result<bool, HosterError>;

    async fn get_merge_request_status(
        &self,
        repository: &str,
        merge_request_id: &str,
    ) -> Result<MergeRequestStatus, HosterError>;
}

/// `"."` for the repository root, otherwise a `/`-separated relative path.
/// `None` for absolute paths and paths escaping the repository.
pub fn normalize_target_directory(target_directory: &str) -> Option<String> {
    if target_directory.starts_with('/') {
        return None;
    }
    let mut parts = Vec::new();
    for part in target_directory.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            p => parts.push(p),
        }
    }
    Some(if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    })
}

/// Repository-relative path of `file` inside `target_directory`.
pub(crate) fn path_in_target(target_directory: &str, file: &str) -> String {
    match normalize_target_directory(target_directory).as_deref() {
        None | Some(".") => file.to_string(),
        Some(dir) => format!("{dir}/{file}"),
    }
}
