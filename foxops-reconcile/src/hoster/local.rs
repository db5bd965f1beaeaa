//! Hoster backed by bare repositories on the local filesystem.
//!
//! # Layout
//!
//! ```text
//! <root>/<repository>/
//!   git/                    bare repository
//!   merge_requests/<id>.yaml
//!   merge_blocked           present while automerge must wait
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use foxops_core::state::STATE_FILENAME;
use foxops_core::{IncarnationState, MergeRequestStatus};
use foxops_engine::GitRepository;

use super::{
    normalize_target_directory, path_in_target, ClonedRepository, Hoster, MergeRequest,
    RepositoryMetadata,
};
use crate::error::{hoster_io_err, HosterError};
use crate::retry::poll_until;
use crate::settings::Settings;

const GIT_DIRNAME: &str = "git";
const MERGE_REQUESTS_DIRNAME: &str = "merge_requests";
const MERGE_BLOCKED_FILENAME: &str = "merge_blocked";

/// A merge request as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequestRecord {
    pub id: String,
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub description: String,
    pub automerge: bool,
    pub status: MergeRequestStatus,
    pub commit_sha: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LocalHoster {
    root: PathBuf,
    git_timeout: Duration,
    automerge_poll_interval: Duration,
    automerge_timeout: Duration,
}

impl LocalHoster {
    pub fn new(root: impl Into<PathBuf>, settings: &Settings) -> Self {
        Self {
            root: root.into(),
            git_timeout: settings.git_timeout,
            automerge_poll_interval: settings.automerge_poll_interval,
            automerge_timeout: settings.automerge_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repository_dir(&self, repository: &str) -> Result<PathBuf, HosterError> {
        match normalize_target_directory(repository).as_deref() {
            Some(".") | None => Err(HosterError::RepositoryNotFound {
                repository: repository.to_string(),
            }),
            Some(name) => Ok(self.root.join(name)),
        }
    }

    /// Clone URL of `repository` (a local path).
    pub fn repository_url(&self, repository: &str) -> Result<String, HosterError> {
        Ok(self
            .repository_dir(repository)?
            .join(GIT_DIRNAME)
            .to_string_lossy()
            .into_owned())
    }

    /// Create an empty bare repository; returns its clone URL.
    pub async fn create_repository(&self, repository: &str) -> Result<String, HosterError> {
        let dir = self.repository_dir(repository)?;
        GitRepository::init(&dir.join(GIT_DIRNAME), true, self.git_timeout).await?;
        let mr_dir = dir.join(MERGE_REQUESTS_DIRNAME);
        std::fs::create_dir_all(&mr_dir).map_err(|e| hoster_io_err(&mr_dir, e))?;
        tracing::info!(%repository, "created repository");
        self.repository_url(repository)
    }

    /// Hold (or release) automerges in `repository`, like a running pipeline would.
    pub fn set_merge_blocked(&self, repository: &str, blocked: bool) -> Result<(), HosterError> {
        let marker = self.repository_dir(repository)?.join(MERGE_BLOCKED_FILENAME);
        let result = if blocked {
            std::fs::write(&marker, b"")
        } else {
            match std::fs::remove_file(&marker) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        };
        result.map_err(|e| hoster_io_err(&marker, e))
    }

    fn merge_blocked(&self, repository: &str) -> Result<bool, HosterError> {
        Ok(self
            .repository_dir(repository)?
            .join(MERGE_BLOCKED_FILENAME)
            .exists())
    }

    fn bare(&self, repository: &str) -> Result<GitRepository, HosterError> {
        let dir = self.repository_dir(repository)?.join(GIT_DIRNAME);
        if !dir.is_dir() {
            return Err(HosterError::RepositoryNotFound {
                repository: repository.to_string(),
            });
        }
        Ok(GitRepository::open(dir, self.git_timeout))
    }

    // -----------------------------------------------------------------------
    // Merge request records
    // -----------------------------------------------------------------------

    fn merge_request_path(&self, repository: &str, id: &str) -> Result<PathBuf, HosterError> {
        if id.parse::<u64>().is_err() {
            return Err(HosterError::MergeRequestNotFound {
                repository: repository.to_string(),
                id: id.to_string(),
            });
        }
        Ok(self
            .repository_dir(repository)?
            .join(MERGE_REQUESTS_DIRNAME)
            .join(format!("{id}.yaml")))
    }

    pub fn load_merge_request(&self, repository: &str, id: &str) -> Result<MergeRequestRecord, HosterError> {
        let path = self.merge_request_path(repository, id)?;
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HosterError::MergeRequestNotFound {
                    repository: repository.to_string(),
                    id: id.to_string(),
                })
            }
            Err(e) => return Err(hoster_io_err(&path, e)),
        };
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// All merge requests of `repository`, oldest first.
    pub fn list_merge_requests(&self, repository: &str) -> Result<Vec<MergeRequestRecord>, HosterError> {
        let dir = self.repository_dir(repository)?.join(MERGE_REQUESTS_DIRNAME);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(hoster_io_err(&dir, e)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| hoster_io_err(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".yaml").and_then(|s| s.parse::<u64>().ok()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        ids.into_iter()
            .map(|id| self.load_merge_request(repository, &id.to_string()))
            .collect()
    }

    fn create_merge_request_record(
        &self,
        repository: &str,
        mut record: MergeRequestRecord,
    ) -> Result<MergeRequestRecord, HosterError> {
        let dir = self.repository_dir(repository)?.join(MERGE_REQUESTS_DIRNAME);
        std::fs::create_dir_all(&dir).map_err(|e| hoster_io_err(&dir, e))?;
        let mut next = self
            .list_merge_requests(repository)?
            .iter()
            .filter_map(|r| r.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        loop {
            record.id = next.to_string();
            let path = dir.join(format!("{next}.yaml"));
            let yaml = serde_yaml::to_string(&record)?;
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    file.write_all(yaml.as_bytes())
                        .map_err(|e| hoster_io_err(&path, e))?;
                    return Ok(record);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => next += 1,
                Err(e) => return Err(hoster_io_err(&path, e)),
            }
        }
    }

    fn save_merge_request_record(&self, repository: &str, record: &MergeRequestRecord) -> Result<(), HosterError> {
        let path = self.merge_request_path(repository, &record.id)?;
        let tmp_path = path.with_extension("yaml.tmp");
        let yaml = serde_yaml::to_string(record)?;
        std::fs::write(&tmp_path, yaml).map_err(|e| hoster_io_err(&tmp_path, e))?;
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(hoster_io_err(&path, e));
        }
        Ok(())
    }

    /// Merge the source branch into the target branch and delete it.
    async fn merge(&self, repository: &str, record: &MergeRequestRecord) -> Result<(), HosterError> {
        let work = self
            .cloned_repository(repository, Some(&record.target_branch))
            .await?;
        let repo = work.repo();
        let source = format!("origin/{}", record.source_branch);
        let message = format!("Merge branch '{}'", record.source_branch);
        let out = repo
            .run_unchecked(&["merge", "--no-ff", "-m", message.as_str(), source.as_str()], None)
            .await?;
        if !out.success() {
            if let Err(e) = repo.run_unchecked(&["merge", "--abort"], None).await {
                tracing::warn!(error = %e, "failed to abort merge");
            }
            return Err(HosterError::MergeFailed {
                repository: repository.to_string(),
                source_branch: record.source_branch.clone(),
                reason: format!("{}{}", out.stdout.trim(), out.stderr.trim()),
            });
        }
        repo.push("origin", &record.target_branch).await?;
        repo.delete_remote_branch("origin", &record.source_branch).await?;
        tracing::info!(%repository, id = %record.id, branch = %record.source_branch, "merge request merged");
        Ok(())
    }
}

async fn default_branch(bare: &GitRepository) -> Result<String, HosterError> {
    let out = bare.run(&["symbolic-ref", "--short", "HEAD"]).await?;
    Ok(out.stdout.trim().to_string())
}

async fn branch_head(bare: &GitRepository, branch: &str) -> Result<Option<String>, HosterError> {
    let reference = format!("refs/heads/{branch}");
    let out = bare
        .run_unchecked(&["rev-parse", "--verify", "--quiet", reference.as_str()], None)
        .await?;
    Ok(out.success().then(|| out.stdout.trim().to_string()))
}

#[async_trait]
impl Hoster for LocalHoster {
    async fn validate(&self, incarnation_repository: &str, target_directory: &str) -> Result<(), HosterError> {
        self.bare(incarnation_repository)?;
        if normalize_target_directory(target_directory).is_none() {
            return Err(HosterError::InvalidTargetDirectory {
                target_directory: target_directory.to_string(),
            });
        }
        Ok(())
    }

    async fn get_incarnation_state(
        &self,
        incarnation_repository: &str,
        target_directory: &str,
    ) -> Result<Option<(String, IncarnationState)>, HosterError> {
        let bare = self.bare(incarnation_repository)?;
        let branch = default_branch(&bare).await?;
        let Some(head) = branch_head(&bare, &branch).await? else {
            return Ok(None);
        };
        let path = path_in_target(target_directory, STATE_FILENAME);
        let object = format!("{head}:{path}");
        let out = bare.run_unchecked(&["show", object.as_str()], None).await?;
        if !out.success() {
            return Ok(None);
        }
        let state = IncarnationState::from_yaml_str(&out.stdout, Path::new(&path)).map_err(|source| {
            HosterError::State {
                repository: incarnation_repository.to_string(),
                source,
            }
        })?;
        Ok(Some((head, state)))
    }

    async fn cloned_repository(
        &self,
        repository: &str,
        refspec: Option<&str>,
    ) -> Result<ClonedRepository, HosterError> {
        let url = self.repository_url(repository)?;
        self.bare(repository)?;
        let scratch = tempfile::Builder::new()
            .prefix("foxops-clone-")
            .tempdir()
            .map_err(|e| hoster_io_err(std::env::temp_dir(), e))?;
        let dest = scratch.path().join("repo");
        let repo = GitRepository::clone_from(&url, &dest, refspec, false, self.git_timeout).await?;
        Ok(ClonedRepository::new(scratch, repo))
    }

    async fn merge_request(
        &self,
        incarnation_repository: &str,
        source_branch: &str,
        title: &str,
        description: &str,
        with_automerge: bool,
    ) -> Result<MergeRequest, HosterError> {
        let bare = self.bare(incarnation_repository)?;
        let Some(commit_sha) = branch_head(&bare, source_branch).await? else {
            return Err(HosterError::MergeFailed {
                repository: incarnation_repository.to_string(),
                source_branch: source_branch.to_string(),
                reason: "source branch does not exist".into(),
            });
        };
        let target_branch = default_branch(&bare).await?;

        let mut record = self.create_merge_request_record(
            incarnation_repository,
            MergeRequestRecord {
                id: String::new(),
                source_branch: source_branch.to_string(),
                target_branch,
                title: title.to_string(),
                description: description.to_string(),
                automerge: with_automerge,
                status: MergeRequestStatus::Open,
                commit_sha: commit_sha.clone(),
                created_at: Utc::now(),
            },
        )?;
        tracing::info!(repository = %incarnation_repository, id = %record.id, %source_branch, "merge request opened");

        if with_automerge {
            let unblocked = poll_until(self.automerge_poll_interval, self.automerge_timeout, || async {
                self.merge_blocked(incarnation_repository).map(|blocked| !blocked)
            })
            .await?;
            if unblocked {
                self.merge(incarnation_repository, &record).await?;
                record.status = MergeRequestStatus::Merged;
                self.save_merge_request_record(incarnation_repository, &record)?;
            } else {
                tracing::warn!(
                    repository = %incarnation_repository,
                    id = %record.id,
                    "automerge still blocked at deadline, leaving merge request open"
                );
            }
        }

        Ok(MergeRequest {
            id: record.id,
            commit_sha,
            status: record.status,
        })
    }

    async fn has_pending_incarnation_branch(
        &self,
        incarnation_repository: &str,
        branch: &str,
    ) -> Result<Option<String>, HosterError> {
        let bare = self.bare(incarnation_repository)?;
        branch_head(&bare, branch).await
    }

    async fn has_pending_incarnation_merge_request(
        &self,
        incarnation_repository: &str,
        branch: &str,
    ) -> Result<Option<String>, HosterError> {
        Ok(self
            .list_merge_requests(incarnation_repository)?
            .into_iter()
            .find(|r| r.source_branch == branch && r.status == MergeRequestStatus::Open)
            .map(|r| r.id))
    }

    async fn get_repository_metadata(&self, repository: &str) -> Result<RepositoryMetadata, HosterError> {
        let bare = self.bare(repository)?;
        Ok(RepositoryMetadata {
            default_branch: default_branch(&bare).await?,
        })
    }

    async fn does_commit_exist(&self, repository: &str, commit_sha: &str) -> Result<bool, HosterError> {
        let bare = self.bare(repository)?;
        Ok(bare.commit_exists(commit_sha).await?)
    }

    async fn get_merge_request_status(
        &self,
        repository: &str,
        merge_request_id: &str,
    ) -> Result<MergeRequestStatus, HosterError> {
        Ok(self.load_merge_request(repository, merge_request_id)?.status)
    }
}
