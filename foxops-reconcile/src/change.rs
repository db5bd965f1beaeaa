//! Change orchestrator: turns initialize / update requests into commits,
//! merge requests and durable change records.
//!
//! A change is recorded with `commit_pushed = false` before its push and
//! flipped afterwards. A failed push deletes the record; a crash in between
//! leaves a stale record for [`ChangeService::reconcile_unpushed_changes`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};

use foxops_core::{
    state, Change, ChangeType, Incarnation, IncarnationId, IncarnationState, MergeRequestStatus,
    PatchResult, TemplateData,
};
use foxops_engine::{Engine, EngineError, GitRepository, UpdateRequest};

use crate::error::{hoster_io_err, ChangeError, HosterError};
use crate::hoster::{normalize_target_directory, ClonedRepository, Hoster};
use crate::retry::push_with_retry;
use crate::settings::Settings;
use crate::store::Store;

const BRANCH_PREFIX: &str = "foxops";

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InitializeRequest {
    pub incarnation_repository: String,
    /// Directory inside the incarnation repository; `"."` for the root.
    pub target_directory: String,
    pub template_repository: String,
    pub template_repository_version: String,
    pub template_data: TemplateData,
    pub automerge: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitializeResult {
    pub incarnation: Incarnation,
    pub change: Change,
}

/// How an update reaches the default branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeDelivery {
    /// Commit straight onto the default branch; conflicts escalate to a merge request.
    Direct,
    #[default]
    MergeRequest,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateChangeRequest {
    /// Template ref to move to; `None` keeps the recorded one.
    pub requested_version: Option<String>,
    pub requested_data: TemplateData,
    /// Replace the recorded data instead of merging over it.
    pub replace_data: bool,
    pub automerge: bool,
    pub delivery: ChangeDelivery,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateResult {
    Applied(Change),
    /// An update branch for this version already exists.
    InFlight {
        commit_sha: String,
        merge_request_id: Option<String>,
    },
    NothingToDo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeWithMergeRequest {
    pub change: Change,
    /// `None` for direct changes.
    pub merge_request_status: Option<MergeRequestStatus>,
}

/// What [`ChangeService::reconcile_unpushed_changes`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnpushedReport {
    /// Commit found on the hoster; record marked pushed.
    pub confirmed: Vec<(IncarnationId, u64)>,
    /// Commit never arrived; record deleted.
    pub discarded: Vec<(IncarnationId, u64)>,
}

// ---------------------------------------------------------------------------
// Branch names
// ---------------------------------------------------------------------------

fn target_digest(target_directory: &str) -> String {
    let normalized = normalize_target_directory(target_directory).unwrap_or_else(|| target_directory.to_string());
    let digest = hex::encode(Sha256::digest(normalized.as_bytes()));
    digest[..7].to_string()
}

pub fn initialize_branch_name(target_directory: &str, version: &str) -> String {
    format!("{BRANCH_PREFIX}/initialize-to-{}-{version}", target_digest(target_directory))
}

pub fn update_branch_name(version: &str, target_directory: &str) -> String {
    format!("{BRANCH_PREFIX}/update-to-{version}-{}", target_digest(target_directory))
}

// ---------------------------------------------------------------------------
// ChangeService
// ---------------------------------------------------------------------------

pub struct ChangeService {
    hoster: Arc<dyn Hoster>,
    store: Arc<dyn Store>,
    engine: Engine,
    settings: Settings,
}

impl ChangeService {
    pub fn new(hoster: Arc<dyn Hoster>, store: Arc<dyn Store>, settings: Settings) -> Self {
        Self {
            hoster,
            store,
            engine: Engine::new(settings.git_timeout),
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Initialize
    // -----------------------------------------------------------------------

    pub async fn initialize_incarnation(&self, request: &InitializeRequest) -> Result<InitializeResult, ChangeError> {
        let repository = request.incarnation_repository.as_str();
        self.hoster.validate(repository, &request.target_directory).await?;
        let target = normalize_target_directory(&request.target_directory).ok_or_else(|| {
            HosterError::InvalidTargetDirectory {
                target_directory: request.target_directory.clone(),
            }
        })?;

        if let Some((commit_sha, recorded)) = self.hoster.get_incarnation_state(repository, &target).await? {
            let has_mismatch = recorded.template_repository != request.template_repository
                || recorded.template_repository_version != request.template_repository_version
                || recorded.template_data != request.template_data;
            return Err(ChangeError::AlreadyInitialized {
                commit_sha,
                has_mismatch,
            });
        }

        let branch = initialize_branch_name(&target, &request.template_repository_version);
        if let Some(commit_sha) = self.hoster.has_pending_incarnation_branch(repository, &branch).await? {
            tracing::info!(%repository, %target, %branch, "initialization already in flight");
            return self.resume_initialization(request, &target, &branch, &commit_sha).await;
        }

        let (incarnation, created) = match self.store.find_incarnation(repository, &target).await? {
            Some(existing) => (existing, false),
            None => (
                self.store
                    .create_incarnation(repository, &target, &request.template_repository)
                    .await?,
                true,
            ),
        };

        match self.deliver_initialization(request, &incarnation, &target, &branch).await {
            Ok(change) => Ok(InitializeResult { incarnation, change }),
            Err(e) => {
                if created {
                    if let Err(cleanup) = self.store.delete_incarnation(incarnation.id).await {
                        tracing::warn!(id = %incarnation.id, error = %cleanup, "failed to drop incarnation record");
                    }
                }
                Err(e)
            }
        }
    }

    async fn deliver_initialization(
        &self,
        request: &InitializeRequest,
        incarnation: &Incarnation,
        target: &str,
        branch: &str,
    ) -> Result<Change, ChangeError> {
        let repository = request.incarnation_repository.as_str();
        let clone = self.hoster.cloned_repository(repository, None).await?;
        let repo = clone.repo();
        let target_dir = target_path(&clone, target);
        let default_branch = self.hoster.get_repository_metadata(repository).await?.default_branch;

        let direct = !repo.has_commits().await? || is_empty_dir(&target_dir)?;
        let push_branch = if direct {
            ensure_on_branch(repo, &default_branch).await?;
            default_branch.clone()
        } else {
            repo.create_branch(branch).await?;
            branch.to_string()
        };

        std::fs::create_dir_all(&target_dir).map_err(|e| hoster_io_err(&target_dir, e))?;
        let recorded = self
            .engine
            .initialize_incarnation_from_git(
                &request.template_repository,
                Some(&request.template_repository_version),
                &request.template_data,
                &target_dir,
            )
            .await?;
        repo.add_all().await?;
        let commit_sha = repo
            .commit(&format!("Initialize to {}", request.template_repository_version))
            .await?;

        let change = Change {
            incarnation_id: incarnation.id,
            revision: 1,
            change_type: if direct {
                ChangeType::Direct
            } else {
                ChangeType::MergeRequest
            },
            commit_sha,
            commit_pushed: false,
            requested_version: recorded.template_repository_version.clone(),
            requested_version_hash: recorded.template_repository_version_hash.clone(),
            requested_data: recorded.template_data.clone(),
            created_at: Utc::now(),
            merge_request_id: None,
            merge_request_branch_name: (!direct).then(|| branch.to_string()),
        };
        let change = self.record_and_push(change, repo, &push_branch).await?;

        if direct {
            tracing::info!(%repository, %target, sha = %change.commit_sha, "incarnation initialized directly");
            return Ok(change);
        }
        let title = format!("Initialize to {}", request.template_repository_version);
        let description = format!(
            "Initialize `{target}` from `{}` at `{}`.",
            request.template_repository, request.template_repository_version
        );
        self.open_merge_request(repository, change, branch, &title, &description, request.automerge)
            .await
    }

    /// Hand back the records of an initialization whose branch is already
    /// pushed, recreating whatever a crash lost.
    async fn resume_initialization(
        &self,
        request: &InitializeRequest,
        target: &str,
        branch: &str,
        commit_sha: &str,
    ) -> Result<InitializeResult, ChangeError> {
        let repository = request.incarnation_repository.as_str();
        let merge_request_id = match self
            .hoster
            .has_pending_incarnation_merge_request(repository, branch)
            .await?
        {
            Some(id) => id,
            None => {
                let title = format!("Initialize to {}", request.template_repository_version);
                self.hoster
                    .merge_request(repository, branch, &title, "", request.automerge)
                    .await?
                    .id
            }
        };

        let incarnation = match self.store.find_incarnation(repository, target).await? {
            Some(existing) => existing,
            None => {
                self.store
                    .create_incarnation(repository, target, &request.template_repository)
                    .await?
            }
        };
        if let Some(mut change) = self.store.get_change(incarnation.id, 1).await? {
            if change.merge_request_id.is_none() {
                self.store
                    .set_merge_request_id(incarnation.id, 1, &merge_request_id)
                    .await?;
                change.merge_request_id = Some(merge_request_id);
            }
            if !change.commit_pushed {
                self.store.update_commit_pushed(incarnation.id, 1, true).await?;
                change.commit_pushed = true;
            }
            return Ok(InitializeResult { incarnation, change });
        }

        let clone = self.hoster.cloned_repository(repository, Some(branch)).await?;
        let recorded = state::load_at(&target_path(&clone, target)).map_err(EngineError::from)?;
        let change = Change {
            incarnation_id: incarnation.id,
            revision: 1,
            change_type: ChangeType::MergeRequest,
            commit_sha: commit_sha.to_string(),
            commit_pushed: true,
            requested_version: recorded.template_repository_version,
            requested_version_hash: recorded.template_repository_version_hash,
            requested_data: recorded.template_data,
            created_at: Utc::now(),
            merge_request_id: Some(merge_request_id),
            merge_request_branch_name: Some(branch.to_string()),
        };
        self.store.create_change(&change).await?;
        tracing::info!(id = %incarnation.id, %branch, "recreated initialization record");
        Ok(InitializeResult { incarnation, change })
    }

    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    pub async fn update_incarnation(
        &self,
        id: IncarnationId,
        request: &UpdateChangeRequest,
    ) -> Result<UpdateResult, ChangeError> {
        let incarnation = self.get_incarnation(id).await?;
        let repository = incarnation.incarnation_repository.as_str();
        let target = incarnation.target_directory.as_str();

        let Some((_, recorded)) = self.hoster.get_incarnation_state(repository, target).await? else {
            return Err(ChangeError::NotInitialized {
                incarnation_repository: repository.to_string(),
                target_directory: target.to_string(),
            });
        };
        let version = request
            .requested_version
            .clone()
            .unwrap_or_else(|| recorded.template_repository_version.clone());

        let branch = update_branch_name(&version, target);
        if let Some(commit_sha) = self.hoster.has_pending_incarnation_branch(repository, &branch).await? {
            let merge_request_id = self
                .hoster
                .has_pending_incarnation_merge_request(repository, &branch)
                .await?;
            tracing::info!(%id, %branch, "update already in flight");
            return Ok(UpdateResult::InFlight {
                commit_sha,
                merge_request_id,
            });
        }

        let clone = self.hoster.cloned_repository(repository, None).await?;
        let repo = clone.repo();
        let default_branch = self.hoster.get_repository_metadata(repository).await?.default_branch;
        let mut delivery = request.delivery;
        if delivery == ChangeDelivery::MergeRequest {
            repo.create_branch(&branch).await?;
        }

        let engine_request = UpdateRequest {
            template_repository: None,
            version: Some(version.clone()),
            data: request.requested_data.clone(),
            remove_data: Vec::new(),
            replace_data: request.replace_data,
        };
        let outcome = self
            .engine
            .update_incarnation_from_git(&target_path(&clone, target), &engine_request)
            .await?;
        if !outcome.changed {
            tracing::info!(%id, %version, "incarnation already up to date");
            return Ok(UpdateResult::NothingToDo);
        }
        repo.add_all().await?;
        if !repo.has_staged_changes().await? {
            return Ok(UpdateResult::NothingToDo);
        }

        let conflicted = outcome.patch.has_conflicts();
        if conflicted && delivery == ChangeDelivery::Direct {
            tracing::warn!(%id, %version, "update conflicts, escalating to a merge request");
            repo.create_branch(&branch).await?;
            delivery = ChangeDelivery::MergeRequest;
        }

        let title = format!("Update to {version}");
        let commit_sha = repo.commit(&title).await?;
        let revision = self
            .store
            .get_latest_change(id)
            .await?
            .map(|c| c.revision + 1)
            .unwrap_or(1);
        let via_merge_request = delivery == ChangeDelivery::MergeRequest;
        let change = Change {
            incarnation_id: id,
            revision,
            change_type: if via_merge_request {
                ChangeType::MergeRequest
            } else {
                ChangeType::Direct
            },
            commit_sha,
            commit_pushed: false,
            requested_version: version.clone(),
            requested_version_hash: outcome.state.template_repository_version_hash.clone(),
            requested_data: outcome.state.template_data.clone(),
            created_at: Utc::now(),
            merge_request_id: None,
            merge_request_branch_name: via_merge_request.then(|| branch.clone()),
        };
        let push_branch = if via_merge_request { &branch } else { &default_branch };
        let change = self.record_and_push(change, repo, push_branch).await?;

        if !via_merge_request {
            tracing::info!(%id, revision, %version, "update committed directly");
            return Ok(UpdateResult::Applied(change));
        }

        let (title, description, automerge) = if conflicted {
            (
                format!("CONFLICT: {title}"),
                conflict_description(&version, target, &outcome.patch),
                false,
            )
        } else {
            (
                title,
                format!("Update `{target}` to template version `{version}`."),
                request.automerge,
            )
        };
        let change = self
            .open_merge_request(repository, change, &branch, &title, &description, automerge)
            .await?;
        Ok(UpdateResult::Applied(change))
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Record `change` unpushed, push, then mark it pushed. The record goes
    /// away again if the push fails.
    async fn record_and_push(&self, mut change: Change, repo: &GitRepository, branch: &str) -> Result<Change, ChangeError> {
        let (id, revision) = (change.incarnation_id, change.revision);
        self.store.create_change(&change).await?;

        if let Err(e) = push_with_retry(repo, branch, self.settings.push_attempts).await {
            tracing::error!(%id, revision, %branch, error = %e, "push failed, dropping change record");
            if let Err(cleanup) = self.store.delete_change(id, revision).await {
                tracing::warn!(%id, revision, error = %cleanup, "failed to drop change record");
            }
            return Err(e.into());
        }

        let head = repo.head_sha().await?;
        if head != change.commit_sha {
            self.store.update_commit_sha(id, revision, &head).await?;
            change.commit_sha = head;
        }
        self.store.update_commit_pushed(id, revision, true).await?;
        change.commit_pushed = true;
        tracing::debug!(%id, revision, sha = %change.commit_sha, "change pushed");
        Ok(change)
    }

    async fn open_merge_request(
        &self,
        repository: &str,
        mut change: Change,
        branch: &str,
        title: &str,
        description: &str,
        automerge: bool,
    ) -> Result<Change, ChangeError> {
        let merge_request = self
            .hoster
            .merge_request(repository, branch, title, description, automerge)
            .await?;
        self.store
            .set_merge_request_id(change.incarnation_id, change.revision, &merge_request.id)
            .await?;
        tracing::info!(
            id = %change.incarnation_id,
            revision = change.revision,
            merge_request = %merge_request.id,
            status = %merge_request.status,
            "merge request opened"
        );
        change.merge_request_id = Some(merge_request.id);
        Ok(change)
    }

    /// Settle change records whose push was never confirmed and that are older
    /// than `grace`.
    pub async fn reconcile_unpushed_changes(&self, grace: Duration) -> Result<UnpushedReport, ChangeError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        let mut report = UnpushedReport::default();

        for change in self.store.list_unpushed_changes().await? {
            if change.created_at > cutoff {
                continue;
            }
            let key = (change.incarnation_id, change.revision);
            let pushed = match self.store.get_incarnation(change.incarnation_id).await? {
                Some(incarnation) => {
                    self.hoster
                        .does_commit_exist(&incarnation.incarnation_repository, &change.commit_sha)
                        .await?
                }
                None => false,
            };
            if pushed {
                self.store.update_commit_pushed(key.0, key.1, true).await?;
                tracing::info!(id = %key.0, revision = key.1, "unpushed change found on hoster, marked pushed");
                report.confirmed.push(key);
            } else {
                self.store.delete_change(key.0, key.1).await?;
                tracing::warn!(id = %key.0, revision = key.1, "unpushed change never reached hoster, deleted");
                report.discarded.push(key);
            }
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn list_incarnations(&self) -> Result<Vec<Incarnation>, ChangeError> {
        Ok(self.store.list_incarnations().await?)
    }

    pub async fn get_incarnation(&self, id: IncarnationId) -> Result<Incarnation, ChangeError> {
        self.store
            .get_incarnation(id)
            .await?
            .ok_or(ChangeError::IncarnationNotFound { id })
    }

    /// Live sidecar of an incarnation on its default branch.
    pub async fn get_incarnation_state(&self, id: IncarnationId) -> Result<Option<IncarnationState>, ChangeError> {
        let incarnation = self.get_incarnation(id).await?;
        Ok(self
            .hoster
            .get_incarnation_state(&incarnation.incarnation_repository, &incarnation.target_directory)
            .await?
            .map(|(_, recorded)| recorded))
    }

    /// Forget an incarnation and its change history. The repository is untouched.
    pub async fn delete_incarnation(&self, id: IncarnationId) -> Result<(), ChangeError> {
        if self.store.delete_incarnation(id).await? {
            tracing::info!(%id, "incarnation deleted");
            Ok(())
        } else {
            Err(ChangeError::IncarnationNotFound { id })
        }
    }

    pub async fn list_changes(&self, id: IncarnationId) -> Result<Vec<Change>, ChangeError> {
        self.get_incarnation(id).await?;
        Ok(self.store.list_changes(id).await?)
    }

    pub async fn get_change(&self, id: IncarnationId, revision: u64) -> Result<Change, ChangeError> {
        self.store
            .get_change(id, revision)
            .await?
            .ok_or(ChangeError::ChangeNotFound {
                incarnation_id: id,
                revision,
            })
    }

    pub async fn get_change_with_merge_request_status(
        &self,
        id: IncarnationId,
        revision: u64,
    ) -> Result<ChangeWithMergeRequest, ChangeError> {
        let incarnation = self.get_incarnation(id).await?;
        let change = self.get_change(id, revision).await?;
        let merge_request_status = match &change.merge_request_id {
            Some(mr) => Some(
                self.hoster
                    .get_merge_request_status(&incarnation.incarnation_repository, mr)
                    .await?,
            ),
            None => None,
        };
        Ok(ChangeWithMergeRequest {
            change,
            merge_request_status,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn target_path(clone: &ClonedRepository, target: &str) -> PathBuf {
    if target == "." {
        clone.path().to_path_buf()
    } else {
        clone.path().join(target)
    }
}

/// Missing directories count as empty.
fn is_empty_dir(dir: &Path) -> Result<bool, ChangeError> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(hoster_io_err(dir, e).into()),
    }
}

/// Point an unborn HEAD at `branch` so the first commit lands there.
async fn ensure_on_branch(repo: &GitRepository, branch: &str) -> Result<(), EngineError> {
    if repo.has_commits().await? {
        if repo.current_branch().await? != branch {
            repo.checkout(branch).await?;
        }
        return Ok(());
    }
    let reference = format!("refs/heads/{branch}");
    repo.run(&["symbolic-ref", "HEAD", reference.as_str()]).await.map(|_| ())
}

fn conflict_description(version: &str, target: &str, patch: &PatchResult) -> String {
    let mut out = format!(
        "Updating `{target}` to template version `{version}` produced changes that could not be applied automatically.\n"
    );
    if !patch.conflicts.is_empty() {
        out.push_str("\nConflicting files (see the `.rej` file next to each):\n");
        for path in &patch.conflicts {
            out.push_str(&format!("- `{}`\n", path.display()));
        }
    }
    if !patch.deleted.is_empty() {
        out.push_str("\nDeleted by the template but modified in this incarnation:\n");
        for path in &patch.deleted {
            out.push_str(&format!("- `{}`\n", path.display()));
        }
    }
    out.push_str(
        "\nTo resolve: check out this branch, apply the rejected hunks by hand, \
         delete the `.rej` files (and any files listed as deleted that you no longer need), \
         then push the result. This merge request will not be merged automatically.\n",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names_embed_target_digest() {
        let digest = &hex::encode(Sha256::digest(b"."))[..7];
        assert_eq!(initialize_branch_name(".", "v1"), format!("foxops/initialize-to-{digest}-v1"));
        assert_eq!(update_branch_name("v2", "./"), format!("foxops/update-to-v2-{digest}"));
        assert_ne!(update_branch_name("v2", "a"), update_branch_name("v2", "b"));
    }

    #[test]
    fn conflict_description_lists_every_path() {
        let patch = PatchResult {
            changed: true,
            conflicts: vec![PathBuf::from("README.md")],
            deleted: vec![PathBuf::from("old.txt")],
        };
        let text = conflict_description("v2", ".", &patch);
        assert!(text.contains("- `README.md`"));
        assert!(text.contains("- `old.txt`"));
        assert!(text.contains("will not be merged automatically"));
    }

    #[test]
    fn missing_directory_counts_as_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(is_empty_dir(&tmp.path().join("nope")).unwrap());
        assert!(is_empty_dir(tmp.path()).unwrap());
        std::fs::write(tmp.path().join("f"), "").unwrap();
        assert!(!is_empty_dir(tmp.path()).unwrap());
    }
}
