//! Local initialize / update of one incarnation directory.
//!
//! These operations touch only the local filesystem and the template
//! repository; committing and delivering the result is left to the caller.

use std::path::Path;
use std::time::Duration;

use foxops_core::data::{merge_data, parse_fvars, with_fvars, FVARS_FILENAME};
use foxops_core::template::template_dir;
use foxops_core::{state, IncarnationState, PatchResult, StateError, TemplateConfiguration, TemplateData};

use crate::error::{io_err, template_clone_err, EngineError};
use crate::git::{GitRepository, DEFAULT_GIT_TIMEOUT};
use crate::patch::diff_and_patch;

/// What to change on an existing incarnation. Unset fields keep the recorded value.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub template_repository: Option<String>,
    /// Template ref to move to; `None` re-resolves the recorded ref.
    pub version: Option<String>,
    pub data: TemplateData,
    /// Keys dropped from the recorded data before `data` is applied.
    pub remove_data: Vec<String>,
    /// Replace the recorded data with `data` instead of merging over it.
    pub replace_data: bool,
}

#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// The patch touched files or the recorded state moved.
    pub changed: bool,
    pub state: IncarnationState,
    pub patch: PatchResult,
}

/// Runs incarnation operations with a fixed git timeout.
#[derive(Debug, Clone, Copy)]
pub struct Engine {
    git_timeout: Duration,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(DEFAULT_GIT_TIMEOUT)
    }
}

impl Engine {
    pub fn new(git_timeout: Duration) -> Self {
        Self { git_timeout }
    }

    pub fn git_timeout(&self) -> Duration {
        self.git_timeout
    }

    // -----------------------------------------------------------------------
    // Initialize
    // -----------------------------------------------------------------------

    /// Render an already checked-out template into `incarnation_dir` and
    /// write the state sidecar.
    pub fn initialize_incarnation(
        &self,
        template_root: &Path,
        template_repository: &str,
        version: &str,
        version_hash: &str,
        data: &TemplateData,
        incarnation_dir: &Path,
    ) -> Result<IncarnationState, EngineError> {
        if state::exists_at(incarnation_dir) {
            return Err(EngineError::AlreadyInitialized {
                path: incarnation_dir.to_path_buf(),
            });
        }

        let config = TemplateConfiguration::load_at(template_root)?;
        let full = config.validate_data(&with_fvars(&read_fvars(incarnation_dir)?, data))?;

        foxops_renderer::render(
            &template_dir(template_root),
            incarnation_dir,
            &full,
            &config.rendering.excluded_files,
        )?;

        let state = IncarnationState {
            template_repository: template_repository.to_string(),
            template_repository_version: version.to_string(),
            template_repository_version_hash: version_hash.to_string(),
            template_data: data.clone(),
            template_data_full: full,
        };
        state::save_at(incarnation_dir, &state)?;

        tracing::info!(
            dir = %incarnation_dir.display(),
            template = %template_repository,
            version = %version,
            "incarnation initialized"
        );
        Ok(state)
    }

    /// Clone `template_repository` at `version` (default branch when `None`)
    /// and initialize `incarnation_dir` from it.
    pub async fn initialize_incarnation_from_git(
        &self,
        template_repository: &str,
        version: Option<&str>,
        data: &TemplateData,
        incarnation_dir: &Path,
    ) -> Result<IncarnationState, EngineError> {
        if state::exists_at(incarnation_dir) {
            return Err(EngineError::AlreadyInitialized {
                path: incarnation_dir.to_path_buf(),
            });
        }

        let scratch = scratch_dir()?;
        let checkout = scratch.path().join("template");
        let repo = GitRepository::clone_from(template_repository, &checkout, version, true, self.git_timeout)
            .await
            .map_err(|e| template_clone_err(template_repository, e))?;
        let hash = repo.head_sha().await?;
        let version = match version {
            Some(v) => v.to_string(),
            None => repo.current_branch().await?,
        };

        self.initialize_incarnation(&checkout, template_repository, &version, &hash, data, incarnation_dir)
    }

    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    /// Move `incarnation_dir` to a new template version and/or data set,
    /// keeping local edits where the template change does not touch them.
    pub async fn update_incarnation_from_git(
        &self,
        incarnation_dir: &Path,
        request: &UpdateRequest,
    ) -> Result<UpdateOutcome, EngineError> {
        let old_state = load_state(incarnation_dir)?;

        let template_repository = request
            .template_repository
            .clone()
            .unwrap_or_else(|| old_state.template_repository.clone());
        let version = request
            .version
            .clone()
            .unwrap_or_else(|| old_state.template_repository_version.clone());
        // `.fvars` feeds the rendering but is never recorded as explicit data.
        let data = requested_data(&old_state.template_data, request);
        let fvars = read_fvars(incarnation_dir)?;

        let scratch = scratch_dir()?;

        let new_checkout = scratch.path().join("template-new");
        let new_repo = GitRepository::clone_from(
            &template_repository,
            &new_checkout,
            Some(&version),
            true,
            self.git_timeout,
        )
        .await
        .map_err(|e| template_clone_err(&template_repository, e))?;
        let new_hash = new_repo.head_sha().await?;

        let old_checkout = if template_repository == old_state.template_repository
            && new_hash == old_state.template_repository_version_hash
        {
            new_checkout.clone()
        } else {
            let dest = scratch.path().join("template-old");
            self.checkout_recorded(&old_state, &dest).await?;
            dest
        };

        let old_rendering = scratch.path().join("old");
        render_checkout(&old_checkout, &old_state.template_data_full, &old_rendering)?;

        let new_config = TemplateConfiguration::load_at(&new_checkout)?;
        let full = new_config.validate_data(&with_fvars(&fvars, &data))?;
        let new_rendering = scratch.path().join("new");
        std::fs::create_dir_all(&new_rendering).map_err(|e| io_err(&new_rendering, e))?;
        foxops_renderer::render(
            &template_dir(&new_checkout),
            &new_rendering,
            &full,
            &new_config.rendering.excluded_files,
        )?;

        let patch = diff_and_patch(&old_rendering, &new_rendering, incarnation_dir, self.git_timeout).await?;

        let state = IncarnationState {
            template_repository,
            template_repository_version: version,
            template_repository_version_hash: new_hash,
            template_data: data,
            template_data_full: full,
        };
        let changed = patch.changed || state != old_state;
        if changed {
            state::save_at(incarnation_dir, &state)?;
        }

        tracing::info!(
            dir = %incarnation_dir.display(),
            version = %state.template_repository_version,
            changed,
            conflicts = patch.conflicts.len(),
            deleted = patch.deleted.len(),
            "incarnation updated"
        );
        Ok(UpdateOutcome {
            changed,
            state,
            patch,
        })
    }

    // -----------------------------------------------------------------------
    // Recorded rendering
    // -----------------------------------------------------------------------

    /// Render exactly what the recorded state produced into `dest`.
    pub async fn render_recorded(&self, recorded: &IncarnationState, dest: &Path) -> Result<(), EngineError> {
        let scratch = scratch_dir()?;
        let checkout = scratch.path().join("template");
        self.checkout_recorded(recorded, &checkout).await?;
        render_checkout(&checkout, &recorded.template_data_full, dest)
    }

    /// Clone the recorded template repository at the recorded commit.
    async fn checkout_recorded(&self, recorded: &IncarnationState, dest: &Path) -> Result<(), EngineError> {
        let url = &recorded.template_repository;
        let hash = &recorded.template_repository_version_hash;
        let unreproducible = |reason: String| EngineError::Reproduction {
            template_repository: url.clone(),
            version_hash: hash.clone(),
            reason,
        };

        let repo = GitRepository::clone_from(url, dest, None, false, self.git_timeout)
            .await
            .map_err(|e| unreproducible(e.to_string()))?;
        if !repo.commit_exists(hash).await? {
            return Err(unreproducible("commit no longer exists in the template repository".into()));
        }
        repo.checkout(hash).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn scratch_dir() -> Result<tempfile::TempDir, EngineError> {
    tempfile::Builder::new()
        .prefix("foxops-")
        .tempdir()
        .map_err(|e| io_err(std::env::temp_dir(), e))
}

fn load_state(incarnation_dir: &Path) -> Result<IncarnationState, EngineError> {
    state::load_at(incarnation_dir).map_err(|e| match e {
        StateError::StateNotFound { .. } => EngineError::NotInitialized {
            path: incarnation_dir.to_path_buf(),
        },
        other => other.into(),
    })
}

/// Recorded data with the request applied: removals first, then merge or replace.
fn requested_data(recorded: &TemplateData, request: &UpdateRequest) -> TemplateData {
    if request.replace_data {
        return request.data.clone();
    }
    let mut base = recorded.clone();
    for key in &request.remove_data {
        base.remove(key);
    }
    merge_data(&base, &request.data)
}

/// `.fvars` from the incarnation directory, or nothing.
pub fn read_fvars(incarnation_dir: &Path) -> Result<TemplateData, EngineError> {
    let path = incarnation_dir.join(FVARS_FILENAME);
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(parse_fvars(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TemplateData::new()),
        Err(e) => Err(io_err(&path, e)),
    }
}

/// Render a template checkout with already-complete data; no validation.
fn render_checkout(checkout: &Path, full: &TemplateData, dest: &Path) -> Result<(), EngineError> {
    let config = TemplateConfiguration::load_at(checkout)?;
    std::fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;
    foxops_renderer::render(&template_dir(checkout), dest, full, &config.rendering.excluded_files)?;
    Ok(())
}
