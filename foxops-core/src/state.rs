//! Incarnation state sidecar (`.fengine.yaml`).
//!
//! # Storage layout
//!
//! ```text
//! <incarnation-dir>/
//!   .fengine.yaml   (owned by foxops — header warns against manual edits)
//!   ...rendered template...
//! ```
//!
//! The sidecar is replaced wholesale on every successful update; writes go to
//! a `.tmp` sibling first and are renamed into place.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{state_io_err, StateError};
use crate::types::TemplateData;

/// File name of the state sidecar inside an incarnation directory.
pub const STATE_FILENAME: &str = ".fengine.yaml";

const STATE_HEADER: &str = "\
# This file is auto-generated and owned by foxops.
# DO NOT EDIT MANUALLY.
";

/// Which template version and which data produced a rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StateDocument")]
pub struct IncarnationState {
    pub template_repository: String,
    /// Requested ref (tag, branch or commit).
    pub template_repository_version: String,
    /// Commit the ref resolved to at render time.
    pub template_repository_version_hash: String,
    /// Data the user supplied explicitly.
    pub template_data: TemplateData,
    /// Fully defaulted data actually used for rendering.
    pub template_data_full: TemplateData,
}

/// On-disk shape; older documents carry no `template_data_full`.
#[derive(Debug, Deserialize)]
struct StateDocument {
    template_repository: String,
    template_repository_version: String,
    template_repository_version_hash: String,
    #[serde(default)]
    template_data: TemplateData,
    #[serde(default)]
    template_data_full: Option<TemplateData>,
}

impl From<StateDocument> for IncarnationState {
    fn from(doc: StateDocument) -> Self {
        let template_data_full = doc
            .template_data_full
            .unwrap_or_else(|| doc.template_data.clone());
        Self {
            template_repository: doc.template_repository,
            template_repository_version: doc.template_repository_version,
            template_repository_version_hash: doc.template_repository_version_hash,
            template_data: doc.template_data,
            template_data_full,
        }
    }
}

impl IncarnationState {
    /// Serialize with the ownership header.
    pub fn to_yaml_string(&self) -> Result<String, StateError> {
        let body = serde_yaml::to_string(self)?;
        Ok(format!("{STATE_HEADER}{body}"))
    }

    /// Parse a sidecar document. `path` is only used for error context.
    pub fn from_yaml_str(contents: &str, path: &Path) -> Result<Self, StateError> {
        serde_yaml::from_str(contents).map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// `<incarnation_dir>/.fengine.yaml` — pure, no I/O.
pub fn state_path(incarnation_dir: &Path) -> PathBuf {
    incarnation_dir.join(STATE_FILENAME)
}

/// Whether a state sidecar exists in `incarnation_dir`.
pub fn exists_at(incarnation_dir: &Path) -> bool {
    state_path(incarnation_dir).is_file()
}

/// Load the state sidecar.
///
/// Returns `StateError::StateNotFound` if absent,
/// `StateError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(incarnation_dir: &Path) -> Result<IncarnationState, StateError> {
    let path = state_path(incarnation_dir);
    if !path.exists() {
        return Err(StateError::StateNotFound { path });
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| state_io_err(&path, e))?;
    IncarnationState::from_yaml_str(&contents, &path)
}

/// Like [`load_at`], but an absent sidecar is `Ok(None)`.
pub fn try_load_at(incarnation_dir: &Path) -> Result<Option<IncarnationState>, StateError> {
    match load_at(incarnation_dir) {
        Ok(state) => Ok(Some(state)),
        Err(StateError::StateNotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Atomically write the state sidecar.
///
/// Write flow: serialize → `.fengine.yaml.tmp` sibling → `rename`.
pub fn save_at(incarnation_dir: &Path, state: &IncarnationState) -> Result<(), StateError> {
    std::fs::create_dir_all(incarnation_dir).map_err(|e| state_io_err(incarnation_dir, e))?;
    let path = state_path(incarnation_dir);
    let tmp_path = path.with_file_name(format!("{STATE_FILENAME}.tmp"));

    let yaml = state.to_yaml_string()?;
    std::fs::write(&tmp_path, yaml).map_err(|e| state_io_err(&tmp_path, e))?;
    if let Err(e) = std::fs::rename(&tmp_path, &path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(state_io_err(&path, e));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_state() -> IncarnationState {
        let data: TemplateData = serde_json::from_value(json!({"name": "Jon"})).unwrap();
        let full: TemplateData = serde_json::from_value(json!({"name": "Jon", "age": 18})).unwrap();
        IncarnationState {
            template_repository: "https://example.com/template.git".into(),
            template_repository_version: "v1.0.0".into(),
            template_repository_version_hash: "0123456789abcdef".into(),
            template_data: data,
            template_data_full: full,
        }
    }

    #[test]
    fn written_file_starts_with_header() {
        let tmp = TempDir::new().unwrap();
        save_at(tmp.path(), &sample_state()).unwrap();
        let raw = std::fs::read_to_string(state_path(tmp.path())).unwrap();
        assert!(raw.starts_with("# This file is auto-generated and owned by foxops."));
        assert!(raw.contains("DO NOT EDIT MANUALLY"));
    }

    #[test]
    fn save_then_load_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let state = sample_state();
        save_at(tmp.path(), &state).unwrap();
        assert_eq!(load_at(tmp.path()).unwrap(), state);
    }

    #[test]
    fn tmp_file_removed_after_save() {
        let tmp = TempDir::new().unwrap();
        save_at(tmp.path(), &sample_state()).unwrap();
        let tmp_path = tmp.path().join(format!("{STATE_FILENAME}.tmp"));
        assert!(!tmp_path.exists());
    }

    #[test]
    fn missing_state_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(try_load_at(tmp.path()).unwrap().is_none());
        assert!(matches!(
            load_at(tmp.path()),
            Err(StateError::StateNotFound { .. })
        ));
    }
}
