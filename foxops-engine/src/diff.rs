//! Drift report for `foxops diff`: recorded rendering vs. live directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use similar::TextDiff;

use foxops_core::state::{self, STATE_FILENAME};
use foxops_core::data::FVARS_FILENAME;

use crate::error::{io_err, EngineError};
use crate::incarnation::Engine;

/// A single file diff, relative to the incarnation directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: PathBuf,
    pub unified_diff: String,
}

/// Render what the recorded state would produce and compare it to the live
/// content under `incarnation_dir`. Nothing under `incarnation_dir` is written.
///
/// Only files the template produces are compared; files the user added
/// alongside them are not drift.
pub async fn diff_incarnation(engine: &Engine, incarnation_dir: &Path) -> Result<Vec<FileDiff>, EngineError> {
    let recorded = state::load_at(incarnation_dir).map_err(|e| match e {
        foxops_core::StateError::StateNotFound { .. } => EngineError::NotInitialized {
            path: incarnation_dir.to_path_buf(),
        },
        other => other.into(),
    })?;

    let scratch = tempfile::TempDir::new().map_err(|e| io_err(std::env::temp_dir(), e))?;
    let rendering = scratch.path().join("rendering");
    engine.render_recorded(&recorded, &rendering).await?;

    let mut files = Vec::new();
    collect_files(&rendering, Path::new(""), &mut files)?;

    let mut diffs = Vec::new();
    for relative in files {
        if relative == Path::new(STATE_FILENAME) || relative == Path::new(FVARS_FILENAME) {
            continue;
        }
        let Some(expected) = read_text(&rendering.join(&relative))? else {
            continue;
        };
        let live = read_text(&incarnation_dir.join(&relative))?.unwrap_or_default();
        if live == expected {
            continue;
        }

        let old_header = format!("a/{}", relative.display());
        let new_header = format!("b/{}", relative.display());
        let unified = TextDiff::from_lines(&expected, &live)
            .unified_diff()
            .header(&old_header, &new_header)
            .context_radius(3)
            .to_string();

        diffs.push(FileDiff {
            path: relative,
            unified_diff: unified,
        });
    }
    Ok(diffs)
}

fn collect_files(root: &Path, relative: &Path, out: &mut Vec<PathBuf>) -> Result<(), EngineError> {
    let dir = root.join(relative);
    let mut entries = std::fs::read_dir(&dir)
        .map_err(|e| io_err(&dir, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io_err(&dir, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let rel = relative.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
        if file_type.is_dir() {
            collect_files(root, &rel, out)?;
        } else if file_type.is_file() {
            out.push(rel);
        }
    }
    Ok(())
}

/// Text content with normalized line endings; `None` for binary files,
/// empty for missing ones.
fn read_text(path: &Path) -> Result<Option<String>, EngineError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8(bytes)
            .ok()
            .map(|content| normalize_line_endings(&content))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Some(String::new())),
        Err(err) => Err(io_err(path, err)),
    }
}

fn normalize_line_endings(content: &str) -> String {
    content.replace("\r\n", "\n")
}
