//! Tera tree renderer — [`TreeRenderer`] and the [`render`] entry point.
//!
//! # What gets expanded
//!
//! | Entry     | Name expanded | Content expanded            |
//! |-----------|---------------|-----------------------------|
//! | Directory | yes           | n/a                         |
//! | File      | yes           | unless excluded or non-UTF-8|
//! | Symlink   | yes           | target string               |
//!
//! Permission bits are copied from the template entry, except for symlinks:
//! chmod follows the link, so a link keeps the mode it was created with.
//! The walk is depth first in sorted order so renders are deterministic.

use std::collections::HashMap;
use std::path::{Component, Path};

use glob::{MatchOptions, Pattern};
use tera::Tera;

use foxops_core::TemplateData;

use crate::context::to_tera_context;
use crate::error::{io_err, RenderError};

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Build a Tera instance with no escape hatches: no autoescaping, and the
/// environment-reading builtin replaced by one that always fails.
fn sandboxed_tera() -> Tera {
    let mut tera = Tera::default();
    tera.autoescape_on(vec![]);
    tera.register_function(
        "get_env",
        |_args: &HashMap<String, tera::Value>| -> tera::Result<tera::Value> {
            Err("get_env is not available in foxops templates".into())
        },
    );
    tera
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>, RenderError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|source| RenderError::Pattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

// ---------------------------------------------------------------------------
// TreeRenderer
// ---------------------------------------------------------------------------

/// Renders one data set into any number of target trees.
///
/// Create once per data set with [`TreeRenderer::new`] and reuse.
pub struct TreeRenderer {
    tera: Tera,
    context: tera::Context,
    excluded: Vec<Pattern>,
}

impl TreeRenderer {
    /// Construct a renderer for `data`. `content_exclude_patterns` are globs
    /// matched against paths relative to the template root.
    pub fn new(data: &TemplateData, content_exclude_patterns: &[String]) -> Result<Self, RenderError> {
        Ok(TreeRenderer {
            tera: sandboxed_tera(),
            context: to_tera_context(data)?,
            excluded: compile_patterns(content_exclude_patterns)?,
        })
    }

    /// Expand a single string. `origin` is only used for error context.
    pub fn render_str(&mut self, origin: &Path, input: &str) -> Result<String, RenderError> {
        // Tera passes plain text through unchanged; skip the parse for the common case.
        if !input.contains("{{") && !input.contains("{%") && !input.contains("{#") {
            return Ok(input.to_string());
        }
        self.tera
            .render_str(input, &self.context)
            .map_err(|source| RenderError::Template {
                path: origin.to_path_buf(),
                source,
            })
    }

    /// Whether content rendering is skipped for `relative` (template-root relative).
    pub fn is_excluded(&self, relative: &Path) -> bool {
        self.excluded
            .iter()
            .any(|p| p.matches_path_with(relative, MATCH_OPTIONS))
    }

    /// Render every entry under `template_root` into `target_dir`.
    ///
    /// Existing unrelated content in `target_dir` is left alone; rendered
    /// files overwrite same-named files.
    pub fn render_tree(&mut self, template_root: &Path, target_dir: &Path) -> Result<(), RenderError> {
        std::fs::create_dir_all(target_dir).map_err(|e| io_err(target_dir, e))?;
        self.render_dir(template_root, Path::new(""), target_dir)
    }

    fn render_dir(&mut self, root: &Path, relative: &Path, target: &Path) -> Result<(), RenderError> {
        let dir = root.join(relative);
        let mut entries = std::fs::read_dir(&dir)
            .map_err(|e| io_err(&dir, e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| io_err(&dir, e))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let source = entry.path();
            let rel = relative.join(entry.file_name());
            let meta = std::fs::symlink_metadata(&source).map_err(|e| io_err(&source, e))?;

            let name = entry.file_name().to_string_lossy().into_owned();
            let rendered_name = self.render_str(&rel, &name)?;
            check_name(&rel, &rendered_name)?;
            let dest = target.join(&rendered_name);

            if meta.file_type().is_symlink() {
                self.render_symlink(&source, &rel, &dest)?;
            } else if meta.is_dir() {
                std::fs::create_dir_all(&dest).map_err(|e| io_err(&dest, e))?;
                self.render_dir(root, &rel, &dest)?;
                copy_permissions(&meta, &dest)?;
            } else if meta.is_file() {
                self.render_file(&source, &rel, &dest)?;
                copy_permissions(&meta, &dest)?;
            } else {
                tracing::warn!(path = %source.display(), "skipping special file in template");
            }
        }
        Ok(())
    }

    fn render_file(&mut self, source: &Path, rel: &Path, dest: &Path) -> Result<(), RenderError> {
        let raw = std::fs::read(source).map_err(|e| io_err(source, e))?;
        let bytes = if self.is_excluded(rel) {
            tracing::debug!(path = %rel.display(), "content rendering excluded, copying verbatim");
            raw
        } else {
            match String::from_utf8(raw) {
                Ok(text) => self.render_str(rel, &text)?.into_bytes(),
                Err(binary) => binary.into_bytes(),
            }
        };
        remove_if_symlink(dest)?;
        std::fs::write(dest, bytes).map_err(|e| io_err(dest, e))
    }

    fn render_symlink(&mut self, source: &Path, rel: &Path, dest: &Path) -> Result<(), RenderError> {
        let link = std::fs::read_link(source).map_err(|e| io_err(source, e))?;
        let rendered = self.render_str(rel, &link.to_string_lossy())?;
        remove_if_symlink(dest)?;
        // No chmod here: it would land on the link target.
        create_symlink(&rendered, dest)
    }
}

/// Render `template_root` into `target_dir` with `data`.
pub fn render(
    template_root: &Path,
    target_dir: &Path,
    data: &TemplateData,
    content_exclude_patterns: &[String],
) -> Result<(), RenderError> {
    tracing::debug!(
        template = %template_root.display(),
        target = %target_dir.display(),
        "rendering template tree"
    );
    TreeRenderer::new(data, content_exclude_patterns)?.render_tree(template_root, target_dir)
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

fn check_name(rel: &Path, rendered: &str) -> Result<(), RenderError> {
    let mut components = Path::new(rendered).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(RenderError::InvalidName {
            path: rel.to_path_buf(),
            rendered: rendered.to_string(),
        }),
    }
}

fn remove_if_symlink(path: &Path) -> Result<(), RenderError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            std::fs::remove_file(path).map_err(|e| io_err(path, e))
        }
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn create_symlink(target: &str, dest: &Path) -> Result<(), RenderError> {
    std::os::unix::fs::symlink(target, dest).map_err(|e| io_err(dest, e))
}

#[cfg(not(unix))]
fn create_symlink(target: &str, dest: &Path) -> Result<(), RenderError> {
    Err(io_err(
        dest,
        std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("cannot create symlink to '{target}' on this platform"),
        ),
    ))
}

fn copy_permissions(meta: &std::fs::Metadata, dest: &Path) -> Result<(), RenderError> {
    std::fs::set_permissions(dest, meta.permissions()).map_err(|e| io_err(dest, e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> TemplateData {
        serde_json::from_value(json!({"name": "Jon", "age": 18})).unwrap()
    }

    #[test]
    fn renderer_new_succeeds() {
        TreeRenderer::new(&data(), &[]).expect("TreeRenderer::new");
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = TreeRenderer::new(&data(), &["[".to_string()]).err().expect("error");
        assert!(matches!(err, RenderError::Pattern { .. }), "got: {err}");
    }

    #[test]
    fn render_str_expands_variables() {
        let mut r = TreeRenderer::new(&data(), &[]).unwrap();
        let out = r.render_str(Path::new("x"), "{{ name }} is of age {{ age }}").unwrap();
        assert_eq!(out, "Jon is of age 18");
    }

    #[test]
    fn undefined_variable_fails_loudly() {
        let mut r = TreeRenderer::new(&data(), &[]).unwrap();
        let err = r.render_str(Path::new("README.md"), "{{ missing }}").unwrap_err();
        assert!(matches!(err, RenderError::Template { .. }));
        let msg = err.to_string();
        assert!(msg.contains("README.md"), "got: {msg}");
        assert!(msg.contains("missing"), "got: {msg}");
    }

    #[test]
    fn get_env_is_disabled() {
        let mut r = TreeRenderer::new(&data(), &[]).unwrap();
        let err = r
            .render_str(Path::new("x"), "{{ get_env(name=\"HOME\") }}")
            .unwrap_err();
        assert!(err.to_string().contains("get_env"), "got: {err}");
    }

    #[test]
    fn exclusion_matches_nested_paths() {
        let r = TreeRenderer::new(&data(), &["*.png".into(), "vendor/**".into()]).unwrap();
        assert!(r.is_excluded(Path::new("img/logo.png")));
        assert!(r.is_excluded(Path::new("vendor/lib/a.js")));
        assert!(!r.is_excluded(Path::new("README.md")));
    }

    #[test]
    fn names_rendering_to_paths_are_rejected() {
        assert!(check_name(Path::new("a"), "ok.txt").is_ok());
        assert!(check_name(Path::new("a"), "").is_err());
        assert!(check_name(Path::new("a"), "x/y").is_err());
        assert!(check_name(Path::new("a"), "..").is_err());
    }
}
