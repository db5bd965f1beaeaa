//! Three-way template update: diff two renderings, patch the live tree.
//!
//! # Algorithm
//!
//! 1. Commit the old and new renderings as two siblings on top of an empty
//!    root commit in a throwaway repository.
//! 2. `git diff --binary --full-index -M` between them (renames detected).
//! 3. Apply the patch to the live directory one file section at a time with
//!    `git apply --reject`, so every hunk that fits lands and the rest are
//!    written out as `.rej` files.
//! 4. Sort rejected sections into resolved (live already equals the new
//!    rendering), `conflicts` and `deleted`.
//!
//! All paths in the returned [`PatchResult`] are relative to the live directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use foxops_core::PatchResult;

use crate::error::{io_err, EngineError};
use crate::git::{run_git, GitRepository};

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Diff `old` against `new` and apply the result to `target`.
///
/// `old` and `new` are complete renderings; neither is modified.
pub async fn diff_and_patch(
    old: &Path,
    new: &Path,
    target: &Path,
    timeout: Duration,
) -> Result<PatchResult, EngineError> {
    let scratch = tempfile::TempDir::new().map_err(|e| io_err(std::env::temp_dir(), e))?;
    let patch = compute_patch(old, new, scratch.path(), timeout).await?;
    if patch.is_empty() {
        tracing::debug!(target = %target.display(), "renderings are identical, nothing to apply");
        return Ok(PatchResult::default());
    }

    let sections = split_sections(&patch);
    tracing::debug!(files = sections.len(), target = %target.display(), "applying template patch");

    let place = ApplyPlace::locate(target, timeout).await?;
    let patch_dir = scratch.path().join("sections");
    std::fs::create_dir_all(&patch_dir).map_err(|e| io_err(&patch_dir, e))?;

    let mut result = PatchResult {
        changed: true,
        ..PatchResult::default()
    };

    for (index, section) in sections.iter().enumerate() {
        let file = patch_dir.join(format!("{index:05}.patch"));
        std::fs::write(&file, &section.body).map_err(|e| io_err(&file, e))?;
        if place.apply(&file, timeout).await? {
            continue;
        }
        classify_rejection(section, new, target, &mut result)?;
    }

    result.conflicts.sort();
    result.conflicts.dedup();
    result.deleted.sort();
    result.deleted.dedup();

    if result.has_conflicts() {
        tracing::warn!(
            conflicts = result.conflicts.len(),
            deleted = result.deleted.len(),
            "template patch left paths for manual resolution"
        );
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Synthetic history
// ---------------------------------------------------------------------------

/// Build the throwaway history under `scratch` and return the binary patch bytes.
async fn compute_patch(
    old: &Path,
    new: &Path,
    scratch: &Path,
    timeout: Duration,
) -> Result<Vec<u8>, EngineError> {
    let repo = GitRepository::init(&scratch.join("history"), false, timeout).await?;

    let empty_tree = repo.run_unchecked(&["mktree"], Some(&[][..])).await?;
    let empty_tree = empty_tree.stdout.trim().to_string();
    let root = repo
        .run(&["commit-tree", empty_tree.as_str(), "-m", "root"])
        .await?
        .stdout
        .trim()
        .to_string();

    let old_commit = snapshot(&repo, old, &root, "old rendering").await?;
    let new_commit = snapshot(&repo, new, &root, "new rendering").await?;

    let patch_file = scratch.join("template.patch");
    let output = format!("--output={}", patch_file.display());
    repo.run(&[
        "diff",
        "--binary",
        "--full-index",
        "-M",
        output.as_str(),
        old_commit.as_str(),
        new_commit.as_str(),
    ])
    .await?;
    match std::fs::read(&patch_file) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(io_err(&patch_file, e)),
    }
}

/// Commit the contents of `tree` as a child of `parent`; returns the commit id.
async fn snapshot(
    repo: &GitRepository,
    tree: &Path,
    parent: &str,
    message: &str,
) -> Result<String, EngineError> {
    repo.run(&["read-tree", "--empty"]).await?;

    let git_dir = format!("--git-dir={}", repo.dir().join(".git").display());
    let work_tree = format!("--work-tree={}", tree.display());
    let args = [git_dir.as_str(), work_tree.as_str(), "add", "--all", "--force"];
    let out = run_git(tree, &args, None, repo.timeout()).await?;
    if !out.success() {
        return Err(EngineError::Git {
            command: args.join(" "),
            code: out.code,
            stdout: out.stdout,
            stderr: out.stderr,
        });
    }

    let tree_id = repo.run(&["write-tree"]).await?.stdout.trim().to_string();
    let commit = repo
        .run(&["commit-tree", tree_id.as_str(), "-p", parent, "-m", message])
        .await?;
    Ok(commit.stdout.trim().to_string())
}

// ---------------------------------------------------------------------------
// Applying
// ---------------------------------------------------------------------------

/// Where `git apply` must run so that patch paths land in the live directory.
///
/// Inside a repository git resolves patch paths against the top level, so the
/// command runs there with `--directory=<relative target>`.
struct ApplyPlace {
    cwd: PathBuf,
    directory: Option<String>,
}

impl ApplyPlace {
    async fn locate(target: &Path, timeout: Duration) -> Result<Self, EngineError> {
        let outside = Self {
            cwd: target.to_path_buf(),
            directory: None,
        };
        let Some(toplevel) = GitRepository::toplevel_of(target, timeout).await? else {
            return Ok(outside);
        };
        let target_real = target.canonicalize().map_err(|e| io_err(target, e))?;
        let top_real = toplevel.canonicalize().map_err(|e| io_err(&toplevel, e))?;
        let Ok(relative) = target_real.strip_prefix(&top_real) else {
            return Ok(outside);
        };
        let directory = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(Self {
            cwd: top_real,
            directory: (!directory.is_empty()).then_some(directory),
        })
    }

    /// Apply one section; `false` when git rejected some or all of it.
    async fn apply(&self, patch_file: &Path, timeout: Duration) -> Result<bool, EngineError> {
        let directory = self.directory.as_ref().map(|d| format!("--directory={d}"));
        let file = patch_file.to_string_lossy().into_owned();
        let mut args = vec!["apply", "--reject", "--verbose", "--whitespace=nowarn"];
        if let Some(directory) = directory.as_deref() {
            args.push(directory);
        }
        args.push(file.as_str());

        let out = run_git(&self.cwd, &args, None, timeout).await?;
        if out.success() {
            return Ok(true);
        }
        tracing::debug!(stderr = %out.stderr.trim(), "section rejected");
        Ok(false)
    }
}

fn classify_rejection(
    section: &FileSection,
    new: &Path,
    target: &Path,
    result: &mut PatchResult,
) -> Result<(), EngineError> {
    match (section.kind, &section.new_path, &section.old_path) {
        (SectionKind::Deleted, _, Some(old_path)) => {
            if std::fs::symlink_metadata(target.join(old_path)).is_err() {
                tracing::debug!(path = %old_path.display(), "deleted file already gone");
                return Ok(());
            }
            result.deleted.push(old_path.clone());
        }
        (_, Some(new_path), _) => {
            if same_entry(&new.join(new_path), &target.join(new_path))? {
                tracing::debug!(path = %new_path.display(), "rejection is spurious, live content already matches");
                remove_reject_file(target, new_path)?;
                if let Some(old_path) = &section.old_path {
                    remove_reject_file(target, old_path)?;
                }
                return Ok(());
            }
            result.conflicts.push(new_path.clone());
        }
        (_, None, None) => {
            tracing::warn!("rejected patch section without a path");
        }
        (_, None, Some(old_path)) => result.conflicts.push(old_path.clone()),
    }
    Ok(())
}

/// Byte-equality of two entries; symlinks compare by target.
fn same_entry(expected: &Path, live: &Path) -> Result<bool, EngineError> {
    let (Ok(want), Ok(have)) = (
        std::fs::symlink_metadata(expected),
        std::fs::symlink_metadata(live),
    ) else {
        return Ok(false);
    };
    match (want.file_type().is_symlink(), have.file_type().is_symlink()) {
        (true, true) => {
            let a = std::fs::read_link(expected).map_err(|e| io_err(expected, e))?;
            let b = std::fs::read_link(live).map_err(|e| io_err(live, e))?;
            Ok(a == b)
        }
        (false, false) if want.is_file() && have.is_file() => {
            let a = std::fs::read(expected).map_err(|e| io_err(expected, e))?;
            let b = std::fs::read(live).map_err(|e| io_err(live, e))?;
            Ok(a == b)
        }
        _ => Ok(false),
    }
}

fn remove_reject_file(target: &Path, relative: &Path) -> Result<(), EngineError> {
    let mut name = relative.as_os_str().to_owned();
    name.push(".rej");
    let rej = target.join(name);
    match std::fs::remove_file(&rej) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(&rej, e)),
    }
}

// ---------------------------------------------------------------------------
// Patch parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Added,
    Deleted,
    Renamed,
    Modified,
}

/// One `diff --git` block of a multi-file patch.
#[derive(Debug, Clone)]
struct FileSection {
    kind: SectionKind,
    old_path: Option<PathBuf>,
    new_path: Option<PathBuf>,
    body: Vec<u8>,
}

fn split_sections(patch: &[u8]) -> Vec<FileSection> {
    let mut bodies: Vec<Vec<u8>> = Vec::new();
    for line in patch.split_inclusive(|b| *b == b'\n') {
        if line.starts_with(b"diff --git ") || bodies.is_empty() {
            bodies.push(Vec::new());
        }
        if let Some(body) = bodies.last_mut() {
            body.extend_from_slice(line);
        }
    }
    bodies
        .into_iter()
        .filter(|b| b.starts_with(b"diff --git "))
        .map(parse_section)
        .collect()
}

fn parse_section(body: Vec<u8>) -> FileSection {
    let mut kind = SectionKind::Modified;
    let mut old_path = None;
    let mut new_path = None;
    let mut rename_from = None;
    let mut rename_to = None;
    let mut first_line = String::new();

    for (i, raw) in body.split(|b| *b == b'\n').enumerate() {
        if raw.starts_with(b"@@") || raw.starts_with(b"GIT binary patch") {
            break;
        }
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        if i == 0 {
            first_line = line.to_string();
        } else if line.starts_with("new file mode") {
            kind = SectionKind::Added;
        } else if line.starts_with("deleted file mode") {
            kind = SectionKind::Deleted;
        } else if let Some(p) = line.strip_prefix("rename from ") {
            rename_from = Some(unquote(p));
        } else if let Some(p) = line.strip_prefix("rename to ") {
            rename_to = Some(unquote(p));
        } else if let Some(p) = line.strip_prefix("--- ") {
            old_path = header_path(p, "a/");
        } else if let Some(p) = line.strip_prefix("+++ ") {
            new_path = header_path(p, "b/");
        }
    }

    if rename_from.is_some() || rename_to.is_some() {
        kind = SectionKind::Renamed;
        old_path = rename_from.or(old_path);
        new_path = rename_to.or(new_path);
    }

    // Binary and mode-only sections carry no ---/+++ lines; fall back to the
    // `diff --git a/X b/X` header, where both halves are the same path.
    if old_path.is_none() && new_path.is_none() {
        let both = git_header_path(&first_line);
        match kind {
            SectionKind::Added => new_path = both,
            SectionKind::Deleted => old_path = both,
            _ => {
                old_path = both.clone();
                new_path = both;
            }
        }
    }

    FileSection {
        kind,
        old_path: old_path.map(PathBuf::from),
        new_path: new_path.map(PathBuf::from),
        body,
    }
}

fn header_path(raw: &str, prefix: &str) -> Option<String> {
    // git appends a tab after names containing spaces.
    let raw = raw.trim_end_matches('\t');
    if raw == "/dev/null" {
        return None;
    }
    let path = unquote(raw);
    Some(path.strip_prefix(prefix).map(str::to_string).unwrap_or(path))
}

fn git_header_path(line: &str) -> Option<String> {
    let rest = line.strip_prefix("diff --git ")?;
    if rest.starts_with('"') {
        let (a, _) = split_quoted(rest)?;
        return a.strip_prefix("a/").map(str::to_string);
    }
    // "a/X b/X": both halves have equal length.
    if rest.len() < 5 || rest.len() % 2 == 0 {
        return None;
    }
    let half = (rest.len() - 1) / 2;
    rest.get(..half)?.strip_prefix("a/").map(str::to_string)
}

fn split_quoted(s: &str) -> Option<(String, &str)> {
    let mut escaped = false;
    for (i, c) in s.char_indices().skip(1) {
        match c {
            '\\' if !escaped => escaped = true,
            '"' if !escaped => return Some((unquote(&s[..=i]), &s[i + 1..])),
            _ => escaped = false,
        }
    }
    None
}

/// Undo git's C-style quoting of unusual path names.
fn unquote(raw: &str) -> String {
    let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) else {
        return raw.to_string();
    };
    let mut bytes = Vec::with_capacity(inner.len());
    let mut chars = inner.bytes().peekable();
    while let Some(b) = chars.next() {
        if b != b'\\' {
            bytes.push(b);
            continue;
        }
        match chars.next() {
            Some(b'n') => bytes.push(b'\n'),
            Some(b't') => bytes.push(b'\t'),
            Some(b'"') => bytes.push(b'"'),
            Some(b'\\') => bytes.push(b'\\'),
            Some(d @ b'0'..=b'7') => {
                let mut value = u32::from(d - b'0');
                for _ in 0..2 {
                    match chars.peek() {
                        Some(n @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(*n - b'0');
                            chars.next();
                        }
                        _ => break,
                    }
                }
                bytes.push(value as u8);
            }
            Some(other) => bytes.push(other),
            None => bytes.push(b'\\'),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const T: Duration = Duration::from_secs(30);

    const SAMPLE: &str = "\
diff --git a/README.md b/README.md
index 1111111111111111111111111111111111111111..2222222222222222222222222222222222222222 100644
--- a/README.md
+++ b/README.md
@@ -1 +1 @@
-old
+new
diff --git a/gone.txt b/gone.txt
deleted file mode 100644
index 3333333333333333333333333333333333333333..0000000000000000000000000000000000000000
--- a/gone.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
diff --git a/src/a.rs b/src/b.rs
similarity index 90%
rename from src/a.rs
rename to src/b.rs
diff --git a/logo.png b/logo.png
new file mode 100644
index 0000000000000000000000000000000000000000..4444444444444444444444444444444444444444
GIT binary patch
literal 3
KcmZ>Y%wPZj00IC2

literal 0
HcmV?d00001

";

    #[test]
    fn sections_are_split_and_classified() {
        let sections = split_sections(SAMPLE.as_bytes());
        assert_eq!(sections.len(), 4);

        assert_eq!(sections[0].kind, SectionKind::Modified);
        assert_eq!(sections[0].new_path.as_deref(), Some(Path::new("README.md")));

        assert_eq!(sections[1].kind, SectionKind::Deleted);
        assert_eq!(sections[1].old_path.as_deref(), Some(Path::new("gone.txt")));
        assert_eq!(sections[1].new_path, None);

        assert_eq!(sections[2].kind, SectionKind::Renamed);
        assert_eq!(sections[2].old_path.as_deref(), Some(Path::new("src/a.rs")));
        assert_eq!(sections[2].new_path.as_deref(), Some(Path::new("src/b.rs")));

        assert_eq!(sections[3].kind, SectionKind::Added);
        assert_eq!(sections[3].new_path.as_deref(), Some(Path::new("logo.png")));
        assert!(sections[3].body.ends_with(b"\n\n"));
    }

    #[test]
    fn quoted_and_spaced_names() {
        assert_eq!(unquote("\"caf\\303\\251.txt\""), "café.txt");
        assert_eq!(header_path("a/with space.txt\t", "a/").as_deref(), Some("with space.txt"));
        assert_eq!(
            git_header_path("diff --git a/with space b/with space").as_deref(),
            Some("with space")
        );
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    struct Trees {
        _tmp: TempDir,
        old: PathBuf,
        new: PathBuf,
        live: PathBuf,
    }

    fn trees() -> Trees {
        let tmp = TempDir::new().unwrap();
        let old = tmp.path().join("old");
        let new = tmp.path().join("new");
        let live = tmp.path().join("live");
        for d in [&old, &new, &live] {
            fs::create_dir_all(d).unwrap();
        }
        Trees {
            old,
            new,
            live,
            _tmp: tmp,
        }
    }

    #[tokio::test]
    async fn identical_renderings_change_nothing() {
        let t = trees();
        for d in [&t.old, &t.new, &t.live] {
            write(d, "a.txt", "same\n");
        }
        let result = diff_and_patch(&t.old, &t.new, &t.live, T).await.unwrap();
        assert_eq!(result, PatchResult::default());
    }

    #[tokio::test]
    async fn clean_update_keeps_local_edits_elsewhere() {
        let t = trees();
        write(&t.old, "a.txt", "one\ntwo\nthree\nfour\nfive\nsix\nseven\n");
        write(&t.new, "a.txt", "one\ntwo\nthree\nfour\nfive\nsix\nSEVEN\n");
        write(&t.live, "a.txt", "ONE\ntwo\nthree\nfour\nfive\nsix\nseven\n");
        write(&t.new, "added.txt", "hello\n");

        let result = diff_and_patch(&t.old, &t.new, &t.live, T).await.unwrap();
        assert!(result.changed);
        assert!(!result.has_conflicts(), "{result:?}");
        assert_eq!(
            fs::read_to_string(t.live.join("a.txt")).unwrap(),
            "ONE\ntwo\nthree\nfour\nfive\nsix\nSEVEN\n"
        );
        assert_eq!(fs::read_to_string(t.live.join("added.txt")).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn identical_manual_edit_is_not_a_conflict() {
        let t = trees();
        write(&t.old, "a.txt", "v1\n");
        write(&t.new, "a.txt", "v2\n");
        write(&t.live, "a.txt", "v2\n");

        let result = diff_and_patch(&t.old, &t.new, &t.live, T).await.unwrap();
        assert!(result.changed);
        assert!(result.conflicts.is_empty(), "{result:?}");
        assert!(!t.live.join("a.txt.rej").exists());
    }

    #[tokio::test]
    async fn overlapping_edit_is_a_conflict() {
        let t = trees();
        write(&t.old, "a.txt", "v1\n");
        write(&t.new, "a.txt", "v2\n");
        write(&t.live, "a.txt", "mine\n");

        let result = diff_and_patch(&t.old, &t.new, &t.live, T).await.unwrap();
        assert_eq!(result.conflicts, vec![PathBuf::from("a.txt")]);
        assert!(t.live.join("a.txt.rej").exists());
        assert_eq!(fs::read_to_string(t.live.join("a.txt")).unwrap(), "mine\n");
    }

    #[tokio::test]
    async fn deleting_a_modified_file_is_reported() {
        let t = trees();
        write(&t.old, "gone.txt", "template\n");
        write(&t.live, "gone.txt", "customised\n");

        let result = diff_and_patch(&t.old, &t.new, &t.live, T).await.unwrap();
        assert_eq!(result.deleted, vec![PathBuf::from("gone.txt")]);
        assert!(t.live.join("gone.txt").exists());
    }

    #[tokio::test]
    async fn deleting_an_already_removed_file_is_fine() {
        let t = trees();
        write(&t.old, "gone.txt", "template\n");

        let result = diff_and_patch(&t.old, &t.new, &t.live, T).await.unwrap();
        assert!(result.changed);
        assert!(!result.has_conflicts(), "{result:?}");
    }
}
