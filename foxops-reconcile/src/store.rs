//! Durable incarnation and change records.
//!
//! # FileStore layout
//!
//! ```text
//! <root>/
//!   incarnations/<id>.yaml
//!   incarnations/by-target/<sha256 of repository and target>.yaml
//!   changes/<incarnation id>/<revision>.yaml
//! ```
//!
//! New records are written to a temporary sibling and hard-linked into place,
//! which fails if the target already exists; that is what makes revision and location
//! claims exclusive. Updates go through `.tmp` + rename.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use foxops_core::{Change, Incarnation, IncarnationId};

use crate::error::{store_io_err, StoreError};

#[async_trait]
pub trait Store: Send + Sync {
    /// Create an incarnation record; `(incarnation_repository, target_directory)` is unique.
    async fn create_incarnation(
        &self,
        incarnation_repository: &str,
        target_directory: &str,
        template_repository: &str,
    ) -> Result<Incarnation, StoreError>;

    async fn get_incarnation(&self, id: IncarnationId) -> Result<Option<Incarnation>, StoreError>;

    async fn find_incarnation(
        &self,
        incarnation_repository: &str,
        target_directory: &str,
    ) -> Result<Option<Incarnation>, StoreError>;

    async fn list_incarnations(&self) -> Result<Vec<Incarnation>, StoreError>;

    /// Delete an incarnation and all of its changes. `false` if it did not exist.
    async fn delete_incarnation(&self, id: IncarnationId) -> Result<bool, StoreError>;

    /// Append a change. A second claim of the same revision is a
    /// [`StoreError::ChangeConflict`].
    async fn create_change(&self, change: &Change) -> Result<(), StoreError>;

    async fn get_change(&self, id: IncarnationId, revision: u64) -> Result<Option<Change>, StoreError>;

    /// All changes of an incarnation, by ascending revision.
    async fn list_changes(&self, id: IncarnationId) -> Result<Vec<Change>, StoreError>;

    async fn get_latest_change(&self, id: IncarnationId) -> Result<Option<Change>, StoreError>;

    async fn update_commit_pushed(&self, id: IncarnationId, revision: u64, pushed: bool) -> Result<(), StoreError>;

    /// Re-point a change at a new commit, after its branch was rebased before the push.
    async fn update_commit_sha(&self, id: IncarnationId, revision: u64, commit_sha: &str) -> Result<(), StoreError>;

    async fn set_merge_request_id(
        &self,
        id: IncarnationId,
        revision: u64,
        merge_request_id: &str,
    ) -> Result<(), StoreError>;

    /// `false` if the change did not exist.
    async fn delete_change(&self, id: IncarnationId, revision: u64) -> Result<bool, StoreError>;

    /// Changes whose push was never confirmed, across all incarnations.
    async fn list_unpushed_changes(&self) -> Result<Vec<Change>, StoreError>;
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

const INCARNATIONS_DIRNAME: &str = "incarnations";
const CHANGES_DIRNAME: &str = "changes";
const BY_TARGET_DIRNAME: &str = "by-target";

/// Contents of a location claim; only its existence matters.
#[derive(Serialize)]
struct TargetClaim<'a> {
    incarnation_repository: &'a str,
    target_directory: &'a str,
}

/// [`Store`] keeping one YAML file per record.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn incarnations_dir(&self) -> PathBuf {
        self.root.join(INCARNATIONS_DIRNAME)
    }

    fn incarnation_path(&self, id: IncarnationId) -> PathBuf {
        self.incarnations_dir().join(format!("{id}.yaml"))
    }

    /// Marker that reserves `(incarnation_repository, target_directory)`.
    fn target_claim_path(&self, incarnation_repository: &str, target_directory: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(incarnation_repository.as_bytes());
        hasher.update([0u8]);
        hasher.update(target_directory.as_bytes());
        self.incarnations_dir()
            .join(BY_TARGET_DIRNAME)
            .join(format!("{}.yaml", hex::encode(hasher.finalize())))
    }

    fn changes_dir(&self, id: IncarnationId) -> PathBuf {
        self.root.join(CHANGES_DIRNAME).join(id.to_string())
    }

    fn change_path(&self, id: IncarnationId, revision: u64) -> PathBuf {
        self.changes_dir(id).join(format!("{revision}.yaml"))
    }

    /// Write the record under the next free id. The caller holds the location claim.
    fn allocate_incarnation(
        &self,
        incarnation_repository: &str,
        target_directory: &str,
        template_repository: &str,
    ) -> Result<Incarnation, StoreError> {
        let mut next = numbered_files(&self.incarnations_dir())?.last().copied().unwrap_or(0) + 1;
        loop {
            let incarnation = Incarnation {
                id: IncarnationId(next),
                incarnation_repository: incarnation_repository.to_string(),
                target_directory: target_directory.to_string(),
                template_repository: template_repository.to_string(),
                created_at: Utc::now(),
            };
            if create_record(&self.incarnation_path(incarnation.id), &incarnation)? {
                tracing::debug!(id = %incarnation.id, %incarnation_repository, %target_directory, "incarnation created");
                return Ok(incarnation);
            }
            next += 1;
        }
    }

    fn modify_change(
        &self,
        id: IncarnationId,
        revision: u64,
        edit: impl FnOnce(&mut Change),
    ) -> Result<(), StoreError> {
        let path = self.change_path(id, revision);
        let mut change: Change = read_record(&path)?.ok_or(StoreError::ChangeNotFound {
            incarnation_id: id,
            revision,
        })?;
        edit(&mut change);
        replace_record(&path, &change)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn create_incarnation(
        &self,
        incarnation_repository: &str,
        target_directory: &str,
        template_repository: &str,
    ) -> Result<Incarnation, StoreError> {
        let claim_path = self.target_claim_path(incarnation_repository, target_directory);
        let claim = TargetClaim {
            incarnation_repository,
            target_directory,
        };
        if !create_record(&claim_path, &claim)? {
            return Err(StoreError::IncarnationExists {
                incarnation_repository: incarnation_repository.to_string(),
                target_directory: target_directory.to_string(),
            });
        }

        let created = self.allocate_incarnation(incarnation_repository, target_directory, template_repository);
        if created.is_err() {
            let _ = remove_record(&claim_path);
        }
        created
    }

    async fn get_incarnation(&self, id: IncarnationId) -> Result<Option<Incarnation>, StoreError> {
        read_record(&self.incarnation_path(id))
    }

    async fn find_incarnation(
        &self,
        incarnation_repository: &str,
        target_directory: &str,
    ) -> Result<Option<Incarnation>, StoreError> {
        Ok(self.list_incarnations().await?.into_iter().find(|i| {
            i.incarnation_repository == incarnation_repository && i.target_directory == target_directory
        }))
    }

    async fn list_incarnations(&self) -> Result<Vec<Incarnation>, StoreError> {
        let mut incarnations = Vec::new();
        for id in numbered_files(&self.incarnations_dir())? {
            if let Some(incarnation) = read_record(&self.incarnation_path(IncarnationId(id)))? {
                incarnations.push(incarnation);
            }
        }
        Ok(incarnations)
    }

    async fn delete_incarnation(&self, id: IncarnationId) -> Result<bool, StoreError> {
        let changes = self.changes_dir(id);
        match std::fs::remove_dir_all(&changes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(store_io_err(&changes, e)),
        }
        let path = self.incarnation_path(id);
        if let Some(incarnation) = read_record::<Incarnation>(&path)? {
            remove_record(&self.target_claim_path(
                &incarnation.incarnation_repository,
                &incarnation.target_directory,
            ))?;
        }
        remove_record(&path)
    }

    async fn create_change(&self, change: &Change) -> Result<(), StoreError> {
        let path = self.change_path(change.incarnation_id, change.revision);
        if create_record(&path, change)? {
            Ok(())
        } else {
            Err(StoreError::ChangeConflict {
                incarnation_id: change.incarnation_id,
                revision: change.revision,
            })
        }
    }

    async fn get_change(&self, id: IncarnationId, revision: u64) -> Result<Option<Change>, StoreError> {
        read_record(&self.change_path(id, revision))
    }

    async fn list_changes(&self, id: IncarnationId) -> Result<Vec<Change>, StoreError> {
        let mut changes = Vec::new();
        for revision in numbered_files(&self.changes_dir(id))? {
            if let Some(change) = read_record(&self.change_path(id, revision))? {
                changes.push(change);
            }
        }
        Ok(changes)
    }

    async fn get_latest_change(&self, id: IncarnationId) -> Result<Option<Change>, StoreError> {
        match numbered_files(&self.changes_dir(id))?.last() {
            Some(revision) => read_record(&self.change_path(id, *revision)),
            None => Ok(None),
        }
    }

    async fn update_commit_pushed(&self, id: IncarnationId, revision: u64, pushed: bool) -> Result<(), StoreError> {
        self.modify_change(id, revision, |c| c.commit_pushed = pushed)
    }

    async fn update_commit_sha(&self, id: IncarnationId, revision: u64, commit_sha: &str) -> Result<(), StoreError> {
        self.modify_change(id, revision, |c| c.commit_sha = commit_sha.to_string())
    }

    async fn set_merge_request_id(
        &self,
        id: IncarnationId,
        revision: u64,
        merge_request_id: &str,
    ) -> Result<(), StoreError> {
        self.modify_change(id, revision, |c| {
            c.merge_request_id = Some(merge_request_id.to_string())
        })
    }

    async fn delete_change(&self, id: IncarnationId, revision: u64) -> Result<bool, StoreError> {
        remove_record(&self.change_path(id, revision))
    }

    async fn list_unpushed_changes(&self) -> Result<Vec<Change>, StoreError> {
        let mut unpushed = Vec::new();
        for id in numbered_files(&self.root.join(CHANGES_DIRNAME))? {
            unpushed.extend(
                self.list_changes(IncarnationId(id))
                    .await?
                    .into_iter()
                    .filter(|c| !c.commit_pushed),
            );
        }
        Ok(unpushed)
    }
}

// ---------------------------------------------------------------------------
// Record I/O
// ---------------------------------------------------------------------------

/// Numeric stems of the entries in `dir`, ascending. A missing directory is empty.
fn numbered_files(dir: &Path) -> Result<Vec<u64>, StoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(store_io_err(dir, e)),
    };
    let mut numbers = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| store_io_err(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let stem = name.strip_suffix(".yaml").unwrap_or(&name);
        if let Ok(n) = stem.parse::<u64>() {
            numbers.push(n);
        }
    }
    numbers.sort_unstable();
    numbers.dedup();
    Ok(numbers)
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(store_io_err(path, e)),
    };
    serde_yaml::from_str(&contents)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Write `record` to `path` only if nothing is there yet. `Ok(false)` if taken.
fn create_record<T: Serialize>(path: &Path, record: &T) -> Result<bool, StoreError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| store_io_err(dir, e))?;

    let yaml = serde_yaml::to_string(record)?;
    let staged = tempfile::NamedTempFile::new_in(dir).map_err(|e| store_io_err(dir, e))?;
    std::fs::write(staged.path(), yaml).map_err(|e| store_io_err(staged.path(), e))?;

    // The named temp file is removed when `staged` drops.
    match std::fs::hard_link(staged.path(), path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(store_io_err(path, e)),
    }
}

fn replace_record<T: Serialize>(path: &Path, record: &T) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("yaml.tmp");
    let yaml = serde_yaml::to_string(record)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| store_io_err(&tmp_path, e))?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(store_io_err(path, e));
    }
    Ok(())
}

fn remove_record(path: &Path) -> Result<bool, StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(store_io_err(path, e)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use foxops_core::{ChangeType, TemplateData};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn change(id: IncarnationId, revision: u64) -> Change {
        Change {
            incarnation_id: id,
            revision,
            change_type: ChangeType::Direct,
            commit_sha: format!("sha{revision}"),
            commit_pushed: false,
            requested_version: "v1".into(),
            requested_version_hash: "abc".into(),
            requested_data: TemplateData::new(),
            created_at: Utc::now(),
            merge_request_id: None,
            merge_request_branch_name: None,
        }
    }

    #[tokio::test]
    async fn incarnation_location_is_unique() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        let first = store.create_incarnation("svc", ".", "tpl").await.unwrap();
        let second = store.create_incarnation("svc", "sub", "tpl").await.unwrap();
        assert_eq!(first.id, IncarnationId(1));
        assert_eq!(second.id, IncarnationId(2));

        let err = store.create_incarnation("svc", ".", "tpl").await.unwrap_err();
        assert!(matches!(err, StoreError::IncarnationExists { .. }), "got: {err}");
        assert_eq!(store.find_incarnation("svc", "sub").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn concurrent_creates_of_one_location_have_one_winner() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(tmp.path()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.create_incarnation("svc", ".", "tpl").await
            }));
        }
        let mut wins = 0;
        let mut exists = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(StoreError::IncarnationExists { .. }) => exists += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((wins, exists), (1, 7));
        assert_eq!(store.list_incarnations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleted_location_can_be_reused() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        let first = store.create_incarnation("svc", ".", "tpl").await.unwrap();
        assert!(store.delete_incarnation(first.id).await.unwrap());

        let again = store.create_incarnation("svc", ".", "tpl").await.unwrap();
        assert_eq!(store.find_incarnation("svc", ".").await.unwrap(), Some(again));
    }

    #[tokio::test]
    async fn revision_can_be_claimed_once() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        let id = IncarnationId(1);
        store.create_change(&change(id, 1)).await.unwrap();
        let err = store.create_change(&change(id, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::ChangeConflict { revision: 1, .. }), "got: {err}");
    }

    #[tokio::test]
    async fn concurrent_claims_have_exactly_one_winner() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(tmp.path()));
        let id = IncarnationId(7);

        let mut handles = Vec::new();
        for n in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut c = change(id, 3);
                c.commit_sha = format!("writer{n}");
                store.create_change(&c).await
            }));
        }
        let mut wins = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => wins += 1,
                Err(StoreError::ChangeConflict { .. }) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((wins, conflicts), (1, 7));
        assert_eq!(store.list_changes(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn latest_change_and_unpushed_listing() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        let id = IncarnationId(1);
        for revision in [1, 2, 10] {
            store.create_change(&change(id, revision)).await.unwrap();
        }
        store.update_commit_pushed(id, 1, true).await.unwrap();
        store.set_merge_request_id(id, 2, "5").await.unwrap();

        assert_eq!(store.get_latest_change(id).await.unwrap().unwrap().revision, 10);
        assert_eq!(
            store.get_change(id, 2).await.unwrap().unwrap().merge_request_id.as_deref(),
            Some("5")
        );
        let unpushed: Vec<u64> = store
            .list_unpushed_changes()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.revision)
            .collect();
        assert_eq!(unpushed, vec![2, 10]);

        assert!(store.delete_change(id, 10).await.unwrap());
        assert!(!store.delete_change(id, 10).await.unwrap());
        assert_eq!(store.get_latest_change(id).await.unwrap().unwrap().revision, 2);
    }

    #[tokio::test]
    async fn updating_a_missing_change_fails() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        let err = store.update_commit_pushed(IncarnationId(1), 1, true).await.unwrap_err();
        assert!(matches!(err, StoreError::ChangeNotFound { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn deleting_an_incarnation_drops_its_changes() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        let inc = store.create_incarnation("svc", ".", "tpl").await.unwrap();
        store.create_change(&change(inc.id, 1)).await.unwrap();

        assert!(store.delete_incarnation(inc.id).await.unwrap());
        assert_eq!(store.get_incarnation(inc.id).await.unwrap(), None);
        assert!(store.list_changes(inc.id).await.unwrap().is_empty());
        assert!(!store.delete_incarnation(inc.id).await.unwrap());
    }
}
