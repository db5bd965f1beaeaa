//! Domain types for incarnations and their change history.
//!
//! Path-like fields that refer to locations *inside a remote repository*
//! (`target_directory`) are plain strings; local filesystem paths use `PathBuf`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Variable name → value. Values are JSON-like (scalars, lists, nested mappings).
pub type TemplateData = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Durable identifier of an incarnation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IncarnationId(pub u64);

impl fmt::Display for IncarnationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for IncarnationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How a change was delivered to the incarnation repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Committed straight onto the default branch.
    Direct,
    /// Delivered through a merge request branch.
    MergeRequest,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Direct => write!(f, "direct"),
            ChangeType::MergeRequest => write!(f, "merge_request"),
        }
    }
}

/// State of a merge request as reported by the hoster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergeRequestStatus {
    Open,
    Merged,
    Closed,
    #[default]
    Unknown,
}

impl fmt::Display for MergeRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeRequestStatus::Open => write!(f, "open"),
            MergeRequestStatus::Merged => write!(f, "merged"),
            MergeRequestStatus::Closed => write!(f, "closed"),
            MergeRequestStatus::Unknown => write!(f, "unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// Durable records
// ---------------------------------------------------------------------------

/// An incarnation: one template instantiated at one directory of one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incarnation {
    pub id: IncarnationId,
    pub incarnation_repository: String,
    /// Directory inside the incarnation repository; `"."` for the repository root.
    pub target_directory: String,
    pub template_repository: String,
    pub created_at: DateTime<Utc>,
}

/// One applied revision against an incarnation.
///
/// `(incarnation_id, revision)` is unique. `commit_pushed == false` marks a
/// record whose push has not been confirmed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub incarnation_id: IncarnationId,
    pub revision: u64,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub commit_sha: String,
    pub commit_pushed: bool,
    pub requested_version: String,
    pub requested_version_hash: String,
    #[serde(default)]
    pub requested_data: TemplateData,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_request_branch_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Transient results
// ---------------------------------------------------------------------------

/// Outcome of one diff-and-patch run against a live incarnation directory.
///
/// Paths are relative to the incarnation directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchResult {
    /// The two renderings differ (the patch was non-empty).
    pub changed: bool,
    /// Files whose template change could not be applied.
    pub conflicts: Vec<PathBuf>,
    /// Files the template deleted but which were modified in the incarnation.
    pub deleted: Vec<PathBuf>,
}

impl PatchResult {
    /// True when any path still needs a human to look at it.
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty() || !self.deleted.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(IncarnationId::from(42).to_string(), "42");
    }

    #[test]
    fn change_type_serializes_snake_case() {
        let yaml = serde_yaml::to_string(&ChangeType::MergeRequest).expect("serialize");
        assert_eq!(yaml.trim(), "merge_request");
        assert_eq!(ChangeType::Direct.to_string(), "direct");
    }

    #[test]
    fn change_serde_roundtrip_uses_type_key() {
        let change = Change {
            incarnation_id: IncarnationId(1),
            revision: 2,
            change_type: ChangeType::MergeRequest,
            commit_sha: "abc".into(),
            commit_pushed: false,
            requested_version: "v1.0.0".into(),
            requested_version_hash: "def".into(),
            requested_data: TemplateData::new(),
            created_at: Utc::now(),
            merge_request_id: Some("7".into()),
            merge_request_branch_name: Some("foxops/update-to-v1.0.0-1234567".into()),
        };
        let yaml = serde_yaml::to_string(&change).expect("serialize");
        assert!(yaml.contains("type: merge_request"), "got: {yaml}");
        let back: Change = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(back, change);
    }

    #[test]
    fn patch_result_conflict_flags() {
        assert!(!PatchResult::default().has_conflicts());
        let with_deleted = PatchResult {
            changed: true,
            conflicts: vec![],
            deleted: vec![PathBuf::from("gone.txt")],
        };
        assert!(with_deleted.has_conflicts());
    }
}
