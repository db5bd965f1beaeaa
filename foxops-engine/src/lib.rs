//! # foxops-engine
//!
//! Local incarnation operations on top of git.
//!
//! - [`git`]: async `git` subprocess wrapper with deadlines
//! - [`patch`]: diff two renderings and patch a live directory
//! - [`incarnation`]: initialize / update one incarnation directory
//! - [`diff`]: drift between the recorded rendering and the live directory

pub mod diff;
pub mod error;
pub mod git;
pub mod incarnation;
pub mod patch;

pub use diff::{diff_incarnation, FileDiff};
pub use error::EngineError;
pub use git::{GitOutput, GitRepository, DEFAULT_GIT_TIMEOUT};
pub use incarnation::{Engine, UpdateOutcome, UpdateRequest};
pub use patch::diff_and_patch;
