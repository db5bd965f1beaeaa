//! Reconciliation: delivers incarnation changes to hosted repositories and
//! keeps a durable record of every revision.
//!
//! - [`hoster`] — the [`Hoster`] trait and the filesystem-backed [`LocalHoster`]
//! - [`store`] — the [`Store`] trait and the YAML-backed [`FileStore`]
//! - [`change`] — [`ChangeService`], the initialize / update orchestrator
//! - [`settings`] — timeouts and retry bounds, overridable from the environment

pub mod change;
mod error;
pub mod hoster;
pub mod retry;
pub mod settings;
pub mod store;

pub use change::{
    ChangeDelivery, ChangeService, ChangeWithMergeRequest, InitializeRequest, InitializeResult,
    UnpushedReport, UpdateChangeRequest, UpdateResult,
};
pub use error::{ChangeError, ErrorCategory, HosterError, StoreError};
pub use hoster::{
    ClonedRepository, Hoster, LocalHoster, MergeRequest, MergeRequestRecord, RepositoryMetadata,
};
pub use settings::Settings;
pub use store::{FileStore, Store};
