//! foxops core library — template schema, incarnation state, change records, errors.
//!
//! Public API surface:
//! - [`types`] — newtypes, durable records and [`PatchResult`]
//! - [`template`] — `fengine.yaml` schema and data validation
//! - [`data`] — data merging, `KEY=VALUE` assignments and `.fvars`
//! - [`state`] — `.fengine.yaml` sidecar load / save
//! - [`error`] — [`StateError`], [`TemplateError`]

pub mod data;
pub mod error;
pub mod state;
pub mod template;
pub mod types;

pub use error::{DataError, DataErrorKind, StateError, TemplateError};
pub use state::IncarnationState;
pub use template::{TemplateConfiguration, TemplateSchema, VariableDefinition};
pub use types::{
    Change, ChangeType, Incarnation, IncarnationId, MergeRequestStatus, PatchResult, TemplateData,
};
