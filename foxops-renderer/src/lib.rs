//! # foxops-renderer
//!
//! Tera-based engine that projects a template directory tree into a target
//! directory, expanding variables in paths, file contents and symlink targets.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::path::Path;
//! use foxops_core::TemplateData;
//!
//! fn render(data: &TemplateData) -> Result<(), foxops_renderer::RenderError> {
//!     foxops_renderer::render(
//!         Path::new("template"),
//!         Path::new("out"),
//!         data,
//!         &["*.png".to_string()],
//!     )
//! }
//! ```

pub mod context;
pub mod engine;
pub mod error;

pub use engine::{render, TreeRenderer};
pub use error::RenderError;
