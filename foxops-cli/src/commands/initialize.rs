//! `foxops initialize <templateDir> <incarnationDir>`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use foxops_engine::Engine;

use super::{parse_data_flags, resolve_template_repository};

/// Render a template into a fresh incarnation directory.
#[derive(Args, Debug)]
pub struct InitializeArgs {
    /// Template repository: a local git checkout or a clonable URL.
    #[arg(value_name = "TEMPLATE_DIR")]
    pub template_repository: String,

    /// Directory to render into; created if missing.
    #[arg(value_name = "INCARNATION_DIR")]
    pub incarnation_dir: PathBuf,

    /// Template variable, repeatable.
    #[arg(long = "data", short = 'd', value_name = "KEY=VALUE")]
    pub data: Vec<String>,

    /// Tag, branch or commit of the template; defaults to its default branch.
    #[arg(long = "template-version", value_name = "REF")]
    pub template_version: Option<String>,
}

impl InitializeArgs {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        let template_repository = resolve_template_repository(&self.template_repository)?;
        let data = parse_data_flags(&self.data)?;
        std::fs::create_dir_all(&self.incarnation_dir)
            .with_context(|| format!("cannot create '{}'", self.incarnation_dir.display()))?;

        let state = engine
            .initialize_incarnation_from_git(
                &template_repository,
                self.template_version.as_deref(),
                &data,
                &self.incarnation_dir,
            )
            .await
            .with_context(|| format!("failed to initialize '{}'", self.incarnation_dir.display()))?;

        println!(
            "{} Initialized '{}' from {} at {}",
            "✓".green(),
            self.incarnation_dir.display(),
            state.template_repository,
            state.template_repository_version
        );
        Ok(())
    }
}
