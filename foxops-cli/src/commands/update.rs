//! `foxops update <incarnationDir>`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use foxops_engine::{Engine, UpdateOutcome, UpdateRequest};

use super::{parse_data_flags, resolve_template_repository};

/// Move an incarnation to a new template version or data set.
#[derive(Args, Debug)]
pub struct UpdateArgs {
    #[arg(value_name = "INCARNATION_DIR")]
    pub incarnation_dir: PathBuf,

    /// Template variable to set or change, repeatable.
    #[arg(long = "data", short = 'd', value_name = "KEY=VALUE")]
    pub data: Vec<String>,

    /// Template variable to drop from the recorded data, repeatable.
    #[arg(long = "remove-data", value_name = "NAME")]
    pub remove_data: Vec<String>,

    /// Template ref to move to; defaults to the recorded one.
    #[arg(long = "update-repository-version", value_name = "REF")]
    pub version: Option<String>,

    /// Switch to a different template repository.
    #[arg(long = "template-repository", value_name = "PATH")]
    pub template_repository: Option<String>,
}

impl UpdateArgs {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        let template_repository = self
            .template_repository
            .as_deref()
            .map(resolve_template_repository)
            .transpose()?;
        let request = UpdateRequest {
            template_repository,
            version: self.version,
            data: parse_data_flags(&self.data)?,
            remove_data: self.remove_data,
            replace_data: false,
        };

        let outcome = engine
            .update_incarnation_from_git(&self.incarnation_dir, &request)
            .await
            .with_context(|| format!("failed to update '{}'", self.incarnation_dir.display()))?;
        print_outcome(&self.incarnation_dir, &outcome);
        Ok(())
    }
}

fn print_outcome(dir: &std::path::Path, outcome: &UpdateOutcome) {
    if !outcome.changed {
        println!("'{}' is already up to date.", dir.display());
        return;
    }
    println!(
        "{} Updated '{}' to {}",
        "✓".green(),
        dir.display(),
        outcome.state.template_repository_version
    );
    for path in &outcome.patch.conflicts {
        println!("  {} {} (see {}.rej)", "conflict".red().bold(), path.display(), path.display());
    }
    for path in &outcome.patch.deleted {
        println!(
            "  {} {} (deleted by the template, modified locally)",
            "conflict".red().bold(),
            path.display()
        );
    }
    if outcome.patch.has_conflicts() {
        tracing::warn!(
            conflicts = outcome.patch.conflicts.len(),
            deleted = outcome.patch.deleted.len(),
            "update left files for manual resolution"
        );
    }
}
