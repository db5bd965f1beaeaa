//! `foxops diff <incarnationDir>` — drift between the recorded rendering and the directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use foxops_engine::{diff_incarnation, Engine};

/// Arguments for `foxops diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    #[arg(value_name = "INCARNATION_DIR")]
    pub incarnation_dir: PathBuf,
}

impl DiffArgs {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        let diffs = diff_incarnation(engine, &self.incarnation_dir)
            .await
            .with_context(|| format!("diff failed for '{}'", self.incarnation_dir.display()))?;

        if diffs.is_empty() {
            println!("No differences for '{}'.", self.incarnation_dir.display());
            return Ok(());
        }

        for diff in diffs {
            print!("{}", diff.unified_diff);
            if !diff.unified_diff.ends_with('\n') {
                println!();
            }
        }

        Ok(())
    }
}
