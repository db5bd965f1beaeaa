//! foxops — render templates into incarnations and keep them up to date.
//!
//! # Usage
//!
//! ```text
//! foxops initialize <templateDir> <incarnationDir> [--data k=v]* [--template-version REF]
//! foxops update <incarnationDir> [--data k=v]* [--remove-data NAME]*
//!               [--update-repository-version REF] [--template-repository PATH]
//! foxops diff <incarnationDir>
//! ```
//!
//! Logs go to stderr; `RUST_LOG` overrides the default `info` level.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{diff::DiffArgs, initialize::InitializeArgs, update::UpdateArgs};
use foxops_engine::Engine;
use foxops_reconcile::Settings;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "foxops",
    version,
    about = "Instantiate templates into incarnations and reconcile them forward",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render a template into a fresh incarnation directory.
    Initialize(InitializeArgs),

    /// Move an incarnation to a new template version or data set.
    Update(UpdateArgs),

    /// Show how an incarnation drifted from its recorded rendering.
    Diff(DiffArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let result = run(cli);
    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "command failed");
    }
    result
}

fn run(cli: Cli) -> Result<()> {
    let settings = Settings::from_env().context("invalid FOXOPS_* environment")?;
    let engine = Engine::new(settings.git_timeout);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Commands::Initialize(args) => args.run(&engine).await,
            Commands::Update(args) => args.run(&engine).await,
            Commands::Diff(args) => args.run(&engine).await,
        }
    })
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
