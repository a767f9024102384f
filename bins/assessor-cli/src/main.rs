mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "assessor-cli")]
#[command(about = "Assessor CLI - Author catalogs, import test cases and dry-run steps", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter languages.json and sample catalog
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: String,
    },

    /// Check a catalog file for structural problems
    Validate {
        /// Catalog JSON file
        #[arg(short, long)]
        catalog: PathBuf,
    },

    /// Evaluate a local file against every test case of a step, hidden ones included
    DryRun {
        /// Catalog JSON file
        #[arg(short, long)]
        catalog: PathBuf,

        /// Step id
        #[arg(short, long)]
        step: Uuid,

        /// File holding the submission (source code, query or document)
        #[arg(short, long)]
        file: PathBuf,

        /// Language for code_executor steps (e.g. python, rust)
        #[arg(short, long)]
        language: Option<String>,

        /// Language registry used by the code sandbox
        #[arg(long, default_value = "config/languages.json")]
        languages_config: PathBuf,
    },

    /// Bulk-import test cases for a step from a JSON array of rows
    Import {
        /// Catalog JSON file
        #[arg(short, long)]
        catalog: PathBuf,

        /// Step id
        #[arg(short, long)]
        step: Uuid,

        /// JSON file holding an array of test case rows
        #[arg(short, long)]
        rows: PathBuf,

        /// Write the imported cases back into the catalog file
        #[arg(long, default_value = "false")]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => {
            commands::init_project(&path)?;
        }
        Commands::Validate { catalog } => {
            commands::validate_catalog(&catalog)?;
        }
        Commands::DryRun {
            catalog,
            step,
            file,
            language,
            languages_config,
        } => {
            commands::dry_run(&catalog, step, &file, language.as_deref(), &languages_config).await?;
        }
        Commands::Import {
            catalog,
            step,
            rows,
            write,
        } => {
            commands::import_rows(&catalog, step, &rows, write)?;
        }
    }

    Ok(())
}
