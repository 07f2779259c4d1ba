//! contextd CLI
//!
//! Command-line tools for contextd journals.
//!
//! # Commands
//!
//! - `verify` - Check record framing and the digest chain
//! - `dump` - Print journal entries
//! - `exec` - Commit one request through a local single-node context

mod commands;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// contextd command-line tools.
#[derive(Parser)]
#[command(name = "contextd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory, or to a context directory if no database
    /// is given
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Database name under the data directory
    #[arg(global = true, short, long)]
    database: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check record framing and the digest chain
    Verify,

    /// Print journal entries
    Dump {
        /// First csn to print
        #[arg(long, default_value = "1")]
        from: u64,

        /// Maximum number of entries to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Commit one request through a local single-node context
    Exec {
        /// Csn the request's read was taken at, 0 for none
        #[arg(long, default_value = "0")]
        csn: u64,

        /// The request as extended JSON, e.g. '{"type":"insert","target":"t1","new":{}}'
        request: String,
    },

    /// Show version information
    Version,
}

/// The directory holding `journal.log` and `sequence.log`.
fn context_dir(path: &Path, database: Option<&str>) -> PathBuf {
    match database {
        Some(database) => path.join(database),
        None => path.to_path_buf(),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Verify => {
            let path = cli.path.ok_or("Data path required for verify")?;
            commands::verify::run(&context_dir(&path, cli.database.as_deref()))?;
        }
        Commands::Dump {
            from,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Data path required for dump")?;
            commands::dump::run(
                &context_dir(&path, cli.database.as_deref()),
                from,
                limit,
                &format,
            )?;
        }
        Commands::Exec { csn, request } => {
            let path = cli.path.ok_or("Data path required for exec")?;
            let database = cli.database.ok_or("Database name required for exec")?;
            commands::exec::run(&path, &database, csn, &request)?;
        }
        Commands::Version => {
            println!("contextd CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
