//! keyreg CLI
//!
//! Command-line tools for key registry files.
//!
//! # Commands
//!
//! - `inspect` - Display the keys held by a registry (never their material)
//! - `verify` - Check every record of a registry
//! - `rekey` - Re-encrypt a registry under a new storage key

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Key registry maintenance tools.
#[derive(Parser)]
#[command(name = "keyreg")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the KEYREGISTRY file
    #[arg(global = true, short, long)]
    dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display registry metadata and the list of keys
    Inspect {
        /// File holding the raw storage key (omit for plaintext registries)
        #[arg(short, long)]
        key_file: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify registry integrity
    Verify {
        /// File holding the raw storage key (omit for plaintext registries)
        #[arg(short, long)]
        key_file: Option<PathBuf>,
    },

    /// Re-encrypt the registry under a new storage key
    Rekey {
        /// File holding the current storage key (omit for plaintext registries)
        #[arg(long)]
        old_key_file: Option<PathBuf>,

        /// File holding the new storage key
        #[arg(long)]
        new_key_file: PathBuf,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { key_file, format } => {
            let dir = cli.dir.ok_or("Registry directory required for inspect")?;
            commands::inspect::run(&dir, key_file.as_deref(), &format)?;
        }
        Commands::Verify { key_file } => {
            let dir = cli.dir.ok_or("Registry directory required for verify")?;
            commands::verify::run(&dir, key_file.as_deref())?;
        }
        Commands::Rekey {
            old_key_file,
            new_key_file,
        } => {
            let dir = cli.dir.ok_or("Registry directory required for rekey")?;
            commands::rekey::run(&dir, old_key_file.as_deref(), &new_key_file)?;
        }
        Commands::Version => {
            println!("keyreg CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("keyreg core v{}", keyreg_core::VERSION);
        }
    }

    Ok(())
}
