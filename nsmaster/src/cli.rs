use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nsmaster", version, about = "Namespace master daemon CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Recover the namespace and serve until interrupted
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Recover the namespace and write a checkpoint
    Checkpoint {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Compare a subtree with its UFS
    Check {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long, default_value = "/")]
        path: String,
    },
    /// List a directory
    Ls {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long, default_value = "/")]
        path: String,
        #[arg(short = 'R', long)]
        recursive: bool,
    },
}
