use clap::{
    Args,
    Parser,
    Subcommand,
};

use crate::errors::BlkError;

#[derive(Debug, Parser)]
#[clap(
    version,
    about = "Storage device-tree scanner and action planner"
)]
pub struct Cli {
    #[command(subcommand)]
    pub commands: Option<Commands>,

    /// Config file (exclusive/ignored disks, protected devices,
    /// passphrases, mode flags)
    #[arg(
        global = true,
        short = 'c',
        long = "config",
        value_parser = validate_filename
    )]
    pub config: Option<String>,

    /// Dry-run, blktree will not commit any changes to disks,
    /// and will just print the actions to be performed
    #[arg(global = true, short = 'n', default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan the machine's storage and print the device tree
    Scan,

    /// Register a plan's actions against the scanned tree and commit
    Plan(ArgsPlan),
}

#[derive(Debug, Args)]
pub struct ArgsPlan {
    /// Plan file
    #[arg(
        short = 'f',
        long = "file",
        value_parser = validate_filename,
        default_value_t = String::from("./plan.yaml")
    )]
    pub plan: String,
}

fn validate_filename(name: &str) -> Result<String, BlkError> {
    if name.is_empty() {
        return Err(BlkError::BadArgs(String::from("empty filename")));
    }

    Ok(name.to_string())
}
