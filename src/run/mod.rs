pub mod plan;
pub mod scan;

use std::env;

use crate::config::Config;
use crate::errors::BlkError;
use crate::utils::fs::file_exists;
use crate::{
    cli,
    constants,
};

pub fn run(cli_args: cli::Cli) -> Result<(), BlkError> {
    let config = load_config(&cli_args)?;

    match cli_args.commands {
        // Default is to scan
        None | Some(cli::Commands::Scan) => scan::run(config),
        Some(cli::Commands::Plan(args_plan)) => {
            plan::run(&args_plan.plan, config, cli_args.dry_run)
        }
    }
}

/// Config comes from --config, the environment, or defaults, in that
/// order.
fn load_config(cli_args: &cli::Cli) -> Result<Config, BlkError> {
    let path = cli_args
        .config
        .clone()
        .or_else(|| env::var(constants::ENV_BLKTREE_CONFIG).ok());

    let Some(path) = path else {
        return Ok(Config::default());
    };

    if !file_exists(&path) {
        return Err(BlkError::BadConfig(format!("no such config file {path}")));
    }

    let config_yaml = crate::utils::fs::read_file(&path)?;

    Config::from_yaml(&config_yaml)
}
