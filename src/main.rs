mod cli;
mod config;
mod constants;
mod entity;
mod errors;
mod linux;
mod run;
mod tree;
mod utils;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), errors::BlkError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();

    run::run(args)
}
