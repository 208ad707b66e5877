use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod docker;
mod evaluate;
mod exec;
mod instance;
mod orchestrate;
mod patch;
mod report;
mod stage;
mod util;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::RootArgs::parse();
    let exit_code = orchestrate::run(&args)?;
    std::process::exit(exit_code);
}
