mod capabilities;
mod checks;
mod cli;
mod config;
mod context;
mod error;
mod hardener;
mod image;
mod loopdev;
mod mount;
mod namespace;
mod notifier;
mod privilege;
mod registry;
mod report;
mod runtime;
mod session;
mod supervisor;
mod utils;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use config::Config;
use context::{Authority, ProcessContext};
use error::ExitCode;
use privilege::PrivilegeManager;
use registry::Registry;
use runtime::Runtime;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Filter directive overriding the verbosity flags.
const LOG_ENV: &str = "SEXEC_LOG";

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from_error(&err).into()
        }
    };

    std::process::exit(code);
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(cli.log_level()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    let context = ProcessContext::detect()?;

    let mut registry = Registry::from_env()?;
    cli.apply(&mut registry)?;

    let config = Config::load(&cli.general.config, context.setuid())?;
    let authority = Authority::resolve(&context, &registry, &config)?;
    let privileges = PrivilegeManager::init(&context, authority, &registry)?;
    capabilities::log_capability_snapshot("startup");

    Runtime::new(registry, config, privileges).run(cli.command)
}
