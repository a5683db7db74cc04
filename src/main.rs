use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use clmkit::config::{BuildConfiguration, Overrides};
use clmkit::pipeline::{self, Tools};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("✗ {err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = clmkit::cli::Cli::parse();
    clmkit::logging::init(cli.global.debug).context("init logging")?;
    tracing::debug!(?cli, "parsed cli");

    let overrides = Overrides {
        config_file: cli.global.config.clone(),
        verbose: cli.global.verbose,
        debug: cli.global.debug,
        force: cli.global.force,
    };
    let config = BuildConfiguration::load(&cli.global.cwd, &overrides)?;

    let target = cli.command.target();
    pipeline::run_target(target, config, Tools::from_env())
        .await
        .with_context(|| format!("target {}", target.name()))?;

    tracing::info!(target = target.name(), "done");
    Ok(())
}
