//! Daemon and CLI for the autonomous print-fleet control core.

#![deny(missing_docs)]

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use factory_api::config::Config;
use factory_api::dispatcher::Dispatcher;
use factory_api::files::LocalFileStore;
use factory_api::fleet::Fleet;
use factory_api::job::{FilamentRequirement, Job, JobQueue};
use factory_api::prepare;
use tracing_subscriber::prelude::*;

/// This doc string acts as a help message when the user runs '--help'
/// as do all doc strings on fields.
#[derive(Parser, Debug, Clone)]
#[clap(version = clap::crate_version!(), author = clap::crate_authors!("\n"))]
pub struct Opts {
    /// Print debug info
    #[clap(short, long)]
    pub debug: bool,

    /// Print logs as json
    #[clap(short, long)]
    pub json: bool,

    /// The subcommand to run.
    #[clap(subcommand)]
    pub subcmd: SubCommand,

    /// Path to config file.
    #[clap(short, long, default_value = "factory-api.toml")]
    pub config: std::path::PathBuf,
}

/// A subcommand for our cli.
#[derive(Parser, Debug, Clone)]
pub enum SubCommand {
    /// Run the fleet daemon: spawn a controller per configured machine and
    /// the scheduler over them.
    Serve,

    /// Parse the config file and print what the fleet would look like.
    CheckConfig,

    /// Run the file preparer over a local file and print the result.
    PrepareFile {
        /// The printable file to prepare.
        file: std::path::PathBuf,

        /// Height of the tallest part on the plate, millimeters.
        #[clap(long, default_value = "0.0")]
        part_height: f64,

        /// Machine serial whose automation policy to prepare for.
        #[clap(long)]
        serial: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts: Opts = Opts::parse();

    let (json, plain) = if opts.json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().pretty()))
    };

    let level = if opts.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(json)
        .with(plain)
        .init();

    let config = Config::from_file(&opts.config)?;

    if let Err(err) = run_cmd(&opts, &config).await {
        bail!("running cmd `{:?}` failed: {:?}", &opts.subcmd, err);
    }

    Ok(())
}

async fn run_cmd(opts: &Opts, config: &Config) -> Result<()> {
    match &opts.subcmd {
        SubCommand::Serve => {
            serve(config).await?;
        }
        SubCommand::CheckConfig => {
            println!("files dir: {}", config.files_dir.display());
            println!(
                "dispatcher tick: {}s | watchdog retry limit: {}",
                config.dispatcher.tick_secs, config.watchdog.retry_limit
            );
            for machine in &config.machines {
                let automation = machine.automation();
                println!(
                    "{} ({}): queueing={} auto_eject={} strategy={} release_temp={}C",
                    machine.serial,
                    machine.display_name(),
                    automation.queueing_enabled,
                    automation.auto_eject,
                    automation.clearing_strategy,
                    automation.thermal_release_temp,
                );
            }
        }
        SubCommand::PrepareFile {
            file,
            part_height,
            serial,
        } => {
            let automation = match serial {
                Some(serial) => config
                    .get_machine(serial)
                    .ok_or_else(|| anyhow::anyhow!("no such machine in config: {}", serial))?
                    .automation(),
                None => Default::default(),
            };
            let base = tokio::fs::read_to_string(file).await?;
            let job = Job::new(
                &file.display().to_string(),
                Vec::<FilamentRequirement>::new(),
                *part_height,
            );
            let prepared = prepare::prepare(&base, &job, &automation);
            print!("{}", prepared.content);
        }
    }
    Ok(())
}

async fn serve(config: &Config) -> Result<()> {
    if config.machines.is_empty() {
        bail!("no machines configured; nothing to do");
    }

    let queue = Arc::new(JobQueue::new());
    let files = Arc::new(LocalFileStore::new(&config.files_dir));
    let fleet = Arc::new(Fleet::from_config(config, queue.clone(), files));

    tracing::info!(machines = config.machines.len(), "fleet up");

    let dispatcher = Dispatcher::new(fleet, queue);
    let tick_secs = config.dispatcher.tick_secs;
    tokio::select! {
        _ = dispatcher.run(tick_secs) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
    Ok(())
}
