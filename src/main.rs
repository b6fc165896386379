//! objsync - backend-agnostic object synchronization

use clap::Parser;
use objsync::cli::{Cli, Commands, ConfigArgs, SyncArgs};
use objsync::config::Config;
use objsync::progress::{print_dry_run_summary, print_summary};
use objsync::sync::{create_stores, SyncEngine};
use objsync::uri::Location;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing
    init_tracing(cli.verbose, cli.json);

    match cli.command {
        Commands::Sync(args) => run_sync(args).await,
        Commands::Config(args) => {
            handle_config_command(args)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_sync(args: SyncArgs) -> anyhow::Result<ExitCode> {
    let config = args.to_config()?;
    let source = Location::parse(&args.source)?;
    let destination = Location::parse(&args.destination)?;

    if config.dry_run {
        tracing::info!("Dry run mode - no changes will be made");
    }

    let (source_store, dest_store) = create_stores(&source, &destination, &config).await?;
    let engine = SyncEngine::new(config, source_store, dest_store);

    let cancel = engine.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("Received Ctrl+C, finishing running transfers (again to force quit)");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    let report = engine.sync().await;

    if report.dry_run {
        print_dry_run_summary(&report);
    } else {
        print_summary(&report);
    }

    if report.cancelled {
        Ok(ExitCode::from(130))
    } else if report.has_failures() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::new("objsync=info"),
        1 => EnvFilter::new("objsync=debug"),
        2 => EnvFilter::new("objsync=trace"),
        _ => EnvFilter::new("trace"),
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn handle_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    if args.path {
        println!("{}", Config::default_config_path()?.display());
    } else if args.init {
        let config = Config::default();
        config.save()?;
        println!(
            "Created default configuration at {}",
            Config::default_config_path()?.display()
        );
    } else {
        // Show current config
        let config = Config::load()?;
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}
