//! dnsmon - DNS resolver latency monitor
//!
//! Without a subcommand the binary runs the monitoring daemon in the
//! foreground; the other subcommands inspect or signal a running daemon.

use clap::Parser;
use dnsmon::{
    app::{App, Launch},
    cli::{Cli, Command},
    clock::{Clock, SystemClock},
    commands,
    config::Config,
    logging::{self, CappedLog},
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dnsmon: failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let command = cli.command.clone().unwrap_or(Command::Run);

    if command != Command::Run {
        if let Err(e) = logging::init_for_commands(&config.log_level, clock) {
            eprintln!("dnsmon: failed to initialize logging: {e:#}");
        }
        return match commands::execute(&command, &config) {
            Ok(code) => code,
            Err(e) => {
                error!("{e:#}");
                ExitCode::FAILURE
            }
        };
    }

    run_daemon(config, clock).await
}

async fn run_daemon(config: Config, clock: Arc<dyn Clock>) -> ExitCode {
    let paths = config.paths();
    if let Err(e) = std::fs::create_dir_all(&paths.data_dir) {
        eprintln!(
            "dnsmon: cannot create data directory {}: {e}",
            paths.data_dir.display()
        );
        return ExitCode::FAILURE;
    }

    let log_file = CappedLog::new(&paths.log_file, &config.log);
    if let Err(e) = logging::init(&config.log_level, clock.clone(), Some(log_file)) {
        eprintln!("dnsmon: failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    let launch = App::builder(config).clock_override(clock).build().await;
    match launch {
        Ok(Launch::Ready(app)) => match app.run().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Daemon failed: {e:#}");
                ExitCode::FAILURE
            }
        },
        Ok(Launch::AlreadyRunning) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to start daemon: {e:#}");
            ExitCode::FAILURE
        }
    }
}
