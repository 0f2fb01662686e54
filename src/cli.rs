//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. Global options are merged with the configuration from the
//! `dnsmon.toml` file and environment variables; subcommands select what the
//! process does.

use clap::{Parser, Subcommand};
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Periodic DNS resolver latency monitor.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the watch list, history, slow-query log and pid file.
    #[arg(long, value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Logging level (trace, debug, info, warn, error).
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Seconds between scheduled measurement cycles.
    #[arg(long, value_name = "SECONDS", global = true)]
    pub interval: Option<u64>,

    /// Path to the `dig` executable.
    #[arg(long, value_name = "PATH", global = true)]
    pub dig_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the monitoring daemon in the foreground (default).
    Run,
    /// Print daemon status and the latest cycle as JSON.
    Status,
    /// Ask the running daemon to reload its watch list.
    Reload,
    /// Ask the running daemon to start a measurement cycle now.
    Force,
    /// Ask the running daemon to shut down.
    Stop,
    /// Print slow queries, summarised per server or in detail for one server.
    SlowQueries {
        /// Only list the entries of this server, newest first.
        #[arg(long)]
        server: Option<String>,
    },
    /// Edit the list of resolvers under test.
    Servers {
        #[command(subcommand)]
        action: EditAction,
    },
    /// Edit the list of domains under test.
    Domains {
        #[command(subcommand)]
        action: EditAction,
    },
    /// Print the current watch list.
    ShowConfig,
    /// Discard all recorded measurements.
    Reset,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum EditAction {
    /// Add an entry.
    Add { value: String },
    /// Remove an entry.
    Remove { value: String },
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(dir) = &self.data_dir {
            dict.insert(
                "data_dir".into(),
                Value::from(dir.to_string_lossy().into_owned()),
            );
        }

        if let Some(level) = &self.log_level {
            dict.insert("log_level".into(), Value::from(level.clone()));
        }

        if let Some(interval) = self.interval {
            let mut scheduler = Dict::new();
            scheduler.insert("interval_seconds".into(), Value::from(interval));
            dict.insert("scheduler".into(), Value::from(scheduler));
        }

        if let Some(dig) = &self.dig_path {
            let mut probe = Dict::new();
            probe.insert(
                "dig_path".into(),
                Value::from(dig.to_string_lossy().into_owned()),
            );
            dict.insert("probe".into(), Value::from(probe));
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
