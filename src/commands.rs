//! One-shot commands run against the data directory and, where needed, the
//! running daemon. Results go to stdout as JSON; diagnostics go to stderr.

use anyhow::{Context, Result};
use serde::Serialize;
use std::process::ExitCode;
use tracing::{info, warn};

use crate::cli::{Command, EditAction};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, Paths};
use crate::control::{self, ControlError};
use crate::history::HistoryStore;
use crate::report;
use crate::signals::ControlIntent;
use crate::watchlist::WatchList;

/// Runs every command except `run`, which the entry point handles.
pub fn execute(command: &Command, config: &Config) -> Result<ExitCode> {
    let paths = config.paths();
    match command {
        Command::Run => anyhow::bail!("`run` is not a one-shot command"),
        Command::Status => {
            let status = report::status(&paths);
            print_json(&status)?;
            Ok(if status.daemon.is_running() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(3)
            })
        }
        Command::Reload => signal(ControlIntent::Reload, &paths, config),
        Command::Force => signal(ControlIntent::ForceCycle, &paths, config),
        Command::Stop => signal(ControlIntent::Shutdown, &paths, config),
        Command::SlowQueries { server: None } => {
            print_json(&report::slow_query_summary(&paths.slow_queries))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::SlowQueries {
            server: Some(server),
        } => {
            print_json(&report::slow_queries_for(&paths.slow_queries, server))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Servers { action } => edit(&paths, config, |list| match action {
            EditAction::Add { value } => Ok(list.add_server(value)?),
            EditAction::Remove { value } => Ok(list.remove_server(value)),
        }),
        Command::Domains { action } => edit(&paths, config, |list| match action {
            EditAction::Add { value } => Ok(list.add_domain(value)?),
            EditAction::Remove { value } => Ok(list.remove_domain(value)),
        }),
        Command::ShowConfig => {
            print_json(&WatchList::load(&paths.watch_list))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset => {
            std::fs::create_dir_all(&paths.data_dir)
                .with_context(|| format!("cannot create {}", paths.data_dir.display()))?;
            let history = HistoryStore::new(&paths.history, config.history.clone());
            history
                .reset(SystemClock.now())
                .with_context(|| format!("cannot reset {}", paths.history.display()))?;
            print_json(&history.load()?.metadata)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn signal(intent: ControlIntent, paths: &Paths, config: &Config) -> Result<ExitCode> {
    match control::deliver(intent, &paths.pid_file, &config.control.process_name) {
        Ok(delivery) => {
            print_json(&delivery)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(ControlError::NotRunning) => {
            warn!("DNS monitoring daemon is not running");
            Ok(ExitCode::from(3))
        }
        Err(e) => Err(e.into()),
    }
}

/// Applies `change` to the stored watch list, saves it if it changed, and
/// asks a running daemon to pick it up.
fn edit<F>(paths: &Paths, config: &Config, change: F) -> Result<ExitCode>
where
    F: FnOnce(&mut WatchList) -> Result<bool>,
{
    let mut list = WatchList::load(&paths.watch_list);
    if !change(&mut list)? {
        info!("Watch list unchanged");
        print_json(&list)?;
        return Ok(ExitCode::SUCCESS);
    }

    std::fs::create_dir_all(&paths.data_dir)
        .with_context(|| format!("cannot create {}", paths.data_dir.display()))?;
    list.save(&paths.watch_list)
        .with_context(|| format!("cannot save {}", paths.watch_list.display()))?;
    info!(
        servers = list.servers.len(),
        domains = list.domains.len(),
        "Watch list saved"
    );

    match control::deliver(
        ControlIntent::Reload,
        &paths.pid_file,
        &config.control.process_name,
    ) {
        Ok(delivery) => info!(pid = delivery.pid, "Daemon asked to reload"),
        Err(ControlError::NotRunning) => {
            warn!("Daemon not running; changes apply on next start")
        }
        Err(e) => warn!(error = %e, "Could not notify the daemon"),
    }

    print_json(&list)?;
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // ExitCode has no PartialEq on older toolchains.
    fn code(c: ExitCode) -> String {
        format!("{c:?}")
    }

    fn config_in(dir: &std::path::Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            control: crate::config::ControlConfig {
                process_name: "dnsmon-test-no-such-process".to_string(),
            },
            ..Config::default()
        }
    }

    #[test]
    fn adding_and_removing_servers_updates_the_document() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let paths = config.paths();

        let add = Command::Servers {
            action: EditAction::Add {
                value: "8.8.8.8".to_string(),
            },
        };
        assert_eq!(code(execute(&add, &config).unwrap()), code(ExitCode::SUCCESS));
        assert_eq!(WatchList::load(&paths.watch_list).servers, vec!["8.8.8.8"]);

        let remove = Command::Servers {
            action: EditAction::Remove {
                value: "8.8.8.8".to_string(),
            },
        };
        execute(&remove, &config).unwrap();
        assert!(WatchList::load(&paths.watch_list).servers.is_empty());
    }

    #[test]
    fn invalid_domain_is_rejected_and_nothing_written() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let add = Command::Domains {
            action: EditAction::Add {
                value: "not a domain!".to_string(),
            },
        };
        assert!(execute(&add, &config).is_err());
        assert!(!config.paths().watch_list.exists());
    }

    #[test]
    fn reset_empties_the_history() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let paths = config.paths();
        let store = HistoryStore::new(&paths.history, config.history.clone());
        let now = SystemClock.now();
        store
            .append(
                &[crate::history::MeasurementRecord::success(now, "1.1.1.1", "a.com", 4.0)],
                now,
                now,
            )
            .unwrap();

        assert_eq!(code(execute(&Command::Reset, &config).unwrap()), code(ExitCode::SUCCESS));

        let doc = store.load().unwrap();
        assert!(doc.tests.is_empty());
        assert!(doc.metadata.current_cycle_id.is_none());
        assert!(report::status(&paths).reset_date.is_none());
    }

    #[test]
    fn signalling_without_daemon_reports_not_running() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        assert_eq!(
            code(execute(&Command::Force, &config).unwrap()),
            code(ExitCode::from(3))
        );
    }
}
