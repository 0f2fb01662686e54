//! The set of resolvers and domains under test.
//!
//! Stored as `{"servers": [...], "domains": [...]}`. The daemon only reads
//! it, and only when its cached copy has been invalidated. Editing commands
//! write it and then ask the daemon to reload.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::warn;

use crate::store::{self, DocumentLock, StoreError};

static HOSTNAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*\.?$")
        .expect("valid regex")
});

#[derive(Error, Debug)]
pub enum WatchListError {
    #[error("invalid resolver address: {0}")]
    InvalidServer(String),

    #[error("invalid domain name: {0}")]
    InvalidDomain(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WatchList {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
}

impl WatchList {
    pub fn new<S: Into<String>, D: Into<String>>(
        servers: impl IntoIterator<Item = S>,
        domains: impl IntoIterator<Item = D>,
    ) -> Self {
        let mut list = Self {
            servers: servers.into_iter().map(Into::into).collect(),
            domains: domains.into_iter().map(Into::into).collect(),
        };
        list.dedup();
        list
    }

    /// Reads the watch list. A missing or malformed document is an empty
    /// list: the daemon keeps polling instead of failing.
    pub fn load(path: &Path) -> Self {
        match store::read_json::<WatchList>(path) {
            Ok(Some(mut list)) => {
                list.dedup();
                list
            }
            Ok(None) => Self::default(),
            Err(e) => {
                warn!(error = %e, "Watch list unreadable, treating as empty");
                Self::default()
            }
        }
    }

    /// Atomically replaces the document at `path`.
    pub fn save(&self, path: &Path) -> Result<(), WatchListError> {
        let _lock = DocumentLock::acquire(path)?;
        store::write_json_atomic(path, self)?;
        Ok(())
    }

    /// No pair to measure.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty() || self.domains.is_empty()
    }

    /// Number of measurements one cycle performs.
    pub fn pair_count(&self) -> usize {
        self.servers.len() * self.domains.len()
    }

    /// Adds a resolver. Returns `false` if it was already listed.
    pub fn add_server(&mut self, server: &str) -> Result<bool, WatchListError> {
        let server = normalize_server(server)?;
        Ok(insert_unique(&mut self.servers, server))
    }

    pub fn remove_server(&mut self, server: &str) -> bool {
        let server = strip_scheme(server.trim());
        remove_entry(&mut self.servers, server)
    }

    /// Adds a domain. Returns `false` if it was already listed.
    pub fn add_domain(&mut self, domain: &str) -> Result<bool, WatchListError> {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();
        if domain.is_empty() || domain.len() > 253 || !HOSTNAME.is_match(&domain) {
            return Err(WatchListError::InvalidDomain(domain));
        }
        Ok(insert_unique(&mut self.domains, domain))
    }

    pub fn remove_domain(&mut self, domain: &str) -> bool {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();
        remove_entry(&mut self.domains, &domain)
    }

    fn dedup(&mut self) {
        dedup_in_order(&mut self.servers);
        dedup_in_order(&mut self.domains);
    }
}

fn strip_scheme(value: &str) -> &str {
    value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))
        .unwrap_or(value)
}

fn normalize_server(server: &str) -> Result<String, WatchListError> {
    let server = strip_scheme(server.trim());
    if server.parse::<IpAddr>().is_ok() || (!server.is_empty() && HOSTNAME.is_match(server)) {
        Ok(server.to_string())
    } else {
        Err(WatchListError::InvalidServer(server.to_string()))
    }
}

fn insert_unique(entries: &mut Vec<String>, value: String) -> bool {
    if entries.contains(&value) {
        false
    } else {
        entries.push(value);
        true
    }
}

fn remove_entry(entries: &mut Vec<String>, value: &str) -> bool {
    let before = entries.len();
    entries.retain(|e| e != value);
    entries.len() != before
}

fn dedup_in_order(entries: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    entries.retain(|e| seen.insert(e.clone()));
}
