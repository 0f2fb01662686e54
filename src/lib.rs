//! dnsmon - DNS resolver latency monitor
//!
//! A long-running daemon that periodically measures how quickly a set of
//! resolvers answers a set of domains, keeps a bounded history of the
//! measurements, and logs unusually slow answers. The same binary carries
//! the commands used to inspect and steer a running daemon.

pub mod app;
pub mod cli;
pub mod clock;
pub mod commands;
pub mod config;
pub mod control;
pub mod history;
pub mod lease;
pub mod logging;
pub mod probe;
pub mod report;
pub mod scheduler;
pub mod signals;
pub mod slow_query;
pub mod store;
pub mod watchlist;
