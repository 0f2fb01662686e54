//! In-process probe built on hickory-resolver.
//!
//! Used as the fallback when `dig` fails for a pair. A resolver is built per
//! query, bound to exactly the server under test, with no search domains
//! and a single attempt.

use async_trait::async_trait;
use hickory_resolver::{
    config::{NameServerConfig, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::{rr::RecordType, xfer::Protocol},
    Resolver,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use super::{cache_busted_name, round_ms, Probe, ProbeError};
use crate::clock::Clock;
use crate::config::ProbeConfig;

const DNS_PORT: u16 = 53;

pub struct HickoryProbe {
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl HickoryProbe {
    pub fn new(config: &ProbeConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_seconds),
            clock,
        }
    }

    fn resolver_for(&self, server: SocketAddr) -> Resolver<TokioConnectionProvider> {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(server, Protocol::Udp));

        let mut opts = ResolverOpts::default();
        // No search-list expansion: the cache-busted name is already fully qualified.
        opts.ndots = 1;
        opts.attempts = 1;
        opts.timeout = self.timeout;

        Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build()
    }
}

#[async_trait]
impl Probe for HickoryProbe {
    async fn measure(&self, server: &str, domain: &str) -> Result<f64, ProbeError> {
        let addr = parse_server(server)?;
        let resolver = self.resolver_for(addr);
        let name = format!("{}.", cache_busted_name(self.clock.now(), domain));

        let start = Instant::now();
        let result = resolver.lookup(name.as_str(), RecordType::A).await;
        let elapsed_ms = round_ms(start.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(_) => Ok(elapsed_ms),
            Err(e) => {
                let err_string = e.to_string();
                if is_negative_answer(&err_string) {
                    trace!(server, name = %name, "Negative answer counts as a timed response");
                    Ok(elapsed_ms)
                } else if err_string.to_lowercase().contains("timed out")
                    || err_string.to_lowercase().contains("timeout")
                {
                    Err(ProbeError::Timeout(err_string))
                } else {
                    Err(ProbeError::Transport(err_string))
                }
            }
        }
    }
}

/// Accepts `1.2.3.4`, `1.2.3.4:5353`, `2001:db8::1` and `[2001:db8::1]:53`.
fn parse_server(server: &str) -> Result<SocketAddr, ProbeError> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    server
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| {
            ProbeError::Transport(format!(
                "{server} is not an IP address; the library fallback needs one"
            ))
        })
}

/// Whether a resolver error is really an answer (NXDOMAIN, NODATA).
fn is_negative_answer(err_str: &str) -> bool {
    let lower = err_str.to_lowercase();
    lower.contains("nxdomain") || lower.contains("no records found")
}
