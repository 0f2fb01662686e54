pub mod dig;
pub mod fallback;
pub mod resolver;
#[cfg(feature = "test-utils")]
pub mod test_utils;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;

pub use dig::DigProbe;
pub use fallback::FallbackProbe;
pub use resolver::HickoryProbe;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("measurement tool unavailable: {0}")]
    ToolMissing(String),

    #[error("query timed out: {0}")]
    Timeout(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Times a single query against a single resolver.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Queries a cache-busted name under `domain` at `server`.
    ///
    /// # Returns
    /// * `Ok(ms)` when the resolver answered, including negative answers
    ///   such as NXDOMAIN
    /// * `Err` when no answer could be obtained at all
    async fn measure(&self, server: &str, domain: &str) -> Result<f64, ProbeError>;

    /// Verifies that whatever the probe needs is installed. Called once at
    /// startup.
    async fn check_available(&self) -> Result<(), ProbeError> {
        Ok(())
    }
}

/// A label that no resolver can have cached: `test-<unix secs>-<1000..=9999>`.
pub fn cache_busting_label(now: DateTime<Utc>) -> String {
    let salt: u16 = rand::rng().random_range(1000..=9999);
    format!("test-{}-{}", now.timestamp(), salt)
}

/// The fully qualified name actually sent to the resolver.
pub fn cache_busted_name(now: DateTime<Utc>, domain: &str) -> String {
    format!("{}.{}", cache_busting_label(now), domain.trim_end_matches('.'))
}

/// Rounds a latency to microsecond precision.
pub(crate) fn round_ms(ms: f64) -> f64 {
    (ms * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use regex::Regex;

    #[test]
    fn label_has_time_and_random_parts() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let label = cache_busting_label(now);
        let re = Regex::new(r"^test-1704164645-\d{4}$").unwrap();
        assert!(re.is_match(&label), "unexpected label {label}");
    }

    #[test]
    fn busted_name_is_a_subdomain() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let name = cache_busted_name(now, "example.com.");
        assert!(name.starts_with("test-"));
        assert!(name.ends_with(".example.com"));
    }

    #[test]
    fn rounding_keeps_three_decimals() {
        assert_eq!(round_ms(12.345_678), 12.346);
    }
}
