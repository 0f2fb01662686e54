use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{Probe, ProbeError};

/// Tries `primary`, and on failure gives the pair one more chance through
/// `secondary`. Availability is decided by the primary alone.
pub struct FallbackProbe {
    primary: Arc<dyn Probe>,
    secondary: Arc<dyn Probe>,
}

impl FallbackProbe {
    pub fn new(primary: Arc<dyn Probe>, secondary: Arc<dyn Probe>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl Probe for FallbackProbe {
    async fn measure(&self, server: &str, domain: &str) -> Result<f64, ProbeError> {
        match self.primary.measure(server, domain).await {
            Ok(ms) => Ok(ms),
            Err(primary_err) => {
                debug!(server, domain, error = %primary_err, "Primary probe failed, trying fallback");
                self.secondary.measure(server, domain).await
            }
        }
    }

    async fn check_available(&self) -> Result<(), ProbeError> {
        self.primary.check_available().await
    }
}
