use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::{Probe, ProbeError};

type PairKey = (String, String);

/// Fake probe for testing
pub struct FakeProbe {
    // Queued responses per (server, domain); the front is the next response.
    responses: Arc<Mutex<HashMap<PairKey, VecDeque<Result<f64, ProbeError>>>>>,
    calls: Arc<Mutex<Vec<PairKey>>>,
    default_response: Result<f64, ProbeError>,
    available: Result<(), ProbeError>,
}

impl FakeProbe {
    /// Unconfigured pairs fail.
    pub fn new() -> Self {
        Self::with_default(Err(ProbeError::Transport(
            "no response configured".to_string(),
        )))
    }

    /// Unconfigured pairs answer with `default_response`.
    pub fn with_default(default_response: Result<f64, ProbeError>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            default_response,
            available: Ok(()),
        }
    }

    /// Makes `check_available` fail, as if the tool were not installed.
    pub fn unavailable(mut self) -> Self {
        self.available = Err(ProbeError::ToolMissing("fake tool missing".to_string()));
        self
    }

    pub fn add_success(&self, server: &str, domain: &str, ms: f64) {
        self.push(server, domain, Ok(ms));
    }

    pub fn add_failure(&self, server: &str, domain: &str, error: ProbeError) {
        self.push(server, domain, Err(error));
    }

    fn push(&self, server: &str, domain: &str, response: Result<f64, ProbeError>) {
        self.responses
            .lock()
            .unwrap()
            .entry((server.to_string(), domain.to_string()))
            .or_default()
            .push_back(response);
    }

    /// Every (server, domain) pair measured, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, server: &str, domain: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, d)| s == server && d == domain)
            .count()
    }
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for FakeProbe {
    async fn measure(&self, server: &str, domain: &str) -> Result<f64, ProbeError> {
        let key = (server.to_string(), domain.to_string());
        self.calls.lock().unwrap().push(key.clone());

        let mut responses = self.responses.lock().unwrap();
        responses
            .get_mut(&key)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| self.default_response.clone())
    }

    async fn check_available(&self) -> Result<(), ProbeError> {
        self.available.clone()
    }
}
