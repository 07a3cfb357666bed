//! Speed test providers.
//!
//! A provider is an opaque, slow measurement routine (typically a headless
//! browser driving a public speed test page). The core only sees the
//! [`ProviderProbe`] contract: run once within a timeout, return numbers or
//! a [`ProbeError`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod command;
pub mod openspeedtest;
pub mod speedsmart;

pub use self::command::CommandProbe;

/// Identifier of a supported speed test provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenSpeedTest,
    SpeedSmart,
}

impl ProviderId {
    pub const ALL: [ProviderId; 2] = [ProviderId::OpenSpeedTest, ProviderId::SpeedSmart];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenSpeedTest => "openspeedtest",
            ProviderId::SpeedSmart => "speedsmart",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openspeedtest" => Ok(ProviderId::OpenSpeedTest),
            "speedsmart" => Ok(ProviderId::SpeedSmart),
            other => Err(ProbeError::UnknownProvider(other.to_string())),
        }
    }
}

/// Static description of a provider, surfaced by the API.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderMeta {
    pub id: ProviderId,
    pub display_name: &'static str,
    pub site: &'static str,
    pub description: &'static str,
}

/// Normalized numbers from one successful probe attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub isp: Option<String>,
    pub server: Option<String>,
    /// Provider-native payload, kept verbatim.
    pub raw: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("failed to launch probe program '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("probe program exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("no JSON object found in probe output")]
    NoJson,

    #[error("malformed probe output: {0}")]
    Malformed(String),

    #[error("no probe registered for provider {0}")]
    NotRegistered(ProviderId),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
}

/// Contract every provider implementation fulfils.
#[async_trait::async_trait]
pub trait ProviderProbe: Send + Sync {
    /// Static metadata about the provider.
    fn meta(&self) -> ProviderMeta;

    /// Perform one measurement attempt, giving up after `timeout`.
    async fn run(&self, timeout: Duration) -> Result<ProbeOutcome, ProbeError>;
}

/// The probes available to the runner, keyed by provider.
#[derive(Clone, Default)]
pub struct ProbeSet {
    probes: BTreeMap<ProviderId, Arc<dyn ProviderProbe>>,
}

impl ProbeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the probe for `id`.
    pub fn with(mut self, id: ProviderId, probe: Arc<dyn ProviderProbe>) -> Self {
        self.probes.insert(id, probe);
        self
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn ProviderProbe>> {
        self.probes.get(&id).cloned()
    }

    pub fn metas(&self) -> Vec<ProviderMeta> {
        self.probes.values().map(|p| p.meta()).collect()
    }
}

/// Pull the JSON object out of noisy script output: everything between the
/// first `{` and the last `}`.
pub fn extract_json(output: &str) -> Result<serde_json::Value, ProbeError> {
    let start = output.find('{').ok_or(ProbeError::NoJson)?;
    let end = output.rfind('}').ok_or(ProbeError::NoJson)?;
    if end < start {
        return Err(ProbeError::NoJson);
    }
    serde_json::from_str(&output[start..=end]).map_err(|e| ProbeError::Malformed(e.to_string()))
}

/// Normalize a provider's JSON payload into a [`ProbeOutcome`].
pub fn normalize(id: ProviderId, json: serde_json::Value) -> Result<ProbeOutcome, ProbeError> {
    match id {
        ProviderId::OpenSpeedTest => openspeedtest::normalize(json),
        ProviderId::SpeedSmart => speedsmart::normalize(json),
    }
}
