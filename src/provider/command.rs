//! Provider probe backed by an external program.
//!
//! The program (usually a headless-browser script) performs the measurement
//! and prints a JSON object on stdout. Anything printed around the object
//! (progress spinners, banners) is ignored.

use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use super::{normalize, ProbeError, ProbeOutcome, ProviderId, ProviderMeta, ProviderProbe};

pub struct CommandProbe {
    provider: ProviderId,
    program: String,
    args: Vec<String>,
}

impl CommandProbe {
    pub fn new(provider: ProviderId, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            provider,
            program: program.into(),
            args,
        }
    }
}

#[async_trait::async_trait]
impl ProviderProbe for CommandProbe {
    fn meta(&self) -> ProviderMeta {
        match self.provider {
            ProviderId::OpenSpeedTest => super::openspeedtest::meta(),
            ProviderId::SpeedSmart => super::speedsmart::meta(),
        }
    }

    async fn run(&self, timeout: Duration) -> Result<ProbeOutcome, ProbeError> {
        debug!(provider = %self.provider, program = %self.program, "spawning probe program");

        // kill_on_drop: an abandoned invocation must not leave a browser running.
        let child = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| ProbeError::Timeout {
                secs: timeout.as_secs(),
            })?
            .map_err(|source| ProbeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Exited {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let json = super::extract_json(&stdout)?;
        normalize(self.provider, json)
    }
}
