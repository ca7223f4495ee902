//! Idle-worker detection for the age sweep.
//!
//! Old workers are only retired when they are idle. The detector asks an
//! external script console which workers have nothing to do and gets back
//! one 8-character container id prefix per line.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;

use crate::config::IdleDetectorConfig;
use crate::error::IdleError;

/// Length of a worker id as reported by the detector.
pub const WORKER_ID_LEN: usize = 8;

/// Source of the set of currently idle workers.
#[async_trait]
pub trait IdleDetector: Send + Sync {
    /// Id prefixes of idle workers.
    async fn idle_workers(&self) -> Result<HashSet<String>, IdleError>;
}

/// Parse a newline-separated list of worker ids. Blank lines are skipped.
pub fn parse_worker_ids(body: &str) -> Result<HashSet<String>, IdleError> {
    let mut ids = HashSet::new();
    for line in body.lines() {
        let entry = line.trim();
        if entry.is_empty() {
            continue;
        }
        if entry.chars().count() != WORKER_ID_LEN {
            return Err(IdleError::MalformedEntry {
                entry: entry.to_string(),
                expected: WORKER_ID_LEN,
            });
        }
        ids.insert(entry.to_string());
    }
    Ok(ids)
}

/// Runs a script on a remote console (`POST <url>/scriptText`) and parses
/// its output as worker ids.
pub struct ScriptConsoleDetector {
    config: IdleDetectorConfig,
    client: reqwest::Client,
}

impl ScriptConsoleDetector {
    pub fn new(config: IdleDetectorConfig) -> Result<Self, IdleError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IdleError::Client(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/scriptText", self.config.url.trim_end_matches('/'))
    }
}

#[async_trait]
impl IdleDetector for ScriptConsoleDetector {
    async fn idle_workers(&self) -> Result<HashSet<String>, IdleError> {
        let mut request = self
            .client
            .post(self.endpoint())
            .form(&[("script", self.config.script.as_str())]);
        if let Some(user) = &self.config.user {
            request = request.basic_auth(
                user,
                self.config.password.as_ref().map(|p| p.expose_secret()),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| IdleError::Http(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IdleError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(IdleError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let ids = parse_worker_ids(&body)?;
        tracing::debug!("Idle detector reported {} idle workers", ids.len());
        Ok(ids)
    }
}
