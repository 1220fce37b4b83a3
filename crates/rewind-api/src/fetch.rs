use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

const USER_AGENT: &str = concat!("rewind/", env!("CARGO_PKG_VERSION"));

/// Source of raw registry bytes.
pub trait FetchService {
    /// Fetch `url` in full.
    ///
    /// # Errors
    /// Returns an error on transport failures and on any non-success status.
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Blocking HTTP fetcher.
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { agent: ureq::AgentBuilder::new().timeout(timeout).build() }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl FetchService for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let resp = match self.agent.get(url).set("User-Agent", USER_AGENT).call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("fetch of {url} failed with status {code}"));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("fetch of {url} failed: {err}"));
            }
        };

        let mut body = Vec::new();
        resp.into_reader()
            .read_to_end(&mut body)
            .with_context(|| format!("failed to read response body of {url}"))?;
        tracing::debug!(url, bytes = body.len(), "fetched");
        Ok(body)
    }
}

/// Fixed URL to bytes table, for tests and offline replays.
#[derive(Debug, Clone, Default)]
pub struct StaticFetcher {
    responses: BTreeMap<String, Vec<u8>>,
}

impl StaticFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_response(mut self, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.responses.insert(url.into(), body.into());
        self
    }
}

impl FetchService for StaticFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.responses.get(url).cloned().ok_or_else(|| anyhow!("fetch of {url} failed with status 404"))
    }
}

/// Lower-case hex SHA-256 of `bytes`.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
