// ABOUTME: Replication diff source - remote state file and sequence-numbered gzip diffs
// ABOUTME: Maps sequence numbers to the three-level AAA/BBB/CCC directory layout

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::changeset::parse_timestamp;
use crate::config::ReplicationSettings;

/// Format of `last_run` in the server's state file.
const LAST_RUN_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f %:z";

/// Latest diff published by the replication server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteState {
    pub sequence: i64,
    pub last_run: Option<NaiveDateTime>,
}

#[derive(Deserialize)]
struct StateFile {
    sequence: i64,
    #[serde(default)]
    last_run: Option<String>,
}

impl RemoteState {
    /// Parse the YAML state file, e.g.
    ///
    /// ```text
    /// ---
    /// last_run: 2024-03-01 12:34:01.712384000 +00:00
    /// sequence: 5891234
    /// ```
    pub fn from_yaml(body: &str) -> Result<Self> {
        let raw: StateFile =
            serde_yaml::from_str(body).context("Failed to parse replication state file")?;
        anyhow::ensure!(
            raw.sequence >= 0,
            "Replication state file has negative sequence {}",
            raw.sequence
        );

        let last_run = match raw.last_run.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(value) => Some(parse_last_run(value).with_context(|| {
                format!("Replication state file has invalid last_run {:?}", value)
            })?),
        };

        Ok(Self {
            sequence: raw.sequence,
            last_run,
        })
    }
}

fn parse_last_run(value: &str) -> Result<NaiveDateTime> {
    if let Ok(ts) = DateTime::parse_from_str(value, LAST_RUN_FORMAT) {
        return Ok(ts.naive_utc());
    }
    parse_timestamp(value).context("unrecognized timestamp format")
}

/// Relative path of the diff for `sequence`.
///
/// # Examples
///
/// ```
/// use changeset_replicator::replication::sequence_path;
/// assert_eq!(sequence_path(1_234_567, ".osm.gz"), "001/234/567.osm.gz");
/// ```
pub fn sequence_path(sequence: u64, extension: &str) -> String {
    format!(
        "{:03}/{:03}/{:03}{}",
        sequence / 1_000_000,
        (sequence / 1_000) % 1_000,
        sequence % 1_000,
        extension
    )
}

/// Where replication diffs come from.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// The newest sequence the server has published.
    async fn current_state(&self) -> Result<RemoteState>;

    /// Raw (still compressed) bytes of the diff for `sequence`.
    async fn fetch_delta(&self, sequence: i64) -> Result<Vec<u8>>;
}

/// Fetches state and diffs over HTTP(S) from a planet-style replication tree.
pub struct HttpReplicationSource {
    client: Client,
    base_url: Url,
    state_file: String,
    extension: String,
}

impl HttpReplicationSource {
    pub fn new(settings: &ReplicationSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        // Url::join replaces the last segment unless the base ends with '/'
        let mut base = settings.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .with_context(|| format!("Invalid replication base URL '{}'", settings.base_url))?;

        Ok(Self {
            client,
            base_url,
            state_file: settings.state_file.clone(),
            extension: settings.delta_extension.clone(),
        })
    }

    pub fn delta_url(&self, sequence: u64) -> Result<Url> {
        self.base_url
            .join(&sequence_path(sequence, &self.extension))
            .context("Failed to build diff URL")
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        tracing::debug!("GET {}", url);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("Request to {} failed with status {}", url, status);
        }
        Ok(response)
    }
}

#[async_trait]
impl ReplicationSource for HttpReplicationSource {
    async fn current_state(&self) -> Result<RemoteState> {
        let url = self
            .base_url
            .join(&self.state_file)
            .context("Failed to build state file URL")?;
        let body = self
            .get(url)
            .await?
            .text()
            .await
            .context("Failed to read replication state file")?;
        RemoteState::from_yaml(&body)
    }

    async fn fetch_delta(&self, sequence: i64) -> Result<Vec<u8>> {
        let sequence = u64::try_from(sequence)
            .with_context(|| format!("Cannot fetch negative sequence {}", sequence))?;
        let url = self.delta_url(sequence)?;
        tracing::info!("Fetching replication diff {}", url);
        let bytes = self
            .get(url)
            .await?
            .bytes()
            .await
            .with_context(|| format!("Failed to download diff for sequence {}", sequence))?;
        Ok(bytes.to_vec())
    }
}
