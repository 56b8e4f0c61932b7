//! HTTP catalog fetcher with bounded retry.

use std::time::Duration;

use anyhow::Context;
use dcs_core::RawRecord;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "dcs-fetch";

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Fixed wait between failed attempts.
    pub retry_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Every attempt failed with a transient condition (timeout, transport
    /// error, or non-success status).
    #[error("catalog fetch failed after {attempts} attempts")]
    Exhausted { attempts: u32 },
    /// The source answered but the body is not a JSON array of records.
    /// A contract break, not a transient condition: never retried.
    #[error("malformed catalog response: {0}")]
    Malformed(#[source] serde_json::Error),
}

#[derive(Debug)]
pub struct CatalogFetcher {
    client: reqwest::Client,
    retry_delay: Duration,
}

impl CatalogFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry_delay: config.retry_delay,
        })
    }

    /// Parse a response body as a JSON array of catalog records.
    pub fn parse_catalog(bytes: &[u8]) -> Result<Vec<RawRecord>, FetchError> {
        serde_json::from_slice(bytes).map_err(FetchError::Malformed)
    }

    /// Fetch the catalog, retrying transient failures up to `max_attempts`
    /// times with a fixed delay between attempts. Returns on the first
    /// successful parse; a parse failure aborts immediately. A zero budget
    /// performs no attempts and exhausts at once.
    pub async fn fetch(
        &self,
        url: &str,
        max_attempts: u32,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let span = info_span!("catalog_fetch", url);
        self.fetch_attempts(url, max_attempts).instrument(span).await
    }

    async fn fetch_attempts(
        &self,
        url: &str,
        max_attempts: u32,
    ) -> Result<Vec<RawRecord>, FetchError> {
        for attempt in 1..=max_attempts {
            info!(attempt, max_attempts, "fetching catalog");

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                let records = Self::parse_catalog(&body)?;
                                info!(records = records.len(), "catalog fetch succeeded");
                                return Ok(records);
                            }
                            Err(err) => {
                                warn!(attempt, error = %err, "reading catalog body failed");
                            }
                        }
                    } else {
                        warn!(
                            attempt,
                            status = status.as_u16(),
                            "catalog request returned non-success status"
                        );
                    }
                }
                Err(err) if err.is_timeout() => {
                    warn!(attempt, "catalog request timed out");
                }
                Err(err) => {
                    warn!(attempt, error = %err, "catalog request failed");
                }
            }

            if attempt < max_attempts {
                info!(
                    delay_ms = self.retry_delay.as_millis() as u64,
                    "retrying catalog fetch"
                );
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(FetchError::Exhausted {
            attempts: max_attempts,
        })
    }
}
