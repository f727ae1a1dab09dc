use std::time::Duration;

use tracing::debug;

use crate::config::SUBSCRIPTION_USER_AGENT;
use crate::loader::{ContentFetcher, FetchError};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(SUBSCRIPTION_USER_AGENT)
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;
        Ok(Self { client })
    }
}

impl ContentFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response
            .bytes()
            .map_err(|e| FetchError::Request(e.to_string()))?;
        debug!(url, status = status.as_u16(), bytes = body.len(), "subscription downloaded");
        Ok(body.to_vec())
    }
}
