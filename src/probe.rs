//! HTTP availability prober.
//!
//! Fetches the product page (with the location code as a query parameter when
//! configured) and treats it as available unless the body contains one of the
//! configured "unavailable" markers.

use std::time::Duration;

use async_trait::async_trait;
use stockwatch_core::config::ProbeConfig;
use stockwatch_core::error::{ProbeError, Result, StockWatchError};
use stockwatch_core::traits::Prober;

pub struct HttpProber {
    client: reqwest::Client,
    markers: Vec<String>,
    location_param: Option<String>,
}

impl HttpProber {
    pub fn new(config: &ProbeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .cookie_store(true)
            .build()
            .map_err(|e| StockWatchError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            markers: config
                .unavailable_markers
                .iter()
                .map(|m| m.to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            location_param: config.location_param.clone(),
        })
    }

    fn page_url(
        &self,
        url: &str,
        location_code: &str,
    ) -> std::result::Result<reqwest::Url, ProbeError> {
        let mut parsed = reqwest::Url::parse(url)
            .map_err(|e| ProbeError::InvalidUrl(format!("{url}: {e}")))?;
        if let Some(param) = &self.location_param {
            parsed.query_pairs_mut().append_pair(param, location_code);
        }
        Ok(parsed)
    }

    /// First marker found in `body`, if any.
    fn unavailable_marker(&self, body: &str) -> Option<&str> {
        let body = body.to_lowercase();
        self.markers
            .iter()
            .find(|m| body.contains(m.as_str()))
            .map(String::as_str)
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str, location_code: &str) -> std::result::Result<bool, ProbeError> {
        let page = self.page_url(url, location_code)?;
        tracing::debug!("🌐 Fetching product page: {page}");

        let response = self.client.get(page).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout
            } else {
                ProbeError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout
            } else {
                ProbeError::Http(e.to_string())
            }
        })?;

        match self.unavailable_marker(&body) {
            Some(marker) => {
                tracing::debug!("Found unavailable marker {marker:?} on {url}");
                Ok(false)
            }
            None => Ok(true),
        }
    }
}
