use std::time::Duration;

use url::Url;

use crate::auth::{ConnectionKind, Credentials};
use crate::error::{PanelError, Result};
use crate::retry::RetryPolicy;

/// Validated connection settings for one panel.
#[derive(Debug, Clone)]
pub struct PanelConfig {
    base_url: String,
    url: Url,
    pub credentials: Credentials,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub page_size: u32,
}

impl PanelConfig {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(PanelError::Configuration("panel base_url is empty".into()));
        }
        let url = Url::parse(trimmed).map_err(|e| {
            PanelError::Configuration(format!("invalid panel base_url '{}': {}", trimmed, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PanelError::Configuration(format!(
                "unsupported scheme '{}' in panel base_url",
                url.scheme()
            )));
        }
        credentials.validate()?;

        Ok(Self {
            base_url: trimmed.to_string(),
            url,
            credentials,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            page_size: 100,
        })
    }

    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn connection_kind(&self) -> ConnectionKind {
        ConnectionKind::detect(&self.url)
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }
}
