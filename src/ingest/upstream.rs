use futures::future::BoxFuture;
use reqwest::{header, Client};
use tracing::debug;

use crate::config::{check_host_allowed, UpstreamConfig, UpstreamMethod};
use crate::error::{ConfigError, FetchError};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; V16Tracker/0.1)";
const BODY_PREVIEW_LEN: usize = 500;

/// Body of one upstream response.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedPayload {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl FeedPayload {
    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            content_type: Some("application/json".to_string()),
        }
    }
}

/// Where poll cycles get their bytes from.
pub trait FeedSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<FeedPayload, FetchError>>;

    /// Human-readable origin, for health output and logs.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    config: UpstreamConfig,
}

impl UpstreamClient {
    /// Fails with a configuration error if the endpoint host is not allow-listed.
    pub fn new(config: UpstreamConfig) -> Result<Self, ConfigError> {
        check_host_allowed(&config.endpoint, &config.allowed_hosts)?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json, text/plain;q=0.9, */*;q=0.8"),
        );
        if let Some(origin) = origin_of(&config) {
            if let Ok(value) = header::HeaderValue::from_str(&origin) {
                headers.insert(header::ORIGIN, value.clone());
                headers.insert(header::REFERER, value);
            }
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::invalid("UPSTREAM_ENDPOINT", config.endpoint.as_str(), e.to_string()))?;

        Ok(Self { client, config })
    }

    async fn fetch_payload(&self) -> Result<FeedPayload, FetchError> {
        // re-checked per request so a rejected host never sees traffic
        check_host_allowed(&self.config.endpoint, &self.config.allowed_hosts)?;

        let url = self.config.endpoint.clone();
        let request = match (self.config.method, &self.config.payload) {
            (UpstreamMethod::Post, Some(payload)) => self.client.post(url).json(payload),
            (UpstreamMethod::Post, None) => self.client.post(url),
            (UpstreamMethod::Get, _) => self.client.get(url),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: body.chars().take(BODY_PREVIEW_LEN).collect(),
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();
        debug!(
            "Fetched {} bytes from {} (content-type={:?})",
            body.len(),
            self.config.endpoint,
            content_type
        );
        Ok(FeedPayload { body, content_type })
    }
}

impl FeedSource for UpstreamClient {
    fn fetch(&self) -> BoxFuture<'_, Result<FeedPayload, FetchError>> {
        Box::pin(self.fetch_payload())
    }

    fn describe(&self) -> String {
        self.config.endpoint.to_string()
    }
}

fn origin_of(config: &UpstreamConfig) -> Option<String> {
    let host = config.endpoint.host_str()?;
    Some(format!("{}://{}", config.endpoint.scheme(), host))
}
