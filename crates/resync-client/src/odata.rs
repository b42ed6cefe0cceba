use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode, Url};
use resync_core::adapter::UpstreamClient;
use resync_core::config::HttpConfig;
use resync_core::error::AppError;
use resync_core::models::Page;
use tokio::time::sleep;
use tracing::{debug, warn};

/// HTTP client for RESO Web API (OData) servers.
///
/// Every request carries the bearer token handed in by the caller; token
/// lifetime is managed by the pipeline.
///
/// # Examples
///
/// ```no_run
/// use resync_client::ODataClient;
/// use resync_core::adapter::UpstreamClient;
/// use resync_core::config::HttpConfig;
/// use url::Url;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ODataClient::new(HttpConfig::default())?;
/// let url = Url::parse("https://resoapi.utahrealestate.com/reso/odata/Property?$top=10")?;
/// let page = client.fetch_page(&url, "token").await?;
/// println!("Fetched {} records", page.value.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ODataClient {
    client: Client,
    config: HttpConfig,
}

impl ODataClient {
    /// Creates a client with the given timeout and retry policy.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ClientError` if the HTTP client cannot be built.
    pub fn new(config: HttpConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("resync/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Makes an authenticated GET request with automatic retry on transient
    /// failures.
    ///
    /// Retries, with growing delays, on:
    /// - Network errors
    /// - Timeouts
    /// - Server errors (5xx)
    /// - Rate limiting (429)
    async fn request_with_retry(
        &self,
        url: &Url,
        token: &str,
        accept: &str,
    ) -> Result<reqwest::Response, AppError> {
        let max_retries = self.config.max_retries.max(1);
        let base_delay = self.config.retry_base_delay;
        let mut last_error = AppError::Generic("No attempts made".to_string());

        for attempt in 1..=max_retries {
            let request = self
                .client
                .get(url.clone())
                .bearer_auth(token)
                .header(header::ACCEPT, accept);

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status.is_success() {
                        return Ok(resp);
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        last_error = AppError::RateLimitExceeded;
                        if attempt < max_retries {
                            let delay = retry_after(&resp)
                                .unwrap_or_else(|| base_delay * 2_u32.pow(attempt));
                            warn!(url = %url, attempt, delay_ms = delay.as_millis() as u64, "Rate limited, backing off");
                            sleep(delay).await;
                            continue;
                        }
                    }

                    if status.is_server_error() {
                        last_error = AppError::ClientError(format!(
                            "Server error: HTTP {}",
                            status.as_u16()
                        ));
                        if attempt < max_retries {
                            sleep(base_delay * attempt).await;
                            continue;
                        }
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        break;
                    }

                    // Other 4xx: the request itself is wrong, retrying won't help.
                    let body = resp.text().await.unwrap_or_default();
                    return Err(AppError::ClientError(format!(
                        "HTTP {} from {}: {}",
                        status.as_u16(),
                        url,
                        truncate(&body, 300)
                    )));
                }
                Err(e) => {
                    if e.is_timeout() {
                        last_error = AppError::Timeout(self.config.timeout.as_secs());
                    } else if e.is_connect() {
                        last_error = AppError::NetworkError(format!("Connection failed: {}", e));
                    } else {
                        last_error = AppError::ClientError(e.to_string());
                    }

                    if attempt < max_retries && (e.is_timeout() || e.is_connect()) {
                        debug!(url = %url, attempt, error = %e, "Retrying request");
                        sleep(base_delay * attempt).await;
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl UpstreamClient for ODataClient {
    async fn fetch_page(&self, url: &Url, token: &str) -> Result<Page, AppError> {
        let resp = self
            .request_with_retry(url, token, "application/json")
            .await?;
        let page: Page = resp
            .json()
            .await
            .map_err(|e| AppError::ClientError(format!("Invalid OData page from {}: {}", url, e)))?;
        Ok(page)
    }

    async fn fetch_metadata(&self, url: &Url, token: &str) -> Result<String, AppError> {
        let resp = self
            .request_with_retry(url, token, "application/xml")
            .await?;
        let body = resp
            .text()
            .await
            .map_err(|e| AppError::ClientError(e.to_string()))?;
        if body.trim().is_empty() {
            return Err(AppError::EmptyResponse);
        }
        Ok(body)
    }
}

/// Parses a `Retry-After` header given in seconds.
fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
