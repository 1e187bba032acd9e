use governor::{Quota, RateLimiter};
use reqwest::{Client, Response};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::error::FeedError;

const MAX_RETRIES: u32 = 3;

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Rate-limited GET with retry on 429, 5xx and network errors
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub(crate) struct HttpClient {
    client: Client,
    rate_limiter: Arc<DirectRateLimiter>,
    label: &'static str,
}

impl HttpClient {
    pub(crate) fn new(
        label: &'static str,
        timeout: Duration,
        requests_per_minute: u32,
    ) -> Result<Self, FeedError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            rate_limiter,
            label,
        })
    }

    pub(crate) async fn get(&self, url: &str) -> Result<Response, FeedError> {
        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if (status.as_u16() == 429 || status.is_server_error()) && attempt < MAX_RETRIES {
                        let backoff_secs = 2u64.pow(attempt);
                        tracing::warn!(
                            "{} returned {}, retrying in {}s (attempt {}/{})",
                            self.label,
                            status,
                            backoff_secs,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        continue;
                    }

                    // Other errors (4xx) - don't retry
                    let message = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    return Err(FeedError::Http {
                        status: status.as_u16(),
                        message,
                    });
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let backoff_secs = 2u64.pow(attempt);
                    tracing::warn!(
                        "Network error from {}: {}, retrying in {}s (attempt {}/{})",
                        self.label,
                        e,
                        backoff_secs,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(FeedError::Unavailable(format!(
            "{} failed after {} retries",
            self.label, MAX_RETRIES
        )))
    }
}
