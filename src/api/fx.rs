use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::http::HttpClient;
use super::{FxRate, FxRateSource};
use crate::config::FeedSettings;
use crate::error::FeedError;

/// Currency rate poller against an exchangerate.host style `/latest` endpoint
#[derive(Clone)]
pub struct FxClient {
    http: HttpClient,
    url: String,
    base: String,
    quote: String,
}

#[derive(Debug, Deserialize)]
struct LatestRates {
    #[serde(default)]
    rates: HashMap<String, f64>,
}

impl FxClient {
    pub fn new(settings: &FeedSettings) -> Result<Self, FeedError> {
        Ok(Self {
            http: HttpClient::new(
                "FX",
                Duration::from_secs(settings.read_timeout_secs.max(1)),
                settings.requests_per_minute,
            )?,
            url: settings.fx_url.trim_end_matches('/').to_string(),
            base: settings.fx_base.to_uppercase(),
            quote: settings.fx_quote.to_uppercase(),
        })
    }
}

#[async_trait]
impl FxRateSource for FxClient {
    async fn fetch_rate(&self) -> Result<FxRate, FeedError> {
        let url = format!(
            "{}/latest?base={}&symbols={}",
            self.url, self.base, self.quote
        );
        let latest: LatestRates = self.http.get(&url).await?.json().await?;

        let rate = latest.rates.get(&self.quote).copied().ok_or_else(|| {
            FeedError::Protocol(format!("no {} rate in response", self.quote))
        })?;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(FeedError::Protocol(format!("invalid rate {}", rate)));
        }

        tracing::debug!("{}/{} = {}", self.base, self.quote, rate);
        Ok(FxRate {
            base: self.base.clone(),
            quote: self.quote.clone(),
            rate,
        })
    }
}
