//! Brokerage API adapter
//!
//! The pipeline consumes the brokerage only through the [`Brokerage`]
//! trait; every call is expected to be wrapped in a circuit breaker and a
//! retry profile by the caller. `RestBrokerage` maps HTTP status classes
//! into the crate error taxonomy so retry predicates can distinguish
//! transient transport problems from order rejections.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::domain::{AccountInfo, Candle, MarketSnapshot, OrderReceipt, OrderRequest};
use crate::error::{GambitError, Result};

/// Abstract brokerage used by pipeline stages
#[async_trait]
pub trait Brokerage: Send + Sync {
    /// All tradeable markets with current stats
    async fn scan_markets(&self) -> Result<Vec<MarketSnapshot>>;

    /// Current snapshot for one symbol
    async fn quote(&self, symbol: &str) -> Result<MarketSnapshot>;

    /// Daily candles over a trailing window
    async fn candles(&self, symbol: &str, days: u32) -> Result<Vec<Candle>>;

    /// Submit an order
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt>;

    /// Account balances
    async fn account(&self) -> Result<AccountInfo>;
}

/// REST-backed brokerage client
pub struct RestBrokerage {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestBrokerage {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.request(reqwest::Method::GET, path).send().await?;
        Self::read_json(response).await
    }
}

/// Map HTTP status classes onto the error taxonomy: 429 is rate limiting,
/// other 4xx are business-rule rejections, 5xx are transient transport
/// failures.
fn classify_status(status: StatusCode, body: &str) -> GambitError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        GambitError::RateLimited(body.to_string())
    } else if status.is_client_error() {
        GambitError::OrderRejected(format!("{}: {}", status, body))
    } else {
        GambitError::Transport(format!("{}: {}", status, body))
    }
}

#[async_trait]
impl Brokerage for RestBrokerage {
    async fn scan_markets(&self) -> Result<Vec<MarketSnapshot>> {
        self.get_json("/v1/markets").await
    }

    async fn quote(&self, symbol: &str) -> Result<MarketSnapshot> {
        self.get_json(&format!("/v1/markets/{}", symbol)).await
    }

    async fn candles(&self, symbol: &str, days: u32) -> Result<Vec<Candle>> {
        self.get_json(&format!("/v1/markets/{}/candles?days={}", symbol, days))
            .await
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt> {
        let response = self
            .request(reqwest::Method::POST, "/v1/orders")
            .json(order)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn account(&self) -> Result<AccountInfo> {
        self.get_json("/v1/account").await
    }
}
