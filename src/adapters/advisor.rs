//! AI decision-service adapter
//!
//! Proposes strategies from scan candidates and re-scores staged strategies
//! before execution. Consumed through the [`StrategyAdvisor`] trait so the
//! orchestrator never depends on the concrete service.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::domain::{MarketSnapshot, StrategyEvaluation, StrategySpec};
use crate::error::{GambitError, Result};

/// Abstract AI decision service
#[async_trait]
pub trait StrategyAdvisor: Send + Sync {
    /// Propose a strategy for the given candidate markets
    async fn propose_strategy(&self, candidates: &[MarketSnapshot]) -> Result<StrategySpec>;

    /// Re-score a staged strategy against current market conditions
    async fn evaluate_strategy(
        &self,
        strategy: &StrategySpec,
        market: &MarketSnapshot,
    ) -> Result<StrategyEvaluation>;
}

#[derive(Serialize)]
struct ProposeRequest<'a> {
    candidates: &'a [MarketSnapshot],
}

#[derive(Serialize)]
struct EvaluateRequest<'a> {
    strategy: &'a StrategySpec,
    market: &'a MarketSnapshot,
}

/// REST-backed advisor client
pub struct RestAdvisor {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestAdvisor {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let mut builder = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let text = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(GambitError::Validation(format!("{}: {}", status, text)))
        } else {
            Err(GambitError::Transport(format!("{}: {}", status, text)))
        }
    }
}

#[async_trait]
impl StrategyAdvisor for RestAdvisor {
    async fn propose_strategy(&self, candidates: &[MarketSnapshot]) -> Result<StrategySpec> {
        self.post_json("/v1/strategies/propose", &ProposeRequest { candidates })
            .await
    }

    async fn evaluate_strategy(
        &self,
        strategy: &StrategySpec,
        market: &MarketSnapshot,
    ) -> Result<StrategyEvaluation> {
        self.post_json(
            "/v1/strategies/evaluate",
            &EvaluateRequest { strategy, market },
        )
        .await
    }
}
