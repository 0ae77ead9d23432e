//! Deterministic in-process brokerage and advisor
//!
//! Backs dry-run mode and integration tests: no network, no randomness,
//! same inputs always produce the same strategies and fills.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

use crate::domain::{
    AccountInfo, Candle, MarketSnapshot, OrderReceipt, OrderRequest, OrderSide, OrderStatus,
    StrategyEvaluation, StrategySpec,
};
use crate::error::{GambitError, Result};

const UNIVERSE: &[&str] = &["AAPL", "MSFT", "NVDA", "TSLA", "AMZN", "SPY"];

fn symbol_seed(symbol: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    hasher.finish()
}

fn base_price(symbol: &str) -> Decimal {
    // Spread prices across 50..=450 per symbol, stable across runs
    Decimal::from(50 + (symbol_seed(symbol) % 400))
}

fn change_pct(symbol: &str) -> Decimal {
    // 0%..+5% daily change, stable per symbol; the sim universe only
    // drifts upward so staged strategies are always long
    let raw = (symbol_seed(symbol) % 6) as i64;
    Decimal::new(raw, 2)
}

/// Simulated brokerage with a fixed market universe
pub struct SimBrokerage;

impl SimBrokerage {
    fn snapshot(symbol: &str) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.to_string(),
            last_price: base_price(symbol),
            volume_24h: Decimal::from(10_000 + (symbol_seed(symbol) % 90_000)),
            change_pct: change_pct(symbol),
            as_of: Utc::now(),
        }
    }
}

#[async_trait]
impl super::Brokerage for SimBrokerage {
    async fn scan_markets(&self) -> Result<Vec<MarketSnapshot>> {
        Ok(UNIVERSE.iter().map(|s| Self::snapshot(s)).collect())
    }

    async fn quote(&self, symbol: &str) -> Result<MarketSnapshot> {
        if !UNIVERSE.contains(&symbol) {
            return Err(GambitError::MarketDataUnavailable(symbol.to_string()));
        }
        Ok(Self::snapshot(symbol))
    }

    async fn candles(&self, symbol: &str, days: u32) -> Result<Vec<Candle>> {
        if !UNIVERSE.contains(&symbol) {
            return Err(GambitError::MarketDataUnavailable(symbol.to_string()));
        }

        // Gentle uptrend with a periodic dip so win rates land around 75%
        let base = base_price(symbol);
        let start = Utc::now() - Duration::days(days as i64);
        let mut candles = Vec::with_capacity(days as usize);
        let mut close = base;
        for i in 0..days {
            let drift = if i % 4 == 3 {
                dec!(-0.002)
            } else {
                dec!(0.004)
            };
            let next = close * (Decimal::ONE + drift);
            candles.push(Candle {
                ts: start + Duration::days(i as i64),
                open: close,
                high: next.max(close) * dec!(1.002),
                low: next.min(close) * dec!(0.998),
                close: next,
                volume: Decimal::from(5_000 + (i as u64 * 17) % 3_000),
            });
            close = next;
        }
        Ok(candles)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt> {
        if order.quantity <= Decimal::ZERO {
            return Err(GambitError::OrderRejected(
                "quantity must be positive".to_string(),
            ));
        }

        Ok(OrderReceipt {
            order_id: Uuid::new_v4().to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            fill_price: Some(order.limit_price.unwrap_or_else(|| base_price(&order.symbol))),
            status: OrderStatus::Filled,
            submitted_at: Utc::now(),
        })
    }

    async fn account(&self) -> Result<AccountInfo> {
        Ok(AccountInfo {
            equity: dec!(100000),
            cash: dec!(60000),
            buying_power: dec!(120000),
        })
    }
}

/// Simulated advisor: momentum-follows the strongest candidate
pub struct SimAdvisor;

#[async_trait]
impl super::StrategyAdvisor for SimAdvisor {
    async fn propose_strategy(&self, candidates: &[MarketSnapshot]) -> Result<StrategySpec> {
        let pick = candidates
            .iter()
            .max_by_key(|m| m.change_pct.abs())
            .ok_or_else(|| GambitError::Validation("no candidates supplied".to_string()))?;

        let side = if pick.change_pct >= Decimal::ZERO {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        let entry = pick.last_price;

        Ok(StrategySpec {
            id: Uuid::new_v4(),
            symbol: pick.symbol.clone(),
            side,
            entry_price: entry,
            target_price: match side {
                OrderSide::Buy => entry * dec!(1.05),
                OrderSide::Sell => entry * dec!(0.95),
            },
            stop_price: match side {
                OrderSide::Buy => entry * dec!(0.97),
                OrderSide::Sell => entry * dec!(1.03),
            },
            quantity: dec!(10),
            rationale: format!(
                "momentum continuation on {} ({}% move)",
                pick.symbol,
                pick.change_pct * dec!(100)
            ),
            confidence: 0.8,
            created_at: Utc::now(),
        })
    }

    async fn evaluate_strategy(
        &self,
        strategy: &StrategySpec,
        market: &MarketSnapshot,
    ) -> Result<StrategyEvaluation> {
        // Confidence decays as price drifts away from the planned entry
        let drift = if strategy.entry_price > Decimal::ZERO {
            ((market.last_price - strategy.entry_price) / strategy.entry_price).abs()
        } else {
            Decimal::ONE
        };
        let drift_f64 = drift.to_f64().unwrap_or(1.0);
        let confidence = (strategy.confidence - drift_f64 * 2.0).max(0.0);

        Ok(StrategyEvaluation {
            confidence,
            rationale: format!("entry drift {:.4}", drift_f64),
            evaluated_at: Utc::now(),
        })
    }
}
