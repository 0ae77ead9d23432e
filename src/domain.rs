//! Core domain types shared across the pipeline and adapters

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One market as seen by the scan stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub last_price: Decimal,
    pub volume_24h: Decimal,
    /// 24h price change, fractional (0.05 = +5%)
    pub change_pct: Decimal,
    pub as_of: DateTime<Utc>,
}

/// OHLCV bar used by backtests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Accepted,
    Filled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub equity: Decimal,
    pub cash: Decimal,
    pub buying_power: Decimal,
}

/// A trading strategy proposed by the advisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    pub id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub entry_price: Decimal,
    pub target_price: Decimal,
    pub stop_price: Decimal,
    pub quantity: Decimal,
    pub rationale: String,
    /// Advisor confidence at proposal time, 0.0..=1.0
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// Live re-scoring of a staged strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyEvaluation {
    pub confidence: f64,
    pub rationale: String,
    pub evaluated_at: DateTime<Utc>,
}

/// Outcome of backtesting a strategy over a trailing window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSummary {
    /// Fractional total return over the window (0.02 = +2%)
    pub total_return: Decimal,
    /// Fraction of winning trades (0.60 = 60%)
    pub win_rate: Decimal,
    pub trades: u32,
    pub window_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagedStatus {
    Pending,
    Executed,
    Skipped,
}

impl std::fmt::Display for StagedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagedStatus::Pending => write!(f, "pending"),
            StagedStatus::Executed => write!(f, "executed"),
            StagedStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// A validated strategy parked for execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedStrategy {
    pub id: Uuid,
    pub run_id: Uuid,
    pub strategy: StrategySpec,
    pub status: StagedStatus,
    pub staged_at: DateTime<Utc>,
}

impl StagedStrategy {
    pub fn new(run_id: Uuid, strategy: StrategySpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            strategy,
            status: StagedStatus::Pending,
            staged_at: Utc::now(),
        }
    }
}
