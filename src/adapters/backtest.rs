//! Trailing-window backtest used by the Validation stage
//!
//! Deliberately simple: each consecutive candle pair is treated as one
//! round trip in the strategy's direction. The Validation stage only needs
//! total return and win rate to gate staging.

use rust_decimal::Decimal;

use crate::domain::{BacktestSummary, Candle, OrderSide};

/// Backtest a direction over daily candles.
///
/// Returns a zero summary when there are fewer than two candles or the
/// series starts at zero, both of which make returns meaningless.
pub fn run_backtest(candles: &[Candle], side: OrderSide, window_days: u32) -> BacktestSummary {
    let empty = BacktestSummary {
        total_return: Decimal::ZERO,
        win_rate: Decimal::ZERO,
        trades: 0,
        window_days,
    };

    let (first, last) = match (candles.first(), candles.last()) {
        (Some(f), Some(l)) if f.close > Decimal::ZERO => (f.close, l.close),
        _ => return empty,
    };
    if candles.len() < 2 {
        return empty;
    }

    let mut wins = 0u32;
    let mut trades = 0u32;
    for pair in candles.windows(2) {
        let pnl = match side {
            OrderSide::Buy => pair[1].close - pair[0].close,
            OrderSide::Sell => pair[0].close - pair[1].close,
        };
        trades += 1;
        if pnl > Decimal::ZERO {
            wins += 1;
        }
    }

    let directional = last / first - Decimal::ONE;
    let total_return = match side {
        OrderSide::Buy => directional,
        OrderSide::Sell => -directional,
    };

    BacktestSummary {
        total_return,
        win_rate: Decimal::from(wins) / Decimal::from(trades),
        trades,
        window_days,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn candles(closes: &[Decimal]) -> Vec<Candle> {
        let start = Utc::now() - Duration::days(closes.len() as i64);
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                ts: start + Duration::days(i as i64),
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: dec!(1000),
            })
            .collect()
    }

    #[test]
    fn test_uptrend_long_backtest() {
        let series = candles(&[dec!(100), dec!(102), dec!(101), dec!(105), dec!(110)]);
        let summary = run_backtest(&series, OrderSide::Buy, 30);

        assert_eq!(summary.trades, 4);
        assert_eq!(summary.total_return, dec!(0.10));
        assert_eq!(summary.win_rate, dec!(0.75));
    }

    #[test]
    fn test_short_side_inverts_return() {
        let series = candles(&[dec!(100), dec!(90)]);
        let summary = run_backtest(&series, OrderSide::Sell, 30);

        assert_eq!(summary.total_return, dec!(0.10));
        assert_eq!(summary.win_rate, dec!(1));
    }

    #[test]
    fn test_too_few_candles_is_zero_summary() {
        let series = candles(&[dec!(100)]);
        let summary = run_backtest(&series, OrderSide::Buy, 30);
        assert_eq!(summary.trades, 0);
        assert_eq!(summary.total_return, Decimal::ZERO);
    }
}
