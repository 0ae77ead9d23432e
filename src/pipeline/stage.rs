use serde::{Deserialize, Serialize};

/// Ordered stages of a trading run
///
/// A run advances strictly forward through these; there is no skipping
/// and no going back. `Execution` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    MarketScan,
    AssetSelection,
    StrategyGeneration,
    Validation,
    Staging,
    Execution,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::MarketScan,
        Stage::AssetSelection,
        Stage::StrategyGeneration,
        Stage::Validation,
        Stage::Staging,
        Stage::Execution,
    ];

    pub fn first() -> Stage {
        Stage::MarketScan
    }

    /// The stage that follows this one, or `None` for the terminal stage
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::MarketScan => Some(Stage::AssetSelection),
            Stage::AssetSelection => Some(Stage::StrategyGeneration),
            Stage::StrategyGeneration => Some(Stage::Validation),
            Stage::Validation => Some(Stage::Staging),
            Stage::Staging => Some(Stage::Execution),
            Stage::Execution => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::MarketScan => "market_scan",
            Stage::AssetSelection => "asset_selection",
            Stage::StrategyGeneration => "strategy_generation",
            Stage::Validation => "validation",
            Stage::Staging => "staging",
            Stage::Execution => "execution",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = crate::error::GambitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market_scan" => Ok(Stage::MarketScan),
            "asset_selection" => Ok(Stage::AssetSelection),
            "strategy_generation" => Ok(Stage::StrategyGeneration),
            "validation" => Ok(Stage::Validation),
            "staging" => Ok(Stage::Staging),
            "execution" => Ok(Stage::Execution),
            other => Err(crate::error::GambitError::Validation(format!(
                "unknown stage: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_chain_covers_all() {
        let mut seen = vec![Stage::first()];
        while let Some(next) = seen.last().unwrap().next() {
            seen.push(next);
        }
        assert_eq!(seen, Stage::ALL.to_vec());
    }

    #[test]
    fn test_execution_is_terminal() {
        assert!(Stage::Execution.is_terminal());
        assert!(!Stage::Staging.is_terminal());
    }

    #[test]
    fn test_ordering_is_pipeline_order() {
        assert!(Stage::MarketScan < Stage::AssetSelection);
        assert!(Stage::Staging < Stage::Execution);
    }

    #[test]
    fn test_round_trip_str() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
    }
}
