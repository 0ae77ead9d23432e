pub mod advisor;
pub mod backtest;
pub mod brokerage;
pub mod sim;

pub use advisor::{RestAdvisor, StrategyAdvisor};
pub use backtest::run_backtest;
pub use brokerage::{Brokerage, RestBrokerage};
pub use sim::{SimAdvisor, SimBrokerage};
