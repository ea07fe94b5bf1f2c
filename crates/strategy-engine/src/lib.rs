pub mod aggregator;
pub mod error;
pub mod set;
pub mod strategies;
pub mod strategy;
pub mod weights;

pub use aggregator::{
    AggregatorConfig, CombinePolicy, CombinedScore, SignalAggregator, StrategyContribution,
};
pub use error::SignalError;
pub use set::StrategySet;
pub use strategies::{
    BreakoutConfig, BreakoutStrategy, MeanReversionConfig, MeanReversionStrategy,
    StatisticalConfig, StatisticalStrategy, TrendConfig, TrendFollowingStrategy,
    VolatilityConfig, VolatilityStrategy,
};
pub use strategy::{Strategy, StrategyConfig};
pub use weights::RegimeWeights;
