use analysis_core::{Direction, EngineError, StrategyKind};
use thiserror::Error;

/// Reasons a strategy's signal is discarded before aggregation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    #[error("{strategy} {direction} signal has stop {stop:.4} / target {target:.4} on the wrong side of entry {price:.4}")]
    WrongSide {
        strategy: StrategyKind,
        direction: Direction,
        price: f64,
        stop: f64,
        target: f64,
    },

    #[error("{strategy} signal {field} {value:.4} outside [0, 1]")]
    OutOfRange {
        strategy: StrategyKind,
        field: &'static str,
        value: f64,
    },

    #[error("{strategy} signal has invalid price {price}")]
    InvalidPrice { strategy: StrategyKind, price: f64 },

    #[error("{strategy} emitted a signal without a direction")]
    NoDirection { strategy: StrategyKind },

    #[error("{strategy} signal attributed to {claimed}")]
    Misattributed {
        strategy: StrategyKind,
        claimed: StrategyKind,
    },
}

impl From<SignalError> for EngineError {
    fn from(err: SignalError) -> Self {
        EngineError::InvariantViolation(err.to_string())
    }
}
