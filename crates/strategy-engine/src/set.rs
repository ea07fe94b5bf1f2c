use analysis_core::{Direction, MarketSnapshot, OpenPosition, Signal, StrategyKind};
use tracing::{debug, warn};

use crate::{SignalError, Strategy, StrategyConfig};

/// Owned collection of strategies, at most one per kind.
#[derive(Default)]
pub struct StrategySet {
    strategies: Vec<Box<dyn Strategy>>,
}

impl StrategySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// All five strategies with default parameters
    pub fn with_defaults() -> Self {
        Self::from_configs(StrategyKind::ALL.into_iter().map(StrategyConfig::default_for))
    }

    pub fn from_configs(configs: impl IntoIterator<Item = StrategyConfig>) -> Self {
        let mut set = Self::new();
        for config in configs {
            set.insert(config.build());
        }
        set
    }

    /// Add a strategy, replacing any existing one of the same kind.
    pub fn insert(&mut self, strategy: Box<dyn Strategy>) {
        let kind = strategy.kind();
        match self.strategies.iter().position(|s| s.kind() == kind) {
            Some(i) => self.strategies[i] = strategy,
            None => self.strategies.push(strategy),
        }
    }

    pub fn remove(&mut self, kind: StrategyKind) -> Option<Box<dyn Strategy>> {
        let i = self.strategies.iter().position(|s| s.kind() == kind)?;
        Some(self.strategies.remove(i))
    }

    pub fn get(&self, kind: StrategyKind) -> Option<&dyn Strategy> {
        self.strategies
            .iter()
            .find(|s| s.kind() == kind)
            .map(|s| s.as_ref())
    }

    /// Returns false when no strategy of that kind is registered.
    pub fn set_enabled(&mut self, kind: StrategyKind, enabled: bool) -> bool {
        match self.strategies.iter_mut().find(|s| s.kind() == kind) {
            Some(s) => {
                s.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Enable only `kind`, disabling every other strategy.
    pub fn enable_only(&mut self, kind: StrategyKind) {
        for s in &mut self.strategies {
            s.set_enabled(s.kind() == kind);
        }
    }

    pub fn enabled_kinds(&self) -> Vec<StrategyKind> {
        self.strategies
            .iter()
            .filter(|s| s.is_enabled())
            .map(|s| s.kind())
            .collect()
    }

    pub fn configs(&self) -> Vec<StrategyConfig> {
        self.strategies.iter().map(|s| s.config()).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Signals per enabled strategy that has enough history, in registration
    /// order. Malformed signals are logged and dropped.
    pub fn analyze(&self, snapshot: &MarketSnapshot) -> Vec<(StrategyKind, Vec<Signal>)> {
        self.strategies
            .iter()
            .filter(|s| s.is_enabled())
            .map(|s| {
                let kind = s.kind();
                if snapshot.len() < s.min_data_points() {
                    debug!(
                        strategy = %kind,
                        bars = snapshot.len(),
                        need = s.min_data_points(),
                        "not enough history"
                    );
                    return (kind, Vec::new());
                }
                let signals = s
                    .analyze(snapshot)
                    .into_iter()
                    .filter(|signal| match check_signal(kind, signal) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(symbol = %snapshot.symbol, "discarding signal: {}", e);
                            false
                        }
                    })
                    .collect();
                (kind, signals)
            })
            .collect()
    }

    /// Ask the strategy that opened `position` whether to close it. Positions
    /// of unknown origin are offered to every enabled strategy.
    pub fn should_exit(
        &self,
        snapshot: &MarketSnapshot,
        position: &OpenPosition,
    ) -> Option<(StrategyKind, String)> {
        if let Some(kind) = position.strategy {
            if let Some(s) = self.get(kind) {
                return s.should_exit(snapshot, position).map(|r| (kind, r));
            }
        }
        self.strategies
            .iter()
            .filter(|s| s.is_enabled())
            .find_map(|s| s.should_exit(snapshot, position).map(|r| (s.kind(), r)))
    }
}

/// Side-of-entry and range checks applied to every strategy output.
pub fn check_signal(kind: StrategyKind, signal: &Signal) -> Result<(), SignalError> {
    if signal.strategy != kind {
        return Err(SignalError::Misattributed {
            strategy: kind,
            claimed: signal.strategy,
        });
    }
    if signal.direction == Direction::None {
        return Err(SignalError::NoDirection { strategy: kind });
    }
    for (field, value) in [("strength", signal.strength), ("confidence", signal.confidence)] {
        if !(0.0..=1.0).contains(&value) {
            return Err(SignalError::OutOfRange {
                strategy: kind,
                field,
                value,
            });
        }
    }
    if !signal.price.is_finite() || signal.price <= 0.0 {
        return Err(SignalError::InvalidPrice {
            strategy: kind,
            price: signal.price,
        });
    }
    if signal.validate().is_err() {
        return Err(SignalError::WrongSide {
            strategy: kind,
            direction: signal.direction,
            price: signal.price,
            stop: signal.stop_loss,
            target: signal.take_profit,
        });
    }
    Ok(())
}
