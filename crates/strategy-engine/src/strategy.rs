use analysis_core::{
    Direction, MarketSnapshot, OpenPosition, Signal, SignalType, StrategyKind,
};
use serde::{Deserialize, Serialize};

use crate::strategies::{
    BreakoutConfig, BreakoutStrategy, MeanReversionConfig, MeanReversionStrategy,
    StatisticalConfig, StatisticalStrategy, TrendConfig, TrendFollowingStrategy,
    VolatilityConfig, VolatilityStrategy,
};

/// Capability set shared by every trading strategy.
///
/// `analyze` must be a pure function of the snapshot. The owning
/// [`StrategySet`](crate::StrategySet) handles the enabled flag and the
/// minimum history, and discards signals whose levels are on the wrong side
/// of entry.
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn name(&self) -> &str {
        self.kind().name()
    }

    /// Candidate entry signals for the latest bar
    fn analyze(&self, snapshot: &MarketSnapshot) -> Vec<Signal>;

    /// Reason to close `position` now, if any
    fn should_exit(&self, snapshot: &MarketSnapshot, position: &OpenPosition) -> Option<String>;

    fn stop_loss(&self, snapshot: &MarketSnapshot, direction: Direction, entry: f64) -> f64;

    fn take_profit(&self, snapshot: &MarketSnapshot, direction: Direction, entry: f64) -> f64;

    /// Bars of history required before `analyze` produces anything
    fn min_data_points(&self) -> usize;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);

    /// Current parameters, for display and persistence
    fn config(&self) -> StrategyConfig;
}

/// Typed parameters per strategy kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    TrendFollowing(TrendConfig),
    MeanReversion(MeanReversionConfig),
    Breakout(BreakoutConfig),
    Volatility(VolatilityConfig),
    Statistical(StatisticalConfig),
}

impl StrategyConfig {
    pub fn kind(&self) -> StrategyKind {
        match self {
            StrategyConfig::TrendFollowing(_) => StrategyKind::TrendFollowing,
            StrategyConfig::MeanReversion(_) => StrategyKind::MeanReversion,
            StrategyConfig::Breakout(_) => StrategyKind::Breakout,
            StrategyConfig::Volatility(_) => StrategyKind::Volatility,
            StrategyConfig::Statistical(_) => StrategyKind::Statistical,
        }
    }

    /// Default parameters for `kind`
    pub fn default_for(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::TrendFollowing => StrategyConfig::TrendFollowing(TrendConfig::default()),
            StrategyKind::MeanReversion => {
                StrategyConfig::MeanReversion(MeanReversionConfig::default())
            }
            StrategyKind::Breakout => StrategyConfig::Breakout(BreakoutConfig::default()),
            StrategyKind::Volatility => StrategyConfig::Volatility(VolatilityConfig::default()),
            StrategyKind::Statistical => {
                StrategyConfig::Statistical(StatisticalConfig::default())
            }
        }
    }

    pub fn build(self) -> Box<dyn Strategy> {
        match self {
            StrategyConfig::TrendFollowing(c) => Box::new(TrendFollowingStrategy::new(c)),
            StrategyConfig::MeanReversion(c) => Box::new(MeanReversionStrategy::new(c)),
            StrategyConfig::Breakout(c) => Box::new(BreakoutStrategy::new(c)),
            StrategyConfig::Volatility(c) => Box::new(VolatilityStrategy::new(c)),
            StrategyConfig::Statistical(c) => Box::new(StatisticalStrategy::new(c)),
        }
    }
}

/// Stop `multiple` ATRs away from entry, against the trade.
pub(crate) fn atr_stop(direction: Direction, entry: f64, atr: f64, multiple: f64) -> f64 {
    entry - direction.sign() * atr * multiple
}

/// Target at `reward_risk` times the distance to `stop`, with the trade.
pub(crate) fn reward_target(direction: Direction, entry: f64, stop: f64, reward_risk: f64) -> f64 {
    entry + direction.sign() * (entry - stop).abs() * reward_risk
}

/// Exit when price has crossed the position's own stop or target.
pub(crate) fn protective_exit(position: &OpenPosition, price: f64) -> Option<String> {
    let sign = position.direction.sign();
    if let Some(stop) = position.stop_loss {
        if sign * (price - stop) <= 0.0 {
            return Some(format!("stop loss {:.4} hit at {:.4}", stop, price));
        }
    }
    if let Some(target) = position.take_profit {
        if sign * (price - target) >= 0.0 {
            return Some(format!("take profit {:.4} hit at {:.4}", target, price));
        }
    }
    None
}

pub(crate) fn entry_signal<S: Strategy + ?Sized>(
    strategy: &S,
    snapshot: &MarketSnapshot,
    direction: Direction,
    strength: f64,
    confidence: f64,
    reason: String,
) -> Signal {
    let price = snapshot.current_price;
    Signal {
        signal_type: SignalType::Entry,
        direction,
        strength: strength.clamp(0.0, 1.0),
        price,
        stop_loss: strategy.stop_loss(snapshot, direction, price),
        take_profit: strategy.take_profit(snapshot, direction, price),
        confidence: confidence.clamp(0.0, 1.0),
        reason,
        strategy: strategy.kind(),
        timestamp: snapshot.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_serializes_with_kind_tag() {
        let config = StrategyConfig::default_for(StrategyKind::TrendFollowing);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["kind"], "trend_following");
        assert_eq!(json["min_adx"], 25.0);

        let back: StrategyConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn built_strategy_reports_its_kind() {
        for kind in StrategyKind::ALL {
            let strategy = StrategyConfig::default_for(kind).build();
            assert_eq!(strategy.kind(), kind);
            assert_eq!(strategy.config().kind(), kind);
            assert!(strategy.is_enabled());
        }
    }

    #[test]
    fn atr_levels_sit_on_the_right_side() {
        let stop = atr_stop(Direction::Long, 2000.0, 20.0, 2.0);
        assert_eq!(stop, 1960.0);
        assert_eq!(reward_target(Direction::Long, 2000.0, stop, 3.0), 2120.0);

        let stop = atr_stop(Direction::Short, 100.0, 2.0, 1.5);
        assert_eq!(stop, 103.0);
        assert_eq!(reward_target(Direction::Short, 100.0, stop, 2.0), 94.0);
    }
}
