//! Volatility
//!
//! Two entry modes: expansion (wide ATR with momentum confirmation) and
//! squeeze release (price leaves the bands within a few bars of a squeeze
//! ending).

use analysis_core::{Direction, MarketSnapshot, OpenPosition, Signal, StrategyKind};
use serde::{Deserialize, Serialize};

use crate::strategy::{atr_stop, entry_signal, protective_exit, reward_target};
use crate::{Strategy, StrategyConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityConfig {
    /// ATR as % of price that counts as expansion
    pub expansion_atr_percent: f64,
    /// RSI distance from 50 required to confirm momentum
    pub momentum_rsi_offset: f64,
    /// Squeeze must have ended within this many bars
    pub squeeze_window: usize,
    pub atr_stop_multiplier: f64,
    pub reward_risk: f64,
    pub min_data_points: usize,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            expansion_atr_percent: 2.5,
            momentum_rsi_offset: 5.0,
            squeeze_window: 3,
            atr_stop_multiplier: 2.0,
            reward_risk: 2.0,
            min_data_points: 40,
        }
    }
}

pub struct VolatilityStrategy {
    config: VolatilityConfig,
    enabled: bool,
}

impl VolatilityStrategy {
    pub fn new(config: VolatilityConfig) -> Self {
        Self {
            config,
            enabled: true,
        }
    }

    fn expansion(&self, snapshot: &MarketSnapshot) -> Option<(Direction, f64, f64, String)> {
        let ind = &snapshot.indicators;
        let c = &self.config;
        if ind.atr_percent < c.expansion_atr_percent {
            return None;
        }
        let price = snapshot.current_price;
        let direction = if ind.macd_histogram > 0.0
            && ind.rsi >= 50.0 + c.momentum_rsi_offset
            && price > ind.ema_fast
        {
            Direction::Long
        } else if ind.macd_histogram < 0.0
            && ind.rsi <= 50.0 - c.momentum_rsi_offset
            && price < ind.ema_fast
        {
            Direction::Short
        } else {
            return None;
        };

        let excess = (ind.atr_percent - c.expansion_atr_percent) / c.expansion_atr_percent;
        let strength = 0.5 + 0.5 * excess.clamp(0.0, 1.0);
        let reason = format!(
            "Volatility expansion {} (ATR {:.2}%, RSI {:.1})",
            direction, ind.atr_percent, ind.rsi
        );
        Some((direction, strength, 0.55, reason))
    }

    fn squeeze_release(&self, snapshot: &MarketSnapshot) -> Option<(Direction, f64, f64, String)> {
        let ind = &snapshot.indicators;
        if ind.squeeze_active {
            return None;
        }
        let bars = ind.bars_since_squeeze?;
        if bars > self.config.squeeze_window {
            return None;
        }
        let price = snapshot.current_price;
        let direction = if ind.bb_upper > 0.0 && price > ind.bb_upper {
            Direction::Long
        } else if ind.bb_lower > 0.0 && price < ind.bb_lower {
            Direction::Short
        } else {
            return None;
        };

        let strength = if ind.volume_ratio > 1.0 { 0.75 } else { 0.6 };
        let reason = format!(
            "Squeeze release {} ({} bars after squeeze)",
            direction, bars
        );
        Some((direction, strength, 0.6, reason))
    }
}

impl Default for VolatilityStrategy {
    fn default() -> Self {
        Self::new(VolatilityConfig::default())
    }
}

impl Strategy for VolatilityStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Volatility
    }

    fn analyze(&self, snapshot: &MarketSnapshot) -> Vec<Signal> {
        if snapshot.indicators.atr <= 0.0 {
            return Vec::new();
        }
        self.squeeze_release(snapshot)
            .or_else(|| self.expansion(snapshot))
            .map(|(direction, strength, confidence, reason)| {
                entry_signal(self, snapshot, direction, strength, confidence, reason)
            })
            .into_iter()
            .collect()
    }

    fn should_exit(&self, snapshot: &MarketSnapshot, position: &OpenPosition) -> Option<String> {
        let price = snapshot.current_price;
        if let Some(reason) = protective_exit(position, price) {
            return Some(reason);
        }
        let ind = &snapshot.indicators;
        let sign = position.direction.sign();
        if sign * ind.macd_histogram < 0.0 && sign * (price - ind.ema_fast) < 0.0 {
            return Some("momentum reversed".to_string());
        }
        None
    }

    fn stop_loss(&self, snapshot: &MarketSnapshot, direction: Direction, entry: f64) -> f64 {
        atr_stop(
            direction,
            entry,
            snapshot.indicators.atr,
            self.config.atr_stop_multiplier,
        )
    }

    fn take_profit(&self, snapshot: &MarketSnapshot, direction: Direction, entry: f64) -> f64 {
        let stop = self.stop_loss(snapshot, direction, entry);
        reward_target(direction, entry, stop, self.config.reward_risk)
    }

    fn min_data_points(&self) -> usize {
        self.config.min_data_points
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn config(&self) -> StrategyConfig {
        StrategyConfig::Volatility(self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{position, snapshot_with};
    use analysis_core::IndicatorSnapshot;

    #[test]
    fn expansion_with_momentum() {
        let strategy = VolatilityStrategy::default();
        let ind = IndicatorSnapshot {
            atr_percent: 5.0,
            atr: 5.0,
            macd_histogram: 0.8,
            rsi: 62.0,
            ema_fast: 98.0,
            ..IndicatorSnapshot::default()
        };
        let signals = strategy.analyze(&snapshot_with(100.0, ind));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, Direction::Long);
        assert!((signals[0].strength - 1.0).abs() < 1e-9);
        assert_eq!(signals[0].stop_loss, 90.0);
        assert_eq!(signals[0].take_profit, 120.0);
    }

    #[test]
    fn expansion_without_momentum_is_ignored() {
        let strategy = VolatilityStrategy::default();
        let ind = IndicatorSnapshot {
            atr_percent: 5.0,
            atr: 5.0,
            macd_histogram: 0.8,
            rsi: 51.0,
            ema_fast: 98.0,
            ..IndicatorSnapshot::default()
        };
        assert!(strategy.analyze(&snapshot_with(100.0, ind)).is_empty());
    }

    #[test]
    fn squeeze_release_below_band() {
        let strategy = VolatilityStrategy::default();
        let ind = IndicatorSnapshot {
            atr: 1.0,
            atr_percent: 1.0,
            bb_upper: 102.0,
            bb_lower: 98.0,
            bars_since_squeeze: Some(1),
            ..IndicatorSnapshot::default()
        };
        let signals = strategy.analyze(&snapshot_with(97.0, ind));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, Direction::Short);
        assert!(signals[0].validate().is_ok());
    }

    #[test]
    fn exits_when_momentum_flips() {
        let strategy = VolatilityStrategy::default();
        let ind = IndicatorSnapshot {
            macd_histogram: -0.3,
            ema_fast: 101.0,
            ..IndicatorSnapshot::default()
        };
        let pos = position(Direction::Long, 100.0, None, None);
        assert_eq!(
            strategy.should_exit(&snapshot_with(100.5, ind), &pos).as_deref(),
            Some("momentum reversed")
        );
    }
}
