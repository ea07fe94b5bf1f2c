//! Squeeze breakout
//!
//! Only trades a band or channel break that follows a recent volatility
//! squeeze. Volume above average raises strength and confidence.

use analysis_core::{Direction, MarketSnapshot, OpenPosition, Signal, StrategyKind};
use serde::{Deserialize, Serialize};

use crate::strategy::{atr_stop, entry_signal, protective_exit, reward_target};
use crate::{Strategy, StrategyConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakoutConfig {
    /// A squeeze must have ended at most this many bars ago
    pub squeeze_window: usize,
    pub volume_confirmation: f64,
    pub atr_stop_multiplier: f64,
    pub reward_risk: f64,
    pub min_data_points: usize,
}

impl Default for BreakoutConfig {
    fn default() -> Self {
        Self {
            squeeze_window: 5,
            volume_confirmation: 1.5,
            atr_stop_multiplier: 1.5,
            reward_risk: 2.5,
            min_data_points: 40,
        }
    }
}

pub struct BreakoutStrategy {
    config: BreakoutConfig,
    enabled: bool,
}

impl BreakoutStrategy {
    pub fn new(config: BreakoutConfig) -> Self {
        Self {
            config,
            enabled: true,
        }
    }
}

impl Default for BreakoutStrategy {
    fn default() -> Self {
        Self::new(BreakoutConfig::default())
    }
}

impl Strategy for BreakoutStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Breakout
    }

    fn analyze(&self, snapshot: &MarketSnapshot) -> Vec<Signal> {
        let ind = &snapshot.indicators;
        let price = snapshot.current_price;
        if ind.atr <= 0.0 || ind.squeeze_active {
            return Vec::new();
        }
        match ind.bars_since_squeeze {
            Some(n) if n <= self.config.squeeze_window => {}
            _ => return Vec::new(),
        }

        let above_band = ind.bb_upper > 0.0 && price > ind.bb_upper;
        let above_channel = ind.channel_high > 0.0 && price > ind.channel_high;
        let below_band = ind.bb_lower > 0.0 && price < ind.bb_lower;
        let below_channel = ind.channel_low > 0.0 && price < ind.channel_low;

        let (direction, both) = if above_band || above_channel {
            (Direction::Long, above_band && above_channel)
        } else if below_band || below_channel {
            (Direction::Short, below_band && below_channel)
        } else {
            return Vec::new();
        };

        let volume_confirmed = ind.volume_ratio >= self.config.volume_confirmation;
        let mut strength: f64 = 0.5;
        let mut confidence: f64 = 0.5;
        if both {
            strength += 0.2;
            confidence += 0.1;
        }
        if volume_confirmed {
            strength += 0.3;
            confidence += 0.3;
        }

        let reason = format!(
            "Squeeze breakout {} (volume x{:.2}{})",
            direction,
            ind.volume_ratio,
            if both { ", band and channel" } else { "" }
        );
        vec![entry_signal(self, snapshot, direction, strength, confidence, reason)]
    }

    fn should_exit(&self, snapshot: &MarketSnapshot, position: &OpenPosition) -> Option<String> {
        let price = snapshot.current_price;
        if let Some(reason) = protective_exit(position, price) {
            return Some(reason);
        }
        let middle = snapshot.indicators.bb_middle;
        if middle > 0.0 && position.direction.sign() * (price - middle) < 0.0 {
            return Some("breakout failed back through the midline".to_string());
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
        StrategyConfig::Breakout(self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::snapshot_with;
    use analysis_core::IndicatorSnapshot;

    fn released() -> IndicatorSnapshot {
        IndicatorSnapshot {
            bb_upper: 104.0,
            bb_middle: 100.0,
            bb_lower: 96.0,
            channel_high: 105.0,
            channel_low: 95.0,
            bars_since_squeeze: Some(2),
            volume_ratio: 2.0,
            atr: 2.0,
            ..IndicatorSnapshot::default()
        }
    }

    #[test]
    fn confirmed_breakout_above_band_and_channel() {
        let strategy = BreakoutStrategy::default();
        let signals = strategy.analyze(&snapshot_with(106.0, released()));
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.direction, Direction::Long);
        assert!((s.strength - 1.0).abs() < 1e-9);
        assert_eq!(s.stop_loss, 103.0);
        assert_eq!(s.take_profit, 113.5);
    }

    #[test]
    fn requires_a_prior_squeeze() {
        let strategy = BreakoutStrategy::default();
        let mut ind = released();
        ind.bars_since_squeeze = None;
        assert!(strategy.analyze(&snapshot_with(106.0, ind.clone())).is_empty());

        ind.bars_since_squeeze = Some(9);
        assert!(strategy.analyze(&snapshot_with(106.0, ind.clone())).is_empty());

        ind.bars_since_squeeze = Some(0);
        ind.squeeze_active = true;
        assert!(strategy.analyze(&snapshot_with(106.0, ind)).is_empty());
    }

    #[test]
    fn unconfirmed_downside_break_is_weaker() {
        let strategy = BreakoutStrategy::default();
        let mut ind = released();
        ind.volume_ratio = 1.0;
        let signals = strategy.analyze(&snapshot_with(95.5, ind));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, Direction::Short);
        assert!((signals[0].strength - 0.5).abs() < 1e-9);
    }
}
