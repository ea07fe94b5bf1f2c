//! Trend following
//!
//! Enters with the trend when ADX shows a strong move and price, fast EMA and
//! slow EMA are stacked in the same direction. Strength comes from trend
//! quality, MACD confirmation and RSI bias.

use analysis_core::{Direction, MarketSnapshot, OpenPosition, Signal, StrategyKind};
use serde::{Deserialize, Serialize};

use crate::strategy::{atr_stop, entry_signal, protective_exit, reward_target};
use crate::{Strategy, StrategyConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendConfig {
    /// Minimum ADX to consider the market trending
    pub min_adx: f64,
    /// ADX at which trend quality saturates
    pub strong_adx: f64,
    /// Exit once ADX falls below this
    pub exit_adx: f64,
    pub atr_stop_multiplier: f64,
    pub reward_risk: f64,
    pub min_data_points: usize,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            min_adx: 25.0,
            strong_adx: 50.0,
            exit_adx: 18.0,
            atr_stop_multiplier: 2.0,
            reward_risk: 3.0,
            min_data_points: 50,
        }
    }
}

pub struct TrendFollowingStrategy {
    config: TrendConfig,
    enabled: bool,
}

impl TrendFollowingStrategy {
    pub fn new(config: TrendConfig) -> Self {
        Self {
            config,
            enabled: true,
        }
    }
}

impl Default for TrendFollowingStrategy {
    fn default() -> Self {
        Self::new(TrendConfig::default())
    }
}

impl Strategy for TrendFollowingStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TrendFollowing
    }

    fn analyze(&self, snapshot: &MarketSnapshot) -> Vec<Signal> {
        let ind = &snapshot.indicators;
        let price = snapshot.current_price;
        if ind.atr <= 0.0 || ind.adx < self.config.min_adx {
            return Vec::new();
        }

        let direction = if ind.ema_fast > ind.ema_slow
            && price > ind.ema_fast
            && ind.plus_di > ind.minus_di
        {
            Direction::Long
        } else if ind.ema_fast < ind.ema_slow
            && price < ind.ema_fast
            && ind.minus_di > ind.plus_di
        {
            Direction::Short
        } else {
            return Vec::new();
        };

        let quality = (ind.adx / self.config.strong_adx).min(1.0);
        let sign = direction.sign();
        let macd_confirms = sign * ind.macd > 0.0 && sign * ind.macd_histogram >= 0.0;
        let rsi_confirms = sign * (ind.rsi - 50.0) > 0.0;

        let mut strength = 0.6 * quality;
        if macd_confirms {
            strength += 0.25;
        }
        if rsi_confirms {
            strength += 0.15;
        }
        let confidence = 0.5 + 0.5 * quality;

        let reason = format!(
            "Trend {} (ADX {:.1}, EMA {:.2}/{:.2}{})",
            direction,
            ind.adx,
            ind.ema_fast,
            ind.ema_slow,
            if macd_confirms { ", MACD confirms" } else { "" }
        );
        vec![entry_signal(self, snapshot, direction, strength, confidence, reason)]
    }

    fn should_exit(&self, snapshot: &MarketSnapshot, position: &OpenPosition) -> Option<String> {
        if let Some(reason) = protective_exit(position, snapshot.current_price) {
            return Some(reason);
        }
        let ind = &snapshot.indicators;
        let reversed = match position.direction {
            Direction::Long => ind.ema_fast < ind.ema_slow,
            Direction::Short => ind.ema_fast > ind.ema_slow,
            Direction::None => false,
        };
        if reversed {
            return Some("trend reversed: moving averages crossed".to_string());
        }
        if ind.adx < self.config.exit_adx {
            return Some(format!("trend faded (ADX {:.1})", ind.adx));
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
        StrategyConfig::TrendFollowing(self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{position, snapshot_with};
    use analysis_core::IndicatorSnapshot;

    fn uptrend() -> IndicatorSnapshot {
        IndicatorSnapshot {
            adx: 60.0,
            plus_di: 40.0,
            minus_di: 5.0,
            ema_fast: 1950.0,
            ema_slow: 1880.0,
            macd: 30.0,
            macd_histogram: 2.0,
            rsi: 80.0,
            atr: 20.0,
            ..IndicatorSnapshot::default()
        }
    }

    #[test]
    fn long_signal_in_clean_uptrend() {
        let strategy = TrendFollowingStrategy::default();
        let signals = strategy.analyze(&snapshot_with(2000.0, uptrend()));

        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.direction, Direction::Long);
        assert_eq!(s.stop_loss, 1960.0);
        assert_eq!(s.take_profit, 2120.0);
        assert!((s.strength - 1.0).abs() < 1e-9);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn no_signal_when_adx_is_weak() {
        let strategy = TrendFollowingStrategy::default();
        let mut ind = uptrend();
        ind.adx = 15.0;
        assert!(strategy.analyze(&snapshot_with(2000.0, ind)).is_empty());
    }

    #[test]
    fn short_signal_in_downtrend() {
        let strategy = TrendFollowingStrategy::default();
        let ind = IndicatorSnapshot {
            adx: 30.0,
            plus_di: 10.0,
            minus_di: 30.0,
            ema_fast: 105.0,
            ema_slow: 110.0,
            macd: -1.0,
            macd_histogram: 0.5,
            rsi: 40.0,
            atr: 2.0,
            ..IndicatorSnapshot::default()
        };
        let signals = strategy.analyze(&snapshot_with(100.0, ind));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, Direction::Short);
        assert_eq!(signals[0].stop_loss, 104.0);
        assert_eq!(signals[0].take_profit, 88.0);
        // MACD histogram disagrees, only trend quality and RSI count
        assert!((signals[0].strength - (0.6 * 0.6 + 0.15)).abs() < 1e-9);
    }

    #[test]
    fn exits_when_averages_cross() {
        let strategy = TrendFollowingStrategy::default();
        let mut ind = uptrend();
        ind.ema_fast = 1870.0;
        let pos = position(Direction::Long, 1900.0, None, None);
        let reason = strategy.should_exit(&snapshot_with(1905.0, ind), &pos);
        assert!(reason.unwrap().contains("reversed"));
    }

    #[test]
    fn exits_on_stop() {
        let strategy = TrendFollowingStrategy::default();
        let pos = position(Direction::Long, 2000.0, Some(1960.0), Some(2120.0));
        let reason = strategy.should_exit(&snapshot_with(1955.0, uptrend()), &pos);
        assert!(reason.unwrap().contains("stop loss"));
        assert!(strategy
            .should_exit(&snapshot_with(2010.0, uptrend()), &pos)
            .is_none());
    }
}
