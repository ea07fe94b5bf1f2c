//! Statistical mean reversion on the rolling z-score of closes.
//!
//! Enters when price is `entry_z` standard deviations from its rolling mean,
//! optionally only when the recent series shows a short mean-reversion
//! half-life. Targets the mean; exits on reversion, on an extreme z-score or
//! after a maximum holding period.

use analysis_core::stats::{half_life, rolling_z_score};
use analysis_core::{Direction, MarketSnapshot, OpenPosition, Signal, StrategyKind};
use serde::{Deserialize, Serialize};

use crate::strategy::{entry_signal, protective_exit};
use crate::{Strategy, StrategyConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticalConfig {
    pub lookback: usize,
    pub entry_z: f64,
    pub exit_z: f64,
    /// Hard stop distance in standard deviations
    pub stop_z: f64,
    /// Skip entries when the fitted half-life exceeds this (None disables the filter)
    pub max_half_life: Option<f64>,
    pub max_holding_bars: usize,
    pub min_data_points: usize,
}

impl Default for StatisticalConfig {
    fn default() -> Self {
        Self {
            lookback: 20,
            entry_z: 2.0,
            exit_z: 0.5,
            stop_z: 3.5,
            max_half_life: Some(30.0),
            max_holding_bars: 30,
            min_data_points: 40,
        }
    }
}

pub struct StatisticalStrategy {
    config: StatisticalConfig,
    enabled: bool,
}

impl StatisticalStrategy {
    pub fn new(config: StatisticalConfig) -> Self {
        Self {
            config,
            enabled: true,
        }
    }

    /// `None` when the filter rejects the series, `Some(None)` when it is disabled.
    fn half_life_filter(&self, closes: &[f64]) -> Option<Option<f64>> {
        let Some(max) = self.config.max_half_life else {
            return Some(None);
        };
        let window = closes.len().min(self.config.lookback * 3);
        let hl = half_life(&closes[closes.len() - window..])?;
        (hl <= max).then_some(Some(hl))
    }
}

impl Default for StatisticalStrategy {
    fn default() -> Self {
        Self::new(StatisticalConfig::default())
    }
}

impl Strategy for StatisticalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Statistical
    }

    fn analyze(&self, snapshot: &MarketSnapshot) -> Vec<Signal> {
        let c = &self.config;
        let Some(rz) = rolling_z_score(&snapshot.closes, c.lookback) else {
            return Vec::new();
        };
        if rz.std_dev < f64::EPSILON {
            return Vec::new();
        }
        let distance = rz.z.abs();
        if distance < c.entry_z || distance >= c.stop_z {
            return Vec::new();
        }
        let Some(hl) = self.half_life_filter(&snapshot.closes) else {
            return Vec::new();
        };

        let direction = if rz.z < 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };
        let stretch = (distance - c.entry_z) / (c.stop_z - c.entry_z);
        let strength = 0.5 + 0.5 * stretch.clamp(0.0, 1.0);
        let (confidence, reason) = match hl {
            Some(hl) => (
                0.65,
                format!(
                    "Z-score {:.2} from mean {:.4} (half-life {:.1} bars)",
                    rz.z, rz.mean, hl
                ),
            ),
            None => (0.55, format!("Z-score {:.2} from mean {:.4}", rz.z, rz.mean)),
        };
        vec![entry_signal(self, snapshot, direction, strength, confidence, reason)]
    }

    fn should_exit(&self, snapshot: &MarketSnapshot, position: &OpenPosition) -> Option<String> {
        if let Some(reason) = protective_exit(position, snapshot.current_price) {
            return Some(reason);
        }
        let c = &self.config;
        if position.bars_held(snapshot.timestamp, snapshot.timeframe) >= c.max_holding_bars {
            return Some(format!("held {} bars", c.max_holding_bars));
        }
        let rz = rolling_z_score(&snapshot.closes, c.lookback)?;
        if rz.z.abs() <= c.exit_z {
            return Some(format!("reverted to mean (z {:.2})", rz.z));
        }
        // still stretched against the position
        if -position.direction.sign() * rz.z >= c.stop_z {
            return Some(format!("z-score stop (z {:.2})", rz.z));
        }
        None
    }

    fn stop_loss(&self, snapshot: &MarketSnapshot, direction: Direction, entry: f64) -> f64 {
        match rolling_z_score(&snapshot.closes, self.config.lookback) {
            Some(rz) if rz.std_dev > f64::EPSILON => {
                rz.mean - direction.sign() * self.config.stop_z * rz.std_dev
            }
            _ => entry,
        }
    }

    fn take_profit(&self, snapshot: &MarketSnapshot, _direction: Direction, entry: f64) -> f64 {
        rolling_z_score(&snapshot.closes, self.config.lookback)
            .map(|rz| rz.mean)
            .unwrap_or(entry)
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
        StrategyConfig::Statistical(self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::snapshot_from_closes;
    use analysis_core::IndicatorSnapshot;

    /// Oscillating series around 100 with a final drop below the band
    fn dipped() -> Vec<f64> {
        let mut closes: Vec<f64> = (0..59)
            .map(|i| 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        closes.push(96.5);
        closes
    }

    #[test]
    fn long_on_negative_z() {
        let strategy = StatisticalStrategy::default();
        let snap = snapshot_from_closes(dipped(), IndicatorSnapshot::default());
        let signals = strategy.analyze(&snap);

        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.direction, Direction::Long);
        assert!(s.take_profit > s.price);
        assert!(s.stop_loss < s.price);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn flat_series_yields_nothing() {
        let strategy = StatisticalStrategy::default();
        let snap = snapshot_from_closes(vec![100.0; 60], IndicatorSnapshot::default());
        assert!(strategy.analyze(&snap).is_empty());
    }

    #[test]
    fn slow_reversion_is_filtered_by_half_life() {
        // steady climb then a sharp drop: z is about -2.6, half-life about 14 bars
        let mut closes: Vec<f64> = (0..59).map(|i| 100.0 + i as f64).collect();
        closes.push(130.0);
        let snap = snapshot_from_closes(closes, IndicatorSnapshot::default());

        let strict = StatisticalStrategy::new(StatisticalConfig {
            max_half_life: Some(5.0),
            ..StatisticalConfig::default()
        });
        assert!(strict.analyze(&snap).is_empty());

        let unfiltered = StatisticalStrategy::new(StatisticalConfig {
            max_half_life: None,
            ..StatisticalConfig::default()
        });
        let signals = unfiltered.analyze(&snap);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, Direction::Long);
        assert!(signals[0].validate().is_ok());
    }
}
