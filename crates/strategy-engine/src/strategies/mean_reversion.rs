//! Mean reversion
//!
//! Fades RSI extremes that coincide with price at or beyond a Bollinger band,
//! targeting the band midline. Skips markets with a strong trend.

use analysis_core::{Direction, MarketSnapshot, OpenPosition, Signal, StrategyKind};
use serde::{Deserialize, Serialize};

use crate::strategy::{atr_stop, entry_signal, protective_exit, reward_target};
use crate::{Strategy, StrategyConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanReversionConfig {
    pub oversold: f64,
    pub overbought: f64,
    /// Long when %B is at or below this, short at or above `1 - band_extreme`
    pub band_extreme: f64,
    /// Do not fade moves with ADX above this
    pub max_adx: f64,
    pub atr_stop_multiplier: f64,
    /// Target distance in stop multiples when the midline is unusable
    pub fallback_reward_risk: f64,
    pub min_data_points: usize,
}

impl Default for MeanReversionConfig {
    fn default() -> Self {
        Self {
            oversold: 30.0,
            overbought: 70.0,
            band_extreme: 0.05,
            max_adx: 30.0,
            atr_stop_multiplier: 1.5,
            fallback_reward_risk: 2.0,
            min_data_points: 30,
        }
    }
}

pub struct MeanReversionStrategy {
    config: MeanReversionConfig,
    enabled: bool,
}

impl MeanReversionStrategy {
    pub fn new(config: MeanReversionConfig) -> Self {
        Self {
            config,
            enabled: true,
        }
    }
}

impl Default for MeanReversionStrategy {
    fn default() -> Self {
        Self::new(MeanReversionConfig::default())
    }
}

impl Strategy for MeanReversionStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MeanReversion
    }

    fn analyze(&self, snapshot: &MarketSnapshot) -> Vec<Signal> {
        let ind = &snapshot.indicators;
        let c = &self.config;
        if ind.atr <= 0.0 || ind.adx >= c.max_adx {
            return Vec::new();
        }

        let (direction, depth) = if ind.rsi <= c.oversold && ind.bb_percent_b <= c.band_extreme {
            (Direction::Long, (c.oversold - ind.rsi) / c.oversold.max(1.0))
        } else if ind.rsi >= c.overbought && ind.bb_percent_b >= 1.0 - c.band_extreme {
            (
                Direction::Short,
                (ind.rsi - c.overbought) / (100.0 - c.overbought).max(1.0),
            )
        } else {
            return Vec::new();
        };

        let outside_band = ind.bb_percent_b < 0.0 || ind.bb_percent_b > 1.0;
        let mut strength = 0.4 + 0.4 * depth.clamp(0.0, 1.0);
        if outside_band {
            strength += 0.2;
        }
        let confidence = 0.5 + 0.4 * (1.0 - ind.adx / c.max_adx).clamp(0.0, 1.0);

        let reason = format!(
            "Mean reversion {} (RSI {:.1}, %B {:.2}, midline {:.2})",
            direction, ind.rsi, ind.bb_percent_b, ind.bb_middle
        );
        vec![entry_signal(self, snapshot, direction, strength, confidence, reason)]
    }

    fn should_exit(&self, snapshot: &MarketSnapshot, position: &OpenPosition) -> Option<String> {
        let price = snapshot.current_price;
        if let Some(reason) = protective_exit(position, price) {
            return Some(reason);
        }
        let ind = &snapshot.indicators;
        let sign = position.direction.sign();
        if ind.bb_middle > 0.0 && sign * (price - ind.bb_middle) >= 0.0 {
            return Some(format!("reverted to midline {:.4}", ind.bb_middle));
        }
        match position.direction {
            Direction::Long if ind.rsi >= self.config.overbought => {
                Some(format!("RSI overbought ({:.1})", ind.rsi))
            }
            Direction::Short if ind.rsi <= self.config.oversold => {
                Some(format!("RSI oversold ({:.1})", ind.rsi))
            }
            _ => None,
        }
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
        let middle = snapshot.indicators.bb_middle;
        if direction.sign() * (middle - entry) > 0.0 {
            return middle;
        }
        let stop = self.stop_loss(snapshot, direction, entry);
        reward_target(direction, entry, stop, self.config.fallback_reward_risk)
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
        StrategyConfig::MeanReversion(self.config.clone())
    }
}
