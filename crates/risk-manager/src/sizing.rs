//! Position sizing
//!
//! Quantities are derived from equity and the distance to the stop, then
//! capped so the position value never exceeds `max_position_fraction` of
//! equity. Kelly sizing uses f* = (b·p − q) / b with the signal's
//! reward:risk as `b` and its strength as the win probability proxy.

use std::str::FromStr;

use analysis_core::EngineError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMethod {
    /// Risk a fixed fraction of equity between entry and stop
    FixedFractional,
    /// Fixed fractional, scaled down in volatile markets and up in quiet ones
    VolatilityAdjusted,
    /// Fractional Kelly on the signal's odds
    Kelly,
}

impl FromStr for SizingMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed" | "fixed_fractional" => Ok(SizingMethod::FixedFractional),
            "volatility" | "volatility_adjusted" => Ok(SizingMethod::VolatilityAdjusted),
            "kelly" => Ok(SizingMethod::Kelly),
            other => Err(EngineError::Configuration(format!(
                "unknown sizing method '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizer {
    pub method: SizingMethod,
    /// Fraction of equity at risk per trade (0.01 = 1%)
    pub risk_per_trade: f64,
    /// Upper bound on position value as a fraction of equity
    pub max_position_fraction: f64,
    /// ATR% considered normal by VolatilityAdjusted
    pub reference_volatility: f64,
    /// Fractional Kelly multiplier (0.5 = half-Kelly)
    pub kelly_multiplier: f64,
    pub max_kelly_fraction: f64,
}

impl Default for PositionSizer {
    fn default() -> Self {
        Self {
            method: SizingMethod::FixedFractional,
            risk_per_trade: 0.01,
            max_position_fraction: 0.25,
            reference_volatility: 1.0,
            kelly_multiplier: 0.5,
            max_kelly_fraction: 0.25,
        }
    }
}

impl PositionSizer {
    pub fn with_method(method: SizingMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    /// Quantity to trade. Zero for degenerate input (no equity, no stop distance).
    pub fn size(
        &self,
        equity: f64,
        entry: f64,
        stop: f64,
        target: f64,
        volatility: f64,
        strength: f64,
    ) -> f64 {
        let stop_distance = (entry - stop).abs();
        if equity <= 0.0 || entry <= 0.0 || stop_distance <= f64::EPSILON {
            return 0.0;
        }

        let quantity = match self.method {
            SizingMethod::FixedFractional => equity * self.risk_per_trade / stop_distance,
            SizingMethod::VolatilityAdjusted => {
                let scale = if volatility > f64::EPSILON {
                    (self.reference_volatility / volatility).clamp(0.25, 2.0)
                } else {
                    1.0
                };
                equity * self.risk_per_trade * scale / stop_distance
            }
            SizingMethod::Kelly => {
                let b = (target - entry).abs() / stop_distance;
                if b <= f64::EPSILON {
                    return 0.0;
                }
                let p = strength.clamp(0.0, 1.0);
                let raw = (p * b - (1.0 - p)) / b;
                let fraction = (raw * self.kelly_multiplier).clamp(0.0, self.max_kelly_fraction);
                equity * fraction / entry
            }
        };

        let cap = equity * self.max_position_fraction / entry;
        quantity.min(cap).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn fixed_fractional_risks_one_percent() {
        let sizer = PositionSizer {
            max_position_fraction: 1.0,
            ..PositionSizer::default()
        };
        // 100 at risk over a 40 point stop
        let qty = sizer.size(10_000.0, 2000.0, 1960.0, 2120.0, 1.0, 0.8);
        assert_relative_eq!(qty, 2.5);
    }

    #[test]
    fn position_value_is_capped() {
        let sizer = PositionSizer::default();
        let qty = sizer.size(10_000.0, 2000.0, 1960.0, 2120.0, 1.0, 0.8);
        assert_relative_eq!(qty * 2000.0, 2_500.0);
    }

    #[test]
    fn volatility_scales_risk() {
        let sizer = PositionSizer {
            max_position_fraction: 1.0,
            ..PositionSizer::with_method(SizingMethod::VolatilityAdjusted)
        };
        let calm = sizer.size(10_000.0, 100.0, 98.0, 104.0, 0.5, 0.5);
        let wild = sizer.size(10_000.0, 100.0, 98.0, 104.0, 4.0, 0.5);
        assert_relative_eq!(calm, 100.0);
        assert_relative_eq!(wild, 12.5);
    }

    #[test]
    fn kelly_needs_an_edge() {
        let sizer = PositionSizer::with_method(SizingMethod::Kelly);
        // p = 0.6, b = 2: f* = (1.2 - 0.4) / 2 = 0.4, half-Kelly 0.2
        let qty = sizer.size(10_000.0, 100.0, 98.0, 104.0, 1.0, 0.6);
        assert_relative_eq!(qty, 20.0, epsilon = 1e-9);

        // p = 0.3, b = 2: negative edge
        assert_eq!(sizer.size(10_000.0, 100.0, 98.0, 104.0, 1.0, 0.3), 0.0);
    }

    #[test]
    fn degenerate_input_sizes_to_zero() {
        let sizer = PositionSizer::default();
        assert_eq!(sizer.size(0.0, 100.0, 98.0, 104.0, 1.0, 0.5), 0.0);
        assert_eq!(sizer.size(10_000.0, 100.0, 100.0, 104.0, 1.0, 0.5), 0.0);
    }

    #[test]
    fn parses_method_names() {
        assert_eq!("kelly".parse::<SizingMethod>().unwrap(), SizingMethod::Kelly);
        assert_eq!(
            "volatility-adjusted".parse::<SizingMethod>().unwrap(),
            SizingMethod::VolatilityAdjusted
        );
        assert!("martingale".parse::<SizingMethod>().is_err());
    }
}
