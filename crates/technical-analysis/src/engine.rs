use analysis_core::{EngineError, IndicatorEngine, IndicatorSnapshot};
use serde::{Deserialize, Serialize};

use crate::indicators::{adx, atr_series, bollinger_at, ema, macd, rsi, sma_last};

/// Periods and multipliers used by [`TechnicalIndicatorEngine`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSettings {
    pub rsi_period: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub sma_long: usize,
    pub macd_signal: usize,
    pub bb_period: usize,
    pub bb_std_dev: f64,
    pub atr_period: usize,
    pub adx_period: usize,
    /// Keltner channel half-width in ATRs, used for squeeze detection
    pub keltner_multiplier: f64,
    pub volume_period: usize,
    pub channel_period: usize,
    /// How far back to look for the most recent squeeze
    pub squeeze_lookback: usize,
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            ema_fast: 12,
            ema_slow: 26,
            sma_long: 50,
            macd_signal: 9,
            bb_period: 20,
            bb_std_dev: 2.0,
            atr_period: 14,
            adx_period: 14,
            keltner_multiplier: 1.5,
            volume_period: 20,
            channel_period: 20,
            squeeze_lookback: 20,
        }
    }
}

/// Computes the latest-bar [`IndicatorSnapshot`] from raw OHLCV sequences.
#[derive(Debug, Clone, Default)]
pub struct TechnicalIndicatorEngine {
    settings: IndicatorSettings,
}

impl TechnicalIndicatorEngine {
    pub fn new(settings: IndicatorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &IndicatorSettings {
        &self.settings
    }

    /// Squeeze flag per bar for the trailing `squeeze_lookback + 1` bars,
    /// oldest first. Bars without enough history count as not squeezed.
    fn squeeze_flags(&self, highs: &[f64], lows: &[f64], closes: &[f64]) -> Vec<bool> {
        let s = &self.settings;
        let n = closes.len();
        let atr = atr_series(highs, lows, closes, s.atr_period);
        let start = n.saturating_sub(s.squeeze_lookback + 1);

        (start..n)
            .map(|i| {
                let bands = bollinger_at(closes, i, s.bb_period, s.bb_std_dev);
                let atr_i = i.checked_sub(s.atr_period).and_then(|j| atr.get(j)).copied();
                match (bands, atr_i) {
                    (Some(b), Some(a)) if a > 0.0 => {
                        (b.upper - b.lower) < 2.0 * s.keltner_multiplier * a
                    }
                    _ => false,
                }
            })
            .collect()
    }
}

impl IndicatorEngine for TechnicalIndicatorEngine {
    fn warmup_bars(&self) -> usize {
        let s = &self.settings;
        [
            s.sma_long,
            s.ema_slow + s.macd_signal,
            s.adx_period * 2 + 1,
            s.bb_period + s.squeeze_lookback,
            s.channel_period + 1,
            s.rsi_period + 1,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    fn compute(
        &self,
        opens: &[f64],
        highs: &[f64],
        lows: &[f64],
        closes: &[f64],
        volumes: &[f64],
    ) -> Result<IndicatorSnapshot, EngineError> {
        let n = closes.len();
        if [opens.len(), highs.len(), lows.len(), volumes.len()]
            .iter()
            .any(|&len| len != n)
        {
            return Err(EngineError::InvalidData(
                "OHLCV sequences have different lengths".to_string(),
            ));
        }
        let need = self.warmup_bars();
        if n < need {
            return Err(EngineError::InsufficientData { have: n, need });
        }

        let s = &self.settings;
        let close = closes[n - 1];

        let bands = bollinger_at(closes, n - 1, s.bb_period, s.bb_std_dev).ok_or_else(|| {
            EngineError::InsufficientData {
                have: n,
                need: s.bb_period,
            }
        })?;
        let band_range = bands.upper - bands.lower;
        let bb_percent_b = if band_range > f64::EPSILON {
            (close - bands.lower) / band_range
        } else {
            0.5
        };
        let bb_width = if bands.middle.abs() > f64::EPSILON {
            band_range / bands.middle
        } else {
            0.0
        };

        let atr = atr_series(highs, lows, closes, s.atr_period)
            .last()
            .copied()
            .unwrap_or(0.0);
        let atr_percent = if close > 0.0 { atr / close * 100.0 } else { 0.0 };

        let directional = adx(highs, lows, closes, s.adx_period);
        let m = macd(closes, s.ema_fast, s.ema_slow, s.macd_signal);

        let avg_volume = sma_last(volumes, s.volume_period).unwrap_or(0.0);
        let volume_ratio = if avg_volume > 0.0 {
            volumes[n - 1] / avg_volume
        } else {
            1.0
        };

        let channel_start = (n - 1).saturating_sub(s.channel_period);
        let channel_high = highs[channel_start..n - 1]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let channel_low = lows[channel_start..n - 1]
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);

        let flags = self.squeeze_flags(highs, lows, closes);
        let squeeze_active = flags.last().copied().unwrap_or(false);
        let bars_since_squeeze = flags.iter().rev().position(|&f| f);

        Ok(IndicatorSnapshot {
            rsi: rsi(closes, s.rsi_period).unwrap_or(50.0),
            ema_fast: ema(closes, s.ema_fast).last().copied().unwrap_or(close),
            ema_slow: ema(closes, s.ema_slow).last().copied().unwrap_or(close),
            sma_long: sma_last(closes, s.sma_long).unwrap_or(close),
            macd: m.map(|m| m.line).unwrap_or(0.0),
            macd_signal: m.map(|m| m.signal).unwrap_or(0.0),
            macd_histogram: m.map(|m| m.histogram).unwrap_or(0.0),
            bb_upper: bands.upper,
            bb_middle: bands.middle,
            bb_lower: bands.lower,
            bb_width,
            bb_percent_b,
            atr,
            atr_percent,
            adx: directional.map(|d| d.adx).unwrap_or(0.0),
            plus_di: directional.map(|d| d.plus_di).unwrap_or(0.0),
            minus_di: directional.map(|d| d.minus_di).unwrap_or(0.0),
            volume_ratio,
            squeeze_active,
            bars_since_squeeze,
            channel_high: if channel_high.is_finite() { channel_high } else { close },
            channel_low: if channel_low.is_finite() { channel_low } else { close },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(n: usize, f: impl Fn(usize) -> f64) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let closes: Vec<f64> = (0..n).map(f).collect();
        let opens = closes.clone();
        let highs = closes.iter().map(|c| c + 10.0).collect();
        let lows = closes.iter().map(|c| c - 10.0).collect();
        let volumes = vec![1_000.0; n];
        (opens, highs, lows, closes, volumes)
    }

    #[test]
    fn rejects_short_history() {
        let engine = TechnicalIndicatorEngine::default();
        let (o, h, l, c, v) = series(20, |i| 100.0 + i as f64);
        let err = engine.compute(&o, &h, &l, &c, &v).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { have: 20, .. }));
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let engine = TechnicalIndicatorEngine::default();
        let (o, h, l, c, mut v) = series(60, |i| 100.0 + i as f64);
        v.pop();
        assert!(matches!(
            engine.compute(&o, &h, &l, &c, &v),
            Err(EngineError::InvalidData(_))
        ));
    }

    #[test]
    fn ascending_closes_look_like_a_trend() {
        let engine = TechnicalIndicatorEngine::default();
        let (o, h, l, c, v) = series(60, |i| 1410.0 + i as f64 * 10.0);
        let snap = engine.compute(&o, &h, &l, &c, &v).unwrap();

        assert!(snap.adx > 40.0);
        assert!(snap.plus_di > snap.minus_di);
        assert!(snap.ema_fast > snap.ema_slow);
        assert!(c[59] > snap.ema_fast);
        assert!(snap.macd > 0.0);
        assert!((snap.atr - 20.0).abs() < 1e-9);
        assert!((snap.atr_percent - 1.0).abs() < 1e-9);
        assert!(!snap.squeeze_active);
        assert_eq!(snap.bars_since_squeeze, None);
        assert!((snap.volume_ratio - 1.0).abs() < 1e-9);
        assert!((snap.channel_high - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn tight_range_after_wide_range_is_a_squeeze() {
        let engine = TechnicalIndicatorEngine::default();
        // Large swings early, then a nearly flat tail with wide bar ranges
        let (o, h, l, c, v) = series(80, |i| {
            if i < 40 {
                100.0 + if i % 2 == 0 { 8.0 } else { -8.0 }
            } else {
                100.0 + if i % 2 == 0 { 0.2 } else { -0.2 }
            }
        });
        let snap = engine.compute(&o, &h, &l, &c, &v).unwrap();
        assert!(snap.squeeze_active);
        assert_eq!(snap.bars_since_squeeze, Some(0));
    }
}
