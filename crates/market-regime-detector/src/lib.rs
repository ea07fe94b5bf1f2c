use analysis_core::{IndicatorSnapshot, MarketSnapshot, StrategyKind, TrendDirection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Market regime classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MarketRegime {
    /// Directional move with a strong ADX and aligned moving averages
    Trending,

    /// Stretched price with weak trend, expected to snap back
    MeanReverting,

    /// Expansion out of a recent volatility squeeze
    Breakout,

    /// Large ranges relative to price
    HighVolatility,

    /// Tight, range-bound market (squeeze in progress)
    Consolidating,

    /// No regime scored high enough, or not enough data
    Unknown,
}

impl MarketRegime {
    pub const CLASSIFIED: [MarketRegime; 5] = [
        MarketRegime::Trending,
        MarketRegime::MeanReverting,
        MarketRegime::Breakout,
        MarketRegime::HighVolatility,
        MarketRegime::Consolidating,
    ];

    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            MarketRegime::Trending => "Trending",
            MarketRegime::MeanReverting => "Mean Reverting",
            MarketRegime::Breakout => "Breakout",
            MarketRegime::HighVolatility => "High Volatility",
            MarketRegime::Consolidating => "Consolidating",
            MarketRegime::Unknown => "Unknown",
        }
    }

    /// Strategies that usually do well in this regime
    pub fn recommended_strategies(&self) -> &'static [StrategyKind] {
        match self {
            MarketRegime::Trending => &[StrategyKind::TrendFollowing, StrategyKind::Breakout],
            MarketRegime::MeanReverting => {
                &[StrategyKind::MeanReversion, StrategyKind::Statistical]
            }
            MarketRegime::Breakout => &[StrategyKind::Breakout, StrategyKind::Volatility],
            MarketRegime::HighVolatility => &[StrategyKind::Volatility],
            MarketRegime::Consolidating => {
                &[StrategyKind::MeanReversion, StrategyKind::Statistical]
            }
            MarketRegime::Unknown => &[],
        }
    }

    /// Position-size multiplier for this regime (1.0 = normal risk)
    pub fn risk_multiplier(&self) -> f64 {
        match self {
            MarketRegime::Trending => 1.2,
            MarketRegime::MeanReverting => 1.0,
            MarketRegime::Breakout => 1.0,
            MarketRegime::HighVolatility => 0.5,
            MarketRegime::Consolidating => 0.8,
            MarketRegime::Unknown => 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolatilityState {
    Low,
    Normal,
    High,
    Extreme,
}

/// Supporting numbers behind a classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeDetails {
    pub adx: f64,
    pub atr_percent: f64,
    pub bb_width: f64,
    pub rsi: f64,
    pub volume_ratio: f64,
    pub squeeze_active: bool,
    /// Evidence score per candidate regime
    pub scores: Vec<(MarketRegime, f64)>,
    /// Label before the persistence rule was applied
    pub raw_regime: MarketRegime,
    pub raw_confidence: f64,
    /// A relabel was held back by the persistence rule
    pub suppressed: bool,
}

/// Regime detection result with confidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeResult {
    pub regime: MarketRegime,
    pub confidence: f64,
    pub trend_direction: TrendDirection,
    /// ADX scaled to 0.0 - 1.0
    pub trend_strength: f64,
    pub volatility_state: VolatilityState,
    /// Consecutive passes the returned label has held
    pub consistency: u32,
    pub details: RegimeDetails,
    pub detected_at: DateTime<Utc>,
    pub reasoning: String,
}

/// Indicator thresholds behind the evidence scores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeThresholds {
    pub trend_adx: f64,
    pub strong_trend_adx: f64,
    pub weak_trend_adx: f64,
    pub oversold_rsi: f64,
    pub overbought_rsi: f64,
    /// %B distance from 0/1 that counts as a band extreme
    pub band_extreme: f64,
    pub low_volatility_atr_percent: f64,
    pub high_volatility_atr_percent: f64,
    pub extreme_volatility_atr_percent: f64,
    pub narrow_band_width: f64,
    pub wide_band_width: f64,
    pub breakout_volume_ratio: f64,
    /// A squeeze that ended at most this many bars ago still primes a breakout
    pub squeeze_release_bars: usize,
    /// Below this best score the regime is Unknown
    pub min_regime_score: f64,
    /// `should_avoid_trading` fires below this confidence
    pub avoid_below_confidence: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            trend_adx: 25.0,
            strong_trend_adx: 40.0,
            weak_trend_adx: 20.0,
            oversold_rsi: 30.0,
            overbought_rsi: 70.0,
            band_extreme: 0.05,
            low_volatility_atr_percent: 0.5,
            high_volatility_atr_percent: 3.0,
            extreme_volatility_atr_percent: 5.0,
            narrow_band_width: 0.04,
            wide_band_width: 0.15,
            breakout_volume_ratio: 1.5,
            squeeze_release_bars: 5,
            min_regime_score: 0.25,
            avoid_below_confidence: 0.4,
        }
    }
}

/// Persistence rule that resists noisy relabeling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HysteresisConfig {
    /// A relabel below this confidence may be suppressed
    pub switch_confidence: f64,
    /// Passes the previous label must have held before suppression applies
    pub min_persistence: u32,
    /// Confidence added per consecutive repeat of the same label
    pub consistency_boost: f64,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            switch_confidence: 0.6,
            min_persistence: 3,
            consistency_boost: 0.05,
        }
    }
}

/// Rule-based regime classifier.
///
/// Keeps the last label and its run length between passes, so one instance
/// belongs to one symbol/timeframe and must only be driven from that feed's
/// serialized pass.
pub struct RegimeClassifier {
    thresholds: RegimeThresholds,
    hysteresis: HysteresisConfig,
    /// Minimum bars required for analysis
    min_bars: usize,
    previous: Option<MarketRegime>,
    consistency: u32,
}

impl RegimeClassifier {
    pub fn new() -> Self {
        Self::with_config(RegimeThresholds::default(), HysteresisConfig::default())
    }

    pub fn with_config(thresholds: RegimeThresholds, hysteresis: HysteresisConfig) -> Self {
        Self {
            thresholds,
            hysteresis,
            min_bars: 50,
            previous: None,
            consistency: 0,
        }
    }

    pub fn with_min_bars(mut self, min_bars: usize) -> Self {
        self.min_bars = min_bars;
        self
    }

    pub fn thresholds(&self) -> &RegimeThresholds {
        &self.thresholds
    }

    /// Label currently held by the persistence rule
    pub fn current(&self) -> Option<MarketRegime> {
        self.previous
    }

    pub fn consistency(&self) -> u32 {
        self.consistency
    }

    /// Forget the persisted label
    pub fn reset(&mut self) {
        self.previous = None;
        self.consistency = 0;
    }

    /// Classify the snapshot and apply the persistence rule.
    ///
    /// Snapshots shorter than the minimum bar count yield Unknown and do not
    /// count as an observation.
    pub fn detect(&mut self, snapshot: &MarketSnapshot) -> RegimeResult {
        let ind = &snapshot.indicators;
        let scores = self.score_regimes(ind, snapshot.current_price);

        if snapshot.len() < self.min_bars {
            return self.build_result(
                ind,
                MarketRegime::Unknown,
                0.0,
                self.consistency,
                RawLabel {
                    regime: MarketRegime::Unknown,
                    confidence: 0.0,
                    suppressed: false,
                },
                scores,
                format!(
                    "Insufficient data: {} bars (need {})",
                    snapshot.len(),
                    self.min_bars
                ),
            );
        }

        let (raw_regime, raw_confidence) = self.pick_regime(&scores);
        let (regime, confidence, suppressed) = self.apply_hysteresis(raw_regime, raw_confidence);

        if suppressed {
            debug!(
                symbol = %snapshot.symbol,
                held = ?regime,
                proposed = ?raw_regime,
                raw_confidence,
                "regime change suppressed"
            );
        }

        let reasoning = format!(
            "{} (ADX: {:.1}, ATR: {:.2}%, band width: {:.3}, RSI: {:.1}, volume x{:.2}){}",
            regime.name(),
            ind.adx,
            ind.atr_percent,
            ind.bb_width,
            ind.rsi,
            ind.volume_ratio,
            if suppressed {
                format!(" [held over {} at {:.2}]", raw_regime.name(), raw_confidence)
            } else {
                String::new()
            }
        );

        self.build_result(
            ind,
            regime,
            confidence,
            self.consistency,
            RawLabel {
                regime: raw_regime,
                confidence: raw_confidence,
                suppressed,
            },
            scores,
            reasoning,
        )
    }

    /// True when the regime is unknown or too uncertain to trade
    pub fn should_avoid_trading(&self, result: &RegimeResult) -> bool {
        result.regime == MarketRegime::Unknown
            || result.confidence < self.thresholds.avoid_below_confidence
    }

    /// Evidence score in [0, 1] per classified regime
    fn score_regimes(&self, ind: &IndicatorSnapshot, price: f64) -> Vec<(MarketRegime, f64)> {
        let t = &self.thresholds;

        let mut trending: f64 = 0.0;
        if ind.adx >= t.trend_adx {
            trending += 0.4;
        }
        if ind.adx >= t.strong_trend_adx {
            trending += 0.2;
        }
        let aligned_up = ind.ema_fast > ind.ema_slow && price > ind.ema_fast;
        let aligned_down = ind.ema_fast < ind.ema_slow && price < ind.ema_fast;
        if aligned_up || aligned_down {
            trending += 0.25;
        }
        if (ind.ema_fast > ind.ema_slow && ind.macd > 0.0)
            || (ind.ema_fast < ind.ema_slow && ind.macd < 0.0)
        {
            trending += 0.15;
        }

        let mut mean_reverting: f64 = 0.0;
        if ind.adx < t.weak_trend_adx {
            mean_reverting += 0.3;
        }
        let oversold = ind.rsi <= t.oversold_rsi;
        let overbought = ind.rsi >= t.overbought_rsi;
        if oversold || overbought {
            mean_reverting += 0.35;
        }
        if ind.bb_percent_b <= t.band_extreme || ind.bb_percent_b >= 1.0 - t.band_extreme {
            mean_reverting += 0.2;
        }
        // momentum already fading against the stretch
        if (overbought && ind.macd_histogram < 0.0) || (oversold && ind.macd_histogram > 0.0) {
            mean_reverting += 0.15;
        }

        let mut breakout: f64 = 0.0;
        let released = !ind.squeeze_active
            && ind
                .bars_since_squeeze
                .is_some_and(|n| n <= t.squeeze_release_bars);
        if released {
            breakout += 0.35;
        }
        if ind.bb_percent_b > 1.0
            || ind.bb_percent_b < 0.0
            || (ind.channel_high > 0.0 && price > ind.channel_high)
            || (ind.channel_low > 0.0 && price < ind.channel_low)
        {
            breakout += 0.3;
        }
        if ind.volume_ratio >= t.breakout_volume_ratio {
            breakout += 0.25;
        }
        // a channel break needs the squeeze to count as a breakout regime
        if !released {
            breakout = breakout.min(0.3);
        }

        let mut high_volatility: f64 = 0.0;
        if ind.atr_percent >= t.high_volatility_atr_percent {
            high_volatility += 0.4;
        }
        if ind.atr_percent >= t.extreme_volatility_atr_percent {
            high_volatility += 0.2;
        }
        if ind.bb_width >= t.wide_band_width {
            high_volatility += 0.3;
        }
        if ind.volume_ratio >= 2.0 * t.breakout_volume_ratio.max(1.0) {
            high_volatility += 0.1;
        }

        let mut consolidating: f64 = 0.0;
        if ind.squeeze_active {
            consolidating += 0.4;
        }
        if ind.adx < t.weak_trend_adx {
            consolidating += 0.25;
        }
        if ind.bb_width <= t.narrow_band_width {
            consolidating += 0.2;
        }
        if ind.atr_percent < t.low_volatility_atr_percent {
            consolidating += 0.15;
        }

        vec![
            (MarketRegime::Trending, trending.min(1.0)),
            (MarketRegime::MeanReverting, mean_reverting.min(1.0)),
            (MarketRegime::Breakout, breakout.min(1.0)),
            (MarketRegime::HighVolatility, high_volatility.min(1.0)),
            (MarketRegime::Consolidating, consolidating.min(1.0)),
        ]
    }

    /// Highest score wins; earlier entries win ties.
    fn pick_regime(&self, scores: &[(MarketRegime, f64)]) -> (MarketRegime, f64) {
        let mut best = (MarketRegime::Unknown, 0.0);
        for &(regime, score) in scores {
            if score > best.1 {
                best = (regime, score);
            }
        }
        if best.1 < self.thresholds.min_regime_score {
            return (MarketRegime::Unknown, best.1);
        }
        best
    }

    /// Returns (label, confidence, suppressed) and updates the persisted run.
    fn apply_hysteresis(
        &mut self,
        raw: MarketRegime,
        raw_confidence: f64,
    ) -> (MarketRegime, f64, bool) {
        let h = &self.hysteresis;
        match self.previous {
            Some(prev) if prev == raw => {
                self.consistency += 1;
                let boost = h.consistency_boost * (self.consistency - 1) as f64;
                (raw, (raw_confidence + boost).min(1.0), false)
            }
            Some(prev)
                if raw_confidence < h.switch_confidence
                    && self.consistency >= h.min_persistence =>
            {
                self.consistency += 1;
                (prev, raw_confidence, true)
            }
            _ => {
                self.previous = Some(raw);
                self.consistency = 1;
                (raw, raw_confidence, false)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_result(
        &self,
        ind: &IndicatorSnapshot,
        regime: MarketRegime,
        confidence: f64,
        consistency: u32,
        raw: RawLabel,
        scores: Vec<(MarketRegime, f64)>,
        reasoning: String,
    ) -> RegimeResult {
        RegimeResult {
            regime,
            confidence,
            trend_direction: ind.trend_direction(),
            trend_strength: (ind.adx / 100.0).clamp(0.0, 1.0),
            volatility_state: self.volatility_state(ind.atr_percent),
            consistency,
            details: RegimeDetails {
                adx: ind.adx,
                atr_percent: ind.atr_percent,
                bb_width: ind.bb_width,
                rsi: ind.rsi,
                volume_ratio: ind.volume_ratio,
                squeeze_active: ind.squeeze_active,
                scores,
                raw_regime: raw.regime,
                raw_confidence: raw.confidence,
                suppressed: raw.suppressed,
            },
            detected_at: Utc::now(),
            reasoning,
        }
    }

    fn volatility_state(&self, atr_percent: f64) -> VolatilityState {
        let t = &self.thresholds;
        if atr_percent >= t.extreme_volatility_atr_percent {
            VolatilityState::Extreme
        } else if atr_percent >= t.high_volatility_atr_percent {
            VolatilityState::High
        } else if atr_percent < t.low_volatility_atr_percent {
            VolatilityState::Low
        } else {
            VolatilityState::Normal
        }
    }
}

impl Default for RegimeClassifier {
    fn default() -> Self {
        Self::new()
    }
}

struct RawLabel {
    regime: MarketRegime,
    confidence: f64,
    suppressed: bool,
}
