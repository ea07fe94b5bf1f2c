use std::collections::BTreeMap;

use analysis_core::StrategyKind;
use market_regime_detector::MarketRegime;
use serde::{Deserialize, Serialize};

/// Per-strategy weight, biased by the current regime.
///
/// `weight(kind, regime) = base[kind] * multipliers[regime][kind]`, with 1.0
/// standing in for any missing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeWeights {
    pub base: BTreeMap<StrategyKind, f64>,
    pub multipliers: BTreeMap<MarketRegime, BTreeMap<StrategyKind, f64>>,
}

impl RegimeWeights {
    pub fn weight(&self, kind: StrategyKind, regime: MarketRegime) -> f64 {
        let base = self.base.get(&kind).copied().unwrap_or(1.0);
        let multiplier = self
            .multipliers
            .get(&regime)
            .and_then(|m| m.get(&kind))
            .copied()
            .unwrap_or(1.0);
        (base * multiplier).max(0.0)
    }

    pub fn set_base(&mut self, kind: StrategyKind, weight: f64) {
        self.base.insert(kind, weight);
    }

    pub fn set_multiplier(&mut self, regime: MarketRegime, kind: StrategyKind, multiplier: f64) {
        self.multipliers
            .entry(regime)
            .or_default()
            .insert(kind, multiplier);
    }
}

impl Default for RegimeWeights {
    fn default() -> Self {
        use StrategyKind::*;

        // trend, mean reversion, breakout, volatility, statistical
        let table = [
            (MarketRegime::Trending, [1.2, 0.6, 1.0, 0.9, 0.7]),
            (MarketRegime::MeanReverting, [0.6, 1.3, 0.7, 0.8, 1.2]),
            (MarketRegime::Breakout, [1.0, 0.6, 1.3, 1.1, 0.6]),
            (MarketRegime::HighVolatility, [0.8, 0.7, 0.9, 1.3, 0.6]),
            (MarketRegime::Consolidating, [0.6, 1.2, 1.0, 0.9, 1.1]),
            (MarketRegime::Unknown, [0.8, 0.8, 0.8, 0.8, 0.8]),
        ];
        let kinds = [TrendFollowing, MeanReversion, Breakout, Volatility, Statistical];

        let multipliers = table
            .into_iter()
            .map(|(regime, row)| (regime, kinds.into_iter().zip(row).collect()))
            .collect();
        let base = kinds.into_iter().map(|k| (k, 1.0)).collect();

        Self { base, multipliers }
    }
}
