use std::fmt;
use std::str::FromStr;

use analysis_core::{Direction, EngineError, MarketSnapshot, Signal, StrategyKind};
use market_regime_detector::MarketRegime;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{RegimeWeights, StrategySet};

/// How weighted signals are reduced to one decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinePolicy {
    /// Strongest weighted signal wins
    HighestScore,
    /// A direction needs a supermajority of signals
    Consensus,
    /// Abstain on any conflict, otherwise HighestScore
    NoTrade,
    /// Net strength across both directions
    Average,
}

impl fmt::Display for CombinePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CombinePolicy::HighestScore => "highest_score",
            CombinePolicy::Consensus => "consensus",
            CombinePolicy::NoTrade => "no_trade",
            CombinePolicy::Average => "average",
        };
        f.write_str(label)
    }
}

impl FromStr for CombinePolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "highest_score" | "highest" => Ok(CombinePolicy::HighestScore),
            "consensus" => Ok(CombinePolicy::Consensus),
            "no_trade" | "notrade" => Ok(CombinePolicy::NoTrade),
            "average" | "avg" => Ok(CombinePolicy::Average),
            other => Err(EngineError::Configuration(format!(
                "unknown combine policy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub policy: CombinePolicy,
    pub min_score: f64,
    pub min_confidence: f64,
    /// Consensus winner needs more than this many times the other side's count
    pub consensus_ratio: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            policy: CombinePolicy::HighestScore,
            min_score: 0.5,
            min_confidence: 0.5,
            consensus_ratio: 2.0,
        }
    }
}

/// One strategy's share of a decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyContribution {
    pub strategy: StrategyKind,
    pub weight: f64,
    pub signal_count: usize,
    /// Direction of the strategy's strongest signal
    pub direction: Direction,
    /// Strongest weighted strength (0 when silent)
    pub strength: f64,
    pub confidence: f64,
}

/// Combined decision for one pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedScore {
    pub should_trade: bool,
    pub direction: Direction,
    pub score: f64,
    pub confidence: f64,
    pub best_signal: Option<Signal>,
    pub breakdown: Vec<StrategyContribution>,
    pub conflict: bool,
    /// 1 when both sides are equally strong, 0 when one-sided
    pub conflict_level: f64,
    pub long_count: usize,
    pub short_count: usize,
    pub regime: MarketRegime,
    pub policy: CombinePolicy,
    pub reason: String,
}

impl CombinedScore {
    pub fn total_signals(&self) -> usize {
        self.long_count + self.short_count
    }
}

/// Weights strategy output by regime and reduces it to a [`CombinedScore`].
pub struct SignalAggregator {
    strategies: StrategySet,
    weights: RegimeWeights,
    config: AggregatorConfig,
}

impl SignalAggregator {
    pub fn new(strategies: StrategySet, weights: RegimeWeights, config: AggregatorConfig) -> Self {
        Self {
            strategies,
            weights,
            config,
        }
    }

    pub fn strategies(&self) -> &StrategySet {
        &self.strategies
    }

    pub fn strategies_mut(&mut self) -> &mut StrategySet {
        &mut self.strategies
    }

    pub fn weights(&self) -> &RegimeWeights {
        &self.weights
    }

    pub fn set_weights(&mut self, weights: RegimeWeights) {
        self.weights = weights;
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn set_policy(&mut self, policy: CombinePolicy) {
        self.config.policy = policy;
    }

    /// Run every enabled strategy and combine the regime-weighted signals.
    pub fn score(&self, snapshot: &MarketSnapshot, regime: MarketRegime) -> CombinedScore {
        let mut weighted = Vec::new();
        let mut breakdown = Vec::new();

        for (kind, signals) in self.strategies.analyze(snapshot) {
            let weight = self.weights.weight(kind, regime);
            // uncapped until reported so weights above 1 still rank
            let scaled: Vec<Signal> = signals
                .into_iter()
                .map(|mut s| {
                    s.strength = (s.strength * weight).max(0.0);
                    s.confidence = (s.confidence * weight).max(0.0);
                    s
                })
                .collect();

            let strongest = scaled
                .iter()
                .max_by(|a, b| a.strength.total_cmp(&b.strength));
            breakdown.push(StrategyContribution {
                strategy: kind,
                weight,
                signal_count: scaled.len(),
                direction: strongest.map(|s| s.direction).unwrap_or(Direction::None),
                strength: strongest.map_or(0.0, |s| s.strength.min(1.0)),
                confidence: strongest.map_or(0.0, |s| s.confidence.min(1.0)),
            });
            weighted.extend(scaled);
        }

        let result = self.combine(weighted, breakdown, regime);
        debug!(
            symbol = %snapshot.symbol,
            regime = ?regime,
            policy = %result.policy,
            direction = %result.direction,
            score = result.score,
            confidence = result.confidence,
            conflict = result.conflict,
            "signals combined"
        );
        result
    }

    /// Reduce already-weighted signals under the configured policy.
    ///
    /// Weighted strengths may exceed 1; ranking uses them as given and the
    /// reported score and best signal are capped to [0, 1].
    pub fn combine(
        &self,
        mut signals: Vec<Signal>,
        breakdown: Vec<StrategyContribution>,
        regime: MarketRegime,
    ) -> CombinedScore {
        let policy = self.config.policy;
        // stable: equal strengths keep registration order
        signals.sort_by(|a, b| b.strength.total_cmp(&a.strength));

        let long: Vec<&Signal> = signals
            .iter()
            .filter(|s| s.direction == Direction::Long)
            .collect();
        let short: Vec<&Signal> = signals
            .iter()
            .filter(|s| s.direction == Direction::Short)
            .collect();
        let long_score: f64 = long.iter().map(|s| s.strength).sum();
        let short_score: f64 = short.iter().map(|s| s.strength).sum();

        let conflict = !long.is_empty() && !short.is_empty();
        let total_score = long_score + short_score;
        let conflict_level = if conflict && total_score > 0.0 {
            1.0 - (long_score - short_score).abs() / total_score
        } else {
            0.0
        };

        let mut out = CombinedScore {
            should_trade: false,
            direction: Direction::None,
            score: 0.0,
            confidence: 0.0,
            best_signal: None,
            breakdown,
            conflict,
            conflict_level,
            long_count: long.len(),
            short_count: short.len(),
            regime,
            policy,
            reason: String::new(),
        };

        if signals.is_empty() {
            out.reason = "no signals".to_string();
            return out;
        }

        let decided: Option<(Direction, f64, f64, Signal)> = match policy {
            CombinePolicy::HighestScore => highest(&signals),
            CombinePolicy::NoTrade if conflict => {
                out.reason = "conflicting directions".to_string();
                None
            }
            CombinePolicy::NoTrade => highest(&signals),
            CombinePolicy::Consensus => {
                let ratio = self.config.consensus_ratio;
                let total = signals.len() as f64;
                let winner = if long.len() as f64 > ratio * short.len() as f64 {
                    Some((Direction::Long, &long))
                } else if short.len() as f64 > ratio * long.len() as f64 {
                    Some((Direction::Short, &short))
                } else {
                    out.reason = format!("no consensus ({} long / {} short)", long.len(), short.len());
                    None
                };
                winner.map(|(direction, side)| {
                    let mean = side.iter().map(|s| s.strength).sum::<f64>() / side.len() as f64;
                    (direction, mean, side.len() as f64 / total, side[0].clone())
                })
            }
            CombinePolicy::Average => {
                let total = signals.len() as f64;
                let net = (long_score - short_score) / total;
                let confidence = signals.iter().map(|s| s.confidence).sum::<f64>() / total;
                let side = if net > 0.0 {
                    Some((Direction::Long, &long))
                } else if net < 0.0 {
                    Some((Direction::Short, &short))
                } else {
                    out.reason = "long and short cancel out".to_string();
                    None
                };
                side.map(|(direction, side)| (direction, net.abs(), confidence, side[0].clone()))
            }
        };

        if let Some((direction, score, confidence, mut best)) = decided {
            best.strength = best.strength.clamp(0.0, 1.0);
            best.confidence = best.confidence.clamp(0.0, 1.0);
            let cfg = &self.config;
            out.direction = direction;
            out.score = score.clamp(0.0, 1.0);
            out.confidence = confidence.clamp(0.0, 1.0);
            out.should_trade = direction.is_trade()
                && out.score >= cfg.min_score
                && out.confidence >= cfg.min_confidence;
            out.reason = if out.should_trade {
                format!("{} via {}: {}", direction, best.strategy, best.reason)
            } else {
                format!(
                    "{} below threshold (score {:.2}/{:.2}, confidence {:.2}/{:.2})",
                    direction, out.score, cfg.min_score, out.confidence, cfg.min_confidence
                )
            };
            out.best_signal = Some(best);
        }
        out
    }
}

fn highest(sorted: &[Signal]) -> Option<(Direction, f64, f64, Signal)> {
    sorted
        .first()
        .map(|s| (s.direction, s.strength, s.confidence, s.clone()))
}
