use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Closed OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// High-low range of the bar (never negative)
    pub fn range(&self) -> f64 {
        (self.high - self.low).max(0.0)
    }
}

/// Bar timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    Minute1,
    Minute5,
    Minute15,
    Minute30,
    Hour1,
    Hour4,
    Day1,
}

impl Timeframe {
    pub fn to_minutes(&self) -> i64 {
        match self {
            Timeframe::Minute1 => 1,
            Timeframe::Minute5 => 5,
            Timeframe::Minute15 => 15,
            Timeframe::Minute30 => 30,
            Timeframe::Hour1 => 60,
            Timeframe::Hour4 => 240,
            Timeframe::Day1 => 1440,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.to_minutes())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Minute1 => "1m",
            Timeframe::Minute5 => "5m",
            Timeframe::Minute15 => "15m",
            Timeframe::Minute30 => "30m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour4 => "4h",
            Timeframe::Day1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" | "1min" => Ok(Timeframe::Minute1),
            "5m" | "5min" => Ok(Timeframe::Minute5),
            "15m" | "15min" => Ok(Timeframe::Minute15),
            "30m" | "30min" => Ok(Timeframe::Minute30),
            "1h" | "1hour" => Ok(Timeframe::Hour1),
            "4h" | "4hour" => Ok(Timeframe::Hour4),
            "1d" | "daily" => Ok(Timeframe::Day1),
            other => Err(EngineError::Configuration(format!(
                "unknown timeframe '{other}'"
            ))),
        }
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
    None,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
            Direction::None => Direction::None,
        }
    }

    /// +1 for long, -1 for short, 0 otherwise
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::None => 0.0,
        }
    }

    pub fn is_trade(&self) -> bool {
        !matches!(self, Direction::None)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Direction::Long => "long",
            Direction::Short => "short",
            Direction::None => "none",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Up,
    Down,
    Sideways,
}

/// Identifies a concrete strategy implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    TrendFollowing,
    MeanReversion,
    Breakout,
    Volatility,
    Statistical,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::TrendFollowing,
        StrategyKind::MeanReversion,
        StrategyKind::Breakout,
        StrategyKind::Volatility,
        StrategyKind::Statistical,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::TrendFollowing => "trend_following",
            StrategyKind::MeanReversion => "mean_reversion",
            StrategyKind::Breakout => "breakout",
            StrategyKind::Volatility => "volatility",
            StrategyKind::Statistical => "statistical",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    Entry,
    Exit,
}

/// Directional trade proposal from one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: SignalType,
    pub direction: Direction,
    /// 0.0 to 1.0
    pub strength: f64,
    pub price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub reason: String,
    pub strategy: StrategyKind,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    /// Check the side-of-entry rule and the [0, 1] ranges.
    ///
    /// Long: stop < price < target. Short: stop > price > target.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&self.strength) || !(0.0..=1.0).contains(&self.confidence) {
            return Err(EngineError::InvariantViolation(format!(
                "{} signal strength {:.3} / confidence {:.3} outside [0, 1]",
                self.strategy, self.strength, self.confidence
            )));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(EngineError::InvariantViolation(format!(
                "{} signal has non-positive price {}",
                self.strategy, self.price
            )));
        }

        let ordered = match self.direction {
            Direction::Long => self.stop_loss < self.price && self.price < self.take_profit,
            Direction::Short => self.stop_loss > self.price && self.price > self.take_profit,
            Direction::None => false,
        };
        if !ordered {
            return Err(EngineError::InvariantViolation(format!(
                "{} {} signal violates side-of-entry rule (stop {:.4}, price {:.4}, target {:.4})",
                self.strategy, self.direction, self.stop_loss, self.price, self.take_profit
            )));
        }
        Ok(())
    }

    /// Distance between entry and target divided by distance between entry and stop
    pub fn risk_reward(&self) -> f64 {
        let risk = (self.price - self.stop_loss).abs();
        if risk <= f64::EPSILON {
            return 0.0;
        }
        (self.take_profit - self.price).abs() / risk
    }
}

/// Precomputed indicator values for the most recent bar.
///
/// Produced by an [`IndicatorEngine`](crate::IndicatorEngine); consumers treat
/// it as opaque read-only input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub sma_long: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    /// (upper - lower) / middle
    pub bb_width: f64,
    /// Position of the close within the bands: 0 at lower, 1 at upper
    pub bb_percent_b: f64,
    pub atr: f64,
    /// ATR as a percentage of the close
    pub atr_percent: f64,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    /// Current volume / average volume
    pub volume_ratio: f64,
    /// Bollinger bands currently inside the Keltner channel
    pub squeeze_active: bool,
    /// Bars since the most recent squeeze ended (None if no squeeze in lookback)
    pub bars_since_squeeze: Option<usize>,
    /// Highest high of the channel lookback, excluding the current bar
    pub channel_high: f64,
    /// Lowest low of the channel lookback, excluding the current bar
    pub channel_low: f64,
}

impl Default for IndicatorSnapshot {
    fn default() -> Self {
        Self {
            rsi: 50.0,
            ema_fast: 0.0,
            ema_slow: 0.0,
            sma_long: 0.0,
            macd: 0.0,
            macd_signal: 0.0,
            macd_histogram: 0.0,
            bb_upper: 0.0,
            bb_middle: 0.0,
            bb_lower: 0.0,
            bb_width: 0.0,
            bb_percent_b: 0.5,
            atr: 0.0,
            atr_percent: 0.0,
            adx: 0.0,
            plus_di: 0.0,
            minus_di: 0.0,
            volume_ratio: 1.0,
            squeeze_active: false,
            bars_since_squeeze: None,
            channel_high: 0.0,
            channel_low: 0.0,
        }
    }
}

impl IndicatorSnapshot {
    pub fn trend_direction(&self) -> TrendDirection {
        if self.plus_di > self.minus_di && self.ema_fast > self.ema_slow {
            TrendDirection::Up
        } else if self.minus_di > self.plus_di && self.ema_fast < self.ema_slow {
            TrendDirection::Down
        } else {
            TrendDirection::Sideways
        }
    }
}

/// Everything a pipeline pass knows about the market, built fresh per pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub opens: Vec<f64>,
    pub highs: Vec<f64>,
    pub lows: Vec<f64>,
    pub closes: Vec<f64>,
    pub volumes: Vec<f64>,
    pub current_price: f64,
    pub indicators: IndicatorSnapshot,
}

impl MarketSnapshot {
    /// Split bars into parallel OHLCV sequences.
    pub fn from_bars(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        bars: &[Bar],
        indicators: IndicatorSnapshot,
    ) -> Self {
        let current_price = bars.last().map(|b| b.close).unwrap_or(0.0);
        let timestamp = bars.last().map(|b| b.close_time).unwrap_or_else(Utc::now);

        Self {
            symbol: symbol.into(),
            timeframe,
            timestamp,
            opens: bars.iter().map(|b| b.open).collect(),
            highs: bars.iter().map(|b| b.high).collect(),
            lows: bars.iter().map(|b| b.low).collect(),
            closes: bars.iter().map(|b| b.close).collect(),
            volumes: bars.iter().map(|b| b.volume).collect(),
            current_price,
            indicators,
        }
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }

    /// Close `n` bars back from the latest (0 = latest)
    pub fn close_back(&self, n: usize) -> Option<f64> {
        self.closes.len().checked_sub(n + 1).map(|i| self.closes[i])
    }
}

/// Position currently held, as seen by strategies deciding on exits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub opened_at: DateTime<Utc>,
    /// Strategy whose signal opened the position, if known
    pub strategy: Option<StrategyKind>,
}

impl OpenPosition {
    /// Number of whole bars of `timeframe` elapsed between opening and `now`
    pub fn bars_held(&self, now: DateTime<Utc>, timeframe: Timeframe) -> usize {
        let elapsed = (now - self.opened_at).num_minutes().max(0);
        (elapsed / timeframe.to_minutes().max(1)) as usize
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity * self.direction.sign()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(direction: Direction, stop: f64, price: f64, target: f64) -> Signal {
        Signal {
            signal_type: SignalType::Entry,
            direction,
            strength: 0.7,
            price,
            stop_loss: stop,
            take_profit: target,
            confidence: 0.6,
            reason: "test".to_string(),
            strategy: StrategyKind::TrendFollowing,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn long_signal_requires_stop_below_and_target_above() {
        assert!(signal(Direction::Long, 95.0, 100.0, 110.0).validate().is_ok());
        assert!(signal(Direction::Long, 101.0, 100.0, 110.0).validate().is_err());
        assert!(signal(Direction::Long, 95.0, 100.0, 99.0).validate().is_err());
    }

    #[test]
    fn short_signal_requires_stop_above_and_target_below() {
        assert!(signal(Direction::Short, 105.0, 100.0, 90.0).validate().is_ok());
        assert!(signal(Direction::Short, 95.0, 100.0, 90.0).validate().is_err());
    }

    #[test]
    fn out_of_range_strength_is_rejected() {
        let mut s = signal(Direction::Long, 95.0, 100.0, 110.0);
        s.strength = 1.2;
        assert!(matches!(s.validate(), Err(EngineError::InvariantViolation(_))));
    }

    #[test]
    fn risk_reward_uses_entry_distances() {
        let s = signal(Direction::Long, 1960.0, 2000.0, 2120.0);
        assert!((s.risk_reward() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn timeframe_parses_common_labels() {
        assert_eq!("15m".parse::<Timeframe>().unwrap(), Timeframe::Minute15);
        assert_eq!("1h".parse::<Timeframe>().unwrap(), Timeframe::Hour1);
        assert!("7x".parse::<Timeframe>().is_err());
    }

    #[test]
    fn bars_held_counts_whole_bars() {
        let opened_at = Utc::now();
        let pos = OpenPosition {
            symbol: "ETHUSDT".to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            quantity: 1.0,
            stop_loss: None,
            take_profit: None,
            opened_at,
            strategy: None,
        };
        let later = opened_at + Duration::minutes(47);
        assert_eq!(pos.bars_held(later, Timeframe::Minute15), 3);
        assert!((pos.unrealized_pnl(110.0) - 10.0).abs() < 1e-9);
    }
}
