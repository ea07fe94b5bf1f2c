use analysis_core::{Bar, Direction, IndicatorSnapshot, OpenPosition, Signal, Timeframe};
use chrono::{DateTime, Utc};
use market_regime_detector::{MarketRegime, RegimeResult};
use risk_manager::{RiskAssessment, RiskEvent, RiskLevel};
use serde::{Deserialize, Serialize};

use crate::state::TradingState;

/// One entry of the signal history: the winning signal of a tradeable pass
/// and what the risk gate made of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub symbol: String,
    pub signal: Signal,
    pub regime: MarketRegime,
    pub score: f64,
    pub confidence: f64,
    pub approved: bool,
    pub level: RiskLevel,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
    pub position_size: f64,
    pub risk_reward: f64,
    pub recorded_at: DateTime<Utc>,
}

impl SignalRecord {
    pub fn new(
        symbol: &str,
        signal: Signal,
        regime: MarketRegime,
        score: f64,
        confidence: f64,
        assessment: &RiskAssessment,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            signal,
            regime,
            score,
            confidence,
            approved: assessment.approved,
            level: assessment.level,
            reasons: assessment.reasons.clone(),
            warnings: assessment.warnings.clone(),
            position_size: assessment.position_size,
            risk_reward: assessment.risk_reward,
            recorded_at: assessment.assessed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionChange {
    Opened,
    Updated,
    Closed,
}

/// Messages fanned out to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TradingEvent {
    Price {
        symbol: String,
        price: f64,
        timestamp: DateTime<Utc>,
    },
    Candle {
        symbol: String,
        timeframe: Timeframe,
        bar: Bar,
    },
    Signal(Box<SignalRecord>),
    Trade {
        symbol: String,
        order_id: String,
        direction: Direction,
        quantity: f64,
        price: f64,
        stop_loss: f64,
        take_profit: f64,
        timestamp: DateTime<Utc>,
    },
    Position {
        symbol: String,
        change: PositionChange,
        position: Option<OpenPosition>,
        pnl: Option<f64>,
        reason: Option<String>,
    },
    Risk(RiskEvent),
    State(Box<TradingState>),
    Indicators {
        symbol: String,
        indicators: IndicatorSnapshot,
        regime: Box<RegimeResult>,
    },
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl TradingEvent {
    pub fn error(message: impl Into<String>) -> Self {
        TradingEvent::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            TradingEvent::Price { .. } => "price",
            TradingEvent::Candle { .. } => "candle",
            TradingEvent::Signal(_) => "signal",
            TradingEvent::Trade { .. } => "trade",
            TradingEvent::Position { .. } => "position",
            TradingEvent::Risk(_) => "risk",
            TradingEvent::State(_) => "state",
            TradingEvent::Indicators { .. } => "indicators",
            TradingEvent::Error { .. } => "error",
        }
    }
}
