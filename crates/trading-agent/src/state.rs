use std::fmt;

use analysis_core::{IndicatorSnapshot, OpenPosition, Timeframe};
use chrono::{DateTime, Utc};
use market_regime_detector::RegimeResult;
use risk_manager::AccountState;
use serde::{Deserialize, Serialize};

use crate::config::FeedMode;
use crate::events::SignalRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Created,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoopState::Created => "created",
            LoopState::Running => "running",
            LoopState::Paused => "paused",
            LoopState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Everything a UI needs to render the engine. Published whole on every
/// state broadcast; writers compute first and hold the lock only to swap
/// fields in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingState {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub mode: FeedMode,
    pub lifecycle: LoopState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_price: Option<f64>,
    pub last_bar_at: Option<DateTime<Utc>>,
    pub regime: Option<RegimeResult>,
    pub indicators: Option<IndicatorSnapshot>,
    pub last_signal: Option<SignalRecord>,
    pub positions: Vec<OpenPosition>,
    pub account: Option<AccountState>,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub passes: u64,
    pub candles: u64,
    /// Tradeable signals sent to the risk gate
    pub signals: u64,
    pub updated_at: DateTime<Utc>,
}

impl TradingState {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            mode: FeedMode::Push,
            lifecycle: LoopState::Created,
            started_at: None,
            last_price: None,
            last_bar_at: None,
            regime: None,
            indicators: None,
            last_signal: None,
            positions: Vec::new(),
            account: None,
            halted: false,
            halt_reason: None,
            passes: 0,
            candles: 0,
            signals: 0,
            updated_at: Utc::now(),
        }
    }
}
