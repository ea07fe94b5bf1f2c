use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use analysis_core::{EngineError, Timeframe};
use anyhow::{anyhow, Result};
use risk_manager::{PositionSizer, RiskParameters, SizingMethod, TradingSchedule};
use serde::{Deserialize, Serialize};
use strategy_engine::{AggregatorConfig, CombinePolicy};

/// How the decision loop receives closed bars
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    /// Subscribe to pushed bars, falling back to polling if that fails
    Push,
    /// Poll the feed every `poll_interval`
    Poll,
}

impl FromStr for FeedMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "push" | "stream" => Ok(FeedMode::Push),
            "poll" | "pull" => Ok(FeedMode::Poll),
            other => Err(EngineError::Configuration(format!(
                "unknown run mode '{}' (expected push or poll)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Market
    pub symbol: String,
    pub timeframe: Timeframe,
    pub feed_mode: FeedMode,
    pub min_bars: usize,               // 50
    pub bar_window: usize,             // 200

    // Loop timing
    pub risk_refresh_secs: u64,        // 30
    pub state_broadcast_secs: u64,     // 5
    pub poll_interval_secs: u64,       // 60
    pub collaborator_timeout_secs: u64, // 10
    pub subscriber_queue_capacity: usize,
    pub metrics_log_interval: u64,

    // Signal combination
    pub combine_policy: CombinePolicy,
    pub min_score_for_entry: f64,      // 0.5
    pub min_confidence: f64,           // 0.5

    // Risk limits
    pub max_drawdown: f64,             // 0.20
    pub max_daily_loss: f64,           // 0.05
    pub max_weekly_loss: f64,          // 0.10
    pub max_open_positions: u32,
    pub max_consecutive_losses: u32,
    pub circuit_breaker: bool,
    pub halt_cooldown_minutes: i64,
    pub min_risk_reward: f64,          // 1.5

    // Sizing
    pub risk_per_trade: f64,           // 0.01
    pub sizing_method: SizingMethod,

    // Optional trading window, "tz,open,close[,weekdays]"
    pub trading_hours: Option<TradingSchedule>,

    // Collaborators
    pub database_url: Option<String>,
    pub paper_equity: f64,
    pub replay_file: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let risk = RiskParameters::default();
        let aggregator = AggregatorConfig::default();
        Self {
            symbol: "ETHUSDT".to_string(),
            timeframe: Timeframe::Minute15,
            feed_mode: FeedMode::Push,
            min_bars: 50,
            bar_window: 200,
            risk_refresh_secs: 30,
            state_broadcast_secs: 5,
            poll_interval_secs: 60,
            collaborator_timeout_secs: 10,
            subscriber_queue_capacity: 256,
            metrics_log_interval: 20,
            combine_policy: aggregator.policy,
            min_score_for_entry: aggregator.min_score,
            min_confidence: aggregator.min_confidence,
            max_drawdown: risk.max_drawdown,
            max_daily_loss: risk.max_daily_loss,
            max_weekly_loss: risk.max_weekly_loss,
            max_open_positions: risk.max_open_positions,
            max_consecutive_losses: risk.max_consecutive_losses,
            circuit_breaker: risk.circuit_breaker,
            halt_cooldown_minutes: risk.halt_cooldown_minutes,
            min_risk_reward: risk.min_risk_reward,
            risk_per_trade: PositionSizer::default().risk_per_trade,
            sizing_method: SizingMethod::FixedFractional,
            trading_hours: None,
            database_url: None,
            paper_equity: 10_000.0,
            replay_file: None,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("{} = '{}': {}", key, raw, e)),
        _ => Ok(default),
    }
}

impl AgentConfig {
    /// Load `.env`, read the environment, validate.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Self::default();
        let config = Self {
            symbol: parse_var(&lookup, "SYMBOL", d.symbol)?.to_ascii_uppercase(),
            timeframe: parse_var(&lookup, "TIMEFRAME", d.timeframe)?,
            feed_mode: parse_var(&lookup, "RUN_MODE", d.feed_mode)?,
            min_bars: parse_var(&lookup, "MIN_BARS", d.min_bars)?,
            bar_window: parse_var(&lookup, "BAR_WINDOW", d.bar_window)?,

            risk_refresh_secs: parse_var(&lookup, "RISK_REFRESH_SECS", d.risk_refresh_secs)?,
            state_broadcast_secs: parse_var(&lookup, "STATE_BROADCAST_SECS", d.state_broadcast_secs)?,
            poll_interval_secs: parse_var(&lookup, "POLL_INTERVAL_SECS", d.poll_interval_secs)?,
            collaborator_timeout_secs: parse_var(
                &lookup,
                "COLLABORATOR_TIMEOUT_SECS",
                d.collaborator_timeout_secs,
            )?,
            subscriber_queue_capacity: parse_var(
                &lookup,
                "SUBSCRIBER_QUEUE_CAPACITY",
                d.subscriber_queue_capacity,
            )?,
            metrics_log_interval: parse_var(&lookup, "METRICS_LOG_INTERVAL", d.metrics_log_interval)?,

            combine_policy: parse_var(&lookup, "COMBINE_POLICY", d.combine_policy)?,
            min_score_for_entry: parse_var(&lookup, "MIN_SCORE_FOR_ENTRY", d.min_score_for_entry)?,
            min_confidence: parse_var(&lookup, "MIN_CONFIDENCE", d.min_confidence)?,

            max_drawdown: parse_var(&lookup, "MAX_DRAWDOWN", d.max_drawdown)?,
            max_daily_loss: parse_var(&lookup, "MAX_DAILY_LOSS", d.max_daily_loss)?,
            max_weekly_loss: parse_var(&lookup, "MAX_WEEKLY_LOSS", d.max_weekly_loss)?,
            max_open_positions: parse_var(&lookup, "MAX_OPEN_POSITIONS", d.max_open_positions)?,
            max_consecutive_losses: parse_var(
                &lookup,
                "MAX_CONSECUTIVE_LOSSES",
                d.max_consecutive_losses,
            )?,
            circuit_breaker: parse_var(&lookup, "CIRCUIT_BREAKER", d.circuit_breaker)?,
            halt_cooldown_minutes: parse_var(&lookup, "HALT_COOLDOWN_MINUTES", d.halt_cooldown_minutes)?,
            min_risk_reward: parse_var(&lookup, "MIN_RISK_REWARD", d.min_risk_reward)?,

            risk_per_trade: parse_var(&lookup, "RISK_PER_TRADE", d.risk_per_trade)?,
            sizing_method: parse_var(&lookup, "SIZING_METHOD", d.sizing_method)?,

            trading_hours: match lookup("TRADING_HOURS").filter(|s| !s.trim().is_empty()) {
                Some(raw) => Some(raw.parse::<TradingSchedule>()?),
                None => None,
            },

            database_url: lookup("DATABASE_URL").filter(|s| !s.trim().is_empty()),
            paper_equity: parse_var(&lookup, "PAPER_EQUITY", d.paper_equity)?,
            replay_file: lookup("REPLAY_FILE").filter(|s| !s.trim().is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let bad = |msg: String| Err(EngineError::Configuration(msg));

        if self.symbol.trim().is_empty() {
            return bad("SYMBOL must not be empty".to_string());
        }
        if self.min_bars == 0 {
            return bad("MIN_BARS must be at least 1".to_string());
        }
        if self.bar_window < self.min_bars {
            return bad(format!(
                "BAR_WINDOW ({}) must be >= MIN_BARS ({})",
                self.bar_window, self.min_bars
            ));
        }
        for (name, secs) in [
            ("RISK_REFRESH_SECS", self.risk_refresh_secs),
            ("STATE_BROADCAST_SECS", self.state_broadcast_secs),
            ("POLL_INTERVAL_SECS", self.poll_interval_secs),
            ("COLLABORATOR_TIMEOUT_SECS", self.collaborator_timeout_secs),
        ] {
            if secs == 0 {
                return bad(format!("{} must be at least 1", name));
            }
        }
        if self.subscriber_queue_capacity == 0 {
            return bad("SUBSCRIBER_QUEUE_CAPACITY must be at least 1".to_string());
        }
        for (name, value) in [
            ("MIN_SCORE_FOR_ENTRY", self.min_score_for_entry),
            ("MIN_CONFIDENCE", self.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return bad(format!("{} must be in [0, 1], got {}", name, value));
            }
        }
        if !(self.risk_per_trade > 0.0 && self.risk_per_trade <= 0.1) {
            return bad(format!(
                "RISK_PER_TRADE must be in (0, 0.1], got {}",
                self.risk_per_trade
            ));
        }
        if self.paper_equity <= 0.0 {
            return bad(format!("PAPER_EQUITY must be positive, got {}", self.paper_equity));
        }
        self.risk_parameters().validate()
    }

    pub fn risk_parameters(&self) -> RiskParameters {
        RiskParameters {
            max_drawdown: self.max_drawdown,
            max_daily_loss: self.max_daily_loss,
            max_weekly_loss: self.max_weekly_loss,
            max_open_positions: self.max_open_positions,
            max_consecutive_losses: self.max_consecutive_losses,
            circuit_breaker: self.circuit_breaker,
            halt_cooldown_minutes: self.halt_cooldown_minutes,
            min_risk_reward: self.min_risk_reward,
            ..RiskParameters::default()
        }
    }

    pub fn position_sizer(&self) -> PositionSizer {
        PositionSizer {
            method: self.sizing_method,
            risk_per_trade: self.risk_per_trade,
            ..PositionSizer::default()
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            policy: self.combine_policy,
            min_score: self.min_score_for_entry,
            min_confidence: self.min_confidence,
            ..AggregatorConfig::default()
        }
    }

    pub fn loop_config(&self) -> crate::decision_loop::LoopConfig {
        crate::decision_loop::LoopConfig {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            feed_mode: self.feed_mode,
            min_bars: self.min_bars,
            bar_window: self.bar_window,
            risk_refresh_interval: Duration::from_secs(self.risk_refresh_secs),
            state_broadcast_interval: Duration::from_secs(self.state_broadcast_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            collaborator_timeout: Duration::from_secs(self.collaborator_timeout_secs),
            metrics_log_interval: self.metrics_log_interval,
            ..crate::decision_loop::LoopConfig::default()
        }
    }
}
