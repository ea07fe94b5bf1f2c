use analysis_core::{Direction, EngineError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hard limits enforced by the [`RiskGate`](crate::RiskGate). Fractions, not percentages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameters {
    /// Maximum drawdown from peak equity (0.20 = 20%)
    pub max_drawdown: f64,
    /// Maximum daily loss as a fraction of current equity
    pub max_daily_loss: f64,
    /// Maximum weekly loss as a fraction of current equity
    pub max_weekly_loss: f64,
    pub max_open_positions: u32,
    pub max_consecutive_losses: u32,
    /// Halt automatically on drawdown or loss-streak breaches
    pub circuit_breaker: bool,
    /// How long an automatic halt lasts before trading resumes
    pub halt_cooldown_minutes: i64,
    pub min_risk_reward: f64,
    /// Fraction of a limit at which a warning is attached
    #[serde(default = "default_warn_fraction")]
    pub warn_fraction: f64,
    /// Number of risk events kept in history
    #[serde(default = "default_event_history")]
    pub event_history: usize,
}

fn default_warn_fraction() -> f64 { 0.8 }
fn default_event_history() -> usize { 100 }

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            max_drawdown: 0.20,
            max_daily_loss: 0.05,
            max_weekly_loss: 0.10,
            max_open_positions: 3,
            max_consecutive_losses: 5,
            circuit_breaker: true,
            halt_cooldown_minutes: 60,
            min_risk_reward: 1.5,
            warn_fraction: default_warn_fraction(),
            event_history: default_event_history(),
        }
    }
}

impl RiskParameters {
    pub fn validate(&self) -> Result<(), EngineError> {
        let fractions = [
            ("max_drawdown", self.max_drawdown),
            ("max_daily_loss", self.max_daily_loss),
            ("max_weekly_loss", self.max_weekly_loss),
            ("warn_fraction", self.warn_fraction),
        ];
        for (name, value) in fractions {
            if !(value > 0.0 && value <= 1.0) {
                return Err(EngineError::Configuration(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.max_open_positions == 0 {
            return Err(EngineError::Configuration(
                "max_open_positions must be at least 1".to_string(),
            ));
        }
        if self.min_risk_reward < 0.0 {
            return Err(EngineError::Configuration(format!(
                "min_risk_reward must not be negative, got {}",
                self.min_risk_reward
            )));
        }
        if self.halt_cooldown_minutes < 0 {
            return Err(EngineError::Configuration(
                "halt_cooldown_minutes must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Process-wide account view owned by the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub equity: f64,
    pub available: f64,
    pub unrealized_pnl: f64,
    /// Highest equity seen; never decreases
    pub peak_equity: f64,
    /// (peak - equity) / peak
    pub drawdown: f64,
    pub daily_pnl: f64,
    pub weekly_pnl: f64,
    pub open_positions: u32,
    pub consecutive_losses: u32,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub halted_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
    /// Soft-limit latches so events fire once per breach
    #[serde(default)]
    pub daily_limit_breached: bool,
    #[serde(default)]
    pub weekly_limit_breached: bool,
    pub updated_at: DateTime<Utc>,
}

impl AccountState {
    pub fn new(equity: f64) -> Self {
        Self {
            equity,
            available: equity,
            unrealized_pnl: 0.0,
            peak_equity: equity.max(0.0),
            drawdown: 0.0,
            daily_pnl: 0.0,
            weekly_pnl: 0.0,
            open_positions: 0,
            consecutive_losses: 0,
            halted: false,
            halt_reason: None,
            halted_at: None,
            resume_at: None,
            daily_limit_breached: false,
            weekly_limit_breached: false,
            updated_at: Utc::now(),
        }
    }

    /// Daily loss as a fraction of current equity (0 when flat or up)
    pub fn daily_loss_fraction(&self) -> f64 {
        loss_fraction(self.daily_pnl, self.equity)
    }

    pub fn weekly_loss_fraction(&self) -> f64 {
        loss_fraction(self.weekly_pnl, self.equity)
    }
}

fn loss_fraction(pnl: f64, equity: f64) -> f64 {
    if pnl >= 0.0 || equity <= 0.0 {
        0.0
    } else {
        -pnl / equity
    }
}

/// Periodic account refresh from the executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub equity: f64,
    pub available: f64,
    pub unrealized_pnl: f64,
    pub daily_pnl: f64,
    pub weekly_pnl: f64,
    pub open_positions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GateStatus {
    Active,
    Halted {
        reason: String,
        resume_at: Option<DateTime<Utc>>,
    },
}

/// Candidate trade submitted for assessment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeParams {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Signal strength, 0.0 - 1.0
    pub strength: f64,
    /// ATR as a percentage of price
    pub volatility: f64,
    /// Regime risk multiplier applied to the sized quantity
    pub size_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub approved: bool,
    pub level: RiskLevel,
    /// Rejection causes, most severe first
    pub reasons: Vec<String>,
    /// Near-limit notes; never block a trade on their own
    pub warnings: Vec<String>,
    pub position_size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_amount: f64,
    pub reward_amount: f64,
    pub risk_reward: f64,
    pub assessed_at: DateTime<Utc>,
}

/// Realized result of a closed trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub symbol: String,
    pub pnl: f64,
    pub closed_at: DateTime<Utc>,
}

impl TradeOutcome {
    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }

    pub fn is_loss(&self) -> bool {
        self.pnl < 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventKind {
    DailyLossLimit,
    WeeklyLossLimit,
    DrawdownLimit,
    ConsecutiveLosses,
    Halted,
    Resumed,
}

/// Observational record of a risk condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub kind: RiskEventKind,
    pub level: RiskLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl RiskEvent {
    pub fn new(
        kind: RiskEventKind,
        level: RiskLevel,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            level,
            message: message.into(),
            timestamp,
            details,
        }
    }
}
