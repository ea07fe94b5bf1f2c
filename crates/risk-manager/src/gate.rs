use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::*;
use crate::schedule::TradingSchedule;
use crate::sizing::PositionSizer;

/// Risk state machine: sizes and approves trades, halts on hard breaches.
///
/// States are Active and Halted(reason, resume time). A halt clears itself
/// the first time any status check runs after the resume time, or at once
/// through [`RiskGate::reset_halt`].
pub struct RiskGate {
    params: RiskParameters,
    sizer: PositionSizer,
    schedule: Option<TradingSchedule>,
    state: RwLock<AccountState>,
    events: RwLock<VecDeque<RiskEvent>>,
}

impl RiskGate {
    pub fn new(params: RiskParameters, sizer: PositionSizer, initial_equity: f64) -> Self {
        Self {
            params,
            sizer,
            schedule: None,
            state: RwLock::new(AccountState::new(initial_equity)),
            events: RwLock::new(VecDeque::new()),
        }
    }

    pub fn with_schedule(mut self, schedule: TradingSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn params(&self) -> &RiskParameters {
        &self.params
    }

    pub fn sizer(&self) -> &PositionSizer {
        &self.sizer
    }

    pub async fn account_state(&self) -> AccountState {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> GateStatus {
        self.status_at(Utc::now()).await
    }

    pub async fn status_at(&self, now: DateTime<Utc>) -> GateStatus {
        self.resume_if_due(now).await;
        let state = self.state.read().await;
        if state.halted {
            GateStatus::Halted {
                reason: state.halt_reason.clone().unwrap_or_default(),
                resume_at: state.resume_at,
            }
        } else {
            GateStatus::Active
        }
    }

    pub async fn is_halted(&self) -> bool {
        self.is_halted_at(Utc::now()).await
    }

    pub async fn is_halted_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status_at(now).await, GateStatus::Halted { .. })
    }

    pub async fn halt_reason(&self) -> Option<String> {
        match self.status().await {
            GateStatus::Halted { reason, .. } => Some(reason),
            GateStatus::Active => None,
        }
    }

    /// Most recent events first
    pub async fn recent_events(&self, limit: usize) -> Vec<RiskEvent> {
        self.events.read().await.iter().rev().take(limit).cloned().collect()
    }

    /// Refresh account figures. Soft breaches (daily, weekly loss) only emit
    /// events; a drawdown breach also halts trading when the circuit breaker
    /// is enabled.
    pub async fn update_account_state(&self, update: AccountUpdate) -> Vec<RiskEvent> {
        self.update_account_state_at(update, Utc::now()).await
    }

    pub async fn update_account_state_at(
        &self,
        update: AccountUpdate,
        now: DateTime<Utc>,
    ) -> Vec<RiskEvent> {
        let p = &self.params;
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            if let Some(ev) = self.resume_locked(&mut state, now) {
                events.push(ev);
            }

            state.equity = update.equity;
            state.available = update.available;
            state.unrealized_pnl = update.unrealized_pnl;
            state.daily_pnl = update.daily_pnl;
            state.weekly_pnl = update.weekly_pnl;
            state.open_positions = update.open_positions;
            state.peak_equity = state.peak_equity.max(update.equity);
            state.drawdown = if state.peak_equity > 0.0 {
                ((state.peak_equity - state.equity) / state.peak_equity).max(0.0)
            } else {
                0.0
            };
            state.updated_at = now;

            let daily = state.daily_loss_fraction();
            let daily_breached = daily >= p.max_daily_loss;
            if daily_breached && !state.daily_limit_breached {
                events.push(RiskEvent::new(
                    RiskEventKind::DailyLossLimit,
                    RiskLevel::High,
                    format!(
                        "Daily loss {:.1}% reached limit {:.1}%",
                        daily * 100.0,
                        p.max_daily_loss * 100.0
                    ),
                    now,
                    json!({ "daily_pnl": state.daily_pnl, "loss_fraction": daily }),
                ));
            }
            state.daily_limit_breached = daily_breached;

            let weekly = state.weekly_loss_fraction();
            let weekly_breached = weekly >= p.max_weekly_loss;
            if weekly_breached && !state.weekly_limit_breached {
                events.push(RiskEvent::new(
                    RiskEventKind::WeeklyLossLimit,
                    RiskLevel::High,
                    format!(
                        "Weekly loss {:.1}% reached limit {:.1}%",
                        weekly * 100.0,
                        p.max_weekly_loss * 100.0
                    ),
                    now,
                    json!({ "weekly_pnl": state.weekly_pnl, "loss_fraction": weekly }),
                ));
            }
            state.weekly_limit_breached = weekly_breached;

            if state.drawdown >= p.max_drawdown && !state.halted {
                let message = format!(
                    "Max drawdown exceeded: {:.1}% >= {:.1}%",
                    state.drawdown * 100.0,
                    p.max_drawdown * 100.0
                );
                events.push(RiskEvent::new(
                    RiskEventKind::DrawdownLimit,
                    RiskLevel::Critical,
                    message.clone(),
                    now,
                    json!({
                        "equity": state.equity,
                        "peak_equity": state.peak_equity,
                        "drawdown": state.drawdown,
                    }),
                ));
                if p.circuit_breaker {
                    events.push(self.halt_locked(&mut state, message, now));
                }
            }
        }

        self.record_events(&events).await;
        events
    }

    /// Run the ordered checks, size the trade and decide.
    pub async fn assess_trade(&self, trade: &TradeParams) -> RiskAssessment {
        self.assess_trade_at(trade, Utc::now()).await
    }

    pub async fn assess_trade_at(&self, trade: &TradeParams, now: DateTime<Utc>) -> RiskAssessment {
        self.resume_if_due(now).await;
        let state = self.state.read().await.clone();
        let p = &self.params;

        let mut out = RiskAssessment {
            approved: false,
            level: RiskLevel::Low,
            reasons: Vec::new(),
            warnings: Vec::new(),
            position_size: 0.0,
            stop_loss: trade.stop_loss,
            take_profit: trade.take_profit,
            risk_amount: 0.0,
            reward_amount: 0.0,
            risk_reward: 0.0,
            assessed_at: now,
        };
        let reject = |mut out: RiskAssessment, level: RiskLevel, reason: String| {
            out.approved = false;
            out.level = level;
            out.reasons.push(reason);
            out
        };

        // 1. halted
        if state.halted {
            let reason = state.halt_reason.as_deref().unwrap_or("circuit breaker");
            return reject(out, RiskLevel::Critical, format!("Trading halted: {}", reason));
        }

        // 2. open positions
        if state.open_positions >= p.max_open_positions {
            return reject(
                out,
                RiskLevel::High,
                format!(
                    "Max open positions reached: {} >= {}",
                    state.open_positions, p.max_open_positions
                ),
            );
        }

        // 3. daily loss
        let daily = state.daily_loss_fraction();
        if daily >= p.max_daily_loss {
            return reject(
                out,
                RiskLevel::High,
                format!(
                    "Daily loss limit reached: {:.1}% >= {:.1}%",
                    daily * 100.0,
                    p.max_daily_loss * 100.0
                ),
            );
        }
        if daily >= p.max_daily_loss * p.warn_fraction {
            out.warnings.push(format!(
                "Daily loss {:.1}% approaching limit {:.1}%",
                daily * 100.0,
                p.max_daily_loss * 100.0
            ));
        }

        // 4. drawdown
        if state.drawdown >= p.max_drawdown {
            return reject(
                out,
                RiskLevel::Critical,
                format!(
                    "Max drawdown exceeded: {:.1}% >= {:.1}%",
                    state.drawdown * 100.0,
                    p.max_drawdown * 100.0
                ),
            );
        }
        if state.drawdown >= p.max_drawdown * p.warn_fraction {
            out.warnings.push(format!(
                "Drawdown {:.1}% approaching limit {:.1}%",
                state.drawdown * 100.0,
                p.max_drawdown * 100.0
            ));
        }

        // 5. loss streak
        if p.circuit_breaker && state.consecutive_losses >= p.max_consecutive_losses {
            return reject(
                out,
                RiskLevel::High,
                format!(
                    "Consecutive losses at limit: {} >= {}",
                    state.consecutive_losses, p.max_consecutive_losses
                ),
            );
        }

        // 6. sizing
        let size = self.sizer.size(
            state.equity,
            trade.entry_price,
            trade.stop_loss,
            trade.take_profit,
            trade.volatility,
            trade.strength,
        ) * trade.size_multiplier.max(0.0);

        // 7. risk:reward
        out.position_size = size;
        out.risk_amount = size * (trade.entry_price - trade.stop_loss).abs();
        out.reward_amount = size * (trade.take_profit - trade.entry_price).abs();
        out.risk_reward = if out.risk_amount > 0.0 {
            out.reward_amount / out.risk_amount
        } else {
            0.0
        };

        if size <= 0.0 {
            return reject(out, RiskLevel::Medium, "Position size is zero".to_string());
        }
        if out.risk_reward < p.min_risk_reward {
            let ratio = out.risk_reward;
            return reject(
                out,
                RiskLevel::Medium,
                format!(
                    "Risk:reward {:.2} below minimum {:.2}",
                    ratio, p.min_risk_reward
                ),
            );
        }

        // 8. schedule
        if let Some(reason) = self.schedule.as_ref().and_then(|s| s.check(now)) {
            return reject(out, RiskLevel::Medium, reason);
        }

        out.approved = true;
        out.level = if out.warnings.is_empty() {
            RiskLevel::Low
        } else {
            RiskLevel::Medium
        };
        out
    }

    /// Apply a realized result. A loss may halt trading.
    pub async fn record_trade(&self, outcome: &TradeOutcome) -> Vec<RiskEvent> {
        let p = &self.params;
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            state.daily_pnl += outcome.pnl;
            state.weekly_pnl += outcome.pnl;

            if outcome.is_win() {
                state.consecutive_losses = 0;
            } else if outcome.is_loss() {
                state.consecutive_losses += 1;
                if state.consecutive_losses >= p.max_consecutive_losses {
                    let message = format!(
                        "{} consecutive losses (limit {})",
                        state.consecutive_losses, p.max_consecutive_losses
                    );
                    events.push(RiskEvent::new(
                        RiskEventKind::ConsecutiveLosses,
                        RiskLevel::High,
                        message.clone(),
                        outcome.closed_at,
                        json!({ "symbol": outcome.symbol, "pnl": outcome.pnl }),
                    ));
                    if p.circuit_breaker && !state.halted {
                        events.push(self.halt_locked(&mut state, message, outcome.closed_at));
                    }
                }
            }
        }
        self.record_events(&events).await;
        events
    }

    /// Halt immediately, e.g. from an operator command.
    pub async fn halt(&self, reason: impl Into<String>) -> RiskEvent {
        let event = {
            let mut state = self.state.write().await;
            self.halt_locked(&mut state, reason.into(), Utc::now())
        };
        self.record_events(std::slice::from_ref(&event)).await;
        event
    }

    /// Manual reset: resume now and clear the loss streak.
    pub async fn reset_halt(&self) -> RiskEvent {
        let now = Utc::now();
        let event = {
            let mut state = self.state.write().await;
            let was = state.halt_reason.take();
            state.halted = false;
            state.halted_at = None;
            state.resume_at = None;
            state.consecutive_losses = 0;
            RiskEvent::new(
                RiskEventKind::Resumed,
                RiskLevel::Low,
                "Trading resumed by manual reset",
                now,
                json!({ "previous_reason": was }),
            )
        };
        info!("Trading halt reset manually");
        self.record_events(std::slice::from_ref(&event)).await;
        event
    }

    async fn resume_if_due(&self, now: DateTime<Utc>) {
        {
            let state = self.state.read().await;
            if !state.halted || state.resume_at.map_or(true, |t| now < t) {
                return;
            }
        }
        let event = {
            let mut state = self.state.write().await;
            self.resume_locked(&mut state, now)
        };
        if let Some(event) = event {
            self.record_events(&[event]).await;
        }
    }

    fn resume_locked(&self, state: &mut AccountState, now: DateTime<Utc>) -> Option<RiskEvent> {
        match state.resume_at {
            Some(resume_at) if state.halted && now >= resume_at => {
                let was = state.halt_reason.take();
                state.halted = false;
                state.halted_at = None;
                state.resume_at = None;
                info!(reason = ?was, "Trading halt expired, resuming");
                Some(RiskEvent::new(
                    RiskEventKind::Resumed,
                    RiskLevel::Low,
                    "Trading resumed after cooldown",
                    now,
                    json!({ "previous_reason": was }),
                ))
            }
            _ => None,
        }
    }

    fn halt_locked(&self, state: &mut AccountState, reason: String, now: DateTime<Utc>) -> RiskEvent {
        let resume_at = now + Duration::minutes(self.params.halt_cooldown_minutes);
        state.halted = true;
        state.halt_reason = Some(reason.clone());
        state.halted_at = Some(now);
        state.resume_at = Some(resume_at);
        warn!(reason = %reason, resume_at = %resume_at, "Trading halted");
        RiskEvent::new(
            RiskEventKind::Halted,
            RiskLevel::Critical,
            format!("Trading halted: {}", reason),
            now,
            json!({ "resume_at": resume_at }),
        )
    }

    async fn record_events(&self, events: &[RiskEvent]) {
        if events.is_empty() {
            return;
        }
        let cap = self.params.event_history.max(1);
        let mut history = self.events.write().await;
        for event in events {
            if history.len() == cap {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
    }
}
