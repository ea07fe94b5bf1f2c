use std::collections::VecDeque;
use std::time::Instant;

const RECENT_TRADES: usize = 20;

/// Pass counters, timings and a rolling trade window for the decision loop.
pub struct AgentMetrics {
    pub passes_run: u64,
    pub passes_skipped: u64,
    pub signals_generated: u64,
    pub tradeable_scores: u64,
    pub risk_approved: u64,
    pub risk_rejected: u64,
    pub trades_executed: u64,
    pub trades_failed: u64,
    pub trades_suppressed: u64,
    pub exits_requested: u64,
    pub total_pnl: f64,
    pub winning_trades: u64,
    pub losing_trades: u64,

    // Timing of the last pass
    pub last_analysis_duration_ms: u64,
    pub last_risk_duration_ms: u64,
    pub last_execution_duration_ms: u64,
    pub last_total_duration_ms: u64,

    recent_trades: VecDeque<f64>,
    log_interval_passes: u64,
}

impl AgentMetrics {
    pub fn new(log_interval_passes: u64) -> Self {
        Self {
            passes_run: 0,
            passes_skipped: 0,
            signals_generated: 0,
            tradeable_scores: 0,
            risk_approved: 0,
            risk_rejected: 0,
            trades_executed: 0,
            trades_failed: 0,
            trades_suppressed: 0,
            exits_requested: 0,
            total_pnl: 0.0,
            winning_trades: 0,
            losing_trades: 0,
            last_analysis_duration_ms: 0,
            last_risk_duration_ms: 0,
            last_execution_duration_ms: 0,
            last_total_duration_ms: 0,
            recent_trades: VecDeque::with_capacity(RECENT_TRADES),
            log_interval_passes,
        }
    }

    pub fn start_timer() -> Instant {
        Instant::now()
    }

    pub fn record_analysis_duration(&mut self, start: Instant) {
        self.last_analysis_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_risk_duration(&mut self, start: Instant) {
        self.last_risk_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_execution_duration(&mut self, start: Instant) {
        self.last_execution_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_trade_result(&mut self, pnl: f64) {
        self.total_pnl += pnl;
        if pnl > 0.0 {
            self.winning_trades += 1;
        } else {
            self.losing_trades += 1;
        }

        self.recent_trades.push_back(pnl);
        if self.recent_trades.len() > RECENT_TRADES {
            self.recent_trades.pop_front();
        }
    }

    pub fn skip_pass(&mut self) {
        self.passes_skipped += 1;
    }

    pub fn finish_pass(&mut self, pass_start: Instant) {
        self.last_total_duration_ms = pass_start.elapsed().as_millis() as u64;
        self.passes_run += 1;

        if self.log_interval_passes > 0 && self.passes_run % self.log_interval_passes == 0 {
            self.log_metrics();
        }
    }

    /// Rolling win rate over the last 20 trades (0-100%)
    pub fn recent_win_rate(&self) -> f64 {
        if self.recent_trades.is_empty() {
            return 0.0;
        }
        let wins = self.recent_trades.iter().filter(|pnl| **pnl > 0.0).count() as f64;
        (wins / self.recent_trades.len() as f64) * 100.0
    }

    pub fn recent_avg_pnl(&self) -> f64 {
        if self.recent_trades.is_empty() {
            return 0.0;
        }
        self.recent_trades.iter().sum::<f64>() / self.recent_trades.len() as f64
    }

    /// Overall win rate (0-100%)
    pub fn overall_win_rate(&self) -> f64 {
        let total = self.winning_trades + self.losing_trades;
        if total == 0 {
            return 0.0;
        }
        (self.winning_trades as f64 / total as f64) * 100.0
    }

    pub fn log_metrics(&self) {
        tracing::info!(
            passes = self.passes_run,
            passes_skipped = self.passes_skipped,
            signals_generated = self.signals_generated,
            tradeable_scores = self.tradeable_scores,
            risk_approved = self.risk_approved,
            risk_rejected = self.risk_rejected,
            trades_executed = self.trades_executed,
            trades_failed = self.trades_failed,
            trades_suppressed = self.trades_suppressed,
            exits_requested = self.exits_requested,
            total_pnl = format!("{:.2}", self.total_pnl),
            overall_win_rate = format!("{:.1}%", self.overall_win_rate()),
            recent_win_rate = format!("{:.1}%", self.recent_win_rate()),
            recent_avg_pnl = format!("{:.2}", self.recent_avg_pnl()),
            last_pass_ms = self.last_total_duration_ms,
            last_analysis_ms = self.last_analysis_duration_ms,
            last_risk_ms = self.last_risk_duration_ms,
            last_execution_ms = self.last_execution_duration_ms,
            "Agent metrics summary"
        );
    }

    /// Counters as JSON for state persistence
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "passes_run": self.passes_run,
            "passes_skipped": self.passes_skipped,
            "signals_generated": self.signals_generated,
            "tradeable_scores": self.tradeable_scores,
            "risk_approved": self.risk_approved,
            "risk_rejected": self.risk_rejected,
            "trades_executed": self.trades_executed,
            "trades_failed": self.trades_failed,
            "trades_suppressed": self.trades_suppressed,
            "exits_requested": self.exits_requested,
            "total_pnl": self.total_pnl,
            "winning_trades": self.winning_trades,
            "losing_trades": self.losing_trades,
        })
    }

    /// Restore counters from persisted JSON
    pub fn restore_from_json(&mut self, json: &serde_json::Value) {
        let counters: [(&str, &mut u64); 12] = [
            ("passes_run", &mut self.passes_run),
            ("passes_skipped", &mut self.passes_skipped),
            ("signals_generated", &mut self.signals_generated),
            ("tradeable_scores", &mut self.tradeable_scores),
            ("risk_approved", &mut self.risk_approved),
            ("risk_rejected", &mut self.risk_rejected),
            ("trades_executed", &mut self.trades_executed),
            ("trades_failed", &mut self.trades_failed),
            ("trades_suppressed", &mut self.trades_suppressed),
            ("exits_requested", &mut self.exits_requested),
            ("winning_trades", &mut self.winning_trades),
            ("losing_trades", &mut self.losing_trades),
        ];
        for (key, slot) in counters {
            if let Some(v) = json.get(key).and_then(|v| v.as_u64()) {
                *slot = v;
            }
        }
        if let Some(v) = json.get("total_pnl").and_then(|v| v.as_f64()) {
            self.total_pnl = v;
        }
        tracing::info!(
            "Restored metrics from persisted state (passes={})",
            self.passes_run
        );
    }
}
