use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Bar, EngineError, IndicatorSnapshot, Timeframe};

/// Source of closed bars, either pushed over a subscription or pulled on demand.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a push subscription is currently possible
    fn is_connected(&self) -> bool;

    /// Subscribe to closed bars for `symbol`/`timeframe`.
    async fn subscribe(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<mpsc::Receiver<Bar>, EngineError>;

    /// Drop any active subscription.
    async fn disconnect(&self);

    /// Most recent `limit` closed bars, oldest first (polling fallback and warm-up).
    async fn recent_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, EngineError>;
}

/// Pure indicator computation over parallel OHLCV sequences.
pub trait IndicatorEngine: Send + Sync {
    fn compute(
        &self,
        opens: &[f64],
        highs: &[f64],
        lows: &[f64],
        closes: &[f64],
        volumes: &[f64],
    ) -> Result<IndicatorSnapshot, EngineError>;

    /// Bars required before `compute` yields meaningful values
    fn warmup_bars(&self) -> usize;
}
