//! Replay market data feed
//!
//! Serves a fixed list of closed bars. The first `warmup` bars count as
//! history. After that, a push subscription streams the remaining bars one
//! per `interval`, and without a subscription every `recent_bars` poll
//! releases the next bar.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use analysis_core::{Bar, EngineError, MarketDataFeed, Timeframe};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct ReplayFeed {
    symbol: String,
    bars: Arc<Vec<Bar>>,
    /// Number of bars released so far
    cursor: Arc<AtomicUsize>,
    interval: Duration,
    connected: Arc<AtomicBool>,
    stream: Mutex<Option<CancellationToken>>,
}

impl ReplayFeed {
    pub fn new(symbol: impl Into<String>, bars: Vec<Bar>, warmup: usize) -> Self {
        let warmup = warmup.min(bars.len());
        Self {
            symbol: symbol.into(),
            bars: Arc::new(bars),
            cursor: Arc::new(AtomicUsize::new(warmup)),
            interval: Duration::from_millis(10),
            connected: Arc::new(AtomicBool::new(false)),
            stream: Mutex::new(None),
        }
    }

    /// Delay between pushed bars
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Load bars from a JSON array of [`Bar`]s.
    pub fn from_json_file(
        symbol: impl Into<String>,
        path: impl AsRef<Path>,
        warmup: usize,
    ) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidData(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut bars: Vec<Bar> = serde_json::from_str(&raw).map_err(|e| {
            EngineError::InvalidData(format!("cannot parse {}: {}", path.display(), e))
        })?;
        bars.sort_by_key(|b| b.close_time);
        info!(path = %path.display(), bars = bars.len(), "Loaded replay bars");
        Ok(Self::new(symbol, bars, warmup))
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Bars released so far
    pub fn released(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    fn check_symbol(&self, symbol: &str) -> Result<(), EngineError> {
        if symbol.eq_ignore_ascii_case(&self.symbol) {
            Ok(())
        } else {
            Err(EngineError::collaborator(
                "replay feed",
                format!("no data for {} (serving {})", symbol, self.symbol),
            ))
        }
    }
}

#[async_trait]
impl MarketDataFeed for ReplayFeed {
    fn name(&self) -> &str {
        "replay"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
    ) -> Result<mpsc::Receiver<Bar>, EngineError> {
        self.check_symbol(symbol)?;
        let token = CancellationToken::new();
        {
            let mut stream = self
                .stream
                .lock()
                .map_err(|_| EngineError::collaborator("replay feed", "stream lock poisoned"))?;
            if let Some(previous) = stream.replace(token.clone()) {
                previous.cancel();
            }
        }

        let (tx, rx) = mpsc::channel(64);
        let bars = Arc::clone(&self.bars);
        let cursor = Arc::clone(&self.cursor);
        let connected = Arc::clone(&self.connected);
        let interval = self.interval;
        connected.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            loop {
                let next = cursor.load(Ordering::SeqCst);
                let Some(bar) = bars.get(next).cloned() else {
                    debug!("Replay exhausted");
                    break;
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if tx.send(bar).await.is_err() {
                    break;
                }
                cursor.fetch_add(1, Ordering::SeqCst);
            }
            connected.store(false, Ordering::SeqCst);
        });

        Ok(rx)
    }

    async fn disconnect(&self) {
        if let Ok(mut stream) = self.stream.lock() {
            if let Some(token) = stream.take() {
                token.cancel();
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn recent_bars(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, EngineError> {
        self.check_symbol(symbol)?;
        let end = if self.is_connected() {
            self.cursor.load(Ordering::SeqCst)
        } else {
            let len = self.bars.len();
            match self
                .cursor
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| (c < len).then_some(c + 1))
            {
                Ok(previous) => previous + 1,
                Err(current) => current,
            }
        };
        let start = end.saturating_sub(limit);
        Ok(self.bars[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn bars(n: usize) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let open_time = start + ChronoDuration::minutes(15 * i as i64);
                Bar {
                    open_time,
                    close_time: open_time + ChronoDuration::minutes(15),
                    open: 100.0 + i as f64,
                    high: 101.0 + i as f64,
                    low: 99.0 + i as f64,
                    close: 100.5 + i as f64,
                    volume: 1_000.0,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_poll_releases_one_bar_per_call() {
        let feed = ReplayFeed::new("ETHUSDT", bars(5), 2);
        let first = feed.recent_bars("ETHUSDT", Timeframe::Minute15, 10).await.unwrap();
        assert_eq!(first.len(), 3);
        let second = feed.recent_bars("ETHUSDT", Timeframe::Minute15, 2).await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].close, 103.5);

        feed.recent_bars("ETHUSDT", Timeframe::Minute15, 10).await.unwrap();
        let exhausted = feed.recent_bars("ETHUSDT", Timeframe::Minute15, 10).await.unwrap();
        assert_eq!(exhausted.len(), 5);
    }

    #[tokio::test]
    async fn test_push_streams_remaining_bars() {
        let feed = ReplayFeed::new("ETHUSDT", bars(6), 3).with_interval(Duration::from_millis(1));
        let mut rx = feed.subscribe("ETHUSDT", Timeframe::Minute15).await.unwrap();

        let mut closes = Vec::new();
        while let Some(bar) = rx.recv().await {
            closes.push(bar.close);
        }
        assert_eq!(closes, vec![103.5, 104.5, 105.5]);
        assert_eq!(feed.released(), 6);
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_a_collaborator_error() {
        let feed = ReplayFeed::new("ETHUSDT", bars(3), 3);
        let err = feed
            .recent_bars("BTCUSDT", Timeframe::Minute15, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Collaborator { .. }));
    }
}
