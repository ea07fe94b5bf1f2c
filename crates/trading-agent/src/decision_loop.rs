//! Per-bar decision pipeline and its background tasks
//!
//! One pass per newly closed bar: indicators, regime, exits, scoring, risk
//! assessment, execution. Passes are serialized through the pipeline mutex.
//! Account refresh and state broadcast run on their own intervals and stop
//! with the shared cancellation token.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use analysis_core::{
    Bar, EngineError, IndicatorEngine, IndicatorSnapshot, MarketDataFeed, MarketSnapshot,
    OpenPosition, Timeframe,
};
use broker_trait::{BrokerPosition, ExecutionEvent, Executor, OrderRequest, OrderSide};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use market_regime_detector::{MarketRegime, RegimeClassifier};
use risk_manager::{AccountUpdate, GateStatus, RiskGate, TradeOutcome, TradeParams};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use strategy_engine::SignalAggregator;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcaster::{Broadcaster, EventReceiver};
use crate::config::FeedMode;
use crate::error::AgentError;
use crate::events::{PositionChange, SignalRecord, TradingEvent};
use crate::metrics::AgentMetrics;
use crate::persistence::{Persistence, TradeRecord};
use crate::state::{LoopState, TradingState};

const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Await a collaborator call for at most `limit`. Errors and expiry both come
/// back as a message naming the call.
async fn bounded<T, E>(
    limit: Duration,
    what: &str,
    call: impl Future<Output = Result<T, E>>,
) -> Result<T, String>
where
    E: std::fmt::Display,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{}: {:#}", what, e)),
        Err(_) => Err(format!("{}: no response within {:?}", what, limit)),
    }
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub feed_mode: FeedMode,
    /// Passes are skipped until this many bars are buffered
    pub min_bars: usize,
    /// Bars kept for indicator computation
    pub bar_window: usize,
    pub risk_refresh_interval: Duration,
    pub state_broadcast_interval: Duration,
    pub poll_interval: Duration,
    /// Upper bound on any single executor or feed call
    pub collaborator_timeout: Duration,
    pub signal_history: usize,
    pub metrics_log_interval: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            symbol: "ETHUSDT".to_string(),
            timeframe: Timeframe::Minute15,
            feed_mode: FeedMode::Push,
            min_bars: 50,
            bar_window: 200,
            risk_refresh_interval: Duration::from_secs(30),
            state_broadcast_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(60),
            collaborator_timeout: Duration::from_secs(10),
            signal_history: 50,
            metrics_log_interval: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Bar not newer than the last one processed
    Duplicate,
    InsufficientData { have: usize, need: usize },
    Halted(String),
    CollaboratorFailure(String),
}

/// What a single pass did
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Skipped(SkipReason),
    NoTrade { regime: MarketRegime, reason: String },
    Rejected { reasons: Vec<String> },
    /// Approved while paused
    Suppressed,
    /// The executor refused the order
    ExecutionRefused(String),
    Executed { order_id: String, quantity: f64 },
}

#[derive(Default)]
struct Collaborators {
    feed: Option<Arc<dyn MarketDataFeed>>,
    indicators: Option<Arc<dyn IndicatorEngine>>,
    classifier: Option<RegimeClassifier>,
    aggregator: Option<SignalAggregator>,
    risk: Option<Arc<RiskGate>>,
    executor: Option<Arc<dyn Executor>>,
    execution_events: Option<mpsc::Receiver<ExecutionEvent>>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl Collaborators {
    fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.feed.is_none() {
            missing.push("market data feed");
        }
        if self.indicators.is_none() {
            missing.push("indicator engine");
        }
        if self.classifier.is_none() {
            missing.push("regime classifier");
        }
        if self.aggregator.is_none() {
            missing.push("signal aggregator");
        }
        if self.risk.is_none() {
            missing.push("risk gate");
        }
        if self.executor.is_none() {
            missing.push("executor");
        }
        missing
    }
}

pub struct DecisionLoopBuilder {
    config: LoopConfig,
    parts: Collaborators,
    broadcaster: Option<Arc<Broadcaster>>,
}

impl DecisionLoopBuilder {
    pub fn feed(mut self, feed: Arc<dyn MarketDataFeed>) -> Self {
        self.parts.feed = Some(feed);
        self
    }

    pub fn indicators(mut self, engine: Arc<dyn IndicatorEngine>) -> Self {
        self.parts.indicators = Some(engine);
        self
    }

    pub fn classifier(mut self, classifier: RegimeClassifier) -> Self {
        self.parts.classifier = Some(classifier);
        self
    }

    pub fn aggregator(mut self, aggregator: SignalAggregator) -> Self {
        self.parts.aggregator = Some(aggregator);
        self
    }

    pub fn risk_gate(mut self, risk: Arc<RiskGate>) -> Self {
        self.parts.risk = Some(risk);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.parts.executor = Some(executor);
        self
    }

    /// Queue on which the executor reports fills and closures
    pub fn execution_events(mut self, events: mpsc::Receiver<ExecutionEvent>) -> Self {
        self.parts.execution_events = Some(events);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.parts.persistence = Some(persistence);
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn build(self) -> DecisionLoop {
        let broadcaster = self
            .broadcaster
            .unwrap_or_else(|| Arc::new(Broadcaster::new(DEFAULT_QUEUE_CAPACITY)));
        let mut state = TradingState::new(self.config.symbol.clone(), self.config.timeframe);
        state.mode = self.config.feed_mode;
        DecisionLoop {
            shared: Arc::new(Shared {
                config: self.config,
                state: RwLock::new(state),
                signals: RwLock::new(VecDeque::new()),
                broadcaster,
                paused: AtomicBool::new(false),
            }),
            pending: Mutex::new(Some(self.parts)),
            engine: OnceLock::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// State visible to every task
struct Shared {
    config: LoopConfig,
    state: RwLock<TradingState>,
    /// Most recent first
    signals: RwLock<VecDeque<SignalRecord>>,
    broadcaster: Arc<Broadcaster>,
    paused: AtomicBool,
}

impl Shared {
    async fn lifecycle(&self) -> LoopState {
        self.state.read().await.lifecycle
    }

    async fn set_lifecycle(&self, lifecycle: LoopState) {
        let mut state = self.state.write().await;
        state.lifecycle = lifecycle;
        state.updated_at = Utc::now();
    }

    async fn push_signal(&self, record: SignalRecord) {
        {
            let mut history = self.signals.write().await;
            history.push_front(record.clone());
            history.truncate(self.config.signal_history.max(1));
        }
        let mut state = self.state.write().await;
        state.signals += 1;
        state.last_signal = Some(record);
    }

    async fn publish_state(&self) {
        let snapshot = self.state.read().await.clone();
        self.broadcaster.publish(TradingEvent::State(Box::new(snapshot)));
    }
}

/// Engine lifecycle driver. Build with [`DecisionLoop::builder`].
pub struct DecisionLoop {
    shared: Arc<Shared>,
    pending: Mutex<Option<Collaborators>>,
    engine: OnceLock<Arc<Engine>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DecisionLoop {
    pub fn builder(config: LoopConfig) -> DecisionLoopBuilder {
        DecisionLoopBuilder {
            config,
            parts: Collaborators::default(),
            broadcaster: None,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.shared.config
    }

    pub async fn lifecycle(&self) -> LoopState {
        self.shared.lifecycle().await
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> TradingState {
        self.shared.state.read().await.clone()
    }

    /// Signal history, most recent first
    pub async fn recent_signals(&self, limit: usize) -> Vec<SignalRecord> {
        self.shared
            .signals
            .read()
            .await
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.shared.broadcaster
    }

    pub fn subscribe(&self, id: impl Into<String>) -> EventReceiver {
        self.shared.broadcaster.subscribe(id)
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.shared.broadcaster.unsubscribe(id)
    }

    /// Metrics counters as JSON, once started
    pub async fn metrics(&self) -> Option<serde_json::Value> {
        match self.engine.get() {
            Some(engine) => Some(engine.pipeline.lock().await.metrics.to_json()),
            None => None,
        }
    }

    /// Restore persisted metrics counters. Only meaningful after start.
    pub async fn restore_metrics(&self, json: &serde_json::Value) {
        if let Some(engine) = self.engine.get() {
            engine.pipeline.lock().await.metrics.restore_from_json(json);
        }
    }

    /// Validate collaborators and launch the background tasks.
    pub async fn start(&self) -> Result<(), AgentError> {
        let current = self.lifecycle().await;
        if current != LoopState::Created {
            return Err(AgentError::InvalidTransition {
                action: "start",
                state: current,
            });
        }

        let parts = {
            let mut pending = self.pending.lock().await;
            let missing = pending.as_ref().map(|p| p.missing()).unwrap_or_default();
            if !missing.is_empty() {
                return Err(EngineError::Configuration(format!(
                    "missing collaborators: {}",
                    missing.join(", ")
                ))
                .into());
            }
            pending.take()
        };
        let engine = Arc::new(Engine::assemble(Arc::clone(&self.shared), parts)?);
        if self.engine.set(Arc::clone(&engine)).is_err() {
            return Err(AgentError::InvalidTransition {
                action: "start",
                state: current,
            });
        }

        let cfg = &self.shared.config;
        info!(
            symbol = %cfg.symbol,
            timeframe = %cfg.timeframe,
            mode = ?cfg.feed_mode,
            feed = engine.feed.name(),
            executor = engine.executor.name(),
            paper = engine.executor.is_paper(),
            "Starting decision loop"
        );
        if let Err(e) = bounded(cfg.collaborator_timeout, "executor sync", engine.executor.sync()).await {
            warn!("Executor sync failed at start: {}", e);
        }

        {
            let mut state = self.shared.state.write().await;
            state.lifecycle = LoopState::Running;
            state.started_at = Some(Utc::now());
            state.updated_at = Utc::now();
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(run_bar_worker(
            Arc::clone(&engine),
            self.cancel.child_token(),
        )));
        tasks.push(tokio::spawn(run_risk_refresh(
            Arc::clone(&engine),
            self.cancel.child_token(),
        )));
        tasks.push(tokio::spawn(run_state_broadcast(
            Arc::clone(&self.shared),
            self.cancel.child_token(),
        )));
        Ok(())
    }

    /// Keep monitoring, stop opening and closing positions.
    pub async fn pause(&self) -> Result<(), AgentError> {
        let current = self.lifecycle().await;
        if current != LoopState::Running {
            return Err(AgentError::InvalidTransition {
                action: "pause",
                state: current,
            });
        }
        self.shared.paused.store(true, Ordering::SeqCst);
        self.shared.set_lifecycle(LoopState::Paused).await;
        info!("Decision loop paused; execution suppressed");
        self.shared.publish_state().await;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), AgentError> {
        let current = self.lifecycle().await;
        if current != LoopState::Paused {
            return Err(AgentError::InvalidTransition {
                action: "resume",
                state: current,
            });
        }
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.set_lifecycle(LoopState::Running).await;
        info!("Decision loop resumed");
        self.shared.publish_state().await;
        Ok(())
    }

    /// Cancel background work, wait for it, flush the final state and close
    /// every subscriber. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<(), AgentError> {
        if self.lifecycle().await == LoopState::Stopped {
            return Ok(());
        }

        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Background task ended abnormally: {}", e);
            }
        }

        let limit = self.shared.config.collaborator_timeout;
        if let Some(engine) = self.engine.get() {
            let metrics = {
                let mut pipeline = engine.pipeline.lock().await;
                engine.drain_execution_events(&mut pipeline).await;
                pipeline.metrics.log_metrics();
                pipeline.metrics.to_json()
            };
            if tokio::time::timeout(limit, engine.feed.disconnect()).await.is_err() {
                warn!(feed = engine.feed.name(), "Feed disconnect timed out");
            }
            if let Some(persistence) = &engine.persistence {
                let json = metrics.to_string();
                if let Err(e) = bounded(limit, "save metrics", persistence.save_state("metrics", &json)).await {
                    warn!("Failed to persist metrics: {}", e);
                }
            }
        }

        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.set_lifecycle(LoopState::Stopped).await;

        if let Some(persistence) = self.engine.get().and_then(|e| e.persistence.as_ref()) {
            let snapshot = self.state().await;
            if let Err(e) = bounded(limit, "record snapshot", persistence.record_snapshot(&snapshot)).await {
                warn!("Failed to persist final snapshot: {}", e);
            }
        }

        self.shared.publish_state().await;
        self.shared.broadcaster.close_all();
        info!("Decision loop stopped");
        Ok(())
    }

    /// Run one pass for `bar` now. Normally bars arrive from the feed.
    pub async fn process_bar(&self, bar: Bar) -> Result<PassOutcome, AgentError> {
        let state = self.lifecycle().await;
        match self.engine.get() {
            Some(engine) if matches!(state, LoopState::Running | LoopState::Paused) => {
                Ok(engine.process(bar).await?)
            }
            _ => Err(AgentError::InvalidTransition {
                action: "process a bar on",
                state,
            }),
        }
    }

    /// Refresh account metrics from the executor now.
    pub async fn refresh_risk(&self) -> Result<(), AgentError> {
        let state = self.lifecycle().await;
        match self.engine.get() {
            Some(engine) if state != LoopState::Stopped => Ok(engine.refresh_risk().await?),
            _ => Err(AgentError::InvalidTransition {
                action: "refresh risk on",
                state,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine: collaborators wired and validated
// ---------------------------------------------------------------------------

struct Pipeline {
    classifier: RegimeClassifier,
    aggregator: SignalAggregator,
    bars: VecDeque<Bar>,
    last_bar_at: Option<DateTime<Utc>>,
    positions: HashMap<String, OpenPosition>,
    execution_events: Option<mpsc::Receiver<ExecutionEvent>>,
    metrics: AgentMetrics,
}

impl Pipeline {
    fn push_bar(&mut self, bar: Bar, window: usize) {
        self.last_bar_at = Some(bar.close_time);
        self.bars.push_back(bar);
        while self.bars.len() > window.max(1) {
            self.bars.pop_front();
        }
    }

    /// Replace the local position view with the executor's, keeping strategy
    /// attribution and entry bar time of positions opened here.
    fn sync_positions(&mut self, broker: &[BrokerPosition]) {
        let mut next = HashMap::with_capacity(broker.len());
        for bp in broker {
            let known = self.positions.get(&bp.symbol);
            next.insert(
                bp.symbol.clone(),
                OpenPosition {
                    symbol: bp.symbol.clone(),
                    direction: bp.direction,
                    entry_price: to_f64(bp.avg_entry_price),
                    quantity: to_f64(bp.qty),
                    stop_loss: bp.stop_loss.map(to_f64),
                    take_profit: bp.take_profit.map(to_f64),
                    opened_at: known.map_or(bp.opened_at, |p| p.opened_at),
                    strategy: known.and_then(|p| p.strategy),
                },
            );
        }
        self.positions = next;
    }

    fn position_list(&self) -> Vec<OpenPosition> {
        let mut list: Vec<OpenPosition> = self.positions.values().cloned().collect();
        list.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        list
    }
}

/// Start-of-day and start-of-week equity for loss tracking
#[derive(Default)]
struct PnlBaseline {
    day: Option<(NaiveDate, f64)>,
    week: Option<((i32, u32), f64)>,
}

impl PnlBaseline {
    fn pnl(&mut self, equity: f64, now: DateTime<Utc>) -> (f64, f64) {
        let today = now.date_naive();
        let iso = now.iso_week();
        let week = (iso.year(), iso.week());

        let day_start = match self.day {
            Some((d, e)) if d == today => e,
            _ => {
                self.day = Some((today, equity));
                equity
            }
        };
        let week_start = match self.week {
            Some((w, e)) if w == week => e,
            _ => {
                self.week = Some((week, equity));
                equity
            }
        };
        (equity - day_start, equity - week_start)
    }
}

struct Engine {
    shared: Arc<Shared>,
    feed: Arc<dyn MarketDataFeed>,
    indicators: Arc<dyn IndicatorEngine>,
    risk: Arc<RiskGate>,
    executor: Arc<dyn Executor>,
    persistence: Option<Arc<dyn Persistence>>,
    pipeline: Mutex<Pipeline>,
    baseline: Mutex<PnlBaseline>,
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

impl Engine {
    fn assemble(shared: Arc<Shared>, parts: Option<Collaborators>) -> Result<Self, EngineError> {
        let Some(Collaborators {
            feed: Some(feed),
            indicators: Some(indicators),
            classifier: Some(classifier),
            aggregator: Some(aggregator),
            risk: Some(risk),
            executor: Some(executor),
            execution_events,
            persistence,
        }) = parts
        else {
            return Err(EngineError::Configuration(
                "collaborators already consumed".to_string(),
            ));
        };

        if execution_events.is_none() {
            warn!("No execution event queue wired; closed trades will not reach the risk gate");
        }
        let metrics = AgentMetrics::new(shared.config.metrics_log_interval);
        Ok(Self {
            shared,
            feed,
            indicators,
            risk,
            executor,
            persistence,
            pipeline: Mutex::new(Pipeline {
                classifier,
                aggregator,
                bars: VecDeque::new(),
                last_bar_at: None,
                positions: HashMap::new(),
                execution_events,
                metrics,
            }),
            baseline: Mutex::new(PnlBaseline::default()),
        })
    }

    fn persist<F, Fut>(&self, what: &'static str, write: F)
    where
        F: FnOnce(Arc<dyn Persistence>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if let Some(persistence) = &self.persistence {
            let fut = write(Arc::clone(persistence));
            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    warn!(what, "Persistence write failed: {:#}", e);
                }
            });
        }
    }

    fn skip(&self, pipeline: &mut Pipeline, reason: SkipReason) -> PassOutcome {
        pipeline.metrics.skip_pass();
        if let SkipReason::CollaboratorFailure(message) = &reason {
            warn!(symbol = %self.shared.config.symbol, "Pass skipped: {}", message);
            self.shared
                .broadcaster
                .publish(TradingEvent::error(message.clone()));
        }
        PassOutcome::Skipped(reason)
    }

    async fn finish(&self, pipeline: &mut Pipeline, pass_start: std::time::Instant) {
        pipeline.metrics.finish_pass(pass_start);
        let positions = pipeline.position_list();
        let mut state = self.shared.state.write().await;
        state.passes = pipeline.metrics.passes_run;
        state.positions = positions;
        state.updated_at = Utc::now();
    }

    /// Seed the bar window without running passes.
    async fn seed(&self, bars: Vec<Bar>) {
        let window = self.shared.config.bar_window;
        let mut pipeline = self.pipeline.lock().await;
        let count = bars.len();
        for bar in bars {
            if pipeline.last_bar_at.is_some_and(|t| bar.close_time <= t) {
                continue;
            }
            pipeline.push_bar(bar, window);
        }
        debug!(count, buffered = pipeline.bars.len(), "Seeded bar history");
    }

    async fn warm_up(&self) {
        let cfg = &self.shared.config;
        let history = self.feed.recent_bars(&cfg.symbol, cfg.timeframe, cfg.bar_window);
        match bounded(cfg.collaborator_timeout, "feed recent_bars", history).await {
            Ok(bars) => self.seed(bars).await,
            Err(e) => warn!("History warm-up failed: {}", e),
        }
    }

    async fn poll_once(&self) {
        let cfg = &self.shared.config;
        let history = self.feed.recent_bars(&cfg.symbol, cfg.timeframe, cfg.bar_window);
        let mut bars = match bounded(cfg.collaborator_timeout, "feed recent_bars", history).await {
            Ok(bars) => bars,
            Err(e) => {
                warn!("Bar poll failed, retrying next interval: {}", e);
                return;
            }
        };

        let last_seen = self.pipeline.lock().await.last_bar_at;
        let fresh = match last_seen {
            Some(t) => bars.into_iter().filter(|b| b.close_time > t).collect(),
            None => {
                let Some(latest) = bars.pop() else {
                    return;
                };
                self.seed(bars).await;
                vec![latest]
            }
        };
        for bar in fresh {
            self.handle_bar(bar).await;
        }
    }

    async fn handle_bar(&self, bar: Bar) {
        match self.process(bar).await {
            Ok(outcome) => debug!(?outcome, "Pass complete"),
            Err(e) => {
                error!(symbol = %self.shared.config.symbol, "Pass failed: {}", e);
                self.shared
                    .broadcaster
                    .publish(TradingEvent::error(e.to_string()));
            }
        }
    }

    /// One decision pass for a newly closed bar.
    async fn process(&self, bar: Bar) -> Result<PassOutcome, EngineError> {
        let cfg = &self.shared.config;
        let broadcaster = &self.shared.broadcaster;
        let pass_start = AgentMetrics::start_timer();
        let mut guard = self.pipeline.lock().await;
        let pipeline = &mut *guard;

        if pipeline.last_bar_at.is_some_and(|t| bar.close_time <= t) {
            return Ok(PassOutcome::Skipped(SkipReason::Duplicate));
        }
        pipeline.push_bar(bar.clone(), cfg.bar_window);

        {
            let (symbol, timeframe, bar) = (cfg.symbol.clone(), cfg.timeframe, bar.clone());
            self.persist("bar", move |p| async move {
                p.record_bar(&symbol, timeframe, &bar).await
            });
        }
        broadcaster.publish(TradingEvent::Price {
            symbol: cfg.symbol.clone(),
            price: bar.close,
            timestamp: bar.close_time,
        });
        broadcaster.publish(TradingEvent::Candle {
            symbol: cfg.symbol.clone(),
            timeframe: cfg.timeframe,
            bar: bar.clone(),
        });
        {
            let mut state = self.shared.state.write().await;
            state.last_price = Some(bar.close);
            state.last_bar_at = Some(bar.close_time);
            state.candles += 1;
        }

        // executor-side stops and targets see every close
        if let Some(mark) = Decimal::from_f64(bar.close) {
            let marked = self.executor.mark_price(&cfg.symbol, mark);
            if let Err(reason) = bounded(cfg.collaborator_timeout, "executor mark_price", marked).await {
                return Ok(self.skip(pipeline, SkipReason::CollaboratorFailure(reason)));
            }
        }
        self.drain_execution_events(pipeline).await;

        let have = pipeline.bars.len();
        if have < cfg.min_bars {
            debug!(have, need = cfg.min_bars, "Not enough bars for a pass");
            return Ok(self.skip(
                pipeline,
                SkipReason::InsufficientData {
                    have,
                    need: cfg.min_bars,
                },
            ));
        }

        if let GateStatus::Halted { reason, .. } = self.risk.status().await {
            debug!(%reason, "Risk gate halted, pass skipped");
            {
                let mut state = self.shared.state.write().await;
                state.halted = true;
                state.halt_reason = Some(reason.clone());
            }
            return Ok(self.skip(pipeline, SkipReason::Halted(reason)));
        }

        // Fallible collaborator calls first so a failure leaves the
        // classifier untouched.
        let analysis_start = AgentMetrics::start_timer();
        let window: Vec<Bar> = pipeline.bars.iter().cloned().collect();
        let mut snapshot =
            MarketSnapshot::from_bars(&cfg.symbol, cfg.timeframe, &window, IndicatorSnapshot::default());
        snapshot.indicators = match self.indicators.compute(
            &snapshot.opens,
            &snapshot.highs,
            &snapshot.lows,
            &snapshot.closes,
            &snapshot.volumes,
        ) {
            Ok(indicators) => indicators,
            Err(e) => {
                let reason = format!("indicator engine: {}", e);
                return Ok(self.skip(pipeline, SkipReason::CollaboratorFailure(reason)));
            }
        };
        let positions = self.executor.get_positions();
        let broker_positions = match bounded(cfg.collaborator_timeout, "executor get_positions", positions).await {
            Ok(positions) => positions,
            Err(reason) => {
                return Ok(self.skip(pipeline, SkipReason::CollaboratorFailure(reason)));
            }
        };
        pipeline.sync_positions(&broker_positions);

        let regime = pipeline.classifier.detect(&snapshot);
        debug!(
            regime = regime.regime.name(),
            confidence = regime.confidence,
            consistency = regime.consistency,
            "Regime detected"
        );

        self.manage_exits(pipeline, &snapshot).await;

        let score = pipeline.aggregator.score(&snapshot, regime.regime);
        pipeline.metrics.signals_generated += score.total_signals() as u64;
        pipeline.metrics.record_analysis_duration(analysis_start);

        broadcaster.publish(TradingEvent::Indicators {
            symbol: cfg.symbol.clone(),
            indicators: snapshot.indicators.clone(),
            regime: Box::new(regime.clone()),
        });
        {
            let mut state = self.shared.state.write().await;
            state.regime = Some(regime.clone());
            state.indicators = Some(snapshot.indicators.clone());
            state.halted = false;
            state.halt_reason = None;
        }

        let best = match (&score.best_signal, score.should_trade) {
            (Some(best), true) => best.clone(),
            _ => {
                self.finish(pipeline, pass_start).await;
                return Ok(PassOutcome::NoTrade {
                    regime: regime.regime,
                    reason: score.reason.clone(),
                });
            }
        };
        pipeline.metrics.tradeable_scores += 1;

        if pipeline.positions.contains_key(&cfg.symbol) {
            debug!(symbol = %cfg.symbol, "Position already open, entry skipped");
            self.finish(pipeline, pass_start).await;
            return Ok(PassOutcome::NoTrade {
                regime: regime.regime,
                reason: format!("position already open on {}", cfg.symbol),
            });
        }

        let risk_start = AgentMetrics::start_timer();
        let params = TradeParams {
            symbol: cfg.symbol.clone(),
            direction: best.direction,
            entry_price: best.price,
            stop_loss: best.stop_loss,
            take_profit: best.take_profit,
            strength: best.strength,
            volatility: snapshot.indicators.atr_percent,
            size_multiplier: regime.regime.risk_multiplier(),
        };
        let assessment = self.risk.assess_trade(&params).await;
        pipeline.metrics.record_risk_duration(risk_start);

        let record = SignalRecord::new(
            &cfg.symbol,
            best.clone(),
            regime.regime,
            score.score,
            score.confidence,
            &assessment,
        );
        self.shared.push_signal(record.clone()).await;
        broadcaster.publish(TradingEvent::Signal(Box::new(record)));

        if !assessment.approved {
            pipeline.metrics.risk_rejected += 1;
            info!(
                symbol = %cfg.symbol,
                direction = %best.direction,
                strategy = %best.strategy,
                level = %assessment.level,
                reasons = ?assessment.reasons,
                "Trade rejected by risk gate"
            );
            self.finish(pipeline, pass_start).await;
            return Ok(PassOutcome::Rejected {
                reasons: assessment.reasons,
            });
        }
        pipeline.metrics.risk_approved += 1;

        if self.shared.paused.load(Ordering::SeqCst) {
            pipeline.metrics.trades_suppressed += 1;
            info!(symbol = %cfg.symbol, "Approved trade suppressed while paused");
            self.finish(pipeline, pass_start).await;
            return Ok(PassOutcome::Suppressed);
        }

        let execution_start = AgentMetrics::start_timer();
        let (Some(side), Some(qty), Some(price)) = (
            OrderSide::opening(best.direction),
            Decimal::from_f64(assessment.position_size).map(|q| q.round_dp(8)),
            Decimal::from_f64(best.price),
        ) else {
            return Err(EngineError::InvalidData(format!(
                "cannot express order {} x {} @ {}",
                best.direction, assessment.position_size, best.price
            )));
        };
        let stop = Decimal::from_f64(assessment.stop_loss);
        let target = Decimal::from_f64(assessment.take_profit);
        let request = OrderRequest::new(&cfg.symbol, side, qty, price).with_brackets(stop, target);

        let placed = self.executor.place_order(request);
        let report = match bounded(cfg.collaborator_timeout, "executor place_order", placed).await {
            Ok(report) => report,
            Err(reason) => {
                pipeline.metrics.trades_failed += 1;
                return Ok(self.skip(pipeline, SkipReason::CollaboratorFailure(reason)));
            }
        };
        if !report.success {
            pipeline.metrics.trades_failed += 1;
            let message = report.message.unwrap_or_else(|| "order refused".to_string());
            warn!(symbol = %cfg.symbol, "Order refused: {}", message);
            self.finish(pipeline, pass_start).await;
            return Ok(PassOutcome::ExecutionRefused(message));
        }

        if let Some(stop) = stop {
            let update = self.executor.update_stop_loss(&cfg.symbol, stop);
            if let Err(e) = bounded(cfg.collaborator_timeout, "executor update_stop_loss", update).await {
                warn!(symbol = %cfg.symbol, "Failed to set stop loss: {}", e);
            }
        }
        if let Some(target) = target {
            let update = self.executor.update_take_profit(&cfg.symbol, target);
            if let Err(e) = bounded(cfg.collaborator_timeout, "executor update_take_profit", update).await {
                warn!(symbol = %cfg.symbol, "Failed to set take profit: {}", e);
            }
        }
        pipeline.metrics.trades_executed += 1;
        pipeline.metrics.record_execution_duration(execution_start);

        let fill_price = report
            .trade
            .as_ref()
            .map_or(best.price, |fill| to_f64(fill.price));
        let position = OpenPosition {
            symbol: cfg.symbol.clone(),
            direction: best.direction,
            entry_price: fill_price,
            quantity: assessment.position_size,
            stop_loss: Some(assessment.stop_loss),
            take_profit: Some(assessment.take_profit),
            opened_at: snapshot.timestamp,
            strategy: Some(best.strategy),
        };
        pipeline.positions.insert(cfg.symbol.clone(), position.clone());

        info!(
            symbol = %cfg.symbol,
            direction = %best.direction,
            strategy = %best.strategy,
            quantity = assessment.position_size,
            price = fill_price,
            stop = assessment.stop_loss,
            target = assessment.take_profit,
            latency_ms = report.latency.as_millis() as u64,
            "Trade executed"
        );
        broadcaster.publish(TradingEvent::Trade {
            symbol: cfg.symbol.clone(),
            order_id: report.order.id.clone(),
            direction: best.direction,
            quantity: assessment.position_size,
            price: fill_price,
            stop_loss: assessment.stop_loss,
            take_profit: assessment.take_profit,
            timestamp: Utc::now(),
        });
        broadcaster.publish(TradingEvent::Position {
            symbol: cfg.symbol.clone(),
            change: PositionChange::Opened,
            position: Some(position.clone()),
            pnl: None,
            reason: None,
        });

        let trade = TradeRecord {
            order_id: report.order.id.clone(),
            symbol: cfg.symbol.clone(),
            direction: best.direction.to_string(),
            quantity: assessment.position_size,
            price: fill_price,
            stop_loss: Some(assessment.stop_loss),
            take_profit: Some(assessment.take_profit),
            strategy: Some(best.strategy.name().to_string()),
            executed_at: Utc::now(),
        };
        self.persist("trade", move |p| async move {
            p.record_trade(&trade).await?;
            p.record_position(&position).await
        });

        self.drain_execution_events(pipeline).await;
        self.finish(pipeline, pass_start).await;
        Ok(PassOutcome::Executed {
            order_id: report.order.id,
            quantity: assessment.position_size,
        })
    }

    /// Ask each position's strategy whether to exit; close through the
    /// executor unless paused.
    async fn manage_exits(&self, pipeline: &mut Pipeline, snapshot: &MarketSnapshot) {
        let open = pipeline.position_list();
        for position in open {
            let Some((kind, reason)) = pipeline
                .aggregator
                .strategies()
                .should_exit(snapshot, &position)
            else {
                continue;
            };
            pipeline.metrics.exits_requested += 1;
            if self.shared.paused.load(Ordering::SeqCst) {
                info!(symbol = %position.symbol, strategy = %kind, %reason, "Exit suppressed while paused");
                continue;
            }
            info!(symbol = %position.symbol, strategy = %kind, %reason, "Closing position");
            let close = self.executor.close_position(&position.symbol, &reason);
            match bounded(self.shared.config.collaborator_timeout, "executor close_position", close).await {
                Ok(Some(_)) => {}
                Ok(None) => debug!(symbol = %position.symbol, "Already flat"),
                Err(e) => warn!(symbol = %position.symbol, "Close failed, retrying next pass: {}", e),
            }
        }
        self.drain_execution_events(pipeline).await;
    }

    /// Apply queued executor events on the pass's own turn.
    async fn drain_execution_events(&self, pipeline: &mut Pipeline) {
        let Some(rx) = pipeline.execution_events.as_mut() else {
            return;
        };
        let mut closed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ExecutionEvent::OrderFilled(fill) => {
                    debug!(symbol = %fill.symbol, order = %fill.order_id, qty = %fill.qty, price = %fill.price, "Fill reported");
                }
                closure @ ExecutionEvent::PositionClosed { .. } => closed.push(closure),
            }
        }
        for event in closed {
            self.on_position_closed(pipeline, event).await;
        }
    }

    async fn on_position_closed(&self, pipeline: &mut Pipeline, event: ExecutionEvent) {
        let ExecutionEvent::PositionClosed {
            symbol,
            exit_price,
            pnl,
            reason,
            closed_at,
            ..
        } = event
        else {
            return;
        };
        let pnl = to_f64(pnl);
        let exit_price = to_f64(exit_price);
        let position = pipeline.positions.remove(&symbol);
        pipeline.metrics.record_trade_result(pnl);
        info!(%symbol, pnl, exit_price, %reason, "Position closed");

        let risk_events = self
            .risk
            .record_trade(&TradeOutcome {
                symbol: symbol.clone(),
                pnl,
                closed_at,
            })
            .await;
        for event in risk_events {
            warn!(kind = ?event.kind, level = %event.level, "{}", event.message);
            self.shared.broadcaster.publish(TradingEvent::Risk(event));
        }

        self.shared.broadcaster.publish(TradingEvent::Position {
            symbol: symbol.clone(),
            change: PositionChange::Closed,
            position,
            pnl: Some(pnl),
            reason: Some(reason.clone()),
        });
        self.shared.state.write().await.positions = pipeline.position_list();

        self.persist("position close", move |p| async move {
            p.close_position(&symbol, exit_price, pnl, &reason, closed_at).await
        });
    }

    /// Pull equity and positions from the executor into the risk gate.
    async fn refresh_risk(&self) -> Result<(), EngineError> {
        let limit = self.shared.config.collaborator_timeout;
        let balance = bounded(limit, "get_equity", self.executor.get_equity())
            .await
            .map_err(|e| EngineError::collaborator("executor", e))?;
        let positions = bounded(limit, "get_positions", self.executor.get_positions())
            .await
            .map_err(|e| EngineError::collaborator("executor", e))?;

        let now = Utc::now();
        let equity = to_f64(balance.equity);
        let (daily_pnl, weekly_pnl) = self.baseline.lock().await.pnl(equity, now);
        let update = AccountUpdate {
            equity,
            available: to_f64(balance.available),
            unrealized_pnl: to_f64(balance.unrealized_pl),
            daily_pnl,
            weekly_pnl,
            open_positions: positions.len() as u32,
        };

        let events = self.risk.update_account_state(update).await;
        for event in events {
            warn!(kind = ?event.kind, level = %event.level, "{}", event.message);
            self.shared.broadcaster.publish(TradingEvent::Risk(event));
        }

        let status = self.risk.status().await;
        let account = self.risk.account_state().await;
        let mut state = self.shared.state.write().await;
        state.account = Some(account);
        match status {
            GateStatus::Halted { reason, .. } => {
                state.halted = true;
                state.halt_reason = Some(reason);
            }
            GateStatus::Active => {
                state.halted = false;
                state.halt_reason = None;
            }
        }
        state.updated_at = now;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn run_bar_worker(engine: Arc<Engine>, cancel: CancellationToken) {
    let cfg = &engine.shared.config;

    if cfg.feed_mode == FeedMode::Push {
        let subscription = async {
            engine.warm_up().await;
            let subscribe = engine.feed.subscribe(&cfg.symbol, cfg.timeframe);
            bounded(cfg.collaborator_timeout, "feed subscribe", subscribe).await
        };
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => return,
            subscribed = subscription => subscribed,
        };
        match subscribed {
            Ok(mut bars) => {
                info!(feed = engine.feed.name(), "Subscribed to closed bars");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        bar = bars.recv() => match bar {
                            Some(bar) => tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = engine.handle_bar(bar) => {}
                            },
                            None => {
                                warn!("Bar stream ended, falling back to polling");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("Push subscription failed, polling instead: {}", e),
        }
    }

    let mut ticker = tokio::time::interval(cfg.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => tokio::select! {
                _ = cancel.cancelled() => return,
                _ = engine.poll_once() => {}
            },
        }
    }
}

async fn run_risk_refresh(engine: Arc<Engine>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(engine.shared.config.risk_refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => tokio::select! {
                _ = cancel.cancelled() => break,
                refreshed = engine.refresh_risk() => {
                    if let Err(e) = refreshed {
                        warn!("Risk refresh failed, retrying next interval: {}", e);
                    }
                }
            },
        }
    }
    debug!("Risk refresh task stopped");
}

async fn run_state_broadcast(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.state_broadcast_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => shared.publish_state().await,
        }
    }
    debug!("State broadcast task stopped");
}
