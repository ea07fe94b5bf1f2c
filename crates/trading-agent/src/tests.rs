#[cfg(test)]
mod decision_loop_tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use analysis_core::{
        Bar, Direction, EngineError, IndicatorEngine, IndicatorSnapshot, MarketSnapshot,
        OpenPosition, Signal, SignalType, StrategyKind,
    };
    use async_trait::async_trait;
    use broker_trait::{
        AccountBalance, BrokerPosition, ExecutionReport, Executor, OrderRequest, PaperExecutor,
    };
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use market_regime_detector::RegimeClassifier;
    use risk_manager::{PositionSizer, RiskGate, RiskParameters};
    use rust_decimal::Decimal;
    use strategy_engine::{
        AggregatorConfig, RegimeWeights, SignalAggregator, Strategy, StrategyConfig, StrategySet,
    };

    use crate::*;

    /// Emits one signal per bar at the close, with levels a fixed distance away.
    struct ScriptedStrategy {
        direction: Direction,
        reward_risk: f64,
        exit_above: Option<f64>,
        enabled: bool,
    }

    impl ScriptedStrategy {
        fn long(reward_risk: f64) -> Self {
            Self {
                direction: Direction::Long,
                reward_risk,
                exit_above: None,
                enabled: true,
            }
        }
    }

    impl Strategy for ScriptedStrategy {
        fn kind(&self) -> StrategyKind {
            StrategyKind::TrendFollowing
        }

        fn analyze(&self, snapshot: &MarketSnapshot) -> Vec<Signal> {
            let price = snapshot.current_price;
            if self.exit_above.is_some_and(|level| price >= level) {
                return Vec::new();
            }
            vec![Signal {
                signal_type: SignalType::Entry,
                direction: self.direction,
                strength: 1.0,
                price,
                stop_loss: self.stop_loss(snapshot, self.direction, price),
                take_profit: self.take_profit(snapshot, self.direction, price),
                confidence: 1.0,
                reason: "scripted".to_string(),
                strategy: self.kind(),
                timestamp: snapshot.timestamp,
            }]
        }

        fn should_exit(&self, snapshot: &MarketSnapshot, _position: &OpenPosition) -> Option<String> {
            self.exit_above
                .filter(|level| snapshot.current_price >= *level)
                .map(|_| "scripted exit".to_string())
        }

        fn stop_loss(&self, _snapshot: &MarketSnapshot, direction: Direction, entry: f64) -> f64 {
            entry - direction.sign() * entry * 0.02
        }

        fn take_profit(&self, _snapshot: &MarketSnapshot, direction: Direction, entry: f64) -> f64 {
            entry + direction.sign() * entry * 0.02 * self.reward_risk
        }

        fn min_data_points(&self) -> usize {
            1
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn set_enabled(&mut self, enabled: bool) {
            self.enabled = enabled;
        }

        fn config(&self) -> StrategyConfig {
            StrategyConfig::default_for(StrategyKind::TrendFollowing)
        }
    }

    struct FlatIndicators;

    impl IndicatorEngine for FlatIndicators {
        fn compute(
            &self,
            _opens: &[f64],
            _highs: &[f64],
            _lows: &[f64],
            closes: &[f64],
            _volumes: &[f64],
        ) -> Result<IndicatorSnapshot, EngineError> {
            let last = closes.last().copied().unwrap_or_default();
            Ok(IndicatorSnapshot {
                atr_percent: 1.0,
                ema_fast: last,
                ema_slow: last,
                ..IndicatorSnapshot::default()
            })
        }

        fn warmup_bars(&self) -> usize {
            1
        }
    }

    struct BrokenIndicators;

    impl IndicatorEngine for BrokenIndicators {
        fn compute(
            &self,
            _opens: &[f64],
            _highs: &[f64],
            _lows: &[f64],
            _closes: &[f64],
            _volumes: &[f64],
        ) -> Result<IndicatorSnapshot, EngineError> {
            Err(EngineError::collaborator("indicators", "backend offline"))
        }

        fn warmup_bars(&self) -> usize {
            1
        }
    }

    /// Paper executor whose account calls can be made to hang
    struct StallingExecutor {
        inner: PaperExecutor,
        stalled: AtomicBool,
        hung_calls: AtomicUsize,
    }

    impl StallingExecutor {
        async fn gate(&self) {
            if self.stalled.load(Ordering::SeqCst) {
                self.hung_calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
            }
        }
    }

    #[async_trait]
    impl Executor for StallingExecutor {
        async fn place_order(&self, order: OrderRequest) -> anyhow::Result<ExecutionReport> {
            self.gate().await;
            self.inner.place_order(order).await
        }

        async fn cancel_order(&self, order_id: &str) -> anyhow::Result<()> {
            self.inner.cancel_order(order_id).await
        }

        async fn get_positions(&self) -> anyhow::Result<Vec<BrokerPosition>> {
            self.gate().await;
            self.inner.get_positions().await
        }

        async fn get_equity(&self) -> anyhow::Result<AccountBalance> {
            self.gate().await;
            self.inner.get_equity().await
        }

        async fn update_stop_loss(&self, symbol: &str, stop_loss: Decimal) -> anyhow::Result<()> {
            self.inner.update_stop_loss(symbol, stop_loss).await
        }

        async fn update_take_profit(&self, symbol: &str, take_profit: Decimal) -> anyhow::Result<()> {
            self.inner.update_take_profit(symbol, take_profit).await
        }

        async fn close_position(
            &self,
            symbol: &str,
            reason: &str,
        ) -> anyhow::Result<Option<ExecutionReport>> {
            self.inner.close_position(symbol, reason).await
        }

        async fn sync(&self) -> anyhow::Result<()> {
            self.inner.sync().await
        }

        async fn mark_price(&self, symbol: &str, price: Decimal) -> anyhow::Result<()> {
            self.gate().await;
            self.inner.mark_price(symbol, price).await
        }

        fn is_paper(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "stalling-paper"
        }
    }

    fn stalling_loop(config: LoopConfig, bars: Vec<Bar>) -> (DecisionLoop, Arc<StallingExecutor>) {
        let (inner, events) = PaperExecutor::new(Decimal::from(10_000), 64);
        let executor = Arc::new(StallingExecutor {
            inner,
            stalled: AtomicBool::new(true),
            hung_calls: AtomicUsize::new(0),
        });
        let mut set = StrategySet::new();
        set.insert(Box::new(ScriptedStrategy::long(3.0)));
        let engine = DecisionLoop::builder(config)
            .feed(Arc::new(ReplayFeed::new("ETHUSDT", bars, 0)))
            .indicators(Arc::new(FlatIndicators))
            .classifier(RegimeClassifier::new().with_min_bars(1))
            .aggregator(SignalAggregator::new(
                set,
                RegimeWeights::default(),
                AggregatorConfig::default(),
            ))
            .risk_gate(Arc::new(RiskGate::new(
                RiskParameters::default(),
                PositionSizer::default(),
                10_000.0,
            )))
            .executor(executor.clone())
            .execution_events(events)
            .build();
        (engine, executor)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
    }

    fn bar(i: usize, close: f64) -> Bar {
        let open_time = t0() + ChronoDuration::minutes(15 * i as i64);
        Bar {
            open_time,
            close_time: open_time + ChronoDuration::minutes(15),
            open: close - 0.1,
            high: close + 0.2,
            low: close - 0.3,
            close,
            volume: 1_000.0,
        }
    }

    fn loop_config(min_bars: usize) -> LoopConfig {
        LoopConfig {
            symbol: "ETHUSDT".to_string(),
            feed_mode: FeedMode::Poll,
            min_bars,
            bar_window: 50,
            risk_refresh_interval: Duration::from_secs(3600),
            state_broadcast_interval: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(3600),
            ..LoopConfig::default()
        }
    }

    struct Harness {
        engine: DecisionLoop,
        executor: Arc<PaperExecutor>,
        risk: Arc<RiskGate>,
    }

    fn harness(min_bars: usize, strategy: ScriptedStrategy) -> Harness {
        harness_with(min_bars, strategy, Arc::new(FlatIndicators), None)
    }

    fn harness_with(
        min_bars: usize,
        strategy: ScriptedStrategy,
        indicators: Arc<dyn IndicatorEngine>,
        persistence: Option<Arc<dyn Persistence>>,
    ) -> Harness {
        let (executor, events) = PaperExecutor::new(Decimal::from(10_000), 64);
        let executor = Arc::new(executor);
        let risk = Arc::new(RiskGate::new(
            RiskParameters::default(),
            PositionSizer::default(),
            10_000.0,
        ));
        let mut set = StrategySet::new();
        set.insert(Box::new(strategy));

        let mut builder = DecisionLoop::builder(loop_config(min_bars))
            .feed(Arc::new(ReplayFeed::new("ETHUSDT", Vec::new(), 0)))
            .indicators(indicators)
            .classifier(RegimeClassifier::new().with_min_bars(1))
            .aggregator(SignalAggregator::new(
                set,
                RegimeWeights::default(),
                AggregatorConfig::default(),
            ))
            .risk_gate(Arc::clone(&risk))
            .executor(executor.clone())
            .execution_events(events);
        if let Some(persistence) = persistence {
            builder = builder.persistence(persistence);
        }
        Harness {
            engine: builder.build(),
            executor,
            risk,
        }
    }

    fn drain(rx: &mut EventReceiver) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        kinds
    }

    #[tokio::test]
    async fn test_start_requires_every_collaborator() {
        let engine = DecisionLoop::builder(loop_config(5))
            .feed(Arc::new(ReplayFeed::new("ETHUSDT", Vec::new(), 0)))
            .indicators(Arc::new(FlatIndicators))
            .build();

        let err = engine.start().await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("executor"));
        assert_eq!(engine.lifecycle().await, LoopState::Created);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let h = harness(5, ScriptedStrategy::long(3.0));
        let engine = &h.engine;

        assert!(matches!(
            engine.pause().await,
            Err(AgentError::InvalidTransition { action: "pause", .. })
        ));
        assert!(engine.process_bar(bar(0, 100.0)).await.is_err());

        engine.start().await.unwrap();
        assert_eq!(engine.lifecycle().await, LoopState::Running);
        assert!(engine.start().await.is_err());

        engine.pause().await.unwrap();
        assert_eq!(engine.lifecycle().await, LoopState::Paused);
        assert!(engine.is_paused());
        engine.resume().await.unwrap();
        assert_eq!(engine.lifecycle().await, LoopState::Running);

        let mut rx = engine.subscribe("observer");
        tokio::time::timeout(Duration::from_secs(2), engine.stop())
            .await
            .expect("stop should join background tasks promptly")
            .unwrap();
        assert_eq!(engine.lifecycle().await, LoopState::Stopped);
        assert!(engine.process_bar(bar(1, 100.0)).await.is_err());
        engine.stop().await.unwrap();

        // final state, then the queue closes
        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        match last.as_deref() {
            Some(TradingEvent::State(state)) => assert_eq!(state.lifecycle, LoopState::Stopped),
            other => panic!("expected final state event, got {:?}", other.map(|e| e.kind())),
        }
        assert_eq!(engine.broadcaster().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_pass_executes_approved_trade() {
        let h = harness(5, ScriptedStrategy::long(3.0));
        let engine = &h.engine;
        let mut rx = engine.subscribe("ui");
        engine.start().await.unwrap();

        for i in 0..4 {
            let outcome = engine.process_bar(bar(i, 100.0 + i as f64 * 0.1)).await.unwrap();
            assert_eq!(
                outcome,
                PassOutcome::Skipped(SkipReason::InsufficientData { have: i + 1, need: 5 })
            );
        }

        let outcome = engine.process_bar(bar(4, 100.4)).await.unwrap();
        let PassOutcome::Executed { quantity, .. } = outcome else {
            panic!("expected execution, got {:?}", outcome);
        };
        assert!(quantity > 0.0);

        // stop and target reached the executor
        let positions = h.executor.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].direction, Direction::Long);
        assert!(positions[0].stop_loss.is_some());
        assert!(positions[0].take_profit.is_some());

        let state = engine.state().await;
        assert_eq!(state.positions.len(), 1);
        assert_eq!(state.positions[0].strategy, Some(StrategyKind::TrendFollowing));
        assert_eq!(state.last_price, Some(100.4));
        assert_eq!(state.candles, 5);
        assert!(state.regime.is_some());

        let signals = engine.recent_signals(10).await;
        assert_eq!(signals.len(), 1);
        assert!(signals[0].approved);
        assert!((signals[0].risk_reward - 3.0).abs() < 1e-6);

        let kinds = drain(&mut rx);
        for expected in ["price", "candle", "indicators", "signal", "trade", "position"] {
            assert!(kinds.contains(&expected), "missing {} in {:?}", expected, kinds);
        }

        // duplicates are ignored, and no pyramiding onto the open position
        assert_eq!(
            engine.process_bar(bar(4, 100.4)).await.unwrap(),
            PassOutcome::Skipped(SkipReason::Duplicate)
        );
        match engine.process_bar(bar(5, 100.5)).await.unwrap() {
            PassOutcome::NoTrade { reason, .. } => assert!(reason.contains("position already open")),
            other => panic!("expected no trade, got {:?}", other),
        }

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_take_profit_closes_and_feeds_risk() {
        let h = harness(1, ScriptedStrategy::long(3.0));
        let engine = &h.engine;
        engine.start().await.unwrap();

        assert!(matches!(
            engine.process_bar(bar(0, 100.0)).await.unwrap(),
            PassOutcome::Executed { .. }
        ));

        // target is 106; the next close clears it, then a fresh entry follows
        let outcome = engine.process_bar(bar(1, 110.0)).await.unwrap();
        assert!(matches!(outcome, PassOutcome::Executed { .. }), "{:?}", outcome);

        let metrics = engine.metrics().await.unwrap();
        assert_eq!(metrics["winning_trades"], 1);
        assert_eq!(metrics["trades_executed"], 2);
        assert_eq!(h.risk.account_state().await.consecutive_losses, 0);

        let balance = h.executor.get_equity().await.unwrap();
        assert!(balance.realized_pl > Decimal::ZERO);

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_strategy_exit_closes_position() {
        let strategy = ScriptedStrategy {
            exit_above: Some(103.0),
            ..ScriptedStrategy::long(3.0)
        };
        let h = harness(1, strategy);
        let engine = &h.engine;
        let mut rx = engine.subscribe("ui");
        engine.start().await.unwrap();

        assert!(matches!(
            engine.process_bar(bar(0, 100.0)).await.unwrap(),
            PassOutcome::Executed { .. }
        ));
        drain(&mut rx);

        let outcome = engine.process_bar(bar(1, 104.0)).await.unwrap();
        assert!(matches!(outcome, PassOutcome::NoTrade { .. }), "{:?}", outcome);
        assert!(h.executor.get_positions().await.unwrap().is_empty());
        assert!(engine.state().await.positions.is_empty());

        let mut closed = None;
        while let Ok(event) = rx.try_recv() {
            if let TradingEvent::Position {
                change: PositionChange::Closed,
                pnl,
                reason,
                ..
            } = event.as_ref()
            {
                closed = Some((*pnl, reason.clone()));
            }
        }
        let (pnl, reason) = closed.expect("position close was not broadcast");
        assert!(pnl.unwrap_or_default() > 0.0);
        assert_eq!(reason.as_deref(), Some("scripted exit"));

        let metrics = engine.metrics().await.unwrap();
        assert_eq!(metrics["exits_requested"], 1);

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_halted_gate_skips_pass() {
        let h = harness(1, ScriptedStrategy::long(3.0));
        let engine = &h.engine;
        engine.start().await.unwrap();

        h.risk.halt("manual stop").await;
        match engine.process_bar(bar(0, 100.0)).await.unwrap() {
            PassOutcome::Skipped(SkipReason::Halted(reason)) => assert!(reason.contains("manual stop")),
            other => panic!("expected halted skip, got {:?}", other),
        }
        assert!(h.executor.get_positions().await.unwrap().is_empty());
        assert!(engine.recent_signals(10).await.is_empty());
        assert!(engine.state().await.halted);

        h.risk.reset_halt().await;
        assert!(matches!(
            engine.process_bar(bar(1, 100.0)).await.unwrap(),
            PassOutcome::Executed { .. }
        ));

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_poor_reward_is_rejected_and_recorded() {
        let h = harness(1, ScriptedStrategy::long(0.5));
        let engine = &h.engine;
        engine.start().await.unwrap();

        match engine.process_bar(bar(0, 100.0)).await.unwrap() {
            PassOutcome::Rejected { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("Risk:reward")), "{:?}", reasons)
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        let signals = engine.recent_signals(10).await;
        assert_eq!(signals.len(), 1);
        assert!(!signals[0].approved);
        assert!(h.executor.get_positions().await.unwrap().is_empty());

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_signal_history_is_bounded() {
        let h = harness(1, ScriptedStrategy::long(0.5));
        let engine = &h.engine;
        engine.start().await.unwrap();

        for i in 0..60 {
            engine.process_bar(bar(i, 100.0 + i as f64)).await.unwrap();
        }
        let signals = engine.recent_signals(100).await;
        assert_eq!(signals.len(), 50);
        assert_eq!(signals[0].signal.price, 159.0);
        assert_eq!(signals[49].signal.price, 110.0);

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_paused_loop_suppresses_execution() {
        let h = harness(1, ScriptedStrategy::long(3.0));
        let engine = &h.engine;
        engine.start().await.unwrap();
        engine.pause().await.unwrap();

        assert_eq!(
            engine.process_bar(bar(0, 100.0)).await.unwrap(),
            PassOutcome::Suppressed
        );
        assert!(h.executor.get_positions().await.unwrap().is_empty());
        assert_eq!(engine.recent_signals(10).await.len(), 1);

        engine.resume().await.unwrap();
        assert!(matches!(
            engine.process_bar(bar(1, 100.0)).await.unwrap(),
            PassOutcome::Executed { .. }
        ));

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_indicator_failure_skips_without_side_effects() {
        let h = harness_with(1, ScriptedStrategy::long(3.0), Arc::new(BrokenIndicators), None);
        let engine = &h.engine;
        let mut rx = engine.subscribe("ui");
        engine.start().await.unwrap();

        match engine.process_bar(bar(0, 100.0)).await.unwrap() {
            PassOutcome::Skipped(SkipReason::CollaboratorFailure(message)) => {
                assert!(message.contains("backend offline"))
            }
            other => panic!("expected collaborator failure, got {:?}", other),
        }
        assert!(engine.state().await.regime.is_none());
        assert!(drain(&mut rx).contains(&"error"));

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_executor_skips_pass() {
        let config = LoopConfig {
            collaborator_timeout: Duration::from_millis(50),
            ..loop_config(1)
        };
        let (engine, executor) = stalling_loop(config, Vec::new());
        let mut rx = engine.subscribe("ui");
        engine.start().await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), engine.process_bar(bar(0, 100.0)))
            .await
            .expect("a hung executor must not hold the pass")
            .unwrap();
        match outcome {
            PassOutcome::Skipped(SkipReason::CollaboratorFailure(message)) => {
                assert!(message.contains("mark_price"), "{}", message)
            }
            other => panic!("expected collaborator failure, got {:?}", other),
        }
        assert!(engine.state().await.regime.is_none());
        assert!(drain(&mut rx).contains(&"error"));
        assert!(engine.refresh_risk().await.is_err());

        // the pipeline is free again once the executor answers
        executor.stalled.store(false, Ordering::SeqCst);
        assert!(matches!(
            engine.process_bar(bar(1, 100.0)).await.unwrap(),
            PassOutcome::Executed { .. }
        ));

        tokio::time::timeout(Duration::from_secs(2), engine.stop())
            .await
            .expect("stop should not wait on the executor")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_interrupts_in_flight_risk_refresh() {
        let config = LoopConfig {
            risk_refresh_interval: Duration::from_millis(20),
            collaborator_timeout: Duration::from_secs(3600),
            ..loop_config(1)
        };
        let (engine, executor) = stalling_loop(config, Vec::new());
        engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(executor.hung_calls.load(Ordering::SeqCst) >= 1);

        tokio::time::timeout(Duration::from_secs(2), engine.stop())
            .await
            .expect("stop should cancel the pending equity call")
            .unwrap();
        assert_eq!(engine.lifecycle().await, LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_interrupts_in_flight_pass() {
        let config = LoopConfig {
            poll_interval: Duration::from_millis(20),
            collaborator_timeout: Duration::from_secs(3600),
            ..loop_config(1)
        };
        let (engine, executor) = stalling_loop(config, vec![bar(0, 100.0), bar(1, 100.5)]);
        engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(executor.hung_calls.load(Ordering::SeqCst) >= 1);

        tokio::time::timeout(Duration::from_secs(2), engine.stop())
            .await
            .expect("stop should cancel the pass waiting on mark_price")
            .unwrap();
        assert_eq!(engine.lifecycle().await, LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_risk_refresh_tracks_account() {
        let h = harness(1, ScriptedStrategy::long(3.0));
        let engine = &h.engine;
        engine.start().await.unwrap();
        engine.process_bar(bar(0, 100.0)).await.unwrap();

        engine.refresh_risk().await.unwrap();
        let account = engine.state().await.account.expect("account refreshed");
        assert_eq!(account.open_positions, 1);
        assert!((account.equity - 10_000.0).abs() < 1e-6);

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_flushes_to_persistence() {
        let store = Arc::new(SqlPersistence::connect("sqlite::memory:").await.unwrap());
        store.init_tables().await.unwrap();
        let h = harness_with(
            1,
            ScriptedStrategy::long(3.0),
            Arc::new(FlatIndicators),
            Some(store.clone() as Arc<dyn Persistence>),
        );
        let engine = &h.engine;
        engine.start().await.unwrap();
        engine.process_bar(bar(0, 100.0)).await.unwrap();
        engine.stop().await.unwrap();

        let snapshot = store.latest_snapshot("ETHUSDT").await.unwrap().unwrap();
        assert_eq!(snapshot.lifecycle, LoopState::Stopped);
        assert_eq!(snapshot.positions.len(), 1);

        let metrics = store.load_state("metrics").await.unwrap().unwrap();
        let metrics: serde_json::Value = serde_json::from_str(&metrics).unwrap();
        assert_eq!(metrics["trades_executed"], 1);
    }
}

#[cfg(test)]
mod persistence_tests {
    use analysis_core::{Bar, Direction, OpenPosition, StrategyKind, Timeframe};
    use chrono::{TimeZone, Utc};

    use crate::*;

    async fn store() -> SqlPersistence {
        let store = SqlPersistence::connect("sqlite::memory:").await.unwrap();
        store.init_tables().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_bars_upsert_on_open_time() {
        let store = store().await;
        let open_time = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let mut bar = Bar {
            open_time,
            close_time: open_time + chrono::Duration::minutes(15),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
        };
        store.record_bar("ETHUSDT", Timeframe::Minute15, &bar).await.unwrap();
        bar.close = 100.7;
        store.record_bar("ETHUSDT", Timeframe::Minute15, &bar).await.unwrap();

        assert_eq!(store.bar_count("ETHUSDT").await.unwrap(), 1);
        assert_eq!(store.bar_count("BTCUSDT").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_trade_and_position_lifecycle() {
        let store = store().await;
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();

        store
            .record_trade(&TradeRecord {
                order_id: "ord-1".to_string(),
                symbol: "ETHUSDT".to_string(),
                direction: "long".to_string(),
                quantity: 1.25,
                price: 2000.0,
                stop_loss: Some(1960.0),
                take_profit: Some(2120.0),
                strategy: Some("trend_following".to_string()),
                executed_at: at,
            })
            .await
            .unwrap();
        let trades = store.trades("ETHUSDT").await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].executed_at, at);
        assert_eq!(trades[0].stop_loss, Some(1960.0));

        let position = OpenPosition {
            symbol: "ETHUSDT".to_string(),
            direction: Direction::Long,
            entry_price: 2000.0,
            quantity: 1.25,
            stop_loss: Some(1960.0),
            take_profit: Some(2120.0),
            opened_at: at,
            strategy: Some(StrategyKind::TrendFollowing),
        };
        store.record_position(&position).await.unwrap();
        assert_eq!(
            store.position_status("ETHUSDT").await.unwrap(),
            Some(("open".to_string(), None))
        );

        store
            .close_position("ETHUSDT", 2120.0, 150.0, "take profit", at)
            .await
            .unwrap();
        assert_eq!(
            store.position_status("ETHUSDT").await.unwrap(),
            Some(("closed".to_string(), Some(150.0)))
        );
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let store = store().await;
        assert_eq!(store.load_state("metrics").await.unwrap(), None);
        store.save_state("metrics", "{\"passes_run\":1}").await.unwrap();
        store.save_state("metrics", "{\"passes_run\":2}").await.unwrap();
        assert_eq!(
            store.load_state("metrics").await.unwrap().as_deref(),
            Some("{\"passes_run\":2}")
        );

        let state = TradingState::new("ETHUSDT".to_string(), Timeframe::Hour1);
        store.record_snapshot(&state).await.unwrap();
        let back = store.latest_snapshot("ETHUSDT").await.unwrap().unwrap();
        assert_eq!(back.timeframe, Timeframe::Hour1);
        assert_eq!(back.lifecycle, LoopState::Created);
    }
}
