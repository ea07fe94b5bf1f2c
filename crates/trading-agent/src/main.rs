use std::sync::Arc;

use analysis_core::IndicatorEngine;
use anyhow::{Context, Result};
use broker_trait::PaperExecutor;
use market_regime_detector::RegimeClassifier;
use risk_manager::RiskGate;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use strategy_engine::{RegimeWeights, SignalAggregator, StrategySet};
use technical_analysis::TechnicalIndicatorEngine;
use tokio::signal::unix::SignalKind;
use trading_agent::{
    AgentConfig, Broadcaster, DecisionLoop, Persistence, ReplayFeed, SqlPersistence, TradingEvent,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting trading decision engine");

    // 2. Configuration
    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Symbol: {} ({})", config.symbol, config.timeframe);
    tracing::info!("  Feed mode: {:?}", config.feed_mode);
    tracing::info!("  Combine policy: {}", config.combine_policy);
    tracing::info!(
        "  Risk per trade: {:.2}% ({:?})",
        config.risk_per_trade * 100.0,
        config.sizing_method
    );
    tracing::info!(
        "  Limits: drawdown {:.0}%, daily {:.0}%, weekly {:.0}%, {} positions",
        config.max_drawdown * 100.0,
        config.max_daily_loss * 100.0,
        config.max_weekly_loss * 100.0,
        config.max_open_positions
    );

    // 3. Collaborators
    let replay_file = config
        .replay_file
        .clone()
        .context("REPLAY_FILE must point at a JSON array of bars")?;
    let feed = ReplayFeed::from_json_file(&config.symbol, &replay_file, config.min_bars)?;
    tracing::info!("Replay feed ready: {} bars from {}", feed.len(), replay_file);

    let starting_equity = Decimal::from_f64(config.paper_equity)
        .context("PAPER_EQUITY is not representable")?;
    let (executor, execution_events) = PaperExecutor::new(starting_equity, 256);

    let mut risk = RiskGate::new(
        config.risk_parameters(),
        config.position_sizer(),
        config.paper_equity,
    );
    if let Some(schedule) = config.trading_hours.clone() {
        risk = risk.with_schedule(schedule);
    }

    let aggregator = SignalAggregator::new(
        StrategySet::with_defaults(),
        RegimeWeights::default(),
        config.aggregator_config(),
    );
    let broadcaster = Arc::new(Broadcaster::new(config.subscriber_queue_capacity));

    let indicators = TechnicalIndicatorEngine::default();
    let mut loop_config = config.loop_config();
    if loop_config.min_bars < indicators.warmup_bars() {
        tracing::warn!(
            "MIN_BARS {} is below the indicator warm-up of {}; using the warm-up",
            loop_config.min_bars,
            indicators.warmup_bars()
        );
        loop_config.min_bars = indicators.warmup_bars();
    }

    let mut builder = DecisionLoop::builder(loop_config)
        .feed(Arc::new(feed))
        .indicators(Arc::new(indicators))
        .classifier(RegimeClassifier::new().with_min_bars(config.min_bars))
        .aggregator(aggregator)
        .risk_gate(Arc::new(risk))
        .executor(Arc::new(executor))
        .execution_events(execution_events)
        .broadcaster(Arc::clone(&broadcaster));

    let mut stored_metrics = None;
    if let Some(url) = &config.database_url {
        let store = SqlPersistence::connect(url).await?;
        store.init_tables().await?;
        stored_metrics = store.load_state("metrics").await?;
        tracing::info!("Persistence enabled");
        builder = builder.persistence(Arc::new(store));
    }
    let engine = builder.build();

    // 4. Log what subscribers would see
    let mut events = engine.subscribe("log");
    let logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event.as_ref() {
                TradingEvent::Trade { symbol, direction, quantity, price, .. } => {
                    tracing::info!("[event] trade {} {} {:.6} @ {:.2}", symbol, direction, quantity, price);
                }
                TradingEvent::Risk(risk) => {
                    tracing::warn!("[event] risk {}: {}", risk.level, risk.message);
                }
                TradingEvent::Error { message, .. } => tracing::warn!("[event] error: {}", message),
                other => tracing::debug!("[event] {}", other.kind()),
            }
        }
    });

    engine.start().await?;
    if let Some(raw) = stored_metrics {
        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(json) => engine.restore_metrics(&json).await,
            Err(e) => tracing::warn!("Ignoring unreadable stored metrics: {}", e),
        }
    }

    // 5. Run until SIGINT or SIGTERM
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
    }

    tracing::info!("Shutdown signal received, exiting gracefully...");
    engine.stop().await?;
    if let Err(e) = logger.await {
        tracing::warn!("Event logger ended abnormally: {}", e);
    }
    Ok(())
}
