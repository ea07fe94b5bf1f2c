pub mod broadcaster;
pub mod config;
pub mod decision_loop;
pub mod error;
pub mod events;
pub mod feed;
pub mod metrics;
pub mod persistence;
pub mod state;

#[cfg(test)]
mod tests;

pub use broadcaster::{Broadcaster, EventReceiver};
pub use config::{AgentConfig, FeedMode};
pub use decision_loop::{DecisionLoop, DecisionLoopBuilder, LoopConfig, PassOutcome, SkipReason};
pub use error::AgentError;
pub use events::{PositionChange, SignalRecord, TradingEvent};
pub use feed::ReplayFeed;
pub use metrics::AgentMetrics;
pub use persistence::{Persistence, SqlPersistence, TradeRecord};
pub use state::{LoopState, TradingState};
